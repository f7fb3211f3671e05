pub mod app_config;
pub mod camera;
pub mod camera_config;
pub mod cli;
pub mod common;
pub mod config_loader;
pub mod core;
pub mod errors;
pub mod operations;
pub mod storage;
pub mod workers;
