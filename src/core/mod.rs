pub mod capture_source;
pub mod controller;
pub mod frame;
pub mod parameters;
pub mod run;
pub mod status;
