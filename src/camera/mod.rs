pub mod camera_entity;
pub mod simulated_camera;
