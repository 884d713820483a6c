pub mod display;
pub mod drone;
pub mod flight_state;
pub mod frame_pipeline;
pub mod frame_source;
pub mod landing_supervisor;
pub mod motion_controller;
pub mod pilot;
pub mod settings;
pub mod target_detector;
pub mod telemetry;
pub mod value_stats;
pub mod video_transport;
