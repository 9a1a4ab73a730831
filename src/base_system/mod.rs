pub mod config;
pub mod context;
pub mod course_id;
pub mod logging;
