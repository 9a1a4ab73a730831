pub mod cache;
pub mod dispatch;
pub mod downloader;
pub mod scheduler;
pub mod selection;
