pub mod app;
pub mod cache;
pub mod config;
pub mod db;
pub mod events;
pub mod exif;
pub mod indexing;
pub mod logging;
pub mod scanner;
pub mod work;
