pub mod api;
pub mod browser;
pub mod config;
pub mod db;
pub mod jobs;
pub mod runtime;
pub mod storage;
pub mod vendors;
