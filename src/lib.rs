//! logo-proxy: memory-aware logo and image acquisition service
//!
//! Fetches site logos and page images from unreliable third-party origins,
//! validates them, persists them to content-addressed blob storage and serves
//! CDN URLs, while keeping a single process's memory bounded under load.

pub mod config;
pub mod errors;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod utils;
pub mod web;

pub use config::Config;
pub use errors::{AppError, AppResult};
