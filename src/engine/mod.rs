// Updraft Engine - Core module structure
pub mod api;
pub mod cli;
pub mod config;
pub mod database;
pub mod devices;
pub mod error;
pub mod hasher;
pub mod index;
pub mod locks;
pub mod metadata;
pub mod push;
pub mod refresh;
pub mod updater;

pub use config::{ClientConfig, ServerConfig};
pub use database::Database;
pub use refresh::Refresher;
