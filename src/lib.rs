pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod state;
