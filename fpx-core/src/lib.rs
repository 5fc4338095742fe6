pub mod access_log;
pub mod config;
pub mod observability;
