pub mod cli;
pub mod config;
pub mod features;
pub mod logging;
pub mod server;
pub mod shared;
