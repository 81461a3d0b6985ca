pub mod app;
pub mod benchmark;
pub mod cli;
pub mod config;
pub mod controller;
pub mod generation;
pub mod input;
pub mod logging;
pub mod paths;
pub mod prompts;
pub mod status;
pub mod ui;

pub use app::LifaiApp;
pub use config::{Config, ConfigManager};
pub use status::StatusWriter;
