pub mod actions;
pub mod bridge;
pub mod config;
pub mod error;
pub mod history;
pub mod inventory;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod packages;
pub mod safety;
pub mod shell;
pub mod state;
