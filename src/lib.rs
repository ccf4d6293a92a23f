pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod plugin;
pub mod settings;
pub mod state;
pub mod store;
pub mod web;
