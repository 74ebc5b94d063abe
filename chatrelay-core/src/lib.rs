//! Shared domain types, configuration, logging and collaborator services
//! for the chatrelay connection hub.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};
