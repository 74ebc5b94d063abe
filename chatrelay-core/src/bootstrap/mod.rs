//! Process bootstrap helpers shared by the server binary

mod config;

pub use config::load_config;
