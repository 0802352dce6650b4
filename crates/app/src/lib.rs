pub mod config;
pub mod consistency;
pub mod credentials;
pub mod editor;
pub mod error;
pub mod graphql;
pub mod notify;
pub mod orchestrator;
pub mod path_safety;
pub mod persistence;
pub mod prism_cli;
pub mod server;
pub mod state;
pub mod tunnel;
