pub mod auth;
pub mod broadcast;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod policy;
pub mod registry;
pub mod runner;
pub mod workspace;

pub use error::{Result, RunletError};
pub use gateway::Engine;
