pub mod config;
pub mod database;
pub mod llm_client;
pub mod presence;
pub mod runtime;
pub mod server;
pub mod services;
pub mod transport;
