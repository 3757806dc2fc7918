pub mod client;
pub mod commands;
pub mod config;
pub mod env;
pub mod ipc;
pub mod server;
pub mod supervisor;
pub mod title;
pub mod worker;
