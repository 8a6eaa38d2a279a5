pub mod app_server;
pub mod cli;
pub mod client;
pub mod config;
pub mod daemon;
pub mod handshake;
pub mod log;
pub mod log_ring;
pub mod logging;
pub mod paths;
pub mod pid;
pub mod protocol;
pub mod registry;
pub mod supervisor;
pub mod sys;
pub mod uds;
pub mod usage;
pub mod worker;
