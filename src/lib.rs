pub mod app;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod job;
pub mod logger;
pub mod plugin;
pub mod queue;
pub mod service;
pub mod signature;
pub mod transport;
pub mod watcher;
pub mod worker;
