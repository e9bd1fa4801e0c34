pub mod broker;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod models;
pub mod processor;
pub mod scanning;
pub mod storage;
