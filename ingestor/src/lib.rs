pub mod config;
pub mod consumer;
pub mod db;
pub mod errors;
pub mod fanout;
pub mod memory;
pub mod metrics;
pub mod model;
pub mod mqtt;
pub mod rest;
pub mod store;
pub mod validate;
