pub mod config;
pub mod errors;
pub mod logging;
pub mod observers;
pub mod service;
pub mod storage;
