pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod model;
pub mod provider;
pub mod scheduler;
pub mod service;
pub mod storage;
