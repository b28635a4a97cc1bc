pub mod provider;
pub mod services;
pub mod factory;
