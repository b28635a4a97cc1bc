pub mod load;
pub mod types;

pub use load::{apply_env_overrides, get_moegen_home_dir, load_default};
pub use types::{
    AppConfig, AuthConfig, LoggingConfig, ProviderConfig, SchedulerConfig, ServerConfig,
    StorageConfig,
};
