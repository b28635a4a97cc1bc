use std::path::{Path, PathBuf};

use super::types::AppConfig;

/// Get the default moegen data directory: ~/.moegen
pub fn get_moegen_home_dir() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".moegen"))
}

pub fn load_default() -> anyhow::Result<AppConfig> {
    // Priority 1: ~/.moegen/config.toml
    let home_config = get_moegen_home_dir()?.join("config.toml");

    // Priority 2: ./config.toml (current directory)
    let local_config = Path::new("config.toml");

    let mut cfg: AppConfig = if home_config.exists() {
        let s = std::fs::read_to_string(&home_config)?;
        toml::from_str::<AppConfig>(&s)?
    } else if local_config.exists() {
        let s = std::fs::read_to_string(local_config)?;
        toml::from_str::<AppConfig>(&s)?
    } else {
        AppConfig::default()
    };

    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// Environment variable overrides (highest priority after CLI flags).
pub fn apply_env_overrides<F>(cfg: &mut AppConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = non_empty("MOEGEN_HOST") {
        cfg.server.host = v.trim().to_string();
    }
    if let Some(port) = non_empty("MOEGEN_PORT")
        .or_else(|| non_empty("PORT"))
        .and_then(|v| v.trim().parse::<u16>().ok())
    {
        cfg.server.port = port;
    }
    if let Some(v) = non_empty("MOEGEN_DATA_DIR") {
        cfg.storage.data_dir = v.trim().to_string();
    }
    if let Some(v) = non_empty("MOEGEN_ACCESS_TOKENS") {
        let tokens = v
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        for token in tokens {
            if !cfg.auth.tokens.contains(&token) {
                cfg.auth.tokens.push(token);
            }
        }
    }
}
