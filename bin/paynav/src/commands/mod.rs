pub mod config_cmd;
pub mod run_cmd;
pub mod tools_cmd;

use paynav_core::{Config, Paths};
use std::path::{Path, PathBuf};

/// The config file in effect: `--config` if given, else `~/.paynav/config.json`.
pub fn config_path(paths: &Paths, override_path: Option<&Path>) -> PathBuf {
    override_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| paths.config_file())
}

pub fn load_config(paths: &Paths, override_path: Option<&Path>) -> anyhow::Result<Config> {
    match override_path {
        Some(path) => Config::load(path)
            .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", path.display(), e)),
        None => Ok(Config::load_or_default(paths)?),
    }
}
