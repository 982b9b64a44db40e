use directories::ProjectDirs;
use std::path::PathBuf;

/// Centralized application directory resolution
pub struct AppDirs;

impl AppDirs {
    /// State directory: `$HOME/.local/state/anzan`, else the platform data dir
    pub fn state_dir() -> Option<PathBuf> {
        if let Ok(home) = std::env::var("HOME") {
            Some(PathBuf::from(home).join(".local").join("state").join("anzan"))
        } else {
            ProjectDirs::from("", "", "anzan").map(|proj_dirs| proj_dirs.data_local_dir().to_path_buf())
        }
    }

    pub fn db_path() -> Option<PathBuf> {
        Self::state_dir().map(|dir| dir.join("stats.db"))
    }

    pub fn log_path() -> Option<PathBuf> {
        Self::state_dir().map(|dir| dir.join("anzan.log"))
    }

    pub fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "anzan").map(|proj_dirs| proj_dirs.config_dir().join("config.json"))
    }
}
