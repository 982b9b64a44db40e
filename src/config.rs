use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::app_dirs::AppDirs;
use crate::error::ConfigError;
use crate::session::{
    ExerciseKind, SessionConfig, DEFAULT_CARD_COUNT, DEFAULT_DIGIT_LENGTH, DEFAULT_DISPLAY_SPEED,
    DEFAULT_TIME_PER_QUESTION,
};
use crate::speech::SpeechOptions;

pub const DEFAULT_STUDENT: &str = "local";
pub const DEFAULT_EXERCISE_TYPE: &str = "addition";

/// Settings persisted between runs. Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Remote API base url; the local backend is used when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub student: String,
    pub exercise_type: String,
    pub card_count: usize,
    pub digit_length: u8,
    pub display_speed: f64,
    pub time_per_question: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    pub speak: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: None,
            token: None,
            student: DEFAULT_STUDENT.to_string(),
            exercise_type: DEFAULT_EXERCISE_TYPE.to_string(),
            card_count: DEFAULT_CARD_COUNT,
            digit_length: DEFAULT_DIGIT_LENGTH,
            display_speed: DEFAULT_DISPLAY_SPEED,
            time_per_question: DEFAULT_TIME_PER_QUESTION,
            min: None,
            max: None,
            speak: false,
            voice: None,
        }
    }
}

impl Config {
    pub fn session_config(&self) -> SessionConfig {
        let name = match ExerciseKind::from_type_id(&self.exercise_type) {
            ExerciseKind::Addition => "Addition",
            ExerciseKind::Mixed => "Plus/Minus",
        };
        SessionConfig {
            card_count: self.card_count,
            digit_length: self.digit_length,
            display_speed: self.display_speed,
            time_per_question: self.time_per_question,
            min: self.min,
            max: self.max,
            ..SessionConfig::new(self.exercise_type.clone(), name)
        }
    }

    /// `None` when speech is off
    pub fn speech_options(&self) -> Option<SpeechOptions> {
        self.speak.then(|| SpeechOptions {
            voice: self.voice.clone(),
            ..SpeechOptions::default()
        })
    }
}

pub trait ConfigStore {
    fn load(&self) -> Config;
    fn save(&self, cfg: &Config) -> Result<(), ConfigError>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = AppDirs::config_path().unwrap_or_else(|| PathBuf::from("anzan_config.json"));
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<Config, ConfigError> {
        let bytes = fs::read(&self.path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Config {
        match self.read() {
            Ok(cfg) => cfg,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(e) => {
                tracing::warn!("ignoring config at {}: {}", self.path.display(), e);
                Config::default()
            }
        }
    }

    fn save(&self, cfg: &Config) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn roundtrip_default_config() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::with_path(dir.path().join("config.json"));
        let cfg = Config::default();
        store.save(&cfg).unwrap();
        assert_eq!(store.load(), cfg);
    }

    #[test]
    fn save_and_load_custom_config() {
        let dir = tempdir().unwrap();
        let store = FileConfigStore::with_path(dir.path().join("nested").join("config.json"));
        let cfg = Config {
            api_url: Some("https://anzan.example/api".into()),
            student: "s-42".into(),
            exercise_type: "mixed".into(),
            card_count: 8,
            digit_length: 2,
            display_speed: 0.6,
            min: Some(10),
            max: Some(50),
            speak: true,
            ..Config::default()
        };
        store.save(&cfg).unwrap();
        assert_eq!(store.load(), cfg);
    }

    #[test]
    fn missing_or_corrupt_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = FileConfigStore::with_path(&path);
        assert_eq!(store.load(), Config::default());

        fs::write(&path, b"{not json").unwrap();
        assert_eq!(store.load(), Config::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, br#"{"card_count": 3, "speak": true}"#).unwrap();
        let cfg = FileConfigStore::with_path(&path).load();
        assert_eq!(cfg.card_count, 3);
        assert!(cfg.speak);
        assert_eq!(cfg.student, DEFAULT_STUDENT);
        assert_eq!(cfg.time_per_question, DEFAULT_TIME_PER_QUESTION);
    }

    #[test]
    fn builds_session_config() {
        let cfg = Config {
            exercise_type: "plus-minus".into(),
            card_count: 4,
            ..Config::default()
        };
        let session = cfg.session_config();
        assert_eq!(session.kind(), ExerciseKind::Mixed);
        assert_eq!(session.exercise_type_name, "Plus/Minus");
        assert_eq!(session.card_count, 4);
        assert!(session.validate().is_ok());
        assert!(cfg.speech_options().is_none());
    }
}
