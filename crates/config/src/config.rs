//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// A named encoder profile.
///
/// `cmd` is a command template; `%FFMPEG%`, `%INPUT%` and `%OUTPUT%` are
/// substituted at spawn time. `suffix` is the output extension (including the
/// leading dot); when absent the encoder writes nowhere the manager tracks.
/// `rate` multiplies the source duration to produce the per-job deadline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeProfile {
    /// Profile name, matched against the `mode` of an encode request
    pub name: String,
    /// Command template with placeholders
    pub cmd: String,
    /// Output file extension (e.g. ".mp4")
    #[serde(default)]
    pub suffix: Option<String>,
    /// Deadline multiplier (default 4.0 when absent)
    #[serde(default)]
    pub rate: Option<f64>,
}

/// Encoding-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodeSettings {
    /// Maximum number of concurrently running encoder processes.
    /// A value of zero disables encoding entirely.
    #[serde(default = "default_concurrent_encode_num")]
    pub concurrent_encode_num: u32,
    /// Path to the ffmpeg binary handed to encoder commands
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: PathBuf,
    /// Available encoder profiles
    #[serde(default)]
    pub profiles: Vec<EncodeProfile>,
}

fn default_concurrent_encode_num() -> u32 {
    1
}

fn default_ffmpeg() -> PathBuf {
    PathBuf::from("/usr/bin/ffmpeg")
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            concurrent_encode_num: default_concurrent_encode_num(),
            ffmpeg: default_ffmpeg(),
            profiles: Vec::new(),
        }
    }
}

impl EncodeSettings {
    /// Look up an encoder profile by name.
    pub fn profile(&self, name: &str) -> Option<&EncodeProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

/// A named recorded-storage root. Encode outputs land under these roots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParentDir {
    /// Name referenced by encode requests
    pub name: String,
    /// Absolute path of the storage root
    pub path: PathBuf,
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub encode: EncodeSettings,
    #[serde(default)]
    pub recorded: Vec<ParentDir>,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - RECODE_CONCURRENT_ENCODE_NUM -> encode.concurrent_encode_num
    /// - RECODE_FFMPEG_BIN -> encode.ffmpeg
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RECODE_CONCURRENT_ENCODE_NUM") {
            if let Ok(num) = val.parse::<u32>() {
                self.encode.concurrent_encode_num = num;
            }
        }

        if let Ok(val) = env::var("RECODE_FFMPEG_BIN") {
            if !val.is_empty() {
                self.encode.ffmpeg = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from a file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Look up a recorded-storage root by name.
    pub fn parent_dir(&self, name: &str) -> Option<&ParentDir> {
        self.recorded.iter().find(|d| d.name == name)
    }
}
