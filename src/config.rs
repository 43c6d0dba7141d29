use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RewindError;
use crate::state::display_name;

pub const DEFAULT_RETENTION_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_MAX_SNAPSHOTS_PER_APP: usize = 500;
pub const DEFAULT_CHECKPOINT_INTERVAL: usize = 30;
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Snapshots older than this are evicted on the next ingest.
    pub retention_secs: u64,
    pub max_snapshots_per_app: usize,
    /// Every Nth snapshot of an application is written to disk as a full state.
    pub checkpoint_interval: usize,
    pub storage_root: PathBuf,
    /// Capacity of the observation event channel.
    pub event_buffer: usize,
    pub rules: Rules,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retention_secs: DEFAULT_RETENTION_SECS,
            max_snapshots_per_app: DEFAULT_MAX_SNAPSHOTS_PER_APP,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            storage_root: data_dir().join("snapshots"),
            event_buffer: DEFAULT_EVENT_BUFFER,
            rules: Rules::default(),
        }
    }
}

impl Config {
    pub fn with_storage_root(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_root: root.into(),
            ..Self::default()
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| RewindError::Configuration(format!("read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&data)?;
        config.validate()?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            warn!("No configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self).map_err(|e| RewindError::Configuration(e.to_string()))
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.retention_secs == 0 {
            return Err(RewindError::Configuration("retention_secs must be at least 1".into()));
        }
        if self.checkpoint_interval == 0 {
            return Err(RewindError::Configuration("checkpoint_interval must be at least 1".into()));
        }
        if self.max_snapshots_per_app == 0 {
            return Err(RewindError::Configuration("max_snapshots_per_app must be at least 1".into()));
        }
        // Count eviction drops whole checkpoint groups; a cap below the
        // interval would empty the timeline on every overflow.
        if self.max_snapshots_per_app < self.checkpoint_interval {
            return Err(RewindError::Configuration(format!(
                "max_snapshots_per_app ({}) must not be below checkpoint_interval ({})",
                self.max_snapshots_per_app, self.checkpoint_interval
            )));
        }
        if self.event_buffer == 0 {
            return Err(RewindError::Configuration("event_buffer must be at least 1".into()));
        }
        for pattern in &self.rules.exclude_exe_names {
            Pattern::new(pattern).map_err(|e| {
                RewindError::Configuration(format!("invalid exe name pattern {:?}: {}", pattern, e))
            })?;
        }
        Ok(())
    }
}

/// Exclusion rules evaluated before every ingest. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Rules {
    /// Executable file names; glob patterns such as `keepass*.exe` are allowed.
    pub exclude_exe_names: Vec<String>,
    pub exclude_path_substrings: Vec<String>,
    pub exclude_window_classes: Vec<String>,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            exclude_exe_names: vec!["keepass.exe".to_string()],
            exclude_path_substrings: vec![r"\AppData\Local\Temp\".to_string()],
            exclude_window_classes: Vec::new(),
        }
    }
}

impl Rules {
    pub fn none() -> Self {
        Self {
            exclude_exe_names: Vec::new(),
            exclude_path_substrings: Vec::new(),
            exclude_window_classes: Vec::new(),
        }
    }

    pub fn allow(&self, executable_path: &str, window_class: &str) -> bool {
        let exe_lower = display_name(executable_path).to_lowercase();
        let path_lower = executable_path.to_lowercase();
        let class_lower = window_class.to_lowercase();

        let exe_excluded = self.exclude_exe_names.iter().any(|name| {
            let name = name.to_lowercase();
            match Pattern::new(&name) {
                Ok(pattern) => pattern.matches(&exe_lower),
                Err(_) => name == exe_lower,
            }
        });
        if exe_excluded {
            return false;
        }

        let path_excluded = self
            .exclude_path_substrings
            .iter()
            .filter(|s| !s.is_empty())
            .any(|s| path_lower.contains(&s.to_lowercase()));
        if path_excluded {
            return false;
        }

        !self
            .exclude_window_classes
            .iter()
            .filter(|c| !c.is_empty())
            .any(|c| c.to_lowercase() == class_lower)
    }
}

pub fn data_dir() -> PathBuf {
    if cfg!(target_os = "windows") {
        std::env::var("LOCALAPPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("rewinder")
    } else if cfg!(target_os = "macos") {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("Library/Application Support/rewinder")
    } else {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(".local/share/rewinder")
    }
}

pub fn default_config_path() -> PathBuf {
    data_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.retention(), Duration::from_secs(86_400));
        assert_eq!(config.max_snapshots_per_app, 500);
        assert_eq!(config.checkpoint_interval, 30);
        assert!(config.storage_root.ends_with("snapshots"));
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file_fills_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
retention_secs = 3600
checkpoint_interval = 10
storage_root = "/var/lib/rewinder"

[rules]
exclude_exe_names = ["secret*.exe"]
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.retention_secs, 3600);
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.max_snapshots_per_app, DEFAULT_MAX_SNAPSHOTS_PER_APP);
        assert_eq!(config.storage_root, PathBuf::from("/var/lib/rewinder"));
        assert_eq!(config.rules.exclude_exe_names, vec!["secret*.exe".to_string()]);
        assert!(config.rules.exclude_window_classes.is_empty());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let mut config = Config::default();
        config.checkpoint_interval = 0;
        assert!(matches!(config.validate(), Err(RewindError::Configuration(_))));

        let mut config = Config::default();
        config.max_snapshots_per_app = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&tmp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::with_storage_root("/tmp/rewinder-test");
        let text = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_rules() {
        let rules = Rules {
            exclude_exe_names: vec!["KeePass*.exe".into()],
            exclude_path_substrings: vec![r"\Temp\".into(), String::new()],
            exclude_window_classes: vec!["ConsoleWindowClass".into()],
        };
        assert!(!rules.allow(r"C:\Tools\keepassxc.exe", ""));
        assert!(!rules.allow(r"C:\Users\me\AppData\Local\temp\setup.exe", ""));
        assert!(!rules.allow(r"C:\Windows\cmd.exe", "consolewindowclass"));
        assert!(rules.allow(r"C:\Windows\notepad.exe", "Notepad"));
        assert!(Rules::none().allow("/usr/bin/keepass.exe", "any"));
    }
}
