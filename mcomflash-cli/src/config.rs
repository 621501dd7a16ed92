//! Configuration file support for mcom03-flash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (MCOMFLASH_*)
//! 3. Local config file (./mcomflash.toml)
//! 4. Global config file (~/.config/mcomflash/config.toml)

use {
    crate::{CliError, size::parse_size},
    directories::ProjectDirs,
    log::{debug, warn},
    serde::{Deserialize, Serialize},
    std::{
        fs,
        path::{Path, PathBuf},
    },
};

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "mcomflash.toml";

/// File name of the flasher looked up when none is configured.
pub const DEFAULT_FLASHER_FILE: &str = "spi-flasher-mips-ram.hex";

/// Size given either as a plain integer or as a string such as `"64K"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeSetting {
    /// Byte count.
    Bytes(u64),
    /// Text accepted by the `--flash-*` options.
    Text(String),
}

impl SizeSetting {
    /// Byte count of this setting.
    pub fn bytes(&self) -> Result<u64, String> {
        match self {
            Self::Bytes(n) => Ok(*n),
            Self::Text(s) => parse_size(s),
        }
    }
}

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate of the BootROM monitor.
    pub baud: Option<u32>,
}

/// Flasher image configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlasherConfig {
    /// Path to the Intel HEX flasher image.
    pub image: Option<PathBuf>,
}

/// Flash geometry overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Total flash size.
    pub size: Option<SizeSetting>,
    /// Erase sector size.
    pub sector: Option<SizeSetting>,
    /// Page size.
    pub page: Option<SizeSetting>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flasher settings.
    #[serde(default)]
    pub flasher: FlasherConfig,
    /// Flash geometry overrides.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from the global and local files.
    ///
    /// Missing files are skipped; unreadable or invalid ones are reported and
    /// skipped.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Ok(Some(global)) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global);
            }
        }

        if let Ok(Some(local)) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local);
        }

        config
    }

    /// Load configuration from a file given with `--config`.
    ///
    /// Unlike the implicit files, an explicit file must exist and parse.
    pub fn load_from_path(path: &Path) -> Result<Self, CliError> {
        match Self::load_from_file(path) {
            Ok(Some(config)) => {
                debug!("Loaded config from {}", path.display());
                Ok(config)
            },
            Ok(None) => Err(CliError::Config(format!(
                "config file {} does not exist",
                path.display()
            ))),
            Err(message) => Err(CliError::Config(message)),
        }
    }

    /// Load configuration from a specific file; `Ok(None)` if it does not exist.
    fn load_from_file(path: &Path) -> Result<Option<Self>, String> {
        if !path.exists() {
            return Ok(None);
        }

        let result = match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .map_err(|e| format!("Failed to parse config file {}: {e}", path.display())),
            Err(e) => Err(format!("Failed to read config file {}: {e}", path.display())),
        };
        match result {
            Ok(config) => Ok(Some(config)),
            Err(message) => {
                warn!("{message}");
                Err(message)
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "mcomflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Places searched for the flasher image when none is configured.
    pub fn default_flasher_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(dir) = Self::global_config_dir() {
            candidates.push(dir.join(DEFAULT_FLASHER_FILE));
        }
        if let Some(dir) = std::env::current_exe()
            .ok()
            .and_then(|exe| {
                exe.parent()
                    .map(Path::to_path_buf)
            })
        {
            candidates.push(dir.join(DEFAULT_FLASHER_FILE));
        }
        candidates
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        overlay(&mut self.connection.port, other.connection.port);
        overlay(&mut self.connection.baud, other.connection.baud);
        overlay(&mut self.flasher.image, other.flasher.image);
        overlay(&mut self.flash.size, other.flash.size);
        overlay(&mut self.flash.sector, other.flash.sector);
        overlay(&mut self.flash.page, other.flash.page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.port.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.flasher.image.is_none());
        assert!(config.flash.size.is_none());
        assert!(config.flash.sector.is_none());
        assert!(config.flash.page.is_none());
    }

    #[test]
    fn test_size_setting() {
        assert_eq!(SizeSetting::Bytes(4096).bytes(), Ok(4096));
        assert_eq!(SizeSetting::Text("64K".to_string()).bytes(), Ok(65536));
        assert!(SizeSetting::Text("lots".to_string()).bytes().is_err());
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".to_string());
        base.connection.baud = Some(115200);

        let mut other = Config::default();
        other.connection.port = Some("/dev/ttyUSB3".to_string());
        other.flasher.image = Some(PathBuf::from("/opt/flasher.hex"));
        other.flash.page = Some(SizeSetting::Bytes(256));

        base.merge(other);

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyUSB3"));
        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.flasher.image, Some(PathBuf::from("/opt/flasher.hex")));
        assert_eq!(base.flash.page, Some(SizeSetting::Bytes(256)));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.port = Some("/dev/ttyUSB0".to_string());
        base.flash.size = Some(SizeSetting::Text("16M".to_string()));

        base.merge(Config::default());

        assert_eq!(base.connection.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.flash.size, Some(SizeSetting::Text("16M".to_string())));
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
port = "/dev/ttyUSB1"
baud = 115200

[flasher]
image = "/srv/spi-flasher-mips-ram.hex"

[flash]
size = "16M"
sector = 65536
page = "256"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.connection.baud, Some(115200));
        assert_eq!(
            config.flasher.image,
            Some(PathBuf::from("/srv/spi-flasher-mips-ram.hex"))
        );
        assert_eq!(config.flash.size.unwrap().bytes(), Ok(16 * 1024 * 1024));
        assert_eq!(config.flash.sector.unwrap().bytes(), Ok(65536));
        assert_eq!(config.flash.page.unwrap().bytes(), Ok(256));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.port.is_none());
        assert!(config.flasher.image.is_none());
    }

    // ---- load_from_path ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[connection]\nport = \"COM4\"\n").unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.connection.port.as_deref(), Some("COM4"));
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let err = Config::load_from_path(Path::new("/nonexistent/path/config.toml")).unwrap_err();
        assert!(matches!(err, CliError::Config(_)));
    }

    #[test]
    fn test_load_from_path_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(matches!(err, CliError::Config(ref m) if m.contains("parse")));
    }

    // ---- global paths ----

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            let p = p.to_string_lossy();
            assert!(p.contains("mcomflash"));
            assert!(p.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_default_flasher_candidates() {
        for candidate in Config::default_flasher_candidates() {
            assert!(candidate.ends_with(DEFAULT_FLASHER_FILE));
        }
    }
}
