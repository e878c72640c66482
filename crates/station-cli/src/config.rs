//! Configuration resolution for diag-station
//!
//! Command-line flags and `DIAG_STATION_*` environment variables win over the
//! config file, which wins over the built-in station defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use station_uds::config::CanBackend;
use station_uds::StationConfig;

const APP_DIR: &str = "diag-station";

/// Backend names accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendArg {
    Auto,
    Socketcan,
    Pcan,
    Virtual,
}

impl From<BackendArg> for CanBackend {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Auto => CanBackend::Auto,
            BackendArg::Socketcan => CanBackend::SocketCan,
            BackendArg::Pcan => CanBackend::Pcan,
            BackendArg::Virtual => CanBackend::Virtual,
        }
    }
}

/// Values given as flags or environment variables
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub channel: Option<String>,
    pub bitrate: Option<u32>,
    pub backend: Option<BackendArg>,
}

impl Overrides {
    pub fn apply(&self, config: &mut StationConfig) {
        if let Some(channel) = &self.channel {
            config.can.channel = channel.clone();
            // A new channel without an explicit backend is inferred again
            if self.backend.is_none() {
                config.can.backend = CanBackend::Auto;
            }
        }
        if let Some(bitrate) = self.bitrate {
            config.can.bitrate = bitrate;
        }
        if let Some(backend) = self.backend {
            config.can.backend = backend.into();
        }
    }
}

/// Default config file location (`<config dir>/diag-station/config.toml`)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
}

/// Resolve the effective station configuration
///
/// An explicit path must exist. Without one, the default location is used
/// when present and the built-in defaults otherwise.
pub fn load(explicit: Option<&Path>, overrides: &Overrides) -> Result<(StationConfig, Option<PathBuf>)> {
    let source = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path().filter(|path| path.exists()),
    };

    let mut config = match &source {
        Some(path) => StationConfig::load(path)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?,
        None => StationConfig::default(),
    };

    overrides.apply(&mut config);
    config.validate().context("Invalid station configuration")?;
    Ok((config, source))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pretty_assertions::assert_eq;

    use super::*;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_flags_override_file() {
        let file = write_config(
            r#"
            [can]
            channel = "can1"
            bitrate = 250000
            "#,
        );
        let overrides = Overrides {
            channel: Some("virtual".to_string()),
            bitrate: Some(125_000),
            backend: None,
        };

        let (config, source) = load(Some(file.path()), &overrides).unwrap();
        assert_eq!(config.can.channel, "virtual");
        assert_eq!(config.can.bitrate, 125_000);
        assert_eq!(config.can.resolved_backend().unwrap(), CanBackend::Virtual);
        assert_eq!(source.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_file_values_survive_without_flags() {
        let file = write_config(
            r#"
            [can]
            channel = "vcan0"
            [retry]
            max_attempts = 2
            "#,
        );

        let (config, _) = load(Some(file.path()), &Overrides::default()).unwrap();
        assert_eq!(config.can.channel, "vcan0");
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.can.bitrate, 500_000);
    }

    #[test]
    fn test_explicit_backend_wins_over_inference() {
        let mut config = StationConfig::default();
        Overrides {
            channel: Some("can0".to_string()),
            bitrate: None,
            backend: Some(BackendArg::Virtual),
        }
        .apply(&mut config);

        assert_eq!(config.can.resolved_backend().unwrap(), CanBackend::Virtual);
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let file = write_config("");
        let overrides = Overrides {
            bitrate: Some(12_345),
            ..Default::default()
        };
        assert!(load(Some(file.path()), &overrides).is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(load(Some(&missing), &Overrides::default()).is_err());
    }
}
