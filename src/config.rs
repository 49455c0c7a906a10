//! Configuration surface for the handful of knobs the kernel owns.
//!
//! Loading hierarchy mirrors `knhk-config::load_config` (env > file >
//! defaults), scoped down to what this crate actually needs: a store path,
//! the wake-detection threshold, and the bootstrap send channel capacity.
//! General configuration parsing is out of scope (§1); this is not a
//! framework, just the kernel's own settings.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Directory for the embedded `sled` database.
    pub store_path: PathBuf,
    /// Gap since `lastActiveTime` after which `detect_wake` reports true.
    #[serde(with = "duration_secs")]
    pub wake_threshold: Duration,
    /// Bounded channel capacity between `VatHandle::deliver` and the worker
    /// reply path; a config knob rather than a hardcoded constant because
    /// test doubles and real platform services want different values.
    pub delivery_channel_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            store_path: PathBuf::from("./kernel-store"),
            wake_threshold: Duration::from_secs(60 * 60),
            delivery_channel_capacity: 16,
        }
    }
}

impl KernelConfig {
    /// Loads from an optional TOML file, then applies `OCAP_KERNEL_*`
    /// environment overrides, following the file-then-env layering the
    /// teacher's config crate uses (env wins).
    pub fn load(path: Option<&std::path::Path>) -> KernelResult<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    KernelError::StoreCorruption(format!("failed to read config {path:?}: {e}"))
                })?;
                toml::from_str(&text).map_err(|e| {
                    KernelError::StoreCorruption(format!("failed to parse config {path:?}: {e}"))
                })?
            }
            _ => Self::default(),
        };

        if let Ok(raw) = std::env::var("OCAP_KERNEL_STORE_PATH") {
            config.store_path = PathBuf::from(raw);
        }
        if let Ok(raw) = std::env::var("OCAP_KERNEL_WAKE_THRESHOLD_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                KernelError::StoreCorruption(
                    "OCAP_KERNEL_WAKE_THRESHOLD_SECS must be an integer".into(),
                )
            })?;
            config.wake_threshold = Duration::from_secs(secs);
        }

        Ok(config)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = KernelConfig::default();
        assert_eq!(config.wake_threshold, Duration::from_secs(3600));
        assert!(config.delivery_channel_capacity > 0);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = KernelConfig::load(Some(std::path::Path::new("/nonexistent/path.toml")))
            .expect("missing config file falls back to defaults");
        assert_eq!(config.store_path, KernelConfig::default().store_path);
    }
}
