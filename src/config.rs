use arc_swap::ArcSwap;
use notify::{Config, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::fs;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::params::ParameterState;
use crate::timing::DEFAULT_PERIOD;

pub const DEFAULT_OUTBOUND_CAPACITY: usize = 8;
pub const DEFAULT_INBOUND_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Note-ons between two triggers.
    pub beat_period: u32,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
    /// Parameter values at startup, before the host sends any.
    pub parameters: ParameterState,
    pub transport: TransportConfig,
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`.
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            beat_period: DEFAULT_PERIOD.get(),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            inbound_capacity: DEFAULT_INBOUND_CAPACITY,
            parameters: ParameterState::default(),
            transport: TransportConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub peer_addr: String,
    pub listen_addr: String,
    pub poll_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            peer_addr: "127.0.0.1:8000".to_string(),
            listen_addr: "127.0.0.1:9000".to_string(),
            poll_interval_ms: 5,
            reconnect_initial_ms: 100,
            reconnect_max_ms: 5000,
        }
    }
}

impl TransportConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be at least 1".into()));
        }
        if self.reconnect_initial_ms > self.reconnect_max_ms {
            return Err(ConfigError::Invalid(format!(
                "reconnect_initial_ms ({}) exceeds reconnect_max_ms ({})",
                self.reconnect_initial_ms, self.reconnect_max_ms
            )));
        }
        Ok(())
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ron_string = fs::read_to_string(path)?;
        let config: BridgeConfig = ron::from_str(&ron_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let ron_string = ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?;
        fs::write(path, ron_string)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.beat_period == 0 {
            return Err(ConfigError::Invalid("beat_period must be at least 1".into()));
        }
        if self.outbound_capacity == 0 || self.inbound_capacity == 0 {
            return Err(ConfigError::Invalid("queue capacities must be at least 1".into()));
        }
        if self.parameters.intensity > crate::params::INTENSITY_MAX {
            return Err(ConfigError::Invalid(format!(
                "intensity {} is out of range",
                self.parameters.intensity
            )));
        }
        self.transport.validate()
    }

    pub fn beat_period(&self) -> NonZeroU32 {
        NonZeroU32::new(self.beat_period).unwrap_or(DEFAULT_PERIOD)
    }
}

/// Watches a config file and swaps its transport section into `target` on
/// every change, so the peer can be retargeted without a restart. Other
/// sections only apply at startup.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    pub fn spawn(
        path: PathBuf,
        target: Arc<ArcSwap<TransportConfig>>,
    ) -> Result<Self, notify::Error> {
        let watched = path.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    reload_transport(&watched, &target);
                }
                Ok(_) => {}
                Err(e) => warn!("config watch error: {}", e),
            },
            Config::default(),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        info!("watching {} for transport changes", path.display());
        Ok(Self { _watcher: watcher })
    }
}

/// Returns true when the transport section changed and was swapped in.
pub fn reload_transport(path: &Path, target: &ArcSwap<TransportConfig>) -> bool {
    match BridgeConfig::load(path) {
        Ok(config) => {
            if **target.load() == config.transport {
                return false;
            }
            info!(
                peer = %config.transport.peer_addr,
                listen = %config.transport.listen_addr,
                "transport config reloaded"
            );
            target.store(Arc::new(config.transport));
            true
        }
        Err(e) => {
            warn!("ignoring config change in {}: {}", path.display(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Mode;

    #[test]
    fn missing_fields_take_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.ron");
        fs::write(
            &path,
            concat!(
                "(beat_period: 8, parameters: (mode: Creative), ",
                "transport: (peer_addr: \"10.0.0.2:7000\"))",
            ),
        )
        .unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.beat_period, 8);
        assert_eq!(config.outbound_capacity, DEFAULT_OUTBOUND_CAPACITY);
        assert_eq!(config.parameters.mode, Mode::Creative);
        assert_eq!(config.parameters.intensity, 50);
        assert_eq!(config.transport.peer_addr, "10.0.0.2:7000");
        assert_eq!(config.transport.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.ron");
        let mut config = BridgeConfig::default();
        config.inbound_capacity = 4;
        config.transport.reconnect_max_ms = 250;
        config.save(&path).unwrap();
        assert_eq!(BridgeConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.ron");
        for body in [
            "(beat_period: 0)",
            "(outbound_capacity: 0)",
            "(parameters: (intensity: 101))",
            "(transport: (poll_interval_ms: 0))",
            "(transport: (reconnect_initial_ms: 10, reconnect_max_ms: 5))",
        ] {
            fs::write(&path, body).unwrap();
            assert!(
                matches!(BridgeConfig::load(&path), Err(ConfigError::Invalid(_))),
                "{body}"
            );
        }

        fs::write(&path, "(beat_period: \"sixteen\")").unwrap();
        assert!(matches!(
            BridgeConfig::load(&path),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn reload_swaps_only_changed_transport() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.ron");
        let target = ArcSwap::from_pointee(TransportConfig::default());

        BridgeConfig::default().save(&path).unwrap();
        assert!(!reload_transport(&path, &target));

        fs::write(&path, "(transport: (peer_addr: \"127.0.0.1:8100\"))").unwrap();
        assert!(reload_transport(&path, &target));
        assert_eq!(target.load().peer_addr, "127.0.0.1:8100");

        fs::write(&path, "(transport: (").unwrap();
        assert!(!reload_transport(&path, &target));
        assert_eq!(target.load().peer_addr, "127.0.0.1:8100");
    }
}
