use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Config path
    #[clap(short, long, default_value = "config.toml")]
    pub config_path: String,
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

impl Cli {
    #[must_use]
    pub fn new() -> Self {
        Self::parse()
    }
}

fn default_data_dir() -> std::path::PathBuf {
    "/tmp/buildfarm".into()
}

fn default_store_dir() -> std::path::PathBuf {
    "/var/lib/buildfarm/store".into()
}

fn default_pg_socket_url() -> secrecy::SecretString {
    "postgres://buildfarm@%2Frun%2Fpostgresql:5432/buildfarm".into()
}

const fn default_max_db_connections() -> u32 {
    32
}

const fn default_queue_trigger_timer_in_s() -> i64 {
    600
}

const fn default_error_backoff_in_s() -> u64 {
    10
}

/// Main configuration of the application
#[derive(Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
struct AppConfig {
    #[serde(default = "default_data_dir")]
    data_dir: std::path::PathBuf,

    #[serde(default = "default_store_dir")]
    store_dir: std::path::PathBuf,

    #[serde(default = "default_pg_socket_url")]
    db_url: secrecy::SecretString,

    #[serde(default = "default_max_db_connections")]
    max_db_connections: u32,

    /// Platforms that count as local for preferLocalBuild purposes.
    #[serde(default)]
    local_platforms: Vec<String>,

    // setting this to -1 will disable the keepalive wakeup
    #[serde(default = "default_queue_trigger_timer_in_s")]
    queue_trigger_timer_in_s: i64,

    #[serde(default = "default_error_backoff_in_s")]
    error_backoff_in_s: u64,

    #[serde(default)]
    machines: Vec<crate::state::Machine>,
}

/// Prepared configuration of the application
#[derive(Debug)]
pub struct PreparedApp {
    lockfile: std::path::PathBuf,
    pub store_dir: std::path::PathBuf,
    pub db_url: secrecy::SecretString,
    max_db_connections: u32,
    local_platforms: Vec<String>,
    queue_trigger_timer: Option<tokio::time::Duration>,
    error_backoff: tokio::time::Duration,
    pub machines: Vec<crate::state::Machine>,
}

impl TryFrom<AppConfig> for PreparedApp {
    type Error = anyhow::Error;

    fn try_from(val: AppConfig) -> Result<Self, Self::Error> {
        let lockfile = val.data_dir.join("queue-monitor/lock");

        Ok(Self {
            lockfile,
            store_dir: val.store_dir,
            db_url: val.db_url,
            max_db_connections: val.max_db_connections,
            local_platforms: val.local_platforms,
            queue_trigger_timer: u64::try_from(val.queue_trigger_timer_in_s)
                .ok()
                .and_then(|v| {
                    if v == 0 {
                        None
                    } else {
                        Some(tokio::time::Duration::from_secs(v))
                    }
                }),
            error_backoff: tokio::time::Duration::from_secs(val.error_backoff_in_s),
            machines: val.machines,
        })
    }
}

/// Loads the config from specified path
#[tracing::instrument(err)]
fn load_config(filepath: &str) -> anyhow::Result<PreparedApp> {
    tracing::info!("Trying to load file: {filepath}");
    let toml: AppConfig = if let Ok(content) = fs_err::read_to_string(filepath) {
        toml::from_str(&content)
            .with_context(|| format!("Failed to toml load from '{filepath}'"))?
    } else {
        tracing::warn!("no config file found! Using default config");
        toml::from_str("").context("Failed to parse empty string as config")?
    };

    toml.try_into().context("Failed to prepare configuration")
}

#[derive(Clone)]
pub struct App {
    inner: Arc<arc_swap::ArcSwap<PreparedApp>>,
}

impl App {
    #[tracing::instrument(err)]
    pub fn init(filepath: &str) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(arc_swap::ArcSwap::from(Arc::new(load_config(filepath)?))),
        })
    }

    fn swap_inner(&self, new_val: PreparedApp) {
        self.inner.store(Arc::new(new_val));
    }

    #[must_use]
    pub fn get_lockfile(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.lockfile.clone()
    }

    #[must_use]
    pub fn get_store_dir(&self) -> std::path::PathBuf {
        let inner = self.inner.load();
        inner.store_dir.clone()
    }

    #[must_use]
    pub fn get_db_url(&self) -> secrecy::SecretString {
        let inner = self.inner.load();
        inner.db_url.clone()
    }

    #[must_use]
    pub fn get_max_db_connections(&self) -> u32 {
        let inner = self.inner.load();
        inner.max_db_connections
    }

    #[must_use]
    pub fn get_local_platforms(&self) -> Vec<String> {
        let inner = self.inner.load();
        inner.local_platforms.clone()
    }

    #[must_use]
    pub fn get_queue_trigger_timer(&self) -> Option<tokio::time::Duration> {
        let inner = self.inner.load();
        inner.queue_trigger_timer
    }

    #[must_use]
    pub fn get_error_backoff(&self) -> tokio::time::Duration {
        let inner = self.inner.load();
        inner.error_backoff
    }

    #[must_use]
    pub fn get_machines(&self) -> Vec<crate::state::Machine> {
        let inner = self.inner.load();
        inner.machines.clone()
    }
}

pub fn reload(current_config: &App, filepath: &str, state: &Arc<crate::state::State>) {
    let new_config = match load_config(filepath) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!("Failed to load new config: {e:#}");
            let _notify = sd_notify::notify(
                false,
                &[
                    sd_notify::NotifyState::Status("Reload failed"),
                    sd_notify::NotifyState::Errno(1),
                ],
            );
            return;
        }
    };

    if let Err(e) = state.reload_config_callback(&new_config) {
        tracing::error!("Config reload failed with {e:#}");
        let _notify = sd_notify::notify(
            false,
            &[
                sd_notify::NotifyState::Status("Configuration reload failed - Running"),
                sd_notify::NotifyState::Errno(1),
            ],
        );
        return;
    }

    current_config.swap_inner(new_config);
    let _notify = sd_notify::notify(
        false,
        &[
            sd_notify::NotifyState::Status("Configuration reloaded - Running"),
            sd_notify::NotifyState::Ready,
        ],
    );
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        let prepared: PreparedApp = config.try_into().unwrap();

        assert_eq!(
            prepared.lockfile,
            std::path::PathBuf::from("/tmp/buildfarm/queue-monitor/lock")
        );
        assert_eq!(prepared.max_db_connections, 32);
        assert_eq!(
            prepared.queue_trigger_timer,
            Some(tokio::time::Duration::from_secs(600))
        );
        assert_eq!(prepared.error_backoff, tokio::time::Duration::from_secs(10));
        assert!(prepared.machines.is_empty());
        assert!(prepared.local_platforms.is_empty());
    }

    #[test]
    fn test_keepalive_timer_can_be_disabled() {
        let config: AppConfig = toml::from_str("queueTriggerTimerInS = -1").unwrap();
        let prepared: PreparedApp = config.try_into().unwrap();
        assert_eq!(prepared.queue_trigger_timer, None);
    }

    #[test]
    fn test_machine_declarations() {
        let config: AppConfig = toml::from_str(
            r#"
            localPlatforms = ["x86_64-linux"]

            [[machines]]
            hostname = "builder-1"
            systems = ["x86_64-linux", "i686-linux"]
            supportedFeatures = ["kvm"]

            [[machines]]
            hostname = "builder-2"
            systems = ["aarch64-linux"]
            mandatoryFeatures = ["big-parallel"]
            "#,
        )
        .unwrap();
        let prepared: PreparedApp = config.try_into().unwrap();

        assert_eq!(prepared.machines.len(), 2);
        assert_eq!(prepared.machines[0].hostname, "builder-1");
        assert_eq!(prepared.machines[0].systems.len(), 2);
        assert_eq!(prepared.machines[0].supported_features, vec!["kvm"]);
        assert_eq!(prepared.machines[1].mandatory_features, vec!["big-parallel"]);
        assert_eq!(prepared.local_platforms, vec!["x86_64-linux"]);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        assert!(toml::from_str::<AppConfig>("notAKey = 1").is_err());
    }
}
