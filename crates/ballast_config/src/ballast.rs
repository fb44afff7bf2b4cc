use std::time::Duration;

use serde::Deserialize;

use crate::ServerList;
use crate::validation::{ConfigReport, validate};

// =======================================================
// BALLAST CONFIG — main config
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BallastConfig {
    /// Accept port of the dispatcher.
    pub listen_port: u16,
    /// Selection policy name; unknown names fall back to round robin.
    pub strategy: String,
    /// Probe cadence in seconds.
    pub health_check_interval: u64,
    /// Consecutive probe failures before a server is withdrawn.
    pub max_failures: u32,
    /// Per-probe and per-upstream-connect timeout in seconds.
    pub timeout: u64,
    /// Bound on concurrently handled client connections.
    pub max_workers: u32,
    /// Initial upstream list, `host:port` entries.
    pub servers: ServerList,
}

impl Default for BallastConfig {
    fn default() -> Self {
        Self {
            listen_port: 8080,
            strategy: "round_robin".to_string(),
            health_check_interval: 5,
            max_failures: 3,
            timeout: 3,
            max_workers: 100,
            servers: ServerList::default(),
        }
    }
}

impl BallastConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Validate the configuration and return a report of warnings and errors.
    pub fn validate(&self) -> ConfigReport {
        validate(self)
    }

    pub fn from_file(file_name: &str) -> Result<Self, config::ConfigError> {
        let built = config::Config::builder()
            .add_source(config::File::new(file_name, config::FileFormat::Ini).required(false))
            .build()?;

        built.try_deserialize()
    }

    pub fn from_file_or_default(file_name: &str) -> Self {
        match Self::from_file(file_name) {
            Ok(cfg) => {
                let report = cfg.validate();
                if report.has_errors() {
                    eprintln!("Invalid config in '{file_name}':");
                    eprintln!("{}", report.format());
                    eprintln!("Using default config (in-memory)...");
                    BallastConfig::default()
                } else {
                    if !report.warnings().is_empty() {
                        eprintln!("Config warnings in '{file_name}':");
                        eprintln!("{}", report.format());
                    }
                    cfg
                }
            }
            Err(e) => {
                eprintln!("Error reading config '{file_name}': {e}");
                eprintln!("Using default config (in-memory)...");
                BallastConfig::default()
            }
        }
    }

    pub fn print(&self) {
        println!("=============== BALLAST CONFIG ===============");
        println!("  listen_port           = {}", self.listen_port);
        println!("  strategy              = {}", self.strategy);
        println!("  health_check_interval = {}s", self.health_check_interval);
        println!("  max_failures          = {}", self.max_failures);
        println!("  timeout               = {}s", self.timeout);
        println!("  max_workers           = {}", self.max_workers);
        println!("  servers               = {:?}", self.servers.normalized());
        println!("==============================================");
    }
}
