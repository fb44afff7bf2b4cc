use crate::{BallastConfig, StrategyKind, parse_server_addr};

/// Validation output for a loaded Ballast configuration.
#[derive(Debug, Default)]
pub struct ConfigReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl ConfigReport {
    /// Returns true when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true when at least one error was found.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the collected warning messages.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Returns the collected error messages.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Render warnings and errors into a readable, multi-line string.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            out.push_str("Errors:\n");
            for err in &self.errors {
                out.push_str("  - ");
                out.push_str(err);
                out.push('\n');
            }
        }
        if !self.warnings.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Warnings:\n");
            for warn in &self.warnings {
                out.push_str("  - ");
                out.push_str(warn);
                out.push('\n');
            }
        }
        out
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Validate a Ballast configuration and return a report of issues.
pub fn validate(cfg: &BallastConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    if cfg.listen_port == 0 {
        report.error("listen_port must be non-zero");
    }

    if cfg.max_workers == 0 {
        report.error("max_workers is 0; no client connection would ever be handled");
    }

    if StrategyKind::parse(&cfg.strategy).is_none() {
        report.warn(format!(
            "unknown strategy '{strategy}'; falling back to round_robin",
            strategy = cfg.strategy
        ));
    }

    if cfg.health_check_interval == 0 {
        report.warn("health_check_interval is 0; probes will run back to back");
    }

    if cfg.timeout == 0 {
        report.warn("timeout is 0; upstream connects will fail immediately");
    }

    let servers = cfg.servers.normalized();
    if servers.is_empty() {
        report.warn("no upstream servers configured; every request will be refused");
    }
    for (idx, addr) in servers.iter().enumerate() {
        if parse_server_addr(addr).is_none() {
            report.error(format!(
                "server entry at index {idx} ('{addr}') is not a host:port address"
            ));
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::validate;
    use crate::{BallastConfig, ServerList};

    #[test]
    fn flags_zero_port_as_error() {
        let cfg = BallastConfig {
            listen_port: 0,
            ..BallastConfig::default()
        };
        let report = validate(&cfg);
        assert!(report.has_errors());
    }

    #[test]
    fn flags_bad_server_entry_as_error() {
        let cfg = BallastConfig {
            servers: ServerList::Many(vec!["127.0.0.1".to_string()]),
            ..BallastConfig::default()
        };
        let report = validate(&cfg);
        assert!(report.has_errors());
    }

    #[test]
    fn warns_on_unknown_strategy() {
        let cfg = BallastConfig {
            strategy: "fastest".to_string(),
            ..BallastConfig::default()
        };
        let report = validate(&cfg);
        assert!(report.is_ok());
        assert_eq!(report.warnings().len(), 1);
    }

    #[test]
    fn warns_on_empty_server_list() {
        let cfg = BallastConfig {
            servers: ServerList::Many(Vec::new()),
            ..BallastConfig::default()
        };
        let report = validate(&cfg);
        assert!(report.is_ok());
        assert!(!report.warnings().is_empty());
    }
}
