// Controller configuration, read from the environment
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use devfleet_core::constants::DEFAULT_DEADLINE;
use devfleet_core::domain::LogLevel;
use devfleet_infra_logging::LineFormat;

use crate::builtin::PACKAGE_NAME;

const DEFAULT_LOG_FILE: &str = "~/.devfleet/log/devfleet.txt";

/// Everything the controller needs before it starts a batch
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub max_workers: Option<usize>,
    pub deadline: Duration,
    /// `None` when file logging is disabled (`DEVFLEET_LOG_FILE=off`)
    pub log_file: Option<PathBuf>,
    pub log_format: LineFormat,
    pub console_level: LogLevel,
    pub packages: Vec<String>,
    pub kill_stragglers: bool,
    /// Filter directive; RUST_LOG applies when unset
    pub log_filter: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            deadline: DEFAULT_DEADLINE,
            log_file: Some(PathBuf::from(shellexpand::tilde(DEFAULT_LOG_FILE).into_owned())),
            log_format: LineFormat::Message,
            console_level: LogLevel::Info,
            packages: vec![PACKAGE_NAME.to_string()],
            kill_stragglers: false,
            log_filter: None,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any variable source; unset variables keep their defaults
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("DEVFLEET_MAX_WORKERS") {
            let n: usize = parse("DEVFLEET_MAX_WORKERS", &v)?;
            config.max_workers = Some(n.max(1));
        }
        if let Some(v) = lookup("DEVFLEET_DEADLINE_SECS") {
            let secs = parse::<f64>("DEVFLEET_DEADLINE_SECS", &v)?.max(0.0);
            config.deadline = Duration::try_from_secs_f64(secs)
                .map_err(|e| anyhow::anyhow!("Invalid DEVFLEET_DEADLINE_SECS='{}': {}", v, e))?;
        }
        if let Some(v) = lookup("DEVFLEET_LOG_FILE") {
            config.log_file = match v.as_str() {
                "" | "off" | "none" => None,
                path => Some(PathBuf::from(shellexpand::tilde(path).into_owned())),
            };
        }
        if let Some(v) = lookup("DEVFLEET_LOG_FORMAT") {
            config.log_format = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = lookup("DEVFLEET_CONSOLE_LEVEL") {
            config.console_level = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = lookup("DEVFLEET_PACKAGES") {
            config.packages = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("DEVFLEET_KILL_STRAGGLERS") {
            config.kill_stragglers = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        config.log_filter = lookup("DEVFLEET_LOG");

        Ok(config)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}='{}': {}", key, value, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<DaemonConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.deadline, Duration::from_secs(600));
        assert_eq!(config.packages, vec!["builtin"]);
        assert!(!config.kill_stragglers);
        let log_file = config.log_file.unwrap();
        assert!(log_file.ends_with(".devfleet/log/devfleet.txt"));
        assert!(!log_file.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("DEVFLEET_MAX_WORKERS", "4"),
            ("DEVFLEET_DEADLINE_SECS", "2.5"),
            ("DEVFLEET_LOG_FILE", "off"),
            ("DEVFLEET_LOG_FORMAT", "detailed"),
            ("DEVFLEET_PACKAGES", "builtin, lab"),
            ("DEVFLEET_KILL_STRAGGLERS", "true"),
            ("DEVFLEET_LOG", "devfleet=debug"),
        ])
        .unwrap();

        assert_eq!(config.max_workers, Some(4));
        assert_eq!(config.deadline, Duration::from_millis(2500));
        assert_eq!(config.log_file, None);
        assert_eq!(config.log_format, LineFormat::Detailed);
        assert_eq!(config.packages, vec!["builtin", "lab"]);
        assert!(config.kill_stragglers);
        assert_eq!(config.log_filter.as_deref(), Some("devfleet=debug"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config(&[("DEVFLEET_MAX_WORKERS", "many")]).is_err());
        assert!(config(&[("DEVFLEET_LOG_FORMAT", "fancy")]).is_err());
    }

    #[test]
    fn test_deadline_out_of_range_is_an_error() {
        for value in ["inf", "1e30"] {
            let err = config(&[("DEVFLEET_DEADLINE_SECS", value)]).unwrap_err();
            assert!(err.to_string().contains("DEVFLEET_DEADLINE_SECS"), "{value}: {err}");
        }
        let config = config(&[("DEVFLEET_DEADLINE_SECS", "-5")]).unwrap();
        assert_eq!(config.deadline, Duration::ZERO);
    }
}
