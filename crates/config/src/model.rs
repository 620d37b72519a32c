#![forbid(unsafe_code)]

use crate::error::Error;
use crate::poller::Poller;
use crate::sync_schedule::SyncSchedule;
use crate::unreachable::Unreachable;
use figment::Figment;
use figment::providers::{Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tuning knobs for the configuration cache, the scheduler queues and the
/// unreachable-host backoff. Everything has a usable default; a TOML file
/// only overrides what it mentions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub sync: SyncSchedule,

    pub poller: Poller,

    pub unreachable: Unreachable,
}

impl Config {
    /// Load configuration from a TOML file layered over the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()?;
        Ok(config)
    }

    /// Render the effective configuration as a TOML document.
    pub fn render(&self) -> Result<String, Error> {
        Ok(toml_edit::ser::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn defaults_match_original_daemon() {
        let config = Config::default();
        assert_eq!(config.unreachable.delay, Duration::from_secs(15));
        assert_eq!(config.unreachable.period, Duration::from_secs(45));
        assert_eq!(config.poller.max_snmp_items, 128);
        assert_eq!(config.poller.max_java_items, 32);
        assert_eq!(config.poller.max_pinger_items, 128);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[unreachable]\ndelay = 30").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.unreachable.delay, Duration::from_secs(30));
        // untouched section keeps its default
        assert_eq!(config.poller, Poller::default());
    }

    #[test]
    fn render_round_trips() {
        let config = Config::default();
        let rendered = config.render().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(rendered.as_bytes()).unwrap();

        assert_eq!(Config::load(file.path()).unwrap(), config);
    }
}
