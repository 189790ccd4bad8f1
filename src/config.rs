//! Runtime tunables for a lock manager node.

use std::path::Path;

use serde::Deserialize;

/// Default TCP port peers connect to.
pub const DEFAULT_TCP_PORT: u16 = 21064;
const DEFAULT_BUFFER_SIZE: usize = 4096;
const DEFAULT_RSBTBL_SIZE: usize = 256;
const DEFAULT_LKBTBL_SIZE: usize = 1024;
const DEFAULT_DIRTBL_SIZE: usize = 512;
const DEFAULT_RECOVER_TIMER_SECS: u64 = 5;
const DEFAULT_TOSS_SECS: u64 = 10;
const DEFAULT_SCAN_SECS: u64 = 5;
const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DEADLOCK_SECS: u64 = 10;

/// Node-wide configuration, loadable from a TOML file.
///
/// Every field has a default, so an empty file (or no file at all) yields a
/// working configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Port the TCP transport listens on.
    pub tcp_port: u16,
    /// Upper bound for a single wire message, recovery payloads included.
    pub buffer_size: usize,
    /// Bucket count of the resource table. Must be a power of two.
    pub rsbtbl_size: usize,
    /// Bucket count of the lock-id table. Must be a power of two.
    pub lkbtbl_size: usize,
    /// Bucket count of the resource directory. Must be a power of two.
    pub dirtbl_size: usize,
    /// Poll period while waiting on peers during recovery.
    pub recover_timer_secs: u64,
    /// How long an unused resource sits on the toss list before reclaim.
    pub toss_secs: u64,
    /// Period of the scanner that ages out tossed resources.
    pub scan_secs: u64,
    /// Age at which a parked remote operation fails with a timeout.
    /// Zero disables the timer.
    pub lock_timeout_secs: u64,
    /// Age at which a queued conversion is checked for conversion deadlock.
    /// Zero disables the timer.
    pub deadlock_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            rsbtbl_size: DEFAULT_RSBTBL_SIZE,
            lkbtbl_size: DEFAULT_LKBTBL_SIZE,
            dirtbl_size: DEFAULT_DIRTBL_SIZE,
            recover_timer_secs: DEFAULT_RECOVER_TIMER_SECS,
            toss_secs: DEFAULT_TOSS_SECS,
            scan_secs: DEFAULT_SCAN_SECS,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
            deadlock_secs: DEFAULT_DEADLOCK_SECS,
        }
    }
}

/// Configuration loading errors.
#[derive(Debug)]
pub enum Error {
    /// The file could not be read.
    Io(std::io::Error),
    /// The file is not valid TOML or holds unknown/invalid keys.
    Parse(toml::de::Error),
    /// A table size is zero or not a power of two.
    BadTableSize(&'static str),
}

impl Config {
    /// Reads a configuration file, filling unset keys with defaults.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path).map_err(Error::Io)?;
        let config: Config = toml::from_str(&text).map_err(Error::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if !self.rsbtbl_size.is_power_of_two() {
            return Err(Error::BadTableSize("rsbtbl_size"));
        }
        if !self.lkbtbl_size.is_power_of_two() || self.lkbtbl_size > u16::MAX as usize + 1 {
            return Err(Error::BadTableSize("lkbtbl_size"));
        }
        if !self.dirtbl_size.is_power_of_two() {
            return Err(Error::BadTableSize("dirtbl_size"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tcp_port, DEFAULT_TCP_PORT);
        assert_eq!(config.buffer_size, 4096);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str("lock_timeout_secs = 7\n").unwrap();
        assert_eq!(config.lock_timeout_secs, 7);
        assert_eq!(config.dirtbl_size, DEFAULT_DIRTBL_SIZE);
    }

    #[test]
    fn rejects_odd_table_size() {
        let config: Config = toml::from_str("rsbtbl_size = 100\n").unwrap();
        assert!(matches!(
            config.validate(),
            Err(Error::BadTableSize("rsbtbl_size"))
        ));
    }
}
