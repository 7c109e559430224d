//! Processor configuration

use std::time::Duration;

use crate::error::KeriError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeveryConfig {
    /// Escrowed items older than this are expired by `evict_stale`
    pub escrow_max_age: Duration,
    /// Re-evaluations an escrowed item survives before it expires
    pub escrow_max_retries: u32,
    /// Capacity of the notice broadcast channel
    pub notice_capacity: usize,
    /// Default wait for witness quorum in workflows
    pub witness_timeout: Duration,
}

impl Default for KeveryConfig {
    fn default() -> Self {
        Self {
            escrow_max_age: Duration::from_secs(3600),
            escrow_max_retries: 256,
            notice_capacity: 1024,
            witness_timeout: Duration::from_secs(30),
        }
    }
}

impl KeveryConfig {
    /// Load configuration from environment variables
    ///
    /// - `KERI_ESCROW_MAX_AGE_SECS` (default 3600)
    /// - `KERI_ESCROW_MAX_RETRIES` (default 256)
    /// - `KERI_NOTICE_CAPACITY` (default 1024)
    /// - `KERI_WITNESS_TIMEOUT_SECS` (default 30)
    pub fn from_env() -> Result<Self, KeriError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, KeriError> {
        let defaults = Self::default();

        let parse = |name: &str, default: u64| -> Result<u64, KeriError> {
            match lookup(name) {
                Some(value) => value.trim().parse().map_err(|_| {
                    KeriError::ConfigurationError(format!(
                        "{} must be an integer, got '{}'",
                        name, value
                    ))
                }),
                None => Ok(default),
            }
        };

        let escrow_max_age = parse(
            "KERI_ESCROW_MAX_AGE_SECS",
            defaults.escrow_max_age.as_secs(),
        )?;
        let escrow_max_retries = parse(
            "KERI_ESCROW_MAX_RETRIES",
            u64::from(defaults.escrow_max_retries),
        )?;
        let notice_capacity = parse("KERI_NOTICE_CAPACITY", defaults.notice_capacity as u64)?;
        let witness_timeout = parse(
            "KERI_WITNESS_TIMEOUT_SECS",
            defaults.witness_timeout.as_secs(),
        )?;

        if notice_capacity == 0 {
            return Err(KeriError::ConfigurationError(
                "KERI_NOTICE_CAPACITY must be positive".to_string(),
            ));
        }

        Ok(Self {
            escrow_max_age: Duration::from_secs(escrow_max_age),
            escrow_max_retries: u32::try_from(escrow_max_retries).map_err(|_| {
                KeriError::ConfigurationError("KERI_ESCROW_MAX_RETRIES out of range".to_string())
            })?,
            notice_capacity: usize::try_from(notice_capacity).map_err(|_| {
                KeriError::ConfigurationError("KERI_NOTICE_CAPACITY out of range".to_string())
            })?,
            witness_timeout: Duration::from_secs(witness_timeout),
        })
    }
}
