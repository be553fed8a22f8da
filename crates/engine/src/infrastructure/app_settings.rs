//! Engine settings loaded from the environment
//!
//! Every field has a default, so an empty environment yields a working
//! in-memory engine. Unparseable values fall back to the default with a warning.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `TAVERNDB_DB_PATH` | unset (in-memory store) |
//! | `TAVERNDB_JOURNAL_LIMIT` | 200 |
//! | `TAVERNDB_LEDGER_LIMIT` | 300 |
//! | `TAVERNDB_QUEUE_MAX_CONCURRENT` | 1 |
//! | `TAVERNDB_RETRY_MAX_ATTEMPTS` | 3 |
//! | `TAVERNDB_RETRY_BASE_DELAY_MS` | 600 |
//! | `TAVERNDB_ENFORCE_LOG_PAIRING` | true |
//! | `TAVERNDB_CURRENCY_FLOOR` | unset (no floor) |

use std::path::PathBuf;
use std::str::FromStr;

use crate::infrastructure::retry::RetryPolicy;

pub const DEFAULT_JOURNAL_LIMIT: usize = 200;
pub const DEFAULT_LEDGER_LIMIT: usize = 300;

#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    /// SQLite file for session snapshots; `None` keeps everything in memory
    pub db_path: Option<PathBuf>,
    pub journal_limit: usize,
    pub ledger_limit: usize,
    pub queue_max_concurrent: usize,
    pub retry: RetryPolicy,
    /// Reject turns that write a log summary without its outline (or vice versa)
    pub enforce_log_pairing: bool,
    /// Lowest balance `character.currency` may reach through `apply_econ_delta`
    pub currency_floor: Option<i64>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            db_path: None,
            journal_limit: DEFAULT_JOURNAL_LIMIT,
            ledger_limit: DEFAULT_LEDGER_LIMIT,
            queue_max_concurrent: 1,
            retry: RetryPolicy::default(),
            enforce_log_pairing: true,
            currency_floor: None,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let read = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        Self {
            db_path: read("TAVERNDB_DB_PATH").map(PathBuf::from),
            journal_limit: parse_or("TAVERNDB_JOURNAL_LIMIT", read("TAVERNDB_JOURNAL_LIMIT"), defaults.journal_limit)
                .max(1),
            ledger_limit: parse_or("TAVERNDB_LEDGER_LIMIT", read("TAVERNDB_LEDGER_LIMIT"), defaults.ledger_limit)
                .max(1),
            queue_max_concurrent: parse_or(
                "TAVERNDB_QUEUE_MAX_CONCURRENT",
                read("TAVERNDB_QUEUE_MAX_CONCURRENT"),
                defaults.queue_max_concurrent,
            )
            .max(1),
            retry: RetryPolicy {
                max_attempts: parse_or(
                    "TAVERNDB_RETRY_MAX_ATTEMPTS",
                    read("TAVERNDB_RETRY_MAX_ATTEMPTS"),
                    defaults.retry.max_attempts,
                )
                .max(1),
                base_delay_ms: parse_or(
                    "TAVERNDB_RETRY_BASE_DELAY_MS",
                    read("TAVERNDB_RETRY_BASE_DELAY_MS"),
                    defaults.retry.base_delay_ms,
                ),
                backoff_factor: defaults.retry.backoff_factor,
            },
            enforce_log_pairing: read("TAVERNDB_ENFORCE_LOG_PAIRING")
                .map(|v| parse_flag("TAVERNDB_ENFORCE_LOG_PAIRING", &v, defaults.enforce_log_pairing))
                .unwrap_or(defaults.enforce_log_pairing),
            currency_floor: read("TAVERNDB_CURRENCY_FLOOR").and_then(|v| match v.parse() {
                Ok(floor) => Some(floor),
                Err(_) => {
                    tracing::warn!(value = %v, "Ignoring unparseable TAVERNDB_CURRENCY_FLOOR");
                    None
                }
            }),
        }
    }
}

fn parse_or<T: FromStr + Copy>(name: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(variable = name, value = %raw, "Unparseable setting, using default");
            default
        }),
    }
}

fn parse_flag(name: &str, raw: &str, default: bool) -> bool {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            tracing::warn!(variable = name, value = %raw, "Unparseable flag, using default");
            default
        }
    }
}
