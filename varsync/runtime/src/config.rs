use std::time::Duration;

use serde::Deserialize;

const DEFAULT_DEBOUNCE_MS: u64 = 10;
const DEFAULT_CLIENT_DEBOUNCE_MS: u64 = 5;
const DEFAULT_MAX_FRAME: usize = 1_048_576;
const DEFAULT_SESSION: &str = "S1";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub debounce_ms: u64,
    pub client_debounce_ms: u64,
    pub max_frame: usize,
    pub session: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            client_debounce_ms: DEFAULT_CLIENT_DEBOUNCE_MS,
            max_frame: DEFAULT_MAX_FRAME,
            session: DEFAULT_SESSION.to_string(),
        }
    }
}

impl SyncConfig {
    /// Reads `VARSYNC_*` variables. Zero or unparsable values fall back to
    /// the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            debounce_ms: positive(&lookup, "VARSYNC_DEBOUNCE_MS").unwrap_or(DEFAULT_DEBOUNCE_MS),
            client_debounce_ms: positive(&lookup, "VARSYNC_CLIENT_DEBOUNCE_MS")
                .unwrap_or(DEFAULT_CLIENT_DEBOUNCE_MS),
            max_frame: positive(&lookup, "VARSYNC_MAX_FRAME").unwrap_or(DEFAULT_MAX_FRAME),
            session: lookup("VARSYNC_SESSION")
                .filter(|label| !label.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_SESSION.to_string()),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn client_debounce(&self) -> Duration {
        Duration::from_millis(self.client_debounce_ms)
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr + Default + PartialEq,
{
    lookup(name)
        .and_then(|raw| raw.trim().parse::<T>().ok())
        .filter(|value| *value != T::default())
}
