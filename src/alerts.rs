// =============================================================================
// Admin Alerts — throttled notification sink
// =============================================================================
//
// Alerts are deduplicated per key with a minimum re-emit interval so a
// flapping feed cannot flood the notifications table. The sink is best
// effort: persistence failures are logged and swallowed.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AlertLevel {
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Default minimum interval between two alerts sharing a key.
const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(300);

pub struct AlertSink {
    store: Arc<Store>,
    last_emitted: Mutex<HashMap<String, Instant>>,
}

impl AlertSink {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            last_emitted: Mutex::new(HashMap::new()),
        }
    }

    /// Emit an alert with the default 5-minute throttle, keyed by message.
    pub fn emit(&self, message: &str, level: AlertLevel) {
        self.emit_keyed(message, level, message, DEFAULT_MIN_INTERVAL);
    }

    /// Emit an alert deduplicated on `key` with an explicit interval.
    /// Returns `true` if the alert was actually emitted.
    pub fn emit_keyed(
        &self,
        message: &str,
        level: AlertLevel,
        key: &str,
        min_interval: Duration,
    ) -> bool {
        {
            let mut last = self.last_emitted.lock();
            if let Some(prev) = last.get(key) {
                if prev.elapsed() < min_interval {
                    return false;
                }
            }
            last.insert(key.to_string(), Instant::now());
        }

        match level {
            AlertLevel::Error => tracing::error!(alert = %message, "admin alert"),
            AlertLevel::Warn => warn!(alert = %message, "admin alert"),
            AlertLevel::Info => tracing::info!(alert = %message, "admin alert"),
        }

        if let Err(e) = self.store.insert_notification(message, &level.to_string()) {
            warn!(error = %e, "failed to persist admin alert");
        }
        true
    }
}

impl std::fmt::Debug for AlertSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSink")
            .field("keys_tracked", &self.last_emitted.lock().len())
            .finish()
    }
}
