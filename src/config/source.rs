//! Configuration sources.
//!
//! A source owns the current raw configuration text for one identity and
//! notifies a single listener of every change. Notifications are delivered
//! in order through an unbounded channel, so the listener sees changes
//! serially.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use crate::config::parser::ConfigError;

/// A change notification carrying the previous and the new raw value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Supplies raw configuration text and change notifications.
pub trait ConfigSource: Send + Sync + 'static {
    /// Current raw configuration text, if any has been loaded.
    fn value(&self) -> Option<String>;

    /// Wait until the first value has been loaded.
    fn sync(&self) -> impl Future<Output = Result<(), ConfigError>> + Send;

    /// Register the change listener. A source has at most one listener;
    /// registering again replaces the previous one.
    fn monitor(&self) -> mpsc::UnboundedReceiver<ConfigChange>;
}

pub(crate) fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// In-process source whose value is pushed with [`MemoryConfigSource::publish`].
pub struct MemoryConfigSource {
    value: watch::Sender<Option<String>>,
    listener: Mutex<Option<mpsc::UnboundedSender<ConfigChange>>>,
    sync_timeout: Duration,
}

impl MemoryConfigSource {
    /// Create an empty source. `sync` waits up to 10 seconds for a value.
    pub fn new() -> Self {
        Self::with_sync_timeout(Duration::from_secs(10))
    }

    pub fn with_sync_timeout(sync_timeout: Duration) -> Self {
        let (value, _) = watch::channel(None);
        Self {
            value,
            listener: Mutex::new(None),
            sync_timeout,
        }
    }

    /// Create a source already holding `initial`.
    pub fn with_value(initial: impl Into<String>) -> Self {
        let source = Self::new();
        source.value.send_replace(Some(initial.into()));
        source
    }

    /// Replace the current value and notify the listener.
    pub fn publish(&self, new: impl Into<String>) {
        let new = new.into();
        // Held across replace and send so concurrent publishers notify in
        // the same order they replaced.
        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.value.send_replace(Some(new.clone()));

        if let Some(tx) = listener.as_ref() {
            let change = ConfigChange {
                old,
                new: Some(new),
            };
            if tx.send(change).is_err() {
                tracing::debug!("Config listener dropped, discarding further notifications");
                *listener = None;
            }
        }
    }
}

impl Default for MemoryConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for MemoryConfigSource {
    fn value(&self) -> Option<String> {
        self.value.borrow().clone()
    }

    async fn sync(&self) -> Result<(), ConfigError> {
        let mut rx = self.value.subscribe();
        let loaded = tokio::time::timeout(
            self.sync_timeout,
            rx.wait_for(|v| !is_blank(v.as_deref())),
        )
        .await
        .map(|r| r.is_ok())
        .unwrap_or(false);

        if loaded {
            Ok(())
        } else {
            Err(ConfigError::Unavailable(format!(
                "no value loaded within {:?}",
                self.sync_timeout
            )))
        }
    }

    fn monitor(&self) -> mpsc::UnboundedReceiver<ConfigChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        *listener = Some(tx);
        rx
    }
}
