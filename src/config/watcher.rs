//! File-backed configuration source with hot reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::parser::ConfigError;
use crate::config::source::{is_blank, ConfigChange, ConfigSource};

struct FileState {
    current: Mutex<Option<String>>,
    listener: Mutex<Option<mpsc::UnboundedSender<ConfigChange>>>,
}

impl FileState {
    /// Re-read the file and notify the listener if the content changed.
    fn refresh(&self, path: &Path) {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                tracing::error!(path = ?path, error = %e, "Failed to re-read config file. Keeping current value.");
                return;
            }
        };

        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if current.as_deref() == Some(content.as_str()) {
            return;
        }
        let old = current.replace(content.clone());
        drop(current);

        tracing::info!(path = ?path, "Config file change detected");
        let listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = listener.as_ref() {
            let _ = tx.send(ConfigChange {
                old,
                new: Some(content),
            });
        }
    }
}

/// A source that reads its value from a file and watches it for changes.
pub struct FileConfigSource {
    path: PathBuf,
    state: Arc<FileState>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl FileConfigSource {
    /// Load the file once. Call [`FileConfigSource::watch`] to follow changes.
    pub fn open(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let state = FileState {
            current: Mutex::new(Some(content)),
            listener: Mutex::new(None),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Arc::new(state),
            watcher: Mutex::new(None),
        })
    }

    /// Start watching the file in a background thread.
    pub fn watch(&self) -> Result<(), ConfigError> {
        let state = self.state.clone();
        let path = self.path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() {
                        state.refresh(&path);
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = ?self.path, "Config watcher started");

        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(watcher);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file now, as a watcher event would.
    pub fn reload(&self) {
        self.state.refresh(&self.path);
    }
}

impl ConfigSource for FileConfigSource {
    fn value(&self) -> Option<String> {
        self.state
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn sync(&self) -> Result<(), ConfigError> {
        // The file is read eagerly in `open`.
        if is_blank(self.value().as_deref()) {
            return Err(ConfigError::Unavailable(format!(
                "config file {} is empty",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn monitor(&self) -> mpsc::UnboundedReceiver<ConfigChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }
}
