//! Source registry adapter.
//!
//! Wraps the backend's source directory and turns its raw notifications into
//! events the connection manager can act on directly. Enablement changes are
//! detected by comparing against the last snapshot seen for each source.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::backend::{Backend, SourceChange};
use crate::error::StoreResult;
use crate::source::{Source, SourceKind};

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(Source),
    /// The source went from disabled to enabled
    Enabled(Source),
    /// The source went from enabled to disabled
    Disabled(Source),
    /// Anything else changed (name, visibility)
    Updated(Source),
    Removed(Source),
}

pub struct SourceRegistry {
    backend: Arc<dyn Backend>,
    known: Mutex<HashMap<String, Source>>,
}

impl SourceRegistry {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let known = [SourceKind::Calendar, SourceKind::TaskList]
            .into_iter()
            .flat_map(|kind| backend.list_sources(kind))
            .map(|s| (s.uid.clone(), s))
            .collect();

        SourceRegistry {
            backend,
            known: Mutex::new(known),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn sources(&self, kind: SourceKind) -> Vec<Source> {
        self.backend.list_sources(kind)
    }

    pub fn source(&self, uid: &str) -> Option<Source> {
        self.backend.source(uid)
    }

    pub fn set_enabled(&self, uid: &str, enabled: bool) -> StoreResult<()> {
        self.backend.set_source_enabled(uid, enabled)
    }

    pub async fn remove(&self, uid: &str) -> StoreResult<()> {
        self.backend.remove_source(uid).await
    }

    /// Raw notifications; feed each one through [`SourceRegistry::classify`] in order.
    pub fn watch(&self) -> UnboundedReceiver<SourceChange> {
        self.backend.watch_sources()
    }

    /// Translate a raw notification, updating the snapshot it is compared against.
    pub fn classify(&self, change: SourceChange) -> RegistryEvent {
        let mut known = self.known.lock();

        match change {
            SourceChange::Added(source) => {
                known.insert(source.uid.clone(), source.clone());
                RegistryEvent::Added(source)
            }
            SourceChange::Removed(source) => {
                known.remove(&source.uid);
                RegistryEvent::Removed(source)
            }
            SourceChange::Changed(source) => {
                let was_enabled = known.get(&source.uid).map(|s| s.enabled);
                known.insert(source.uid.clone(), source.clone());

                match (was_enabled, source.enabled) {
                    (Some(true), true) => RegistryEvent::Updated(source),
                    (Some(false), false) => RegistryEvent::Updated(source),
                    (_, true) => RegistryEvent::Enabled(source),
                    (_, false) => RegistryEvent::Disabled(source),
                }
            }
        }
    }
}
