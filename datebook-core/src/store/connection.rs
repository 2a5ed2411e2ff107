//! Connection management: one client per enabled source, created on demand
//! and torn down when the source is disabled, removed or trashed.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio_util::sync::CancellationToken;

use crate::backend::{Client, SourceChange};
use crate::error::{StoreError, StoreResult};
use crate::registry::RegistryEvent;
use crate::source::Source;
use crate::store::events::StoreEvent;
use crate::store::index::SourceIndex;
use crate::store::{Deferred, Inner};

pub(crate) enum Connection {
    /// A connect attempt is in flight
    Connecting { attempt: u64, cancel: CancellationToken },
    Connected {
        source: Source,
        client: Arc<dyn Client>,
    },
}

impl Inner {
    /// The live client for a source. A miss is a broken invariant on the
    /// caller's side and is logged as such.
    pub(crate) fn client_for(&self, source_uid: &str) -> StoreResult<(Source, Arc<dyn Client>)> {
        match self.connections.lock().get(source_uid) {
            Some(Connection::Connected { source, client }) => Ok((source.clone(), client.clone())),
            _ => {
                tracing::error!(source_uid, "No client for source");
                Err(StoreError::NoClient(source_uid.to_string()))
            }
        }
    }

    pub(crate) fn is_connected(&self, source_uid: &str) -> bool {
        matches!(
            self.connections.lock().get(source_uid),
            Some(Connection::Connected { .. })
        )
    }

    /// Sources with a live client, in no particular order.
    pub(crate) fn connected_sources(&self) -> Vec<Source> {
        self.connections
            .lock()
            .values()
            .filter_map(|c| match c {
                Connection::Connected { source, .. } => Some(source.clone()),
                Connection::Connecting { .. } => None,
            })
            .collect()
    }

    pub(crate) async fn connect_source(&self, source: Source) {
        let cancel = CancellationToken::new();
        let attempt = self.next_attempt.fetch_add(1, Ordering::SeqCst);
        {
            let mut connections = self.connections.lock();
            if connections.contains_key(&source.uid) {
                tracing::debug!(source = %source, "Already connected or connecting");
                return;
            }
            connections.insert(
                source.uid.clone(),
                Connection::Connecting {
                    attempt,
                    cancel: cancel.clone(),
                },
            );
        }

        tracing::info!(source = %source, "Connecting");
        self.emit(StoreEvent::SourceConnecting {
            source: source.clone(),
            cancel: cancel.clone(),
        });

        let result = self
            .registry
            .backend()
            .connect(&source, self.config.connect_timeout, cancel.clone())
            .await;

        let is_ours = |c: Option<&Connection>| {
            matches!(c, Some(Connection::Connecting { attempt: a, .. }) if *a == attempt)
        };

        match result {
            Ok(client) => {
                let registered = {
                    let mut connections = self.connections.lock();
                    if is_ours(connections.get(&source.uid)) && !cancel.is_cancelled() {
                        connections.insert(
                            source.uid.clone(),
                            Connection::Connected {
                                source: source.clone(),
                                client,
                            },
                        );
                        self.index
                            .lock()
                            .insert(source.uid.clone(), SourceIndex::new(source.clone()));
                        true
                    } else {
                        false
                    }
                };
                if !registered {
                    tracing::debug!(source = %source, "Dropping connection abandoned while pending");
                    return;
                }

                tracing::info!(source = %source, "Connected");
                self.defer(Deferred::SourceReady(source));
            }
            Err(error) => {
                {
                    let mut connections = self.connections.lock();
                    if is_ours(connections.get(&source.uid)) {
                        connections.remove(&source.uid);
                    }
                }
                self.report(error);
            }
        }
    }

    /// Tear down a source's client, views and index. A no-op when the
    /// source is not connected; a pending attempt is cancelled instead.
    pub(crate) fn disconnect_source(&self, source_uid: &str) {
        let removed = self.connections.lock().remove(source_uid);
        let source = match removed {
            None => return,
            Some(Connection::Connecting { cancel, .. }) => {
                tracing::debug!(source_uid, "Cancelling pending connect");
                cancel.cancel();
                return;
            }
            Some(Connection::Connected { source, .. }) => source,
        };

        self.stop_views(source_uid);
        let components = self
            .index
            .lock()
            .remove(source_uid)
            .map(|index| index.all())
            .unwrap_or_default();

        tracing::info!(source = %source, "Disconnected");
        if !components.is_empty() {
            self.emit(StoreEvent::ComponentsRemoved {
                source: source.clone(),
                components,
            });
        }
        self.emit(StoreEvent::SourceRemoved(source));
    }

    /// React to one registry notification, already classified.
    ///
    /// Notifications can trail direct calls such as a restore, so the
    /// registry's current state decides whether to connect or disconnect.
    pub(crate) async fn on_registry_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Added(source) | RegistryEvent::Enabled(source) => {
                match self.registry.source(&source.uid) {
                    Some(current) if current.enabled => self.connect_source(current).await,
                    _ => tracing::debug!(source = %source, "Enabled notification is stale"),
                }
            }
            RegistryEvent::Disabled(source) | RegistryEvent::Removed(source) => {
                match self.registry.source(&source.uid) {
                    Some(current) if current.enabled => {
                        tracing::debug!(source = %source, "Disabled notification is stale")
                    }
                    _ => self.disconnect_source(&source.uid),
                }
            }
            RegistryEvent::Updated(updated) => {
                if let Some(Connection::Connected { source, .. }) =
                    self.connections.lock().get_mut(&updated.uid)
                {
                    *source = updated.clone();
                }
                if let Some(index) = self.index.lock().get_mut(&updated.uid) {
                    index.source = updated;
                }
            }
        }
    }

    pub(crate) fn classify(&self, change: SourceChange) -> RegistryEvent {
        self.registry.classify(change)
    }
}
