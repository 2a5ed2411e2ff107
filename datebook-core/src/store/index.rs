//! The per-source component index and the handlers that keep it in step
//! with live view changes.

use std::collections::HashMap;

use crate::backend::ViewChange;
use crate::component::{Component, ComponentId};
use crate::source::{Source, SourceKind};
use crate::store::Inner;
use crate::store::events::StoreEvent;

/// Components of one source keyed by UID. Each bucket stays ordered by
/// occurrence and holds at most one entry per recurrence-id.
#[derive(Debug, Clone)]
pub(crate) struct SourceIndex {
    pub(crate) source: Source,
    by_uid: HashMap<String, Vec<Component>>,
}

impl SourceIndex {
    pub(crate) fn new(source: Source) -> Self {
        SourceIndex {
            source,
            by_uid: HashMap::new(),
        }
    }

    /// Insert, replacing any entry with the same identity.
    pub(crate) fn insert(&mut self, component: Component) {
        let bucket = self.by_uid.entry(component.uid.clone()).or_default();
        bucket.retain(|c| c.recurrence_id != component.recurrence_id);
        let pos = bucket
            .binary_search_by(|c| c.cmp_occurrence(&component))
            .unwrap_or_else(|p| p);
        bucket.insert(pos, component);
    }

    pub(crate) fn get(&self, id: &ComponentId) -> Option<&Component> {
        self.by_uid
            .get(&id.uid)?
            .iter()
            .find(|c| c.recurrence_id == id.recurrence_id)
    }

    /// Drop what `id` names: one instance when it carries a recurrence-id,
    /// otherwise everything under the UID.
    pub(crate) fn remove(&mut self, id: &ComponentId) -> Vec<Component> {
        let Some(rid) = &id.recurrence_id else {
            return self.by_uid.remove(&id.uid).unwrap_or_default();
        };

        let Some(bucket) = self.by_uid.get_mut(&id.uid) else {
            return Vec::new();
        };
        let (removed, kept) = std::mem::take(bucket)
            .into_iter()
            .partition(|c| c.recurrence_id.as_ref() == Some(rid));
        *bucket = kept;
        if bucket.is_empty() {
            self.by_uid.remove(&id.uid);
        }
        removed
    }

    /// Swap the whole bucket for `uid`, returning the entries that are gone.
    pub(crate) fn replace_uid(&mut self, uid: &str, components: Vec<Component>) -> Vec<Component> {
        let old = self.by_uid.remove(uid).unwrap_or_default();
        for component in &components {
            self.insert(component.clone());
        }
        old.into_iter()
            .filter(|o| !components.iter().any(|c| c.recurrence_id == o.recurrence_id))
            .collect()
    }

    pub(crate) fn all(&self) -> Vec<Component> {
        let mut all: Vec<Component> = self.by_uid.values().flatten().cloned().collect();
        all.sort_by(|a, b| a.cmp_occurrence(b));
        all
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.by_uid.values().map(Vec::len).sum()
    }
}

fn push_unique(batch: &mut Vec<Component>, component: Component) {
    if !batch.contains(&component) {
        batch.push(component);
    }
}

impl Inner {
    pub(crate) async fn apply_change(&self, source: &Source, change: ViewChange) {
        match change {
            ViewChange::Added(components) => self.on_components_added(source, components).await,
            ViewChange::Modified(components) => {
                self.on_components_modified(source, components).await
            }
            ViewChange::Removed(ids) => self.on_components_removed(source, ids),
        }
    }

    /// Resolve what the view reported into the occurrences the index keeps:
    /// event series are expanded over the data range, tasks are fetched whole.
    async fn resolve(&self, source: &Source, components: &[Component]) -> Vec<Component> {
        let client = match self.client_for(&source.uid) {
            Ok((_, client)) => client,
            Err(_) => return Vec::new(),
        };
        let range = self.window.read().data_range;

        let mut batch = Vec::new();
        for component in components {
            let result = match source.kind {
                SourceKind::Calendar => {
                    let series = match component.recurrence_id {
                        Some(_) => client.get_all_for_uid(&component.uid).await.map(|all| {
                            all.into_iter()
                                .find(|c| c.recurrence_id.is_none())
                                .unwrap_or_else(|| component.clone())
                        }),
                        None => Ok(component.clone()),
                    };
                    match series {
                        Ok(series) => {
                            client
                                .expand_recurrence(
                                    &series,
                                    range.start_utc(),
                                    range.end_exclusive_utc(),
                                    &mut |instance: Component| {
                                        push_unique(&mut batch, instance);
                                        true
                                    },
                                )
                                .await
                        }
                        Err(e) => Err(e),
                    }
                }
                SourceKind::TaskList => client
                    .get_all_for_uid(&component.uid)
                    .await
                    .map(|all| all.into_iter().for_each(|c| push_unique(&mut batch, c))),
            };

            if let Err(e) = result {
                self.report(e);
            }
        }
        batch
    }

    async fn on_components_added(&self, source: &Source, components: Vec<Component>) {
        let batch = self.resolve(source, &components).await;
        if batch.is_empty() {
            return;
        }

        {
            let mut index = self.index.lock();
            let Some(entry) = index.get_mut(&source.uid) else {
                return;
            };
            for component in &batch {
                entry.insert(component.clone());
            }
        }

        for component in &batch {
            tracing::debug!(source = %source, uid = %component.uid, "Added '{}'", component.summary);
        }
        self.emit(StoreEvent::ComponentsAdded {
            source: source.clone(),
            components: batch,
        });
    }

    async fn on_components_modified(&self, source: &Source, components: Vec<Component>) {
        let batch = self.resolve(source, &components).await;

        let mut uids: Vec<&str> = components.iter().map(|c| c.uid.as_str()).collect();
        uids.sort_unstable();
        uids.dedup();

        let gone = {
            let mut index = self.index.lock();
            let Some(entry) = index.get_mut(&source.uid) else {
                return;
            };
            let mut gone = Vec::new();
            for uid in uids {
                let fresh = batch.iter().filter(|c| c.uid == uid).cloned().collect();
                gone.extend(entry.replace_uid(uid, fresh));
            }
            gone
        };

        for component in &batch {
            tracing::debug!(source = %source, uid = %component.uid, "Modified '{}'", component.summary);
        }
        if !gone.is_empty() {
            self.emit(StoreEvent::ComponentsRemoved {
                source: source.clone(),
                components: gone,
            });
        }
        if !batch.is_empty() {
            self.emit(StoreEvent::ComponentsModified {
                source: source.clone(),
                components: batch,
            });
        }
    }

    fn on_components_removed(&self, source: &Source, ids: Vec<ComponentId>) {
        let removed: Vec<Component> = {
            let mut index = self.index.lock();
            let Some(entry) = index.get_mut(&source.uid) else {
                return;
            };
            ids.iter().flat_map(|id| entry.remove(id)).collect()
        };
        if removed.is_empty() {
            return;
        }

        for component in &removed {
            tracing::debug!(source = %source, uid = %component.uid, "Removed '{}'", component.summary);
        }
        self.emit(StoreEvent::ComponentsRemoved {
            source: source.clone(),
            components: removed,
        });
    }
}
