//! Optimistic writes.
//!
//! Listeners hear about a change before the backend confirms it. On success
//! they get the confirmed copy; on failure the optimistic notification is
//! undone and an error is reported. The index itself only follows what the
//! views echo back.

use chrono::Utc;

use crate::backend::Client;
use crate::component::{Component, ComponentTime, ModType};
use crate::recurrence;
use crate::source::Source;
use crate::store::Inner;
use crate::store::events::StoreEvent;

impl Inner {
    fn indexed_copy(&self, source: &Source, component: &Component) -> Option<Component> {
        self.index
            .lock()
            .get(&source.uid)
            .and_then(|index| index.get(&component.id()).cloned())
    }

    pub(crate) async fn add_component(&self, source: &Source, component: Component) {
        self.emit(StoreEvent::ComponentsAdded {
            source: source.clone(),
            components: vec![component.clone()],
        });

        let result = match self.client_for(&source.uid) {
            Ok((_, client)) => client.create(&component).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(created) => {
                tracing::debug!(source = %source, uid = %created.uid, "Created '{}'", created.summary);
                self.emit(StoreEvent::ComponentsRemoved {
                    source: source.clone(),
                    components: vec![component],
                });
                self.emit(StoreEvent::ComponentsAdded {
                    source: source.clone(),
                    components: vec![created],
                });
            }
            Err(error) => {
                self.emit(StoreEvent::ComponentsRemoved {
                    source: source.clone(),
                    components: vec![component],
                });
                self.report(error);
            }
        }
    }

    pub(crate) async fn modify_component(
        &self,
        source: &Source,
        component: Component,
        mod_type: ModType,
    ) {
        let mut pending = Some((component, mod_type));
        while let Some((component, mod_type)) = pending.take() {
            pending = self
                .modify_once(source, component, mod_type)
                .await
                .map(|next| (next, ModType::ThisAndFuture));
        }
    }

    /// Returns the follow-up occurrence to write, if the change completed a
    /// recurring task.
    async fn modify_once(
        &self,
        source: &Source,
        component: Component,
        mod_type: ModType,
    ) -> Option<Component> {
        let previous = self.indexed_copy(source, &component);
        self.emit(StoreEvent::ComponentsModified {
            source: source.clone(),
            components: vec![component.clone()],
        });

        let client = match self.client_for(&source.uid) {
            Ok((_, client)) => client,
            Err(error) => {
                self.undo_modify(source, previous);
                self.report(error);
                return None;
            }
        };

        match client.modify(&component, mod_type).await {
            Ok(confirmed) => {
                tracing::debug!(source = %source, uid = %confirmed.uid, ?mod_type, "Modified '{}'", confirmed.summary);
                self.emit(StoreEvent::ComponentsModified {
                    source: source.clone(),
                    components: vec![confirmed],
                });

                if source.is_task_list() && component.is_completed() && mod_type == ModType::ThisAndPrior {
                    return self.next_occurrence(source, &component, client.as_ref()).await;
                }
                None
            }
            Err(error) => {
                self.undo_modify(source, previous);
                self.report(error);
                None
            }
        }
    }

    fn undo_modify(&self, source: &Source, previous: Option<Component>) {
        if let Some(previous) = previous {
            self.emit(StoreEvent::ComponentsModified {
                source: source.clone(),
                components: vec![previous],
            });
        }
    }

    /// After a recurring task is completed for "this and prior", the first
    /// occurrence after the completed one, reset to not-yet-done.
    async fn next_occurrence(
        &self,
        source: &Source,
        completed: &Component,
        client: &dyn Client,
    ) -> Option<Component> {
        let series = if completed.is_recurring() {
            completed.clone()
        } else if completed.recurrence_id.is_some() {
            match client.get_all_for_uid(&completed.uid).await {
                Ok(all) => all
                    .into_iter()
                    .find(|c| c.recurrence_id.is_none() && c.is_recurring())?,
                Err(error) => {
                    self.report(error);
                    return None;
                }
            }
        } else {
            return None;
        };

        let (start, end) = recurrence::next_occurrence_window(&series, Utc::now());
        let done_at = completed.occurrence_time().map(ComponentTime::to_utc);

        let mut next = None;
        let expanded = client
            .expand_recurrence(&series, start, end, &mut |instance: Component| {
                let at = instance.occurrence_time().map(ComponentTime::to_utc);
                if done_at.is_some() && at <= done_at {
                    return true;
                }
                next = Some(instance);
                false
            })
            .await;
        if let Err(error) = expanded {
            self.report(error);
            return None;
        }

        let Some(next) = next else {
            tracing::debug!(source = %source, uid = %series.uid, "Series has no further occurrences");
            return None;
        };
        let next = recurrence::reset_occurrence(next, &series);
        tracing::info!(source = %source, uid = %next.uid, "Scheduling next occurrence of '{}'", next.summary);
        Some(next)
    }

    pub(crate) async fn remove_component(&self, source: &Source, component: Component, mod_type: ModType) {
        self.emit(StoreEvent::ComponentsRemoved {
            source: source.clone(),
            components: vec![component.clone()],
        });

        let result = match self.client_for(&source.uid) {
            Ok((_, client)) => {
                client
                    .remove(&component.uid, component.recurrence_id.as_ref(), mod_type)
                    .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::debug!(source = %source, uid = %component.uid, ?mod_type, "Removed '{}'", component.summary);
            }
            Err(error) => {
                self.emit(StoreEvent::ComponentsAdded {
                    source: source.clone(),
                    components: vec![component],
                });
                self.report(error);
            }
        }
    }
}
