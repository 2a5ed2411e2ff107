//! In-process backend.
//!
//! Keeps sources and their components in memory, echoes every write to the
//! live views whose query it affects, and can be told to fail connects or
//! writes. Used by the CLI for fixture files and throughout the tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, Client, SourceChange, View, ViewChange, ViewStream};
use crate::component::{Component, ComponentId, ComponentTime, ModType, Recurrence};
use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::recurrence;
use crate::source::{Source, SourceKind};

struct SourceEntry {
    source: Source,
    components: Vec<Component>,
    readonly: bool,
    fail_connect: Option<String>,
    fail_next_write: Option<String>,
}

impl SourceEntry {
    fn new(source: Source, components: Vec<Component>) -> Self {
        SourceEntry {
            source,
            components,
            readonly: false,
            fail_connect: None,
            fail_next_write: None,
        }
    }
}

struct ViewSlot {
    id: u64,
    source_uid: String,
    query: Query,
    started: bool,
    tx: UnboundedSender<ViewChange>,
}

// Lock order: `views` may be held while taking `sources`, never the reverse.
#[derive(Default)]
struct Shared {
    sources: Mutex<BTreeMap<String, SourceEntry>>,
    views: Mutex<Vec<ViewSlot>>,
    watchers: Mutex<Vec<UnboundedSender<SourceChange>>>,
    connect_delay: Mutex<Option<Duration>>,
    view_delay: Mutex<Option<Duration>>,
    connect_attempts: AtomicUsize,
    next_view_id: AtomicU64,
}

/// Whether any occurrence of `component` satisfies `query`.
fn matches(query: &Query, component: &Component) -> bool {
    if !component.is_recurring() {
        return query.matches(component);
    }
    let mut found = false;
    let expanded = recurrence::expand(component, query.start, query.end, &mut |instance: Component| {
        found = query.matches(&instance);
        !found
    });
    expanded.is_ok() && found
}

impl Shared {
    fn notify_sources(&self, change: SourceChange) {
        self.watchers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Tell started views of `source_uid` that a component went from `before` to `after`.
    fn publish(&self, source_uid: &str, before: Option<&Component>, after: Option<&Component>) {
        let views = self.views.lock();
        for slot in views.iter().filter(|s| s.started && s.source_uid == source_uid) {
            let was = before.is_some_and(|c| matches(&slot.query, c));
            let is = after.is_some_and(|c| matches(&slot.query, c));

            let change = match (was, is, before, after) {
                (false, true, _, Some(after)) => ViewChange::Added(vec![after.clone()]),
                (true, true, _, Some(after)) => ViewChange::Modified(vec![after.clone()]),
                (true, false, Some(before), _) => ViewChange::Removed(vec![before.id()]),
                _ => continue,
            };
            let _ = slot.tx.send(change);
        }
    }

    fn publish_removed(&self, source_uid: &str, id: ComponentId) {
        let views = self.views.lock();
        for slot in views.iter().filter(|s| s.started && s.source_uid == source_uid) {
            let _ = slot.tx.send(ViewChange::Removed(vec![id.clone()]));
        }
    }

    /// Run `f` on a writable source entry, consuming a queued write failure.
    fn write<T>(
        &self,
        source_uid: &str,
        to_error: fn(String) -> StoreError,
        f: impl FnOnce(&mut SourceEntry) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut sources = self.sources.lock();
        let entry = sources
            .get_mut(source_uid)
            .ok_or_else(|| StoreError::SourceNotFound(source_uid.to_string()))?;

        if let Some(reason) = entry.fail_next_write.take() {
            return Err(to_error(reason));
        }
        if entry.readonly {
            return Err(to_error(format!("'{}' is read-only", entry.source)));
        }
        f(entry)
    }
}

/// Sources and components kept in process memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

#[derive(Deserialize)]
struct Fixture {
    sources: Vec<FixtureSource>,
}

#[derive(Deserialize)]
struct FixtureSource {
    #[serde(flatten)]
    source: Source,
    #[serde(default)]
    components: Vec<Component>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load sources and components from a JSON fixture:
    /// `{"sources": [{"uid": .., "display_name": .., "kind": "calendar", "components": [..]}]}`
    pub fn from_fixture_json(json: &str) -> StoreResult<Self> {
        let fixture: Fixture = serde_json::from_str(json)
            .map_err(|e| StoreError::Config(format!("Invalid fixture: {e}")))?;

        let backend = MemoryBackend::new();
        {
            let mut sources = backend.shared.sources.lock();
            for entry in fixture.sources {
                sources.insert(
                    entry.source.uid.clone(),
                    SourceEntry::new(entry.source, entry.components),
                );
            }
        }
        Ok(backend)
    }

    /// Register a source and announce it.
    pub fn add_source(&self, source: Source, components: Vec<Component>) {
        self.shared
            .sources
            .lock()
            .insert(source.uid.clone(), SourceEntry::new(source.clone(), components));
        self.shared.notify_sources(SourceChange::Added(source));
    }

    /// Replace a source's registry data and announce the change.
    pub fn update_source(&self, source: Source) -> StoreResult<()> {
        {
            let mut sources = self.shared.sources.lock();
            let entry = sources
                .get_mut(&source.uid)
                .ok_or_else(|| StoreError::SourceNotFound(source.uid.clone()))?;
            entry.source = source.clone();
        }
        self.shared.notify_sources(SourceChange::Changed(source));
        Ok(())
    }

    /// Add a component as if another client had written it.
    pub fn insert_component(&self, source_uid: &str, component: Component) -> StoreResult<()> {
        {
            let mut sources = self.shared.sources.lock();
            let entry = sources
                .get_mut(source_uid)
                .ok_or_else(|| StoreError::SourceNotFound(source_uid.to_string()))?;
            entry.components.push(component.clone());
        }
        self.shared.publish(source_uid, None, Some(&component));
        Ok(())
    }

    pub fn components(&self, source_uid: &str) -> Vec<Component> {
        self.shared
            .sources
            .lock()
            .get(source_uid)
            .map(|e| e.components.clone())
            .unwrap_or_default()
    }

    pub fn set_readonly(&self, source_uid: &str, readonly: bool) {
        if let Some(entry) = self.shared.sources.lock().get_mut(source_uid) {
            entry.readonly = readonly;
        }
    }

    /// Make every connect to `source_uid` fail with `reason` (None to clear).
    pub fn fail_connect(&self, source_uid: &str, reason: Option<&str>) {
        if let Some(entry) = self.shared.sources.lock().get_mut(source_uid) {
            entry.fail_connect = reason.map(String::from);
        }
    }

    /// Make the next create/modify/remove on `source_uid` fail with `reason`.
    pub fn fail_next_write(&self, source_uid: &str, reason: &str) {
        if let Some(entry) = self.shared.sources.lock().get_mut(source_uid) {
            entry.fail_next_write = Some(reason.to_string());
        }
    }

    /// Delay every connect, e.g. to model a credential prompt.
    pub fn set_connect_delay(&self, delay: Option<Duration>) {
        *self.shared.connect_delay.lock() = delay;
    }

    /// Delay every view creation, e.g. to model a slow server query.
    pub fn set_view_delay(&self, delay: Option<Duration>) {
        *self.shared.view_delay.lock() = delay;
    }

    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of started views on a source.
    pub fn active_views(&self, source_uid: &str) -> usize {
        self.shared
            .views
            .lock()
            .iter()
            .filter(|s| s.started && s.source_uid == source_uid)
            .count()
    }

    fn open_client(&self, source: &Source) -> StoreResult<Arc<dyn Client>> {
        let sources = self.shared.sources.lock();
        let entry = sources.get(&source.uid).ok_or_else(|| StoreError::Connection {
            source_name: source.display_name.clone(),
            reason: "source no longer exists".to_string(),
        })?;

        if let Some(reason) = &entry.fail_connect {
            return Err(StoreError::Connection {
                source_name: source.display_name.clone(),
                reason: reason.clone(),
            });
        }

        Ok(Arc::new(MemoryClient {
            source_uid: source.uid.clone(),
            readonly: entry.readonly,
            shared: self.shared.clone(),
        }))
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn list_sources(&self, kind: SourceKind) -> Vec<Source> {
        self.shared
            .sources
            .lock()
            .values()
            .filter(|e| e.source.kind == kind)
            .map(|e| e.source.clone())
            .collect()
    }

    fn source(&self, uid: &str) -> Option<Source> {
        self.shared.sources.lock().get(uid).map(|e| e.source.clone())
    }

    fn set_source_enabled(&self, uid: &str, enabled: bool) -> StoreResult<()> {
        let mut source = self
            .source(uid)
            .ok_or_else(|| StoreError::SourceNotFound(uid.to_string()))?;
        if source.enabled == enabled {
            return Ok(());
        }
        source.enabled = enabled;
        self.update_source(source)
    }

    async fn remove_source(&self, uid: &str) -> StoreResult<()> {
        let entry = self
            .shared
            .sources
            .lock()
            .remove(uid)
            .ok_or_else(|| StoreError::SourceNotFound(uid.to_string()))?;
        self.shared.views.lock().retain(|s| s.source_uid != uid);
        self.shared.notify_sources(SourceChange::Removed(entry.source));
        Ok(())
    }

    fn watch_sources(&self) -> UnboundedReceiver<SourceChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.watchers.lock().push(tx);
        rx
    }

    async fn connect(
        &self,
        source: &Source,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> StoreResult<Arc<dyn Client>> {
        self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.shared.connect_delay.lock();

        let attempt = async {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.open_client(source)
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(StoreError::Cancelled(source.display_name.clone())),
            result = tokio::time::timeout(timeout, attempt) => match result {
                Ok(client) => client,
                Err(_) => Err(StoreError::Timeout(source.display_name.clone(), timeout.as_secs())),
            },
        }
    }
}

struct MemoryClient {
    source_uid: String,
    readonly: bool,
    shared: Arc<Shared>,
}

/// Cut a recurrence so the series ends just before `rid`.
fn truncate_before(recurrence: &Recurrence, rid: &ComponentTime) -> Recurrence {
    let until = (rid.to_utc() - chrono::Duration::seconds(1)).format("%Y%m%dT%H%M%SZ");
    let mut parts: Vec<String> = recurrence
        .rrule
        .split(';')
        .filter(|p| !p.starts_with("COUNT=") && !p.starts_with("UNTIL="))
        .map(String::from)
        .collect();
    parts.push(format!("UNTIL={until}"));

    Recurrence {
        rrule: parts.join(";"),
        exdates: recurrence.exdates.clone(),
    }
}

#[async_trait]
impl Client for MemoryClient {
    fn source_uid(&self) -> &str {
        &self.source_uid
    }

    fn is_readonly(&self) -> bool {
        self.readonly
    }

    async fn create(&self, component: &Component) -> StoreResult<Component> {
        let created = self.shared.write(&self.source_uid, StoreError::Create, |entry| {
            let mut created = component.clone();
            if created.uid.is_empty() {
                created.uid = uuid::Uuid::new_v4().to_string();
            }
            let id = created.id();
            if entry.components.iter().any(|c| c.id() == id) {
                return Err(StoreError::Create(format!("'{id}' already exists")));
            }
            entry.components.push(created.clone());
            Ok(created)
        })?;

        self.shared.publish(&self.source_uid, None, Some(&created));
        Ok(created)
    }

    async fn modify(&self, component: &Component, mod_type: ModType) -> StoreResult<Component> {
        let (before, after) = self.shared.write(&self.source_uid, StoreError::Modify, |entry| {
            let id = component.id();

            if let Some(existing) = entry.components.iter_mut().find(|c| c.id() == id) {
                let before = std::mem::replace(existing, component.clone());
                return Ok((before, component.clone()));
            }

            let pos = entry
                .components
                .iter()
                .position(|c| c.uid == component.uid && c.recurrence_id.is_none())
                .ok_or_else(|| StoreError::Modify(format!("'{id}' not found")))?;
            let before = entry.components[pos].clone();

            let after = match mod_type {
                // Detached instance
                ModType::This | ModType::ThisAndPrior => {
                    let detached = component.clone();
                    entry.components.push(detached.clone());
                    return Ok((before, detached));
                }
                // The series restarts at this occurrence
                ModType::ThisAndFuture => Component {
                    recurrence_id: None,
                    recurrence: before.recurrence.clone(),
                    ..component.clone()
                },
                ModType::All => Component {
                    recurrence_id: None,
                    start: before.start.clone(),
                    end: before.end.clone(),
                    due: before.due.clone(),
                    recurrence: before.recurrence.clone(),
                    ..component.clone()
                },
            };
            entry.components[pos] = after.clone();
            Ok((before, after))
        })?;

        self.shared
            .publish(&self.source_uid, Some(&before), Some(&after));
        Ok(after)
    }

    async fn remove(
        &self,
        uid: &str,
        recurrence_id: Option<&ComponentTime>,
        mod_type: ModType,
    ) -> StoreResult<()> {
        let rid = match (recurrence_id, mod_type) {
            (None, _) | (_, ModType::All) => None,
            (Some(rid), _) => Some(rid.clone()),
        };

        let truncated = self.shared.write(&self.source_uid, StoreError::Remove, |entry| {
            let Some(rid) = &rid else {
                let count = entry.components.len();
                entry.components.retain(|c| c.uid != uid);
                if entry.components.len() == count {
                    return Err(StoreError::Remove(format!("'{uid}' not found")));
                }
                return Ok(None);
            };

            let count = entry.components.len();
            entry.components.retain(|c| {
                c.uid != uid
                    || match &c.recurrence_id {
                        Some(r) if mod_type == ModType::ThisAndFuture => r < rid,
                        Some(r) => r != rid,
                        None => true,
                    }
            });
            let removed_detached = entry.components.len() != count;

            let master_pos = entry
                .components
                .iter()
                .position(|c| c.uid == uid && c.recurrence_id.is_none() && c.is_recurring());
            let Some(pos) = master_pos else {
                return if removed_detached {
                    Ok(None)
                } else {
                    Err(StoreError::Remove(format!("'{uid}' not found")))
                };
            };

            let before = entry.components[pos].clone();
            let mut after = before.clone();
            if let Some(recurrence) = after.recurrence.as_mut() {
                if mod_type == ModType::ThisAndFuture {
                    *recurrence = truncate_before(recurrence, rid);
                } else {
                    recurrence.exdates.push(rid.clone());
                }
            }
            entry.components[pos] = after.clone();
            Ok(Some((before, after)))
        })?;

        if let Some((before, after)) = truncated {
            self.shared
                .publish(&self.source_uid, Some(&before), Some(&after));
        }
        self.shared
            .publish_removed(&self.source_uid, ComponentId::new(uid, rid));
        Ok(())
    }

    async fn get_all_for_uid(&self, uid: &str) -> StoreResult<Vec<Component>> {
        let sources = self.shared.sources.lock();
        let entry = sources
            .get(&self.source_uid)
            .ok_or_else(|| StoreError::SourceNotFound(self.source_uid.clone()))?;
        Ok(entry
            .components
            .iter()
            .filter(|c| c.uid == uid)
            .cloned()
            .collect())
    }

    async fn expand_recurrence(
        &self,
        component: &Component,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        f: &mut (dyn FnMut(Component) -> bool + Send),
    ) -> StoreResult<()> {
        // Detached instances stored for this series replace generated ones
        let detached: Vec<Component> = if component.is_recurring() {
            self.get_all_for_uid(&component.uid)
                .await?
                .into_iter()
                .filter(|c| c.recurrence_id.is_some())
                .collect()
        } else {
            Vec::new()
        };

        recurrence::expand(component, start, end, &mut |instance: Component| {
            let instance = detached
                .iter()
                .find(|d| d.recurrence_id == instance.recurrence_id)
                .cloned()
                .unwrap_or(instance);
            f(instance)
        })
    }

    async fn create_view(&self, query: &Query) -> StoreResult<ViewStream> {
        let delay = *self.shared.view_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !self.shared.sources.lock().contains_key(&self.source_uid) {
            return Err(StoreError::Query(format!(
                "source '{}' no longer exists",
                self.source_uid
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.shared.next_view_id.fetch_add(1, Ordering::SeqCst);
        self.shared.views.lock().push(ViewSlot {
            id,
            source_uid: self.source_uid.clone(),
            query: query.clone(),
            started: false,
            tx,
        });

        Ok(ViewStream {
            view: Box::new(MemoryView {
                id,
                source_uid: self.source_uid.clone(),
                query: query.clone(),
                shared: self.shared.clone(),
            }),
            changes: rx,
        })
    }
}

struct MemoryView {
    id: u64,
    source_uid: String,
    query: Query,
    shared: Arc<Shared>,
}

impl View for MemoryView {
    fn query(&self) -> &Query {
        &self.query
    }

    fn start(&self) -> StoreResult<()> {
        let mut views = self.shared.views.lock();
        let slot = views
            .iter_mut()
            .find(|s| s.id == self.id)
            .ok_or_else(|| StoreError::Query("view was stopped".to_string()))?;
        if slot.started {
            return Ok(());
        }
        slot.started = true;

        let initial: Vec<Component> = self
            .shared
            .sources
            .lock()
            .get(&self.source_uid)
            .map(|entry| {
                entry
                    .components
                    .iter()
                    .filter(|c| matches(&self.query, c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !initial.is_empty() {
            let _ = slot.tx.send(ViewChange::Added(initial));
        }
        Ok(())
    }

    fn stop(&self) {
        self.shared.views.lock().retain(|s| s.id != self.id);
    }
}

impl Drop for MemoryView {
    fn drop(&mut self) {
        self.stop();
    }
}
