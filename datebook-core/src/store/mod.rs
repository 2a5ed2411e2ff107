//! The store: connected sources, the visible window and an index of every
//! component currently inside it.
//!
//! A [`Store`] is cheap to clone and must be created inside a tokio runtime;
//! it spawns a task that follows the source registry and one that runs
//! deferred work. Listeners receive [`StoreEvent`]s through
//! [`Store::subscribe`].

mod connection;
pub mod events;
mod index;
mod mutation;
mod views;

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Weak};

use chrono::{Local, NaiveDate, Weekday};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::backend::{Backend, SourceChange};
use crate::component::{Component, ModType};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::preferences::{LAST_VIEWED_MONTH, Preferences};
use crate::registry::SourceRegistry;
use crate::source::{Source, SourceKind};
use crate::window::{self, DateRange, Window};

use connection::Connection;
pub use events::StoreEvent;
use events::Listeners;
use index::SourceIndex;
use views::ActiveView;

/// Work queued to run after the current step completes.
pub(crate) enum Deferred {
    /// A source finished connecting: announce it and load its view
    SourceReady(Source),
    /// Resolves once everything queued before it has run
    Flush(oneshot::Sender<()>),
}

pub(crate) struct Inner {
    registry: SourceRegistry,
    prefs: Arc<dyn Preferences>,
    config: StoreConfig,
    window: RwLock<Window>,

    // `index` may be taken while `connections` is held, never the reverse;
    // no other two are held together
    connections: Mutex<HashMap<String, Connection>>,
    views: Mutex<HashMap<String, Vec<ActiveView>>>,
    loads: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    index: Mutex<HashMap<String, SourceIndex>>,
    trash: Mutex<Vec<Source>>,

    next_attempt: AtomicU64,
    listeners: Listeners,
    deferred: UnboundedSender<Deferred>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    pub(crate) fn emit(&self, event: StoreEvent) {
        self.listeners.emit(event);
    }

    /// Log an error and hand it to listeners.
    pub(crate) fn report(&self, error: StoreError) {
        tracing::warn!("{error}");
        self.emit(StoreEvent::ErrorReceived(error));
    }

    pub(crate) fn defer(&self, job: Deferred) {
        if self.deferred.send(job).is_err() {
            tracing::debug!("Deferred queue closed");
        }
    }

    async fn run_deferred(self: &Arc<Self>, job: Deferred) {
        match job {
            Deferred::SourceReady(source) => {
                // Disconnected before the job ran
                if !self.is_connected(&source.uid) {
                    return;
                }
                self.emit(StoreEvent::SourceAdded(source.clone()));
                self.load_source(&source).await;
            }
            Deferred::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    /// Recompute the window, remember the month and reload every source.
    async fn set_window(self: &Arc<Self>, month_start: NaiveDate, week_starts_on: Weekday) {
        let next = Window::new(month_start, week_starts_on);
        {
            let mut current = self.window.write();
            if *current == next {
                return;
            }
            *current = next;
        }

        let month = window::format_month(next.month_start);
        tracing::debug!(
            %month,
            data_first = %next.data_range.first,
            data_last = %next.data_range.last,
            num_weeks = next.num_weeks,
            "Window changed"
        );
        if let Err(error) = self.prefs.set(LAST_VIEWED_MONTH, &month) {
            self.report(error);
        }
        self.emit(StoreEvent::ParametersChanged);
        self.load_all_sources().await;
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        for (_, views) in self.views.get_mut().drain() {
            for view in views {
                view.stop();
            }
        }
    }
}

async fn deferred_worker(inner: Weak<Inner>, mut jobs: UnboundedReceiver<Deferred>) {
    while let Some(job) = jobs.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.run_deferred(job).await;
    }
}

async fn registry_watcher(inner: Weak<Inner>, mut changes: UnboundedReceiver<SourceChange>) {
    while let Some(change) = changes.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        // Classify in arrival order; act concurrently so a slow connect
        // does not hold up other sources
        let event = inner.classify(change);
        tokio::spawn(async move { inner.on_registry_event(event).await });
    }
}

/// Month initially shown: the remembered one, else the current month.
fn initial_month(prefs: &dyn Preferences) -> NaiveDate {
    prefs
        .get(LAST_VIEWED_MONTH)
        .and_then(|s| window::parse_month(&s))
        .unwrap_or_else(|| window::first_of_month(Local::now().date_naive()))
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<Inner>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>, prefs: Arc<dyn Preferences>, config: StoreConfig) -> Self {
        let window = Window::new(initial_month(prefs.as_ref()), config.week_starts_on);
        let (deferred, jobs) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            registry: SourceRegistry::new(backend),
            prefs,
            config,
            window: RwLock::new(window),
            connections: Mutex::new(HashMap::new()),
            views: Mutex::new(HashMap::new()),
            loads: Mutex::new(HashMap::new()),
            index: Mutex::new(HashMap::new()),
            trash: Mutex::new(Vec::new()),
            next_attempt: AtomicU64::new(0),
            listeners: Listeners::default(),
            deferred,
            tasks: Mutex::new(Vec::new()),
        });

        let worker = tokio::spawn(deferred_worker(Arc::downgrade(&inner), jobs));
        let changes = inner.registry.watch();
        let watcher = tokio::spawn(registry_watcher(Arc::downgrade(&inner), changes));
        inner.tasks.lock().extend([worker, watcher]);

        Store { inner }
    }

    pub fn subscribe(&self) -> UnboundedReceiver<StoreEvent> {
        self.inner.listeners.subscribe()
    }

    /// Connect every enabled calendar and task list.
    pub async fn start(&self) {
        let sources: Vec<Source> = [SourceKind::Calendar, SourceKind::TaskList]
            .into_iter()
            .flat_map(|kind| self.inner.registry.sources(kind))
            .filter(|s| s.enabled)
            .collect();
        tracing::info!("Starting with {} enabled sources", sources.len());

        let handles: Vec<_> = sources
            .into_iter()
            .map(|source| {
                let inner = self.inner.clone();
                tokio::spawn(async move { inner.connect_source(source).await })
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("Connect task failed: {e}");
            }
        }
    }

    /// Wait until work queued so far (source announcements, initial loads) has run.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.inner.defer(Deferred::Flush(done));
        let _ = wait.await;
    }

    pub async fn connect_source(&self, source: Source) {
        self.inner.connect_source(source).await;
    }

    pub fn disconnect_source(&self, source_uid: &str) {
        self.inner.disconnect_source(source_uid);
    }

    pub fn connected_sources(&self) -> Vec<Source> {
        let mut sources = self.inner.connected_sources();
        sources.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        sources
    }

    // Window

    pub fn window(&self) -> Window {
        *self.inner.window.read()
    }

    pub fn month_start(&self) -> NaiveDate {
        self.window().month_start
    }

    pub fn week_starts_on(&self) -> Weekday {
        self.window().week_starts_on
    }

    pub fn month_range(&self) -> DateRange {
        self.window().month_range
    }

    pub fn data_range(&self) -> DateRange {
        self.window().data_range
    }

    pub fn num_weeks(&self) -> u32 {
        self.window().num_weeks
    }

    /// Show the month containing `date`.
    pub async fn set_month_start(&self, date: NaiveDate) {
        if !window::is_supported_month(date) {
            tracing::warn!("Cannot show the month of {date}");
            return;
        }
        let week_starts_on = self.week_starts_on();
        self.inner
            .set_window(window::first_of_month(date), week_starts_on)
            .await;
    }

    pub async fn set_week_starts_on(&self, week_starts_on: Weekday) {
        let month_start = self.month_start();
        self.inner.set_window(month_start, week_starts_on).await;
    }

    pub async fn change_month(&self, delta: i32) {
        let current = self.month_start();
        match window::shift_months(current, delta) {
            Some(month) => self.set_month_start(month).await,
            None => tracing::warn!("Cannot move {delta} months from {current}"),
        }
    }

    pub async fn change_year(&self, delta: i32) {
        self.change_month(delta.saturating_mul(12)).await;
    }

    /// Reissue the view of every connected source over the current window.
    pub async fn load_all_sources(&self) {
        self.inner.load_all_sources().await;
    }

    // Sources

    pub fn get_source_by_uid(&self, uid: &str) -> Option<Source> {
        self.inner.registry.source(uid)
    }

    pub fn sources(&self, kind: SourceKind) -> Vec<Source> {
        self.inner.registry.sources(kind)
    }

    pub fn is_source_enabled(&self, uid: &str) -> bool {
        self.get_source_by_uid(uid).is_some_and(|s| s.enabled)
    }

    /// Sources without a live client count as read-only.
    pub fn is_source_readonly(&self, uid: &str) -> bool {
        match self.inner.connections.lock().get(uid) {
            Some(Connection::Connected { client, .. }) => client.is_readonly(),
            _ => true,
        }
    }

    /// Indexed components of one source, in occurrence order.
    pub fn components(&self, source_uid: &str) -> Vec<Component> {
        self.inner
            .index
            .lock()
            .get(source_uid)
            .map(SourceIndex::all)
            .unwrap_or_default()
    }

    /// Every indexed component with its source.
    pub fn all_components(&self) -> Vec<(Source, Component)> {
        let index = self.inner.index.lock();
        let mut all: Vec<(Source, Component)> = index
            .values()
            .flat_map(|entry| {
                entry
                    .all()
                    .into_iter()
                    .map(|c| (entry.source.clone(), c))
            })
            .collect();
        all.sort_by(|(_, a), (_, b)| a.cmp_occurrence(b));
        all
    }

    // Mutations

    pub async fn add_component(&self, source: &Source, component: Component) {
        self.inner.add_component(source, component).await;
    }

    pub async fn modify_component(&self, source: &Source, component: Component, mod_type: ModType) {
        self.inner.modify_component(source, component, mod_type).await;
    }

    pub async fn remove_component(&self, source: &Source, component: Component, mod_type: ModType) {
        self.inner.remove_component(source, component, mod_type).await;
    }

    // Trash

    /// Disable a source and put it in the trash. Its data stays with the
    /// backend until [`Store::delete_trashed_sources`].
    pub async fn trash_source(&self, source: &Source) {
        self.inner.trash.lock().push(source.clone());
        if let Err(error) = self.inner.registry.set_enabled(&source.uid, false) {
            self.inner.report(error);
        }
        self.inner.disconnect_source(&source.uid);
        tracing::info!(source = %source, "Moved to trash");
    }

    /// Take the most recently trashed source back out and reconnect it.
    pub async fn restore_source(&self) {
        let restored = self.inner.trash.lock().pop();
        let Some(source) = restored else {
            return;
        };

        if let Err(error) = self.inner.registry.set_enabled(&source.uid, true) {
            self.inner.trash.lock().push(source);
            self.inner.report(error);
            return;
        }
        let source = self.get_source_by_uid(&source.uid).unwrap_or(Source {
            enabled: true,
            ..source
        });
        tracing::info!(source = %source, "Restored from trash");
        self.inner.connect_source(source).await;
    }

    /// Permanently remove everything in the trash, oldest first.
    /// Failures are logged and skipped.
    pub async fn delete_trashed_sources(&self) {
        loop {
            let next = {
                let mut trash = self.inner.trash.lock();
                (!trash.is_empty()).then(|| trash.remove(0))
            };
            let Some(source) = next else {
                break;
            };
            match self.inner.registry.remove(&source.uid).await {
                Ok(()) => tracing::info!(source = %source, "Deleted"),
                Err(error) => tracing::warn!(source = %source, "Could not delete: {error}"),
            }
        }
    }

    pub fn trashed_sources(&self) -> Vec<Source> {
        self.inner.trash.lock().clone()
    }
}
