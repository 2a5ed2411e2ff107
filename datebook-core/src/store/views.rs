//! Live views: at most one per connected source, reissued whenever the
//! window moves.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::backend::{View, ViewChange, ViewStream};
use crate::error::StoreResult;
use crate::query::Query;
use crate::source::Source;
use crate::store::Inner;
use crate::store::events::StoreEvent;
use crate::store::index::SourceIndex;

pub(crate) struct ActiveView {
    view: Box<dyn View>,
    pump: JoinHandle<()>,
}

impl ActiveView {
    pub(crate) fn stop(self) {
        self.view.stop();
        self.pump.abort();
    }
}

/// Forward a view's changes into the index until the view or the store goes away.
async fn pump_changes(
    inner: Weak<Inner>,
    source: Source,
    mut changes: UnboundedReceiver<ViewChange>,
) {
    while let Some(change) = changes.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.apply_change(&source, change).await;
    }
}

impl Inner {
    pub(crate) fn stop_views(&self, source_uid: &str) {
        let views = self.views.lock().remove(source_uid).unwrap_or_default();
        for view in views {
            view.stop();
        }
    }

    /// Open and start a view over `query`, then pump its changes.
    ///
    /// Whatever the view reports on start is applied before this returns.
    async fn add_view(self: &Arc<Self>, source: &Source, query: Query) -> StoreResult<()> {
        let (_, client) = self.client_for(&source.uid)?;
        tracing::debug!(source = %source, %query, "Opening view");

        let ViewStream { view, mut changes } = client.create_view(&query).await?;
        view.start()?;

        while let Ok(change) = changes.try_recv() {
            self.apply_change(source, change).await;
        }

        let pump = tokio::spawn(pump_changes(
            Arc::downgrade(self),
            source.clone(),
            changes,
        ));
        let replaced = self
            .views
            .lock()
            .insert(source.uid.clone(), vec![ActiveView { view, pump }]);
        for old in replaced.into_iter().flatten() {
            old.stop();
        }

        // Disconnected while the view was being set up
        if !self.is_connected(&source.uid) {
            self.stop_views(&source.uid);
        }
        Ok(())
    }

    /// Replace the source's view with one over the current data range.
    ///
    /// Old views are stopped and the source's index emptied first, so the
    /// new view's initial batch is the complete picture. Loads of one
    /// source run one at a time.
    pub(crate) async fn load_source(self: &Arc<Self>, source: &Source) {
        if !source.enabled {
            return;
        }

        let loading = self.loads.lock().entry(source.uid.clone()).or_default().clone();
        let _loading = loading.lock().await;
        if !self.is_connected(&source.uid) {
            return;
        }

        self.stop_views(&source.uid);
        let stale = self
            .index
            .lock()
            .get_mut(&source.uid)
            .map(|index| {
                let all = index.all();
                *index = SourceIndex::new(index.source.clone());
                all
            })
            .unwrap_or_default();
        if !stale.is_empty() {
            self.emit(StoreEvent::ComponentsRemoved {
                source: source.clone(),
                components: stale,
            });
        }

        let query = Query::for_range(source.kind, &self.window.read().data_range);
        if let Err(error) = self.add_view(source, query).await {
            self.report(error);
        }
    }

    pub(crate) async fn load_all_sources(self: &Arc<Self>) {
        for source in self.connected_sources() {
            self.load_source(&source).await;
        }
    }
}
