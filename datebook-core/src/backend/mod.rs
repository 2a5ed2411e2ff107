//! The calendar backend the store talks to.
//!
//! A backend owns the source registry and hands out one [`Client`] per
//! connected source. Clients do CRUD, recurrence expansion and open live
//! [`View`]s whose changes arrive on a channel.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::component::{Component, ComponentId, ComponentTime, ModType};
use crate::error::StoreResult;
use crate::query::Query;
use crate::source::{Source, SourceKind};

/// Registry notification as published by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceChange {
    Added(Source),
    Changed(Source),
    Removed(Source),
}

/// A batch of changes pushed by a live view.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    Added(Vec<Component>),
    Modified(Vec<Component>),
    Removed(Vec<ComponentId>),
}

/// A live, filtered subscription over one source.
pub trait View: Send + Sync {
    fn query(&self) -> &Query;

    /// Begin delivering changes, starting with everything that currently matches.
    fn start(&self) -> StoreResult<()>;

    /// Stop delivering changes. The change channel closes.
    fn stop(&self);
}

/// A freshly created view together with its change channel.
pub struct ViewStream {
    pub view: Box<dyn View>,
    pub changes: UnboundedReceiver<ViewChange>,
}

/// A live connection to one source.
#[async_trait]
pub trait Client: Send + Sync {
    fn source_uid(&self) -> &str;

    fn is_readonly(&self) -> bool;

    /// Store a new component; the result may carry a backend-assigned UID.
    async fn create(&self, component: &Component) -> StoreResult<Component>;

    async fn modify(&self, component: &Component, mod_type: ModType) -> StoreResult<Component>;

    async fn remove(
        &self,
        uid: &str,
        recurrence_id: Option<&ComponentTime>,
        mod_type: ModType,
    ) -> StoreResult<()>;

    /// The series master and any detached instances sharing `uid`.
    async fn get_all_for_uid(&self, uid: &str) -> StoreResult<Vec<Component>>;

    /// Call `f` once per occurrence in `[start, end)` until it returns `false`.
    async fn expand_recurrence(
        &self,
        component: &Component,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        f: &mut (dyn FnMut(Component) -> bool + Send),
    ) -> StoreResult<()>;

    /// Open a view; it does not deliver anything until started.
    async fn create_view(&self, query: &Query) -> StoreResult<ViewStream>;
}

/// Source registry plus connection factory.
#[async_trait]
pub trait Backend: Send + Sync {
    fn list_sources(&self, kind: SourceKind) -> Vec<Source>;

    fn source(&self, uid: &str) -> Option<Source>;

    fn set_source_enabled(&self, uid: &str, enabled: bool) -> StoreResult<()>;

    /// Permanently delete a source and everything in it.
    async fn remove_source(&self, uid: &str) -> StoreResult<()>;

    /// Subscribe to registry notifications.
    fn watch_sources(&self) -> UnboundedReceiver<SourceChange>;

    /// Connect to a source. Credential prompts, if any, happen here.
    async fn connect(
        &self,
        source: &Source,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> StoreResult<Arc<dyn Client>>;
}
