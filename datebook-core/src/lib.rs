//! Data layer for a calendar and task application.
//!
//! - `window`: the month being viewed and the week-aligned range behind it
//! - `backend`: the trait seam to whatever stores calendars, plus an in-memory implementation
//! - `store`: connections, live views, the component index and optimistic writes

pub mod backend;
pub mod component;
pub mod config;
pub mod error;
pub mod preferences;
pub mod query;
pub mod recurrence;
pub mod registry;
pub mod source;
pub mod store;
pub mod window;

pub use component::{Alarm, AlarmTrigger, Component, ComponentId, ComponentTime, ModType, Recurrence, Status};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use source::{Source, SourceKind};
pub use store::{Store, StoreEvent};
pub use window::{DateRange, Window};
