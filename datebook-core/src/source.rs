//! Calendar and task-list sources.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a source holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Calendar,
    TaskList,
}

/// A calendar or task-list feed known to the backend registry.
///
/// The backend owns sources; the store keeps snapshots of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub uid: String,
    pub display_name: String,
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Whether the source is shown in the UI
    #[serde(default = "default_true")]
    pub selected: bool,
}

fn default_true() -> bool {
    true
}

impl Source {
    pub fn new(uid: &str, display_name: &str, kind: SourceKind) -> Self {
        Source {
            uid: uid.to_string(),
            display_name: display_name.to_string(),
            kind,
            enabled: true,
            selected: true,
        }
    }

    pub fn is_task_list(&self) -> bool {
        self.kind == SourceKind::TaskList
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.display_name)
    }
}
