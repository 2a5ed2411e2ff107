//! Outbound store notifications.

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::component::Component;
use crate::error::StoreError;
use crate::source::Source;

/// Everything listeners (e.g. the UI) are told about.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    ErrorReceived(StoreError),
    /// A connect attempt started; cancel the token to abandon it
    SourceConnecting {
        source: Source,
        cancel: CancellationToken,
    },
    SourceAdded(Source),
    SourceRemoved(Source),
    ComponentsAdded {
        source: Source,
        components: Vec<Component>,
    },
    ComponentsModified {
        source: Source,
        components: Vec<Component>,
    },
    ComponentsRemoved {
        source: Source,
        components: Vec<Component>,
    },
    /// The visible window was recomputed
    ParametersChanged,
}

/// Fan-out of events to every subscriber. Closed receivers are dropped.
#[derive(Default)]
pub(crate) struct Listeners {
    senders: Mutex<Vec<UnboundedSender<StoreEvent>>>,
}

impl Listeners {
    pub(crate) fn subscribe(&self) -> UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: StoreEvent) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
