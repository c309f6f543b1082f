//! Asynchronous outcomes that have no caller to return to.

use std::net::SocketAddr;
use std::sync::mpsc::{Receiver, SyncSender, TrySendError, sync_channel};

use log::warn;

use crate::Error;
use crate::net::Handle;

/// Something a background loop observed that the application may want to
/// act on. Received through [Connector::events](crate::net::Connector::events).
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// A listener at capacity refused a client without admitting it.
    Rejected {
        /// The listener.
        server: Handle,
        /// Remote address of the refused client.
        peer: SocketAddr,
    },
    /// A listener's `accept()` failed. Under
    /// [FaultPolicy::Report](crate::config::FaultPolicy::Report) the listener
    /// has been torn down and its port may be listened on again.
    ListenerFaulted {
        /// The listener.
        server: Handle,
        /// What went wrong.
        error: Error,
    },
    /// A listener accepted a client but could not service it. The client was
    /// dropped; the listener keeps running.
    AdmissionFailed {
        /// The listener.
        server: Handle,
        /// What went wrong.
        error: Error,
    },
    /// A read failed other than by orderly close. The connection has been
    /// torn down.
    ReceiveFailed {
        /// The connection.
        handle: Handle,
        /// What went wrong.
        error: Error,
    },
}

/// Bounded sending half of the event queue. Events that do not fit are
/// dropped so that no loop ever blocks on a slow or absent consumer.
#[derive(Debug, Clone)]
pub(crate) struct Events {
    tx: SyncSender<Event>,
}

impl Events {
    pub(crate) fn channel(capacity: usize) -> (Self, Receiver<Event>) {
        let (tx, rx) = sync_channel(capacity);
        (Self { tx }, rx)
    }

    pub(crate) fn emit(&self, event: Event) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                warn!("event queue full, dropping {event:?}");
            }
        }
    }
}
