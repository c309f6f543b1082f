//! Capacity limits and policies for a [`Connector`](crate::net::Connector).

use std::time::Duration;

use crate::{Error, Result};

/// Size of the receive buffer owned by each connection.
pub const DEFAULT_BUFFER_SIZE: usize = 1500;

/// Pause taken by an accept loop after refusing a client.
pub const DEFAULT_REJECT_BACKOFF: Duration = Duration::from_millis(1000);

/// Default number of undelivered [`Event`](crate::net::Event)s kept.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// What an accept loop does when `accept()` fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FaultPolicy {
    /// Report [`Event::ListenerFaulted`](crate::net::Event::ListenerFaulted)
    /// and tear the listener down, leaving restart to the application.
    #[default]
    Report,
    /// Log the failure and terminate the process.
    Exit,
}

/// Configuration of a [`Connector`](crate::net::Connector).
///
/// The registry holds `max_servers + max_clients` connections. Any slot can
/// hold either role; the split only sizes the table.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of listening servers to manage.
    pub max_servers: usize,
    /// Number of standalone outbound clients to manage.
    pub max_clients: usize,
    /// Clients each listener admits concurrently. Also used as the listen
    /// backlog.
    pub clients_per_server: usize,
    /// Receive buffer size, the most bytes a single `on_receive` delivers.
    pub buffer_size: usize,
    /// Pause after a client is refused at capacity.
    pub reject_backoff: Duration,
    /// Reaction to an accept failure.
    pub fault_policy: FaultPolicy,
    /// Undelivered events kept before new ones are dropped.
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_servers: 1,
            max_clients: 1,
            clients_per_server: 1,
            buffer_size: DEFAULT_BUFFER_SIZE,
            reject_backoff: DEFAULT_REJECT_BACKOFF,
            fault_policy: FaultPolicy::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    /// Total number of registry slots.
    pub fn capacity(&self) -> usize {
        self.max_servers.saturating_add(self.max_clients)
    }

    /// Checks that every limit allows at least one connection.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidParameter] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.capacity() == 0 {
            return Err(Error::InvalidParameter(
                "max_servers + max_clients must be at least 1".into(),
            ));
        }

        if self.clients_per_server == 0 {
            return Err(Error::InvalidParameter(
                "clients_per_server must be at least 1".into(),
            ));
        }

        if self.clients_per_server > libc::c_int::MAX as usize {
            return Err(Error::InvalidParameter(format!(
                "clients_per_server must not exceed {}",
                libc::c_int::MAX
            )));
        }

        if self.buffer_size == 0 {
            return Err(Error::InvalidParameter(
                "buffer_size must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
