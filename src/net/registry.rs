//! Connection Registry: the fixed-capacity table of every live connection.
//!
//! Top-level records are listeners and outbound clients. A listener carries
//! its own fixed-capacity table of the clients it admitted. All records share
//! one handle space, and every lookup covers both levels.
//!
//! The registry is plain data; [Connector](crate::net::Connector) keeps it
//! behind a single lock and never calls out to the application while holding
//! it.

use std::sync::Arc;

use crate::net::Handle;
use crate::net::handler::{Callbacks, OnConnectionChange};
use crate::net::link::Link;
use crate::net::slots::Slots;
use crate::{Error, Result};

/// Where a record lives in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    /// A listener or an outbound client.
    Top(usize),
    /// A client admitted by the listener at `server`.
    Admitted { server: usize, client: usize },
}

#[derive(Debug)]
pub(crate) enum Role {
    Client,
    Server(Server),
}

#[derive(Debug)]
pub(crate) struct Server {
    clients: Slots<Admitted>,
}

impl Server {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            clients: Slots::with_capacity(capacity),
        }
    }

    /// Number of clients currently admitted.
    pub(crate) fn active(&self) -> usize {
        self.clients.len()
    }
}

#[derive(Debug)]
struct Admitted {
    link: Arc<Link>,
    closing: bool,
}

/// A top-level registry record.
#[derive(Debug)]
pub(crate) struct Connection {
    link: Arc<Link>,
    callbacks: Callbacks,
    role: Role,
    closing: bool,
}

impl Connection {
    pub(crate) fn new(link: Arc<Link>, callbacks: Callbacks, role: Role) -> Self {
        Self {
            link,
            callbacks,
            role,
            closing: false,
        }
    }
}

/// What a teardown needs once it has claimed a record.
pub(crate) struct Claim {
    pub(crate) link: Arc<Link>,
    pub(crate) change: Arc<dyn OnConnectionChange>,
    pub(crate) is_server: bool,
}

#[derive(Debug)]
pub(crate) struct Registry {
    table: Slots<Connection>,
}

impl Registry {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            table: Slots::with_capacity(capacity),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Claims the lowest-index free slot.
    ///
    /// # Errors
    ///
    /// Returns [Error::NoSpaceForConnection] if every slot is taken.
    pub(crate) fn allocate_slot(&mut self) -> Result<usize> {
        self.table.reserve().ok_or(Error::NoSpaceForConnection)
    }

    /// Hands back a slot from [Registry::allocate_slot] that was never
    /// filled, or frees a filled one.
    pub(crate) fn release_slot(&mut self, idx: usize) {
        self.table.release(idx);
    }

    pub(crate) fn fill(&mut self, idx: usize, connection: Connection) {
        self.table.fill(idx, connection);
    }

    /// Looks up a live connection by handle, searching listeners' admitted
    /// clients as well. The sentinel never matches.
    ///
    /// Records claimed for teardown are skipped: their descriptor may be
    /// closed already and its number handed to a newer connection.
    pub(crate) fn find_by_handle(&self, handle: Handle) -> Option<Location> {
        if handle.is_none() {
            return None;
        }

        self.find(true, |link| link.handle() == handle)
    }

    /// Looks up the record owning exactly `link`, closing or not.
    ///
    /// Loops use this instead of [Registry::find_by_handle]: once their own
    /// record is gone, the OS may already have reused the descriptor number
    /// for someone else.
    pub(crate) fn find_link(&self, link: &Arc<Link>) -> Option<Location> {
        self.find(false, |candidate| Arc::ptr_eq(candidate, link))
    }

    fn find(
        &self,
        live_only: bool,
        mut matches: impl FnMut(&Arc<Link>) -> bool,
    ) -> Option<Location> {
        for (idx, connection) in self.table.iter() {
            if !(live_only && connection.closing) && matches(&connection.link) {
                return Some(Location::Top(idx));
            }

            if let Role::Server(server) = &connection.role {
                let client = server
                    .clients
                    .position(|c| !(live_only && c.closing) && matches(&c.link));

                if let Some(client) = client {
                    return Some(Location::Admitted {
                        server: idx,
                        client,
                    });
                }
            }
        }

        None
    }

    pub(crate) fn link(&self, location: Location) -> Option<&Arc<Link>> {
        match location {
            Location::Top(idx) => self.table.get(idx).map(|c| &c.link),
            Location::Admitted { server, client } => {
                self.server(server)?.clients.get(client).map(|c| &c.link)
            }
        }
    }

    fn server(&self, idx: usize) -> Option<&Server> {
        match &self.table.get(idx)?.role {
            Role::Server(server) => Some(server),
            Role::Client => None,
        }
    }

    fn server_mut(&mut self, idx: usize) -> Option<&mut Server> {
        match &mut self.table.get_mut(idx)?.role {
            Role::Server(server) => Some(server),
            Role::Client => None,
        }
    }

    /// Callbacks for the connection at `location`. Admitted clients use the
    /// callbacks of their listener.
    pub(crate) fn callbacks(&self, location: Location) -> Option<Callbacks> {
        let idx = match location {
            Location::Top(idx) | Location::Admitted { server: idx, .. } => idx,
        };

        self.table.get(idx).map(|c| c.callbacks.clone())
    }

    /// Links of every top-level record, in slot order.
    pub(crate) fn top_level(&self) -> Vec<Arc<Link>> {
        self.table.iter().map(|(_, c)| Arc::clone(&c.link)).collect()
    }

    /// Links of the clients admitted by the listener at `location`.
    pub(crate) fn admitted(&self, location: Location) -> Vec<Arc<Link>> {
        let Location::Top(idx) = location else {
            return Vec::new();
        };

        self.server(idx)
            .map(|s| s.clients.iter().map(|(_, c)| Arc::clone(&c.link)).collect())
            .unwrap_or_default()
    }

    /// Number of clients the listener owning `link` currently holds.
    pub(crate) fn active_clients(&self, link: &Arc<Link>) -> Option<usize> {
        match self.find_link(link)? {
            Location::Top(idx) => self.server(idx).map(Server::active),
            Location::Admitted { .. } => None,
        }
    }

    /// Claims an admission slot on the listener owning `server`.
    ///
    /// Returns `Ok(None)` if the listener is at capacity.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if the listener is gone or being torn
    /// down.
    pub(crate) fn reserve_client(&mut self, server: &Arc<Link>) -> Result<Option<Location>> {
        let gone = || Error::InvalidHandle(server.handle());

        let Some(Location::Top(idx)) = self.find_link(server) else {
            return Err(gone());
        };

        let Some(connection) = self.table.get_mut(idx) else {
            return Err(gone());
        };

        let Role::Server(listener) = &mut connection.role else {
            return Err(gone());
        };

        if connection.closing {
            return Err(gone());
        }

        Ok(listener.clients.reserve().map(|client| Location::Admitted {
            server: idx,
            client,
        }))
    }

    /// Stores an admitted client in a slot from [Registry::reserve_client].
    ///
    /// Returns `false`, and frees the slot, if the listener started tearing
    /// down in the meantime; the caller then owns `link` and must close it.
    pub(crate) fn fill_client(&mut self, location: Location, link: Arc<Link>) -> bool {
        let Location::Admitted { server, client } = location else {
            return false;
        };

        let Some(connection) = self.table.get_mut(server) else {
            return false;
        };

        let closing = connection.closing;
        let Role::Server(listener) = &mut connection.role else {
            return false;
        };

        if closing {
            listener.clients.release(client);
            return false;
        }

        listener.clients.fill(client, Admitted {
            link,
            closing: false,
        });

        true
    }

    /// Marks the record at `location` as being torn down.
    ///
    /// Returns `None` if there is no record or another teardown already
    /// claimed it.
    pub(crate) fn claim(&mut self, location: Location) -> Option<Claim> {
        match location {
            Location::Top(idx) => {
                let connection = self.table.get_mut(idx)?;
                if connection.closing {
                    return None;
                }
                connection.closing = true;

                Some(Claim {
                    link: Arc::clone(&connection.link),
                    change: Arc::clone(&connection.callbacks.change),
                    is_server: matches!(connection.role, Role::Server(_)),
                })
            }
            Location::Admitted { server, client } => {
                let change = Arc::clone(&self.table.get(server)?.callbacks.change);

                let admitted = self.server_mut(server)?.clients.get_mut(client)?;
                if admitted.closing {
                    return None;
                }
                admitted.closing = true;

                Some(Claim {
                    link: Arc::clone(&admitted.link),
                    change,
                    is_server: false,
                })
            }
        }
    }

    /// Frees the slot at `location`. Freeing an admitted client's slot is
    /// what decrements its listener's active-client count.
    pub(crate) fn remove(&mut self, location: Location) {
        match location {
            Location::Top(idx) => {
                self.table.release(idx);
            }
            Location::Admitted { server, client } => {
                if let Some(listener) = self.server_mut(server) {
                    listener.clients.release(client);
                }
            }
        }
    }
}
