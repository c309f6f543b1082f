//! Connection establishment, teardown, and the operations the application
//! calls.

use std::net::{SocketAddr, SocketAddrV4, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::{fmt, mem};

use log::{debug, info, warn};

use crate::config::Config;
use crate::net::event::{Event, Events};
use crate::net::handler::{Callbacks, OnConnectionChange, OnReceive, Peer};
use crate::net::link::Link;
use crate::net::registry::{Claim, Connection, Location, Registry, Role, Server};
use crate::net::{Handle, accept, receive, socket};
use crate::task::{self, lock};
use crate::{Error, Result};

/// What to establish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Listen on `port` on all local interfaces. Port `0` lets the OS pick;
    /// see [Connector::local_addr].
    Server {
        /// Local port.
        port: u16,
    },
    /// Connect to `address:port`. `address` may be an IPv4 literal or a host
    /// name resolving to an IPv4 address.
    Client {
        /// Remote host.
        address: String,
        /// Remote port.
        port: u16,
    },
}

/// The descriptor a new connection's loop will block on.
enum Pending {
    Accept(TcpListener),
    Receive(TcpStream),
}

/// State shared between a [Connector] and its background loops.
pub(crate) struct Shared {
    pub(crate) config: Config,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) events: Events,
    counter: AtomicUsize,
    receiver: Mutex<Option<Receiver<Event>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Keeps a loop's join handle for [Connector::shutdown], forgetting the
    /// ones that already finished.
    pub(crate) fn track(&self, task: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub(crate) fn opened(&self) {
        self.counter.fetch_add(1, Ordering::Relaxed);
    }

    fn closed(&self) {
        let _ = self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Removes a connection whose loop never started: frees the slot and
    /// closes the transport without notifying the application.
    pub(crate) fn abandon(&self, location: Location, link: &Link) {
        lock(&self.registry).remove(location);
        self.closed();

        if let Err(err) = link.close() {
            warn!("failed to close abandoned connection {}: {err}", link.handle());
        }
    }

    /// Tears down the connection registered under `handle`.
    pub(crate) fn teardown(&self, handle: Handle) -> Result<()> {
        let claim = {
            let mut registry = lock(&self.registry);
            registry
                .find_by_handle(handle)
                .and_then(|loc| registry.claim(loc))
        };

        self.finish(claim.ok_or(Error::InvalidHandle(handle))?)
    }

    /// Tears down the connection owning exactly `link`.
    pub(crate) fn teardown_link(&self, link: &Arc<Link>) -> Result<()> {
        let claim = {
            let mut registry = lock(&self.registry);
            registry.find_link(link).and_then(|loc| registry.claim(loc))
        };

        self.finish(claim.ok_or(Error::InvalidHandle(link.handle()))?)
    }

    /// Runs a claimed teardown: notify, shut down and close, release the
    /// slot. A stream whose loop has not announced it yet is announced here,
    /// so the application always sees `true` before `false`. A listener's admitted clients are torn down before its slot is
    /// released.
    fn finish(&self, claim: Claim) -> Result<()> {
        let Claim {
            link,
            change,
            is_server,
        } = claim;
        let handle = link.handle();

        let peer = Peer::new(Arc::clone(&link));
        if !link.announcement().retire() {
            change.on_connection_change(&peer, true);
        }
        change.on_connection_change(&peer, false);

        let closed = link.close();

        if is_server {
            let clients = {
                let registry = lock(&self.registry);
                registry
                    .find_link(&link)
                    .map(|loc| registry.admitted(loc))
                    .unwrap_or_default()
            };

            for client in clients {
                match self.teardown_link(&client) {
                    Ok(()) | Err(Error::InvalidHandle(_)) => {}
                    Err(err) => warn!("client {} of listener {handle}: {err}", client.handle()),
                }
            }
        }

        {
            let mut registry = lock(&self.registry);
            if let Some(loc) = registry.find_link(&link) {
                registry.remove(loc);
            }
        }
        self.closed();

        info!("disconnected socket {handle}");

        closed.map_err(Error::DisconnectFailed)
    }

    pub(crate) fn link(&self, handle: Handle) -> Result<Arc<Link>> {
        let registry = lock(&self.registry);
        registry
            .find_by_handle(handle)
            .and_then(|loc| registry.link(loc))
            .cloned()
            .ok_or(Error::InvalidHandle(handle))
    }
}

/// Fixed-capacity manager of listening servers and outbound clients, each
/// connection serviced by its own thread.
///
/// Dropping the connector shuts every connection down.
///
/// # Examples
///
/// ```no_run
/// use socket_connector::net::{Connector, Peer};
/// use socket_connector::Config;
///
/// let connector = Connector::new(Config::default())?;
///
/// let server = connector.listen(
///     1234,
///     |peer: &Peer, data: &[u8]| {
///         let _ = peer.send(data);
///     },
///     |peer: &Peer, connected: bool| {
///         println!("{} connected: {connected}", peer.handle());
///     },
/// )?;
///
/// assert!(connector.is_connected(server));
/// # Ok::<(), socket_connector::Error>(())
/// ```
pub struct Connector {
    shared: Arc<Shared>,
}

impl Connector {
    /// Creates a connector with an empty registry sized from `config`.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidParameter] if `config` does not validate.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let (events, receiver) = Events::channel(config.event_capacity);

        Ok(Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::new(config.capacity())),
                config,
                events,
                counter: AtomicUsize::new(0),
                receiver: Mutex::new(Some(receiver)),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Returns the configuration the connector was built with.
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Takes the receiving end of the event queue. Only the first call
    /// returns it.
    pub fn events(&self) -> Option<Receiver<Event>> {
        lock(&self.shared.receiver).take()
    }

    /// Tears down every connection, leaving all slots free. Calling it on an
    /// empty registry does nothing.
    pub fn init(&self) {
        let links = lock(&self.shared.registry).top_level();

        for link in links {
            match self.shared.teardown_link(&link) {
                Ok(()) | Err(Error::InvalidHandle(_)) => {}
                Err(err) => warn!("{err}"),
            }
        }
    }

    /// Establishes a listener or an outbound client.
    ///
    /// A listener is returned as soon as it listens; clients are admitted by
    /// its accept loop. A client is returned once connected and its receive
    /// loop started.
    ///
    /// # Errors
    ///
    /// Returns [Error::NoSpaceForConnection] if the registry is full, or the
    /// error of the failing step. No slot or transport is left behind on
    /// failure.
    pub fn open<R, C>(&self, endpoint: Endpoint, on_receive: R, on_change: C) -> Result<Handle>
    where
        R: OnReceive + 'static,
        C: OnConnectionChange + 'static,
    {
        let callbacks = Callbacks::new(on_receive, on_change);
        let idx = lock(&self.shared.registry).allocate_slot()?;

        let (link, pending) = match self.prepare(&endpoint) {
            Ok(prepared) => prepared,
            Err(err) => {
                lock(&self.shared.registry).release_slot(idx);
                return Err(err);
            }
        };
        let handle = link.handle();

        let role = match pending {
            Pending::Accept(_) => Role::Server(Server::new(self.shared.config.clients_per_server)),
            Pending::Receive(_) => Role::Client,
        };
        lock(&self.shared.registry).fill(
            idx,
            Connection::new(Arc::clone(&link), callbacks.clone(), role),
        );
        self.shared.opened();

        let shared = Arc::clone(&self.shared);
        let looped = Arc::clone(&link);

        let spawned = match pending {
            Pending::Accept(acceptor) => {
                task::spawn("tcp-server", move || accept::run(shared, looped, acceptor))
            }
            Pending::Receive(reader) => task::spawn("tcp-recv", move || {
                receive::run(shared, looped, reader, callbacks)
            }),
        };

        match spawned {
            Ok(task) => self.shared.track(task),
            Err(err) => {
                self.shared.abandon(Location::Top(idx), &link);
                return Err(err);
            }
        }

        match endpoint {
            Endpoint::Server { port } => info!(
                "listening on {} (socket {handle}, up to {} clients)",
                link.local_addr()
                    .map_or_else(|| format!("port {port}"), |addr| addr.to_string()),
                self.shared.config.clients_per_server,
            ),
            Endpoint::Client { address, port } => {
                info!("connected to {address}:{port} (socket {handle})")
            }
        }

        Ok(handle)
    }

    /// Listens on `port`. See [Connector::open].
    pub fn listen<R, C>(&self, port: u16, on_receive: R, on_change: C) -> Result<Handle>
    where
        R: OnReceive + 'static,
        C: OnConnectionChange + 'static,
    {
        self.open(Endpoint::Server { port }, on_receive, on_change)
    }

    /// Connects to `address:port`. See [Connector::open].
    pub fn connect<R, C>(
        &self,
        address: &str,
        port: u16,
        on_receive: R,
        on_change: C,
    ) -> Result<Handle>
    where
        R: OnReceive + 'static,
        C: OnConnectionChange + 'static,
    {
        let endpoint = Endpoint::Client {
            address: address.to_string(),
            port,
        };

        self.open(endpoint, on_receive, on_change)
    }

    /// Opens the transport and the duplicate descriptor its loop blocks on.
    fn prepare(&self, endpoint: &Endpoint) -> Result<(Arc<Link>, Pending)> {
        match endpoint {
            Endpoint::Server { port } => {
                let listener = socket::listen(*port, self.shared.config.clients_per_server)?;
                let link = Arc::new(Link::listener(listener));

                match link.acceptor() {
                    Ok(acceptor) => Ok((link, Pending::Accept(acceptor))),
                    Err(err) => {
                        let _ = link.close();
                        Err(Error::SocketCreateFailed(err))
                    }
                }
            }
            Endpoint::Client { address, port } => {
                let stream = socket::connect(resolve(address, *port)?)?;
                let link = Arc::new(Link::stream(stream));

                match link.reader() {
                    Ok(reader) => Ok((link, Pending::Receive(reader))),
                    Err(err) => {
                        let _ = link.close();
                        Err(Error::SocketCreateFailed(err))
                    }
                }
            }
        }
    }

    /// Tears down a connection: the application is notified with
    /// `connected = false` first, then the transport is shut down and closed
    /// and the slot released.
    ///
    /// Tearing down a listener also tears down every client it admitted.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `handle` is not live (or already
    /// being torn down), and [Error::DisconnectFailed] if shutting down or
    /// closing failed. The connection is released either way.
    pub fn disconnect(&self, handle: Handle) -> Result<()> {
        self.shared.teardown(handle)
    }

    /// Checks whether `handle` names a live connection. Never fails.
    pub fn is_connected(&self, handle: Handle) -> bool {
        lock(&self.shared.registry).find_by_handle(handle).is_some()
    }

    /// Writes all of `data` to the connection.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `handle` is not live, and
    /// [Error::WriteFailed] if not every byte could be written (including
    /// writes to a listener). Sends are never retried.
    pub fn send(&self, handle: Handle, data: &[u8]) -> Result<()> {
        self.shared.link(handle)?.send(data)
    }

    /// Returns the local address of a live connection.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `handle` is not live.
    pub fn local_addr(&self, handle: Handle) -> Result<SocketAddr> {
        self.shared
            .link(handle)?
            .local_addr()
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Number of clients the listener `handle` has admitted.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidHandle] if `handle` is not a live listener.
    pub fn client_count(&self, handle: Handle) -> Result<usize> {
        let link = self.shared.link(handle)?;

        lock(&self.shared.registry)
            .active_clients(&link)
            .ok_or(Error::InvalidHandle(handle))
    }

    /// Number of connections established or admitted and not yet torn down.
    /// Informational only; capacity is decided by the registry.
    pub fn connection_count(&self) -> usize {
        self.shared.counter.load(Ordering::Relaxed)
    }

    /// Tears down every connection and waits for every loop to exit.
    ///
    /// The connector stays usable afterwards.
    pub fn shutdown(&self) {
        self.init();

        let current = thread::current().id();
        let tasks = mem::take(&mut *lock(&self.shared.tasks));

        for task in tasks {
            if task.thread().id() == current {
                continue;
            }

            if task.join().is_err() {
                warn!("connection task panicked during shutdown");
            }
        }

        debug!("connector shut down");
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("config", &self.shared.config)
            .field("capacity", &lock(&self.shared.registry).capacity())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

/// Resolves `address:port` to its first IPv4 address.
fn resolve(address: &str, port: u16) -> Result<SocketAddrV4> {
    let addrs = (address, port)
        .to_socket_addrs()
        .map_err(|source| Error::ConnectFailed {
            addr: format!("{address}:{port}"),
            source,
        })?;

    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::InvalidParameter(format!("{address} has no IPv4 address")))
}
