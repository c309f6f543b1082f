//! Thread-per-connection TCP connection management.
//!
//! A [Connector] owns a fixed-capacity registry of listeners and outbound
//! clients. Every connection is serviced by its own thread: listeners run an
//! accept loop, streams run a receive loop that hands each read to the
//! application through [OnReceive].

mod accept;
mod connector;
mod event;
mod handle;
mod handler;
mod link;
mod receive;
mod registry;
mod slots;
mod socket;

pub use connector::{Connector, Endpoint};
pub use event::Event;
pub use handle::Handle;
pub use handler::{OnConnectionChange, OnReceive, Peer};
