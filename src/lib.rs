//! Connection core for an application that shares state between clients and servers over a
//!  reliable-UDP transport.
//!
//! All socket I/O happens on a dedicated network thread. The application thread talks to it
//!  through two queues:
//!
//! ```ascii
//!  application thread                          network thread
//!  ------------------                          --------------
//!  ConnectionManager --- commands ----------->  Peer / Link table
//!  Connection        --- outbound packets --->
//!  ConnectionManager <-- messages ------------  transport events, payloads
//! ```
//!
//! The application thread calls [manager::ConnectionManager::update] periodically, which
//!  drains received messages and dispatches them to connection listeners. 'Async' listeners
//!  are invoked on the network thread directly, which is used for relaying tunnel traffic
//!  without waiting for the application's update cycle.
//!
//! On top of raw connections, [network_connection::NetworkConnection] provides a stable
//!  identity that survives replacing the underlying socket, tag-based message dispatch, and
//!  the helpers for handshakes ([handshake]) and tunnelling ([tunnel_bridge]).

pub mod buffers;
pub mod command;
pub mod config;
pub mod connection;
pub(crate) mod directory;
pub mod handshake;
pub mod ids;
pub mod manager;
pub mod message;
pub mod message_types;
pub mod network_connection;
pub mod network_message;
pub(crate) mod network_thread;
pub mod safe_converter;
pub mod transport;
pub mod tunnel_bridge;
