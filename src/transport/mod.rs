//! The duplex transport: one TCP connection per peer pair, usable for calls
//!  initiated by either side.
//!
//! A [connection::Connection] owns one socket with an independent read and
//!  write lock: exactly one envelope is written at a time, and exactly one
//!  reader task drains the socket, re-arming the next read before the
//!  just-received envelope is processed. Responses complete waiters in the
//!  connection's [router::CorrelationRouter]; requests are handed to the
//!  endpoint's [endpoint::InboundHandler].
//!
//! The [registry::ConnectionRegistry] keeps at most one live connection per
//!  peer channel identity. A connection is registered under every address it
//!  is reachable by plus the peer-declared identity, so a dial from the far
//!  side is recognized as the same logical channel and reused instead of
//!  opening a second socket.

pub mod connection;
pub mod endpoint;
pub mod registry;
pub mod router;
