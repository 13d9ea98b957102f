//! An RPC core for a component-hosting framework: interface-typed components
//!  are exposed to remote callers, and server-side components invoke
//!  callbacks and fire events back at a specific connected client - all
//!  multiplexed over one bidirectional TCP connection per client, with no
//!  extra inbound port on the client side.
//!
//! The pieces, bottom up:
//! * [wire] - the binary envelope (correlation id, ordered header map,
//!   opaque body), the handshake descriptor, and the value encoding the
//!   dispatch layer agrees on
//! * [transport] - duplex connections with a single continuously re-armed
//!   reader and serialized writers, the per-peer connection registry with
//!   duplicate-connection collapsing, and the correlation router matching
//!   inbound envelopes to waiters
//! * [dispatch] - the server role: catalog lookup by interface name,
//!   per-call / shared activation, session validation, a registration-time
//!   method table, and guaranteed callback unwiring
//! * [client] - the caller's pipeline: call-scoped context, hooks,
//!   transparent re-login, heartbeats
//! * [callback] - the wiring that lets one side invoke a callable the other
//!   side holds, over the connection that already exists
//!
//! Session storage, authentication and component cataloging are consumed
//!  through the interfaces in [session], [auth] and [dispatch::catalog];
//!  their implementations are the hosting layer's business.

pub mod auth;
pub mod callback;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod fault;
pub mod hooks;
pub mod session;
pub mod transport;
pub mod util;
pub mod wire;
