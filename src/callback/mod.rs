//! Remote callback and event wiring.
//!
//! A callback crosses the wire as a [crate::wire::value::CallbackDescriptor]
//!  only - the callable itself stays on the side that supplied it, parked in
//!  a [registry::CallbackRegistry] under the descriptor's correlation id.
//!  The receiving side binds the descriptor to the connection it arrived on,
//!  yielding a [remote::RemoteCallback] the component invokes as if the
//!  callable were local. Invocations ride the same duplex connection back;
//!  no extra socket is opened in either direction.
//!
//! Adapters are produced through [remote::CallbackWiring], cached per
//!  (interface, member). A bridged callback that fails for any reason
//!  detaches its adapter before the failure propagates, so a broken remote
//!  callback is never invoked again.

pub mod events;
pub mod registry;
pub mod remote;
