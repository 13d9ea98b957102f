//! The caller's side of the core: turning a local invocation into an
//!  outgoing envelope, resolving the matching response, and keeping the
//!  session alive.

pub mod pipeline;
pub mod proxy;
