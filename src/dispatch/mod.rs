//! The server role: turning an incoming call envelope into a resolved method
//!  call against a registered component.
//!
//! A call runs through a fixed sequence of states:
//!
//! ```ascii
//! Received -> SessionValidated -> (ResultObtained | Faulted) -> Responded
//! ```
//!
//! The [catalog::ComponentCatalog] holds one registration per interface
//!  name. Method resolution happens against a table built once at
//!  registration time, keyed by name, arity and parameter signature - never
//!  by per-call inspection. The ambient session travels as an explicit
//!  [context::SessionContext] value through the call path; there is no
//!  thread-local state.

pub mod catalog;
pub mod context;
pub mod dispatcher;
