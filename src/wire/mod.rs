//! The wire layer: everything that crosses a socket, byte for byte.
//!
//! One RPC message unit is an [envelope::Envelope] - all numbers below in the
//!  envelope's outer frame are little endian:
//!
//! ```ascii
//! 0:  correlation id (16 bytes)
//! 16: header block length: u32 LE
//! 20: header block (see below)
//! *:  body length: u32 LE
//! *:  body bytes (opaque at this layer)
//! ```
//!
//! The header block is an insertion-ordered string -> value mapping:
//!
//! ```ascii
//! 0: number of entries (varint)
//! *: (repeated) key (varint length + UTF-8 bytes), value tag (u8), value
//! ```
//!
//! Before any envelope is exchanged on a fresh connection, each side
//!  immediately writes its own [descriptor::ChannelDescriptor] (channel
//!  identity plus advertised addresses), length-prefixed with a u32 LE. The
//!  symmetric write-then-read order means neither side waits for the other
//!  before sending its identity.
//!
//! The body is an opaque byte sequence as far as framing is concerned. The
//!  dispatch layer and the client pipeline agree on [value::Value] /
//!  [value::CallBody] as the one concrete encoding this crate ships; other
//!  encodings can ride the same envelopes.

pub mod correlation_id;
pub mod descriptor;
pub mod envelope;
pub mod header;
pub mod value;
