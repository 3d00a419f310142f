//! Session layer for an SRT media ingest/egress server.
//!
//! The listener accepts raw handshakes from the transport and offers each
//! one to a freshly spawned [Session]. The session authenticates the request
//! against the path routing authority, decides accept/reject through a
//! two-phase handoff, and then bridges the established connection to the
//! in-process stream fan-out: publishers demux the inbound container stream
//! into a path's [Stream], readers mux it back out through a bounded write
//! queue.

mod async_writer;
mod config;
mod container;
mod error;
mod hooks;
mod path;
mod publish;
mod read;
mod server;
mod session;
mod stream;
mod stream_id;
pub mod transport;

pub use async_writer::*;
pub use config::*;
pub use container::*;
pub use error::*;
pub use hooks::*;
pub use path::*;
pub use server::*;
pub use session::*;
pub use stream::*;
pub use stream_id::*;
