//! WebSocket status stream.
//!
//! Operators connect to `/ws` and receive every session report as it is
//! published, plus answers to on-demand queries. The stream is read-only;
//! changes go through the HTTP endpoints.

mod handler;
mod protocol;

pub use handler::routes;
pub use protocol::*;
