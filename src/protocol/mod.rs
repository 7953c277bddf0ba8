//! Control protocol shared by every node role and the CLI.
//!
//! - `message` - Request/response types and service records
//! - `transport` - Framed TCP server and client

mod message;
mod transport;

pub use message::*;
pub use transport::*;
