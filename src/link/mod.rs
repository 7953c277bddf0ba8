//! Child-to-parent link: registration, heartbeats and reconnection.
//!
//! - `registration` - Identity granted by the parent and a shared handle to it
//! - `signal` - Single-slot signals that stop heartbeat loops on a shutdown notice
//! - `uplink` - The link itself

mod registration;
mod signal;
mod uplink;

pub use registration::*;
pub use signal::*;
pub use uplink::*;
