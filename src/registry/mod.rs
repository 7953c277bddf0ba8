//! Registry of the services and subordinate nodes attached to a node.
//!
//! - `record` - Registry slots and fingerprints
//! - `probe` - Liveness probing of a slot's current holder
//! - `table` - The [`Registry`] itself

mod probe;
mod record;
mod table;

pub use probe::*;
pub use record::*;
pub use table::*;
