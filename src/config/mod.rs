//! Configuration parsing and types.
//!
//! - `node` - Per-node config (`NodeConfig`, `Role`, policies)
//! - `manifest` - Service manifests (`ServiceManifest`, `Language`)
//! - `duration` - Human-readable duration strings
//! - `parser` - YAML loading and manifest discovery

mod duration;
mod manifest;
mod node;
mod parser;

pub use duration::*;
pub use manifest::*;
pub use node::*;
pub use parser::*;
