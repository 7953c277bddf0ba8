//! Process supervision.
//!
//! A [`Supervisor`] owns one external executable: it launches it from a
//! [`LaunchSpec`], observes its exit, and applies the restart policy
//! ([`SupervisorPolicy`]) on unexpected failures.
//!
//! # Example
//!
//! ```no_run
//! use service_hive::service::{LaunchSpec, Supervisor, SupervisorPolicy};
//!
//! # async fn example() -> service_hive::Result<()> {
//! let spec = LaunchSpec::binary("/usr/local/bin/billing", vec!["--verbose".into()]);
//! let billing = Supervisor::new("billing", spec, SupervisorPolicy::default());
//! let pid = billing.start().await?;
//! println!("billing running as {}", pid);
//! billing.kill(true).await?;
//! # Ok(())
//! # }
//! ```

mod launch;
mod process;
mod types;

pub use launch::*;
pub use process::*;
pub use types::*;
