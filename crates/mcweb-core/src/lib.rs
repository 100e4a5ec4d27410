//! Process supervision for game servers living in plain folders.
//!
//! A [`Supervisor`] owns the [`ServerRegistry`] (every instance found under
//! the configured roots) and the [`RunningSet`] (the ones with a live
//! process). Request handlers resolve a [`Requester`] through an
//! [`IdentityResolver`] and call into the supervisor; it never blocks them on
//! log I/O.

pub mod config;
pub mod error;
pub mod identity;
pub mod log_tail;
pub mod record;
pub mod registry;
pub mod running;
pub mod supervisor;

pub use config::SupervisorConfig;
pub use error::{ErrorPayload, SupervisorError};
pub use identity::{IdentityResolver, Requester};
pub use record::{ServerRecord, ServerSnapshot};
pub use registry::ServerRegistry;
pub use running::RunningSet;
pub use supervisor::{Started, Supervisor};
