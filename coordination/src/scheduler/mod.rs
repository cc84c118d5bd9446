// Fleet-wide scheduling primitives built on the lease lifecycle.

pub mod every;
pub mod once;

pub use every::{do_every, EveryOptions, RecurringTask};
pub use once::{do_once, OnceOptions};

/// Metadata key carrying the one-time completion marker.
pub const PROGRESS_KEY: &str = "progress";

/// Marker value recording that the one-time action ran to completion.
/// Written exactly once per target, never cleared.
pub const PROGRESS_DONE: &str = "done";

/// Metadata key carrying the RFC 3339 timestamp of the last recurring run.
pub const LAST_PERFORMED_KEY: &str = "lastPerformed";
