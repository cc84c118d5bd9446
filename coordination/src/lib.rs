// Fleet-wide coordination over a shared leased object store.
//
// Any number of independent worker processes point at the same store and
// agree, without a central coordinator, on which single member may perform
// an action. Two primitives are layered on top of the lease lifecycle:
// running an action exactly once across the whole fleet, and running an
// action at most once per interval across the whole fleet.

pub mod config;
pub mod errors;
pub mod lease;
pub mod scheduler;
pub mod store;
pub mod telemetry;
