//! Graph traversal: scheduling, edge-value state, and node dispatch.
//!
//! Three layers, bottom up:
//!
//! - [`TraversalState`]: per-port value queues and constants.
//! - [`TraversalMachine`]: the opportunity-queue scheduler deciding which
//!   node fires (or skips) next.
//! - [`Scope`]: one graph invocation, dispatching scheduled nodes to
//!   handlers and translating progress into run events.

mod machine;
mod scope;
mod state;

pub use machine::{TraversalMachine, TraversalResult};
pub use scope::{Probe, Scope, ScopeError};
pub use state::TraversalState;
