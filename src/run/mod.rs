//! Observing and driving board runs.
//!
//! [`LocalRunner`] executes a board in-process; [`EventStream`] is the pull
//! side of any run, local or remote, delivering [`RunEvent`]s in order.

mod events;
mod local;

pub use events::{
    AbortSignal, EmitError, ErrorEvent, EventEmitter, EventStream, GraphLifecycle, InputRequest,
    InputResponder, NodeEndEvent, NodeStartEvent, OutputEvent, RunEvent, SecretRequest, SkipEvent,
};
pub use local::{LocalRunner, RunnerError};
