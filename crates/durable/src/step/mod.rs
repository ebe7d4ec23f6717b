//! Step execution
//!
//! Steps are named, at-most-once side effects inside an invocation. The first
//! call for a name runs the action and journals its outcome; every later call
//! for the same name (in this attempt or any replay) returns the journaled
//! outcome without running the action again.

mod definition;
mod executor;

pub use definition::{ActionError, StepOutcome};
