//! Workflow abstractions and types
//!
//! This module contains the workflow-facing primitives:
//! - [`Workflow`] trait for defining durable workflow bodies
//! - [`WorkflowError`] for failures raised by workflow code
//! - [`DurableError`] for everything a context operation can return

mod definition;
mod error;

pub use definition::{Workflow, WorkflowError};
pub use error::{error_codes, DurableError};
