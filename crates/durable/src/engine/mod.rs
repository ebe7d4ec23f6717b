//! Workflow execution engine
//!
//! The engine module provides the `WorkflowDriver`, which runs invocations
//! by replaying their journals, the registration table it dispatches
//! through, and the failure classifier it consults.

mod classifier;
mod driver;
mod registry;

pub use classifier::{FailureClass, FailureClassifier, UserErrorPolicy};
pub use driver::{
    DriverConfig, DriverError, InvocationOutcome, InvocationReport, WorkflowDriver,
};
pub use registry::{AnyWorkflow, RegistryError, WorkflowFactory, WorkflowRegistry};
