//! Workflow registry for type-erased workflow dispatch
//!
//! An explicit table from workflow type name to factory. The driver looks up
//! the type recorded in an invocation's `InvocationCreated` entry and runs the
//! body with JSON input and output.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::context::InvocationContext;
use crate::workflow::{error_codes, DurableError, Workflow, WorkflowError};

/// Type-erased workflow interface
///
/// This trait allows the driver to work with workflows without knowing
/// their concrete types. Input and output are JSON.
#[async_trait]
pub trait AnyWorkflow: Send + Sync {
    /// Get the workflow type identifier
    fn workflow_type(&self) -> &'static str;

    /// Check that `input` decodes as this workflow's input type
    fn validate_input(&self, input: &Value) -> Result<(), serde_json::Error>;

    /// Run the body against `ctx`
    async fn run_json(
        &self,
        ctx: &mut InvocationContext,
        input: Value,
    ) -> Result<Value, DurableError>;
}

/// Wrapper to implement AnyWorkflow for any Workflow
struct WorkflowWrapper<W: Workflow> {
    inner: W,
}

#[async_trait]
impl<W: Workflow> AnyWorkflow for WorkflowWrapper<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn validate_input(&self, input: &Value) -> Result<(), serde_json::Error> {
        serde_json::from_value::<W::Input>(input.clone()).map(|_| ())
    }

    async fn run_json(
        &self,
        ctx: &mut InvocationContext,
        input: Value,
    ) -> Result<Value, DurableError> {
        let input: W::Input = serde_json::from_value(input).map_err(|e| {
            DurableError::Workflow(
                WorkflowError::new(format!("invalid input for {}: {e}", W::TYPE))
                    .with_code(error_codes::INVALID_INPUT),
            )
        })?;

        let output = self.inner.run(ctx, input).await?;

        serde_json::to_value(output).map_err(|e| {
            DurableError::workflow(format!("output of {} does not serialize: {e}", W::TYPE))
        })
    }
}

/// Factory function type for creating workflow instances
pub type WorkflowFactory = Box<dyn Fn() -> Box<dyn AnyWorkflow> + Send + Sync>;

/// Registry of workflow factories
pub struct WorkflowRegistry {
    factories: HashMap<String, WorkflowFactory>,
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a workflow type with the factory that builds it
    ///
    /// Registering the same type again replaces the earlier factory.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let mut registry = WorkflowRegistry::new();
    /// registry.register(|| GreeterWorkflow::new(notifier.clone(), delay));
    /// ```
    pub fn register<W, F>(&mut self, factory: F)
    where
        W: Workflow,
        F: Fn() -> W + Send + Sync + 'static,
    {
        let factory: WorkflowFactory = Box::new(move || {
            Box::new(WorkflowWrapper { inner: factory() }) as Box<dyn AnyWorkflow>
        });

        self.factories.insert(W::TYPE.to_string(), factory);
    }

    /// Check if a workflow type is registered
    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Create a workflow instance by type name
    pub fn create(&self, workflow_type: &str) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        let factory = self
            .factories
            .get(workflow_type)
            .ok_or_else(|| RegistryError::UnknownWorkflowType(workflow_type.to_string()))?;

        Ok(factory())
    }

    /// Check input for a registered workflow type
    pub fn validate_input(&self, workflow_type: &str, input: &Value) -> Result<(), RegistryError> {
        self.create(workflow_type)?
            .validate_input(input)
            .map_err(RegistryError::Deserialization)
    }

    /// Get the number of registered workflow types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Get all registered workflow type names
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkflowRegistry")
            .field("workflow_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow type not registered
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Failed to deserialize workflow input
    #[error("failed to deserialize workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct TestInput {
        value: i32,
    }

    struct DoublingWorkflow {
        factor: i32,
    }

    #[async_trait]
    impl Workflow for DoublingWorkflow {
        const TYPE: &'static str = "doubling_workflow";
        type Input = TestInput;
        type Output = i32;

        async fn run(
            &self,
            _ctx: &mut InvocationContext,
            input: Self::Input,
        ) -> Result<Self::Output, DurableError> {
            Ok(input.value * self.factor)
        }
    }

    #[test]
    fn test_register_and_create() {
        let mut registry = WorkflowRegistry::new();
        registry.register(|| DoublingWorkflow { factor: 2 });

        assert!(registry.contains("doubling_workflow"));
        assert!(!registry.contains("unknown"));
        assert_eq!(registry.len(), 1);

        let workflow = registry
            .create("doubling_workflow")
            .expect("should create workflow");
        assert_eq!(workflow.workflow_type(), "doubling_workflow");
    }

    #[test]
    fn test_unknown_workflow_type() {
        let registry = WorkflowRegistry::new();
        assert!(registry.is_empty());

        let result = registry.create("unknown");
        assert!(matches!(result, Err(RegistryError::UnknownWorkflowType(_))));
    }

    #[test]
    fn test_invalid_input() {
        let mut registry = WorkflowRegistry::new();
        registry.register(|| DoublingWorkflow { factor: 2 });

        // Missing required field
        let result = registry.validate_input("doubling_workflow", &serde_json::json!({}));
        assert!(matches!(result, Err(RegistryError::Deserialization(_))));

        registry
            .validate_input("doubling_workflow", &serde_json::json!({ "value": 1 }))
            .unwrap();
    }

    #[test]
    fn test_registry_debug() {
        let mut registry = WorkflowRegistry::new();
        registry.register(|| DoublingWorkflow { factor: 2 });

        let debug_str = format!("{:?}", registry);
        assert!(debug_str.contains("doubling_workflow"));
    }

    #[test]
    fn test_workflow_types_iterator() {
        let mut registry = WorkflowRegistry::new();
        registry.register(|| DoublingWorkflow { factor: 3 });

        let types: Vec<_> = registry.workflow_types().collect();
        assert_eq!(types, vec!["doubling_workflow"]);
    }
}
