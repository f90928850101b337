use crate::protocol::{Assignment, TaskUid};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

pub mod builtin;

/// 计算单元接口：每个任务持有一个 Vertex 实例
/// Each call consumes one input and yields zero or more outputs.
#[async_trait]
pub trait Vertex: Send + Debug {
    async fn process(&mut self, input: Value) -> Result<Vec<Value>>;
}

/// Vertex 工厂
pub trait VertexDefinition: Send + Sync {
    fn name(&self) -> &str;
    fn validate(&self, _params: &Value) -> Result<()> {
        Ok(())
    }
    fn prepare(&self, params: Value) -> Result<Box<dyn Vertex>>;
}

pub const DEFAULT_PROGRAM: &str = "identity";

/// Resolves the program a task runs when it is first assigned to a worker.
pub struct VertexRegistry {
    definitions: HashMap<String, Arc<dyn VertexDefinition>>,
    bindings: HashMap<TaskUid, String>,
    default_program: Option<String>,
}

impl VertexRegistry {
    pub fn new() -> Self {
        Self {
            definitions: HashMap::new(),
            bindings: HashMap::new(),
            default_program: None,
        }
    }

    /// Registry preloaded with the built-in programs, defaulting to `identity`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::IdentityDefinition));
        registry.register(Arc::new(builtin::DoubleDefinition));
        registry.register(Arc::new(builtin::RunningAverageDefinition));
        registry.register(Arc::new(builtin::ExpressionDefinition));
        registry.set_default(DEFAULT_PROGRAM);
        registry
    }

    pub fn register(&mut self, definition: Arc<dyn VertexDefinition>) {
        tracing::debug!("Registered vertex program: {}", definition.name());
        self.definitions.insert(definition.name().to_string(), definition);
    }

    /// Pins `task` to `program`, overriding whatever its assignment names.
    pub fn bind(&mut self, task: TaskUid, program: impl Into<String>) {
        self.bindings.insert(task, program.into());
    }

    pub fn set_default(&mut self, program: impl Into<String>) {
        self.default_program = Some(program.into());
    }

    pub fn has_program(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    pub fn programs(&self) -> Vec<String> {
        let mut names: Vec<String> = self.definitions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Task binding first, then the assignment's program, then the default.
    pub fn program_for<'a>(&'a self, assignment: &'a Assignment) -> Option<&'a str> {
        self.bindings
            .get(&assignment.task_id)
            .map(String::as_str)
            .or(assignment.program.as_deref())
            .or(self.default_program.as_deref())
    }

    pub fn instantiate(&self, assignment: &Assignment) -> Result<Box<dyn Vertex>> {
        let name = self
            .program_for(assignment)
            .ok_or_else(|| anyhow!("No program for task {}", assignment.task_id))?;
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| anyhow!("Vertex program not found: {}", name))?;

        definition.validate(&assignment.params)?;
        definition.prepare(assignment.params.clone())
    }
}

impl Default for VertexRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
