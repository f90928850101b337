use super::{Vertex, VertexDefinition};
use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use evalexpr::{ContextWithMutableVariables, DefaultNumericTypes, HashMapContext, eval_with_context};
use serde_json::{Value, json};
use tracing::debug;

#[derive(Debug)]
pub struct IdentityVertex;

pub struct IdentityDefinition;

impl VertexDefinition for IdentityDefinition {
    fn name(&self) -> &str {
        "identity"
    }

    fn prepare(&self, _params: Value) -> Result<Box<dyn Vertex>> {
        Ok(Box::new(IdentityVertex))
    }
}

#[async_trait]
impl Vertex for IdentityVertex {
    async fn process(&mut self, input: Value) -> Result<Vec<Value>> {
        Ok(vec![input])
    }
}

/// Emits every numeric input multiplied by two.
#[derive(Debug)]
pub struct DoubleVertex;

pub struct DoubleDefinition;

impl VertexDefinition for DoubleDefinition {
    fn name(&self) -> &str {
        "double"
    }

    fn prepare(&self, _params: Value) -> Result<Box<dyn Vertex>> {
        Ok(Box::new(DoubleVertex))
    }
}

#[async_trait]
impl Vertex for DoubleVertex {
    async fn process(&mut self, input: Value) -> Result<Vec<Value>> {
        if let Some(doubled) = input.as_i64().and_then(|i| i.checked_mul(2)) {
            return Ok(vec![json!(doubled)]);
        }
        let n = as_number(&input)?;
        Ok(vec![json!(n * 2.0)])
    }
}

/// Emits the mean of every input seen so far.
#[derive(Debug, Default)]
pub struct RunningAverageVertex {
    sum: f64,
    count: u64,
}

pub struct RunningAverageDefinition;

impl VertexDefinition for RunningAverageDefinition {
    fn name(&self) -> &str {
        "running_avg"
    }

    fn prepare(&self, _params: Value) -> Result<Box<dyn Vertex>> {
        Ok(Box::new(RunningAverageVertex::default()))
    }
}

#[async_trait]
impl Vertex for RunningAverageVertex {
    async fn process(&mut self, input: Value) -> Result<Vec<Value>> {
        self.sum += as_number(&input)?;
        self.count += 1;
        Ok(vec![json!(self.sum / self.count as f64)])
    }
}

/// Evaluates `params.expression` with the input bound to `x`.
/// An empty result such as `()` emits nothing.
#[derive(Debug)]
pub struct ExpressionVertex {
    expression: String,
}

pub struct ExpressionDefinition;

impl VertexDefinition for ExpressionDefinition {
    fn name(&self) -> &str {
        "expr"
    }

    fn validate(&self, params: &Value) -> Result<()> {
        match params.get("expression").and_then(|v| v.as_str()) {
            Some(expr) if !expr.trim().is_empty() => Ok(()),
            _ => bail!("expr program requires a non-empty `expression` parameter"),
        }
    }

    fn prepare(&self, params: Value) -> Result<Box<dyn Vertex>> {
        let expression = params
            .get("expression")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("missing `expression`"))?
            .to_string();
        Ok(Box::new(ExpressionVertex { expression }))
    }
}

#[async_trait]
impl Vertex for ExpressionVertex {
    async fn process(&mut self, input: Value) -> Result<Vec<Value>> {
        let mut eval_ctx = HashMapContext::<DefaultNumericTypes>::new();
        let bound = match input {
            Value::String(s) => Some(evalexpr::Value::String(s)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(evalexpr::Value::Int(i))
                } else {
                    n.as_f64().map(evalexpr::Value::Float)
                }
            }
            Value::Bool(b) => Some(evalexpr::Value::Boolean(b)),
            _ => None,
        };
        if let Some(v) = bound {
            eval_ctx
                .set_value("x".to_string(), v)
                .map_err(|e| anyhow!("Failed to bind input: {}", e))?;
        }

        let result = eval_with_context(&self.expression, &eval_ctx)
            .map_err(|e| anyhow!("Expression evaluation failed: {} -> {}", self.expression, e))?;

        let output = match result {
            evalexpr::Value::String(s) => Value::String(s),
            evalexpr::Value::Int(i) => json!(i),
            evalexpr::Value::Float(f) => json!(f),
            evalexpr::Value::Boolean(b) => Value::Bool(b),
            evalexpr::Value::Empty => {
                debug!(expression = %self.expression, "Expression produced no value");
                return Ok(vec![]);
            }
            other => bail!("Unsupported expression result: {:?}", other),
        };
        Ok(vec![output])
    }
}

fn as_number(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| anyhow!("number out of range: {}", n)),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| anyhow!("not a number: {:?}", s)),
        other => Err(anyhow!("not a number: {}", other)),
    }
}
