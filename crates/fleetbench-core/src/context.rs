// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Execution context management for workflows.

use crate::error::{EngineError, Result};
use handlebars::Handlebars;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use parking_lot::RwLock;

/// Execution context for a workflow run.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Input variables provided to the workflow.
    inputs: Arc<RwLock<HashMap<String, Value>>>,

    /// Output values from completed steps.
    outputs: Arc<RwLock<HashMap<String, Value>>>,

    /// Template renderer.
    renderer: Arc<Handlebars<'static>>,

    /// Workflow metadata.
    metadata: Arc<RwLock<HashMap<String, Value>>>,
}

impl ExecutionContext {
    /// Create a new execution context.
    pub fn new(inputs: HashMap<String, Value>) -> Self {
        let mut renderer = Handlebars::new();
        // Disable HTML escaping for LLM prompts
        renderer.register_escape_fn(handlebars::no_escape);

        Self {
            inputs: Arc::new(RwLock::new(inputs)),
            outputs: Arc::new(RwLock::new(HashMap::new())),
            renderer: Arc::new(renderer),
            metadata: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Set an output value for a step.
    pub fn set_output(&self, step_id: impl Into<String>, value: Value) {
        let mut outputs = self.outputs.write();
        outputs.insert(step_id.into(), value);
    }

    /// Get an output value from a step.
    pub fn get_output(&self, step_id: &str) -> Option<Value> {
        let outputs = self.outputs.read();
        outputs.get(step_id).cloned()
    }

    /// Get an input value.
    pub fn get_input(&self, key: &str) -> Option<Value> {
        let inputs = self.inputs.read();
        inputs.get(key).cloned()
    }

    /// Render a template string with the current context.
    pub fn render_template(&self, template: &str) -> Result<String> {
        // Build context data for rendering
        let mut context_data = serde_json::Map::new();

        // Add inputs (flat at root level for backward compatibility)
        let inputs = self.inputs.read();
        for (key, value) in inputs.iter() {
            context_data.insert(key.clone(), value.clone());
        }

        // Add inputs under "inputs" key for explicit access
        if !inputs.is_empty() {
            let inputs_map: serde_json::Map<String, Value> = inputs.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            context_data.insert("inputs".to_string(), Value::Object(inputs_map));
        }

        // Add outputs under both "outputs" and "steps" keys
        let outputs = self.outputs.read();
        if !outputs.is_empty() {
            let mut outputs_map = serde_json::Map::new();
            for (step_id, value) in outputs.iter() {
                outputs_map.insert(step_id.clone(), value.clone());
            }

            // Support both {{outputs.step_id}} (backward compat) and {{steps.step_id.field}} (new)
            context_data.insert("outputs".to_string(), Value::Object(outputs_map.clone()));
            context_data.insert("steps".to_string(), Value::Object(outputs_map));
        }

        // Render template
        self.renderer
            .render_template(template, &Value::Object(context_data))
            .map_err(|e| EngineError::template(e.to_string()))
    }

    /// Evaluate a condition expression.
    pub fn evaluate_condition(&self, condition: &str) -> Result<bool> {
        // For MVP, support simple equality checks
        // e.g., "{{ sentiment }} == 'positive'"
        // Full expression evaluation can be added later

        let rendered = self.render_template(condition)?;
        let trimmed = rendered.trim();

        // Simple boolean evaluation
        match trimmed.to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" | "" => Ok(false),
            _ => {
                // Try to evaluate as equality expression
                if let Some((left, right)) = trimmed.split_once("==") {
                    Ok(left.trim() == right.trim().trim_matches('\'').trim_matches('\"'))
                } else if let Some((left, right)) = trimmed.split_once("!=") {
                    Ok(left.trim() != right.trim().trim_matches('\'').trim_matches('\"'))
                } else {
                    // Treat non-empty string as true
                    Ok(!trimmed.is_empty())
                }
            }
        }
    }

    /// Set metadata value.
    pub fn set_metadata(&self, key: impl Into<String>, value: Value) {
        let mut metadata = self.metadata.write();
        metadata.insert(key.into(), value);
    }

    /// Get metadata value.
    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        let metadata = self.metadata.read();
        metadata.get(key).cloned()
    }

    /// Get all outputs.
    pub fn all_outputs(&self) -> HashMap<String, Value> {
        self.outputs.read().clone()
    }

    /// Get all inputs.
    pub fn all_inputs(&self) -> HashMap<String, Value> {
        self.inputs.read().clone()
    }

    /// Clear all outputs (useful for testing).
    #[cfg(test)]
    pub fn clear_outputs(&self) {
        let mut outputs = self.outputs.write();
        outputs.clear();
    }

    /// Inject `__step_result`/`__step_error` for a post-hook (spec §4.N).
    pub fn set_step_hook_vars(&self, result: Option<Value>, error: Option<String>) {
        self.set_metadata("__step_result", result.unwrap_or(Value::Null));
        self.set_metadata(
            "__step_error",
            error.map(Value::String).unwrap_or(Value::Null),
        );
    }

    /// Inject `__workflow_error` for a workflow-level post-hook (spec §4.N).
    pub fn set_workflow_error(&self, error: Option<String>) {
        self.set_metadata(
            "__workflow_error",
            error.map(Value::String).unwrap_or(Value::Null),
        );
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}
