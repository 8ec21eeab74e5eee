// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Workflow definition types: Step/Branch/Loop/Hook data, dual serial/machine
//! parsing, post-parse transforms, and validation (spec §3, §4.K).

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// Closed vocabulary of step type tags.
pub const STEP_TYPES: &[&str] = &[
    "http",
    "script",
    "db",
    "wait",
    "mq",
    "ai",
    "ai_agent",
    "condition",
    "loop",
    "ref_workflow",
];

/// A named, versioned workflow definition. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_hook: Option<Hook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_hook: Option<Hook>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub options: ExecutionOptions,
}

/// A unit of work within a workflow or nested scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub error_policy: ErrorPolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_hook: Option<Hook>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_hook: Option<Hook>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<Branch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(rename = "loop")]
    pub loop_: Option<Loop>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Step>,
}

/// Error policy governing propagation of a step's failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    #[default]
    Abort,
    Continue,
    Skip,
    Retry,
}

/// One branch of a `condition` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub kind: BranchKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    If,
    ElseIf,
    Else,
}

/// Loop configuration for a `loop` step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub mode: LoopMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items_expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_var: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub break_expr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continue_expr: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_max_iterations() -> u64 {
    10_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Count,
    Items,
    Condition,
    While,
}

/// A pre/post hook executed at workflow or step scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    #[serde(rename = "type")]
    pub hook_type: String,
    #[serde(default)]
    pub config: HashMap<String, Value>,
}

/// Execution options attached to a workflow (mode, VU/iteration/stage
/// parameters, thresholds, slave selector).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOptions {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub vus: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub stages: Vec<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u64>,
    #[serde(default = "default_time_unit_ms")]
    pub time_unit_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_allocated_vus: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_vus: Option<u32>,
    #[serde(default = "default_graceful_stop_ms")]
    pub graceful_stop_ms: u64,
    #[serde(default)]
    pub thresholds: HashMap<String, Vec<ThresholdSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slave_selector: Option<SlaveSelector>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            vus: 1,
            iterations: None,
            duration_ms: None,
            stages: Vec::new(),
            rate: None,
            time_unit_ms: default_time_unit_ms(),
            pre_allocated_vus: None,
            max_vus: None,
            graceful_stop_ms: default_graceful_stop_ms(),
            thresholds: HashMap::new(),
            slave_selector: None,
        }
    }
}

fn default_mode() -> String {
    "constant-vus".to_string()
}

fn default_time_unit_ms() -> u64 {
    1_000
}

fn default_graceful_stop_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub duration_ms: u64,
    pub target: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub expression: String,
    #[serde(default)]
    pub abort_on_fail: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SlaveSelector {
    Manual { ids: Vec<String> },
    Label { labels: HashMap<String, String> },
    Capability { capabilities: Vec<String> },
    Auto {
        #[serde(default = "default_min_slaves")]
        min_slaves: usize,
        #[serde(default = "default_max_slaves")]
        max_slaves: usize,
    },
}

fn default_min_slaves() -> usize {
    1
}

fn default_max_slaves() -> usize {
    usize::MAX
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            description: None,
            version: 1,
            pre_hook: None,
            post_hook: None,
            variables: HashMap::new(),
            steps: Vec::new(),
            options: ExecutionOptions::default(),
        }
    }

    /// Parse the human-writable serial form (YAML) and apply post-parse
    /// transforms.
    pub fn parse_serial(text: &str) -> Result<Self> {
        let mut wf: Workflow = serde_yaml::from_str(text)?;
        wf.apply_transforms();
        Ok(wf)
    }

    /// Serialize to the human-writable serial form.
    pub fn to_serial(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| EngineError::serialization(e.to_string()))
    }

    /// Parse the machine form (JSON) and apply post-parse transforms.
    pub fn parse_machine(text: &str) -> Result<Self> {
        let mut wf: Workflow = serde_json::from_str(text)?;
        wf.apply_transforms();
        Ok(wf)
    }

    /// Serialize to the machine form.
    pub fn to_machine(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| EngineError::serialization(e.to_string()))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::parse_serial(yaml)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::parse_machine(json)
    }

    /// Apply the fixed set of post-parse transforms, recursively:
    /// step-type aliases and children-to-loop bridging.
    pub fn apply_transforms(&mut self) {
        for step in &mut self.steps {
            transform_step(step);
        }
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        find_step(&self.steps, id)
    }

    pub fn step_ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        collect_ids(&self.steps, &mut ids);
        ids
    }

    /// Validate the workflow definition (spec §4.K, §8 property 8).
    pub fn validate(&self, require_steps: bool) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("workflow name must not be empty"));
        }
        if require_steps && self.steps.is_empty() {
            return Err(EngineError::validation("workflow has no steps"));
        }
        let mut seen = HashSet::new();
        validate_steps(&self.steps, &mut seen)?;
        Ok(())
    }
}

fn transform_step(step: &mut Step) {
    if step.step_type == "database" {
        step.step_type = "db".to_string();
    }

    if step.step_type == "loop" {
        if let Some(ref mut lp) = step.loop_ {
            if lp.steps.is_empty() && !step.children.is_empty() {
                lp.steps = std::mem::take(&mut step.children);
            }
            for s in &mut lp.steps {
                transform_step(s);
            }
        }
    }

    for branch in &mut step.branches {
        for s in &mut branch.steps {
            transform_step(s);
        }
    }

    for child in &mut step.children {
        transform_step(child);
    }
}

fn find_step<'a>(steps: &'a [Step], id: &str) -> Option<&'a Step> {
    for step in steps {
        if step.id == id {
            return Some(step);
        }
        if let Some(found) = find_step(&step.children, id) {
            return Some(found);
        }
        for branch in &step.branches {
            if let Some(found) = find_step(&branch.steps, id) {
                return Some(found);
            }
        }
        if let Some(ref lp) = step.loop_ {
            if let Some(found) = find_step(&lp.steps, id) {
                return Some(found);
            }
        }
    }
    None
}

fn collect_ids(steps: &[Step], out: &mut Vec<String>) {
    for step in steps {
        out.push(step.id.clone());
        collect_ids(&step.children, out);
        for branch in &step.branches {
            collect_ids(&branch.steps, out);
        }
        if let Some(ref lp) = step.loop_ {
            collect_ids(&lp.steps, out);
        }
    }
}

fn validate_steps(steps: &[Step], seen: &mut HashSet<String>) -> Result<()> {
    for step in steps {
        if step.id.trim().is_empty() {
            return Err(EngineError::validation("step id must not be empty"));
        }
        if !seen.insert(step.id.clone()) {
            return Err(EngineError::validation(format!(
                "duplicate step id: {}",
                step.id
            )));
        }
        if step.name.trim().is_empty() {
            return Err(EngineError::validation(format!(
                "step '{}' must have a non-empty name",
                step.id
            )));
        }
        if !STEP_TYPES.contains(&step.step_type.as_str()) {
            return Err(EngineError::validation(format!(
                "step '{}' has unknown type '{}'",
                step.id, step.step_type
            )));
        }
        validate_step_config(step)?;

        let mut nested_seen = HashSet::new();
        validate_steps(&step.children, &mut nested_seen)?;

        match step.step_type.as_str() {
            "condition" => {
                validate_branches(step)?;
                for branch in &step.branches {
                    let mut branch_seen = HashSet::new();
                    validate_steps(&branch.steps, &mut branch_seen)?;
                }
            }
            "loop" => {
                validate_loop(step)?;
                if let Some(lp) = &step.loop_ {
                    let mut loop_seen = HashSet::new();
                    validate_steps(&lp.steps, &mut loop_seen)?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_step_config(step: &Step) -> Result<()> {
    let cfg = &step.config;
    let require = |key: &str| -> Result<()> {
        if !cfg.contains_key(key) {
            return Err(EngineError::config(
                step.id.clone(),
                format!("missing required field '{}'", key),
            ));
        }
        Ok(())
    };

    match step.step_type.as_str() {
        "http" => {
            require("method")?;
            if !cfg.contains_key("url")
                && !cfg.contains_key("domain")
                && !cfg.contains_key("domainCode")
            {
                return Err(EngineError::config(
                    step.id.clone(),
                    "http step requires one of url/domain/domainCode",
                ));
            }
        }
        "script" => require("script")?,
        "db" => {
            if !cfg.contains_key("database_config") && !cfg.contains_key("datasourceCode") {
                return Err(EngineError::config(
                    step.id.clone(),
                    "db step requires one of database_config/datasourceCode",
                ));
            }
            require("sql")?;
        }
        "wait" => require("duration")?,
        "mq" => {
            require("mq_config")?;
            require("action")?;
        }
        "ai" => {
            require("prompt")?;
            if let Some(Value::Number(n)) = cfg.get("max_tool_rounds") {
                let rounds = n.as_i64().unwrap_or(0);
                if !(1..=50).contains(&rounds) {
                    return Err(EngineError::config(
                        step.id.clone(),
                        "max_tool_rounds must be within [1, 50]",
                    ));
                }
            }
        }
        "ai_agent" => require("prompt")?,
        "ref_workflow" => {
            let wid = cfg.get("workflow_id").and_then(Value::as_i64).unwrap_or(0);
            if wid <= 0 {
                return Err(EngineError::config(
                    step.id.clone(),
                    "ref_workflow step requires a positive integer workflow_id",
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_branches(step: &Step) -> Result<()> {
    if step.branches.is_empty() {
        return Err(EngineError::validation(format!(
            "condition step '{}' must have at least one branch",
            step.id
        )));
    }
    if step.branches[0].kind != BranchKind::If {
        return Err(EngineError::validation(format!(
            "condition step '{}' first branch must be 'if'",
            step.id
        )));
    }
    let mut seen_ids = HashSet::new();
    let mut else_count = 0;
    for (i, branch) in step.branches.iter().enumerate() {
        if !seen_ids.insert(branch.id.clone()) {
            return Err(EngineError::validation(format!(
                "duplicate branch id '{}' in step '{}'",
                branch.id, step.id
            )));
        }
        match branch.kind {
            BranchKind::Else => {
                else_count += 1;
                if i != step.branches.len() - 1 {
                    return Err(EngineError::validation(format!(
                        "'else' branch must be last in step '{}'",
                        step.id
                    )));
                }
            }
            _ => {
                if branch.expression.as_deref().unwrap_or("").trim().is_empty() {
                    return Err(EngineError::validation(format!(
                        "branch '{}' in step '{}' requires a non-empty expression",
                        branch.id, step.id
                    )));
                }
            }
        }
    }
    if else_count > 1 {
        return Err(EngineError::validation(format!(
            "step '{}' may have at most one 'else' branch",
            step.id
        )));
    }
    Ok(())
}

fn validate_loop(step: &Step) -> Result<()> {
    let lp = step.loop_.as_ref().ok_or_else(|| {
        EngineError::validation(format!("loop step '{}' missing loop configuration", step.id))
    })?;
    let has_count = lp.count.unwrap_or(0) > 0;
    let has_items = lp
        .items_expr
        .as_deref()
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    let has_condition = lp
        .condition_expr
        .as_deref()
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if !(has_count || has_items || has_condition) {
        return Err(EngineError::validation(format!(
            "loop step '{}' must specify count, items, or condition",
            step.id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn http_step(id: &str) -> Step {
        let mut config = HashMap::new();
        config.insert("method".to_string(), Value::String("GET".to_string()));
        config.insert("url".to_string(), Value::String("http://example.com".to_string()));
        Step {
            id: id.to_string(),
            name: format!("step {id}"),
            step_type: "http".to_string(),
            config,
            timeout_seconds: None,
            error_policy: ErrorPolicy::Abort,
            pre_hook: None,
            post_hook: None,
            branches: Vec::new(),
            loop_: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_workflow_creation() {
        let workflow = Workflow::new("test-workflow");
        assert_eq!(workflow.name, "test-workflow");
        assert!(workflow.steps.is_empty());
    }

    #[test]
    fn test_serial_round_trip() {
        let yaml = r#"
name: "test-workflow"
steps:
  - id: "step1"
    name: "Fetch"
    type: "http"
    config:
      method: "GET"
      url: "http://example.com"
"#;
        let workflow = Workflow::parse_serial(yaml).unwrap();
        assert_eq!(workflow.name, "test-workflow");
        assert_eq!(workflow.steps.len(), 1);
        assert_eq!(workflow.steps[0].id, "step1");
    }

    #[test]
    fn test_empty_name_fails_validation() {
        let workflow = Workflow::new("");
        assert!(workflow.validate(false).is_err());
    }

    #[test]
    fn test_empty_steps_fails_when_required() {
        let workflow = Workflow::new("test");
        assert!(workflow.validate(true).is_err());
        assert!(workflow.validate(false).is_ok());
    }

    #[test]
    fn test_duplicate_step_id_validation() {
        let mut workflow = Workflow::new("test");
        workflow.steps.push(http_step("step1"));
        workflow.steps.push(http_step("step1"));
        assert!(workflow.validate(true).is_err());
    }

    #[test]
    fn test_http_step_requires_method() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("step1");
        step.config.remove("method");
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_err());
    }

    #[test]
    fn test_condition_step_no_branches_fails() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("cond1");
        step.step_type = "condition".to_string();
        step.config.clear();
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_err());
    }

    #[test]
    fn test_condition_single_if_branch_passes() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("cond1");
        step.step_type = "condition".to_string();
        step.config.clear();
        step.branches.push(Branch {
            id: "b1".to_string(),
            kind: BranchKind::If,
            expression: Some("x > 1".to_string()),
            steps: vec![http_step("inner1")],
        });
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_ok());
    }

    #[test]
    fn test_condition_branch_step_with_invalid_inner_step_fails() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("cond1");
        step.step_type = "condition".to_string();
        step.config.clear();
        let mut bad_inner = http_step("inner1");
        bad_inner.config.remove("method");
        step.branches.push(Branch {
            id: "b1".to_string(),
            kind: BranchKind::If,
            expression: Some("x > 1".to_string()),
            steps: vec![bad_inner],
        });
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_err());
    }

    #[test]
    fn test_loop_step_with_invalid_inner_step_fails() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("loop1");
        step.step_type = "loop".to_string();
        step.config.clear();
        let mut bad_inner = http_step("inner1");
        bad_inner.config.remove("method");
        step.loop_ = Some(Loop {
            mode: LoopMode::Count,
            count: Some(3),
            items_expr: None,
            item_var: None,
            condition_expr: None,
            break_expr: None,
            continue_expr: None,
            max_iterations: 10,
            steps: vec![bad_inner],
        });
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_err());
    }

    #[test]
    fn test_ref_workflow_zero_id_fails() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("ref1");
        step.step_type = "ref_workflow".to_string();
        step.config.clear();
        step.config
            .insert("workflow_id".to_string(), Value::Number(0.into()));
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_err());
    }

    #[test]
    fn test_max_tool_rounds_out_of_range_fails() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("ai1");
        step.step_type = "ai".to_string();
        step.config.clear();
        step.config
            .insert("prompt".to_string(), Value::String("hi".to_string()));
        step.config
            .insert("max_tool_rounds".to_string(), Value::Number(51.into()));
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_err());
    }

    #[test]
    fn test_database_alias_transform() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("db1");
        step.step_type = "database".to_string();
        workflow.steps.push(step);
        workflow.apply_transforms();
        assert_eq!(workflow.steps[0].step_type, "db");
    }

    #[test]
    fn test_children_to_loop_bridging() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("loop1");
        step.step_type = "loop".to_string();
        step.config.clear();
        step.loop_ = Some(Loop {
            mode: LoopMode::Count,
            count: Some(3),
            items_expr: None,
            item_var: None,
            condition_expr: None,
            break_expr: None,
            continue_expr: None,
            max_iterations: 10,
            steps: Vec::new(),
        });
        step.children = vec![http_step("inner1")];
        workflow.steps.push(step);
        workflow.apply_transforms();
        assert_eq!(workflow.steps[0].loop_.as_ref().unwrap().steps.len(), 1);
        assert!(workflow.steps[0].children.is_empty());
    }

    #[test]
    fn test_loop_without_bound_fails() {
        let mut workflow = Workflow::new("test");
        let mut step = http_step("loop1");
        step.step_type = "loop".to_string();
        step.config.clear();
        step.loop_ = Some(Loop {
            mode: LoopMode::Count,
            count: None,
            items_expr: None,
            item_var: None,
            condition_expr: None,
            break_expr: None,
            continue_expr: None,
            max_iterations: 10,
            steps: vec![http_step("inner1")],
        });
        workflow.steps.push(step);
        assert!(workflow.validate(true).is_err());
    }
}
