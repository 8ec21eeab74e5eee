// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Reference resolver: inlining of sub-workflow references with cycle
//! detection (spec §4.L).

use crate::error::{EngineError, Result};
use crate::workflow::{Step, Workflow};
use serde_json::Value;
use std::collections::HashSet;

/// External collaborator resolving a workflow id to its name and machine-form
/// JSON definition.
pub trait WorkflowLoader: Send + Sync {
    fn load(&self, id: i64) -> Result<(String, String)>;
}

/// Resolves every `ref_workflow` step in `workflow` by inlining the
/// referenced workflow's steps under `workflow_definition`, recursively.
///
/// Cycle detection uses a visited set that is *copied* to each sibling scope
/// rather than shared, so a workflow may legally be referenced from sibling
/// branches but never along an ancestor chain (spec §9 "Cyclic graphs").
pub struct ReferenceResolver<'a> {
    loader: &'a dyn WorkflowLoader,
}

impl<'a> ReferenceResolver<'a> {
    pub fn new(loader: &'a dyn WorkflowLoader) -> Self {
        Self { loader }
    }

    pub fn resolve(&self, workflow: &mut Workflow) -> Result<()> {
        let mut visited = HashSet::new();
        if workflow.id != 0 {
            visited.insert(workflow.id);
        }
        resolve_steps(self.loader, &mut workflow.steps, &visited)
    }
}

fn resolve_steps(
    loader: &dyn WorkflowLoader,
    steps: &mut [Step],
    visited: &HashSet<i64>,
) -> Result<()> {
    for step in steps.iter_mut() {
        if step.step_type == "ref_workflow" {
            resolve_ref_step(loader, step, visited)?;
        }

        // copy-on-branch: each branch/child/loop scope gets its own copy of
        // the visited set, so siblings don't poison each other.
        resolve_steps(loader, &mut step.children, &visited.clone())?;
        for branch in &mut step.branches {
            resolve_steps(loader, &mut branch.steps, &visited.clone())?;
        }
        if let Some(ref mut lp) = step.loop_ {
            resolve_steps(loader, &mut lp.steps, &visited.clone())?;
        }
    }
    Ok(())
}

fn resolve_ref_step(
    loader: &dyn WorkflowLoader,
    step: &mut Step,
    visited: &HashSet<i64>,
) -> Result<()> {
    let workflow_id = step
        .config
        .get("workflow_id")
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            EngineError::config(step.id.clone(), "ref_workflow step missing workflow_id")
        })?;

    if visited.contains(&workflow_id) {
        return Err(EngineError::CycleError(format!(
            "cycle detected resolving workflow reference {} from step '{}'",
            workflow_id, step.id
        )));
    }

    let (name, definition) = loader
        .load(workflow_id)
        .map_err(|_| EngineError::config(step.id.clone(), "failed to load referenced workflow"))?;

    let mut target = Workflow::parse_machine(&definition)?;
    target.id = workflow_id;

    let mut nested_visited = visited.clone();
    nested_visited.insert(workflow_id);
    resolve_steps(loader, &mut target.steps, &nested_visited)?;

    let steps_value = serde_json::to_value(&target.steps)?;
    let variables_value = serde_json::to_value(&target.variables)?;

    let mut definition_obj = serde_json::Map::new();
    definition_obj.insert("steps".to_string(), steps_value);
    definition_obj.insert("variables".to_string(), variables_value);
    definition_obj.insert("workflow_name".to_string(), Value::String(name));

    step.config
        .insert("workflow_definition".to_string(), Value::Object(definition_obj));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::Workflow;
    use std::collections::HashMap as StdHashMap;
    use std::sync::Mutex;

    struct MapLoader {
        definitions: Mutex<StdHashMap<i64, (String, String)>>,
    }

    impl MapLoader {
        fn new(entries: Vec<(i64, &str, Workflow)>) -> Self {
            let mut definitions = StdHashMap::new();
            for (id, name, wf) in entries {
                definitions.insert(id, (name.to_string(), wf.to_machine().unwrap()));
            }
            Self {
                definitions: Mutex::new(definitions),
            }
        }
    }

    impl WorkflowLoader for MapLoader {
        fn load(&self, id: i64) -> Result<(String, String)> {
            self.definitions
                .lock()
                .unwrap()
                .get(&id)
                .cloned()
                .ok_or_else(|| EngineError::other("not found"))
        }
    }

    fn ref_step(id: &str, target: i64) -> Step {
        let mut config = StdHashMap::new();
        config.insert("workflow_id".to_string(), Value::Number(target.into()));
        Step {
            id: id.to_string(),
            name: "ref".to_string(),
            step_type: "ref_workflow".to_string(),
            config,
            timeout_seconds: None,
            error_policy: Default::default(),
            pre_hook: None,
            post_hook: None,
            branches: Vec::new(),
            loop_: None,
            children: Vec::new(),
        }
    }

    fn wait_step(id: &str) -> Step {
        let mut config = StdHashMap::new();
        config.insert("duration".to_string(), Value::String("1ms".to_string()));
        Step {
            id: id.to_string(),
            name: "wait".to_string(),
            step_type: "wait".to_string(),
            config,
            timeout_seconds: None,
            error_policy: Default::default(),
            pre_hook: None,
            post_hook: None,
            branches: Vec::new(),
            loop_: None,
            children: Vec::new(),
        }
    }

    #[test]
    fn test_resolves_reference_inlining_steps() {
        let mut w2 = Workflow::new("W2");
        w2.id = 2;
        w2.steps = vec![wait_step("s1"), wait_step("s2")];

        let loader = MapLoader::new(vec![(2, "W2", w2)]);

        let mut w1 = Workflow::new("W1");
        w1.id = 1;
        w1.steps = vec![ref_step("ref1", 2)];

        let resolver = ReferenceResolver::new(&loader);
        resolver.resolve(&mut w1).unwrap();

        let def = w1.steps[0].config.get("workflow_definition").unwrap();
        assert_eq!(def.get("workflow_name").unwrap(), "W2");
        assert_eq!(def.get("steps").unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_cycle_detection() {
        let mut wa = Workflow::new("A");
        wa.id = 1;
        wa.steps = vec![ref_step("toB", 2)];

        let mut wb = Workflow::new("B");
        wb.id = 2;
        wb.steps = vec![ref_step("toA", 1)];

        let loader = MapLoader::new(vec![(1, "A", wa.clone()), (2, "B", wb)]);

        let resolver = ReferenceResolver::new(&loader);
        let mut wa_mut = wa;
        let err = resolver.resolve(&mut wa_mut).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "expected cycle message, got: {msg}");
    }

    #[test]
    fn test_sibling_reference_is_not_a_cycle() {
        // A references B twice from sibling scopes; this must not be treated
        // as a cycle since the visited set is copied per scope, not shared.
        let mut wb = Workflow::new("B");
        wb.id = 2;
        wb.steps = vec![wait_step("b1")];

        let loader = MapLoader::new(vec![(2, "B", wb)]);

        let mut wa = Workflow::new("A");
        wa.id = 1;
        let mut branch_step = ref_step("cond_ref", 2);
        branch_step.id = "cond_ref".to_string();
        wa.steps = vec![ref_step("ref_a", 2)];

        let resolver = ReferenceResolver::new(&loader);
        resolver.resolve(&mut wa).unwrap();
        assert!(wa.steps[0].config.contains_key("workflow_definition"));
    }
}
