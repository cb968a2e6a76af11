use std::collections::{BTreeSet, HashMap, HashSet};

use maestro_core::error::ValidationError;
use maestro_core::types::{StepType, WorkflowStep};

use crate::control::StepSpec;

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

fn valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// A validated workflow DAG.
///
/// Edges run from a step to each entry of its `depends_on`. Steps listed as
/// children of a LOOP or PARALLEL step are owned by that parent: the parent
/// runs them, so they never appear in the ready set.
#[derive(Debug, Clone)]
pub struct StepGraph {
    steps: Vec<WorkflowStep>,
    specs: Vec<StepSpec>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
    owner: HashMap<String, String>,
}

impl StepGraph {
    pub fn build(steps: &[WorkflowStep]) -> Result<Self, ValidationError> {
        let mut index = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if !valid_key(&step.step_key) {
                return Err(ValidationError::InvalidStepKey(step.step_key.clone()));
            }
            if index.insert(step.step_key.clone(), i).is_some() {
                return Err(ValidationError::DuplicateKey(step.step_key.clone()));
            }
            if step.timeout_ms == 0 {
                return Err(ValidationError::InvalidTimeout(step.step_key.clone()));
            }
            if step.step_type == StepType::Agent
                && step.agent_id.as_deref().map_or(true, str::is_empty)
            {
                return Err(ValidationError::MissingAgent(step.step_key.clone()));
            }
        }

        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in steps {
            for dep in &step.depends_on {
                if !index.contains_key(dep) {
                    return Err(ValidationError::UnknownDependency {
                        step: step.step_key.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.step_key.clone());
            }
        }

        let mut graph = Self {
            steps: steps.to_vec(),
            specs: Vec::with_capacity(steps.len()),
            index,
            dependents,
            owner: HashMap::new(),
        };
        graph.check_acyclic()?;

        for step in steps {
            graph.specs.push(StepSpec::parse(step)?);
        }
        graph.owner = graph.assign_owners()?;
        Ok(graph)
    }

    /// DFS with white/grey/black coloring; reports the first cycle found.
    fn check_acyclic(&self) -> Result<(), ValidationError> {
        let mut colors = vec![Color::White; self.steps.len()];
        let mut stack = Vec::new();
        for i in 0..self.steps.len() {
            if colors[i] == Color::White {
                self.visit(i, &mut colors, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        i: usize,
        colors: &mut [Color],
        stack: &mut Vec<usize>,
    ) -> Result<(), ValidationError> {
        colors[i] = Color::Grey;
        stack.push(i);
        for dep in &self.steps[i].depends_on {
            let j = self.index[dep];
            match colors[j] {
                Color::Grey => {
                    let start = stack.iter().position(|&s| s == j).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..]
                        .iter()
                        .map(|&s| self.steps[s].step_key.clone())
                        .collect();
                    path.push(self.steps[j].step_key.clone());
                    return Err(ValidationError::Cycle { path });
                }
                Color::White => self.visit(j, colors, stack)?,
                Color::Black => {}
            }
        }
        stack.pop();
        colors[i] = Color::Black;
        Ok(())
    }

    /// Check CONDITION branches and LOOP/PARALLEL children; returns the
    /// child -> parent map.
    fn assign_owners(&self) -> Result<HashMap<String, String>, ValidationError> {
        let invalid = |step: &WorkflowStep, reason: String| ValidationError::InvalidControlStep {
            step: step.step_key.clone(),
            step_type: step.step_type.to_string(),
            reason,
        };
        let mut owner: HashMap<String, String> = HashMap::new();

        for (i, step) in self.steps.iter().enumerate() {
            if let Some((on_true, on_false)) = self.specs[i].branches() {
                for key in on_true.iter().chain(on_false) {
                    let Some(target) = self.step(key) else {
                        return Err(invalid(step, format!("unknown branch step '{}'", key)));
                    };
                    if !target.depends_on.contains(&step.step_key) {
                        return Err(invalid(
                            step,
                            format!("branch step '{}' must depend on '{}'", key, step.step_key),
                        ));
                    }
                }
            }

            for child in self.specs[i].children() {
                let Some(target) = self.step(child) else {
                    return Err(invalid(step, format!("unknown child step '{}'", child)));
                };
                if target.step_type != StepType::Agent {
                    return Err(invalid(step, format!("child step '{}' must be an AGENT step", child)));
                }
                if let Some(previous) = owner.insert(child.clone(), step.step_key.clone()) {
                    return Err(invalid(
                        step,
                        format!("child step '{}' is already owned by '{}'", child, previous),
                    ));
                }
                let allowed = self.ancestors(&step.step_key);
                if let Some(dep) = target
                    .depends_on
                    .iter()
                    .find(|d| **d != step.step_key && !allowed.contains(d.as_str()))
                {
                    return Err(invalid(
                        step,
                        format!("child step '{}' depends on '{}' outside its parent", child, dep),
                    ));
                }
            }
        }

        for (i, step) in self.steps.iter().enumerate() {
            if let Some((on_true, on_false)) = self.specs[i].branches() {
                if let Some(key) = on_true.iter().chain(on_false).find(|k| owner.contains_key(*k)) {
                    return Err(invalid(
                        step,
                        format!("branch step '{}' is run by '{}'", key, owner[key]),
                    ));
                }
            }
        }

        for step in &self.steps {
            if owner.contains_key(&step.step_key) {
                continue;
            }
            if let Some(dep) = step.depends_on.iter().find(|d| owner.contains_key(*d)) {
                return Err(invalid(
                    step,
                    format!("depends on '{}', which is run by '{}'", dep, owner[dep]),
                ));
            }
        }
        Ok(owner)
    }

    /// Every step reachable through `depends_on` from `key`.
    pub fn ancestors(&self, key: &str) -> HashSet<&str> {
        let mut seen = HashSet::new();
        let mut queue: Vec<&str> = vec![key];
        while let Some(current) = queue.pop() {
            if let Some(step) = self.step(current) {
                for dep in &step.depends_on {
                    if seen.insert(dep.as_str()) {
                        queue.push(dep);
                    }
                }
            }
        }
        seen
    }

    /// Top-level steps not yet started whose dependencies are all satisfied.
    ///
    /// `completed` should include SKIPPED steps; a skipped dependency does not
    /// block a join.
    pub fn ready_set(
        &self,
        completed: &HashSet<String>,
        failed_tolerated: &HashSet<String>,
        started: &HashSet<String>,
    ) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter(|s| !self.owner.contains_key(&s.step_key) && !started.contains(&s.step_key))
            .filter(|s| {
                s.depends_on
                    .iter()
                    .all(|d| completed.contains(d) || failed_tolerated.contains(d))
            })
            .map(|s| s.step_key.clone())
            .collect()
    }

    /// Not-started top-level steps whose dependencies are all SKIPPED,
    /// propagated to a fix-point. Returns only the newly skipped keys.
    pub fn skip_cascade(&self, skipped: &HashSet<String>, started: &HashSet<String>) -> BTreeSet<String> {
        let mut cascade = BTreeSet::new();
        loop {
            let before = cascade.len();
            for step in &self.steps {
                let key = &step.step_key;
                if step.depends_on.is_empty()
                    || self.owner.contains_key(key)
                    || started.contains(key)
                    || skipped.contains(key)
                    || cascade.contains(key)
                {
                    continue;
                }
                if step
                    .depends_on
                    .iter()
                    .all(|d| skipped.contains(d) || cascade.contains(d))
                {
                    cascade.insert(key.clone());
                }
            }
            if cascade.len() == before {
                return cascade;
            }
        }
    }

    /// Kahn's algorithm; ties broken by position, then authoring order.
    pub fn topological_order(&self) -> Vec<String> {
        let mut remaining: Vec<usize> = self.steps.iter().map(|s| s.depends_on.len()).collect();
        let mut order = Vec::with_capacity(self.steps.len());
        let mut ready: BTreeSet<(u32, usize)> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(i, _)| remaining[*i] == 0)
            .map(|(i, s)| (s.position, i))
            .collect();

        while let Some(next) = ready.pop_first() {
            let (_, i) = next;
            let key = &self.steps[i].step_key;
            order.push(key.clone());
            for dependent in self.dependents(key) {
                let j = self.index[dependent];
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    ready.insert((self.steps[j].position, j));
                }
            }
        }
        order
    }

    pub fn dependents(&self, key: &str) -> &[String] {
        self.dependents.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn step(&self, key: &str) -> Option<&WorkflowStep> {
        self.index.get(key).map(|&i| &self.steps[i])
    }

    pub fn spec(&self, key: &str) -> Option<&StepSpec> {
        self.index.get(key).map(|&i| &self.specs[i])
    }

    /// Children run by a LOOP or PARALLEL step; empty for other types.
    pub fn children(&self, key: &str) -> &[String] {
        self.spec(key).map(StepSpec::children).unwrap_or(&[])
    }

    /// The LOOP/PARALLEL step that runs `key`, if any.
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.owner.get(key).map(String::as_str)
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maestro_core::types::OnError;
    use serde_json::json;

    fn agent(key: &str, deps: &[&str]) -> WorkflowStep {
        WorkflowStep::agent(key, "worker").with_depends_on(deps)
    }

    fn set(keys: &[&str]) -> HashSet<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    fn keys(set: BTreeSet<String>) -> Vec<String> {
        set.into_iter().collect()
    }

    #[test]
    fn test_diamond_builds() {
        let graph = StepGraph::build(&[
            agent("a", &[]),
            agent("b", &["a"]),
            agent("c", &["a"]),
            agent("d", &["b", "c"]),
        ])
        .unwrap();
        assert_eq!(graph.len(), 4);
        assert_eq!(graph.topological_order(), vec!["a", "b", "c", "d"]);
        assert_eq!(graph.dependents("a"), &["b".to_string(), "c".to_string()]);
        assert!(graph.dependents("d").is_empty());
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = StepGraph::build(&[agent("a", &["c"]), agent("b", &["a"]), agent("c", &["b"])])
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::Cycle {
                path: vec!["a".into(), "c".into(), "b".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let err = StepGraph::build(&[agent("a", &["a"])]).unwrap_err();
        assert!(matches!(err, ValidationError::Cycle { .. }));
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(
            StepGraph::build(&[agent("a", &["ghost"])]).unwrap_err(),
            ValidationError::UnknownDependency {
                step: "a".into(),
                dependency: "ghost".into()
            }
        );
        assert_eq!(
            StepGraph::build(&[agent("a", &[]), agent("a", &[])]).unwrap_err(),
            ValidationError::DuplicateKey("a".into())
        );
        assert_eq!(
            StepGraph::build(&[agent("bad key", &[])]).unwrap_err(),
            ValidationError::InvalidStepKey("bad key".into())
        );
        assert_eq!(
            StepGraph::build(&[WorkflowStep::control("x", StepType::Agent)]).unwrap_err(),
            ValidationError::MissingAgent("x".into())
        );
        assert_eq!(
            StepGraph::build(&[agent("a", &[]).with_timeout_ms(0)]).unwrap_err(),
            ValidationError::InvalidTimeout("a".into())
        );
    }

    #[test]
    fn test_ready_set_respects_tolerated_failures() {
        let graph = StepGraph::build(&[
            agent("a", &[]).with_on_error(OnError::Continue),
            agent("b", &["a"]),
            agent("c", &[]),
        ])
        .unwrap();

        let none = set(&[]);
        assert_eq!(keys(graph.ready_set(&none, &none, &none)), vec!["a", "c"]);
        assert_eq!(keys(graph.ready_set(&none, &none, &set(&["a", "c"]))), Vec::<String>::new());
        assert_eq!(
            keys(graph.ready_set(&set(&["c"]), &set(&["a"]), &set(&["a", "c"]))),
            vec!["b"]
        );
    }

    fn condition_graph() -> StepGraph {
        StepGraph::build(&[
            WorkflowStep::control("check", StepType::Condition).with_config(json!({
                "expression": "input.amount > 100",
                "trueBranch": ["approve"],
                "falseBranch": ["reject"]
            })),
            agent("approve", &["check"]),
            agent("reject", &["check"]),
            agent("notify", &["reject"]),
            agent("join", &["approve", "reject"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_skip_cascade_stops_at_joins() {
        let graph = condition_graph();
        let cascade = graph.skip_cascade(&set(&["reject"]), &set(&["check", "approve"]));
        assert_eq!(keys(cascade), vec!["notify"]);

        let satisfied = set(&["check", "approve", "reject", "notify"]);
        let ready = graph.ready_set(&satisfied, &set(&[]), &set(&["check", "approve", "reject", "notify"]));
        assert_eq!(keys(ready), vec!["join"]);
    }

    #[test]
    fn test_skip_cascade_is_transitive() {
        let graph = condition_graph();
        let cascade = graph.skip_cascade(&set(&["approve", "reject"]), &set(&["check"]));
        assert_eq!(keys(cascade), vec!["join", "notify"]);
    }

    #[test]
    fn test_branch_must_depend_on_condition() {
        let err = StepGraph::build(&[
            WorkflowStep::control("check", StepType::Condition)
                .with_config(json!({ "expression": "input.ok", "trueBranch": ["go"] })),
            agent("go", &[]),
        ])
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidControlStep { ref step, .. } if step == "check"));
    }

    #[test]
    fn test_branch_step_cannot_be_a_loop_child() {
        let err = StepGraph::build(&[
            WorkflowStep::control("c", StepType::Condition)
                .with_config(json!({ "expression": "input.go", "trueBranch": ["x"] })),
            WorkflowStep::control("l", StepType::Loop)
                .with_depends_on(&["c"])
                .with_config(json!({ "items": [1, 2], "children": ["x"] })),
            agent("x", &["c"]),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InvalidControlStep { ref step, ref reason, .. }
                if step == "c" && reason.contains("'x' is run by 'l'")
        ));
    }

    #[test]
    fn test_children_are_owned_and_hidden_from_ready_set() {
        let graph = StepGraph::build(&[
            agent("fetch", &[]),
            WorkflowStep::control("fan", StepType::Parallel)
                .with_depends_on(&["fetch"])
                .with_config(json!({ "children": ["x", "y"] })),
            agent("x", &["fetch"]),
            agent("y", &[]),
            agent("after", &["fan"]),
        ])
        .unwrap();

        assert_eq!(graph.children("fan"), &["x".to_string(), "y".to_string()]);
        assert_eq!(graph.owner("y"), Some("fan"));
        let none = set(&[]);
        assert_eq!(keys(graph.ready_set(&none, &none, &none)), vec!["fetch"]);
        assert_eq!(
            keys(graph.ready_set(&set(&["fetch"]), &none, &set(&["fetch"]))),
            vec!["fan"]
        );
    }

    #[test]
    fn test_child_rules() {
        let shared = StepGraph::build(&[
            WorkflowStep::control("p1", StepType::Parallel).with_config(json!({ "children": ["x"] })),
            WorkflowStep::control("p2", StepType::Parallel).with_config(json!({ "children": ["x"] })),
            agent("x", &[]),
        ]);
        assert!(matches!(shared, Err(ValidationError::InvalidControlStep { .. })));

        let outside_dep = StepGraph::build(&[
            agent("other", &[]),
            WorkflowStep::control("p", StepType::Parallel).with_config(json!({ "children": ["x"] })),
            agent("x", &["other"]),
        ]);
        assert!(matches!(outside_dep, Err(ValidationError::InvalidControlStep { .. })));

        let depends_on_child = StepGraph::build(&[
            WorkflowStep::control("p", StepType::Parallel).with_config(json!({ "children": ["x"] })),
            agent("x", &[]),
            agent("z", &["x"]),
        ]);
        assert!(matches!(
            depends_on_child,
            Err(ValidationError::InvalidControlStep { ref step, .. }) if step == "z"
        ));
    }

    #[test]
    fn test_topological_order_uses_position() {
        let graph = StepGraph::build(&[
            agent("late", &[]).with_position(5),
            agent("early", &[]).with_position(1),
            agent("end", &["late", "early"]).with_position(0),
        ])
        .unwrap();
        assert_eq!(graph.topological_order(), vec!["early", "late", "end"]);
    }
}
