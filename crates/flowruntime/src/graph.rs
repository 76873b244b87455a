use flowcore::template::referenced_steps;
use flowcore::{GraphError, StepId, StepKind, StepSpec, Value};
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Steps grouped into waves. Every step's dependencies live in strictly
/// earlier waves; steps inside one wave are independent of each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutionPlan {
    waves: Vec<Vec<StepId>>,
}

impl ExecutionPlan {
    pub fn waves(&self) -> &[Vec<StepId>] {
        &self.waves
    }

    pub fn into_waves(self) -> Vec<Vec<StepId>> {
        self.waves
    }

    pub fn step_count(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    /// Index of the wave containing `step_id`.
    pub fn wave_of(&self, step_id: &str) -> Option<usize> {
        self.waves
            .iter()
            .position(|wave| wave.iter().any(|id| id == step_id))
    }
}

/// Validate the dependency graph and group steps into waves.
///
/// Within a wave steps keep their declaration order.
pub fn plan_waves(steps: &[StepSpec]) -> Result<ExecutionPlan, GraphError> {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let mut index: HashMap<&str, NodeIndex> = HashMap::new();

    for (position, step) in steps.iter().enumerate() {
        if index.contains_key(step.id.as_str()) {
            return Err(GraphError::DuplicateStep(step.id.clone()));
        }
        index.insert(step.id.as_str(), graph.add_node(position));
    }

    for step in steps {
        let to = index[step.id.as_str()];
        let mut seen = HashSet::new();
        for dep in &step.dependencies {
            if !seen.insert(dep.as_str()) {
                continue;
            }
            let from = index
                .get(dep.as_str())
                .ok_or_else(|| GraphError::DanglingDependency {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                })?;
            graph.add_edge(*from, to, ());
        }
    }

    validate_branches(steps)?;

    let order = toposort(&graph, None).map_err(|_| GraphError::Cycle {
        steps: cycle_members(&graph, steps),
    })?;

    let mut level = vec![0usize; steps.len()];
    let mut upstream: Vec<HashSet<usize>> = vec![HashSet::new(); steps.len()];
    for node in order {
        let position = graph[node];
        let mut depth = 0;
        let mut ancestors = HashSet::new();
        for dep in graph.neighbors_directed(node, petgraph::Direction::Incoming) {
            let dep = graph[dep];
            depth = depth.max(level[dep] + 1);
            ancestors.insert(dep);
            ancestors.extend(upstream[dep].iter().copied());
        }
        level[position] = depth;
        upstream[position] = ancestors;
    }

    validate_references(steps, &index, &graph, &upstream)?;

    let depth = level.iter().copied().max().map_or(0, |max| max + 1);
    let mut waves = vec![Vec::new(); depth];
    for (position, step) in steps.iter().enumerate() {
        waves[level[position]].push(step.id.clone());
    }

    tracing::debug!(
        steps = steps.len(),
        waves = waves.len(),
        "Planned execution waves"
    );

    Ok(ExecutionPlan { waves })
}

/// A condition may only gate steps that directly depend on it, so the branch
/// decision is known before the gated step's wave starts.
fn validate_branches(steps: &[StepSpec]) -> Result<(), GraphError> {
    let by_id: HashMap<&str, &StepSpec> = steps.iter().map(|s| (s.id.as_str(), s)).collect();

    for step in steps {
        let StepKind::Condition(config) = &step.kind else {
            continue;
        };
        for target in config.then_steps.iter().chain(&config.else_steps) {
            let gated = by_id
                .get(target.as_str())
                .is_some_and(|t| t.dependencies.iter().any(|d| d == &step.id));
            if !gated {
                return Err(GraphError::InvalidBranch {
                    condition: step.id.clone(),
                    target: target.clone(),
                });
            }
        }
    }
    Ok(())
}

/// `$step` templates in a step's inputs or config must name one of its
/// (transitive) dependencies; anything else could never be resolved.
fn validate_references(
    steps: &[StepSpec],
    index: &HashMap<&str, NodeIndex>,
    graph: &DiGraph<usize, ()>,
    upstream: &[HashSet<usize>],
) -> Result<(), GraphError> {
    for (position, step) in steps.iter().enumerate() {
        let mut references = referenced_steps(&Value::Object(step.inputs.clone()));
        references.extend(referenced_steps(&Value::from(step.kind.config_json())));

        for reference in references {
            let reachable = index
                .get(reference.as_str())
                .is_some_and(|node| upstream[position].contains(&graph[*node]));
            if !reachable {
                return Err(GraphError::UnreachableReference {
                    step_id: step.id.clone(),
                    reference,
                });
            }
        }
    }
    Ok(())
}

/// Steps on a cycle, in declaration order.
fn cycle_members(graph: &DiGraph<usize, ()>, steps: &[StepSpec]) -> Vec<StepId> {
    let mut positions: Vec<usize> = tarjan_scc(graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1
                || component
                    .first()
                    .is_some_and(|n| graph.contains_edge(*n, *n))
        })
        .flatten()
        .map(|node| graph[node])
        .collect();
    positions.sort_unstable();
    positions.into_iter().map(|p| steps[p].id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> StepSpec {
        deps.iter().fold(
            StepSpec::new(id, StepKind::transform("return {}")),
            |s, d| s.depends_on(*d),
        )
    }

    #[test]
    fn independent_steps_share_the_first_wave() {
        let plan = plan_waves(&[step("a", &[]), step("b", &[]), step("c", &["a"])]).unwrap();
        assert_eq!(
            plan.waves(),
            &[vec!["a".to_string(), "b".to_string()], vec!["c".to_string()]]
        );
    }

    #[test]
    fn waves_keep_declaration_order() {
        let plan = plan_waves(&[
            step("root", &[]),
            step("z", &["root"]),
            step("m", &["root"]),
            step("a", &["root"]),
        ])
        .unwrap();
        assert_eq!(plan.waves()[1], vec!["z", "m", "a"]);
    }

    #[test]
    fn references_must_point_upstream() {
        let chained = [
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]).with_input("deep", "$a.v"),
        ];
        assert!(plan_waves(&chained).is_ok());

        let sibling = [
            step("a", &[]),
            step("b", &[]).with_input("v", "$a.v"),
        ];
        assert_eq!(
            plan_waves(&sibling),
            Err(GraphError::UnreachableReference {
                step_id: "b".to_string(),
                reference: "a".to_string(),
            })
        );

        let unknown = [StepSpec::new(
            "call",
            StepKind::external_call("GET", "http://api/${ghost.id}"),
        )];
        assert!(matches!(
            plan_waves(&unknown),
            Err(GraphError::UnreachableReference { .. })
        ));

        let input_only = [step("a", &[]).with_input("t", "$input.token")];
        assert!(plan_waves(&input_only).is_ok());
    }

    #[test]
    fn isolated_step_goes_first_even_when_declared_last() {
        let plan = plan_waves(&[step("a", &[]), step("b", &["a"]), step("lonely", &[])]).unwrap();
        assert_eq!(plan.wave_of("lonely"), Some(0));
        assert_eq!(plan.wave_of("b"), Some(1));
    }

    #[test]
    fn diamond_has_three_waves() {
        let plan = plan_waves(&[
            step("end", &["left", "right"]),
            step("left", &["start"]),
            step("right", &["start"]),
            step("start", &[]),
        ])
        .unwrap();
        assert_eq!(plan.waves().len(), 3);
        assert_eq!(plan.waves()[1], vec!["left", "right"]);
        assert_eq!(plan.wave_of("end"), Some(2));
    }

    #[test]
    fn rejects_duplicates_and_dangling_edges() {
        assert_eq!(
            plan_waves(&[step("a", &[]), step("a", &[])]),
            Err(GraphError::DuplicateStep("a".to_string()))
        );
        assert_eq!(
            plan_waves(&[step("a", &["ghost"])]),
            Err(GraphError::DanglingDependency {
                step_id: "a".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn names_the_steps_on_a_cycle() {
        let err = plan_waves(&[
            step("ok", &[]),
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("after", &["c"]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                steps: vec!["a".to_string(), "b".to_string(), "c".to_string()]
            }
        );

        let err = plan_waves(&[step("self", &["self"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                steps: vec!["self".to_string()]
            }
        );
    }

    #[test]
    fn condition_targets_must_depend_on_the_condition() {
        let gate = StepSpec::new("gate", StepKind::condition("true", ["yes"], ["no"]));
        let ok = plan_waves(&[gate.clone(), step("yes", &["gate"]), step("no", &["gate"])]);
        assert!(ok.is_ok());

        let err = plan_waves(&[gate, step("yes", &["gate"]), step("no", &[])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::InvalidBranch {
                condition: "gate".to_string(),
                target: "no".to_string(),
            }
        );
    }

    /// Random DAGs: edges only point from lower to higher index, then the
    /// declaration order is shuffled.
    #[test]
    fn every_step_lands_after_its_dependencies() {
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move |bound: u64| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed % bound
        };

        for _ in 0..50 {
            let count = 1 + next(12) as usize;
            let mut steps: Vec<StepSpec> = (0..count)
                .map(|i| {
                    let deps: Vec<String> = (0..i)
                        .filter(|_| next(3) == 0)
                        .map(|d| format!("s{}", d))
                        .collect();
                    deps.iter()
                        .fold(StepSpec::new(format!("s{}", i), StepKind::transform("1")), |s, d| {
                            s.depends_on(d.clone())
                        })
                })
                .collect();
            for i in (1..steps.len()).rev() {
                let j = next(i as u64 + 1) as usize;
                steps.swap(i, j);
            }

            let plan = plan_waves(&steps).unwrap();
            assert_eq!(plan.step_count(), steps.len());
            for s in &steps {
                let wave = plan.wave_of(&s.id).unwrap();
                assert_eq!(plan.waves().iter().flatten().filter(|id| **id == s.id).count(), 1);
                for dep in &s.dependencies {
                    assert!(plan.wave_of(dep).unwrap() < wave);
                }
            }
        }
    }
}
