//! Dependency-graph planning over playbook steps.
//!
//! Everything in this module is pure: it takes the current step rows and
//! produces a plan (placement, renumbering, topological order, rendered
//! graph text). The service layer applies plans through the store under the
//! per-playbook lock, so planning never touches persistence.

use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::labels;
use crate::model::{split_labels, NewStep, PlaybookStep, Status};

/// Computed placement for a step about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepPlacement {
    pub number: i32,
    pub label: String,
    pub depends_on: Option<String>,
}

/// Decide number, label, and implicit dependency for a new step.
///
/// Unset number becomes `highest + 1`; unset label is derived from the
/// number; with `add_depends_on` and no explicit dependency, the step chains
/// to the label of its immediate predecessor by number.
pub fn place_step(
    existing: &[PlaybookStep],
    spec: &NewStep,
    add_depends_on: bool,
) -> EngineResult<StepPlacement> {
    let highest = existing.iter().map(|s| s.number).max().unwrap_or(0);
    let number = spec.number.unwrap_or(highest + 1);
    if number < 1 {
        return Err(EngineError::Validation(format!(
            "step number must be >= 1, got {number}"
        )));
    }

    let label = match spec.label.as_deref().filter(|l| !l.is_empty()) {
        Some(label) => label.to_string(),
        None => labels::label_for(number as u32)?,
    };
    if existing.iter().any(|s| s.label == label) {
        return Err(EngineError::Validation(format!(
            "step label {label:?} already exists in this playbook"
        )));
    }

    // Chain to the actual predecessor's label, which may be explicit.
    let depends_on = match spec.depends_on.as_deref().filter(|d| !d.is_empty()) {
        Some(explicit) => Some(explicit.to_string()),
        None if add_depends_on => existing
            .iter()
            .filter(|s| s.number < number)
            .max_by_key(|s| (s.number, s.time_created))
            .map(|s| s.label.clone()),
        None => None,
    };

    Ok(StepPlacement {
        number,
        label,
        depends_on,
    })
}

/// One step's new wiring after renumbering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRewire {
    pub step_id: Uuid,
    pub number: i32,
    pub label: String,
    pub depends_on: Option<String>,
}

/// Compact step numbers to a dense 1..n sequence, in ascending order of the
/// current numbers.
///
/// A label is rewritten only when it was derived from the step's old number;
/// explicit labels are kept, and a rewritten label never lands on one:
/// on collision the step keeps its current label instead. `depends_on`
/// entries are remapped through the old-to-new label mapping, and entries
/// referencing a label that no longer exists are dropped.
pub fn renumber_steps(steps: &[PlaybookStep]) -> EngineResult<Vec<StepRewire>> {
    let mut ordered: Vec<&PlaybookStep> = steps.iter().collect();
    ordered.sort_by_key(|s| (s.number, s.time_created));

    // Explicit labels never move, so they are reserved up front.
    let mut taken: HashSet<String> = ordered
        .iter()
        .filter(|s| !label_is_derived(s))
        .map(|s| s.label.clone())
        .collect();

    let mut label_map: HashMap<String, String> = HashMap::with_capacity(ordered.len());
    let mut rewires = Vec::with_capacity(ordered.len());

    for (index, step) in ordered.iter().enumerate() {
        let number = index as i32 + 1;
        let label = if label_is_derived(step) {
            relabel(step, number, ordered.len(), &taken)?
        } else {
            step.label.clone()
        };
        taken.insert(label.clone());
        label_map.insert(step.label.clone(), label.clone());
        rewires.push(StepRewire {
            step_id: step.id,
            number,
            label,
            depends_on: None,
        });
    }

    for (rewire, step) in rewires.iter_mut().zip(&ordered) {
        let deps: Vec<String> = step
            .depends_on_labels()
            .into_iter()
            .filter_map(|dep| label_map.get(&dep).cloned())
            .collect();
        rewire.depends_on = if deps.is_empty() {
            None
        } else {
            Some(deps.join(","))
        };
    }

    Ok(rewires)
}

fn label_is_derived(step: &PlaybookStep) -> bool {
    u32::try_from(step.number)
        .ok()
        .and_then(|n| labels::label_for(n).ok())
        .is_some_and(|derived| derived == step.label)
}

/// New label for a derived-label step at its compacted position. The
/// positional label wins unless it is already taken; then the step keeps its
/// current label, or takes the first free label past every position when
/// that is held too.
fn relabel(
    step: &PlaybookStep,
    number: i32,
    total: usize,
    taken: &HashSet<String>,
) -> EngineResult<String> {
    let target = labels::label_for(number as u32)?;
    if !taken.contains(&target) {
        return Ok(target);
    }
    if !taken.contains(&step.label) {
        return Ok(step.label.clone());
    }
    let mut n = total as u32 + 1;
    loop {
        let candidate = labels::label_for(n)?;
        if !taken.contains(&candidate) {
            return Ok(candidate);
        }
        n += 1;
    }
}

/// Topologically sort steps by their label dependencies.
///
/// Returns labels in a valid execution order. A dependency on a label that
/// no step carries, or a cycle, is a graph consistency error.
pub fn topological_order(steps: &[PlaybookStep]) -> EngineResult<Vec<String>> {
    let known: HashSet<&str> = steps.iter().map(|s| s.label.as_str()).collect();

    // BTreeMap keyed by (number, label) keeps the order deterministic among
    // steps whose dependencies are satisfied at the same time.
    let mut pending: BTreeMap<(i32, String), Vec<String>> = BTreeMap::new();
    for step in steps {
        let deps = step.depends_on_labels();
        for dep in &deps {
            if !known.contains(dep.as_str()) {
                return Err(EngineError::GraphConsistency(format!(
                    "step {} depends on unknown label {dep:?}",
                    step.label
                )));
            }
        }
        pending.insert((step.number, step.label.clone()), deps);
    }

    let mut order = Vec::with_capacity(steps.len());
    let mut done: HashSet<String> = HashSet::with_capacity(steps.len());

    while !pending.is_empty() {
        let ready: Vec<(i32, String)> = pending
            .iter()
            .filter(|(_, deps)| deps.iter().all(|d| done.contains(d)))
            .map(|(key, _)| key.clone())
            .collect();
        if ready.is_empty() {
            let stuck: Vec<&str> = pending.keys().map(|(_, l)| l.as_str()).collect();
            return Err(EngineError::GraphConsistency(format!(
                "dependency cycle among steps: {}",
                stuck.join(", ")
            )));
        }
        for key in ready {
            pending.remove(&key);
            done.insert(key.1.clone());
            order.push(key.1);
        }
    }

    Ok(order)
}

/// Rendered graph view: mermaid-style text plus the acyclic flag.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PlaybookGraph {
    pub graph: String,
    pub correct: bool,
}

fn status_class(status: Status) -> &'static str {
    match status {
        Status::Completed => "completed",
        Status::Queued => "queued",
        Status::Error => "error",
        // Everything else renders with the in-flight color.
        _ => "running",
    }
}

/// Render the step graph as `graph LR` mermaid text.
///
/// Each node shows its label and, when available, the owned job's command
/// (looked up by step id in `commands`); nodes are colored by status class.
pub fn render_graph(steps: &[PlaybookStep], commands: &HashMap<Uuid, String>) -> PlaybookGraph {
    let mut lines = vec!["graph LR".to_string()];

    for step in steps {
        let node = match commands.get(&step.id) {
            Some(command) => format!("({}: {})", step.label, command),
            None => format!("({})", step.label),
        };
        for dep in step.depends_on_labels() {
            lines.push(format!("{dep}-->{}", step.label));
        }
        lines.push(format!(
            "{}{node}:::{}",
            step.label,
            status_class(step.status)
        ));
    }

    let correct = topological_order(steps).is_ok();

    lines.push("classDef completed fill:#21BA45".to_string());
    lines.push("classDef running fill:#9370DB".to_string());
    lines.push("classDef queued fill:#9370DB".to_string());
    lines.push("classDef submitted fill:#9370DB".to_string());
    lines.push("classDef error fill:#C10015".to_string());

    PlaybookGraph {
        graph: lines.join("\n"),
        correct,
    }
}
