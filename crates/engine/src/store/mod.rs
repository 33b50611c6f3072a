//! Persistence contract for the orchestration engine.
//!
//! The engine plans in memory and persists through this trait. Composite
//! operations (`insert_step`, `remove_step`, `record_step_status`,
//! `persist_graph`) are atomic in every implementation: either the whole
//! mutation lands or none of it does.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::graph::StepRewire;
use crate::model::{
    Action, C2Job, EntityKind, JobRef, NewC2Job, NewPlaybook, NewProxyJob, NewStepModifier,
    Playbook, PlaybookStep, PlaybookTemplate, ProxyJob, Status, StepModifier,
};
use crate::modifier::ModifierOutcome;

/// A whole playbook graph, moved in and out of the store as one unit.
#[derive(Debug, Clone)]
pub struct GraphBundle {
    pub playbook: Playbook,
    pub steps: Vec<PlaybookStep>,
    pub modifiers: Vec<StepModifier>,
    pub c2_jobs: Vec<C2Job>,
    pub proxy_jobs: Vec<ProxyJob>,
}

/// Outcome of recording a step status: the updated rows plus whether the
/// owning playbook's aggregate status changed.
#[derive(Debug, Clone)]
pub struct StatusTransition {
    pub step: PlaybookStep,
    pub playbook: Playbook,
    pub playbook_flipped: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Playbooks
    // ------------------------------------------------------------------

    async fn create_playbook(&self, new: NewPlaybook) -> EngineResult<Playbook>;

    async fn get_playbook(&self, id: Uuid) -> EngineResult<Option<Playbook>>;

    /// Update name/description, leaving structure and counters alone.
    async fn update_playbook_meta(
        &self,
        id: Uuid,
        name: String,
        description: Option<String>,
    ) -> EngineResult<Playbook>;

    /// Flip a `created` playbook to `running` and stamp `time_started`.
    /// Any other current status is a conflict.
    async fn start_playbook(&self, id: Uuid) -> EngineResult<Playbook>;

    /// Delete a playbook with all its steps, modifiers, and owned jobs.
    async fn delete_playbook(&self, id: Uuid) -> EngineResult<()>;

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    /// All steps of a playbook in ascending number order.
    async fn list_steps(&self, playbook_id: Uuid) -> EngineResult<Vec<PlaybookStep>>;

    async fn get_step(&self, id: Uuid) -> EngineResult<Option<PlaybookStep>>;

    /// Insert a fully placed step and apply the renumbering plan covering
    /// every step of the playbook (the new one included). Also refreshes
    /// the playbook's step counter.
    async fn insert_step(&self, step: PlaybookStep, rewires: &[StepRewire]) -> EngineResult<()>;

    /// Full-row update of a step's wiring.
    async fn update_step(&self, step: &PlaybookStep) -> EngineResult<()>;

    /// Delete a step, its owned job, and its modifiers, then apply the
    /// survivors' renumbering plan and refresh the step counter.
    async fn remove_step(&self, step_id: Uuid, rewires: &[StepRewire]) -> EngineResult<()>;

    /// Persist a status transition and recompute the owning playbook's
    /// aggregates in the same atomic unit.
    async fn record_step_status(
        &self,
        step_id: Uuid,
        status: Status,
        now: DateTime<Utc>,
    ) -> EngineResult<StatusTransition>;

    /// Find the step owning a given job. Used by the execution runtime's
    /// status callbacks, which know job ids, not step ids.
    async fn step_for_job(&self, job: JobRef) -> EngineResult<Option<PlaybookStep>>;

    // ------------------------------------------------------------------
    // Step modifiers
    // ------------------------------------------------------------------

    async fn create_modifier(&self, new: NewStepModifier) -> EngineResult<StepModifier>;

    async fn list_modifiers(&self, step_id: Uuid) -> EngineResult<Vec<StepModifier>>;

    /// Record the outcome of one modifier evaluation on its row.
    async fn record_modifier_run(
        &self,
        modifier_id: Uuid,
        outcome: &ModifierOutcome,
    ) -> EngineResult<()>;

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    async fn create_c2_job(&self, new: NewC2Job) -> EngineResult<C2Job>;

    async fn create_proxy_job(&self, new: NewProxyJob) -> EngineResult<ProxyJob>;

    async fn get_c2_job(&self, id: Uuid) -> EngineResult<Option<C2Job>>;

    async fn get_proxy_job(&self, id: Uuid) -> EngineResult<Option<ProxyJob>>;

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Create-or-update keyed by template id.
    async fn upsert_template(&self, template: PlaybookTemplate) -> EngineResult<PlaybookTemplate>;

    async fn get_template(&self, id: Uuid) -> EngineResult<Option<PlaybookTemplate>>;

    // ------------------------------------------------------------------
    // Whole graphs
    // ------------------------------------------------------------------

    /// Persist a complete graph (playbook, steps, jobs, modifiers)
    /// all-or-nothing. Used by template compilation and cloning.
    async fn persist_graph(&self, bundle: GraphBundle) -> EngineResult<()>;

    /// Load a complete graph for cloning or inspection.
    async fn load_graph(&self, playbook_id: Uuid) -> EngineResult<GraphBundle>;

    // ------------------------------------------------------------------
    // Entity resolution
    // ------------------------------------------------------------------

    /// Resolve an entity by kind and id into its JSON representation, or
    /// `None` when it does not exist.
    async fn resolve_entity(&self, kind: EntityKind, id: Uuid) -> EngineResult<Option<Value>>;

    /// Capability labels attached to a C2 implant.
    async fn implant_labels(&self, implant_id: Uuid) -> EngineResult<Vec<String>>;

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    async fn actions_for_template(&self, template_id: Uuid) -> EngineResult<Vec<Action>>;

    /// Mirror a playbook status onto every action mapped to its origin
    /// template, carrying the start/stop stamps along.
    async fn sync_actions(
        &self,
        template_id: Uuid,
        status: Status,
        time_started: Option<DateTime<Utc>>,
        time_completed: Option<DateTime<Utc>>,
    ) -> EngineResult<()>;
}

// ============================================================================
// Transition helpers shared by the implementations
// ============================================================================

/// Apply a status to a step row, stamping `time_started` on first entry
/// into a started-class state and `time_completed` on first entry into a
/// terminal state. Re-applying the same terminal status changes nothing.
pub(crate) fn stamp_step_status(step: &mut PlaybookStep, status: Status, now: DateTime<Utc>) {
    step.status = status;
    if status.is_started_class() && step.time_started.is_none() {
        step.time_started = Some(now);
    }
    if status.is_terminal() && step.time_completed.is_none() {
        step.time_completed = Some(now);
    }
}

/// Recompute a playbook's derived fields from its current steps. Returns
/// true when the aggregate status changed.
pub(crate) fn recompute_playbook(
    playbook: &mut Playbook,
    steps: &[PlaybookStep],
    now: DateTime<Utc>,
) -> bool {
    playbook.steps = steps.len() as i32;
    playbook.completed = steps
        .iter()
        .filter(|s| s.status.is_terminal_success())
        .count() as i32;

    let all_terminal = !steps.is_empty() && steps.iter().all(|s| s.status.is_terminal());
    if !all_terminal {
        return false;
    }

    let derived = if steps.iter().any(|s| s.status == Status::Error) {
        Status::Error
    } else {
        Status::Completed
    };
    if playbook.status == derived {
        return false;
    }

    playbook.status = derived;
    if playbook.time_completed.is_none() {
        playbook.time_completed = Some(now);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with(status: Status) -> PlaybookStep {
        PlaybookStep {
            id: Uuid::new_v4(),
            playbook_id: Uuid::nil(),
            number: 1,
            label: "A".to_string(),
            depends_on: None,
            delay_seconds: None,
            execute_after: None,
            job: None,
            status,
            time_created: Utc::now(),
            time_started: None,
            time_completed: None,
        }
    }

    fn playbook_with(status: Status) -> Playbook {
        Playbook {
            id: Uuid::new_v4(),
            name: "pb".to_string(),
            description: None,
            status,
            arguments: None,
            steps: 0,
            completed: 0,
            template_id: None,
            time_created: Utc::now(),
            time_started: None,
            time_completed: None,
        }
    }

    #[test]
    fn test_stamp_step_status_stamps_once() {
        let mut step = step_with(Status::Created);
        let t1 = Utc::now();
        stamp_step_status(&mut step, Status::Queued, t1);
        assert_eq!(step.time_started, Some(t1));

        let t2 = Utc::now();
        stamp_step_status(&mut step, Status::Started, t2);
        assert_eq!(step.time_started, Some(t1));

        stamp_step_status(&mut step, Status::Completed, t2);
        assert_eq!(step.time_completed, Some(t2));
        stamp_step_status(&mut step, Status::Completed, Utc::now());
        assert_eq!(step.time_completed, Some(t2));
    }

    #[test]
    fn test_recompute_derives_terminal_status() {
        let mut playbook = playbook_with(Status::Running);
        let steps = vec![step_with(Status::Completed), step_with(Status::Skipped)];
        let flipped = recompute_playbook(&mut playbook, &steps, Utc::now());
        assert!(flipped);
        assert_eq!(playbook.status, Status::Completed);
        assert_eq!(playbook.steps, 2);
        assert_eq!(playbook.completed, 2);
        assert!(playbook.time_completed.is_some());

        // Re-deriving the same status is a no-op.
        let stamp = playbook.time_completed;
        assert!(!recompute_playbook(&mut playbook, &steps, Utc::now()));
        assert_eq!(playbook.time_completed, stamp);
    }

    #[test]
    fn test_recompute_any_error_wins() {
        let mut playbook = playbook_with(Status::Running);
        let steps = vec![step_with(Status::Completed), step_with(Status::Error)];
        assert!(recompute_playbook(&mut playbook, &steps, Utc::now()));
        assert_eq!(playbook.status, Status::Error);
        assert_eq!(playbook.completed, 1);
    }

    #[test]
    fn test_recompute_waits_for_all_terminal() {
        let mut playbook = playbook_with(Status::Running);
        let steps = vec![step_with(Status::Completed), step_with(Status::Started)];
        assert!(!recompute_playbook(&mut playbook, &steps, Utc::now()));
        assert_eq!(playbook.status, Status::Running);
        assert_eq!(playbook.completed, 1);
    }
}
