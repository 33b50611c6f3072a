//! In-memory store.
//!
//! A single `RwLock` over all tables makes every composite operation
//! trivially atomic. Used by the engine's own tests and by embedders that
//! want the orchestration logic without Postgres.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::graph::StepRewire;
use crate::model::{
    Action, C2Job, EntityKind, JobRef, NewC2Job, NewPlaybook, NewProxyJob, NewStepModifier,
    Playbook, PlaybookStep, PlaybookTemplate, ProxyJob, Status, StepModifier,
};
use crate::modifier::ModifierOutcome;
use crate::store::{recompute_playbook, stamp_step_status, GraphBundle, StatusTransition, Store};

#[derive(Default)]
struct Tables {
    playbooks: HashMap<Uuid, Playbook>,
    steps: HashMap<Uuid, PlaybookStep>,
    modifiers: HashMap<Uuid, StepModifier>,
    c2_jobs: HashMap<Uuid, C2Job>,
    proxy_jobs: HashMap<Uuid, ProxyJob>,
    templates: HashMap<Uuid, PlaybookTemplate>,
    entities: HashMap<(EntityKind, Uuid), Value>,
    implant_labels: HashMap<Uuid, Vec<String>>,
    actions: HashMap<Uuid, Action>,
    /// (action id, template id) mapping rows.
    action_templates: Vec<(Uuid, Uuid)>,
}

impl Tables {
    fn steps_of(&self, playbook_id: Uuid) -> Vec<PlaybookStep> {
        let mut steps: Vec<PlaybookStep> = self
            .steps
            .values()
            .filter(|s| s.playbook_id == playbook_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.number);
        steps
    }

    fn apply_rewires(&mut self, rewires: &[StepRewire]) -> EngineResult<()> {
        for rewire in rewires {
            let step = self
                .steps
                .get_mut(&rewire.step_id)
                .ok_or_else(|| EngineError::NotFound(format!("step {}", rewire.step_id)))?;
            step.number = rewire.number;
            step.label = rewire.label.clone();
            step.depends_on = rewire.depends_on.clone();
        }
        Ok(())
    }

    fn refresh_counters(&mut self, playbook_id: Uuid) -> EngineResult<()> {
        let steps = self.steps_of(playbook_id);
        let playbook = self
            .playbooks
            .get_mut(&playbook_id)
            .ok_or_else(|| EngineError::NotFound(format!("playbook {playbook_id}")))?;
        playbook.steps = steps.len() as i32;
        playbook.completed = steps
            .iter()
            .filter(|s| s.status.is_terminal_success())
            .count() as i32;
        Ok(())
    }

    fn delete_step_cascade(&mut self, step: &PlaybookStep) {
        match step.job {
            Some(JobRef::C2(id)) => {
                self.c2_jobs.remove(&id);
            }
            Some(JobRef::Proxy(id)) => {
                self.proxy_jobs.remove(&id);
            }
            None => {}
        }
        self.modifiers.retain(|_, m| m.step_id != step.id);
        self.steps.remove(&step.id);
    }
}

/// In-memory `Store` implementation.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a resolvable entity. Test/embedder helper, not part of the
    /// `Store` contract.
    pub async fn insert_entity(&self, kind: EntityKind, id: Uuid, value: Value) {
        self.tables.write().await.entities.insert((kind, id), value);
    }

    /// Seed capability labels for an implant.
    pub async fn set_implant_labels(&self, implant_id: Uuid, labels: Vec<String>) {
        self.tables
            .write()
            .await
            .implant_labels
            .insert(implant_id, labels);
    }

    /// Seed an action mapped to the given templates.
    pub async fn add_action(&self, name: &str, template_ids: &[Uuid]) -> Uuid {
        let id = Uuid::new_v4();
        let mut tables = self.tables.write().await;
        tables.actions.insert(
            id,
            Action {
                id,
                name: name.to_string(),
                status: None,
                time_started: None,
                time_completed: None,
            },
        );
        for template_id in template_ids {
            tables.action_templates.push((id, *template_id));
        }
        id
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_playbook(&self, new: NewPlaybook) -> EngineResult<Playbook> {
        let playbook = Playbook {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            status: Status::Created,
            arguments: new.arguments,
            steps: 0,
            completed: 0,
            template_id: new.template_id,
            time_created: Utc::now(),
            time_started: None,
            time_completed: None,
        };
        self.tables
            .write()
            .await
            .playbooks
            .insert(playbook.id, playbook.clone());
        Ok(playbook)
    }

    async fn get_playbook(&self, id: Uuid) -> EngineResult<Option<Playbook>> {
        Ok(self.tables.read().await.playbooks.get(&id).cloned())
    }

    async fn update_playbook_meta(
        &self,
        id: Uuid,
        name: String,
        description: Option<String>,
    ) -> EngineResult<Playbook> {
        let mut tables = self.tables.write().await;
        let playbook = tables
            .playbooks
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("playbook {id}")))?;
        playbook.name = name;
        playbook.description = description;
        Ok(playbook.clone())
    }

    async fn start_playbook(&self, id: Uuid) -> EngineResult<Playbook> {
        let mut tables = self.tables.write().await;
        let playbook = tables
            .playbooks
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("playbook {id}")))?;
        if playbook.status != Status::Created {
            return Err(EngineError::Conflict(format!(
                "playbook {id} is {}, not created",
                playbook.status
            )));
        }
        playbook.status = Status::Running;
        playbook.time_started = Some(Utc::now());
        Ok(playbook.clone())
    }

    async fn delete_playbook(&self, id: Uuid) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        if tables.playbooks.remove(&id).is_none() {
            return Err(EngineError::NotFound(format!("playbook {id}")));
        }
        for step in tables.steps_of(id) {
            tables.delete_step_cascade(&step);
        }
        Ok(())
    }

    async fn list_steps(&self, playbook_id: Uuid) -> EngineResult<Vec<PlaybookStep>> {
        Ok(self.tables.read().await.steps_of(playbook_id))
    }

    async fn get_step(&self, id: Uuid) -> EngineResult<Option<PlaybookStep>> {
        Ok(self.tables.read().await.steps.get(&id).cloned())
    }

    async fn insert_step(&self, step: PlaybookStep, rewires: &[StepRewire]) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.playbooks.contains_key(&step.playbook_id) {
            return Err(EngineError::NotFound(format!(
                "playbook {}",
                step.playbook_id
            )));
        }
        let playbook_id = step.playbook_id;
        tables.steps.insert(step.id, step);
        tables.apply_rewires(rewires)?;
        tables.refresh_counters(playbook_id)
    }

    async fn update_step(&self, step: &PlaybookStep) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        if !tables.steps.contains_key(&step.id) {
            return Err(EngineError::NotFound(format!("step {}", step.id)));
        }
        tables.steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn remove_step(&self, step_id: Uuid, rewires: &[StepRewire]) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        let step = tables
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?;
        tables.delete_step_cascade(&step);
        tables.apply_rewires(rewires)?;
        tables.refresh_counters(step.playbook_id)
    }

    async fn record_step_status(
        &self,
        step_id: Uuid,
        status: Status,
        now: DateTime<Utc>,
    ) -> EngineResult<StatusTransition> {
        let mut tables = self.tables.write().await;
        let step = tables
            .steps
            .get_mut(&step_id)
            .ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?;
        stamp_step_status(step, status, now);
        let step = step.clone();

        let siblings = tables.steps_of(step.playbook_id);
        let playbook = tables
            .playbooks
            .get_mut(&step.playbook_id)
            .ok_or_else(|| EngineError::NotFound(format!("playbook {}", step.playbook_id)))?;
        let playbook_flipped = recompute_playbook(playbook, &siblings, now);

        Ok(StatusTransition {
            step,
            playbook: playbook.clone(),
            playbook_flipped,
        })
    }

    async fn step_for_job(&self, job: JobRef) -> EngineResult<Option<PlaybookStep>> {
        Ok(self
            .tables
            .read()
            .await
            .steps
            .values()
            .find(|s| s.job == Some(job))
            .cloned())
    }

    async fn create_modifier(&self, new: NewStepModifier) -> EngineResult<StepModifier> {
        let mut tables = self.tables.write().await;
        if !tables.steps.contains_key(&new.step_id) {
            return Err(EngineError::NotFound(format!("step {}", new.step_id)));
        }
        let modifier = StepModifier {
            id: Uuid::new_v4(),
            step_id: new.step_id,
            input_path: new.input_path,
            output_path: new.output_path,
            regex: new.regex,
            on_error: new.on_error,
            status: None,
            status_message: None,
            data: None,
            time_created: Utc::now(),
        };
        tables.modifiers.insert(modifier.id, modifier.clone());
        Ok(modifier)
    }

    async fn list_modifiers(&self, step_id: Uuid) -> EngineResult<Vec<StepModifier>> {
        let tables = self.tables.read().await;
        let mut modifiers: Vec<StepModifier> = tables
            .modifiers
            .values()
            .filter(|m| m.step_id == step_id)
            .cloned()
            .collect();
        modifiers.sort_by_key(|m| m.time_created);
        Ok(modifiers)
    }

    async fn record_modifier_run(
        &self,
        modifier_id: Uuid,
        outcome: &ModifierOutcome,
    ) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        let modifier = tables
            .modifiers
            .get_mut(&modifier_id)
            .ok_or_else(|| EngineError::NotFound(format!("modifier {modifier_id}")))?;
        modifier.status = Some(outcome.status);
        modifier.status_message = outcome.message.clone();
        modifier.data = outcome.data.clone();
        Ok(())
    }

    async fn create_c2_job(&self, new: NewC2Job) -> EngineResult<C2Job> {
        let job = C2Job {
            id: Uuid::new_v4(),
            playbook_id: new.playbook_id,
            command: new.command,
            arguments: new.arguments,
            implant_id: new.implant_id,
            status: Status::Created,
            time_created: Utc::now(),
        };
        self.tables
            .write()
            .await
            .c2_jobs
            .insert(job.id, job.clone());
        Ok(job)
    }

    async fn create_proxy_job(&self, new: NewProxyJob) -> EngineResult<ProxyJob> {
        let job = ProxyJob {
            id: Uuid::new_v4(),
            playbook_id: new.playbook_id,
            command: new.command,
            arguments: new.arguments,
            socks_server_id: new.socks_server_id,
            tmate: new.tmate,
            asciinema: new.asciinema,
            proxychains: new.proxychains,
            status: Status::Created,
            time_created: Utc::now(),
        };
        self.tables
            .write()
            .await
            .proxy_jobs
            .insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_c2_job(&self, id: Uuid) -> EngineResult<Option<C2Job>> {
        Ok(self.tables.read().await.c2_jobs.get(&id).cloned())
    }

    async fn get_proxy_job(&self, id: Uuid) -> EngineResult<Option<ProxyJob>> {
        Ok(self.tables.read().await.proxy_jobs.get(&id).cloned())
    }

    async fn upsert_template(&self, template: PlaybookTemplate) -> EngineResult<PlaybookTemplate> {
        self.tables
            .write()
            .await
            .templates
            .insert(template.id, template.clone());
        Ok(template)
    }

    async fn get_template(&self, id: Uuid) -> EngineResult<Option<PlaybookTemplate>> {
        Ok(self.tables.read().await.templates.get(&id).cloned())
    }

    async fn persist_graph(&self, bundle: GraphBundle) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .playbooks
            .insert(bundle.playbook.id, bundle.playbook);
        for job in bundle.c2_jobs {
            tables.c2_jobs.insert(job.id, job);
        }
        for job in bundle.proxy_jobs {
            tables.proxy_jobs.insert(job.id, job);
        }
        for step in bundle.steps {
            tables.steps.insert(step.id, step);
        }
        for modifier in bundle.modifiers {
            tables.modifiers.insert(modifier.id, modifier);
        }
        Ok(())
    }

    async fn load_graph(&self, playbook_id: Uuid) -> EngineResult<GraphBundle> {
        let tables = self.tables.read().await;
        let playbook = tables
            .playbooks
            .get(&playbook_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("playbook {playbook_id}")))?;
        let steps = tables.steps_of(playbook_id);

        let mut modifiers = Vec::new();
        let mut c2_jobs = Vec::new();
        let mut proxy_jobs = Vec::new();
        for step in &steps {
            let mut step_modifiers: Vec<StepModifier> = tables
                .modifiers
                .values()
                .filter(|m| m.step_id == step.id)
                .cloned()
                .collect();
            step_modifiers.sort_by_key(|m| m.time_created);
            modifiers.extend(step_modifiers);
            match step.job {
                Some(JobRef::C2(id)) => {
                    if let Some(job) = tables.c2_jobs.get(&id) {
                        c2_jobs.push(job.clone());
                    }
                }
                Some(JobRef::Proxy(id)) => {
                    if let Some(job) = tables.proxy_jobs.get(&id) {
                        proxy_jobs.push(job.clone());
                    }
                }
                None => {}
            }
        }

        Ok(GraphBundle {
            playbook,
            steps,
            modifiers,
            c2_jobs,
            proxy_jobs,
        })
    }

    async fn resolve_entity(&self, kind: EntityKind, id: Uuid) -> EngineResult<Option<Value>> {
        Ok(self.tables.read().await.entities.get(&(kind, id)).cloned())
    }

    async fn implant_labels(&self, implant_id: Uuid) -> EngineResult<Vec<String>> {
        Ok(self
            .tables
            .read()
            .await
            .implant_labels
            .get(&implant_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn actions_for_template(&self, template_id: Uuid) -> EngineResult<Vec<Action>> {
        let tables = self.tables.read().await;
        let mut actions: Vec<Action> = tables
            .action_templates
            .iter()
            .filter(|(_, t)| *t == template_id)
            .filter_map(|(a, _)| tables.actions.get(a).cloned())
            .collect();
        actions.sort_by_key(|a| a.id);
        Ok(actions)
    }

    async fn sync_actions(
        &self,
        template_id: Uuid,
        status: Status,
        time_started: Option<DateTime<Utc>>,
        time_completed: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        let mut tables = self.tables.write().await;
        let action_ids: Vec<Uuid> = tables
            .action_templates
            .iter()
            .filter(|(_, t)| *t == template_id)
            .map(|(a, _)| *a)
            .collect();
        for action_id in action_ids {
            if let Some(action) = tables.actions.get_mut(&action_id) {
                action.status = Some(status);
                if let Some(t) = time_started {
                    action.time_started = Some(t);
                }
                if let Some(t) = time_completed {
                    action.time_completed = Some(t);
                }
            }
        }
        Ok(())
    }
}
