//! Playbook orchestration service.
//!
//! `PlaybookService` is the entry point callers use: it owns the store, the
//! template compiler, and the event notifier, and serializes structural
//! mutations per playbook so renumbering never races an insert or delete.
//! Status updates skip the lock; their consistency comes from the store's
//! atomic recompute.

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventNotifier, PlaybookEvent};
use crate::graph::{self, PlaybookGraph};
use crate::labels;
use crate::model::{
    C2Job, JobRef, NewC2Job, NewPlaybook, NewProxyJob, NewStep, NewStepModifier, Playbook,
    PlaybookStep, PlaybookTemplate, ProxyJob, Status, StepModifier,
};
use crate::modifier::{self, ModifierOutcome};
use crate::store::{GraphBundle, StatusTransition, Store};
use crate::template::{entity_ref, JobKind, TemplateCompiler, TemplatePreview, TemplateStep};

/// Default prefix applied to cloned playbook names.
pub const DEFAULT_CLONE_PREFIX: &str = "Clone of ";

pub struct PlaybookService {
    store: Arc<dyn Store>,
    notifier: EventNotifier,
    compiler: TemplateCompiler,
    clone_prefix: String,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PlaybookService {
    pub fn new(store: Arc<dyn Store>, notifier: EventNotifier) -> Self {
        Self {
            store,
            notifier,
            compiler: TemplateCompiler::new(),
            clone_prefix: DEFAULT_CLONE_PREFIX.to_string(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clone_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.clone_prefix = prefix.into();
        self
    }

    /// Serialize structural mutations of one playbook.
    async fn playbook_lock(&self, playbook_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(playbook_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn require_playbook(&self, playbook_id: Uuid) -> EngineResult<Playbook> {
        self.store
            .get_playbook(playbook_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("playbook {playbook_id}")))
    }

    // ------------------------------------------------------------------
    // Playbooks
    // ------------------------------------------------------------------

    pub async fn create_playbook(&self, new: NewPlaybook) -> EngineResult<Playbook> {
        let playbook = self.store.create_playbook(new).await?;
        info!(playbook_id = %playbook.id, name = %playbook.name, "Created playbook");
        Ok(playbook)
    }

    pub async fn get_playbook(&self, playbook_id: Uuid) -> EngineResult<Option<Playbook>> {
        self.store.get_playbook(playbook_id).await
    }

    /// Update a playbook's name/description.
    pub async fn update_playbook(
        &self,
        playbook_id: Uuid,
        name: String,
        description: Option<String>,
    ) -> EngineResult<Playbook> {
        let playbook = self
            .store
            .update_playbook_meta(playbook_id, name, description)
            .await?;
        self.notifier
            .publish(
                playbook_id,
                PlaybookEvent::UpdatedPlaybook,
                playbook_id,
                None,
            )
            .await;
        Ok(playbook)
    }

    /// Mark a `created` playbook as running. Anything else is a conflict:
    /// a playbook never silently re-runs.
    pub async fn start_playbook(&self, playbook_id: Uuid) -> EngineResult<Playbook> {
        let playbook = self.store.start_playbook(playbook_id).await?;
        info!(playbook_id = %playbook_id, "Started playbook");
        self.notifier
            .publish(
                playbook_id,
                PlaybookEvent::PlaybookStatus,
                playbook_id,
                Some(playbook.status),
            )
            .await;
        if let Some(template_id) = playbook.template_id {
            self.store
                .sync_actions(template_id, playbook.status, playbook.time_started, None)
                .await?;
        }
        Ok(playbook)
    }

    pub async fn delete_playbook(&self, playbook_id: Uuid) -> EngineResult<()> {
        let _guard = self.playbook_lock(playbook_id).await;
        self.store.delete_playbook(playbook_id).await?;
        info!(playbook_id = %playbook_id, "Deleted playbook");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------

    pub async fn list_steps(&self, playbook_id: Uuid) -> EngineResult<Vec<PlaybookStep>> {
        self.store.list_steps(playbook_id).await
    }

    pub async fn get_step(&self, step_id: Uuid) -> EngineResult<Option<PlaybookStep>> {
        self.store.get_step(step_id).await
    }

    /// Find the step owning a job, for the execution runtime's callbacks.
    pub async fn step_for_job(&self, job: JobRef) -> EngineResult<Option<PlaybookStep>> {
        self.store.step_for_job(job).await
    }

    /// Add a step, assigning number/label/implicit dependency, then
    /// renumber the playbook so numbers stay dense.
    pub async fn add_step(&self, spec: NewStep, add_depends_on: bool) -> EngineResult<PlaybookStep> {
        let playbook_id = spec.playbook_id;
        let _guard = self.playbook_lock(playbook_id).await;
        self.require_playbook(playbook_id).await?;

        let existing = self.store.list_steps(playbook_id).await?;
        let placement = graph::place_step(&existing, &spec, add_depends_on)?;
        let mut step = PlaybookStep {
            id: Uuid::new_v4(),
            playbook_id,
            number: placement.number,
            label: placement.label,
            depends_on: placement.depends_on,
            delay_seconds: spec.delay_seconds,
            execute_after: spec.execute_after,
            job: spec.job,
            status: Status::Created,
            time_created: Utc::now(),
            time_started: None,
            time_completed: None,
        };

        let mut all = existing;
        all.push(step.clone());
        let rewires = graph::renumber_steps(&all)?;
        self.store.insert_step(step.clone(), &rewires).await?;

        // Renumbering may have compacted the new step's own placement.
        if let Some(rewire) = rewires.iter().find(|r| r.step_id == step.id) {
            step.number = rewire.number;
            step.label = rewire.label.clone();
            step.depends_on = rewire.depends_on.clone();
        }

        self.notifier
            .publish(playbook_id, PlaybookEvent::NewStep, step.id, None)
            .await;
        Ok(step)
    }

    /// Persist edited step wiring (dependencies, delay, schedule, job).
    pub async fn update_step(&self, step: &PlaybookStep) -> EngineResult<()> {
        let _guard = self.playbook_lock(step.playbook_id).await;
        self.store.update_step(step).await?;
        self.notifier
            .publish(step.playbook_id, PlaybookEvent::UpdatedStep, step.id, None)
            .await;
        Ok(())
    }

    /// Delete a step together with its owned job and modifiers, then
    /// renumber the survivors.
    pub async fn delete_step(&self, step_id: Uuid) -> EngineResult<()> {
        let step = self
            .store
            .get_step(step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?;
        let _guard = self.playbook_lock(step.playbook_id).await;

        let survivors: Vec<PlaybookStep> = self
            .store
            .list_steps(step.playbook_id)
            .await?
            .into_iter()
            .filter(|s| s.id != step_id)
            .collect();
        let rewires = graph::renumber_steps(&survivors)?;
        self.store.remove_step(step_id, &rewires).await?;

        self.notifier
            .publish(step.playbook_id, PlaybookEvent::DeletedStep, step_id, None)
            .await;
        Ok(())
    }

    /// Attach a modifier to a step.
    pub async fn add_modifier(&self, new: NewStepModifier) -> EngineResult<StepModifier> {
        self.store.create_modifier(new).await
    }

    // ------------------------------------------------------------------
    // Status state machine
    // ------------------------------------------------------------------

    /// Record a status callback from the execution runtime. Stamps the
    /// step, recomputes the owning playbook atomically, publishes events,
    /// and cascades terminal playbook transitions to mapped actions.
    pub async fn update_step_status(
        &self,
        step_id: Uuid,
        status: Status,
    ) -> EngineResult<StatusTransition> {
        let transition = self
            .store
            .record_step_status(step_id, status, Utc::now())
            .await?;

        let playbook = &transition.playbook;
        self.notifier
            .publish(
                playbook.id,
                PlaybookEvent::StepStatus,
                step_id,
                Some(transition.step.status),
            )
            .await;

        if transition.playbook_flipped {
            info!(
                playbook_id = %playbook.id,
                status = %playbook.status,
                "Playbook reached {}", playbook.status
            );
            self.notifier
                .publish(
                    playbook.id,
                    PlaybookEvent::PlaybookStatus,
                    playbook.id,
                    Some(playbook.status),
                )
                .await;
            if let Some(template_id) = playbook.template_id {
                self.store
                    .sync_actions(
                        template_id,
                        playbook.status,
                        playbook.time_started,
                        playbook.time_completed,
                    )
                    .await?;
            }
        }

        Ok(transition)
    }

    /// Status callback keyed by job instead of step.
    pub async fn update_job_status(
        &self,
        job: JobRef,
        status: Status,
    ) -> EngineResult<StatusTransition> {
        let step = self
            .store
            .step_for_job(job)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("step owning job {}", job.id())))?;
        self.update_step_status(step.id, status).await
    }

    // ------------------------------------------------------------------
    // Graph views
    // ------------------------------------------------------------------

    /// Topological order of the playbook's step labels, or a graph
    /// consistency error (cycle, dangling dependency).
    pub async fn validate(&self, playbook_id: Uuid) -> EngineResult<Vec<String>> {
        let steps = self.store.list_steps(playbook_id).await?;
        graph::topological_order(&steps)
    }

    /// Render the dependency graph with job commands and status coloring.
    pub async fn render_graph(&self, playbook_id: Uuid) -> EngineResult<PlaybookGraph> {
        self.require_playbook(playbook_id).await?;
        let steps = self.store.list_steps(playbook_id).await?;

        let mut commands = HashMap::new();
        for step in &steps {
            let command = match step.job {
                Some(JobRef::C2(id)) => self.store.get_c2_job(id).await?.map(|j| j.command),
                Some(JobRef::Proxy(id)) => self.store.get_proxy_job(id).await?.map(|j| j.command),
                None => None,
            };
            if let Some(command) = command {
                commands.insert(step.id, command);
            }
        }

        Ok(graph::render_graph(&steps, &commands))
    }

    // ------------------------------------------------------------------
    // Templates
    // ------------------------------------------------------------------

    /// Create-or-update a template definition.
    pub async fn upsert_template(
        &self,
        template: PlaybookTemplate,
    ) -> EngineResult<PlaybookTemplate> {
        self.store.upsert_template(template).await
    }

    pub async fn get_template(&self, id: Uuid) -> EngineResult<Option<PlaybookTemplate>> {
        self.store.get_template(id).await
    }

    /// Dry-run compile: full resolution, rendering, and validation with
    /// nothing persisted.
    pub async fn preview_template(
        &self,
        template_id: Uuid,
        arguments: &HashMap<String, Value>,
    ) -> EngineResult<TemplatePreview> {
        let template = self
            .store
            .get_template(template_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("template {template_id}")))?;
        let context = self.build_context(arguments).await?;
        Ok(self.compiler.preview(&template, &context))
    }

    /// Compile a template into a complete playbook graph and persist it
    /// atomically. Any compile or consistency error persists nothing.
    pub async fn create_from_template(
        &self,
        template_id: Uuid,
        arguments: &HashMap<String, Value>,
    ) -> EngineResult<Playbook> {
        let template = self
            .store
            .get_template(template_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("template {template_id}")))?;

        let context = self.build_context(arguments).await?;
        let specs = self.compiler.compile(&template, &context)?;

        let now = Utc::now();
        let playbook = Playbook {
            id: Uuid::new_v4(),
            name: template.name.clone(),
            description: None,
            status: Status::Created,
            arguments: Some(serde_json::to_value(arguments)?),
            steps: specs.len() as i32,
            completed: 0,
            template_id: Some(template.id),
            time_created: now,
            time_started: None,
            time_completed: None,
        };

        let mut bundle = GraphBundle {
            playbook: playbook.clone(),
            steps: Vec::with_capacity(specs.len()),
            modifiers: Vec::new(),
            c2_jobs: Vec::new(),
            proxy_jobs: Vec::new(),
        };

        let mut previous_label: Option<String> = None;
        for (index, spec) in specs.iter().enumerate() {
            let number = index as i32 + 1;
            let label = match spec.label_override() {
                Some(label) => label.to_string(),
                None => labels::label_for(number as u32)?,
            };
            // Auto-chaining follows the preceding step's actual label, which
            // may be an override.
            let depends_on = match spec.depends_on_override() {
                Some(depends_on) => Some(depends_on.to_string()),
                None if template.add_depends_on => previous_label.clone(),
                None => None,
            };
            previous_label = Some(label.clone());

            let job = self.build_job(&mut bundle, playbook.id, spec, arguments)?;
            let step = PlaybookStep {
                id: Uuid::new_v4(),
                playbook_id: playbook.id,
                number,
                label,
                depends_on,
                delay_seconds: spec.delay,
                execute_after: None,
                job: Some(job),
                status: Status::Created,
                time_created: now,
                time_started: None,
                time_completed: None,
            };

            for m in spec.modifiers.as_deref().unwrap_or_default() {
                bundle.modifiers.push(StepModifier {
                    id: Uuid::new_v4(),
                    step_id: step.id,
                    input_path: m.input_path.clone(),
                    output_path: m.output_path.clone(),
                    regex: m.regex.clone(),
                    on_error: m.on_error,
                    status: None,
                    status_message: None,
                    data: None,
                    time_created: now,
                });
            }
            bundle.steps.push(step);
        }

        // Overridden labels/dependencies can still describe a broken graph.
        graph::topological_order(&bundle.steps)?;

        let step_ids: Vec<Uuid> = bundle.steps.iter().map(|s| s.id).collect();
        self.store.persist_graph(bundle).await?;
        info!(
            playbook_id = %playbook.id,
            template_id = %template.id,
            steps = step_ids.len(),
            "Compiled playbook from template"
        );

        for step_id in step_ids {
            self.notifier
                .publish(playbook.id, PlaybookEvent::NewStep, step_id, None)
                .await;
        }
        Ok(playbook)
    }

    /// Build the owned job for one compiled step spec.
    fn build_job(
        &self,
        bundle: &mut GraphBundle,
        playbook_id: Uuid,
        spec: &TemplateStep,
        arguments: &HashMap<String, Value>,
    ) -> EngineResult<JobRef> {
        // Playbook-level arguments first, per-step args override them.
        let mut job_args = serde_json::Map::new();
        for (key, value) in arguments {
            job_args.insert(key.clone(), value.clone());
        }
        for arg in spec.args.as_deref().unwrap_or_default() {
            job_args.insert(arg.name.clone(), arg.value.clone());
        }
        let job_args = Value::Object(job_args);

        match spec.kind {
            JobKind::C2 => {
                let job = C2Job {
                    id: Uuid::new_v4(),
                    playbook_id: Some(playbook_id),
                    command: spec.name.clone(),
                    arguments: Some(job_args),
                    implant_id: uuid_argument(arguments, "c2_implant_id"),
                    status: Status::Created,
                    time_created: Utc::now(),
                };
                let id = job.id;
                bundle.c2_jobs.push(job);
                Ok(JobRef::C2(id))
            }
            JobKind::Socks => {
                let job = ProxyJob {
                    id: Uuid::new_v4(),
                    playbook_id: Some(playbook_id),
                    command: spec.name.clone(),
                    arguments: Some(job_args),
                    socks_server_id: uuid_argument(arguments, "socks_server_id"),
                    tmate: spec.tmate,
                    asciinema: spec.asciinema,
                    proxychains: spec.proxychains,
                    status: Status::Created,
                    time_created: Utc::now(),
                };
                let id = job.id;
                bundle.proxy_jobs.push(job);
                Ok(JobRef::Proxy(id))
            }
        }
    }

    /// Render context: the raw arguments, resolved entity references, and
    /// the capability labels of the referenced implant.
    async fn build_context(
        &self,
        arguments: &HashMap<String, Value>,
    ) -> EngineResult<HashMap<String, Value>> {
        let mut context = arguments.clone();

        for (key, value) in arguments {
            let Some((kind, suffix)) = entity_ref(key) else {
                continue;
            };
            let Some(id) = value.as_str().and_then(|s| Uuid::parse_str(s).ok()) else {
                continue;
            };
            // Unresolvable ids are left untouched in the context.
            if let Some(entity) = self.store.resolve_entity(kind, id).await? {
                context.insert(format!("{}{}", kind.as_str(), suffix), entity);
            }
        }

        let implant_labels = match uuid_argument(arguments, "c2_implant_id") {
            Some(implant_id) => self.store.implant_labels(implant_id).await?,
            None => Vec::new(),
        };
        context.insert(
            "labels".to_string(),
            Value::Array(implant_labels.into_iter().map(Value::String).collect()),
        );

        Ok(context)
    }

    // ------------------------------------------------------------------
    // Cloning
    // ------------------------------------------------------------------

    /// Deep-copy a playbook graph into a new independent instance: new
    /// ids everywhere, jobs re-pointed, `depends_on` copied verbatim,
    /// modifiers re-targeted, all statuses and stamps reset.
    pub async fn clone_playbook(&self, playbook_id: Uuid) -> EngineResult<Playbook> {
        let _guard = self.playbook_lock(playbook_id).await;
        let source = self.store.load_graph(playbook_id).await?;
        let now = Utc::now();

        let playbook = Playbook {
            id: Uuid::new_v4(),
            name: format!("{}{}", self.clone_prefix, source.playbook.name),
            description: source.playbook.description.clone(),
            status: Status::Created,
            arguments: source.playbook.arguments.clone(),
            steps: source.steps.len() as i32,
            completed: 0,
            template_id: source.playbook.template_id,
            time_created: now,
            time_started: None,
            time_completed: None,
        };

        let mut job_map: HashMap<Uuid, Uuid> = HashMap::new();
        let mut c2_jobs = Vec::with_capacity(source.c2_jobs.len());
        for job in &source.c2_jobs {
            let new_id = Uuid::new_v4();
            job_map.insert(job.id, new_id);
            c2_jobs.push(C2Job {
                id: new_id,
                playbook_id: Some(playbook.id),
                command: job.command.clone(),
                arguments: job.arguments.clone(),
                implant_id: job.implant_id,
                status: Status::Created,
                time_created: now,
            });
        }
        let mut proxy_jobs = Vec::with_capacity(source.proxy_jobs.len());
        for job in &source.proxy_jobs {
            let new_id = Uuid::new_v4();
            job_map.insert(job.id, new_id);
            proxy_jobs.push(ProxyJob {
                id: new_id,
                playbook_id: Some(playbook.id),
                command: job.command.clone(),
                arguments: job.arguments.clone(),
                socks_server_id: job.socks_server_id,
                tmate: job.tmate,
                asciinema: job.asciinema,
                proxychains: job.proxychains,
                status: Status::Created,
                time_created: now,
            });
        }

        let mut step_map: HashMap<Uuid, Uuid> = HashMap::new();
        let mut steps = Vec::with_capacity(source.steps.len());
        for step in &source.steps {
            let new_id = Uuid::new_v4();
            step_map.insert(step.id, new_id);
            let job = match step.job {
                Some(JobRef::C2(id)) => job_map.get(&id).map(|new| JobRef::C2(*new)),
                Some(JobRef::Proxy(id)) => job_map.get(&id).map(|new| JobRef::Proxy(*new)),
                None => None,
            };
            steps.push(PlaybookStep {
                id: new_id,
                playbook_id: playbook.id,
                number: step.number,
                label: step.label.clone(),
                depends_on: step.depends_on.clone(),
                delay_seconds: step.delay_seconds,
                execute_after: step.execute_after,
                job,
                status: Status::Created,
                time_created: now,
                time_started: None,
                time_completed: None,
            });
        }

        let modifiers = source
            .modifiers
            .iter()
            .filter_map(|m| {
                let step_id = step_map.get(&m.step_id)?;
                Some(StepModifier {
                    id: Uuid::new_v4(),
                    step_id: *step_id,
                    input_path: m.input_path.clone(),
                    output_path: m.output_path.clone(),
                    regex: m.regex.clone(),
                    on_error: m.on_error,
                    status: None,
                    status_message: None,
                    data: None,
                    time_created: now,
                })
            })
            .collect();

        let step_ids: Vec<Uuid> = steps.iter().map(|s| s.id).collect();
        self.store
            .persist_graph(GraphBundle {
                playbook: playbook.clone(),
                steps,
                modifiers,
                c2_jobs,
                proxy_jobs,
            })
            .await?;
        info!(
            source_id = %playbook_id,
            playbook_id = %playbook.id,
            "Cloned playbook"
        );

        for step_id in step_ids {
            self.notifier
                .publish(playbook.id, PlaybookEvent::NewStep, step_id, None)
                .await;
        }
        Ok(playbook)
    }

    // ------------------------------------------------------------------
    // Modifier pipeline
    // ------------------------------------------------------------------

    /// Evaluate every modifier of a step against the collected upstream
    /// outputs (keyed by step label), recording each outcome. Returns the
    /// outcomes so the runtime can honor `block_step`.
    pub async fn apply_modifiers(
        &self,
        step_id: Uuid,
        outputs: &HashMap<String, String>,
    ) -> EngineResult<Vec<(Uuid, ModifierOutcome)>> {
        let modifiers = self.store.list_modifiers(step_id).await?;
        let mut outcomes = Vec::with_capacity(modifiers.len());
        for m in &modifiers {
            let outcome = modifier::apply(m, outputs);
            self.store.record_modifier_run(m.id, &outcome).await?;
            outcomes.push((m.id, outcome));
        }
        Ok(outcomes)
    }

    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    pub async fn create_c2_job(&self, new: NewC2Job) -> EngineResult<C2Job> {
        self.store.create_c2_job(new).await
    }

    pub async fn create_proxy_job(&self, new: NewProxyJob) -> EngineResult<ProxyJob> {
        self.store.create_proxy_job(new).await
    }
}

fn uuid_argument(arguments: &HashMap<String, Value>, key: &str) -> Option<Uuid> {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityKind, OnErrorPolicy, TemplateArgument};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn service() -> (PlaybookService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let service = PlaybookService::new(store.clone(), EventNotifier::disabled());
        (service, store)
    }

    fn new_playbook(name: &str) -> NewPlaybook {
        NewPlaybook {
            name: name.to_string(),
            ..NewPlaybook::default()
        }
    }

    fn template(id: Uuid, body: &str, add_depends_on: bool) -> PlaybookTemplate {
        PlaybookTemplate {
            id,
            name: "lateral movement".to_string(),
            icon: String::new(),
            tactic: Some("lateral-movement".to_string()),
            technique: None,
            args: Vec::new(),
            steps: body.to_string(),
            add_depends_on,
        }
    }

    async fn add_plain_step(service: &PlaybookService, playbook_id: Uuid) -> PlaybookStep {
        service
            .add_step(
                NewStep {
                    playbook_id,
                    ..NewStep::default()
                },
                true,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_step_defaults_chain_linearly() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();

        let first = add_plain_step(&service, playbook.id).await;
        assert_eq!((first.number, first.label.as_str()), (1, "A"));
        assert_eq!(first.depends_on, None);

        let second = add_plain_step(&service, playbook.id).await;
        assert_eq!((second.number, second.label.as_str()), (2, "B"));
        assert_eq!(second.depends_on, Some("A".to_string()));

        let third = add_plain_step(&service, playbook.id).await;
        assert_eq!((third.number, third.label.as_str()), (3, "C"));
        assert_eq!(third.depends_on, Some("B".to_string()));

        let playbook = service.get_playbook(playbook.id).await.unwrap().unwrap();
        assert_eq!(playbook.steps, 3);
    }

    #[tokio::test]
    async fn test_delete_middle_step_renumbers_and_relabels() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let _a = add_plain_step(&service, playbook.id).await;
        let b = add_plain_step(&service, playbook.id).await;
        let _c = add_plain_step(&service, playbook.id).await;

        service.delete_step(b.id).await.unwrap();

        let steps = service.list_steps(playbook.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!((steps[0].number, steps[0].label.as_str()), (1, "A"));
        assert_eq!((steps[1].number, steps[1].label.as_str()), (2, "B"));
        // The old C depended on the deleted B; the reference is dropped.
        assert_eq!(steps[1].depends_on, None);

        let playbook = service.get_playbook(playbook.id).await.unwrap().unwrap();
        assert_eq!(playbook.steps, 2);
    }

    #[tokio::test]
    async fn test_delete_step_never_duplicates_labels() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let recon = service
            .add_step(
                NewStep {
                    playbook_id: playbook.id,
                    label: Some("recon".to_string()),
                    ..NewStep::default()
                },
                true,
            )
            .await
            .unwrap();
        add_plain_step(&service, playbook.id).await;
        service
            .add_step(
                NewStep {
                    playbook_id: playbook.id,
                    label: Some("A".to_string()),
                    ..NewStep::default()
                },
                true,
            )
            .await
            .unwrap();

        service.delete_step(recon.id).await.unwrap();

        // The derived "B" cannot compact onto "A": a survivor owns that
        // label explicitly. It keeps its current label instead.
        let steps = service.list_steps(playbook.id).await.unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!((steps[0].number, steps[0].label.as_str()), (1, "B"));
        assert_eq!((steps[1].number, steps[1].label.as_str()), (2, "A"));
        assert_eq!(steps[0].depends_on, None);
        assert_eq!(steps[1].depends_on, Some("B".to_string()));
    }

    #[tokio::test]
    async fn test_delete_step_removes_owned_job() {
        let (service, store) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let job = service
            .create_c2_job(NewC2Job {
                playbook_id: Some(playbook.id),
                command: "whoami".to_string(),
                arguments: None,
                implant_id: None,
            })
            .await
            .unwrap();
        let step = service
            .add_step(
                NewStep {
                    playbook_id: playbook.id,
                    job: Some(JobRef::C2(job.id)),
                    ..NewStep::default()
                },
                true,
            )
            .await
            .unwrap();

        service.delete_step(step.id).await.unwrap();
        assert!(store.get_c2_job(job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_flip_playbook_once() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let a = add_plain_step(&service, playbook.id).await;
        let b = add_plain_step(&service, playbook.id).await;

        service.start_playbook(playbook.id).await.unwrap();

        let t = service
            .update_step_status(a.id, Status::Started)
            .await
            .unwrap();
        assert!(t.step.time_started.is_some());
        assert!(!t.playbook_flipped);

        service
            .update_step_status(a.id, Status::Completed)
            .await
            .unwrap();
        let t = service
            .update_step_status(b.id, Status::Completed)
            .await
            .unwrap();
        assert!(t.playbook_flipped);
        assert_eq!(t.playbook.status, Status::Completed);
        assert_eq!(t.playbook.completed, 2);
        let stamp = t.playbook.time_completed.unwrap();

        // Repeating the identical terminal transition re-stamps nothing.
        let t = service
            .update_step_status(b.id, Status::Completed)
            .await
            .unwrap();
        assert!(!t.playbook_flipped);
        assert_eq!(t.playbook.time_completed, Some(stamp));
    }

    #[tokio::test]
    async fn test_errored_step_fails_the_playbook() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let a = add_plain_step(&service, playbook.id).await;
        let b = add_plain_step(&service, playbook.id).await;

        service
            .update_step_status(a.id, Status::Completed)
            .await
            .unwrap();
        let t = service.update_step_status(b.id, Status::Error).await.unwrap();
        assert!(t.playbook_flipped);
        assert_eq!(t.playbook.status, Status::Error);
        assert_eq!(t.playbook.completed, 1);
    }

    #[tokio::test]
    async fn test_start_playbook_rejects_restart() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        service.start_playbook(playbook.id).await.unwrap();
        assert!(matches!(
            service.start_playbook(playbook.id).await.unwrap_err(),
            EngineError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_update_job_status_resolves_step() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let job = service
            .create_proxy_job(NewProxyJob {
                playbook_id: Some(playbook.id),
                command: "nmap".to_string(),
                arguments: None,
                socks_server_id: None,
                tmate: true,
                asciinema: true,
                proxychains: true,
            })
            .await
            .unwrap();
        let step = service
            .add_step(
                NewStep {
                    playbook_id: playbook.id,
                    job: Some(JobRef::Proxy(job.id)),
                    ..NewStep::default()
                },
                true,
            )
            .await
            .unwrap();

        let t = service
            .update_job_status(JobRef::Proxy(job.id), Status::Started)
            .await
            .unwrap();
        assert_eq!(t.step.id, step.id);
        assert_eq!(t.step.status, Status::Started);
    }

    #[tokio::test]
    async fn test_render_graph_and_validate() {
        let (service, _) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let job = service
            .create_c2_job(NewC2Job {
                playbook_id: Some(playbook.id),
                command: "whoami".to_string(),
                arguments: None,
                implant_id: None,
            })
            .await
            .unwrap();
        service
            .add_step(
                NewStep {
                    playbook_id: playbook.id,
                    job: Some(JobRef::C2(job.id)),
                    ..NewStep::default()
                },
                true,
            )
            .await
            .unwrap();
        add_plain_step(&service, playbook.id).await;

        assert_eq!(
            service.validate(playbook.id).await.unwrap(),
            vec!["A", "B"]
        );

        let rendered = service.render_graph(playbook.id).await.unwrap();
        assert!(rendered.correct);
        assert!(rendered.graph.contains("A(A: whoami)"));
        assert!(rendered.graph.contains("A-->B"));
    }

    #[tokio::test]
    async fn test_create_from_template_builds_whole_graph() {
        let (service, store) = service();
        let template_id = Uuid::new_v4();
        let body = "\
- type: c2
  name: whoami
  modifiers:
    - input_path: A
      output_path: username
      regex: '\\\\(\\S+)'
- type: socks
  name: nmap {{ target }}
  tmate: false
";
        service
            .upsert_template(template(template_id, body, true))
            .await
            .unwrap();

        let mut arguments = HashMap::new();
        arguments.insert("target".to_string(), json!("10.0.0.5"));
        let playbook = service
            .create_from_template(template_id, &arguments)
            .await
            .unwrap();

        assert_eq!(playbook.steps, 2);
        assert_eq!(playbook.completed, 0);
        assert_eq!(playbook.template_id, Some(template_id));
        assert_eq!(playbook.arguments, Some(json!({"target": "10.0.0.5"})));

        let steps = service.list_steps(playbook.id).await.unwrap();
        assert_eq!(steps[0].label, "A");
        assert_eq!(steps[1].depends_on, Some("A".to_string()));
        assert!(matches!(steps[0].job, Some(JobRef::C2(_))));

        let Some(JobRef::Proxy(proxy_id)) = steps[1].job else {
            panic!("second step should own a proxy job");
        };
        let proxy = store.get_proxy_job(proxy_id).await.unwrap().unwrap();
        assert_eq!(proxy.command, "nmap 10.0.0.5");
        assert!(!proxy.tmate);
        assert_eq!(proxy.playbook_id, Some(playbook.id));

        let modifiers = store.list_modifiers(steps[0].id).await.unwrap();
        assert_eq!(modifiers.len(), 1);
        assert_eq!(modifiers[0].output_path, "username");
    }

    #[tokio::test]
    async fn test_template_auto_chain_follows_label_overrides() {
        let (service, _) = service();
        let template_id = Uuid::new_v4();
        let body = "\
- type: c2
  name: whoami
  label: recon
- type: c2
  name: secretsdump
";
        service
            .upsert_template(template(template_id, body, true))
            .await
            .unwrap();

        let playbook = service
            .create_from_template(template_id, &HashMap::new())
            .await
            .unwrap();

        let steps = service.list_steps(playbook.id).await.unwrap();
        assert_eq!(steps[0].label, "recon");
        assert_eq!(steps[1].label, "B");
        assert_eq!(steps[1].depends_on, Some("recon".to_string()));
    }

    #[tokio::test]
    async fn test_compile_failure_persists_nothing() {
        let (service, store) = service();
        let template_id = Uuid::new_v4();
        service
            .upsert_template(template(template_id, "- type: c2\n  name: {{ nope }}\n", true))
            .await
            .unwrap();

        let err = service
            .create_from_template(template_id, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));

        // No playbook, no steps, no jobs were written.
        assert!(store
            .step_for_job(JobRef::C2(Uuid::nil()))
            .await
            .unwrap()
            .is_none());
        let graph = store.load_graph(Uuid::nil()).await;
        assert!(graph.is_err());
    }

    #[tokio::test]
    async fn test_entity_resolution_feeds_the_context() {
        let (service, store) = service();
        let credential_id = Uuid::new_v4();
        store
            .insert_entity(
                EntityKind::Credential,
                credential_id,
                json!({"username": "alice", "password": "hunter2"}),
            )
            .await;

        let template_id = Uuid::new_v4();
        service
            .upsert_template(template(
                template_id,
                "- type: c2\n  name: login {{ credential.username }}\n",
                true,
            ))
            .await
            .unwrap();

        let mut arguments = HashMap::new();
        arguments.insert("credential_id".to_string(), json!(credential_id.to_string()));
        let playbook = service
            .create_from_template(template_id, &arguments)
            .await
            .unwrap();

        let steps = service.list_steps(playbook.id).await.unwrap();
        let Some(JobRef::C2(job_id)) = steps[0].job else {
            panic!("expected a c2 job");
        };
        let job = store.get_c2_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.command, "login alice");
    }

    #[tokio::test]
    async fn test_implant_labels_reach_templates() {
        let (service, store) = service();
        let implant_id = Uuid::new_v4();
        store
            .insert_entity(EntityKind::C2Implant, implant_id, json!({"hostname": "dc01"}))
            .await;
        store
            .set_implant_labels(implant_id, vec!["elevated".to_string()])
            .await;

        let template_id = Uuid::new_v4();
        let body = "\
{% if 'elevated' in labels %}
- type: c2
  name: secretsdump
{% endif %}
- type: c2
  name: whoami
";
        service
            .upsert_template(template(template_id, body, true))
            .await
            .unwrap();

        let mut arguments = HashMap::new();
        arguments.insert("c2_implant_id".to_string(), json!(implant_id.to_string()));
        let playbook = service
            .create_from_template(template_id, &arguments)
            .await
            .unwrap();
        assert_eq!(playbook.steps, 2);

        let steps = service.list_steps(playbook.id).await.unwrap();
        let Some(JobRef::C2(job_id)) = steps[0].job else {
            panic!("expected a c2 job");
        };
        let job = store.get_c2_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.command, "secretsdump");
        assert_eq!(job.implant_id, Some(implant_id));
    }

    #[tokio::test]
    async fn test_preview_persists_nothing() {
        let (service, _) = service();
        let template_id = Uuid::new_v4();
        service
            .upsert_template(template(template_id, "- type: c2\n  name: ls\n", true))
            .await
            .unwrap();

        let preview = service
            .preview_template(template_id, &HashMap::new())
            .await
            .unwrap();
        assert!(preview.valid);
        assert!(preview.steps.contains("name: ls"));
        // A preview creates no steps anywhere; there is no playbook to list.
    }

    #[tokio::test]
    async fn test_clone_copies_structure_and_resets_progress() {
        let (service, store) = service();
        let playbook = service.create_playbook(new_playbook("loot")).await.unwrap();
        let job = service
            .create_c2_job(NewC2Job {
                playbook_id: Some(playbook.id),
                command: "whoami".to_string(),
                arguments: None,
                implant_id: None,
            })
            .await
            .unwrap();
        let a = service
            .add_step(
                NewStep {
                    playbook_id: playbook.id,
                    job: Some(JobRef::C2(job.id)),
                    ..NewStep::default()
                },
                true,
            )
            .await
            .unwrap();
        add_plain_step(&service, playbook.id).await;
        add_plain_step(&service, playbook.id).await;
        service
            .add_modifier(NewStepModifier {
                step_id: a.id,
                input_path: "A".to_string(),
                output_path: "username".to_string(),
                regex: Some(r"(\S+)\\".to_string()),
                on_error: OnErrorPolicy::Continue,
            })
            .await
            .unwrap();
        service.update_step_status(a.id, Status::Completed).await.unwrap();

        let clone = service.clone_playbook(playbook.id).await.unwrap();
        assert_ne!(clone.id, playbook.id);
        assert_eq!(clone.name, "Clone of loot");
        assert_eq!(clone.steps, 3);
        assert_eq!(clone.completed, 0);
        assert_eq!(clone.status, Status::Created);

        let cloned_steps = service.list_steps(clone.id).await.unwrap();
        assert_eq!(cloned_steps.len(), 3);
        assert_eq!(cloned_steps[0].label, "A");
        assert_eq!(cloned_steps[1].depends_on, Some("A".to_string()));
        assert_eq!(cloned_steps[0].status, Status::Created);
        assert!(cloned_steps[0].time_completed.is_none());

        // The owned job was duplicated and re-pointed, not shared.
        let Some(JobRef::C2(cloned_job_id)) = cloned_steps[0].job else {
            panic!("expected a cloned c2 job");
        };
        assert_ne!(cloned_job_id, job.id);
        let cloned_job = store.get_c2_job(cloned_job_id).await.unwrap().unwrap();
        assert_eq!(cloned_job.command, "whoami");
        assert_eq!(cloned_job.playbook_id, Some(clone.id));

        // Modifier copied with identical paths onto the new step.
        let cloned_modifiers = store.list_modifiers(cloned_steps[0].id).await.unwrap();
        assert_eq!(cloned_modifiers.len(), 1);
        assert_eq!(cloned_modifiers[0].output_path, "username");
        assert_eq!(cloned_modifiers[0].regex, Some(r"(\S+)\\".to_string()));
        assert_ne!(cloned_modifiers[0].step_id, a.id);
        assert!(cloned_modifiers[0].status.is_none());
    }

    #[tokio::test]
    async fn test_clone_publishes_new_step_events() {
        let store = Arc::new(MemoryStore::new());
        let (notifier, mut events) = EventNotifier::channel();
        let service = PlaybookService::new(store, notifier);

        let playbook = service.create_playbook(new_playbook("loot")).await.unwrap();
        add_plain_step(&service, playbook.id).await;
        add_plain_step(&service, playbook.id).await;

        let clone = service.clone_playbook(playbook.id).await.unwrap();

        let mut cloned_new_steps = 0;
        while let Ok((channel_id, message)) = events.try_recv() {
            if channel_id == clone.id {
                assert_eq!(message.event, "new_step");
                cloned_new_steps += 1;
            }
        }
        assert_eq!(cloned_new_steps, 2);
    }

    #[tokio::test]
    async fn test_action_cascade_mirrors_playbook_lifecycle() {
        let (service, store) = service();
        let template_id = Uuid::new_v4();
        service
            .upsert_template(template(template_id, "- type: c2\n  name: ls\n", true))
            .await
            .unwrap();
        store.add_action("initial access", &[template_id]).await;

        let playbook = service
            .create_from_template(template_id, &HashMap::new())
            .await
            .unwrap();
        service.start_playbook(playbook.id).await.unwrap();

        let actions = store.actions_for_template(template_id).await.unwrap();
        assert_eq!(actions[0].status, Some(Status::Running));
        assert!(actions[0].time_started.is_some());

        let steps = service.list_steps(playbook.id).await.unwrap();
        service
            .update_step_status(steps[0].id, Status::Completed)
            .await
            .unwrap();

        let actions = store.actions_for_template(template_id).await.unwrap();
        assert_eq!(actions[0].status, Some(Status::Completed));
        assert!(actions[0].time_completed.is_some());
    }

    #[tokio::test]
    async fn test_apply_modifiers_records_outcomes() {
        let (service, store) = service();
        let playbook = service.create_playbook(new_playbook("pb")).await.unwrap();
        let step = add_plain_step(&service, playbook.id).await;
        service
            .add_modifier(NewStepModifier {
                step_id: step.id,
                input_path: "A".to_string(),
                output_path: "username".to_string(),
                regex: Some(r"user=(\S+)".to_string()),
                on_error: OnErrorPolicy::Continue,
            })
            .await
            .unwrap();

        let mut outputs = HashMap::new();
        outputs.insert("A".to_string(), "user=alice".to_string());
        let outcomes = service.apply_modifiers(step.id, &outputs).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1.data.as_deref(), Some("alice"));

        let modifiers = store.list_modifiers(step.id).await.unwrap();
        assert_eq!(modifiers[0].status, Some(Status::Completed));
        assert_eq!(modifiers[0].data.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_template_with_declared_arguments() {
        let (service, _) = service();
        let template_id = Uuid::new_v4();
        let mut t = template(template_id, "- type: c2\n  name: ping {{ host }}\n", true);
        t.args = vec![TemplateArgument {
            name: "host".to_string(),
            argument_type: crate::model::ArgumentType::Str,
            required: true,
            default: None,
            options: None,
            description: None,
        }];
        service.upsert_template(t).await.unwrap();

        let err = service
            .create_from_template(template_id, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Compile(_)));

        let mut arguments = HashMap::new();
        arguments.insert("host".to_string(), json!("10.0.0.9"));
        let playbook = service
            .create_from_template(template_id, &arguments)
            .await
            .unwrap();
        assert_eq!(playbook.steps, 1);
    }

    #[tokio::test]
    async fn test_compile_rejects_broken_dependency_overrides() {
        let (service, _) = service();
        let template_id = Uuid::new_v4();
        let body = "\
- type: c2
  name: ls
  depends_on: ZZ
";
        service
            .upsert_template(template(template_id, body, true))
            .await
            .unwrap();

        let err = service
            .create_from_template(template_id, &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::GraphConsistency(_)));
    }
}
