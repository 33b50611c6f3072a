//! Postgres store.
//!
//! Runtime-checked queries over a `PgPool`. Composite operations run inside
//! a single transaction that first locks the owning playbook row, so every
//! structural mutation and status recompute of one playbook is serialized
//! at the database even across processes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{EngineError, EngineResult};
use crate::graph::StepRewire;
use crate::model::{
    Action, C2Job, EntityKind, JobRef, NewC2Job, NewPlaybook, NewProxyJob, NewStepModifier,
    Playbook, PlaybookStep, PlaybookTemplate, ProxyJob, Status, StepModifier,
};
use crate::modifier::ModifierOutcome;
use crate::store::{recompute_playbook, stamp_step_status, GraphBundle, StatusTransition, Store};

const PLAYBOOK_COLS: &str = "id, name, description, status, arguments, steps, completed, \
     template_id, time_created, time_started, time_completed";

const STEP_COLS: &str = "id, playbook_id, number, label, depends_on, delay_seconds, \
     execute_after, job_kind, job_id, status, time_created, time_started, time_completed";

const MODIFIER_COLS: &str = "id, step_id, input_path, output_path, regex, on_error, status, \
     status_message, data, time_created";

const C2_JOB_COLS: &str = "id, playbook_id, command, arguments, implant_id, status, time_created";

const PROXY_JOB_COLS: &str = "id, playbook_id, command, arguments, socks_server_id, tmate, \
     asciinema, proxychains, status, time_created";

const TEMPLATE_COLS: &str = "id, name, icon, tactic, technique, args, steps, add_depends_on";

type PlaybookRow = (
    Uuid,
    String,
    Option<String>,
    String,
    Option<Value>,
    i32,
    i32,
    Option<Uuid>,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

type StepRow = (
    Uuid,
    Uuid,
    i32,
    String,
    Option<String>,
    Option<i64>,
    Option<DateTime<Utc>>,
    Option<String>,
    Option<Uuid>,
    String,
    DateTime<Utc>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
);

type ModifierRow = (
    Uuid,
    Uuid,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    DateTime<Utc>,
);

type C2JobRow = (
    Uuid,
    Option<Uuid>,
    String,
    Option<Value>,
    Option<Uuid>,
    String,
    DateTime<Utc>,
);

type ProxyJobRow = (
    Uuid,
    Option<Uuid>,
    String,
    Option<Value>,
    Option<Uuid>,
    bool,
    bool,
    bool,
    String,
    DateTime<Utc>,
);

type TemplateRow = (
    Uuid,
    String,
    String,
    Option<String>,
    Option<String>,
    Value,
    String,
    bool,
);

// ============================================================================
// Row mapping
// ============================================================================

fn job_columns(job: Option<JobRef>) -> (Option<&'static str>, Option<Uuid>) {
    match job {
        Some(JobRef::C2(id)) => (Some("c2"), Some(id)),
        Some(JobRef::Proxy(id)) => (Some("proxy"), Some(id)),
        None => (None, None),
    }
}

fn job_from_columns(kind: Option<&str>, id: Option<Uuid>) -> EngineResult<Option<JobRef>> {
    match (kind, id) {
        (Some("c2"), Some(id)) => Ok(Some(JobRef::C2(id))),
        (Some("proxy"), Some(id)) => Ok(Some(JobRef::Proxy(id))),
        (None, None) => Ok(None),
        (kind, id) => Err(EngineError::Parse(format!(
            "inconsistent job reference: kind={kind:?} id={id:?}"
        ))),
    }
}

fn playbook_from_row(row: PlaybookRow) -> EngineResult<Playbook> {
    let (
        id,
        name,
        description,
        status,
        arguments,
        steps,
        completed,
        template_id,
        time_created,
        time_started,
        time_completed,
    ) = row;
    Ok(Playbook {
        id,
        name,
        description,
        status: status.parse()?,
        arguments,
        steps,
        completed,
        template_id,
        time_created,
        time_started,
        time_completed,
    })
}

fn step_from_row(row: StepRow) -> EngineResult<PlaybookStep> {
    let (
        id,
        playbook_id,
        number,
        label,
        depends_on,
        delay_seconds,
        execute_after,
        job_kind,
        job_id,
        status,
        time_created,
        time_started,
        time_completed,
    ) = row;
    Ok(PlaybookStep {
        id,
        playbook_id,
        number,
        label,
        depends_on,
        delay_seconds,
        execute_after,
        job: job_from_columns(job_kind.as_deref(), job_id)?,
        status: status.parse()?,
        time_created,
        time_started,
        time_completed,
    })
}

fn modifier_from_row(row: ModifierRow) -> EngineResult<StepModifier> {
    let (
        id,
        step_id,
        input_path,
        output_path,
        regex,
        on_error,
        status,
        status_message,
        data,
        time_created,
    ) = row;
    Ok(StepModifier {
        id,
        step_id,
        input_path,
        output_path,
        regex,
        on_error: on_error.parse()?,
        status: status.as_deref().map(str::parse).transpose()?,
        status_message,
        data,
        time_created,
    })
}

fn c2_job_from_row(row: C2JobRow) -> EngineResult<C2Job> {
    let (id, playbook_id, command, arguments, implant_id, status, time_created) = row;
    Ok(C2Job {
        id,
        playbook_id,
        command,
        arguments,
        implant_id,
        status: status.parse()?,
        time_created,
    })
}

fn proxy_job_from_row(row: ProxyJobRow) -> EngineResult<ProxyJob> {
    let (
        id,
        playbook_id,
        command,
        arguments,
        socks_server_id,
        tmate,
        asciinema,
        proxychains,
        status,
        time_created,
    ) = row;
    Ok(ProxyJob {
        id,
        playbook_id,
        command,
        arguments,
        socks_server_id,
        tmate,
        asciinema,
        proxychains,
        status: status.parse()?,
        time_created,
    })
}

fn template_from_row(row: TemplateRow) -> EngineResult<PlaybookTemplate> {
    let (id, name, icon, tactic, technique, args, steps, add_depends_on) = row;
    Ok(PlaybookTemplate {
        id,
        name,
        icon,
        tactic,
        technique,
        args: serde_json::from_value(args)?,
        steps,
        add_depends_on,
    })
}

fn entity_table(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Credential => "credentials",
        EntityKind::C2Implant => "c2_implants",
        EntityKind::Kerberos => "kerberos",
        EntityKind::File => "files",
    }
}

/// Postgres-backed `Store` implementation.
#[derive(Clone)]
pub struct PgStore {
    db: DbPool,
}

impl PgStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Apply pending schema migrations.
    pub async fn migrate(&self) -> EngineResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.db)
            .await
            .map_err(|e| EngineError::Database(e.into()))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    /// Lock the playbook row for the duration of the transaction.
    async fn lock_playbook(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        playbook_id: Uuid,
    ) -> EngineResult<Playbook> {
        let row: Option<PlaybookRow> = sqlx::query_as(&format!(
            "SELECT {PLAYBOOK_COLS} FROM playbooks WHERE id = $1 FOR UPDATE"
        ))
        .bind(playbook_id)
        .fetch_optional(&mut **tx)
        .await?;
        playbook_from_row(row.ok_or_else(|| {
            EngineError::NotFound(format!("playbook {playbook_id}"))
        })?)
    }

    async fn steps_in_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        playbook_id: Uuid,
    ) -> EngineResult<Vec<PlaybookStep>> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLS} FROM playbook_steps WHERE playbook_id = $1 ORDER BY number"
        ))
        .bind(playbook_id)
        .fetch_all(&mut **tx)
        .await?;
        rows.into_iter().map(step_from_row).collect()
    }

    async fn insert_step_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        step: &PlaybookStep,
    ) -> EngineResult<()> {
        let (job_kind, job_id) = job_columns(step.job);
        sqlx::query(
            "INSERT INTO playbook_steps \
             (id, playbook_id, number, label, depends_on, delay_seconds, execute_after, \
              job_kind, job_id, status, time_created, time_started, time_completed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(step.id)
        .bind(step.playbook_id)
        .bind(step.number)
        .bind(&step.label)
        .bind(&step.depends_on)
        .bind(step.delay_seconds)
        .bind(step.execute_after)
        .bind(job_kind)
        .bind(job_id)
        .bind(step.status.as_str())
        .bind(step.time_created)
        .bind(step.time_started)
        .bind(step.time_completed)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn apply_rewires(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        rewires: &[StepRewire],
    ) -> EngineResult<()> {
        for rewire in rewires {
            sqlx::query(
                "UPDATE playbook_steps SET number = $2, label = $3, depends_on = $4 WHERE id = $1",
            )
            .bind(rewire.step_id)
            .bind(rewire.number)
            .bind(&rewire.label)
            .bind(&rewire.depends_on)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn refresh_counters(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        playbook_id: Uuid,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE playbooks SET \
               steps = (SELECT COUNT(*) FROM playbook_steps WHERE playbook_id = $1), \
               completed = (SELECT COUNT(*) FROM playbook_steps \
                            WHERE playbook_id = $1 AND status IN ('completed', 'skipped')) \
             WHERE id = $1",
        )
        .bind(playbook_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn delete_owned_job(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: Option<JobRef>,
    ) -> EngineResult<()> {
        match job {
            Some(JobRef::C2(id)) => {
                sqlx::query("DELETE FROM c2_jobs WHERE id = $1")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
            Some(JobRef::Proxy(id)) => {
                sqlx::query("DELETE FROM proxy_jobs WHERE id = $1")
                    .bind(id)
                    .execute(&mut **tx)
                    .await?;
            }
            None => {}
        }
        Ok(())
    }

    async fn insert_c2_job_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &C2Job,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO c2_jobs (id, playbook_id, command, arguments, implant_id, status, time_created) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(job.id)
        .bind(job.playbook_id)
        .bind(&job.command)
        .bind(&job.arguments)
        .bind(job.implant_id)
        .bind(job.status.as_str())
        .bind(job.time_created)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_proxy_job_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        job: &ProxyJob,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO proxy_jobs \
             (id, playbook_id, command, arguments, socks_server_id, tmate, asciinema, \
              proxychains, status, time_created) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(job.id)
        .bind(job.playbook_id)
        .bind(&job.command)
        .bind(&job.arguments)
        .bind(job.socks_server_id)
        .bind(job.tmate)
        .bind(job.asciinema)
        .bind(job.proxychains)
        .bind(job.status.as_str())
        .bind(job.time_created)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn insert_modifier_row(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        modifier: &StepModifier,
    ) -> EngineResult<()> {
        sqlx::query(
            "INSERT INTO step_modifiers \
             (id, step_id, input_path, output_path, regex, on_error, status, status_message, \
              data, time_created) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(modifier.id)
        .bind(modifier.step_id)
        .bind(&modifier.input_path)
        .bind(&modifier.output_path)
        .bind(&modifier.regex)
        .bind(modifier.on_error.as_str())
        .bind(modifier.status.map(|s| s.as_str()))
        .bind(&modifier.status_message)
        .bind(&modifier.data)
        .bind(modifier.time_created)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
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
        sqlx::query(
            "INSERT INTO playbooks \
             (id, name, description, status, arguments, steps, completed, template_id, time_created) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(playbook.id)
        .bind(&playbook.name)
        .bind(&playbook.description)
        .bind(playbook.status.as_str())
        .bind(&playbook.arguments)
        .bind(playbook.steps)
        .bind(playbook.completed)
        .bind(playbook.template_id)
        .bind(playbook.time_created)
        .execute(&self.db)
        .await?;
        Ok(playbook)
    }

    async fn get_playbook(&self, id: Uuid) -> EngineResult<Option<Playbook>> {
        let row: Option<PlaybookRow> = sqlx::query_as(&format!(
            "SELECT {PLAYBOOK_COLS} FROM playbooks WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(playbook_from_row).transpose()
    }

    async fn update_playbook_meta(
        &self,
        id: Uuid,
        name: String,
        description: Option<String>,
    ) -> EngineResult<Playbook> {
        let row: Option<PlaybookRow> = sqlx::query_as(&format!(
            "UPDATE playbooks SET name = $2, description = $3 WHERE id = $1 \
             RETURNING {PLAYBOOK_COLS}"
        ))
        .bind(id)
        .bind(&name)
        .bind(&description)
        .fetch_optional(&self.db)
        .await?;
        playbook_from_row(row.ok_or_else(|| EngineError::NotFound(format!("playbook {id}")))?)
    }

    async fn start_playbook(&self, id: Uuid) -> EngineResult<Playbook> {
        let row: Option<PlaybookRow> = sqlx::query_as(&format!(
            "UPDATE playbooks SET status = 'running', time_started = now() \
             WHERE id = $1 AND status = 'created' RETURNING {PLAYBOOK_COLS}"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        if let Some(row) = row {
            return playbook_from_row(row);
        }

        // Distinguish the missing playbook from the already-started one.
        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM playbooks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        match current {
            Some((status,)) => Err(EngineError::Conflict(format!(
                "playbook {id} is {status}, not created"
            ))),
            None => Err(EngineError::NotFound(format!("playbook {id}"))),
        }
    }

    async fn delete_playbook(&self, id: Uuid) -> EngineResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query(
            "DELETE FROM c2_jobs WHERE id IN \
             (SELECT job_id FROM playbook_steps WHERE playbook_id = $1 AND job_kind = 'c2')",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM proxy_jobs WHERE id IN \
             (SELECT job_id FROM playbook_steps WHERE playbook_id = $1 AND job_kind = 'proxy')",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM playbooks WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("playbook {id}")));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_steps(&self, playbook_id: Uuid) -> EngineResult<Vec<PlaybookStep>> {
        let rows: Vec<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLS} FROM playbook_steps WHERE playbook_id = $1 ORDER BY number"
        ))
        .bind(playbook_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(step_from_row).collect()
    }

    async fn get_step(&self, id: Uuid) -> EngineResult<Option<PlaybookStep>> {
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLS} FROM playbook_steps WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(step_from_row).transpose()
    }

    async fn insert_step(&self, step: PlaybookStep, rewires: &[StepRewire]) -> EngineResult<()> {
        let mut tx = self.db.begin().await?;
        Self::lock_playbook(&mut tx, step.playbook_id).await?;
        let playbook_id = step.playbook_id;
        Self::insert_step_row(&mut tx, &step).await?;
        Self::apply_rewires(&mut tx, rewires).await?;
        Self::refresh_counters(&mut tx, playbook_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_step(&self, step: &PlaybookStep) -> EngineResult<()> {
        let (job_kind, job_id) = job_columns(step.job);
        let result = sqlx::query(
            "UPDATE playbook_steps SET number = $2, label = $3, depends_on = $4, \
             delay_seconds = $5, execute_after = $6, job_kind = $7, job_id = $8, \
             status = $9, time_started = $10, time_completed = $11 \
             WHERE id = $1",
        )
        .bind(step.id)
        .bind(step.number)
        .bind(&step.label)
        .bind(&step.depends_on)
        .bind(step.delay_seconds)
        .bind(step.execute_after)
        .bind(job_kind)
        .bind(job_id)
        .bind(step.status.as_str())
        .bind(step.time_started)
        .bind(step.time_completed)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("step {}", step.id)));
        }
        Ok(())
    }

    async fn remove_step(&self, step_id: Uuid, rewires: &[StepRewire]) -> EngineResult<()> {
        let mut tx = self.db.begin().await?;
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLS} FROM playbook_steps WHERE id = $1"
        ))
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await?;
        let step = step_from_row(
            row.ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?,
        )?;

        Self::lock_playbook(&mut tx, step.playbook_id).await?;
        Self::delete_owned_job(&mut tx, step.job).await?;
        sqlx::query("DELETE FROM playbook_steps WHERE id = $1")
            .bind(step_id)
            .execute(&mut *tx)
            .await?;
        Self::apply_rewires(&mut tx, rewires).await?;
        Self::refresh_counters(&mut tx, step.playbook_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_step_status(
        &self,
        step_id: Uuid,
        status: Status,
        now: DateTime<Utc>,
    ) -> EngineResult<StatusTransition> {
        let mut tx = self.db.begin().await?;
        let playbook_id: Option<(Uuid,)> =
            sqlx::query_as("SELECT playbook_id FROM playbook_steps WHERE id = $1")
                .bind(step_id)
                .fetch_optional(&mut *tx)
                .await?;
        let (playbook_id,) =
            playbook_id.ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?;

        let mut playbook = Self::lock_playbook(&mut tx, playbook_id).await?;

        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLS} FROM playbook_steps WHERE id = $1"
        ))
        .bind(step_id)
        .fetch_optional(&mut *tx)
        .await?;
        let mut step = step_from_row(
            row.ok_or_else(|| EngineError::NotFound(format!("step {step_id}")))?,
        )?;

        stamp_step_status(&mut step, status, now);
        sqlx::query(
            "UPDATE playbook_steps SET status = $2, time_started = $3, time_completed = $4 \
             WHERE id = $1",
        )
        .bind(step.id)
        .bind(step.status.as_str())
        .bind(step.time_started)
        .bind(step.time_completed)
        .execute(&mut *tx)
        .await?;

        let siblings = Self::steps_in_tx(&mut tx, playbook_id).await?;
        let playbook_flipped = recompute_playbook(&mut playbook, &siblings, now);
        sqlx::query(
            "UPDATE playbooks SET steps = $2, completed = $3, status = $4, time_completed = $5 \
             WHERE id = $1",
        )
        .bind(playbook.id)
        .bind(playbook.steps)
        .bind(playbook.completed)
        .bind(playbook.status.as_str())
        .bind(playbook.time_completed)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(StatusTransition {
            step,
            playbook,
            playbook_flipped,
        })
    }

    async fn step_for_job(&self, job: JobRef) -> EngineResult<Option<PlaybookStep>> {
        let (job_kind, job_id) = job_columns(Some(job));
        let row: Option<StepRow> = sqlx::query_as(&format!(
            "SELECT {STEP_COLS} FROM playbook_steps WHERE job_kind = $1 AND job_id = $2"
        ))
        .bind(job_kind)
        .bind(job_id)
        .fetch_optional(&self.db)
        .await?;
        row.map(step_from_row).transpose()
    }

    async fn create_modifier(&self, new: NewStepModifier) -> EngineResult<StepModifier> {
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
        let mut tx = self.db.begin().await?;
        Self::insert_modifier_row(&mut tx, &modifier).await?;
        tx.commit().await?;
        Ok(modifier)
    }

    async fn list_modifiers(&self, step_id: Uuid) -> EngineResult<Vec<StepModifier>> {
        let rows: Vec<ModifierRow> = sqlx::query_as(&format!(
            "SELECT {MODIFIER_COLS} FROM step_modifiers WHERE step_id = $1 ORDER BY time_created"
        ))
        .bind(step_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter().map(modifier_from_row).collect()
    }

    async fn record_modifier_run(
        &self,
        modifier_id: Uuid,
        outcome: &ModifierOutcome,
    ) -> EngineResult<()> {
        let result = sqlx::query(
            "UPDATE step_modifiers SET status = $2, status_message = $3, data = $4 WHERE id = $1",
        )
        .bind(modifier_id)
        .bind(outcome.status.as_str())
        .bind(&outcome.message)
        .bind(&outcome.data)
        .execute(&self.db)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::NotFound(format!("modifier {modifier_id}")));
        }
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
        let mut tx = self.db.begin().await?;
        Self::insert_c2_job_row(&mut tx, &job).await?;
        tx.commit().await?;
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
        let mut tx = self.db.begin().await?;
        Self::insert_proxy_job_row(&mut tx, &job).await?;
        tx.commit().await?;
        Ok(job)
    }

    async fn get_c2_job(&self, id: Uuid) -> EngineResult<Option<C2Job>> {
        let row: Option<C2JobRow> = sqlx::query_as(&format!(
            "SELECT {C2_JOB_COLS} FROM c2_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(c2_job_from_row).transpose()
    }

    async fn get_proxy_job(&self, id: Uuid) -> EngineResult<Option<ProxyJob>> {
        let row: Option<ProxyJobRow> = sqlx::query_as(&format!(
            "SELECT {PROXY_JOB_COLS} FROM proxy_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(proxy_job_from_row).transpose()
    }

    async fn upsert_template(&self, template: PlaybookTemplate) -> EngineResult<PlaybookTemplate> {
        let args = serde_json::to_value(&template.args)?;
        let row: TemplateRow = sqlx::query_as(&format!(
            "INSERT INTO playbook_templates \
             (id, name, icon, tactic, technique, args, steps, add_depends_on) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
               name = EXCLUDED.name, icon = EXCLUDED.icon, tactic = EXCLUDED.tactic, \
               technique = EXCLUDED.technique, args = EXCLUDED.args, steps = EXCLUDED.steps, \
               add_depends_on = EXCLUDED.add_depends_on \
             RETURNING {TEMPLATE_COLS}"
        ))
        .bind(template.id)
        .bind(&template.name)
        .bind(&template.icon)
        .bind(&template.tactic)
        .bind(&template.technique)
        .bind(args)
        .bind(&template.steps)
        .bind(template.add_depends_on)
        .fetch_one(&self.db)
        .await?;
        template_from_row(row)
    }

    async fn get_template(&self, id: Uuid) -> EngineResult<Option<PlaybookTemplate>> {
        let row: Option<TemplateRow> = sqlx::query_as(&format!(
            "SELECT {TEMPLATE_COLS} FROM playbook_templates WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        row.map(template_from_row).transpose()
    }

    async fn persist_graph(&self, bundle: GraphBundle) -> EngineResult<()> {
        let mut tx = self.db.begin().await?;
        let playbook = &bundle.playbook;
        sqlx::query(
            "INSERT INTO playbooks \
             (id, name, description, status, arguments, steps, completed, template_id, \
              time_created, time_started, time_completed) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(playbook.id)
        .bind(&playbook.name)
        .bind(&playbook.description)
        .bind(playbook.status.as_str())
        .bind(&playbook.arguments)
        .bind(playbook.steps)
        .bind(playbook.completed)
        .bind(playbook.template_id)
        .bind(playbook.time_created)
        .bind(playbook.time_started)
        .bind(playbook.time_completed)
        .execute(&mut *tx)
        .await?;

        for job in &bundle.c2_jobs {
            Self::insert_c2_job_row(&mut tx, job).await?;
        }
        for job in &bundle.proxy_jobs {
            Self::insert_proxy_job_row(&mut tx, job).await?;
        }
        for step in &bundle.steps {
            Self::insert_step_row(&mut tx, step).await?;
        }
        for modifier in &bundle.modifiers {
            Self::insert_modifier_row(&mut tx, modifier).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn load_graph(&self, playbook_id: Uuid) -> EngineResult<GraphBundle> {
        let playbook = self
            .get_playbook(playbook_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("playbook {playbook_id}")))?;
        let steps = self.list_steps(playbook_id).await?;

        let modifier_rows: Vec<ModifierRow> = sqlx::query_as(&format!(
            "SELECT {MODIFIER_COLS} FROM step_modifiers WHERE step_id IN \
             (SELECT id FROM playbook_steps WHERE playbook_id = $1) ORDER BY time_created"
        ))
        .bind(playbook_id)
        .fetch_all(&self.db)
        .await?;
        let modifiers = modifier_rows
            .into_iter()
            .map(modifier_from_row)
            .collect::<EngineResult<Vec<_>>>()?;

        let c2_rows: Vec<C2JobRow> = sqlx::query_as(&format!(
            "SELECT {C2_JOB_COLS} FROM c2_jobs WHERE id IN \
             (SELECT job_id FROM playbook_steps WHERE playbook_id = $1 AND job_kind = 'c2')"
        ))
        .bind(playbook_id)
        .fetch_all(&self.db)
        .await?;
        let c2_jobs = c2_rows
            .into_iter()
            .map(c2_job_from_row)
            .collect::<EngineResult<Vec<_>>>()?;

        let proxy_rows: Vec<ProxyJobRow> = sqlx::query_as(&format!(
            "SELECT {PROXY_JOB_COLS} FROM proxy_jobs WHERE id IN \
             (SELECT job_id FROM playbook_steps WHERE playbook_id = $1 AND job_kind = 'proxy')"
        ))
        .bind(playbook_id)
        .fetch_all(&self.db)
        .await?;
        let proxy_jobs = proxy_rows
            .into_iter()
            .map(proxy_job_from_row)
            .collect::<EngineResult<Vec<_>>>()?;

        Ok(GraphBundle {
            playbook,
            steps,
            modifiers,
            c2_jobs,
            proxy_jobs,
        })
    }

    async fn resolve_entity(&self, kind: EntityKind, id: Uuid) -> EngineResult<Option<Value>> {
        let table = entity_table(kind);
        let row: Option<(Value,)> =
            sqlx::query_as(&format!("SELECT data FROM {table} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(data,)| data))
    }

    async fn implant_labels(&self, implant_id: Uuid) -> EngineResult<Vec<String>> {
        let row: Option<(Vec<String>,)> =
            sqlx::query_as("SELECT labels FROM c2_implants WHERE id = $1")
                .bind(implant_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(row.map(|(labels,)| labels).unwrap_or_default())
    }

    async fn actions_for_template(&self, template_id: Uuid) -> EngineResult<Vec<Action>> {
        let rows: Vec<(
            Uuid,
            String,
            Option<String>,
            Option<DateTime<Utc>>,
            Option<DateTime<Utc>>,
        )> = sqlx::query_as(
            "SELECT a.id, a.name, a.status, a.time_started, a.time_completed \
             FROM actions a \
             JOIN action_playbook_templates m ON m.action_id = a.id \
             WHERE m.template_id = $1 ORDER BY a.id",
        )
        .bind(template_id)
        .fetch_all(&self.db)
        .await?;
        rows.into_iter()
            .map(|(id, name, status, time_started, time_completed)| {
                Ok(Action {
                    id,
                    name,
                    status: status.as_deref().map(str::parse).transpose()?,
                    time_started,
                    time_completed,
                })
            })
            .collect()
    }

    async fn sync_actions(
        &self,
        template_id: Uuid,
        status: Status,
        time_started: Option<DateTime<Utc>>,
        time_completed: Option<DateTime<Utc>>,
    ) -> EngineResult<()> {
        sqlx::query(
            "UPDATE actions SET status = $2, \
               time_started = COALESCE($3, time_started), \
               time_completed = COALESCE($4, time_completed) \
             WHERE id IN \
               (SELECT action_id FROM action_playbook_templates WHERE template_id = $1)",
        )
        .bind(template_id)
        .bind(status.as_str())
        .bind(time_started)
        .bind(time_completed)
        .execute(&self.db)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_column_round_trip() {
        let id = Uuid::new_v4();
        for job in [None, Some(JobRef::C2(id)), Some(JobRef::Proxy(id))] {
            let (kind, job_id) = job_columns(job);
            assert_eq!(job_from_columns(kind, job_id).unwrap(), job);
        }
        assert!(job_from_columns(Some("c2"), None).is_err());
        assert!(job_from_columns(Some("rocket"), Some(id)).is_err());
    }

    #[test]
    fn test_entity_tables() {
        assert_eq!(entity_table(EntityKind::Credential), "credentials");
        assert_eq!(entity_table(EntityKind::C2Implant), "c2_implants");
        assert_eq!(entity_table(EntityKind::Kerberos), "kerberos");
        assert_eq!(entity_table(EntityKind::File), "files");
    }
}
