//! Domain model for playbooks, steps, modifiers, and their owned jobs.
//!
//! A playbook is one instantiated, executable DAG of steps. Each step wraps
//! exactly one underlying job (C2 or proxy) and references the steps it
//! depends on by label, not by id — labels exist before ids do when a
//! template is compiled.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::EngineError;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status shared by playbooks, steps, and jobs.
///
/// Steps move `created -> {queued, scheduled, starting} -> started ->
/// {completed, error}`; `skipped` is a terminal bypass. Playbooks derive
/// `running`/`completed`/`error` from their steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Queued,
    Scheduled,
    Starting,
    Started,
    Running,
    Completed,
    Error,
    Skipped,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Created => "created",
            Status::Queued => "queued",
            Status::Scheduled => "scheduled",
            Status::Starting => "starting",
            Status::Started => "started",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Error => "error",
            Status::Skipped => "skipped",
        }
    }

    /// Statuses that mark a step as picked up by the execution runtime.
    /// Entering any of these stamps `time_started` once.
    pub fn is_started_class(self) -> bool {
        matches!(
            self,
            Status::Started | Status::Starting | Status::Queued | Status::Scheduled
        )
    }

    /// Terminal states. Entering one stamps `time_completed` once.
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Error | Status::Skipped)
    }

    /// Terminal states that count toward a playbook's `completed` counter.
    pub fn is_terminal_success(self) -> bool {
        matches!(self, Status::Completed | Status::Skipped)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Status::Created),
            "queued" => Ok(Status::Queued),
            "scheduled" => Ok(Status::Scheduled),
            "starting" => Ok(Status::Starting),
            "started" => Ok(Status::Started),
            "running" => Ok(Status::Running),
            "completed" => Ok(Status::Completed),
            "error" => Ok(Status::Error),
            "skipped" => Ok(Status::Skipped),
            other => Err(EngineError::Parse(format!("unknown status: {other}"))),
        }
    }
}

// ============================================================================
// Job ownership
// ============================================================================

/// Reference to the single job a step owns.
///
/// The original schema kept two nullable foreign-key columns; the tagged
/// union makes the "both set" state unrepresentable. A step without a job
/// (delay-only placeholder) carries `None` at the field level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum JobRef {
    C2(Uuid),
    Proxy(Uuid),
}

impl JobRef {
    pub fn id(self) -> Uuid {
        match self {
            JobRef::C2(id) | JobRef::Proxy(id) => id,
        }
    }
}

// ============================================================================
// Entity resolution
// ============================================================================

/// Entity kinds resolvable by id inside template arguments.
///
/// An argument key `<kind>_id<digits?>` is replaced in the render context
/// by the resolved entity under `<kind><digits?>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Credential,
    C2Implant,
    Kerberos,
    File,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Credential,
        EntityKind::C2Implant,
        EntityKind::Kerberos,
        EntityKind::File,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Credential => "credential",
            EntityKind::C2Implant => "c2_implant",
            EntityKind::Kerberos => "kerberos",
            EntityKind::File => "file",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Playbook
// ============================================================================

/// A named execution graph instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub status: Status,

    /// Argument bag captured at compile time. Opaque to the engine.
    pub arguments: Option<Value>,

    /// Count of child steps; recomputed on every structural mutation.
    pub steps: i32,

    /// Count of steps in a terminal-success state. Never exceeds `steps`.
    pub completed: i32,

    /// Template this playbook was compiled from, if any.
    pub template_id: Option<Uuid>,

    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

/// Fields for creating a playbook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewPlaybook {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub template_id: Option<Uuid>,
}

// ============================================================================
// Playbook step
// ============================================================================

/// One DAG node. Owns exactly one job; ordered by a dense 1-based number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub id: Uuid,
    pub playbook_id: Uuid,

    /// 1-based, dense; re-numbered on structural change.
    pub number: i32,

    /// Unique within the playbook; derived from `number` unless overridden.
    pub label: String,

    /// Comma-separated labels of steps that must complete first.
    pub depends_on: Option<String>,

    /// Wait after dependencies complete, in seconds.
    pub delay_seconds: Option<i64>,

    /// Absolute earliest start.
    pub execute_after: Option<DateTime<Utc>>,

    /// The owned job, deleted with the step.
    pub job: Option<JobRef>,

    pub status: Status,
    pub time_created: DateTime<Utc>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

impl PlaybookStep {
    /// Dependency labels, split and trimmed.
    pub fn depends_on_labels(&self) -> Vec<String> {
        split_labels(self.depends_on.as_deref())
    }
}

/// Split a comma-separated `depends_on` string into labels.
pub fn split_labels(depends_on: Option<&str>) -> Vec<String> {
    depends_on
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Fields for adding a step to a playbook.
///
/// `number`, `label`, and `depends_on` are optional: the graph builder
/// assigns the next number, derives the label, and chains to the previous
/// step when the playbook opts into implicit dependencies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewStep {
    pub playbook_id: Uuid,
    #[serde(default)]
    pub number: Option<i32>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default)]
    pub delay_seconds: Option<i64>,
    #[serde(default)]
    pub execute_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub job: Option<JobRef>,
}

// ============================================================================
// Step modifier
// ============================================================================

/// Policy applied when a modifier fails to extract a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    /// Fail the modifier run; the caller should not start the step.
    Abort,
    /// Record success with an empty value and move on.
    #[default]
    Continue,
    /// Record the failure but let the step proceed.
    Warn,
}

impl OnErrorPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            OnErrorPolicy::Abort => "abort",
            OnErrorPolicy::Continue => "continue",
            OnErrorPolicy::Warn => "warn",
        }
    }
}

impl FromStr for OnErrorPolicy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "abort" => Ok(OnErrorPolicy::Abort),
            "continue" | "" => Ok(OnErrorPolicy::Continue),
            "warn" => Ok(OnErrorPolicy::Warn),
            other => Err(EngineError::Parse(format!(
                "unknown on_error policy: {other}"
            ))),
        }
    }
}

/// A declarative transform attached to a step: extract data from an
/// upstream step's output and inject it into this step's arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepModifier {
    pub id: Uuid,
    pub step_id: Uuid,

    /// Locates the source value inside the upstream output: the upstream
    /// step's label, optionally followed by a dot path into JSON output.
    pub input_path: String,

    /// Argument name the extracted value is written to, consumed by the
    /// owning step's argument resolution.
    pub output_path: String,

    /// Optional refinement applied to the located text.
    pub regex: Option<String>,

    pub on_error: OnErrorPolicy,

    /// Last-run record.
    pub status: Option<Status>,
    pub status_message: Option<String>,
    pub data: Option<String>,

    pub time_created: DateTime<Utc>,
}

/// Fields for creating a step modifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStepModifier {
    pub step_id: Uuid,
    pub input_path: String,
    pub output_path: String,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
}

// ============================================================================
// Playbook template
// ============================================================================

/// Declared argument types for a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentType {
    Str,
    Int,
    Bool,
    Options,
}

/// One declared template argument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateArgument {
    pub name: String,
    #[serde(rename = "type")]
    pub argument_type: ArgumentType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A reusable, parameterized playbook definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookTemplate {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub tactic: Option<String>,
    #[serde(default)]
    pub technique: Option<String>,
    #[serde(default)]
    pub args: Vec<TemplateArgument>,

    /// Template body: steps expressed as text, rendered at compile time.
    pub steps: String,

    /// Auto-chain each step to its immediate predecessor when no explicit
    /// dependency is given.
    #[serde(default = "default_true")]
    pub add_depends_on: bool,
}

fn default_true() -> bool {
    true
}

// ============================================================================
// Jobs
// ============================================================================

/// A job dispatched to a C2 implant. Owned 1:1 by a playbook step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct C2Job {
    pub id: Uuid,
    pub playbook_id: Option<Uuid>,
    pub command: String,
    pub arguments: Option<Value>,
    pub implant_id: Option<Uuid>,
    pub status: Status,
    pub time_created: DateTime<Utc>,
}

/// Fields for creating a C2 job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewC2Job {
    pub playbook_id: Option<Uuid>,
    pub command: String,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub implant_id: Option<Uuid>,
}

/// A job executed through a SOCKS/proxy worker. Owned 1:1 by a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyJob {
    pub id: Uuid,
    pub playbook_id: Option<Uuid>,
    pub command: String,
    pub arguments: Option<Value>,
    pub socks_server_id: Option<Uuid>,
    pub tmate: bool,
    pub asciinema: bool,
    pub proxychains: bool,
    pub status: Status,
    pub time_created: DateTime<Utc>,
}

/// Fields for creating a proxy job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProxyJob {
    pub playbook_id: Option<Uuid>,
    pub command: String,
    #[serde(default)]
    pub arguments: Option<Value>,
    #[serde(default)]
    pub socks_server_id: Option<Uuid>,
    #[serde(default)]
    pub tmate: bool,
    #[serde(default)]
    pub asciinema: bool,
    #[serde(default)]
    pub proxychains: bool,
}

// ============================================================================
// Actions
// ============================================================================

/// An engagement action mapped to one or more playbook templates. Playbook
/// status transitions cascade to mapped actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub id: Uuid,
    pub name: String,
    pub status: Option<Status>,
    pub time_started: Option<DateTime<Utc>>,
    pub time_completed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in [
            Status::Created,
            Status::Queued,
            Status::Scheduled,
            Status::Starting,
            Status::Started,
            Status::Running,
            Status::Completed,
            Status::Error,
            Status::Skipped,
        ] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("bogus".parse::<Status>().is_err());
    }

    #[test]
    fn test_status_classes() {
        assert!(Status::Queued.is_started_class());
        assert!(Status::Started.is_started_class());
        assert!(!Status::Created.is_started_class());
        assert!(Status::Completed.is_terminal());
        assert!(Status::Skipped.is_terminal());
        assert!(Status::Error.is_terminal());
        assert!(!Status::Error.is_terminal_success());
        assert!(Status::Skipped.is_terminal_success());
    }

    #[test]
    fn test_job_ref_serialization() {
        let id = Uuid::new_v4();
        let job = JobRef::C2(id);
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("c2"));
        let back: JobRef = serde_json::from_str(&json).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.id(), id);
    }

    #[test]
    fn test_split_labels() {
        assert_eq!(split_labels(Some("A,B, C")), vec!["A", "B", "C"]);
        assert_eq!(split_labels(Some("")), Vec::<String>::new());
        assert_eq!(split_labels(None), Vec::<String>::new());
    }

    #[test]
    fn test_on_error_policy_default() {
        assert_eq!(OnErrorPolicy::default(), OnErrorPolicy::Continue);
        assert_eq!("abort".parse::<OnErrorPolicy>().unwrap(), OnErrorPolicy::Abort);
        assert_eq!("".parse::<OnErrorPolicy>().unwrap(), OnErrorPolicy::Continue);
    }
}
