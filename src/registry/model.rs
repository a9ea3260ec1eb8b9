//! In-memory shapes for every catalog-backed definition (spec §3). These are
//! the deserialized form of the `definition JSON` column on each `_`-table;
//! the registry never hands out the raw `serde_json::Value`, only these.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Text,
    Int,
    Bigint,
    Float,
    Decimal,
    Boolean,
    Uuid,
    Timestamp,
    Date,
    Json,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoFill {
    Now,
    Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(rename = "enum", default)]
    pub enum_values: Option<Vec<String>>,
    #[serde(default)]
    pub auto: Option<AutoFill>,
    #[serde(default)]
    pub precision: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryKeyType {
    Uuid,
    Int,
    Bigint,
    String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrimaryKey {
    pub field: String,
    #[serde(rename = "type")]
    pub key_type: PrimaryKeyType,
    #[serde(default)]
    pub generated: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SlugSpec {
    pub field: String,
    pub source: String,
    #[serde(default)]
    pub regenerate_on_update: bool,
}

/// Deserialized `_entities.definition`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EntityDef {
    pub name: String,
    pub table: String,
    pub primary_key: PrimaryKey,
    pub fields: Vec<Field>,
    #[serde(default)]
    pub soft_delete: bool,
    #[serde(default)]
    pub slug: Option<SlugSpec>,
}

impl EntityDef {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    OneToOne,
    OneToMany,
    ManyToMany,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Source,
    Target,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    SetNull,
    Restrict,
    NoAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    Lazy,
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Diff,
    Replace,
    Append,
}

/// Deserialized `_relations.definition`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelationDef {
    pub name: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    #[serde(default)]
    pub source_key: Option<String>,
    #[serde(default)]
    pub target_key: Option<String>,
    #[serde(default)]
    pub join_table: Option<String>,
    #[serde(default)]
    pub source_join_key: Option<String>,
    #[serde(default)]
    pub target_join_key: Option<String>,
    #[serde(default = "default_ownership")]
    pub ownership: Ownership,
    #[serde(default = "default_on_delete")]
    pub on_delete: OnDelete,
    #[serde(default = "default_fetch")]
    pub fetch: FetchMode,
    #[serde(default = "default_write_mode")]
    pub write_mode: WriteMode,
}

fn default_ownership() -> Ownership {
    Ownership::None
}
fn default_on_delete() -> OnDelete {
    OnDelete::NoAction
}
fn default_fetch() -> FetchMode {
    FetchMode::Lazy
}
fn default_write_mode() -> WriteMode {
    WriteMode::Diff
}

impl RelationDef {
    pub fn source_key(&self) -> &str {
        self.source_key.as_deref().unwrap_or("id")
    }

    pub fn target_key(&self) -> &str {
        self.target_key.as_deref().unwrap_or("id")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleHook {
    BeforeWrite,
    BeforeDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    Field,
    Expression,
    Computed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FieldRuleDef {
    pub field: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<Value>,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExpressionRuleDef {
    pub expression: String,
    pub message: String,
    #[serde(default)]
    pub stop_on_fail: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ComputedRuleDef {
    pub target: String,
    pub expression: String,
}

/// A rule's `definition` is shaped per its `type`; the loader picks the
/// right shape out of the raw JSON based on the `type` column.
#[derive(Debug, Clone)]
pub enum RuleDefinition {
    Field(FieldRuleDef),
    Expression(ExpressionRuleDef),
    Computed(ComputedRuleDef),
}

#[derive(Debug, Clone)]
pub struct RuleDef {
    pub id: String,
    pub entity: String,
    pub hook: RuleHook,
    pub priority: i32,
    pub active: bool,
    pub definition: RuleDefinition,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    SetField { field: String, value: Value },
    Webhook { webhook: String },
    CreateRecord { entity: String, data: Value },
    SendEvent { event_type: String, metadata: Value },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Transition {
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub from: Vec<String>,
    pub to: String,
    #[serde(default)]
    pub guard: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    enum StringOrVec {
        Single(String),
        Many(Vec<String>),
    }
    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::Single(value) => Ok(vec![value]),
        StringOrVec::Many(values) => Ok(values),
    }
}

/// Deserialized `_state_machines.definition`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StateMachineDef {
    pub id: String,
    pub entity: String,
    pub field: String,
    pub initial: String,
    pub transitions: Vec<Transition>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Action,
    Condition,
    Approval,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub then: Option<String>,
    #[serde(default)]
    pub on_true: Option<String>,
    #[serde(default)]
    pub on_false: Option<String>,
    #[serde(default)]
    pub on_approve: Option<String>,
    #[serde(default)]
    pub on_reject: Option<String>,
    #[serde(default)]
    pub on_timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowTrigger {
    pub entity: String,
    pub field: String,
    pub to: String,
}

/// Deserialized `_workflows.trigger` / `.context` / `.steps` columns.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkflowDef {
    pub id: String,
    pub name: String,
    pub trigger: WorkflowTrigger,
    #[serde(default)]
    pub context: std::collections::HashMap<String, String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl WorkflowDef {
    pub fn step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == id)
    }

    pub fn first_step(&self) -> Option<&WorkflowStep> {
        self.steps.first()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceStatus {
    Running,
    Completed,
    Failed,
    Approved,
    Rejected,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAction {
    Read,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermissionCondition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: Value,
}

/// Deserialized `_permissions.roles` / `.conditions`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PermissionDef {
    pub id: String,
    pub entity: String,
    pub action: PermissionAction,
    pub roles: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<PermissionCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookHook {
    BeforeWrite,
    AfterWrite,
    BeforeDelete,
    AfterDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySpec {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff")]
    pub backoff: BackoffKind,
}

fn default_max_attempts() -> u32 {
    5
}
fn default_backoff() -> BackoffKind {
    BackoffKind::Exponential
}

/// Deserialized `_webhooks` row (columns plus `retry`/`headers` JSON).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookDef {
    pub id: String,
    pub entity: String,
    pub hook: WebhookHook,
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub is_async: bool,
    #[serde(default)]
    pub retry: RetrySpec,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_method() -> String {
    "POST".to_string()
}

impl Default for RetrySpec {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_backoff(),
        }
    }
}
