//! HTTP API DTOs exposed by the fleet hub.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// Lifecycle state of a persisted task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created, not yet handed to a live link.
    Pending,
    /// Sent to the node, awaiting its reply or completion.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// How a task was dispatched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrigin {
    /// Synchronous remote call; finalized by the node's reply.
    Call,
    /// Async job; finalized by a later completion message.
    Job,
}

/// Last persisted liveness of a node.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// A tunnel was open at the last update.
    Online,
    /// No tunnel was open at the last update.
    Offline,
}

/// User role as seen by the hub.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    /// Regular device owner.
    User,
    /// Operator with access to the admin surface.
    Admin,
}

impl UserRole {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::User => "user",
            UserRole::Admin => "admin",
        }
    }
}

/// Synchronous remote call request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RemoteCallRequest {
    /// Target node.
    pub node_id: String,
    /// Operation understood by the node.
    pub action: String,
    /// Operation arguments.
    #[serde(default)]
    pub data: Value,
    /// Per-call deadline; the hub default applies when omitted.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Outcome of a synchronous remote call.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RemoteCallResponse {
    /// Task recording the call.
    pub task_id: i64,
    /// Final task status.
    pub status: TaskStatus,
    /// Node result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error text on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure kind (`node_offline`, `timed_out`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Async job request.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AsyncJobRequest {
    /// Target node.
    pub node_id: String,
    /// Job kind understood by the node.
    pub kind: String,
    /// Job parameters.
    #[serde(default)]
    pub params: Value,
}

/// Acknowledgement of an async job.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AsyncJobResponse {
    /// Task tracking the job.
    pub task_id: i64,
    /// `running` once the node accepted the job, `failed` otherwise.
    pub status: TaskStatus,
    /// Error text when the job was not accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Machine-readable failure kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Task header returned by list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskSummary {
    /// Task identifier.
    pub id: i64,
    /// Operation or job kind.
    pub task_type: String,
    /// How the task was dispatched.
    pub origin: TaskOrigin,
    /// Target node.
    pub node_id: String,
    /// Owning user.
    pub user_id: i64,
    /// Current status.
    pub status: TaskStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last transition time.
    pub updated_at: DateTime<Utc>,
}

/// Full task record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskDetail {
    /// Task header fields.
    #[serde(flatten)]
    pub summary: TaskSummary,
    /// Request sent to the node.
    #[serde(default)]
    pub payload: Option<Value>,
    /// Node result.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure text.
    #[serde(default)]
    pub error: Option<String>,
}

/// Page of task headers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TaskPage {
    /// Page size used.
    pub limit: u32,
    /// Offset used.
    pub offset: u32,
    /// Matching tasks across all pages.
    pub total: i64,
    /// Headers on this page.
    pub items: Vec<TaskSummary>,
}

/// Node as shown to its owner or an admin.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodeSummary {
    /// Node identifier.
    pub node_id: String,
    /// Owner, when bound.
    #[serde(default)]
    pub user_id: Option<i64>,
    /// Whether the node is bound to a user.
    pub bound: bool,
    /// Reported hostname.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Reported agent version.
    #[serde(default)]
    pub agent_version: Option<String>,
    /// Persisted liveness mirror.
    pub status: NodeStatus,
    /// Whether a tunnel is registered right now.
    pub online: bool,
    /// Last heartbeat or connect time.
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// First handshake time.
    pub created_at: DateTime<Utc>,
}

/// Page of nodes.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NodePage {
    /// Page size used.
    pub limit: u32,
    /// Offset used.
    pub offset: u32,
    /// Nodes across all pages.
    pub total: i64,
    /// Nodes on this page.
    pub items: Vec<NodeSummary>,
}

/// Live or recently closed tunnel session.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionStatus {
    /// Node identifier.
    pub node_id: String,
    /// `connected` or `disconnected`.
    pub status: String,
    /// Connect time of the live link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    /// Seconds since the last frame on the live link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_secs: Option<u64>,
    /// Calls awaiting a reply on the live link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_calls: Option<usize>,
    /// Why the last link closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Seconds since the last link closed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_secs: Option<u64>,
}

/// Registry view for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionsResponse {
    /// Number of live links.
    pub online: usize,
    /// Live and recently closed sessions.
    pub sessions: Vec<SessionStatus>,
}

/// Freshly issued bind token.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BindTokenResponse {
    /// One-time token the node presents over its tunnel.
    pub token: String,
    /// Expiry of the token.
    pub expires_at: DateTime<Utc>,
}

/// Ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LedgerEntry {
    /// Entry identifier.
    pub id: i64,
    /// Signed credit delta.
    pub amount: i64,
    /// `online_accrual` or `admin_adjustment`.
    pub reason: String,
    /// Node that produced an accrual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Credit balance with recent ledger history.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditBalance {
    /// Account owner.
    pub user_id: i64,
    /// Current balance.
    pub credits: i64,
    /// Most recent entries, newest first.
    pub transactions: Vec<LedgerEntry>,
}

/// User as shown on the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserSummary {
    /// User identifier.
    pub id: i64,
    /// Login email.
    pub email: String,
    /// Role.
    pub role: UserRole,
    /// Current balance.
    pub credits: i64,
    /// Provisioning time.
    pub created_at: DateTime<Utc>,
}

/// Page of users.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserPage {
    /// Page size used.
    pub limit: u32,
    /// Offset used.
    pub offset: u32,
    /// Users across all pages.
    pub total: i64,
    /// Users on this page.
    pub items: Vec<UserSummary>,
}

/// Admin request to provision a user.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateUserRequest {
    /// Login email.
    pub email: String,
    /// Role, `user` when omitted.
    #[serde(default)]
    pub role: Option<UserRole>,
}

/// Admin credit adjustment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditAdjustmentRequest {
    /// Signed, non-zero delta.
    pub adjustment: i64,
}

/// Balance after an adjustment.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditAdjustmentResponse {
    /// Adjusted user.
    pub user_id: i64,
    /// New balance.
    pub credits: i64,
}

/// Admin role change.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RoleUpdateRequest {
    /// New role.
    pub role: UserRole,
}

/// Fleet-wide counters.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SystemStats {
    /// Provisioned users.
    pub users: i64,
    /// Known nodes.
    pub nodes: i64,
    /// Nodes bound to a user.
    pub bound_nodes: i64,
    /// Nodes with a live tunnel.
    pub online_nodes: usize,
    /// Persisted tasks.
    pub tasks: i64,
    /// Ledger entries.
    pub transactions: i64,
    /// Sum of all balances.
    pub total_credits: i64,
}

/// Generic acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OkResponse {
    /// Always `true`.
    pub ok: bool,
}
