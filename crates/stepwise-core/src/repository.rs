//! Store and collaborator trait definitions.
//!
//! These are the ports the orchestration core consumes. The infrastructure
//! layer (stepwise-infra) implements them with in-memory or SQLite
//! persistence, reqwest, and broadcast channels; tests implement them with
//! scripted mocks.
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use std::collections::HashMap;

use serde_json::Value;
use stepwise_types::approval::ApprovalRequest;
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::{InstanceStatus, WorkflowInstance};
use stepwise_types::workflow::{WorkflowDefinition, WorkflowStatus};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definition store
// ---------------------------------------------------------------------------

/// Filters for listing workflow definitions.
#[derive(Debug, Clone, Default)]
pub struct DefinitionFilter {
    pub status: Option<WorkflowStatus>,
    pub category: Option<String>,
    pub tag: Option<String>,
}

/// Storage for versioned workflow definitions.
pub trait DefinitionStore: Send + Sync {
    /// Persist a definition version (insert or replace by id + version).
    fn save(
        &self,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Latest version of a workflow, regardless of status.
    fn get_latest(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// A specific version of a workflow.
    fn get_version(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// The currently active version of a workflow, if any.
    fn get_active(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// All versions of a workflow, ascending by version.
    fn list_versions(
        &self,
        workflow_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Latest version of every workflow matching the filter.
    fn list(
        &self,
        filter: &DefinitionFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Instance store
// ---------------------------------------------------------------------------

/// Filters for listing workflow instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<InstanceStatus>,
    pub limit: Option<u32>,
}

/// Storage for workflow instance records.
///
/// `update` is revision-checked: the write succeeds only when the stored
/// revision equals `instance.revision`, and the persisted record carries
/// `revision + 1`. A stale write surfaces as `RepositoryError::Conflict`.
pub trait InstanceStore: Send + Sync {
    fn create(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// Conditional write. On success the caller's copy should be advanced to
    /// `revision + 1` to stay current.
    fn update(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn list(
        &self,
        filter: &InstanceFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Approval store
// ---------------------------------------------------------------------------

/// Storage for approval requests.
pub trait ApprovalStore: Send + Sync {
    fn create(
        &self,
        request: &ApprovalRequest,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;

    fn update(
        &self,
        request: &ApprovalRequest,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Pending requests visible to a user (direct assignment or role match).
    fn list_pending_for_user(
        &self,
        user: &str,
        roles: &[String],
    ) -> impl std::future::Future<Output = Result<Vec<ApprovalRequest>, RepositoryError>> + Send;

    /// The most recent request for a given instance + step, any status.
    fn find_for_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ApprovalRequest>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Fire-and-forget notification sink.
///
/// Publish failures are the sink's problem: implementations log and swallow
/// them, and callers never fail a step or an approval decision because a
/// notification could not be delivered.
pub trait EventSink: Send + Sync {
    fn publish(
        &self,
        event_type: &str,
        subject: Option<&str>,
        data: &Value,
    ) -> impl std::future::Future<Output = ()> + Send;
}

// ---------------------------------------------------------------------------
// HTTP caller
// ---------------------------------------------------------------------------

/// A fully resolved outbound HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout_secs: u64,
}

/// Raw response from the HTTP collaborator; the core classifies it.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Transport-level failure, already discriminated by the adapter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpCallError {
    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("network error: {0}")]
    Network(String),
}

impl HttpCallError {
    /// The step-level error code for this failure.
    pub fn code(&self) -> &'static str {
        match self {
            HttpCallError::Timeout(_) => "TIMEOUT",
            HttpCallError::Network(_) => "NETWORK_ERROR",
        }
    }
}

/// Outbound HTTP collaborator used by action steps.
pub trait HttpCaller: Send + Sync {
    fn call(
        &self,
        request: HttpRequest,
    ) -> impl std::future::Future<Output = Result<HttpResponse, HttpCallError>> + Send;
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

/// Named document store used by store-query/upsert/delete actions.
pub trait DocumentStore: Send + Sync {
    /// Run a parameterized query against a named store, returning raw rows.
    fn query(
        &self,
        store: &str,
        query: &str,
        parameters: &HashMap<String, Value>,
    ) -> impl std::future::Future<Output = Result<Vec<Value>, RepositoryError>> + Send;

    /// Insert or replace a document; returns the stored document.
    fn upsert(
        &self,
        store: &str,
        document: &Value,
    ) -> impl std::future::Future<Output = Result<Value, RepositoryError>> + Send;

    /// Delete by key. Returns `true` if a document existed.
    fn delete(
        &self,
        store: &str,
        key: &str,
        partition: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;
}
