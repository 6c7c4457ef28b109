//! In-memory store implementations.
//!
//! Concurrent-map-backed ports for tests and embedded single-process use.
//! Semantics mirror the SQLite stores, including the revision check on
//! instance updates.

use std::collections::HashMap;

use dashmap::DashMap;
use serde_json::Value;
use stepwise_core::repository::{
    ApprovalStore, DefinitionFilter, DefinitionStore, DocumentStore, InstanceFilter,
    InstanceStore,
};
use stepwise_types::approval::{ApprovalRequest, ApprovalStatus};
use stepwise_types::error::RepositoryError;
use stepwise_types::instance::WorkflowInstance;
use stepwise_types::workflow::{WorkflowDefinition, WorkflowStatus};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

/// Definition versions grouped per workflow id.
#[derive(Default)]
pub struct MemoryDefinitionStore {
    workflows: DashMap<Uuid, Vec<WorkflowDefinition>>,
}

impl MemoryDefinitionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DefinitionStore for MemoryDefinitionStore {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut versions = self.workflows.entry(definition.workflow_id).or_default();
        versions.retain(|d| d.version != definition.version);
        versions.push(definition.clone());
        versions.sort_by_key(|d| d.version);
        Ok(())
    }

    async fn get_latest(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .workflows
            .get(workflow_id)
            .and_then(|versions| versions.last().cloned()))
    }

    async fn get_version(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.workflows.get(workflow_id).and_then(|versions| {
            versions.iter().find(|d| d.version == version).cloned()
        }))
    }

    async fn get_active(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.workflows.get(workflow_id).and_then(|versions| {
            versions
                .iter()
                .find(|d| d.status == WorkflowStatus::Active)
                .cloned()
        }))
    }

    async fn list_versions(
        &self,
        workflow_id: &Uuid,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .workflows
            .get(workflow_id)
            .map(|versions| versions.clone())
            .unwrap_or_default())
    }

    async fn list(
        &self,
        filter: &DefinitionFilter,
    ) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        let mut out = Vec::new();
        for entry in self.workflows.iter() {
            let Some(latest) = entry.value().last() else {
                continue;
            };
            if let Some(status) = filter.status {
                if latest.status != status {
                    continue;
                }
            }
            if let Some(category) = &filter.category {
                if latest.category.as_deref() != Some(category.as_str()) {
                    continue;
                }
            }
            if let Some(tag) = &filter.tag {
                if !latest.tags.iter().any(|t| t == tag) {
                    continue;
                }
            }
            out.push(latest.clone());
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryInstanceStore {
    instances: DashMap<Uuid, WorkflowInstance>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceStore for MemoryInstanceStore {
    async fn create(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        if self.instances.contains_key(&instance.instance_id) {
            return Err(RepositoryError::Conflict(format!(
                "instance {} already exists",
                instance.instance_id
            )));
        }
        self.instances
            .insert(instance.instance_id, instance.clone());
        Ok(())
    }

    async fn get(&self, instance_id: &Uuid) -> Result<Option<WorkflowInstance>, RepositoryError> {
        Ok(self.instances.get(instance_id).map(|i| i.clone()))
    }

    async fn update(&self, instance: &WorkflowInstance) -> Result<(), RepositoryError> {
        // The entry guard serializes the compare-and-swap.
        let Some(mut row) = self.instances.get_mut(&instance.instance_id) else {
            return Err(RepositoryError::NotFound);
        };
        if row.revision != instance.revision {
            return Err(RepositoryError::Conflict(format!(
                "expected revision {}, found {}",
                instance.revision, row.revision
            )));
        }
        let mut next = instance.clone();
        next.revision = instance.revision + 1;
        *row = next;
        Ok(())
    }

    async fn list(
        &self,
        filter: &InstanceFilter,
    ) -> Result<Vec<WorkflowInstance>, RepositoryError> {
        let mut out: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|entry| {
                filter
                    .workflow_id
                    .map(|id| entry.workflow_id == id)
                    .unwrap_or(true)
                    && filter
                        .status
                        .map(|status| entry.status == status)
                        .unwrap_or(true)
            })
            .map(|entry| entry.clone())
            .collect();
        out.sort_by_key(|i| i.created_at);
        if let Some(limit) = filter.limit {
            out.truncate(limit as usize);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Approvals
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryApprovalStore {
    requests: DashMap<Uuid, ApprovalRequest>,
}

impl MemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ApprovalStore for MemoryApprovalStore {
    async fn create(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        self.requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<ApprovalRequest>, RepositoryError> {
        Ok(self.requests.get(id).map(|r| r.clone()))
    }

    async fn update(&self, request: &ApprovalRequest) -> Result<(), RepositoryError> {
        let Some(mut row) = self.requests.get_mut(&request.id) else {
            return Err(RepositoryError::NotFound);
        };
        *row = request.clone();
        Ok(())
    }

    async fn list_pending_for_user(
        &self,
        user: &str,
        roles: &[String],
    ) -> Result<Vec<ApprovalRequest>, RepositoryError> {
        let mut out: Vec<ApprovalRequest> = self
            .requests
            .iter()
            .filter(|r| r.status == ApprovalStatus::Pending && may_decide(r, user, roles))
            .map(|r| r.clone())
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn find_for_step(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> Result<Option<ApprovalRequest>, RepositoryError> {
        Ok(self
            .requests
            .iter()
            .filter(|r| r.instance_id == *instance_id && r.step_id == step_id)
            .max_by_key(|r| r.created_at)
            .map(|r| r.clone()))
    }
}

fn may_decide(request: &ApprovalRequest, user: &str, roles: &[String]) -> bool {
    if request.approver_users.is_empty() && request.approver_roles.is_empty() {
        return true;
    }
    request.approver_users.iter().any(|u| u == user)
        || request
            .approver_roles
            .iter()
            .any(|required| roles.iter().any(|held| held == required))
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

/// Document store over named in-memory collections.
///
/// The memory backend ignores the free-form query string; `parameters` act
/// as top-level field equality filters.
#[derive(Default)]
pub struct MemoryDocumentStore {
    stores: DashMap<String, Vec<Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn document_key(document: &Value) -> Option<String> {
    document
        .get("key")
        .or_else(|| document.get("id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

impl DocumentStore for MemoryDocumentStore {
    async fn query(
        &self,
        store: &str,
        _query: &str,
        parameters: &HashMap<String, Value>,
    ) -> Result<Vec<Value>, RepositoryError> {
        let Some(docs) = self.stores.get(store) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .iter()
            .filter(|doc| {
                parameters
                    .iter()
                    .all(|(field, expected)| doc.get(field) == Some(expected))
            })
            .cloned()
            .collect())
    }

    async fn upsert(&self, store: &str, document: &Value) -> Result<Value, RepositoryError> {
        // Documents without a key field get a generated one so they remain
        // individually addressable.
        let (key, stored) = match document_key(document) {
            Some(key) => (key, document.clone()),
            None => {
                let key = Uuid::now_v7().to_string();
                let mut stored = document.clone();
                if let Some(map) = stored.as_object_mut() {
                    map.insert("key".to_string(), Value::String(key.clone()));
                }
                (key, stored)
            }
        };
        let mut docs = self.stores.entry(store.to_string()).or_default();
        docs.retain(|existing| document_key(existing).as_deref() != Some(key.as_str()));
        docs.push(stored.clone());
        Ok(stored)
    }

    async fn delete(
        &self,
        store: &str,
        key: &str,
        _partition: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let Some(mut docs) = self.stores.get_mut(store) else {
            return Ok(false);
        };
        let before = docs.len();
        docs.retain(|doc| document_key(doc).as_deref() != Some(key));
        Ok(docs.len() < before)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
