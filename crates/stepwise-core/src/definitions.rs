//! Workflow definition lifecycle: versioning, activation, file import.
//!
//! Definitions are immutable once saved. Editing produces a new draft
//! version; activation validates the draft and flips exactly one version to
//! `Active`, demoting the previous one. Deletion is soft: every version is
//! marked `Deprecated` and stays queryable for running instances pinned to
//! it.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use stepwise_types::error::DefinitionError;
use stepwise_types::workflow::{
    TriggerConfig, VariableDeclaration, WorkflowDefinition, WorkflowSettings, WorkflowStatus,
    WorkflowStep,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::repository::DefinitionStore;
use crate::validation::validate_definition;

// ---------------------------------------------------------------------------
// Workflow spec
// ---------------------------------------------------------------------------

/// Author-supplied content of a definition version; identity and lifecycle
/// fields are managed by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub variables: HashMap<String, VariableDeclaration>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
}

impl WorkflowSpec {
    fn into_definition(self, workflow_id: Uuid, version: u32) -> WorkflowDefinition {
        let now = Utc::now();
        WorkflowDefinition {
            workflow_id,
            version,
            name: self.name,
            description: self.description,
            status: WorkflowStatus::Draft,
            steps: self.steps,
            triggers: self.triggers,
            variables: self.variables,
            settings: self.settings,
            tags: self.tags,
            category: self.category,
            created_by: self.created_by,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Definition service
// ---------------------------------------------------------------------------

pub struct DefinitionService<DS> {
    store: Arc<DS>,
}

impl<DS: DefinitionStore> DefinitionService<DS> {
    pub fn new(store: Arc<DS>) -> Self {
        Self { store }
    }

    /// Create a new workflow as draft version 1.
    pub async fn create(&self, spec: WorkflowSpec) -> Result<WorkflowDefinition, DefinitionError> {
        let definition = spec.into_definition(Uuid::now_v7(), 1);
        self.store
            .save(&definition)
            .await
            .map_err(|e| DefinitionError::Storage(e.to_string()))?;
        info!(workflow_id = %definition.workflow_id, "workflow created");
        Ok(definition)
    }

    /// Create the next draft version of an existing workflow from new
    /// content. Earlier versions are untouched.
    pub async fn revise(
        &self,
        workflow_id: &Uuid,
        spec: WorkflowSpec,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let latest = self
            .store
            .get_latest(workflow_id)
            .await
            .map_err(|e| DefinitionError::Storage(e.to_string()))?
            .ok_or(DefinitionError::NotFound)?;
        let definition = spec.into_definition(*workflow_id, latest.version + 1);
        self.store
            .save(&definition)
            .await
            .map_err(|e| DefinitionError::Storage(e.to_string()))?;
        info!(
            workflow_id = %workflow_id,
            version = definition.version,
            "draft version created"
        );
        Ok(definition)
    }

    /// Validate and activate one version, demoting the previously active one
    /// so at most one version is active at a time.
    pub async fn activate(
        &self,
        workflow_id: &Uuid,
        version: u32,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let mut target = self
            .store
            .get_version(workflow_id, version)
            .await
            .map_err(|e| DefinitionError::Storage(e.to_string()))?
            .ok_or(DefinitionError::NotFound)?;

        let issues = validate_definition(&target);
        if !issues.is_empty() {
            let summary = issues
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DefinitionError::Validation(summary));
        }

        if let Some(mut active) = self
            .store
            .get_active(workflow_id)
            .await
            .map_err(|e| DefinitionError::Storage(e.to_string()))?
        {
            if active.version != version {
                active.status = WorkflowStatus::Inactive;
                active.updated_at = Utc::now();
                self.store
                    .save(&active)
                    .await
                    .map_err(|e| DefinitionError::Storage(e.to_string()))?;
            }
        }

        target.status = WorkflowStatus::Active;
        target.updated_at = Utc::now();
        self.store
            .save(&target)
            .await
            .map_err(|e| DefinitionError::Storage(e.to_string()))?;
        info!(workflow_id = %workflow_id, version, "version activated");
        Ok(target)
    }

    /// Soft-delete a workflow: every version becomes `Deprecated`. Running
    /// instances keep their pinned version; new starts find no active one.
    pub async fn deprecate(&self, workflow_id: &Uuid) -> Result<(), DefinitionError> {
        let versions = self
            .store
            .list_versions(workflow_id)
            .await
            .map_err(|e| DefinitionError::Storage(e.to_string()))?;
        if versions.is_empty() {
            return Err(DefinitionError::NotFound);
        }
        for mut definition in versions {
            definition.status = WorkflowStatus::Deprecated;
            definition.updated_at = Utc::now();
            self.store
                .save(&definition)
                .await
                .map_err(|e| DefinitionError::Storage(e.to_string()))?;
        }
        info!(workflow_id = %workflow_id, "workflow deprecated");
        Ok(())
    }

    /// Import every parseable definition file from a directory. Unparseable
    /// files are logged and skipped so one bad file never blocks the rest.
    pub async fn import_dir(&self, dir: &Path) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
        let mut imported = Vec::new();
        for definition in discover_definitions(dir)? {
            self.store
                .save(&definition)
                .await
                .map_err(|e| DefinitionError::Storage(e.to_string()))?;
            imported.push(definition);
        }
        Ok(imported)
    }
}

// ---------------------------------------------------------------------------
// Definition files
// ---------------------------------------------------------------------------

/// Load one definition from a YAML or JSON file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DefinitionError::File(format!("{}: {e}", path.display())))?;
    parse_definition(&text, path)
}

/// Write one definition as YAML.
pub fn save_definition_file(
    definition: &WorkflowDefinition,
    path: &Path,
) -> Result<(), DefinitionError> {
    let text = serde_yaml_ng::to_string(definition)
        .map_err(|e| DefinitionError::File(e.to_string()))?;
    std::fs::write(path, text)
        .map_err(|e| DefinitionError::File(format!("{}: {e}", path.display())))
}

/// Parse every `.yaml`/`.yml`/`.json` file in a directory, skipping files
/// that fail to parse.
pub fn discover_definitions(dir: &Path) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| DefinitionError::File(format!("{}: {e}", dir.display())))?;
    let mut found = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DefinitionError::File(e.to_string()))?;
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        if !matches!(ext.as_deref(), Some("yaml" | "yml" | "json")) {
            continue;
        }
        match load_definition_file(&path) {
            Ok(definition) => found.push(definition),
            Err(err) => {
                warn!(path = %path.display(), %err, "skipping unparseable definition file");
            }
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));
    Ok(found)
}

fn parse_definition(text: &str, path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    if is_json {
        serde_json::from_str(text).map_err(|e| DefinitionError::File(e.to_string()))
    } else {
        serde_yaml_ng::from_str(text).map_err(|e| DefinitionError::File(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
