//! Kind-specific operation parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    CreateSpec,
    UpdateRequirements,
    UpdateDesign,
    UpdateTasks,
    AddUserStory,
    UpdateTaskStatus,
    DeleteSpec,
    SetCurrentSpec,
    SyncStatus,
    Heartbeat,
}

impl OperationKind {
    pub const ALL: [OperationKind; 10] = [
        OperationKind::CreateSpec,
        OperationKind::UpdateRequirements,
        OperationKind::UpdateDesign,
        OperationKind::UpdateTasks,
        OperationKind::AddUserStory,
        OperationKind::UpdateTaskStatus,
        OperationKind::DeleteSpec,
        OperationKind::SetCurrentSpec,
        OperationKind::SyncStatus,
        OperationKind::Heartbeat,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::CreateSpec => "create-spec",
            OperationKind::UpdateRequirements => "update-requirements",
            OperationKind::UpdateDesign => "update-design",
            OperationKind::UpdateTasks => "update-tasks",
            OperationKind::AddUserStory => "add-user-story",
            OperationKind::UpdateTaskStatus => "update-task-status",
            OperationKind::DeleteSpec => "delete-spec",
            OperationKind::SetCurrentSpec => "set-current-spec",
            OperationKind::SyncStatus => "sync-status",
            OperationKind::Heartbeat => "heartbeat",
        }
    }

    /// Kinds that replace a document body wholesale.
    pub fn is_content_mutating(self) -> bool {
        matches!(
            self,
            OperationKind::UpdateRequirements
                | OperationKind::UpdateDesign
                | OperationKind::UpdateTasks
        )
    }

    /// Kinds that lock the whole spec while pending or running.
    pub fn is_exclusive(self) -> bool {
        matches!(self, OperationKind::DeleteSpec)
    }

    /// Bookkeeping kinds never take part in conflicts.
    pub fn is_bookkeeping(self) -> bool {
        matches!(self, OperationKind::SyncStatus | OperationKind::Heartbeat)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OperationKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown operation kind '{}'", s))
    }
}

/// Task state carried by `update-task-status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    NotStarted,
    InProgress,
    Completed,
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not-started" => Ok(TaskState::NotStarted),
            "in-progress" => Ok(TaskState::InProgress),
            "completed" => Ok(TaskState::Completed),
            other => Err(format!("unknown task state '{}'", other)),
        }
    }
}

/// Parameters, tagged by operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum OperationParams {
    CreateSpec {
        spec_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    UpdateRequirements {
        spec_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    UpdateDesign {
        spec_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    UpdateTasks {
        spec_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u64>,
    },
    AddUserStory {
        spec_id: String,
        as_a: String,
        i_want: String,
        so_that: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        requirements: Vec<String>,
    },
    UpdateTaskStatus {
        spec_id: String,
        task_number: String,
        status: TaskState,
    },
    DeleteSpec {
        spec_id: String,
    },
    SetCurrentSpec {
        spec_id: String,
    },
    SyncStatus {},
    Heartbeat {},
}

impl OperationParams {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationParams::CreateSpec { .. } => OperationKind::CreateSpec,
            OperationParams::UpdateRequirements { .. } => OperationKind::UpdateRequirements,
            OperationParams::UpdateDesign { .. } => OperationKind::UpdateDesign,
            OperationParams::UpdateTasks { .. } => OperationKind::UpdateTasks,
            OperationParams::AddUserStory { .. } => OperationKind::AddUserStory,
            OperationParams::UpdateTaskStatus { .. } => OperationKind::UpdateTaskStatus,
            OperationParams::DeleteSpec { .. } => OperationKind::DeleteSpec,
            OperationParams::SetCurrentSpec { .. } => OperationKind::SetCurrentSpec,
            OperationParams::SyncStatus {} => OperationKind::SyncStatus,
            OperationParams::Heartbeat {} => OperationKind::Heartbeat,
        }
    }

    /// The spec this operation targets, if any.
    pub fn spec_id(&self) -> Option<&str> {
        match self {
            OperationParams::CreateSpec { spec_id, .. }
            | OperationParams::UpdateRequirements { spec_id, .. }
            | OperationParams::UpdateDesign { spec_id, .. }
            | OperationParams::UpdateTasks { spec_id, .. }
            | OperationParams::AddUserStory { spec_id, .. }
            | OperationParams::UpdateTaskStatus { spec_id, .. }
            | OperationParams::DeleteSpec { spec_id }
            | OperationParams::SetCurrentSpec { spec_id } => Some(spec_id),
            OperationParams::SyncStatus {} | OperationParams::Heartbeat {} => None,
        }
    }

    /// Free-text body for content-mutating kinds.
    pub fn content(&self) -> Option<&str> {
        match self {
            OperationParams::UpdateRequirements { content, .. }
            | OperationParams::UpdateDesign { content, .. }
            | OperationParams::UpdateTasks { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Mutable body, used when a merge rewrites the surviving operation.
    pub fn content_mut(&mut self) -> Option<&mut String> {
        match self {
            OperationParams::UpdateRequirements { content, .. }
            | OperationParams::UpdateDesign { content, .. }
            | OperationParams::UpdateTasks { content, .. } => Some(content),
            _ => None,
        }
    }

    /// Explicit document version the caller based its edit on.
    pub fn version(&self) -> Option<u64> {
        match self {
            OperationParams::UpdateRequirements { version, .. }
            | OperationParams::UpdateDesign { version, .. }
            | OperationParams::UpdateTasks { version, .. } => *version,
            _ => None,
        }
    }

    /// Resource path the operation touches, relative to the workspace.
    pub fn resource_path(&self) -> String {
        match self {
            OperationParams::UpdateRequirements { spec_id, .. }
            | OperationParams::AddUserStory { spec_id, .. } => {
                format!("specs/{}/requirements.md", spec_id)
            }
            OperationParams::UpdateDesign { spec_id, .. } => format!("specs/{}/design.md", spec_id),
            OperationParams::UpdateTasks { spec_id, .. }
            | OperationParams::UpdateTaskStatus { spec_id, .. } => {
                format!("specs/{}/tasks.md", spec_id)
            }
            OperationParams::CreateSpec { spec_id, .. } | OperationParams::DeleteSpec { spec_id } => {
                format!("specs/{}", spec_id)
            }
            OperationParams::SetCurrentSpec { .. } => "workspace/current-spec".to_string(),
            OperationParams::SyncStatus {} | OperationParams::Heartbeat {} => {
                "workspace/sync".to_string()
            }
        }
    }

    /// Canonical string used for duplicate similarity.
    pub fn fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Coarse category of a resource path, used to key conflict patterns.
pub fn resource_category(path: &str) -> &'static str {
    if path.starts_with("workspace/") {
        "workspace"
    } else if path.ends_with("requirements.md") {
        "requirements"
    } else if path.ends_with("design.md") {
        "design"
    } else if path.ends_with("tasks.md") {
        "tasks"
    } else {
        "spec"
    }
}
