//! Conflicts
//!
//! A [`Conflict`] records that two or more queued operations cannot all
//! proceed as written. Conflicts reference operations by id and never copy
//! them. They are data, not errors: the detector mints them, the resolver
//! settles them.

pub mod detector;
pub mod merge;
pub mod patterns;
pub mod resolver;
pub mod similarity;

pub use detector::{ConflictDetector, DetectorConfig};
pub use patterns::{ConflictPattern, PatternTable};
pub use resolver::{
    BatchResolution, ConflictResolver, ConflictStatistics, ResolutionOutcome, ResolutionRecord,
    ResolverConfig,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictType {
    Duplicate,
    ConcurrentModification,
    ResourceLocked,
    DependencyConflict,
    VersionMismatch,
    CircularDependency,
    PriorityConflict,
    OutdatedOperation,
}

impl ConflictType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictType::Duplicate => "duplicate",
            ConflictType::ConcurrentModification => "concurrent-modification",
            ConflictType::ResourceLocked => "resource-locked",
            ConflictType::DependencyConflict => "dependency-conflict",
            ConflictType::VersionMismatch => "version-mismatch",
            ConflictType::CircularDependency => "circular-dependency",
            ConflictType::PriorityConflict => "priority-conflict",
            ConflictType::OutdatedOperation => "outdated-operation",
        }
    }

    /// Severity before urgency escalation.
    pub fn baseline_severity(self) -> Severity {
        match self {
            ConflictType::Duplicate | ConflictType::PriorityConflict => Severity::Medium,
            ConflictType::ConcurrentModification
            | ConflictType::ResourceLocked
            | ConflictType::DependencyConflict
            | ConflictType::VersionMismatch => Severity::High,
            ConflictType::CircularDependency => Severity::Critical,
            ConflictType::OutdatedOperation => Severity::Low,
        }
    }

    pub fn is_auto_resolvable(self) -> bool {
        matches!(
            self,
            ConflictType::Duplicate | ConflictType::OutdatedOperation
        )
    }

    /// Ranked strategies, best first.
    pub fn recommendations(self) -> Vec<ResolutionStrategy> {
        use ResolutionStrategy::*;
        match self {
            ConflictType::Duplicate => vec![CancelConflicting, PreferNewer],
            ConflictType::ConcurrentModification => vec![Merge, PreferNewer, Manual],
            ConflictType::ResourceLocked => vec![Defer, Retry],
            ConflictType::DependencyConflict => vec![Reorder, Defer],
            ConflictType::CircularDependency => vec![Manual],
            ConflictType::VersionMismatch => vec![PreferNewer, Manual],
            ConflictType::PriorityConflict => vec![Reorder, Defer],
            ConflictType::OutdatedOperation => vec![PreferNewer, CancelConflicting],
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// One level up, capped at critical.
    pub fn escalated(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflict is (or should be) settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    Manual,
    AutoMerge,
    PreferNewer,
    PreferOlder,
    ClientWins,
    WorkerWins,
    CancelConflicting,
    Retry,
    Defer,
    Reorder,
    Merge,
}

impl ResolutionStrategy {
    pub const ALL: [ResolutionStrategy; 11] = [
        ResolutionStrategy::Manual,
        ResolutionStrategy::AutoMerge,
        ResolutionStrategy::PreferNewer,
        ResolutionStrategy::PreferOlder,
        ResolutionStrategy::ClientWins,
        ResolutionStrategy::WorkerWins,
        ResolutionStrategy::CancelConflicting,
        ResolutionStrategy::Retry,
        ResolutionStrategy::Defer,
        ResolutionStrategy::Reorder,
        ResolutionStrategy::Merge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::Manual => "manual",
            ResolutionStrategy::AutoMerge => "auto-merge",
            ResolutionStrategy::PreferNewer => "prefer-newer",
            ResolutionStrategy::PreferOlder => "prefer-older",
            ResolutionStrategy::ClientWins => "client-wins",
            ResolutionStrategy::WorkerWins => "worker-wins",
            ResolutionStrategy::CancelConflicting => "cancel-conflicting",
            ResolutionStrategy::Retry => "retry",
            ResolutionStrategy::Defer => "defer",
            ResolutionStrategy::Reorder => "reorder",
            ResolutionStrategy::Merge => "merge",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        // "cancel" is accepted as shorthand
        if normalized == "cancel" {
            return Ok(ResolutionStrategy::CancelConflicting);
        }
        Self::ALL
            .iter()
            .copied()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| format!("Unknown resolution strategy: {}", s))
    }
}

/// A detected incompatibility between queued operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    pub severity: Severity,
    pub resource_path: String,
    pub description: String,
    pub detected_at: DateTime<Utc>,
    /// Parties, by reference
    pub operation_ids: Vec<String>,
    pub auto_resolvable: bool,
    #[serde(default)]
    pub recommendations: Vec<ResolutionStrategy>,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requires_manual: bool,
}

pub fn new_conflict_id() -> String {
    format!("conflict-{}", uuid::Uuid::new_v4())
}

impl Conflict {
    /// Mint an unresolved conflict with the type's baseline severity and recommendations.
    pub fn new(
        conflict_type: ConflictType,
        resource_path: impl Into<String>,
        description: impl Into<String>,
        operation_ids: Vec<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: new_conflict_id(),
            conflict_type,
            severity: conflict_type.baseline_severity(),
            resource_path: resource_path.into(),
            description: description.into(),
            detected_at,
            operation_ids,
            auto_resolvable: conflict_type.is_auto_resolvable(),
            recommendations: conflict_type.recommendations(),
            resolved: false,
            resolution: None,
            resolved_by: None,
            resolved_at: None,
            requires_manual: conflict_type == ConflictType::CircularDependency,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn involves(&self, operation_id: &str) -> bool {
        self.operation_ids.iter().any(|id| id == operation_id)
    }

    /// Same type over the same set of operations.
    pub fn same_parties(&self, other: &Conflict) -> bool {
        if self.conflict_type != other.conflict_type
            || self.operation_ids.len() != other.operation_ids.len()
        {
            return false;
        }
        let mut mine: Vec<&String> = self.operation_ids.iter().collect();
        let mut theirs: Vec<&String> = other.operation_ids.iter().collect();
        mine.sort();
        theirs.sort();
        mine == theirs
    }
}
