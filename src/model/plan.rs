//! The execution plan: ordered phases of violations with a stable hash.
//!
//! A plan is produced once (by the `plan` command) and then consumed by the
//! executor, which refuses to run against a state file recorded for a
//! different plan hash.

use crate::model::violation::Violation;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Risk classification of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// Inclusive effort bounds for the violations selected into a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffortRange {
    pub min: u8,
    pub max: u8,
}

/// An ordered, named unit of work containing violations and their selected
/// incidents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Phase {
    pub id: String,
    pub name: String,
    /// 1-based execution order. Total across the plan; `id` breaks ties.
    pub order: u32,
    pub risk: Risk,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<crate::model::Category>,
    pub effort_range: EffortRange,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub deferred: bool,
    pub violations: Vec<Violation>,
}

impl Phase {
    /// Count of incidents across all violations, before deduplication.
    pub fn incident_count(&self) -> usize {
        self.violations.iter().map(|v| v.incidents.len()).sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanMetadata {
    pub created_at: DateTime<Utc>,
    pub provider_name: String,
    pub plan_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub metadata: PlanMetadata,
    pub phases: Vec<Phase>,
}

impl Plan {
    /// Assemble a plan from phases, stamping metadata and the content hash.
    pub fn new(provider_name: impl Into<String>, phases: Vec<Phase>) -> Self {
        let plan_hash = hash_phases(&phases);
        Self {
            metadata: PlanMetadata {
                created_at: Utc::now(),
                provider_name: provider_name.into(),
                plan_hash,
            },
            phases,
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        let plan: Plan = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse plan file {}", path.display()))?;
        Ok(plan)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_yaml::to_string(self).context("Failed to serialize plan")?;
        std::fs::write(path, raw)
            .with_context(|| format!("Failed to write plan file {}", path.display()))?;
        Ok(())
    }

    /// Content hash over the phases. Stable across save/load cycles of the
    /// same plan; metadata (timestamps) is excluded on purpose.
    pub fn compute_hash(&self) -> String {
        hash_phases(&self.phases)
    }

    /// Phases in execution order: `order` ascending, id as tie-break,
    /// deferred phases excluded.
    pub fn ordered_phases(&self) -> Vec<&Phase> {
        let mut phases: Vec<&Phase> = self.phases.iter().filter(|p| !p.deferred).collect();
        phases.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        phases
    }
}

fn hash_phases(phases: &[Phase]) -> String {
    // serde_yaml emits struct fields in declaration order, so serializing the
    // phase list gives a canonical byte stream for hashing.
    let canonical = serde_yaml::to_string(phases).unwrap_or_default();
    let digest = Sha256::digest(canonical.as_bytes());
    hex::encode(digest)
}
