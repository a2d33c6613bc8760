//! Plan synthesis: turn analyzer violations into an ordered phase plan.
//!
//! The provider is asked first; without one (or when it returns nothing
//! usable) a deterministic local grouping by category and effort keeps the
//! tool usable offline.

use crate::model::{Category, EffortRange, Phase, Plan, Risk, Violation};
use crate::provider::{FixProvider, PlanRequest};
use anyhow::Result;

/// Rough per-incident cost used when the provider gave no estimate.
const ESTIMATED_COST_PER_INCIDENT: f64 = 0.02;

/// Build a plan, preferring the provider's grouping.
pub async fn build_plan(
    provider: Option<&dyn FixProvider>,
    violations: Vec<Violation>,
) -> Result<Plan> {
    if let Some(provider) = provider {
        match provider.generate_plan(PlanRequest { violations: violations.clone() }).await {
            Ok(response) if !response.phases.is_empty() => {
                return Ok(Plan::new(provider.name(), response.phases));
            }
            Ok(_) => {
                tracing::warn!("provider returned an empty plan; falling back to static grouping");
            }
            Err(err) => {
                tracing::warn!(error = %err, "provider plan generation failed; falling back");
            }
        }
    }
    Ok(Plan::new("static", synthesize_phases(violations)))
}

/// Deterministic grouping: category severity first (mandatory, optional,
/// potential), then effort bands within each category. Violations sort by id
/// inside a phase.
pub fn synthesize_phases(violations: Vec<Violation>) -> Vec<Phase> {
    struct Band {
        label: &'static str,
        range: EffortRange,
        risk: Risk,
    }
    const BANDS: [Band; 3] = [
        Band {
            label: "quick wins",
            range: EffortRange { min: 0, max: 3 },
            risk: Risk::Low,
        },
        Band {
            label: "standard changes",
            range: EffortRange { min: 4, max: 6 },
            risk: Risk::Medium,
        },
        Band {
            label: "deep changes",
            range: EffortRange { min: 7, max: 10 },
            risk: Risk::High,
        },
    ];
    const CATEGORIES: [Category; 3] = [Category::Mandatory, Category::Optional, Category::Potential];

    let mut phases = Vec::new();
    let mut order = 1u32;
    for category in CATEGORIES {
        for band in &BANDS {
            let mut selected: Vec<Violation> = violations
                .iter()
                .filter(|v| {
                    v.category == category
                        && v.effort >= band.range.min
                        && v.effort <= band.range.max
                })
                .cloned()
                .collect();
            if selected.is_empty() {
                continue;
            }
            selected.sort_by(|a, b| a.id.cmp(&b.id));
            let incidents: usize = selected.iter().map(|v| v.incidents.len()).sum();
            phases.push(Phase {
                id: format!("phase-{order}"),
                name: format!("{category} {}", band.label),
                order,
                risk: band.risk,
                category: Some(category),
                effort_range: band.range,
                estimated_cost: incidents as f64 * ESTIMATED_COST_PER_INCIDENT,
                // Potential violations are informational; leave them out of
                // the default run.
                deferred: category == Category::Potential,
                violations: selected,
            });
            order += 1;
        }
    }
    phases
}
