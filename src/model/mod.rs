//! Domain model for the remediation engine.
//!
//! - `violation` — analyzer output: violations, incidents, complexity scale
//! - `plan` — phased execution plan consumed by the executor

pub mod plan;
pub mod violation;

pub use plan::{EffortRange, Phase, Plan, PlanMetadata, Risk};
pub use violation::{Category, Complexity, Incident, IncidentKey, Violation, load_analysis};
