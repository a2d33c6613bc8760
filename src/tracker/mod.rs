//! Commit and PR tracking.
//!
//! Both trackers share the same buffering state machine over the four
//! granularities; only the flush side-effects differ (a commit vs. a branch
//! push + pull request).

pub mod commit;
pub mod pr;

pub use commit::{CommitRecord, CommitTracker};
pub use pr::{CreatedPr, PrTracker};

use crate::model::IncidentKey;
use std::path::PathBuf;

/// An accepted fix, handed by value from the executor to the trackers.
/// Only fixes the batch engine marked successful ever become one of these.
#[derive(Debug, Clone)]
pub struct AcceptedFix {
    pub key: IncidentKey,
    pub violation_id: String,
    pub description: String,
    /// Repository-relative path of the patched file.
    pub path: PathBuf,
    pub line: u32,
    pub confidence: f64,
    pub cost: f64,
    pub tokens: u64,
    pub effort: u8,
    pub provider: String,
}

/// Sort fixes into the canonical `(violationId, path, line)` order used for
/// commit messages and PR bodies. Batch results arrive in arbitrary order;
/// this re-establishes determinism.
pub(crate) fn sort_fixes(fixes: &mut [AcceptedFix]) {
    fixes.sort_by(|a, b| {
        a.violation_id
            .cmp(&b.violation_id)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.line.cmp(&b.line))
    });
}
