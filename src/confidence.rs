//! Confidence gate: maps provider confidence and migration complexity to a
//! disposition for each returned fix.
//!
//! The gate is a pure function of its inputs; all policy lives in
//! `GateConfig` so tests and callers see identical behavior.

use crate::model::Complexity;
use std::collections::BTreeMap;

/// What to do with a returned fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// Write the fixed content.
    Apply,
    /// Write the fixed content and emit a warning event.
    WarnApply,
    /// Leave the file untouched; record a low-confidence skip.
    Skip,
    /// Leave the file untouched; append a review item for a human.
    DeferReview,
}

/// Configured action for fixes below the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LowConfidenceAction {
    #[default]
    Skip,
    WarnApply,
    DeferReview,
}

/// Disposition plus the human-readable reason recorded alongside it.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub action: GateAction,
    pub reason: String,
}

const DEFAULT_THRESHOLD: f64 = 0.80;

#[derive(Debug, Clone)]
pub struct GateConfig {
    /// When false every fix is applied unconditionally.
    pub enabled: bool,
    /// Derive complexity from effort when the analyzer assigned none.
    pub use_effort_fallback: bool,
    pub low_confidence_action: LowConfidenceAction,
    /// Global override: sets every threshold uniformly when in [0, 1].
    pub min_confidence: Option<f64>,
    /// Per-complexity overrides, keyed by complexity name. Unknown keys and
    /// out-of-range values are ignored.
    pub overrides: BTreeMap<String, f64>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_effort_fallback: true,
            low_confidence_action: LowConfidenceAction::default(),
            min_confidence: None,
            overrides: BTreeMap::new(),
        }
    }
}

/// Evaluates fixes against the configured thresholds.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceGate {
    config: GateConfig,
}

impl ConfidenceGate {
    pub fn new(config: GateConfig) -> Self {
        Self { config }
    }

    /// Decide what to do with a fix of the given confidence.
    ///
    /// Confidence exactly at the threshold applies.
    pub fn evaluate(
        &self,
        confidence: f64,
        complexity: Option<Complexity>,
        effort: u8,
    ) -> GateDecision {
        if !self.config.enabled {
            return GateDecision {
                action: GateAction::Apply,
                reason: "confidence gating disabled".to_string(),
            };
        }

        if !(0.0..=1.0).contains(&confidence) || confidence.is_nan() {
            return GateDecision {
                action: GateAction::Skip,
                reason: format!("invalid confidence {confidence}"),
            };
        }

        let complexity = complexity.or_else(|| {
            self.config
                .use_effort_fallback
                .then(|| Complexity::from_effort(effort))
        });
        let threshold = self.threshold_for(complexity);

        if confidence >= threshold {
            GateDecision {
                action: GateAction::Apply,
                reason: format!(
                    "confidence {confidence:.2} meets {} threshold {threshold:.2}",
                    complexity_label(complexity)
                ),
            }
        } else {
            let action = match self.config.low_confidence_action {
                LowConfidenceAction::Skip => GateAction::Skip,
                LowConfidenceAction::WarnApply => GateAction::WarnApply,
                LowConfidenceAction::DeferReview => GateAction::DeferReview,
            };
            GateDecision {
                action,
                reason: format!(
                    "confidence {confidence:.2} below {} threshold {threshold:.2}",
                    complexity_label(complexity)
                ),
            }
        }
    }

    /// Effective threshold for a complexity: per-complexity override, then the
    /// global override, then the built-in table.
    fn threshold_for(&self, complexity: Option<Complexity>) -> f64 {
        if let Some(c) = complexity {
            if let Some(&v) = self.config.overrides.get(c.as_str()) {
                if (0.0..=1.0).contains(&v) {
                    return v;
                }
            }
        }
        if let Some(v) = self.config.min_confidence {
            if (0.0..=1.0).contains(&v) {
                return v;
            }
        }
        match complexity {
            Some(Complexity::Trivial) => 0.70,
            Some(Complexity::Low) => 0.75,
            Some(Complexity::Medium) => 0.80,
            Some(Complexity::High) => 0.90,
            Some(Complexity::Expert) => 0.95,
            None => DEFAULT_THRESHOLD,
        }
    }
}

fn complexity_label(complexity: Option<Complexity>) -> &'static str {
    complexity.map_or("default", |c| c.as_str())
}
