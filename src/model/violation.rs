//! Analyzer output model: violations and their incidents.
//!
//! Two on-disk shapes are accepted:
//! - a flat document with a root `violations:` sequence
//! - the native ruleset shape: a sequence of rulesets, each carrying a
//!   `violations:` map keyed by violation id

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

/// Analyzer-assigned severity of a violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Mandatory,
    Optional,
    Potential,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::Mandatory => "mandatory",
            Category::Optional => "optional",
            Category::Potential => "potential",
        };
        f.write_str(s)
    }
}

/// Migration complexity scale used by the confidence gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Trivial,
    Low,
    Medium,
    High,
    Expert,
}

impl Complexity {
    /// Map an effort score onto the complexity scale. Used when the analyzer
    /// did not assign a complexity.
    pub fn from_effort(effort: u8) -> Self {
        match effort {
            0..=2 => Complexity::Trivial,
            3..=4 => Complexity::Low,
            5..=6 => Complexity::Medium,
            7..=8 => Complexity::High,
            _ => Complexity::Expert,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Trivial => "trivial",
            Complexity::Low => "low",
            Complexity::Medium => "medium",
            Complexity::High => "high",
            Complexity::Expert => "expert",
        }
    }
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single occurrence of a violation in the analyzed codebase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    /// File URI of the form `file://<path>`, optionally suffixed `:<line>`.
    pub uri: String,
    /// 1-based line number.
    #[serde(default)]
    pub line_number: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub code_snip: String,
}

/// An identified rule breach with all of its incidents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub category: Category,
    #[serde(default)]
    pub effort: u8,
    /// Optional analyzer-assigned complexity; the gate falls back to an
    /// effort-derived value when absent.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "migrationComplexity")]
    pub complexity: Option<Complexity>,
    #[serde(default)]
    pub incidents: Vec<Incident>,
}

/// Deduplication identity of an incident within a run:
/// `(violationId, normalizedPath, lineNumber)`. The incident message is
/// deliberately not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncidentKey {
    pub violation_id: String,
    pub path: String,
    pub line: u32,
}

impl IncidentKey {
    pub fn new(violation_id: impl Into<String>, path: impl Into<String>, line: u32) -> Self {
        Self {
            violation_id: violation_id.into(),
            path: path.into(),
            line,
        }
    }
}

// Keys are serialized as `<violationId>|<path>|<line>` in the state file.
impl fmt::Display for IncidentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.violation_id, self.path, self.line)
    }
}

impl std::str::FromStr for IncidentKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        // The path segment may itself contain '|'-free text only; split from
        // both ends so the violation id and line survive odd paths.
        let (violation_id, rest) = s
            .split_once('|')
            .context("incident key missing violation id separator")?;
        let (path, line) = rest
            .rsplit_once('|')
            .context("incident key missing line separator")?;
        let line: u32 = line.parse().context("incident key line is not a number")?;
        Ok(IncidentKey::new(violation_id, path, line))
    }
}

#[derive(Debug, Deserialize)]
struct AnalysisFile {
    violations: Vec<Violation>,
}

#[derive(Debug, Deserialize)]
struct Ruleset {
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
    #[serde(default)]
    violations: BTreeMap<String, RulesetViolation>,
}

/// Violation as it appears inside a ruleset map; the id lives in the key.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RulesetViolation {
    #[serde(default)]
    description: String,
    category: Category,
    #[serde(default)]
    effort: u8,
    #[serde(default, alias = "migrationComplexity")]
    complexity: Option<Complexity>,
    #[serde(default)]
    incidents: Vec<Incident>,
}

/// Load analyzer output from disk, accepting both supported shapes.
pub fn load_analysis(path: &Path) -> Result<Vec<Violation>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read analysis file {}", path.display()))?;

    if let Ok(file) = serde_yaml::from_str::<AnalysisFile>(&raw) {
        return Ok(file.violations);
    }

    let rulesets: Vec<Ruleset> = serde_yaml::from_str(&raw).with_context(|| {
        format!(
            "Analysis file {} matches neither the flat nor the ruleset shape",
            path.display()
        )
    })?;

    let mut violations = Vec::new();
    for ruleset in rulesets {
        for (id, v) in ruleset.violations {
            violations.push(Violation {
                id,
                description: v.description,
                category: v.category,
                effort: v.effort,
                complexity: v.complexity,
                incidents: v.incidents,
            });
        }
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_complexity_from_effort_buckets() {
        assert_eq!(Complexity::from_effort(0), Complexity::Trivial);
        assert_eq!(Complexity::from_effort(2), Complexity::Trivial);
        assert_eq!(Complexity::from_effort(3), Complexity::Low);
        assert_eq!(Complexity::from_effort(4), Complexity::Low);
        assert_eq!(Complexity::from_effort(5), Complexity::Medium);
        assert_eq!(Complexity::from_effort(6), Complexity::Medium);
        assert_eq!(Complexity::from_effort(7), Complexity::High);
        assert_eq!(Complexity::from_effort(8), Complexity::High);
        assert_eq!(Complexity::from_effort(9), Complexity::Expert);
        assert_eq!(Complexity::from_effort(10), Complexity::Expert);
    }

    #[test]
    fn test_incident_key_round_trip() {
        let key = IncidentKey::new("v1", "src/main/App.java", 42);
        let parsed = IncidentKey::from_str(&key.to_string()).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn test_incident_key_rejects_garbage() {
        assert!(IncidentKey::from_str("no separators here").is_err());
        assert!(IncidentKey::from_str("v1|path|not-a-number").is_err());
    }

    #[test]
    fn test_load_flat_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.yaml");
        std::fs::write(
            &path,
            r#"
violations:
  - id: jakarta-001
    description: javax import must become jakarta
    category: mandatory
    effort: 1
    incidents:
      - uri: file:///workspace/src/App.java
        lineNumber: 3
        message: replace import
        codeSnip: "import javax.ejb.Stateless;"
"#,
        )
        .unwrap();

        let violations = load_analysis(&path).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].id, "jakarta-001");
        assert_eq!(violations[0].category, Category::Mandatory);
        assert_eq!(violations[0].incidents[0].line_number, 3);
    }

    #[test]
    fn test_load_ruleset_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.yaml");
        std::fs::write(
            &path,
            r#"
- name: quarkus/springboot
  violations:
    spring-to-quarkus-001:
      description: replace spring annotation
      category: optional
      effort: 3
      incidents:
        - uri: file:///workspace/src/Service.java
          lineNumber: 10
          message: use CDI
"#,
        )
        .unwrap();

        let violations = load_analysis(&path).unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].id, "spring-to-quarkus-001");
        assert_eq!(violations[0].category, Category::Optional);
        assert_eq!(violations[0].effort, 3);
    }

    #[test]
    fn test_complexity_yaml_lowercase() {
        let c: Complexity = serde_yaml::from_str("expert").unwrap();
        assert_eq!(c, Complexity::Expert);
        assert_eq!(serde_yaml::to_string(&Complexity::Trivial).unwrap().trim(), "trivial");
    }
}
