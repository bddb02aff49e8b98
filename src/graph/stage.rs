//! Stage declarations and the per-chunk stage graph.
//!
//! Epistemic foundation:
//! - K_i: A stage is pure data (name + prompt template), no mutable state
//! - K_i: Phases run in order; stages inside a phase run concurrently
//! - B_i: User-declared graphs may be malformed → validated at construction

use crate::models::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Unique stage name within a graph.
///
/// Any printable text up to [`StageName::MAX_LEN`] characters, without
/// surrounding whitespace. File-backed stores escape it for their keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StageName(String);

impl StageName {
    /// Longest accepted name, in characters.
    pub const MAX_LEN: usize = 64;

    /// Creates a stage name, returning `None` if it is empty, too long,
    /// padded with whitespace or contains control characters.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let v = value.into();
        let valid = !v.is_empty()
            && v.chars().count() <= Self::MAX_LEN
            && v.trim() == v
            && !v.chars().any(char::is_control);
        if valid { Some(Self(v)) } else { None }
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for StageName {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        Self::new(value.clone()).ok_or_else(|| format!("invalid stage name '{value}'"))
    }
}

impl From<StageName> for String {
    fn from(name: StageName) -> Self {
        name.0
    }
}

impl std::fmt::Display for StageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One specialist processing step applied to a chunk's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    name: StageName,
    template: String,
}

impl Stage {
    /// Create a stage; fails with `InvalidGraph` on a malformed name.
    pub fn new(name: &str, template: impl Into<String>) -> Result<Self> {
        let name = StageName::new(name).ok_or_else(|| {
            PipelineError::InvalidGraph(format!(
                "stage name '{name}' must be 1-{} printable characters without surrounding whitespace",
                StageName::MAX_LEN
            ))
        })?;
        Ok(Self {
            name,
            template: template.into(),
        })
    }

    pub fn name(&self) -> &StageName {
        &self.name
    }

    /// Prompt template sent alongside the chunk text.
    pub fn template(&self) -> &str {
        &self.template
    }
}

/// Ordered phases of stages executed for every chunk.
///
/// K_i: At least one phase, no empty phase, stage names unique graph-wide.
#[derive(Debug, Clone)]
pub struct StageGraph {
    phases: Vec<Vec<Stage>>,
}

impl StageGraph {
    /// Build and validate a graph.
    pub fn new(phases: Vec<Vec<Stage>>) -> Result<Self> {
        if phases.is_empty() {
            return Err(PipelineError::InvalidGraph(
                "graph needs at least one phase".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for (i, phase) in phases.iter().enumerate() {
            if phase.is_empty() {
                return Err(PipelineError::InvalidGraph(format!("phase {i} is empty")));
            }
            for stage in phase {
                if !seen.insert(stage.name.clone()) {
                    return Err(PipelineError::InvalidGraph(format!(
                        "duplicate stage name '{}'",
                        stage.name
                    )));
                }
            }
        }

        Ok(Self { phases })
    }

    /// Phases in execution order.
    pub fn phases(&self) -> &[Vec<Stage>] {
        &self.phases
    }

    /// All stages in declaration order (phase by phase).
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.phases.iter().flatten()
    }

    /// Look up a stage by name.
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.stages().find(|s| s.name.as_str() == name)
    }

    /// Total number of stages.
    pub fn stage_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> Stage {
        Stage::new(name, format!("{name} prompt")).unwrap()
    }

    #[test]
    fn test_valid_graph() {
        let graph = StageGraph::new(vec![vec![stage("A"), stage("B")], vec![stage("C")]]).unwrap();
        assert_eq!(graph.phases().len(), 2);
        assert_eq!(graph.stage_count(), 3);
        let names: Vec<_> = graph.stages().map(|s| s.name().as_str()).collect();
        assert_eq!(names, ["A", "B", "C"]);
        assert_eq!(graph.stage("C").unwrap().template(), "C prompt");
        assert!(graph.stage("D").is_none());
    }

    #[test]
    fn test_rejects_empty_graph() {
        assert!(matches!(
            StageGraph::new(vec![]),
            Err(PipelineError::InvalidGraph(_))
        ));
    }

    #[test]
    fn test_rejects_empty_phase() {
        let err = StageGraph::new(vec![vec![stage("A")], vec![]]).unwrap_err();
        assert!(err.to_string().contains("phase 1 is empty"));
    }

    #[test]
    fn test_rejects_duplicate_names_across_phases() {
        let err = StageGraph::new(vec![vec![stage("A")], vec![stage("A")]]).unwrap_err();
        assert!(err.to_string().contains("duplicate stage name 'A'"));
    }

    #[test]
    fn test_stage_name_rules() {
        assert!(StageName::new("FinancialStatementsExpert").is_some());
        assert!(StageName::new("Financial Statements Expert").is_some());
        assert!(StageName::new("Risk/Factors (v2)").is_some());
        assert!(StageName::new("").is_none());
        assert!(StageName::new(" padded").is_none());
        assert!(StageName::new("line\nbreak").is_none());
        assert!(StageName::new("x".repeat(StageName::MAX_LEN)).is_some());
        assert!(StageName::new("x".repeat(StageName::MAX_LEN + 1)).is_none());
        assert!(Stage::new("tab\tname", "x").is_err());
    }

    #[test]
    fn test_stage_name_deserialize_validates() {
        let ok: StageName = serde_json::from_str("\"Planner\"").unwrap();
        assert_eq!(ok.as_str(), "Planner");
        assert!(serde_json::from_str::<StageName>("\"\"").is_err());
    }
}
