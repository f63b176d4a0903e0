//! The review-findings contract between review agents and the engine.
//!
//! A review agent writes `review_findings.json` into the repository
//! workspace it reviewed. The worker controller reads it, never writes it.

use serde::{Deserialize, Serialize};

/// Severity of a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

/// The reviewer's overall verdict for the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallAssessment {
    Pass,
    NeedsFixes,
}

/// One issue raised by a review agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub severity: Severity,
    pub file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub description: String,
    #[serde(default)]
    pub suggested_fix: String,
    /// Role label of the dev agent that should address this finding.
    #[serde(default)]
    pub target_agent: String,
}

/// The full contents of a `review_findings.json` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewFindings {
    #[serde(default)]
    pub findings: Vec<Finding>,
    pub overall_assessment: OverallAssessment,
    #[serde(default)]
    pub summary: String,
}

impl ReviewFindings {
    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    pub fn is_pass(&self) -> bool {
        self.overall_assessment == OverallAssessment::Pass
    }
}
