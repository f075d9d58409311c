use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Outcome of one named phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Passed,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub status: PhaseStatus,
    pub duration: f64,
}

/// Structured result of a run. Serialized as the single trailing JSON
/// line on stdout under `--structured-output`; this is the protocol
/// between parent and child runs, so the field set is fixed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub scenario: String,
    pub success: bool,
    pub duration_seconds: f64,
    pub phases: Vec<PhaseReport>,
    pub context: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn new(scenario: &str) -> Self {
        Self {
            scenario: scenario.to_string(),
            success: true,
            duration_seconds: 0.0,
            phases: Vec::new(),
            context: BTreeMap::new(),
            error: None,
        }
    }

    /// The single-line trailer. Must be the last non-empty line of
    /// stdout.
    pub fn trailer_line(&self) -> String {
        serde_json::to_string(self).expect("report serialization cannot fail")
    }
}

/// Find the structured-result trailer in captured output: the last
/// non-empty line, starting at column zero with `{`, that parses as a
/// JSON object. Anything else means no trailer.
pub fn parse_trailer(output: &str) -> Option<serde_json::Value> {
    let last = output.lines().rev().find(|line| !line.trim().is_empty())?;
    if !last.starts_with('{') {
        return None;
    }
    match serde_json::from_str::<serde_json::Value>(last) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}
