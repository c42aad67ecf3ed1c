use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchSeverity {
    #[serde(alias = "MEDIUM", alias = "Medium")]
    Medium,
    #[serde(alias = "HIGH", alias = "High")]
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub field: String,
    pub severity: MismatchSeverity,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed: Option<String>,
}

/// Per-field diff between the expected identity and what the device reports.
/// Shared by the local baseline check and the backend's `comparison_result`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonResult {
    #[serde(default)]
    pub mismatches: Vec<Mismatch>,
    #[serde(default)]
    pub high_severity_count: u32,
    #[serde(default)]
    pub total_mismatches: u32,
    #[serde(default)]
    pub changes_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_reason: Option<String>,
}

impl ComparisonResult {
    /// Backends sometimes send counts without the list, or the list without counts.
    pub fn has_any_mismatch(&self) -> bool {
        self.total_mismatches > 0 || self.high_severity_count > 0 || !self.mismatches.is_empty()
    }

    pub fn has_high_severity(&self) -> bool {
        self.high_severity_count > 0
            || self
                .mismatches
                .iter()
                .any(|m| m.severity == MismatchSeverity::High)
    }

    pub fn push(&mut self, mismatch: Mismatch) {
        if mismatch.severity == MismatchSeverity::High {
            self.high_severity_count += 1;
        }
        self.total_mismatches += 1;
        self.changes_detected = true;
        self.mismatches.push(mismatch);
    }
}
