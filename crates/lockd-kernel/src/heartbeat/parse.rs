//! Response normalization. Backends in the field send several legacy shapes;
//! they are reduced here, once, to a single directive.

use lockd_types::{ComparisonResult, LoanStatus, NextPayment, WireCommand};
use serde_json::{Map, Value};

use crate::error::NetworkError;

const DEACTIVATION_KEYWORDS: [&str; 4] = [
    "loan completed",
    "fully paid",
    "loan_completed",
    "payment complete",
];

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatDirective {
    pub is_locked: bool,
    pub lock_reason: Option<String>,
    pub deactivation_requested: bool,
    pub comparison: Option<ComparisonResult>,
    pub changes_detected: bool,
    /// Each entry decoded independently; a malformed command does not spoil
    /// the rest of the response.
    pub commands: Vec<Result<WireCommand, String>>,
    pub next_payment: Option<NextPayment>,
    pub loan_status: Option<LoanStatus>,
}

impl HeartbeatDirective {
    pub fn should_block(&self) -> bool {
        let comparison = self.comparison.as_ref();
        self.is_locked
            || comparison.is_some_and(ComparisonResult::has_high_severity)
            || (self.changes_detected && comparison.is_some_and(ComparisonResult::has_any_mismatch))
    }

    pub fn has_high_severity_mismatch(&self) -> bool {
        self.comparison
            .as_ref()
            .is_some_and(ComparisonResult::has_high_severity)
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_text(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn object<'a>(root: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    root.get(key).and_then(Value::as_object)
}

fn flag(map: Option<&Map<String, Value>>, key: &str) -> Option<bool> {
    map.and_then(|m| m.get(key)).and_then(as_bool)
}

fn locked(root: &Map<String, Value>) -> bool {
    let content = object(root, "content");
    let management = object(root, "management");
    flag(content, "is_locked")
        .or_else(|| flag(management, "is_locked"))
        .or_else(|| {
            as_text(root.get("management_status")).map(|s| s.eq_ignore_ascii_case("locked"))
        })
        .or_else(|| flag(Some(root), "is_locked"))
        .unwrap_or(false)
}

fn deactivation(root: &Map<String, Value>) -> bool {
    let deactivation = object(root, "deactivation");
    let text_of = |map: Option<&Map<String, Value>>, key: &str| -> Option<String> {
        as_text(map.and_then(|m| m.get(key))).map(str::to_ascii_lowercase)
    };
    let keyword_hit = [
        text_of(Some(root), "reason"),
        text_of(deactivation, "reason"),
        text_of(Some(root), "message"),
    ]
    .into_iter()
    .flatten()
    .any(|text| DEACTIVATION_KEYWORDS.iter().any(|k| text.contains(k)));

    flag(Some(root), "deactivate_requested").unwrap_or(false)
        || text_of(deactivation, "status").is_some_and(|s| s == "requested")
        || text_of(deactivation, "command").is_some_and(|c| c == "deactivate_now")
        || flag(Some(root), "payment_complete").unwrap_or(false)
        || flag(Some(root), "loan_complete").unwrap_or(false)
        || as_text(root.get("loan_status"))
            .and_then(LoanStatus::parse)
            .is_some_and(|s| s.is_settled())
        || keyword_hit
}

/// Normalize a heartbeat response body.
pub fn parse(body: &Value) -> Result<HeartbeatDirective, NetworkError> {
    let root = body
        .as_object()
        .ok_or_else(|| NetworkError::Decode("heartbeat response is not a JSON object".into()))?;

    // An error reply carries no verdict; it must never read as "unlocked".
    if flag(Some(root), "success") == Some(false) {
        let message = as_text(root.get("message"))
            .or_else(|| as_text(root.get("error")))
            .unwrap_or("success=false");
        return Err(NetworkError::Rejected(message.to_string()));
    }

    let comparison = match root.get("comparison_result") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            serde_json::from_value::<ComparisonResult>(value.clone())
                .map_err(|e| NetworkError::Decode(format!("comparison_result: {e}")))?,
        ),
    };

    let commands = match root.get("commands") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                serde_json::from_value::<WireCommand>(item.clone()).map_err(|e| e.to_string())
            })
            .collect(),
        Some(_) => return Err(NetworkError::Decode("commands is not an array".into())),
    };

    let next_payment = match root.get("next_payment") {
        None | Some(Value::Null) => None,
        Some(value) => {
            let payment = serde_json::from_value::<NextPayment>(value.clone())
                .map_err(|e| NetworkError::Decode(format!("next_payment: {e}")))?;
            let present =
                !payment.date_time.trim().is_empty() || payment.unlock_password.is_some();
            present.then_some(payment)
        }
    };

    let lock_reason = as_text(object(root, "content").and_then(|c| c.get("reason")))
        .or_else(|| as_text(object(root, "management").and_then(|m| m.get("reason"))))
        .or_else(|| as_text(root.get("reason")))
        .map(str::to_string)
        .or_else(|| comparison.as_ref().and_then(|c| c.lock_reason.clone()));

    let changes_detected = flag(Some(root), "changes_detected").unwrap_or(false)
        || comparison.as_ref().is_some_and(|c| c.changes_detected);

    Ok(HeartbeatDirective {
        is_locked: locked(root),
        lock_reason,
        deactivation_requested: deactivation(root),
        comparison,
        changes_detected,
        commands,
        next_payment,
        loan_status: as_text(root.get("loan_status")).and_then(LoanStatus::parse),
    })
}
