//! Lock triggers. Each trigger turns observed state into locks of its own
//! origin and submits them to the authority; none of them touch the network.

pub mod mismatch;
pub mod payment;
pub mod tamper;

use lockd_store::{Alert, AlertOutbox};
use lockd_types::{EpochMs, Severity};
use serde_json::Value;

use crate::audit::AuditLog;
use crate::authority::LockAuthority;
use crate::device::DevicePolicy;

/// Everything a trigger may act on during one evaluation.
pub struct TriggerContext<'a> {
    pub authority: &'a LockAuthority,
    pub device: &'a dyn DevicePolicy,
    pub outbox: &'a AlertOutbox,
    pub audit: &'a AuditLog,
    pub device_id: &'a str,
    pub now_ms: EpochMs,
}

impl TriggerContext<'_> {
    /// Queue a best-effort report. A full or failing outbox never blocks the
    /// lock that caused the report.
    pub fn queue_alert(&self, kind: &str, severity: Severity, mut body: Value) {
        if let Value::Object(map) = &mut body {
            map.insert("device_id".into(), Value::from(self.device_id));
            map.insert("detected_at".into(), Value::from(self.now_ms));
            map.insert("severity".into(), Value::from(severity.to_string()));
        }
        let alert = Alert {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            severity,
            body: body.to_string(),
            created_at_ms: self.now_ms,
            attempts: 0,
        };
        if let Err(err) = self.outbox.push(alert) {
            log::error!("could not queue {kind} alert: {err}");
        }
    }
}
