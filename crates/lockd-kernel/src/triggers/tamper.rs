use lockd_types::{
    DeviceLock, EpochMs, Incident, IncidentKind, LockOrigin, LockReason, SecurityPosture, Severity,
    TamperKind,
};
use serde_json::json;

use super::TriggerContext;
use crate::error::KernelError;

pub const LOCK_PREFIX: &str = "tamper.";

pub fn lock_id(kind: TamperKind) -> String {
    format!("{LOCK_PREFIX}{}", kind.slug())
}

/// Posture flags that count as tampering, in a stable order.
pub fn detect(security: &SecurityPosture) -> Vec<TamperKind> {
    [
        (security.developer_mode, TamperKind::DeveloperOptions),
        (security.usb_debugging, TamperKind::UsbDebugging),
        (security.bootloader_unlocked, TamperKind::BootloaderUnlocked),
        (security.rooted, TamperKind::Rooted),
        (security.custom_rom, TamperKind::CustomRom),
        (security.unauthorized_accessibility, TamperKind::UnauthorizedAccessibility),
        (security.protected_app_removed, TamperKind::ProtectedAppRemoved),
        (security.safe_mode, TamperKind::SafeMode),
    ]
    .into_iter()
    .filter_map(|(on, kind)| on.then_some(kind))
    .collect()
}

pub fn reason_for(kind: TamperKind) -> LockReason {
    match kind {
        TamperKind::DeveloperOptions => LockReason::DeveloperOptionsAttempt,
        TamperKind::SafeMode => LockReason::SafeModeAttempt,
        _ => LockReason::SystemTamper,
    }
}

pub fn lock_for(kind: TamperKind, now_ms: EpochMs) -> DeviceLock {
    let reason = reason_for(kind);
    DeviceLock::hard(lock_id(kind), reason, LockOrigin::Tamper, reason.describe(), now_ms)
        .with_tamper(kind)
}

/// Lock on every detected tamper kind. Returns the kinds that were newly
/// locked; only those raise an incident and an outbox report. Tamper locks
/// are never cleared here, even once the posture flag goes away.
pub fn apply(
    ctx: &TriggerContext<'_>,
    security: &SecurityPosture,
) -> Result<Vec<TamperKind>, KernelError> {
    let mut fresh = Vec::new();
    for kind in detect(security) {
        let lock = lock_for(kind, ctx.now_ms);
        let id = lock.id.clone();
        if !ctx.authority.apply_lock(lock)?.applied {
            continue;
        }
        ctx.audit.incident(
            Incident::new(
                IncidentKind::TamperDetected,
                Severity::High,
                format!("tamper detected: {}", kind.slug()),
                ctx.now_ms,
            )
            .with_subject(id.as_str()),
        );
        ctx.queue_alert(
            "tamper",
            Severity::High,
            json!({ "tamper_type": kind, "lock_id": id, "reason": reason_for(kind) }),
        );
        fresh.push(kind);
    }
    Ok(fresh)
}
