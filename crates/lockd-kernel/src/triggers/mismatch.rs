//! Identity baseline comparison and the mismatch lock.
//!
//! Field rules follow the backend's heartbeat comparison so that a device
//! offline for weeks reaches the same verdict the backend would: values are
//! trimmed and lowercased (unit strings also lose their spaces), IMEIs use
//! subset matching, and fields missing on either side are skipped.

use lockd_types::{
    ComparisonResult, DeviceLock, DeviceSnapshot, IdentityBaseline, Incident, IncidentKind,
    LockOrigin, LockReason, Mismatch, MismatchSeverity, Severity, WipeScope,
};
use serde_json::json;

use super::TriggerContext;
use crate::device::{DeviceError, Restrictions};
use crate::error::KernelError;

pub const IDENTITY_LOCK_ID: &str = "mismatch.identity";
pub const CRITICAL_LOCK_ID: &str = "mismatch.critical";

const IDENTIFIER_FIELDS: [&str; 3] = ["serial_number", "device_fingerprint", "device_imeis"];
const RAM_TOLERANCE_GB: f64 = 1.0;

fn reason(field: &str) -> String {
    match field {
        "serial_number" => "Device serial number mismatch detected".into(),
        "device_fingerprint" => "Device fingerprint mismatch detected".into(),
        "device_imeis" => "Device IMEI mismatch detected".into(),
        "is_device_rooted" => "Device rooting status changed".into(),
        "is_usb_debugging_enabled" => "USB debugging status changed".into(),
        "is_developer_mode_enabled" => "Developer mode status changed".into(),
        "is_bootloader_unlocked" => "Bootloader unlock status changed".into(),
        "is_custom_rom" => "Custom ROM status changed".into(),
        "installed_ram" => "Device RAM configuration changed".into(),
        "total_storage" => "Device storage configuration changed".into(),
        other => format!("Field '{other}' value changed"),
    }
}

fn severity(field: &str) -> MismatchSeverity {
    match field {
        "serial_number"
        | "device_fingerprint"
        | "device_imeis"
        | "is_device_rooted"
        | "is_usb_debugging_enabled"
        | "is_developer_mode_enabled"
        | "is_bootloader_unlocked" => MismatchSeverity::High,
        _ => MismatchSeverity::Medium,
    }
}

pub fn normalize(value: &str) -> String {
    let upper = value.to_ascii_uppercase();
    if ["GB", "MB", "TB", "KB"].iter().any(|unit| upper.contains(unit)) {
        value.replace(' ', "").to_lowercase()
    } else {
        value.trim().to_lowercase()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImeiVerdict {
    Match,
    /// Every reported IMEI is known, but some baseline IMEIs are missing.
    Reduced { missing: usize },
    /// An IMEI not in the baseline appeared.
    Foreign,
    /// No reported IMEI is in the baseline at all.
    Replaced,
}

pub fn compare_imeis(baseline: &[String], current: &[String]) -> ImeiVerdict {
    if baseline.is_empty() || current.is_empty() {
        return ImeiVerdict::Match;
    }
    let known: Vec<String> = baseline.iter().map(|i| normalize(i)).collect();
    let seen: Vec<String> = current.iter().map(|i| normalize(i)).collect();
    let foreign = seen.iter().filter(|i| !known.contains(i)).count();
    if foreign == seen.len() {
        return ImeiVerdict::Replaced;
    }
    if foreign > 0 {
        return ImeiVerdict::Foreign;
    }
    let missing = known.iter().filter(|i| !seen.contains(i)).count();
    if missing > 0 {
        ImeiVerdict::Reduced { missing }
    } else {
        ImeiVerdict::Match
    }
}

fn ram_gb(value: &str) -> Option<f64> {
    let lower = value.to_ascii_lowercase();
    let idx = lower.find("gb")?;
    let number: String = lower[..idx]
        .trim_end()
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    number.parse().ok()
}

/// Up to 1 GB less than enrolled is accepted as OS overhead.
fn ram_matches(baseline: &str, current: &str) -> bool {
    match (ram_gb(baseline), ram_gb(current)) {
        (Some(enrolled), Some(now)) => now >= enrolled - RAM_TOLERANCE_GB,
        _ => normalize(baseline) == normalize(current),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MismatchAssessment {
    pub comparison: ComparisonResult,
    pub identifier_mismatches: usize,
    /// Every reported IMEI is foreign: a swapped or cloned identity.
    pub clone_signature: bool,
    pub warnings: Vec<String>,
}

impl MismatchAssessment {
    pub fn has_identifier_mismatch(&self) -> bool {
        self.identifier_mismatches > 0
    }

    pub fn is_critical(&self) -> bool {
        self.identifier_mismatches >= 2 || self.clone_signature
    }
}

pub fn assess(baseline: &IdentityBaseline, snapshot: &DeviceSnapshot) -> MismatchAssessment {
    let mut out = MismatchAssessment::default();
    if baseline.is_empty() {
        return out;
    }
    let push = |out: &mut MismatchAssessment, field: &str, expected: String, observed: String| {
        out.comparison.push(Mismatch {
            field: field.to_string(),
            severity: severity(field),
            reason: reason(field),
            expected: Some(expected),
            observed: Some(observed),
        });
        if IDENTIFIER_FIELDS.iter().any(|f| *f == field) {
            out.identifier_mismatches += 1;
        }
    };

    let identity = &snapshot.identity;
    for (field, expected, observed) in [
        ("serial_number", &baseline.serial_number, &identity.serial_number),
        ("device_fingerprint", &baseline.device_fingerprint, &identity.device_fingerprint),
    ] {
        if !expected.is_empty()
            && !observed.is_empty()
            && normalize(expected) != normalize(observed)
        {
            push(&mut out, field, expected.clone(), observed.clone());
        }
    }

    match compare_imeis(&baseline.imeis, &identity.imeis) {
        ImeiVerdict::Match => {}
        ImeiVerdict::Reduced { missing } => out.warnings.push(format!(
            "IMEI count decreased from {} to {} ({missing} missing)",
            baseline.imeis.len(),
            identity.imeis.len()
        )),
        verdict => {
            out.clone_signature = verdict == ImeiVerdict::Replaced;
            push(
                &mut out,
                "device_imeis",
                baseline.imeis.join(","),
                identity.imeis.join(","),
            );
        }
    }

    let resources = &snapshot.resources;
    if !baseline.installed_ram.is_empty()
        && !resources.installed_ram.is_empty()
        && !ram_matches(&baseline.installed_ram, &resources.installed_ram)
    {
        push(
            &mut out,
            "installed_ram",
            baseline.installed_ram.clone(),
            resources.installed_ram.clone(),
        );
    }
    if !baseline.total_storage.is_empty()
        && !resources.total_storage.is_empty()
        && normalize(&baseline.total_storage) != normalize(&resources.total_storage)
    {
        push(
            &mut out,
            "total_storage",
            baseline.total_storage.clone(),
            resources.total_storage.clone(),
        );
    }

    let (expected, observed) = (&baseline.security, &snapshot.security);
    for (field, was, is) in [
        ("is_device_rooted", expected.rooted, observed.rooted),
        ("is_usb_debugging_enabled", expected.usb_debugging, observed.usb_debugging),
        ("is_developer_mode_enabled", expected.developer_mode, observed.developer_mode),
        ("is_bootloader_unlocked", expected.bootloader_unlocked, observed.bootloader_unlocked),
        ("is_custom_rom", expected.custom_rom, observed.custom_rom),
    ] {
        if was != is {
            push(&mut out, field, was.to_string(), is.to_string());
        }
    }

    if out.comparison.has_high_severity() {
        let fields: Vec<&str> = out
            .comparison
            .mismatches
            .iter()
            .filter(|m| m.severity == MismatchSeverity::High)
            .map(|m| m.field.as_str())
            .collect();
        out.comparison.lock_reason =
            Some(format!("Device security compromised: {}", fields.join(", ")));
    }
    out
}

/// Compare against the baseline and lock on identifier mismatches. The
/// CRITICAL response (restrictions plus scoped wipe) runs once: only when the
/// critical lock is newly applied.
pub fn apply(
    ctx: &TriggerContext<'_>,
    baseline: &IdentityBaseline,
    snapshot: &DeviceSnapshot,
) -> Result<MismatchAssessment, KernelError> {
    let assessment = assess(baseline, snapshot);
    for warning in &assessment.warnings {
        log::warn!("identity check: {warning}");
    }
    if !assessment.has_identifier_mismatch() {
        return Ok(assessment);
    }

    let message = assessment
        .comparison
        .lock_reason
        .clone()
        .unwrap_or_else(|| LockReason::DeviceMismatch.describe().to_string());
    let lock = DeviceLock::hard(
        IDENTITY_LOCK_ID,
        LockReason::DeviceMismatch,
        LockOrigin::Mismatch,
        message.as_str(),
        ctx.now_ms,
    );
    if ctx.authority.apply_lock(lock)?.applied {
        ctx.audit.incident(
            Incident::new(
                IncidentKind::DeviceMismatch,
                Severity::High,
                message.as_str(),
                ctx.now_ms,
            )
            .with_subject(IDENTITY_LOCK_ID),
        );
    }

    if assessment.is_critical() {
        escalate(ctx, &assessment)?;
    }
    Ok(assessment)
}

fn escalate(ctx: &TriggerContext<'_>, assessment: &MismatchAssessment) -> Result<(), KernelError> {
    let lock = DeviceLock::hard(
        CRITICAL_LOCK_ID,
        LockReason::DeviceMismatch,
        LockOrigin::Mismatch,
        "Device identity compromised",
        ctx.now_ms,
    );
    if !ctx.authority.apply_lock(lock)?.applied {
        return Ok(());
    }
    let details = format!(
        "{} identifier mismatches{}; restricting device and wiping sensitive data",
        assessment.identifier_mismatches,
        if assessment.clone_signature { ", clone signature" } else { "" }
    );
    ctx.audit.incident(
        Incident::new(
            IncidentKind::DeviceMismatch,
            Severity::Critical,
            details.as_str(),
            ctx.now_ms,
        )
        .with_subject(CRITICAL_LOCK_ID),
    );
    let report = |err: DeviceError| {
        let incident = KernelError::from(err).to_incident(ctx.now_ms);
        ctx.audit.incident(incident.with_subject(CRITICAL_LOCK_ID));
    };
    if let Err(err) = ctx.device.set_restrictions(Restrictions::lockdown()) {
        report(err);
    }
    if let Err(err) = ctx.device.wipe(WipeScope::SensitiveData) {
        report(err);
    }
    let fields: Vec<&str> = assessment
        .comparison
        .mismatches
        .iter()
        .map(|m| m.field.as_str())
        .collect();
    ctx.queue_alert(
        "device_mismatch",
        Severity::Critical,
        json!({
            "fields": fields,
            "identifier_mismatches": assessment.identifier_mismatches,
            "clone_signature": assessment.clone_signature,
        }),
    );
    Ok(())
}
