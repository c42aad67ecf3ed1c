use lockd_types::{DeviceLock, EpochMs, LoanSnapshot, LoanStatus, LockOrigin, LockReason};

use crate::authority::LockAuthority;
use crate::error::KernelError;

pub const REMINDER_LOCK_ID: &str = "payment.reminder";
pub const OVERDUE_LOCK_ID: &str = "payment.overdue";
pub const DEFAULT_REMINDER_WINDOW_MS: u64 = 2 * 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentDecision {
    /// Settled, or nothing due soon: no payment lock should be active.
    Clear,
    Remind(DeviceLock),
    Overdue(DeviceLock),
}

pub fn evaluate(loan: &LoanSnapshot, now_ms: EpochMs, reminder_window_ms: u64) -> PaymentDecision {
    if loan.status.is_settled() {
        return PaymentDecision::Clear;
    }
    let past_due = loan.next_due_at_ms.is_some_and(|due| due <= now_ms);
    if loan.status == LoanStatus::Overdue || loan.days_overdue > 0 || past_due {
        let reason = LockReason::PaymentOverdue;
        return PaymentDecision::Overdue(DeviceLock::hard(
            OVERDUE_LOCK_ID,
            reason,
            LockOrigin::Payment,
            reason.describe(),
            now_ms,
        ));
    }
    match loan.next_due_at_ms {
        Some(due) if due - now_ms <= reminder_window_ms => {
            let reason = LockReason::PaymentReminder;
            let lock = DeviceLock::soft(
                REMINDER_LOCK_ID,
                reason,
                LockOrigin::Payment,
                reason.describe(),
                now_ms,
            )
            .with_expiry(due);
            PaymentDecision::Remind(match &loan.unlock_pin_digest {
                Some(digest) => lock.with_pin(digest.clone()),
                None => lock,
            })
        }
        _ => PaymentDecision::Clear,
    }
}

/// Evaluate and submit. The new lock lands before the other payment lock is
/// removed, so the device never passes through `UNLOCKED` on the way.
pub fn apply(
    authority: &LockAuthority,
    loan: &LoanSnapshot,
    now_ms: EpochMs,
    reminder_window_ms: u64,
) -> Result<PaymentDecision, KernelError> {
    let decision = evaluate(loan, now_ms, reminder_window_ms);
    match &decision {
        PaymentDecision::Clear => {
            let removed = authority.remove_origin(&[LockOrigin::Payment])?;
            if !removed.is_empty() {
                log::info!(
                    "loan {} ({}): payment locks cleared",
                    loan.loan_number,
                    loan.status.as_str()
                );
            }
        }
        PaymentDecision::Remind(lock) => {
            authority.apply_lock(lock.clone())?;
            authority.remove_lock(OVERDUE_LOCK_ID)?;
        }
        PaymentDecision::Overdue(lock) => {
            authority.apply_lock(lock.clone())?;
            authority.remove_lock(REMINDER_LOCK_ID)?;
        }
    }
    Ok(decision)
}
