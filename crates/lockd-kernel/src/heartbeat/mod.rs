//! Heartbeat and verification protocol.
//!
//! A cycle composes a signed snapshot, sends it, parses the whole response
//! into a [`HeartbeatDirective`], and only then applies it. A failed send
//! never changes lock state.

mod compose;
mod parse;
mod protocol;

pub use compose::compose;
pub use parse::{HeartbeatDirective, parse};
pub use protocol::{BACKEND_LOCK_ID, CycleOutcome, HeartbeatProtocol, ProtocolParts};

use async_trait::async_trait;
use lockd_store::Alert;
use lockd_types::HeartbeatRequest;
use serde_json::Value;

use crate::error::NetworkError;

#[async_trait]
pub trait HeartbeatTransport: Send + Sync {
    /// POST the heartbeat and return the decoded JSON body of a 2xx response.
    async fn send(&self, request: &HeartbeatRequest) -> Result<Value, NetworkError>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<(), NetworkError>;
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
    /// Fast retries stop after this many consecutive failures; the caller
    /// falls back to its regular interval.
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 30_000,
            max_ms: 30 * 60 * 1000,
            max_attempts: 8,
        }
    }
}

impl Backoff {
    /// Delay before retry number `failures` (1-based). `None` once the
    /// ceiling is reached or when nothing has failed.
    pub fn delay_ms(&self, failures: u32) -> Option<u64> {
        if failures == 0 || failures > self.max_attempts {
            return None;
        }
        let factor = 1u64.checked_shl(failures - 1).unwrap_or(u64::MAX);
        Some(self.base_ms.saturating_mul(factor).min(self.max_ms))
    }
}
