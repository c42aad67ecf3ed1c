use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use lockd_types::{DeviceSnapshot, EpochMs, HeartbeatRequest, LockState};

use crate::error::KernelError;
use crate::signing::DeviceSigner;

/// Build the signed heartbeat request for `snapshot`.
pub fn compose(
    device_id: &str,
    snapshot: &DeviceSnapshot,
    lock_state: LockState,
    now_ms: EpochMs,
    signer: &dyn DeviceSigner,
) -> Result<HeartbeatRequest, KernelError> {
    let nonce = uuid::Uuid::new_v4().to_string();
    let mut request =
        HeartbeatRequest::from_snapshot(device_id, snapshot, lock_state, now_ms, nonce);
    let payload = request
        .signing_payload()
        .map_err(|e| KernelError::Execution(format!("heartbeat encoding failed: {e}")))?;
    request.signature = BASE64.encode(signer.sign(payload.as_bytes()));
    Ok(request)
}
