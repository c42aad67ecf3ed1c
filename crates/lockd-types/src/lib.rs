//! Shared data model for the on-device lock enforcement core: commands, locks,
//! derived lock state, verification status, incidents, and heartbeat wire types.

pub mod command;
pub mod comparison;
pub mod device;
pub mod digest;
mod error;
pub mod heartbeat;
pub mod incident;
pub mod lock;
pub mod verification;

pub use command::{
    CommandAction, CommandKind, CommandStatus, LockParams, OfflineCommand, UpdateParams,
    WipeScope, WireCommand,
};
pub use comparison::{ComparisonResult, Mismatch, MismatchSeverity};
pub use device::{
    DeviceIdentity, DeviceSnapshot, IdentityBaseline, LoanSnapshot, LoanStatus, LocationFix,
    Resources, SecurityPosture,
};
pub use digest::{Digest, DigestParseError, to_canonical_cbor};
pub use error::ValidationError;
pub use heartbeat::{HeartbeatRequest, NextPayment};
pub use incident::{Incident, IncidentKind, Severity};
pub use lock::{DeviceLock, LockOrigin, LockReason, LockState, LockStatus, LockType, TamperKind};
pub use verification::{CapabilityFlags, VerificationResult, VerificationStatus};

/// Milliseconds since the Unix epoch. All timestamps in the model use this unit.
pub type EpochMs = u64;
