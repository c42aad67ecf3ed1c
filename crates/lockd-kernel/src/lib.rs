//! Lock enforcement kernel: command verification and dispatch, the lock state
//! authority, lock triggers, the heartbeat protocol, and capability recovery.

pub mod audit;
pub mod authority;
pub mod clock;
pub mod device;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod kernel;
pub mod recovery;
pub mod signing;
pub mod testkit;
pub mod triggers;

pub use audit::{AuditLog, LockTransition, TransitionAction};
pub use authority::{LockAuthority, LockChange, PinOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use device::{
    DeviceError, DevicePolicy, DeviceSensor, LockPresenter, LockView, PackageFetcher,
    PackageInstaller, Restrictions,
};
pub use error::{KernelError, NetworkError, SignatureError};
pub use executor::{CommandExecutor, Processed};
pub use heartbeat::{AlertSink, Backoff, CycleOutcome, HeartbeatDirective, HeartbeatTransport};
pub use kernel::{
    Collaborators, DeviceKernel, HeartbeatReport, KernelConfig, KernelStatus, TriggerReport,
};
pub use recovery::{RecoveryManager, RecoveryOutcome, RecoveryPolicy, Strategy};
pub use signing::{CommandVerifier, DeviceSigner, Ed25519Signer, Ed25519Verifier};
