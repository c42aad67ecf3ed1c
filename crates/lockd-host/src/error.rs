use lockd_kernel::KernelError;
use lockd_store::{JournalError, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("platform error: {0}")]
    Platform(String),
    #[error("control channel error: {0}")]
    Control(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
