//! Device-side host for the lock enforcement kernel: configuration, backend
//! HTTP client, file-backed platform adapters, the daemon loop and its
//! control socket.

pub mod adapters;
pub mod config;
pub mod control;
pub mod error;
pub mod fixtures;
pub mod host;
pub mod modes;

pub use config::{HostConfig, HttpConfig, Intervals};
pub use control::{ControlClient, ControlServer, RequestEnvelope, ResponseEnvelope};
pub use error::HostError;
pub use host::{DeviceHost, Storage, open_storage, platform_collaborators};
pub use modes::daemon::{ControlMsg, LockDaemon, Schedule};
