pub mod http;
pub mod platform;

pub use http::{API_KEY_HEADER, HttpBackend, HttpFetcher};
pub use platform::{
    CAPABILITY_FILE, CommandInstaller, DEVICE_FILE, ENFORCEMENT_FILE, Enforcement, FilePolicy,
    FilePresenter, FileSensor, LOCKSCREEN_FILE, LockScreen,
};
