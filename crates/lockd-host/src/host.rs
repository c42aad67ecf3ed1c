//! Assembles a [`DeviceKernel`] from a [`HostConfig`]: key material, the
//! encrypted fallback store, the sealed journal, and the platform and
//! network adapters.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;
use std::sync::Arc;

use lockd_kernel::{
    Clock, Collaborators, DeviceKernel, Ed25519Signer, Ed25519Verifier, SystemClock,
};
use lockd_store::{
    DeviceKey, DynStore, FallbackStore, FsJournal, FsStore, Journal, Sealer, TornTail,
};
use lockd_types::{Incident, IncidentKind, Severity};

use crate::adapters::{
    CommandInstaller, FilePolicy, FilePresenter, FileSensor, HttpBackend, HttpFetcher,
};
use crate::config::HostConfig;
use crate::error::HostError;

const SEED_LEN: usize = 32;

/// A configured kernel plus the config it was built from.
pub struct DeviceHost {
    config: HostConfig,
    kernel: Arc<DeviceKernel>,
}

impl std::fmt::Debug for DeviceHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHost")
            .field("device_id", &self.config.device_id)
            .field("data_dir", &self.config.data_dir)
            .field("kernel", &self.kernel)
            .finish()
    }
}

impl DeviceHost {
    /// Open with the file-backed platform adapters and the HTTP backend.
    /// Nothing is enforced until the daemon calls `start`.
    pub fn open(config: HostConfig) -> Result<Self, HostError> {
        config.validate()?;
        let collaborators = platform_collaborators(&config)?;
        Self::open_with(config, collaborators, Arc::new(SystemClock))
    }

    /// Open over caller-supplied collaborators; tests swap in mocks here.
    pub fn open_with(
        config: HostConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, HostError> {
        let storage = open_storage(&config)?;
        let kernel = DeviceKernel::open(
            storage.store,
            storage.journal,
            collaborators,
            config.kernel_config(),
            clock.clone(),
        )?;
        if let Some(tail) = storage.repaired {
            tracing::warn!(
                dropped_bytes = tail.dropped_bytes,
                reason = %tail.reason,
                "audit journal tail repaired"
            );
            kernel.record_incident(
                Incident::new(
                    IncidentKind::StorageFailure,
                    Severity::High,
                    format!(
                        "audit journal ended in an incomplete record ({}); {} bytes dropped",
                        tail.reason, tail.dropped_bytes
                    ),
                    clock.now_ms(),
                )
                .with_subject("journal"),
            );
        }
        tracing::debug!(
            device_id = %config.device_id,
            data_dir = %config.data_dir.display(),
            "device host opened"
        );
        Ok(Self {
            config,
            kernel: Arc::new(kernel),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Arc<DeviceKernel> {
        &self.kernel
    }
}

/// Opened storage, plus any torn journal tail cut off while opening.
pub struct Storage {
    pub store: DynStore,
    pub journal: Arc<dyn Journal>,
    pub repaired: Option<TornTail>,
}

/// Primary store under `store/` mirrored to `store.fallback/`, and the
/// journal, all sealed with the device-bound key.
pub fn open_storage(config: &HostConfig) -> Result<Storage, HostError> {
    fs::create_dir_all(&config.data_dir)?;
    let key = DeviceKey::load_or_create(&config.storage_secret_path(), &config.device_id)?;
    let primary: DynStore = Arc::new(FsStore::open(config.store_dir(), &key)?);
    let secondary: DynStore = Arc::new(FsStore::open(config.fallback_store_dir(), &key)?);
    let journal = FsJournal::open(config.journal_root(), Sealer::new(&key)?)?;
    let repaired = journal.repaired().cloned();
    Ok(Storage {
        store: Arc::new(FallbackStore::new(primary, secondary)),
        journal: Arc::new(journal),
        repaired,
    })
}

pub fn platform_collaborators(config: &HostConfig) -> Result<Collaborators, HostError> {
    let platform = config.platform_dir();
    fs::create_dir_all(&platform)?;
    fs::create_dir_all(config.staging_dir())?;

    let public_key = config
        .backend_public_key
        .as_deref()
        .ok_or_else(|| HostError::Config("backend public key is not configured".into()))?;
    let verifier = Ed25519Verifier::from_hex(public_key)
        .map_err(|e| HostError::Config(format!("backend public key: {e}")))?;
    let signer = Ed25519Signer::from_seed(&load_or_create_seed(&config.signing_seed_path())?);
    let backend = Arc::new(HttpBackend::new(
        config.backend_base()?,
        config.device_id.as_str(),
        config.api_key.clone(),
        config.http.clone(),
    )?);
    let device = FilePolicy::open(&platform).map_err(|e| HostError::Platform(e.to_string()))?;

    Ok(Collaborators {
        device: Arc::new(device),
        presenter: Arc::new(FilePresenter::new(&platform)),
        sensor: Arc::new(FileSensor::new(&platform)),
        verifier: Arc::new(verifier),
        signer: Arc::new(signer),
        transport: backend.clone(),
        fetcher: Arc::new(HttpFetcher::new(&config.http)?),
        installer: Arc::new(CommandInstaller::new(config.install_command.clone())),
        alert_sink: backend,
    })
}

/// Device signing seed, created with owner-only permissions on first use.
pub fn load_or_create_seed(path: &Path) -> Result<[u8; SEED_LEN], HostError> {
    match fs::read(path) {
        Ok(bytes) => bytes.as_slice().try_into().map_err(|_| {
            HostError::Config(format!(
                "{} holds {} bytes, expected {SEED_LEN}",
                path.display(),
                bytes.len()
            ))
        }),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            let mut seed = [0u8; SEED_LEN];
            getrandom::getrandom(&mut seed)
                .map_err(|e| HostError::Platform(format!("entropy unavailable: {e}")))?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut opts = OpenOptions::new();
            opts.write(true).create_new(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut file = opts.open(path)?;
            file.write_all(&seed)?;
            file.sync_all()?;
            tracing::info!(path = %path.display(), "created device signing seed");
            Ok(seed)
        }
        Err(err) => Err(err.into()),
    }
}
