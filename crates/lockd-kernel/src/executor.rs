//! Command executor: verify, then dispatch one queued command at a time.

use lockd_store::CommandQueue;
use lockd_types::{
    CommandAction, CommandKind, CommandStatus, Digest, DeviceLock, EpochMs, Incident, IncidentKind,
    LockOrigin, LockParams, LockReason, LockType, OfflineCommand, Severity, UpdateParams,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::audit::AuditLog;
use crate::authority::LockAuthority;
use crate::clock::Clock;
use crate::device::{DevicePolicy, LockPresenter, PackageFetcher, PackageInstaller};
use crate::error::KernelError;
use crate::signing::CommandVerifier;

pub const PERMANENT_LOCK_ID: &str = "admin.permanent";
const ZIP_MAGIC: &[u8; 4] = b"PK\x03\x04";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Processed {
    pub command_id: String,
    pub kind: CommandKind,
    pub status: CommandStatus,
    pub detail: String,
}

pub struct CommandExecutor {
    queue: Arc<CommandQueue>,
    authority: Arc<LockAuthority>,
    verifier: Arc<dyn CommandVerifier>,
    device: Arc<dyn DevicePolicy>,
    presenter: Arc<dyn LockPresenter>,
    fetcher: Arc<dyn PackageFetcher>,
    installer: Arc<dyn PackageInstaller>,
    audit: AuditLog,
    clock: Arc<dyn Clock>,
    device_id: String,
    staging_dir: PathBuf,
    dispatch: Mutex<()>,
}

impl std::fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("device_id", &self.device_id)
            .field("queue", &self.queue)
            .field("staging_dir", &self.staging_dir)
            .finish()
    }
}

/// Collaborators the executor dispatches into.
pub struct ExecutorParts {
    pub queue: Arc<CommandQueue>,
    pub authority: Arc<LockAuthority>,
    pub verifier: Arc<dyn CommandVerifier>,
    pub device: Arc<dyn DevicePolicy>,
    pub presenter: Arc<dyn LockPresenter>,
    pub fetcher: Arc<dyn PackageFetcher>,
    pub installer: Arc<dyn PackageInstaller>,
    pub audit: AuditLog,
    pub clock: Arc<dyn Clock>,
}

impl CommandExecutor {
    pub fn new(
        parts: ExecutorParts,
        device_id: impl Into<String>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            queue: parts.queue,
            authority: parts.authority,
            verifier: parts.verifier,
            device: parts.device,
            presenter: parts.presenter,
            fetcher: parts.fetcher,
            installer: parts.installer,
            audit: parts.audit,
            clock: parts.clock,
            device_id: device_id.into(),
            staging_dir: staging_dir.into(),
            dispatch: Mutex::new(()),
        }
    }

    pub fn has_pending(&self) -> bool {
        self.queue.has_pending()
    }

    /// Dispatch at most one command. `None` when nothing is pending.
    pub async fn process_next(&self) -> Result<Option<Processed>, KernelError> {
        let _guard = self.dispatch.lock().await;
        self.process_one().await
    }

    /// Run until the queue has nothing dispatchable left.
    pub async fn drain_all(&self) -> Result<Vec<Processed>, KernelError> {
        let _guard = self.dispatch.lock().await;
        let mut out = Vec::new();
        while let Some(processed) = self.process_one().await? {
            out.push(processed);
        }
        Ok(out)
    }

    async fn process_one(&self) -> Result<Option<Processed>, KernelError> {
        let now = self.clock.now_ms();
        let dequeued = self.queue.dequeue_next(now)?;
        for expired in &dequeued.expired {
            self.audit.incident(
                Incident::new(
                    IncidentKind::CommandRejected,
                    Severity::Medium,
                    format!("{} expired before execution", expired.kind),
                    now,
                )
                .with_subject(expired.id.as_str()),
            );
        }
        let Some(cmd) = dequeued.next else {
            return Ok(None);
        };

        let result = self.execute(&cmd, now).await;
        if cmd.kind.is_critical() {
            let outcome = match &result {
                Ok(processed) => format!("{}: {}", processed.status_label(), processed.detail),
                Err(err) => format!("outcome not recorded: {err}"),
            };
            self.audit.incident(
                Incident::new(
                    IncidentKind::CriticalCommand,
                    Severity::Critical,
                    format!("{} {outcome}", cmd.kind),
                    now,
                )
                .with_subject(cmd.id.as_str()),
            );
        }
        result.map(Some)
    }

    /// Verify, dispatch and record one dequeued command.
    async fn execute(&self, cmd: &OfflineCommand, now: EpochMs) -> Result<Processed, KernelError> {
        if let Err(err) = self.verifier.verify(cmd.signed_payload().as_bytes(), &cmd.signature) {
            log::error!("command {} ({}) rejected: {err}", cmd.id, cmd.kind);
            self.audit.incident(
                Incident::new(
                    IncidentKind::SignatureInvalid,
                    Severity::Critical,
                    format!("{} command failed signature verification: {err}", cmd.kind),
                    now,
                )
                .with_subject(cmd.id.as_str()),
            );
            return self.fail(cmd, "signature invalid".into(), now);
        }

        if cmd.device_id != self.device_id {
            self.audit.incident(
                Incident::new(
                    IncidentKind::CommandRejected,
                    Severity::High,
                    format!("command targets device '{}'", cmd.device_id),
                    now,
                )
                .with_subject(cmd.id.as_str()),
            );
            return self.fail(cmd, "target device mismatch".into(), now);
        }

        let action = match cmd.action() {
            Ok(action) => action,
            Err(err) => {
                let err = KernelError::from(err);
                self.audit.incident(err.to_incident(now).with_subject(cmd.id.as_str()));
                return self.fail(cmd, err.to_string(), now);
            }
        };

        log::info!("dispatching command {} ({})", cmd.id, cmd.kind);
        let reboot = matches!(action, CommandAction::Reboot);
        match self.dispatch(cmd, action, now).await {
            Ok(detail) => {
                let processed = self.finish_ok(cmd, detail, now)?;
                // Recorded before the device goes down, or a restart would re-run it.
                if reboot {
                    if let Err(err) = self.device.reboot() {
                        let err = KernelError::from(err);
                        self.audit.incident(err.to_incident(now).with_subject(cmd.id.as_str()));
                    }
                }
                Ok(processed)
            }
            Err(err) => {
                log::warn!("command {} ({}) failed: {err}", cmd.id, cmd.kind);
                self.audit.incident(err.to_incident(now).with_subject(cmd.id.as_str()));
                self.fail(cmd, err.to_string(), now)
            }
        }
    }

    fn finish_ok(
        &self,
        cmd: &OfflineCommand,
        detail: String,
        now: EpochMs,
    ) -> Result<Processed, KernelError> {
        self.queue.mark_executed(&cmd.id, detail.as_str(), now)?;
        self.audit.incident(
            Incident::new(
                IncidentKind::CommandExecuted,
                Severity::Info,
                format!("{}: {detail}", cmd.kind),
                now,
            )
            .with_subject(cmd.id.as_str()),
        );
        Ok(Processed {
            command_id: cmd.id.clone(),
            kind: cmd.kind,
            status: CommandStatus::Executed,
            detail,
        })
    }

    fn fail(
        &self,
        cmd: &OfflineCommand,
        reason: String,
        now: EpochMs,
    ) -> Result<Processed, KernelError> {
        self.queue.mark_failed(&cmd.id, reason.as_str(), now)?;
        Ok(Processed {
            command_id: cmd.id.clone(),
            kind: cmd.kind,
            status: CommandStatus::Failed,
            detail: reason,
        })
    }

    async fn dispatch(
        &self,
        cmd: &OfflineCommand,
        action: CommandAction,
        now: EpochMs,
    ) -> Result<String, KernelError> {
        match action {
            CommandAction::Lock(params) => {
                let lock_id = params.lock_id.clone();
                let change = self.authority.apply_lock(admin_lock(params, now))?;
                Ok(if change.applied {
                    format!("lock {lock_id} applied ({})", change.after)
                } else {
                    format!("lock {lock_id} already active")
                })
            }
            CommandAction::Unlock { lock_id: Some(id) } => {
                let change = self.authority.remove_lock(&id)?;
                Ok(if change.applied {
                    format!("lock {id} removed ({})", change.after)
                } else {
                    format!("lock {id} not active")
                })
            }
            CommandAction::Unlock { lock_id: None } => {
                let removed = self.authority.remove_all()?;
                Ok(format!("{} lock(s) removed", removed.len()))
            }
            CommandAction::Warn { message, expires_in_ms } => {
                self.presenter.warn(&message, expires_in_ms.map(|d| now.saturating_add(d)));
                Ok("warning shown".into())
            }
            CommandAction::PermanentLock { message } => {
                let lock = DeviceLock::hard(
                    PERMANENT_LOCK_ID,
                    LockReason::AdminAction,
                    LockOrigin::Admin,
                    message,
                    now,
                );
                self.authority.apply_lock(lock)?;
                self.device.lock_now()?;
                Ok("device permanently locked".into())
            }
            CommandAction::Wipe { scope } => {
                self.device.wipe(scope)?;
                Ok(format!("wipe {scope:?} started"))
            }
            CommandAction::UpdateApp(params) => self.update_app(&cmd.id, &params).await,
            // Issued by the caller once the outcome is recorded.
            CommandAction::Reboot => Ok("reboot requested".into()),
        }
    }

    async fn update_app(
        &self,
        command_id: &str,
        params: &UpdateParams,
    ) -> Result<String, KernelError> {
        tokio::fs::create_dir_all(&self.staging_dir)
            .await
            .map_err(|e| KernelError::Storage(format!("staging dir: {e}")))?;
        let staged = Staged(self.staging_dir.join(format!("{}.apk", file_stem(command_id))));

        let written = self.fetcher.fetch(&params.url, staged.path()).await?;
        let bytes = tokio::fs::read(staged.path())
            .await
            .map_err(|e| KernelError::Execution(format!("staged package unreadable: {e}")))?;
        if bytes.is_empty() {
            return Err(KernelError::Execution("downloaded package is empty".into()));
        }
        if bytes.len() as u64 != written {
            return Err(KernelError::Execution(format!(
                "partial download: {} of {written} bytes",
                bytes.len()
            )));
        }
        if !bytes.starts_with(ZIP_MAGIC) {
            return Err(KernelError::Execution("downloaded file is not a package archive".into()));
        }
        if let Some(expected) = params.sha256 {
            let actual = Digest::of_bytes(&bytes);
            if actual != expected {
                return Err(KernelError::Execution(format!(
                    "package checksum mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        self.installer.install(staged.path(), params.package.as_deref())?;
        Ok(format!("installed {} bytes", bytes.len()))
    }
}

fn admin_lock(params: LockParams, now: EpochMs) -> DeviceLock {
    match params.lock_type {
        LockType::Hard => {
            DeviceLock::hard(params.lock_id, params.reason, LockOrigin::Admin, params.message, now)
        }
        LockType::Soft => {
            let lock = DeviceLock::soft(
                params.lock_id,
                params.reason,
                LockOrigin::Admin,
                params.message,
                now,
            );
            match params.pin_digest {
                Some(digest) => lock.with_pin(digest),
                None => lock,
            }
        }
    }
}

fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Staged download, removed however the update ends.
struct Staged(PathBuf);

impl Staged {
    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for Staged {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.0) {
            if err.kind() != std::io::ErrorKind::NotFound {
                log::warn!("could not remove staged package {}: {err}", self.0.display());
            }
        }
    }
}

impl Processed {
    fn status_label(&self) -> &'static str {
        match self.status {
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
            _ => "finished",
        }
    }
}
