//! Offline command model: the raw wire shape, the persisted command, and the
//! typed action produced by boundary validation.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::digest::Digest;
use crate::lock::{LockReason, LockType};
use crate::{EpochMs, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    Lock,
    Unlock,
    Warn,
    PermanentLock,
    Wipe,
    UpdateApp,
    Reboot,
}

impl CommandKind {
    pub const ALL: [CommandKind; 7] = [
        CommandKind::Lock,
        CommandKind::Unlock,
        CommandKind::Warn,
        CommandKind::PermanentLock,
        CommandKind::Wipe,
        CommandKind::UpdateApp,
        CommandKind::Reboot,
    ];

    /// Canonical wire name. This is the `type` segment of the signed payload.
    pub fn wire_name(&self) -> &'static str {
        match self {
            CommandKind::Lock => "LOCK_DEVICE",
            CommandKind::Unlock => "UNLOCK_DEVICE",
            CommandKind::Warn => "WARN",
            CommandKind::PermanentLock => "PERMANENT_LOCK",
            CommandKind::Wipe => "WIPE_DATA",
            CommandKind::UpdateApp => "UPDATE_APP",
            CommandKind::Reboot => "REBOOT_DEVICE",
        }
    }

    /// Accepts wire names and the short aliases, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        let kind = match s.trim().to_ascii_uppercase().as_str() {
            "LOCK_DEVICE" | "LOCK" => CommandKind::Lock,
            "UNLOCK_DEVICE" | "UNLOCK" => CommandKind::Unlock,
            "WARN" | "WARNING" => CommandKind::Warn,
            "PERMANENT_LOCK" => CommandKind::PermanentLock,
            "WIPE_DATA" | "WIPE" => CommandKind::Wipe,
            "UPDATE_APP" => CommandKind::UpdateApp,
            "REBOOT_DEVICE" | "REBOOT" => CommandKind::Reboot,
            _ => return None,
        };
        Some(kind)
    }

    /// Commands whose outcome is always reported at CRITICAL severity.
    pub fn is_critical(&self) -> bool {
        matches!(self, CommandKind::Wipe | CommandKind::PermanentLock)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Executing,
    Executed,
    Failed,
    Expired,
    Cancelled,
}

impl CommandStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Executed
                | CommandStatus::Failed
                | CommandStatus::Expired
                | CommandStatus::Cancelled
        )
    }
}

/// Command as delivered by the backend (heartbeat response or push).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCommand {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type", alias = "command_type")]
    pub kind: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Base64 signature over the signed payload.
    #[serde(default)]
    pub signature: String,
    /// Epoch ms; 0 means the command never expires.
    #[serde(default)]
    pub expires_at: EpochMs,
    #[serde(default, alias = "timestamp")]
    pub issued_at: EpochMs,
    #[serde(default)]
    pub sequence_number: u64,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub priority: i32,
}

/// Persisted command. Immutable except for `status`, `result` and `finished_at_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineCommand {
    pub id: String,
    pub kind: CommandKind,
    pub device_id: String,
    pub parameters: BTreeMap<String, String>,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub issued_at_ms: EpochMs,
    pub expires_at_ms: EpochMs,
    pub sequence: u64,
    pub nonce: String,
    pub priority: i32,
    pub received_at_ms: EpochMs,
    pub status: CommandStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<EpochMs>,
}

impl OfflineCommand {
    /// Validate the wire shape and build a `PENDING` command. Parameters are
    /// type-checked here too, so a command that reaches the queue always has a
    /// decodable action.
    pub fn from_wire(wire: WireCommand, received_at_ms: EpochMs) -> Result<Self, ValidationError> {
        let id = wire.id.trim().to_string();
        if id.is_empty() {
            return Err(ValidationError::MissingField("id"));
        }
        if wire.kind.trim().is_empty() {
            return Err(ValidationError::MissingField("type"));
        }
        let kind = CommandKind::parse(&wire.kind)
            .ok_or_else(|| ValidationError::UnknownCommandType(wire.kind.clone()))?;
        if wire.device_id.trim().is_empty() {
            return Err(ValidationError::MissingField("device_id"));
        }
        if wire.signature.trim().is_empty() {
            return Err(ValidationError::MissingField("signature"));
        }
        let signature = BASE64
            .decode(wire.signature.trim())
            .map_err(|e| ValidationError::SignatureEncoding(e.to_string()))?;

        let command = OfflineCommand {
            id,
            kind,
            device_id: wire.device_id.trim().to_string(),
            parameters: wire.parameters,
            signature,
            issued_at_ms: wire.issued_at,
            expires_at_ms: wire.expires_at,
            sequence: wire.sequence_number,
            nonce: wire.nonce,
            priority: wire.priority,
            received_at_ms,
            status: CommandStatus::Pending,
            result: None,
            finished_at_ms: None,
        };
        command.action()?;
        Ok(command)
    }

    pub fn is_expired(&self, now_ms: EpochMs) -> bool {
        self.expires_at_ms != 0 && now_ms >= self.expires_at_ms
    }

    /// `commandId|type|timestamp|sequenceNumber|nonce`
    pub fn signed_payload(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.id,
            self.kind.wire_name(),
            self.issued_at_ms,
            self.sequence,
            self.nonce
        )
    }

    fn param(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Decode the flat parameter map into a typed action.
    pub fn action(&self) -> Result<CommandAction, ValidationError> {
        let action = match self.kind {
            CommandKind::Lock => {
                let lock_type = match self.param("lock_type") {
                    Some(raw) => LockType::parse(raw).ok_or_else(|| {
                        ValidationError::param("lock_type", format!("unknown lock type '{raw}'"))
                    })?,
                    None => LockType::Hard,
                };
                let reason = match self.param("reason") {
                    Some(raw) => LockReason::parse(raw).ok_or_else(|| {
                        ValidationError::param("reason", format!("unknown reason '{raw}'"))
                    })?,
                    None => LockReason::AdminAction,
                };
                let pin_digest = self
                    .param("pin")
                    .map(|pin| Digest::of_bytes(pin.as_bytes()).to_hex());
                if pin_digest.is_some() && lock_type == LockType::Hard {
                    return Err(ValidationError::param("pin", "hard locks cannot be PIN-unlocked"));
                }
                CommandAction::Lock(LockParams {
                    lock_id: self
                        .param("lock_id")
                        .map(str::to_string)
                        .unwrap_or_else(|| format!("admin.{}", self.id)),
                    lock_type,
                    reason,
                    message: self.param("message").unwrap_or(reason.describe()).to_string(),
                    pin_digest,
                })
            }
            CommandKind::Unlock => CommandAction::Unlock {
                lock_id: self.param("lock_id").map(str::to_string),
            },
            CommandKind::Warn => CommandAction::Warn {
                message: self
                    .param("message")
                    .ok_or(ValidationError::MissingField("parameters.message"))?
                    .to_string(),
                expires_in_ms: self
                    .param("expires_in_ms")
                    .map(parse_u64("expires_in_ms"))
                    .transpose()?,
            },
            CommandKind::PermanentLock => CommandAction::PermanentLock {
                message: self
                    .param("message")
                    .unwrap_or("Device permanently locked by your provider")
                    .to_string(),
            },
            CommandKind::Wipe => CommandAction::Wipe {
                scope: match self.param("scope") {
                    None | Some("sensitive") => WipeScope::SensitiveData,
                    Some("factory") => WipeScope::FactoryReset,
                    Some(other) => {
                        return Err(ValidationError::param(
                            "scope",
                            format!("unknown wipe scope '{other}'"),
                        ));
                    }
                },
            },
            CommandKind::UpdateApp => {
                let url = self
                    .param("url")
                    .ok_or(ValidationError::MissingField("parameters.url"))?;
                if !(url.starts_with("https://") || url.starts_with("http://")) {
                    return Err(ValidationError::param("url", "must be an http(s) url"));
                }
                let sha256 = match self.param("sha256") {
                    Some(raw) => {
                        let prefixed = if raw.starts_with(crate::digest::DIGEST_PREFIX) {
                            raw.to_string()
                        } else {
                            format!("{}{}", crate::digest::DIGEST_PREFIX, raw.to_ascii_lowercase())
                        };
                        Some(
                            Digest::from_hex_str(&prefixed)
                                .map_err(|e| ValidationError::param("sha256", e.to_string()))?,
                        )
                    }
                    None => None,
                };
                CommandAction::UpdateApp(UpdateParams {
                    url: url.to_string(),
                    sha256,
                    package: self.param("package").map(str::to_string),
                })
            }
            CommandKind::Reboot => CommandAction::Reboot,
        };
        Ok(action)
    }
}

fn parse_u64(name: &'static str) -> impl Fn(&str) -> Result<u64, ValidationError> {
    move |raw| {
        raw.parse::<u64>()
            .map_err(|e| ValidationError::param(name, e.to_string()))
    }
}

/// Typed command action, one variant per command kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandAction {
    Lock(LockParams),
    /// `None` removes every active lock.
    Unlock { lock_id: Option<String> },
    Warn { message: String, expires_in_ms: Option<u64> },
    PermanentLock { message: String },
    Wipe { scope: WipeScope },
    UpdateApp(UpdateParams),
    Reboot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockParams {
    pub lock_id: String,
    pub lock_type: LockType,
    pub reason: LockReason,
    pub message: String,
    pub pin_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateParams {
    pub url: String,
    pub sha256: Option<Digest>,
    pub package: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WipeScope {
    /// The designated sensitive-data set (app data, accounts, media).
    SensitiveData,
    FactoryReset,
}
