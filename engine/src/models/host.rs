//! Hosts, credentials and the protocols used to reach them

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FleetError;

/// Operating system family of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Linux,
    Windows,
}

/// A remote machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: Uuid,
    pub name: String,
    /// IP address or resolvable name
    pub address: String,
    pub os: OsKind,
}

/// Which family of credential a protocol needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialKind {
    Ssh,
    #[serde(rename = "winrm")]
    WinRm,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::Ssh => f.write_str("ssh"),
            CredentialKind::WinRm => f.write_str("winrm"),
        }
    }
}

/// Remote command execution protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecProtocol {
    Ssh,
    #[serde(rename = "winrm")]
    WinRm,
}

impl ExecProtocol {
    pub fn credential_kind(&self) -> CredentialKind {
        match self {
            ExecProtocol::Ssh => CredentialKind::Ssh,
            ExecProtocol::WinRm => CredentialKind::WinRm,
        }
    }
}

impl FromStr for ExecProtocol {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ssh" => Ok(ExecProtocol::Ssh),
            "winrm" => Ok(ExecProtocol::WinRm),
            other => Err(FleetError::ValidationError(format!(
                "unsupported execution protocol: {other}"
            ))),
        }
    }
}

impl fmt::Display for ExecProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecProtocol::Ssh => f.write_str("ssh"),
            ExecProtocol::WinRm => f.write_str("winrm"),
        }
    }
}

/// File transfer protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileProtocol {
    Sftp,
    Smb,
}

impl FileProtocol {
    pub fn credential_kind(&self) -> CredentialKind {
        match self {
            FileProtocol::Sftp => CredentialKind::Ssh,
            FileProtocol::Smb => CredentialKind::WinRm,
        }
    }
}

impl FromStr for FileProtocol {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sftp" => Ok(FileProtocol::Sftp),
            "smb" => Ok(FileProtocol::Smb),
            other => Err(FleetError::ValidationError(format!(
                "unsupported file protocol: {other}"
            ))),
        }
    }
}

impl fmt::Display for FileProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileProtocol::Sftp => f.write_str("sftp"),
            FileProtocol::Smb => f.write_str("smb"),
        }
    }
}

/// Login material for one protocol family, shared by one or more hosts
#[derive(Debug)]
pub struct Credential {
    pub id: Uuid,
    pub kind: CredentialKind,
    pub username: String,
    pub password: SecretString,

    /// Port override, protocol default when absent
    pub port: Option<u16>,

    /// Private key file (ssh only)
    pub ssh_key: Option<PathBuf>,

    /// Passphrase of `ssh_key`
    pub passphrase: Option<SecretString>,

    /// Use HTTPS for the WS-Management endpoint (winrm only)
    pub ssl: bool,

    /// Hosts this credential applies to
    pub hosts: Vec<Uuid>,
}

impl Credential {
    /// Port to connect to, falling back to the protocol default
    pub fn port_or_default(&self) -> u16 {
        match (self.port, self.kind) {
            (Some(port), _) => port,
            (None, CredentialKind::Ssh) => 22,
            (None, CredentialKind::WinRm) if self.ssl => 5986,
            (None, CredentialKind::WinRm) => 5985,
        }
    }
}
