//! SMB file transfer through `smbclient`

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::debug;

use crate::errors::FleetError;
use crate::models::{CommandOutput, Credential, Host};
use crate::transport::{Session, Transport, TransportOptions};

/// SMB port; the credential's port belongs to WinRM
const SMB_PORT: u16 = 445;

pub struct SmbTransport {
    options: TransportOptions,
}

impl SmbTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for SmbTransport {
    async fn connect(
        &self,
        host: &Host,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, FleetError> {
        let session = SmbSession {
            address: host.address.clone(),
            username: credential.username.clone(),
            password: SecretString::from(credential.password.expose_secret().to_owned()),
            options: self.options.clone(),
        };
        session
            .smbclient("C$", "pwd", self.options.connect_timeout)
            .await?;
        debug!("Opened smb session to {}", host.address);
        Ok(Box::new(session))
    }
}

struct SmbSession {
    address: String,
    username: String,
    password: SecretString,
    options: TransportOptions,
}

impl SmbSession {
    async fn smbclient(
        &self,
        share: &str,
        script: &str,
        timeout: std::time::Duration,
    ) -> Result<(), FleetError> {
        let output = Command::new("smbclient")
            .arg(format!("//{}/{}", self.address, share))
            .args(["-p", &SMB_PORT.to_string()])
            .args(["-U", &self.username])
            .args(["-c", script])
            // smbclient reads the password from PASSWD when -U has none
            .env("PASSWD", self.password.expose_secret())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(timeout, output)
            .await
            .map_err(|_| FleetError::Timeout(format!("smbclient on {} exceeded {:?}", self.address, timeout)))?
            .map_err(|e| FleetError::TransportError(format!("failed to spawn smbclient: {e}")))?;

        if output.status.success() {
            return Ok(());
        }

        // smbclient reports most failures on stdout
        let message = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout).trim(),
            String::from_utf8_lossy(&output.stderr).trim()
        );
        if message.contains("NT_STATUS_LOGON_FAILURE") || message.contains("NT_STATUS_ACCESS_DENIED") {
            Err(FleetError::AuthError(format!("{}: {message}", self.address)))
        } else if message.contains("NT_STATUS_HOST_UNREACHABLE")
            || message.contains("NT_STATUS_IO_TIMEOUT")
            || message.contains("Connection to")
        {
            Err(FleetError::ConnectError(format!("{}: {message}", self.address)))
        } else {
            Err(FleetError::TransportError(format!("{}: {message}", self.address)))
        }
    }
}

#[async_trait]
impl Session for SmbSession {
    async fn run_command(
        &mut self,
        _command: &str,
        _elevate: bool,
    ) -> Result<CommandOutput, FleetError> {
        Err(FleetError::TransportError(
            "smb sessions transfer files only, use winrm to run commands".to_string(),
        ))
    }

    async fn send_file(&mut self, local: &Path, remote: &str) -> Result<(), FleetError> {
        let (share, path) = split_windows_path(remote)?;
        let script = format!("put \"{}\" \"{}\"", local.display(), path);
        self.smbclient(&share, &script, self.options.transfer_timeout)
            .await
    }
}

/// `C:\dir\file` -> (`C$`, `dir\file`)
pub fn split_windows_path(remote: &str) -> Result<(String, String), FleetError> {
    let mut chars = remote.chars();
    match (chars.next(), chars.next()) {
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic() => {
            let rest = chars.as_str().replace('/', "\\");
            let rest = rest.trim_start_matches('\\');
            if rest.is_empty() {
                return Err(FleetError::ValidationError(format!(
                    "remote path has no file name: {remote}"
                )));
            }
            Ok((format!("{}$", drive.to_ascii_uppercase()), rest.to_string()))
        }
        _ => Err(FleetError::ValidationError(format!(
            "expected an absolute Windows path, got {remote}"
        ))),
    }
}
