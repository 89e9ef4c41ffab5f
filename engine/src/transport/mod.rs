//! Remote execution and file transfer
//!
//! A [`Transport`] opens a [`Session`] to one host with resolved credentials.
//! Sessions run commands one at a time so callers can persist each result
//! before issuing the next command.

pub mod smb;
pub mod ssh;
pub mod winrm;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::FleetError;
use crate::models::{
    CommandOutput, Credential, ExecProtocol, FileProtocol, Host, OperationKind,
};

pub use ssh::shell_quote;

/// Opens sessions for one protocol
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session; fails with `AuthError` or `ConnectError`
    async fn connect(
        &self,
        host: &Host,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, FleetError>;
}

/// An open connection to one host
#[async_trait]
pub trait Session: Send {
    /// Run one command. `elevate` is honoured by ssh sessions only.
    async fn run_command(
        &mut self,
        command: &str,
        elevate: bool,
    ) -> Result<CommandOutput, FleetError>;

    /// Push a local file to `remote`
    async fn send_file(&mut self, local: &Path, remote: &str) -> Result<(), FleetError>;

    /// Release remote resources held by the session
    async fn close(&mut self) -> Result<(), FleetError> {
        Ok(())
    }
}

/// Timeouts shared by all transports
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            command_timeout: Duration::from_secs(900),
            transfer_timeout: Duration::from_secs(1800),
        }
    }
}

/// One transport per protocol family
#[derive(Clone)]
pub struct TransportSet {
    ssh: Arc<dyn Transport>,
    winrm: Arc<dyn Transport>,
    smb: Arc<dyn Transport>,
}

impl TransportSet {
    /// Real transports: ssh/scp binaries, WS-Management over HTTP, smbclient
    pub fn new(options: &TransportOptions) -> Result<Self, FleetError> {
        Ok(Self {
            ssh: Arc::new(ssh::SshTransport::new(options.clone())),
            winrm: Arc::new(winrm::WinRmTransport::new(options.clone())?),
            smb: Arc::new(smb::SmbTransport::new(options.clone())),
        })
    }

    /// Route every protocol to the same transport
    pub fn uniform(transport: Arc<dyn Transport>) -> Self {
        Self {
            ssh: transport.clone(),
            winrm: transport.clone(),
            smb: transport,
        }
    }

    /// Transport able to carry out `kind`
    pub fn for_kind(&self, kind: &OperationKind) -> Arc<dyn Transport> {
        match kind {
            OperationKind::ExecuteCommand { protocol, .. } => match protocol {
                ExecProtocol::Ssh => self.ssh.clone(),
                ExecProtocol::WinRm => self.winrm.clone(),
            },
            OperationKind::SendFile { protocol, .. } => match protocol {
                FileProtocol::Sftp => self.ssh.clone(),
                FileProtocol::Smb => self.smb.clone(),
            },
        }
    }
}
