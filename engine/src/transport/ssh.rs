//! SSH execution and SFTP-style transfer through the system `ssh`/`scp` binaries

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::errors::FleetError;
use crate::models::{CommandOutput, Credential, Host};
use crate::transport::{Session, Transport, TransportOptions};

/// Exit status `ssh` uses for its own failures
const SSH_ERROR_EXIT: i32 = 255;

/// Exit status `sshpass` uses for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// Messages `ssh` itself prints when the connection, not the remote
/// command, failed
const SSH_FAILURE_MARKERS: &[&str] = &[
    "ssh: connect to host",
    "ssh: Could not resolve hostname",
    "Connection refused",
    "Connection timed out",
    "Connection closed by",
    "Connection reset by",
    "Permission denied (",
    "Host key verification failed",
    "kex_exchange_identification",
];

/// Which invocation an exit status belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// The `true` check run while connecting
    Connect,
    /// A caller's command or transfer on an open session
    Command,
}

/// Quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

pub struct SshTransport {
    options: TransportOptions,
}

impl SshTransport {
    pub fn new(options: TransportOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(
        &self,
        host: &Host,
        credential: &Credential,
    ) -> Result<Box<dyn Session>, FleetError> {
        let mut session = SshSession {
            address: host.address.clone(),
            username: credential.username.clone(),
            port: credential.port_or_default(),
            password: SecretString::from(credential.password.expose_secret().to_owned()),
            key: credential.ssh_key.clone(),
            passphrase: credential
                .passphrase
                .as_ref()
                .map(|p| SecretString::from(p.expose_secret().to_owned())),
            options: self.options.clone(),
        };

        // probe once so auth and reachability failures surface at connect time
        let probe = session
            .exec("true", None, self.options.connect_timeout, Phase::Connect)
            .await?;
        if !probe.succeeded() {
            return Err(FleetError::ConnectError(format!(
                "{}: probe exited with {:?}: {}",
                host.address,
                probe.exit_code,
                probe.stderr.trim()
            )));
        }
        debug!("Opened ssh session to {}@{}", session.username, host.address);
        Ok(Box::new(session))
    }
}

struct SshSession {
    address: String,
    username: String,
    port: u16,
    password: SecretString,
    key: Option<PathBuf>,
    passphrase: Option<SecretString>,
    options: TransportOptions,
}

impl SshSession {
    /// Build an `ssh` or `scp` invocation carrying auth and connection flags
    fn command(&self, program: &str, port_flag: &str) -> Command {
        let mut cmd = match (&self.key, &self.passphrase) {
            (Some(_), None) => Command::new(program),
            (Some(_), Some(passphrase)) => {
                let mut cmd = Command::new("sshpass");
                cmd.args(["-P", "passphrase", "-e", program]);
                cmd.env("SSHPASS", passphrase.expose_secret());
                cmd
            }
            (None, _) => {
                let mut cmd = Command::new("sshpass");
                cmd.args(["-e", program]);
                cmd.env("SSHPASS", self.password.expose_secret());
                cmd
            }
        };

        match &self.key {
            Some(key) => {
                cmd.arg("-i").arg(key);
                if self.passphrase.is_none() {
                    cmd.args(["-o", "BatchMode=yes"]);
                }
            }
            None => {
                cmd.args([
                    "-o",
                    "PreferredAuthentications=password,keyboard-interactive",
                    "-o",
                    "PubkeyAuthentication=no",
                ]);
            }
        }

        cmd.args(["-o", "StrictHostKeyChecking=accept-new"])
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.options.connect_timeout.as_secs().max(1)
            ))
            .arg(port_flag)
            .arg(self.port.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Whether invocations are wrapped in `sshpass`
    fn via_sshpass(&self) -> bool {
        self.key.is_none() || self.passphrase.is_some()
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.address)
    }

    /// Run `remote` and classify ssh-level failures
    async fn exec(
        &self,
        remote: &str,
        stdin: Option<String>,
        timeout: std::time::Duration,
        phase: Phase,
    ) -> Result<CommandOutput, FleetError> {
        let mut cmd = self.command("ssh", "-p");
        cmd.arg(self.destination()).arg(remote);
        cmd.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = cmd.spawn().map_err(|e| {
            FleetError::TransportError(format!("failed to spawn ssh: {e}"))
        })?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                FleetError::Timeout(format!("command on {} exceeded {:?}", self.address, timeout))
            })??;

        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };
        classify(&self.address, result, self.via_sshpass(), phase)
    }
}

/// Separate connection failures from the remote command's own exit status.
///
/// Once a session is open, a remote command may exit with any status, so
/// 255 only means a transport failure when ssh's own messages say so, and
/// sshpass's bad-password status is only trusted while connecting.
fn classify(
    address: &str,
    output: CommandOutput,
    via_sshpass: bool,
    phase: Phase,
) -> Result<CommandOutput, FleetError> {
    let stderr = output.stderr.trim();
    match (output.exit_code, phase) {
        (Some(SSHPASS_BAD_PASSWORD), Phase::Connect) if via_sshpass && output.stdout.is_empty() => {
            Err(FleetError::AuthError(format!("{address}: password rejected")))
        }
        (Some(SSH_ERROR_EXIT), Phase::Connect) => Err(ssh_failure(address, stderr)),
        (Some(SSH_ERROR_EXIT), Phase::Command)
            if SSH_FAILURE_MARKERS.iter().any(|m| stderr.contains(m)) =>
        {
            Err(ssh_failure(address, stderr))
        }
        _ => Ok(output),
    }
}

fn ssh_failure(address: &str, stderr: &str) -> FleetError {
    if stderr.contains("Permission denied") {
        FleetError::AuthError(format!("{address}: {stderr}"))
    } else {
        FleetError::ConnectError(format!("{address}: {stderr}"))
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run_command(
        &mut self,
        command: &str,
        elevate: bool,
    ) -> Result<CommandOutput, FleetError> {
        if !elevate {
            return self
                .exec(command, None, self.options.command_timeout, Phase::Command)
                .await;
        }

        let remote = format!("sudo -S -p '' sh -c {}", shell_quote(command));
        let password = format!("{}\n", self.password.expose_secret());
        self.exec(
            &remote,
            Some(password),
            self.options.command_timeout,
            Phase::Command,
        )
        .await
    }

    async fn send_file(&mut self, local: &Path, remote: &str) -> Result<(), FleetError> {
        let mut cmd = self.command("scp", "-P");
        cmd.stdin(Stdio::null())
            .arg("-q")
            .arg(local)
            .arg(format!("{}:{}", self.destination(), remote));

        let output = tokio::time::timeout(self.options.transfer_timeout, cmd.output())
            .await
            .map_err(|_| {
                FleetError::Timeout(format!(
                    "transfer of {} to {} exceeded {:?}",
                    local.display(),
                    self.address,
                    self.options.transfer_timeout
                ))
            })?
            .map_err(|e| FleetError::TransportError(format!("failed to spawn scp: {e}")))?;

        if output.status.success() {
            return Ok(());
        }
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        };
        classify(&self.address, result, self.via_sshpass(), Phase::Command)?;
        Err(FleetError::TransportError(format!(
            "scp to {}:{} failed: {}",
            self.address,
            remote,
            result_stderr(&output.stderr)
        )))
    }
}

fn result_stderr(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr).trim().to_string()
}
