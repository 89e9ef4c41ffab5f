//! Operation records: remote work fanned out to a set of hosts

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::FleetError;
use crate::models::host::{CredentialKind, ExecProtocol, FileProtocol};
use crate::models::log::EventLog;

/// Lifecycle status shared by operations and rollouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Queued,
    Running,
    Error,
    Completed,
}

impl OperationStatus {
    fn rank(self) -> u8 {
        match self {
            OperationStatus::Queued => 0,
            OperationStatus::Running => 1,
            OperationStatus::Error | OperationStatus::Completed => 2,
        }
    }

    /// `error` and `completed` are final
    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    /// Status only ever moves forward: queued, running, then one terminal state
    pub fn can_advance_to(self, next: OperationStatus) -> bool {
        next.rank() > self.rank()
    }

    /// Move `self` to `next`, rejecting backwards or terminal-to-terminal moves
    pub fn advance(&mut self, next: OperationStatus) -> Result<(), FleetError> {
        if !self.can_advance_to(next) {
            return Err(FleetError::InvalidTransition(format!(
                "{:?} -> {:?}",
                self, next
            )));
        }
        *self = next;
        Ok(())
    }
}

/// Where a file transfer reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileSource {
    Local { path: PathBuf },
    Artifact { id: Uuid },
}

/// What an operation does on each host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationKind {
    ExecuteCommand {
        commands: Vec<String>,
        protocol: ExecProtocol,
        #[serde(default)]
        elevate: bool,
    },
    SendFile {
        protocol: FileProtocol,
        source: FileSource,
        destination: String,
    },
}

impl OperationKind {
    pub fn credential_kind(&self) -> CredentialKind {
        match self {
            OperationKind::ExecuteCommand { protocol, .. } => protocol.credential_kind(),
            OperationKind::SendFile { protocol, .. } => protocol.credential_kind(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::ExecuteCommand { .. } => "execute-command",
            OperationKind::SendFile { .. } => "send-file",
        }
    }
}

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(code),
        }
    }

    /// Unknown exit codes count as success; the transport raised no error
    pub fn succeeded(&self) -> bool {
        self.exit_code.unwrap_or(0) == 0
    }
}

/// Output of one command on one host, keyed by `(seq, host)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRecord {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub host: Uuid,
    pub command_index: usize,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// A unit of remote work targeted at a set of hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub hosts: Vec<Uuid>,
    pub status: OperationStatus,
    pub log: EventLog,
    pub output: Vec<OutputRecord>,

    /// Rollout that issued this operation; cleared when the rollout is deleted
    #[serde(default)]
    pub parent: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(kind: OperationKind, hosts: Vec<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind,
            hosts,
            status: OperationStatus::Queued,
            log: EventLog::new(),
            output: Vec::new(),
            parent: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: Uuid) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn advance(&mut self, next: OperationStatus) -> Result<(), FleetError> {
        self.status.advance(next)
    }

    /// Append the result of one command for one host
    pub fn record_output(&mut self, host: Uuid, command_index: usize, output: &CommandOutput) {
        let seq = self.output.len() as u64;
        let now = Utc::now();
        let at = match self.output.last() {
            Some(last) if last.at > now => last.at,
            _ => now,
        };
        self.output.push(OutputRecord {
            seq,
            at,
            host,
            command_index,
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
            exit_code: output.exit_code,
        });
    }

    /// All stdout captured on `host`, in command order
    pub fn stdout_for(&self, host: Uuid) -> String {
        self.output
            .iter()
            .filter(|r| r.host == host)
            .map(|r| r.stdout.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// All stderr captured on `host`, in command order
    pub fn stderr_for(&self, host: Uuid) -> String {
        self.output
            .iter()
            .filter(|r| r.host == host && !r.stderr.is_empty())
            .map(|r| r.stderr.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}
