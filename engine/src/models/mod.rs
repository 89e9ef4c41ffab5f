//! Domain records

pub mod artifact;
pub mod host;
pub mod instance;
pub mod log;
pub mod operation;
pub mod rollout;

pub use artifact::Artifact;
pub use host::{Credential, CredentialKind, ExecProtocol, FileProtocol, Host, OsKind};
pub use instance::{ComposeVariant, Instance};
pub use log::{EventLog, LogEntry};
pub use operation::{
    CommandOutput, FileSource, Operation, OperationKind, OperationStatus, OutputRecord,
};
pub use rollout::{HostRollout, Stage, StagedRollout};
