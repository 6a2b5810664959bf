//! Command/notification boundary to the transfer engine.
//!
//! The updater never performs I/O on the network itself. It hands commands to
//! a [`TransferEngine`] and reacts to the [`Notification`]s the engine later
//! delivers on the updater's own thread.

use std::fmt;
use std::path::PathBuf;

/// Remote endpoint for a [`Command::Connect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub host: String,
    pub port: u16,
}

impl Server {
    pub const HTTPS_PORT: u16 = 443;

    pub fn https(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: Self::HTTPS_PORT,
        }
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Certificate trust for a single connection.
///
/// Only the version check may trust the embedded root. Artefact downloads
/// are already pinned by the checksum obtained during the check, so their
/// connection gets the system roots only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustPolicy {
    /// System roots plus the embedded update-server anchor.
    EmbeddedAnchor,
    /// System roots only.
    SystemRoots,
}

/// A single file transfer on the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferFile {
    /// Local target. `None` streams the body back as [`Notification::Data`].
    pub local_path: Option<PathBuf>,
    /// Remote directory, always starting with `/`.
    pub remote_path: String,
    /// Remote file name, including any query string.
    pub filename: String,
    pub download: bool,
}

/// Commands understood by a transfer engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect { server: Server, trust: TrustPolicy },
    TransferFile(TransferFile),
    Cancel,
    Disconnect,
}

/// Immediate outcome of [`TransferEngine::execute`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Finished synchronously and succeeded.
    Done,
    /// Accepted; an [`Notification::OperationResult`] will follow.
    Pending,
    /// Refused or failed synchronously.
    Failed,
}

/// Identifies an [`AsyncRequest`] so it can be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// Questions the engine needs answered before it can continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncRequest {
    /// The local target of a download already exists.
    FileExists { local_path: PathBuf, local_size: u64 },
    /// The server presented a certificate the engine cannot validate alone.
    Certificate {
        host: String,
        /// The chain ends in the embedded update-server anchor.
        chains_to_anchor: bool,
    },
}

/// What to do when a download target already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileExistsAction {
    Resume,
    Overwrite,
    Skip,
}

/// Reply to an [`AsyncRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncReply {
    FileExists(FileExistsAction),
    Certificate { trusted: bool },
}

/// Why a command failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    Cancelled,
    Disconnected,
    Protocol(String),
    Local(String),
}

impl fmt::Display for TransferFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFailure::Cancelled => f.write_str("cancelled"),
            TransferFailure::Disconnected => f.write_str("disconnected"),
            TransferFailure::Protocol(msg) => write!(f, "protocol error: {msg}"),
            TransferFailure::Local(msg) => write!(f, "local error: {msg}"),
        }
    }
}

/// Events delivered by the engine, in the order their causes were issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    AsyncRequest { id: RequestId, request: AsyncRequest },
    /// A chunk of a transfer whose local target is memory.
    Data(Vec<u8>),
    /// The pending command finished.
    OperationResult(Result<(), TransferFailure>),
}

/// The network side of the updater.
///
/// Every `TransferFile` answered with [`CommandStatus::Pending`] produces
/// exactly one [`Notification::OperationResult`], after all of its other
/// notifications. `Cancel` and `Disconnect` on a running transfer report it
/// as [`TransferFailure::Cancelled`].
pub trait TransferEngine {
    fn execute(&mut self, command: Command) -> CommandStatus;

    fn answer(&mut self, id: RequestId, reply: AsyncReply);
}
