//! HTTPS transfer engine on `reqwest` and `tokio`.
//!
//! Transfers run as tokio tasks; their notifications are queued on an
//! unbounded channel that the thread owning the [`Updater`](crate::Updater)
//! drains in order.

use crate::engine::{
    AsyncReply, AsyncRequest, Command, CommandStatus, FileExistsAction, Notification, RequestId,
    TransferEngine, TransferFailure, TransferFile, TrustPolicy,
};
use crate::error::{Result, UpdaterError};
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::RANGE;
use reqwest::{Certificate, Client, StatusCode, Url};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const USER_AGENT: &str = concat!("channel-updater/", env!("CARGO_PKG_VERSION"));

type PendingReplies = Arc<Mutex<HashMap<RequestId, oneshot::Sender<AsyncReply>>>>;

struct Connection {
    base: Url,
    client: Client,
}

/// Event sink of a single transfer.
///
/// Closed once the transfer's result has been sent; nothing from that
/// transfer can be queued after its `OperationResult`.
#[derive(Clone)]
struct Outbox {
    events: mpsc::UnboundedSender<Notification>,
    closed: Arc<Mutex<bool>>,
}

impl Outbox {
    fn new(events: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            events,
            closed: Arc::default(),
        }
    }

    fn send(&self, notification: Notification) -> std::result::Result<(), TransferFailure> {
        let closed = self.closed.lock();
        if *closed {
            return Err(TransferFailure::Cancelled);
        }
        self.events
            .send(notification)
            .map_err(|_| TransferFailure::Disconnected)
    }

    /// Send the final result. Returns `false` if one was already sent.
    fn finish(&self, result: std::result::Result<(), TransferFailure>) -> bool {
        let mut closed = self.closed.lock();
        if *closed {
            return false;
        }
        *closed = true;
        let _ = self.events.send(Notification::OperationResult(result));
        true
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

struct ActiveTransfer {
    task: JoinHandle<()>,
    outbox: Outbox,
}

/// [`TransferEngine`] speaking HTTPS.
pub struct HttpTransferEngine {
    runtime: Handle,
    events: mpsc::UnboundedSender<Notification>,
    system_client: Client,
    anchored_client: Option<Client>,
    connection: Option<Connection>,
    active: Option<ActiveTransfer>,
    replies: PendingReplies,
    next_request: Arc<AtomicU64>,
}

impl HttpTransferEngine {
    /// Create an engine bound to the current tokio runtime, together with
    /// the receiving end of its notification channel.
    pub fn new() -> Result<(Self, mpsc::UnboundedReceiver<Notification>)> {
        let runtime = Handle::try_current()
            .map_err(|err| UpdaterError::validation(format!("no tokio runtime: {err}")))?;
        let (events, receiver) = mpsc::unbounded_channel();
        let system_client = Client::builder().user_agent(USER_AGENT).build()?;

        Ok((
            Self {
                runtime,
                events,
                system_client,
                anchored_client: None,
                connection: None,
                active: None,
                replies: Arc::default(),
                next_request: Arc::new(AtomicU64::new(1)),
            },
            receiver,
        ))
    }

    /// Add the update server's root certificate (PEM). It is only used for
    /// connections made with [`TrustPolicy::EmbeddedAnchor`].
    pub fn with_trust_anchor(mut self, pem: &[u8]) -> Result<Self> {
        let anchor = Certificate::from_pem(pem)?;
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .add_root_certificate(anchor)
            .build()?;
        self.anchored_client = Some(client);
        Ok(self)
    }

    fn transfer_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.outbox.is_closed())
    }

    /// Stop the running transfer, reporting it as cancelled unless it has
    /// already delivered its own result.
    fn abort_transfer(&mut self) -> bool {
        let Some(active) = self.active.take() else {
            return false;
        };
        active.task.abort();
        active.outbox.finish(Err(TransferFailure::Cancelled))
    }

    fn connect(&mut self, host: &str, port: u16, trust: TrustPolicy) -> CommandStatus {
        let base = match Url::parse(&format!("https://{host}:{port}/")) {
            Ok(base) => base,
            Err(err) => {
                tracing::warn!(host, "invalid server address: {err}");
                return CommandStatus::Failed;
            }
        };
        let client = match (trust, &self.anchored_client) {
            (TrustPolicy::EmbeddedAnchor, Some(anchored)) => anchored.clone(),
            _ => self.system_client.clone(),
        };
        tracing::debug!(%base, ?trust, "connected");
        self.connection = Some(Connection { base, client });
        CommandStatus::Done
    }

    fn start_transfer(&mut self, transfer: TransferFile) -> CommandStatus {
        let Some(connection) = &self.connection else {
            tracing::warn!("transfer requested without a connection");
            return CommandStatus::Failed;
        };
        if !transfer.download {
            tracing::warn!("uploads are not supported");
            return CommandStatus::Failed;
        }
        if self.transfer_running() {
            tracing::warn!("transfer already in progress");
            return CommandStatus::Failed;
        }

        let relative = format!(
            "{}{}",
            transfer.remote_path.trim_start_matches('/'),
            transfer.filename
        );
        let url = match connection.base.join(&relative) {
            Ok(url) => url,
            Err(err) => {
                tracing::warn!(%relative, "invalid remote path: {err}");
                return CommandStatus::Failed;
            }
        };

        let outbox = Outbox::new(self.events.clone());
        let job = TransferJob {
            client: connection.client.clone(),
            url,
            local_path: transfer.local_path,
            outbox: outbox.clone(),
            replies: Arc::clone(&self.replies),
            next_request: Arc::clone(&self.next_request),
        };
        let task = self.runtime.spawn(async move {
            let result = job.run().await;
            job.outbox.finish(result);
        });
        self.active = Some(ActiveTransfer { task, outbox });
        CommandStatus::Pending
    }
}

impl TransferEngine for HttpTransferEngine {
    fn execute(&mut self, command: Command) -> CommandStatus {
        match command {
            Command::Connect { server, trust } => self.connect(&server.host, server.port, trust),
            Command::TransferFile(transfer) => self.start_transfer(transfer),
            Command::Cancel => {
                if self.abort_transfer() {
                    tracing::debug!("transfer cancelled");
                }
                CommandStatus::Done
            }
            Command::Disconnect => {
                self.abort_transfer();
                self.replies.lock().clear();
                self.connection = None;
                CommandStatus::Done
            }
        }
    }

    fn answer(&mut self, id: RequestId, reply: AsyncReply) {
        match self.replies.lock().remove(&id) {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => tracing::debug!(?id, "answer for unknown request"),
        }
    }
}

struct TransferJob {
    client: Client,
    url: Url,
    local_path: Option<PathBuf>,
    outbox: Outbox,
    replies: PendingReplies,
    next_request: Arc<AtomicU64>,
}

impl TransferJob {
    async fn run(&self) -> std::result::Result<(), TransferFailure> {
        match self.local_path.clone() {
            Some(path) => self.download_to_file(path).await,
            None => self.download_to_memory().await,
        }
    }

    async fn download_to_memory(&self) -> std::result::Result<(), TransferFailure> {
        let response = self.send(0).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(protocol_failure)?;
            self.outbox.send(Notification::Data(chunk.to_vec()))?;
        }
        Ok(())
    }

    async fn download_to_file(&self, path: PathBuf) -> std::result::Result<(), TransferFailure> {
        let mut offset = 0;
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            match self.ask_file_exists(path.clone(), meta.len()).await? {
                FileExistsAction::Resume => offset = meta.len(),
                FileExistsAction::Overwrite => {}
                FileExistsAction::Skip => return Ok(()),
            }
        }

        let response = self.send(offset).await?;
        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            // Nothing left to fetch; verification decides if the file is whole.
            return Ok(());
        }
        let append = offset > 0 && response.status() == StatusCode::PARTIAL_CONTENT;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(local_failure)?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(&path)
            .await
            .map_err(local_failure)?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(protocol_failure)?;
            file.write_all(&chunk).await.map_err(local_failure)?;
        }
        file.flush().await.map_err(local_failure)?;
        Ok(())
    }

    async fn send(&self, offset: u64) -> std::result::Result<reqwest::Response, TransferFailure> {
        let mut request = self.client.get(self.url.clone());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        let response = request.send().await.map_err(protocol_failure)?;

        let status = response.status();
        if status.is_success() || (offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE) {
            Ok(response)
        } else {
            Err(TransferFailure::Protocol(format!("HTTP {status}")))
        }
    }

    async fn ask_file_exists(
        &self,
        local_path: PathBuf,
        local_size: u64,
    ) -> std::result::Result<FileExistsAction, TransferFailure> {
        let id = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();
        self.replies.lock().insert(id, sender);

        self.outbox.send(Notification::AsyncRequest {
            id,
            request: AsyncRequest::FileExists {
                local_path,
                local_size,
            },
        })?;

        match receiver.await {
            Ok(AsyncReply::FileExists(action)) => Ok(action),
            Ok(other) => Err(TransferFailure::Local(format!(
                "unexpected reply to file-exists prompt: {other:?}"
            ))),
            Err(_) => Err(TransferFailure::Disconnected),
        }
    }
}

fn protocol_failure(err: reqwest::Error) -> TransferFailure {
    TransferFailure::Protocol(err.to_string())
}

fn local_failure(err: std::io::Error) -> TransferFailure {
    TransferFailure::Local(err.to_string())
}
