use crate::{
    checksum::verify_file,
    engine::{
        AsyncReply, AsyncRequest, Command, CommandStatus, FileExistsAction, Notification,
        RequestId, Server, TransferEngine, TransferFailure, TransferFile, TrustPolicy,
    },
    error::{Result, UpdaterError},
    filesystem::{FileSystem, LocalFs},
    metadata::{parse_metadata, BuildDescriptor, Download, VersionMetadata},
    namer::LocalFileNamer,
    platform::{check_url, staging_path, BuildInfo, HostPlatform, PlatformInfo},
    settings::{SettingsStore, UpdateSettings, UpdaterConfig},
};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use url::Url;

/// Cap on the version-check response body.
pub const MAX_METADATA_SIZE: usize = 128 * 1024;

/// Where the update cycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdaterState {
    Idle,
    Checking,
    /// A newer build is known but not (yet) downloaded.
    NewVersion,
    NewVersionDownloading,
    /// The newer build is downloaded and verified.
    NewVersionReady,
    Failed,
}

impl UpdaterState {
    fn accepts_run(self) -> bool {
        matches!(
            self,
            UpdaterState::Idle
                | UpdaterState::Failed
                | UpdaterState::NewVersion
                | UpdaterState::NewVersionReady
        )
    }
}

/// Observer of updater state changes.
pub trait UpdateHandler {
    /// Called once per actual state change with the build on offer (empty
    /// when there is none).
    fn state_changed(&mut self, state: UpdaterState, available: &BuildDescriptor);
}

impl<F> UpdateHandler for F
where
    F: FnMut(UpdaterState, &BuildDescriptor),
{
    fn state_changed(&mut self, state: UpdaterState, available: &BuildDescriptor) {
        self(state, available)
    }
}

/// Token returned by [`Updater::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Drives version checks and downloads through a [`TransferEngine`].
///
/// Single threaded: commands return immediately and the outcome arrives via
/// [`Updater::on_notification`]. Only one cycle runs at a time, which is
/// enforced by the state gate in [`Updater::run`].
pub struct Updater<E, S> {
    engine: E,
    settings: S,
    config: UpdaterConfig,
    build: BuildInfo,
    fs: Box<dyn FileSystem>,
    platform: Box<dyn PlatformInfo>,
    namer: LocalFileNamer,

    state: UpdaterState,
    metadata: VersionMetadata,
    raw_metadata: String,
    pending: VecDeque<Command>,
    connection_trust: Option<TrustPolicy>,
    staging: Option<PathBuf>,
    local_file: Option<PathBuf>,
    /// Results still owed by cancelled transfers.
    cancelled_transfers: usize,

    handlers: Vec<(HandlerId, Box<dyn UpdateHandler>)>,
    next_handler: u64,
}

impl<E, S> Updater<E, S>
where
    E: TransferEngine,
    S: SettingsStore,
{
    /// Create an idle updater. Call [`Updater::init`] to pick up cached
    /// metadata from a previous run.
    pub fn new(engine: E, settings: S, config: UpdaterConfig, build: BuildInfo) -> Self {
        let namer = LocalFileNamer::new(config.download_dir.clone());
        Self {
            engine,
            settings,
            config,
            build,
            fs: Box::new(LocalFs),
            platform: Box::new(HostPlatform),
            namer,
            state: UpdaterState::Idle,
            metadata: VersionMetadata::default(),
            raw_metadata: String::new(),
            pending: VecDeque::new(),
            connection_trust: None,
            staging: None,
            local_file: None,
            cancelled_transfers: 0,
            handlers: Vec::new(),
            next_handler: 0,
        }
    }

    pub fn with_file_system(mut self, fs: impl FileSystem + 'static) -> Self {
        self.fs = Box::new(fs);
        self
    }

    pub fn with_platform(mut self, platform: impl PlatformInfo + 'static) -> Self {
        self.platform = Box::new(platform);
        self
    }

    pub fn state(&self) -> UpdaterState {
        self.state
    }

    /// Whether a check or download is in flight.
    pub fn is_busy(&self) -> bool {
        !self.state.accepts_run()
    }

    /// The build currently on offer; empty if none.
    pub fn available_build(&self) -> &BuildDescriptor {
        &self.metadata.available
    }

    pub fn metadata(&self) -> &VersionMetadata {
        &self.metadata
    }

    pub fn changelog(&self) -> &str {
        &self.metadata.changelog
    }

    /// Verified artefact, set while in [`UpdaterState::NewVersionReady`].
    pub fn downloaded_file(&self) -> Option<&Path> {
        self.local_file.as_deref()
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    pub fn settings(&self) -> &S {
        &self.settings
    }

    pub fn subscribe(&mut self, handler: impl UpdateHandler + 'static) -> HandlerId {
        let id = HandlerId(self.next_handler);
        self.next_handler += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if `id` was not registered.
    pub fn unsubscribe(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _)| *handler_id != id);
        self.handlers.len() != before
    }

    /// Restore the state implied by the metadata cached from the last
    /// successful check.
    pub fn init(&mut self) {
        if self.state != UpdaterState::Idle {
            return;
        }
        let raw = self.settings.settings().cached_metadata.clone();
        if raw.is_empty() {
            return;
        }

        self.metadata = parse_metadata(&raw, &self.build, self.settings.settings().channel);
        if !self.metadata.has_update() {
            return;
        }

        let ready = self
            .metadata
            .available
            .download
            .as_ref()
            .and_then(|download| self.existing_artefact(download));
        match ready {
            Some(path) => {
                self.local_file = Some(path);
                self.set_state(UpdaterState::NewVersionReady);
            }
            None => self.set_state(UpdaterState::NewVersion),
        }
    }

    /// Start a check if one is due at `now` according to the settings.
    pub fn run_if_needed(&mut self, now: DateTime<Utc>) -> bool {
        if !self.settings.settings().check_due(now) {
            return false;
        }
        self.run()
    }

    /// Start a new version check.
    ///
    /// Returns `false` without doing anything while a cycle is in flight.
    pub fn run(&mut self) -> bool {
        if !self.state.accepts_run() {
            tracing::debug!(state = ?self.state, "update cycle already running");
            return false;
        }

        self.local_file = None;
        self.raw_metadata.clear();
        self.pending.clear();
        self.engine.execute(Command::Disconnect);
        self.connection_trust = None;

        let url = check_url(&self.config.update_host, &self.build, self.platform.as_ref());
        tracing::info!(%url, "checking for updates");
        let (server, transfer) = match split_url(&url, None) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!("cannot build version check request: {err}");
                self.set_state(UpdaterState::Failed);
                return false;
            }
        };

        self.pending.push_back(Command::Connect {
            server,
            trust: TrustPolicy::EmbeddedAnchor,
        });
        self.pending.push_back(Command::TransferFile(transfer));
        self.set_state(UpdaterState::Checking);
        self.continue_commands();
        true
    }

    /// Feed an engine notification into the state machine.
    pub fn on_notification(&mut self, notification: Notification) {
        match notification {
            Notification::AsyncRequest { id, request } => self.on_async_request(id, request),
            Notification::Data(chunk) => self.on_data(chunk),
            Notification::OperationResult(result) => self.on_operation_result(result),
        }
    }

    fn on_async_request(&mut self, id: RequestId, request: AsyncRequest) {
        if self.cancelled_transfers > 0 {
            tracing::debug!(?id, "refusing request from a cancelled transfer");
            let reply = match request {
                AsyncRequest::FileExists { .. } => AsyncReply::FileExists(FileExistsAction::Skip),
                AsyncRequest::Certificate { .. } => AsyncReply::Certificate { trusted: false },
            };
            self.engine.answer(id, reply);
            return;
        }
        let reply = match request {
            AsyncRequest::FileExists { local_path, local_size } => {
                tracing::debug!(path = ?local_path, local_size, "resuming partial download");
                AsyncReply::FileExists(FileExistsAction::Resume)
            }
            AsyncRequest::Certificate {
                host,
                chains_to_anchor,
            } => {
                let trusted =
                    chains_to_anchor && self.connection_trust == Some(TrustPolicy::EmbeddedAnchor);
                if !trusted {
                    tracing::warn!(%host, "refusing certificate outside the check connection");
                }
                AsyncReply::Certificate { trusted }
            }
        };
        self.engine.answer(id, reply);
    }

    fn on_data(&mut self, chunk: Vec<u8>) {
        if self.cancelled_transfers > 0 {
            tracing::debug!(len = chunk.len(), "dropping data from a cancelled transfer");
            return;
        }
        if self.state != UpdaterState::Checking || self.pending.is_empty() {
            tracing::debug!(len = chunk.len(), "dropping data outside a version check");
            return;
        }

        if self.raw_metadata.len() + chunk.len() > MAX_METADATA_SIZE {
            tracing::warn!(
                received = self.raw_metadata.len() + chunk.len(),
                limit = MAX_METADATA_SIZE,
                "version check response too large"
            );
            self.abort_check();
            return;
        }
        if let Some(byte) = chunk.iter().copied().find(|&b| !is_metadata_byte(b)) {
            tracing::warn!(byte, "invalid byte in version check response");
            self.abort_check();
            return;
        }

        self.raw_metadata.extend(chunk.iter().map(|&b| char::from(b)));
    }

    fn on_operation_result(&mut self, result: std::result::Result<(), TransferFailure>) {
        if self.cancelled_transfers > 0 {
            self.cancelled_transfers -= 1;
            tracing::debug!(?result, "discarding result of a cancelled transfer");
            return;
        }
        if self.pending.is_empty() {
            tracing::debug!(?result, "ignoring result with no command outstanding");
            return;
        }
        match result {
            Ok(()) => {
                self.pending.pop_front();
                self.continue_commands();
            }
            Err(failure) => {
                tracing::warn!(state = ?self.state, "transfer failed: {failure}");
                self.pending.clear();
                self.step_finished(false);
            }
        }
    }

    /// Execute queued commands until one goes asynchronous.
    fn continue_commands(&mut self) {
        while let Some(command) = self.pending.front().cloned() {
            if let Command::Connect { trust, .. } = &command {
                self.connection_trust = Some(*trust);
            }
            match self.engine.execute(command) {
                CommandStatus::Pending => return,
                CommandStatus::Done => {
                    self.pending.pop_front();
                }
                CommandStatus::Failed => {
                    tracing::warn!(state = ?self.state, "transfer engine refused command");
                    self.pending.clear();
                    self.step_finished(false);
                    return;
                }
            }
        }
        self.step_finished(true);
    }

    fn step_finished(&mut self, success: bool) {
        match self.state {
            UpdaterState::Checking => self.check_finished(success),
            UpdaterState::NewVersionDownloading => self.download_finished(success),
            _ => {}
        }
    }

    fn abort_check(&mut self) {
        // Data only arrives while the check transfer is outstanding.
        if !self.pending.is_empty() {
            self.cancelled_transfers += 1;
        }
        self.engine.execute(Command::Cancel);
        self.pending.clear();
        self.raw_metadata.clear();
        self.set_state(UpdaterState::Failed);
    }

    fn check_finished(&mut self, success: bool) {
        if !success {
            self.raw_metadata.clear();
            let next = if self.metadata.has_update() {
                UpdaterState::NewVersion
            } else {
                UpdaterState::Failed
            };
            self.set_state(next);
            return;
        }

        let raw = std::mem::take(&mut self.raw_metadata);
        self.metadata = parse_metadata(&raw, &self.build, self.settings.settings().channel);
        let has_update = self.metadata.has_update();
        self.persist(|settings| {
            settings.cached_metadata = if has_update { raw } else { String::new() };
            settings.last_check = Some(Utc::now());
        });

        if !has_update {
            tracing::info!(version = %self.build.version, "no newer build available");
            self.set_state(UpdaterState::Idle);
            return;
        }

        let available = self.metadata.available.clone();
        tracing::info!(version = %available.version, "newer build available");
        let Some(download) = available.download else {
            self.set_state(UpdaterState::NewVersion);
            return;
        };

        match self.namer.destination(self.fs.as_ref(), &download, true) {
            Some(path) if self.fs.exists(&path) => {
                tracing::info!(?path, "artefact already downloaded");
                self.local_file = Some(path);
                self.set_state(UpdaterState::NewVersionReady);
            }
            Some(_) => self.start_download(&download),
            None => self.set_state(UpdaterState::NewVersion),
        }
    }

    fn start_download(&mut self, download: &Download) {
        let staging = staging_path(&self.config.temp_dir, &download.sha512);
        self.staging = Some(staging.clone());

        if self
            .fs
            .file_size(&staging)
            .is_some_and(|size| size >= download.size)
        {
            tracing::debug!(path = ?staging, "staged download complete, verifying");
            self.finish_download();
            return;
        }

        let (server, transfer) = match split_url(&download.url, Some(staging)) {
            Ok(parts) => parts,
            Err(err) => {
                tracing::warn!(url = %download.url, "cannot download artefact: {err}");
                self.set_state(UpdaterState::NewVersion);
                return;
            }
        };

        self.engine.execute(Command::Disconnect);
        self.connection_trust = None;
        self.pending.push_back(Command::Connect {
            server,
            trust: TrustPolicy::SystemRoots,
        });
        self.pending.push_back(Command::TransferFile(transfer));
        self.set_state(UpdaterState::NewVersionDownloading);
        self.continue_commands();
    }

    fn download_finished(&mut self, success: bool) {
        if success {
            self.finish_download();
        } else {
            self.set_state(UpdaterState::NewVersion);
        }
    }

    fn finish_download(&mut self) {
        match self.place_artefact() {
            Ok(path) => {
                tracing::info!(?path, "update downloaded and verified");
                self.local_file = Some(path);
                self.set_state(UpdaterState::NewVersionReady);
            }
            Err(err) => {
                tracing::warn!("downloaded update rejected: {err}");
                self.set_state(UpdaterState::NewVersion);
            }
        }
    }

    /// Verify the staged file and move it into the download directory.
    fn place_artefact(&mut self) -> Result<PathBuf> {
        let download = self
            .metadata
            .available
            .download
            .clone()
            .ok_or_else(|| UpdaterError::validation("no downloadable build on offer"))?;
        let staging = self
            .staging
            .take()
            .ok_or_else(|| UpdaterError::validation("no staged download"))?;

        if !verify_file(self.fs.as_ref(), &staging, download.size, &download.sha512) {
            if let Err(err) = self.fs.remove(&staging) {
                tracing::warn!(path = ?staging, "failed to remove rejected download: {err}");
            }
            return Err(UpdaterError::VerificationFailed(staging));
        }

        let destination = self
            .namer
            .destination(self.fs.as_ref(), &download, false)
            .ok_or_else(|| UpdaterError::NoDestination(download.url.clone()))?;
        self.fs.rename(&staging, &destination)?;
        Ok(destination)
    }

    fn existing_artefact(&self, download: &Download) -> Option<PathBuf> {
        self.namer
            .destination(self.fs.as_ref(), download, true)
            .filter(|path| self.fs.exists(path))
    }

    fn persist(&mut self, edit: impl FnOnce(&mut UpdateSettings)) {
        let mut settings = self.settings.settings().clone();
        edit(&mut settings);
        if let Err(err) = self.settings.persist(settings) {
            tracing::warn!("failed to persist updater settings: {err}");
        }
    }

    fn set_state(&mut self, state: UpdaterState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = ?self.state, to = ?state, "updater state changed");
        self.state = state;
        for (_, handler) in self.handlers.iter_mut() {
            handler.state_changed(state, &self.metadata.available);
        }
    }
}

fn is_metadata_byte(byte: u8) -> bool {
    matches!(byte, b'\t' | b'\n' | b'\r' | 0x20..=0x7e)
}

/// Split an `https` URL into the server to connect to and the transfer to
/// issue on that connection.
fn split_url(url: &str, local_path: Option<PathBuf>) -> Result<(Server, TransferFile)> {
    let parsed = Url::parse(url)?;
    if parsed.scheme() != "https" {
        return Err(UpdaterError::validation(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| UpdaterError::validation("url has no host"))?;
    let port = parsed.port_or_known_default().unwrap_or(Server::HTTPS_PORT);

    let (dir, name) = parsed.path().rsplit_once('/').unwrap_or(("", parsed.path()));
    if name.is_empty() {
        return Err(UpdaterError::validation("url has no file name"));
    }
    let filename = match parsed.query() {
        Some(query) => format!("{name}?{query}"),
        None => name.to_string(),
    };

    Ok((
        Server {
            host: host.to_string(),
            port,
        },
        TransferFile {
            local_path,
            remote_path: format!("{dir}/"),
            filename,
            download: true,
        },
    ))
}
