//! Channel-aware software update engine.
//!
//! The updater asks an update server which builds exist on the nightly, beta
//! and stable channels, decides whether one of them is newer than the
//! running build, downloads it and only hands it out once its size and
//! SHA-512 digest match what the server advertised.
//!
//! All network I/O goes through a [`TransferEngine`]. The state machine is
//! single threaded: it issues commands and is fed the engine's
//! [`Notification`]s on the same thread. [`HttpTransferEngine`] is a
//! `reqwest`-based engine that delivers its notifications over a channel.
//!
//! ```ignore
//! use channel_updater::{
//!     BuildInfo, HttpTransferEngine, MemorySettings, Updater, UpdaterConfig, UpdaterState,
//! };
//!
//! # async fn demo() -> channel_updater::Result<()> {
//! let (engine, mut notifications) = HttpTransferEngine::new()?;
//! let mut updater = Updater::new(
//!     engine,
//!     MemorySettings::default(),
//!     UpdaterConfig::new("updates.example.org"),
//!     BuildInfo::new(env!("CARGO_PKG_VERSION"), None),
//! );
//! updater.subscribe(|state: UpdaterState, build: &channel_updater::BuildDescriptor| {
//!     println!("{state:?} {}", build.version);
//! });
//! updater.run();
//! while let Some(notification) = notifications.recv().await {
//!     updater.on_notification(notification);
//!     if !updater.is_busy() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod engine;
mod error;
pub mod filesystem;
pub mod http;
pub mod metadata;
pub mod namer;
pub mod platform;
pub mod settings;
mod updater;
pub mod version;

pub use engine::{
    AsyncReply, AsyncRequest, Command, CommandStatus, FileExistsAction, Notification, RequestId,
    Server, TransferEngine, TransferFailure, TransferFile, TrustPolicy,
};
pub use error::{Result, UpdaterError};
pub use filesystem::{FileSystem, LocalFs};
pub use http::HttpTransferEngine;
pub use metadata::{parse_metadata, BuildDescriptor, Channel, Download, VersionMetadata};
pub use namer::LocalFileNamer;
pub use platform::{BuildInfo, HostPlatform, PlatformInfo};
pub use settings::{
    ChannelPreference, JsonSettingsStore, MemorySettings, SettingsStore, UpdateSettings,
    UpdaterConfig,
};
pub use updater::{HandlerId, UpdateHandler, Updater, UpdaterState, MAX_METADATA_SIZE};
pub use version::{compare_versions, Version};
