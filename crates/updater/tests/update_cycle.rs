use channel_updater::{
    AsyncReply, BuildInfo, Command, CommandStatus, JsonSettingsStore, Notification, RequestId,
    SettingsStore, TransferEngine, TransferFailure, Updater, UpdaterConfig, UpdaterState,
};
use chrono::NaiveDate;
use sha2::{Digest, Sha512};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

/// Engine that accepts everything and remembers where downloads should go.
#[derive(Default)]
struct ScriptedEngine {
    last_target: Option<PathBuf>,
    issued: usize,
}

impl TransferEngine for ScriptedEngine {
    fn execute(&mut self, command: Command) -> CommandStatus {
        self.issued += 1;
        match command {
            Command::TransferFile(transfer) => {
                self.last_target = transfer.local_path;
                CommandStatus::Pending
            }
            _ => CommandStatus::Done,
        }
    }

    fn answer(&mut self, _id: RequestId, _reply: AsyncReply) {}
}

fn updater_at(
    root: &Path,
    version: &str,
) -> Updater<ScriptedEngine, JsonSettingsStore> {
    let settings = JsonSettingsStore::open(root.join("settings.json")).unwrap();
    let config = UpdaterConfig::new("updates.example.org")
        .with_download_dir(root.join("downloads"))
        .with_temp_dir(root.join("tmp"));
    let build = BuildInfo::new(version, NaiveDate::from_ymd_opt(2024, 1, 1));
    Updater::new(ScriptedEngine::default(), settings, config, build)
}

#[test]
fn verified_download_survives_restart() {
    let root = tempdir().unwrap();
    fs::create_dir_all(root.path().join("downloads")).unwrap();
    fs::create_dir_all(root.path().join("tmp")).unwrap();

    let payload = b"release artefact bytes";
    let body = format!(
        "release 3.5.0 https://cdn.example.org/builds/app-3.5.0.tar.bz2 {} sha512 {}\n\nBug fixes.\n",
        payload.len(),
        hex::encode(Sha512::digest(payload))
    );

    let mut updater = updater_at(root.path(), "3.4.0");
    updater.init();
    assert_eq!(updater.state(), UpdaterState::Idle);

    assert!(updater.run());
    updater.on_notification(Notification::Data(body.clone().into_bytes()));
    updater.on_notification(Notification::OperationResult(Ok(())));
    assert_eq!(updater.state(), UpdaterState::NewVersionDownloading);

    let staged = updater.engine().last_target.clone().unwrap();
    fs::write(&staged, payload).unwrap();
    updater.on_notification(Notification::OperationResult(Ok(())));

    assert_eq!(updater.state(), UpdaterState::NewVersionReady);
    assert_eq!(updater.changelog(), "Bug fixes.");
    let placed = root.path().join("downloads").join("app-3.5.0.tar.bz2");
    assert_eq!(updater.downloaded_file(), Some(placed.as_path()));
    assert_eq!(updater.settings().settings().cached_metadata, body);
    drop(updater);

    let mut restarted = updater_at(root.path(), "3.4.0");
    restarted.init();
    assert_eq!(restarted.state(), UpdaterState::NewVersionReady);
    assert_eq!(restarted.downloaded_file(), Some(placed.as_path()));
    assert_eq!(restarted.available_build().version, "3.5.0");
    assert_eq!(restarted.engine().issued, 0);
}

#[test]
fn failed_check_is_never_left_checking() {
    let root = tempdir().unwrap();
    let mut updater = updater_at(root.path(), "3.4.0");

    assert!(updater.run());
    assert_eq!(updater.state(), UpdaterState::Checking);
    updater.on_notification(Notification::OperationResult(Err(TransferFailure::Protocol(
        "connection reset".into(),
    ))));

    assert_eq!(updater.state(), UpdaterState::Failed);
    assert!(!updater.is_busy());
    assert!(updater.run());
}
