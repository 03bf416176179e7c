//! Upgrade orchestration
//!
//! One attempt runs scan, validate, stage, launch and confirm in order. Any
//! step that fails in a way the next attempt might not hit again is a soft
//! failure: it is recorded in the event log and the attempt returns `false`.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use sha2::{Digest, Sha256};

use molt_core::Version;

use super::handshake::HandshakeServer;
use super::scanner::find_highest;
use crate::config::Settings;
use crate::event_log::EventLog;
use crate::failure::{HardFailure, HardFailureKind, SoftFailure};

/// Install directory names used by development builds
const DEVELOPMENT_LEAVES: [&str; 2] = ["debug", "release"];

/// Starts a staged executable in install mode
pub trait Launcher {
    fn launch(&self, executable: &Path, endpoint: &Path) -> io::Result<()>;
}

impl<L: Launcher + ?Sized> Launcher for &L {
    fn launch(&self, executable: &Path, endpoint: &Path) -> io::Result<()> {
        (**self).launch(executable, endpoint)
    }
}

/// Launches the real process, passing the settings file along
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    config: Option<PathBuf>,
}

impl ProcessLauncher {
    /// `config` is forwarded as `--config` when the settings came from a
    /// non-default location
    pub fn new(config: Option<PathBuf>) -> Self {
        Self { config }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, executable: &Path, _endpoint: &Path) -> io::Result<()> {
        let mut command = Command::new(executable);
        command.arg("--install").stdin(Stdio::null());
        if let Some(ref config) = self.config {
            command.arg("--config").arg(config);
        }

        let mut child = command.spawn()?;
        let pid = child.id();
        log::info!("Launched {} --install (pid {})", executable.display(), pid);

        // The installer is short-lived; reap it off the main thread
        let waiter = std::thread::Builder::new()
            .name("molt-installer-wait".into())
            .spawn(move || match child.wait() {
                Ok(status) => log::info!("Installer pid {} exited: {}", pid, status),
                Err(e) => log::warn!("Failed to wait for installer pid {}: {}", pid, e),
            });
        if let Err(e) = waiter {
            log::warn!("Installer pid {} will not be reaped: {}", pid, e);
        }
        Ok(())
    }
}

/// Drives one upgrade attempt at a time
pub struct Upgrader<'a, L: Launcher> {
    settings: &'a Settings,
    log: &'a EventLog,
    install_dir: PathBuf,
    executable: String,
    launcher: L,
}

impl<'a, L: Launcher> Upgrader<'a, L> {
    /// Upgrader for the running executable
    pub fn new(settings: &'a Settings, log: &'a EventLog, launcher: L) -> Result<Self, HardFailure> {
        let exe = std::env::current_exe()
            .map_err(|e| HardFailure::with_source(HardFailureKind::FileIo, e))?;

        let (Some(install_dir), Some(file_name)) = (exe.parent(), exe.file_name()) else {
            return Err(HardFailure::with_source(
                HardFailureKind::FileIo,
                format!("cannot locate install directory of {}", exe.display()),
            ));
        };

        let executable = settings
            .upgrade
            .executable
            .clone()
            .unwrap_or_else(|| file_name.to_string_lossy().into_owned());

        Ok(Self::with_install_dir(
            settings,
            log,
            install_dir.to_path_buf(),
            executable,
            launcher,
        ))
    }

    /// Upgrader for an explicit install directory and executable name
    pub fn with_install_dir(
        settings: &'a Settings,
        log: &'a EventLog,
        install_dir: PathBuf,
        executable: String,
        launcher: L,
    ) -> Self {
        Self {
            settings,
            log,
            install_dir,
            executable,
            launcher,
        }
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    /// Version named by the install directory
    ///
    /// Development builds run from `debug` or `release` and report
    /// [`Version::DEVELOPMENT`]. Any other name that does not parse is a
    /// soft failure.
    pub fn current_version(&self) -> Option<Version> {
        let leaf = self
            .install_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if DEVELOPMENT_LEAVES
            .iter()
            .any(|dev| leaf.eq_ignore_ascii_case(dev))
        {
            return Some(Version::DEVELOPMENT);
        }

        match Version::parse(&leaf) {
            Ok(version) => Some(version),
            Err(e) => {
                log::warn!("Install directory {:?} is not a version: {}", leaf, e);
                self.log.soft_fail(SoftFailure::WrappedError);
                None
            }
        }
    }

    /// Run one attempt; `Ok(true)` means the new instance took over
    pub fn try_upgrade(&self) -> Result<bool, HardFailure> {
        let Some(current) = self.current_version() else {
            return Ok(false);
        };

        let root = self.settings.distribution_root();
        let Some(found) = find_highest(root, self.log)? else {
            log::debug!("No releases under {}", root.display());
            return Ok(false);
        };

        if found <= current {
            log::debug!("Running {}, newest published is {}", current, found);
            return Ok(false);
        }
        self.log.newer_found(&found);

        let release_dir = root.join(found.to_string());
        if !self.valid_release_dir(&release_dir) {
            return Ok(false);
        }

        let Some(staged) = self.stage(&release_dir, &found) else {
            return Ok(false);
        };

        let upgrade = &self.settings.upgrade;
        let endpoint = upgrade.endpoint_path();
        let server = HandshakeServer::begin(&endpoint, upgrade.handshake_timeout())?;

        if let Err(e) = self.launcher.launch(&staged, &endpoint) {
            log::warn!("Failed to launch {}: {}", staged.display(), e);
            server.cancel();
            self.log.soft_fail(SoftFailure::LaunchFailed);
            return Ok(false);
        }

        if !server.end()? {
            self.log.soft_fail(SoftFailure::TimedOut);
            return Ok(false);
        }

        log::info!("Version {} confirmed the hand-off", found);
        Ok(true)
    }

    /// A release directory must hold a readable executable and marker, both regular files
    pub fn valid_release_dir(&self, dir: &Path) -> bool {
        let marker = &self.settings.upgrade.marker;
        for name in [self.executable.as_str(), marker.as_str()] {
            let path = dir.join(name);
            let usable = File::open(&path).and_then(|file| file.metadata());
            let problem = match usable {
                Ok(meta) if meta.is_file() => continue,
                Ok(_) => "not a regular file".to_string(),
                Err(e) => e.to_string(),
            };
            log::warn!("Release file {} unusable: {}", path.display(), problem);
            self.log.soft_fail(SoftFailure::InvalidFile);
            return false;
        }
        true
    }

    /// Copy the release executable next to the running install
    fn stage(&self, release_dir: &Path, version: &Version) -> Option<PathBuf> {
        let Some(install_root) = self.install_dir.parent() else {
            log::warn!("{} has no parent directory", self.install_dir.display());
            self.log.soft_fail(SoftFailure::CreateFailed);
            return None;
        };

        let target_dir = install_root.join(version.to_string());
        match fs::create_dir(&target_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                log::warn!("Failed to create {}: {}", target_dir.display(), e);
                self.log.soft_fail(SoftFailure::CreateFailed);
                return None;
            }
        }
        self.log.installing(version);

        let source = release_dir.join(&self.executable);
        let target = target_dir.join(&self.executable);
        if let Err(e) = copy_verified(&source, &target) {
            log::warn!(
                "Failed to stage {} as {}: {}",
                source.display(),
                target.display(),
                e
            );
            self.log.soft_fail(SoftFailure::CopyFailed);
            return None;
        }

        Some(target)
    }
}

/// Copy `source` to `target` and check the copy hashes the same
fn copy_verified(source: &Path, target: &Path) -> io::Result<()> {
    fs::copy(source, target)?;

    let expected = file_sha256(source)?;
    let actual = file_sha256(target)?;
    if actual != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("checksum mismatch: {} != {}", actual, expected),
        ));
    }
    Ok(())
}

/// Hex SHA-256 of a file's contents
pub fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct CountingLauncher {
        calls: Cell<usize>,
    }

    impl Launcher for CountingLauncher {
        fn launch(&self, _executable: &Path, _endpoint: &Path) -> io::Result<()> {
            self.calls.set(self.calls.get() + 1);
            Err(io::Error::new(io::ErrorKind::NotFound, "no such program"))
        }
    }

    fn launcher() -> CountingLauncher {
        CountingLauncher {
            calls: Cell::new(0),
        }
    }

    #[test]
    fn test_current_version_from_leaf() {
        let settings = Settings::default();
        let log = EventLog::in_memory();

        let upgrader = Upgrader::with_install_dir(
            &settings,
            &log,
            PathBuf::from("/opt/molt/1.4.0.0"),
            "molt".into(),
            launcher(),
        );
        assert_eq!(upgrader.current_version(), Some(Version::new(1, 4, 0, 0)));

        for leaf in ["debug", "release", "Debug"] {
            let upgrader = Upgrader::with_install_dir(
                &settings,
                &log,
                PathBuf::from("/build/target").join(leaf),
                "molt".into(),
                launcher(),
            );
            assert_eq!(upgrader.current_version(), Some(Version::DEVELOPMENT));
        }
        assert!(log.entries().is_empty());
    }

    #[test]
    fn test_unparseable_leaf_is_wrapped_error() {
        let settings = Settings::default();
        let log = EventLog::in_memory();
        let upgrader = Upgrader::with_install_dir(
            &settings,
            &log,
            PathBuf::from("/usr/local/bin"),
            "molt".into(),
            launcher(),
        );

        assert_eq!(upgrader.current_version(), None);
        assert!(!upgrader.try_upgrade().unwrap());
        assert_eq!(log.soft_failures(SoftFailure::WrappedError), 2);
    }

    #[test]
    fn test_launch_failure_cancels_handshake() {
        let dist = tempfile::tempdir().unwrap();
        let installs = tempfile::tempdir().unwrap();
        let release = dist.path().join("2.0.0.0");
        fs::create_dir(&release).unwrap();
        fs::write(release.join("molt"), b"#!/bin/sh\n").unwrap();
        fs::write(release.join("release.ok"), b"").unwrap();
        let current = installs.path().join("1.0.0.0");
        fs::create_dir(&current).unwrap();

        let mut settings = Settings::default();
        settings.upgrade.distribution_root = dist.path().to_path_buf();
        settings.upgrade.endpoint = Some(installs.path().join("upgrade.sock"));
        let log = EventLog::in_memory();

        let upgrader =
            Upgrader::with_install_dir(&settings, &log, current, "molt".into(), launcher());
        assert!(!upgrader.try_upgrade().unwrap());

        assert_eq!(upgrader.launcher.calls.get(), 1);
        assert_eq!(log.soft_failures(SoftFailure::LaunchFailed), 1);
        assert!(installs.path().join("2.0.0.0").join("molt").is_file());
        assert!(!installs.path().join("upgrade.sock").exists());
    }

    #[test]
    fn test_directory_in_place_of_executable_is_invalid_file() {
        let dist = tempfile::tempdir().unwrap();
        let installs = tempfile::tempdir().unwrap();
        let release = dist.path().join("2.0.0.0");
        fs::create_dir_all(release.join("molt")).unwrap();
        fs::write(release.join("release.ok"), b"").unwrap();
        let current = installs.path().join("1.0.0.0");
        fs::create_dir(&current).unwrap();

        let mut settings = Settings::default();
        settings.upgrade.distribution_root = dist.path().to_path_buf();
        settings.upgrade.endpoint = Some(installs.path().join("upgrade.sock"));
        let log = EventLog::in_memory();

        let upgrader =
            Upgrader::with_install_dir(&settings, &log, current, "molt".into(), launcher());
        assert!(!upgrader.valid_release_dir(&release));
        assert!(!upgrader.try_upgrade().unwrap());

        assert_eq!(log.soft_failures(SoftFailure::InvalidFile), 2);
        assert_eq!(log.soft_failures(SoftFailure::CopyFailed), 0);
        assert_eq!(upgrader.launcher.calls.get(), 0);
        assert!(!installs.path().join("2.0.0.0").exists());
    }

    #[test]
    fn test_missing_source_is_copy_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = copy_verified(&dir.path().join("absent"), &dir.path().join("copy"));
        assert!(err.is_err());
    }

    #[test]
    fn test_file_sha256() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload");
        fs::write(&path, b"test content").unwrap();

        assert_eq!(
            file_sha256(&path).unwrap(),
            "6ae8a75555209fd6c44157c0aed8016e763ff435a19cf186f76863140143ff72"
        );
    }
}
