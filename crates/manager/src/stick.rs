//! Per-stick worker
//!
//! One `StickWorker` owns one physical stick for one plug/unplug
//! lifetime and runs on its own thread so a slow copy on one stick
//! never blocks another stick's mount. The lifecycle is
//! created -> (format) -> (relabel) -> mounted -> operating ->
//! unmounting -> done, with `failed` reachable from every step. Once
//! the stick is mounted, unmount is always attempted before the worker
//! reports its terminal state.
//!
//! Workers never touch manager state; progress is reported as
//! `(bus_path, tag)` messages on the status relay.

use crate::command::{self, CommandRunner};
use crate::config::StickSettings;
use async_channel::Sender;
use common::{DeviceInfo, Error, Result, StatusMessage, StatusTag, port_name};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info};
use walkdir::WalkDir;

/// One inserted stick.
#[derive(Debug, Clone)]
pub struct UsbStick {
    pub info: DeviceInfo,
    pub port_name: String,
}

impl UsbStick {
    pub fn new(info: DeviceInfo) -> Self {
        let port_name = port_name(&info.bus_path);
        Self { info, port_name }
    }
}

/// Terminal state of a worker, inspected by the caller after join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Done,
    Failed(String),
}

pub struct StickWorker {
    stick: UsbStick,
    mount_point: PathBuf,
    source_folder: PathBuf,
    settings: StickSettings,
    runner: Arc<dyn CommandRunner>,
    relay: Option<Sender<StatusMessage>>,
    finished: Arc<AtomicBool>,
    active: Arc<AtomicUsize>,
}

impl StickWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        info: DeviceInfo,
        mount_base: &Path,
        source_folder: PathBuf,
        settings: StickSettings,
        runner: Arc<dyn CommandRunner>,
        relay: Option<Sender<StatusMessage>>,
        active: Arc<AtomicUsize>,
    ) -> Self {
        let stick = UsbStick::new(info);
        let mount_point = mount_base.join(&stick.port_name);
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            stick,
            mount_point,
            source_folder,
            settings,
            runner,
            relay,
            finished: Arc::new(AtomicBool::new(false)),
            active,
        }
    }

    /// Set once the worker has fully terminated. The remove-event
    /// handler uses this to detect "unplugged while still working".
    pub fn finished_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.finished)
    }

    pub fn bus_path(&self) -> &str {
        &self.stick.info.bus_path
    }

    /// Run the worker on its own named thread.
    pub fn spawn(self) -> Result<JoinHandle<WorkerOutcome>> {
        let name = format!("stick-{}", self.stick.port_name);
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(|e| Error::Other(format!("failed to spawn stick worker: {}", e)))
    }

    /// Full lifecycle; blocking. Returns the terminal state instead of
    /// panicking so the thread always exits cleanly.
    pub fn run(self) -> WorkerOutcome {
        info!("Worker start: {}", self.stick.info);
        self.report(StatusTag::Start);

        let outcome = match self.lifecycle() {
            Ok(()) => {
                self.report(StatusTag::Done);
                WorkerOutcome::Done
            }
            Err(e) => {
                error!(
                    "Worker failed on port {} ({}): {}",
                    self.stick.port_name, self.stick.info.bus_path, e
                );
                self.report(StatusTag::Failed);
                WorkerOutcome::Failed(e.to_string())
            }
        };

        self.finished.store(true, Ordering::SeqCst);
        self.active.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn lifecycle(&self) -> Result<()> {
        let node = &self.stick.info.node;

        if self.settings.format_fat32 {
            command::format_fat32(self.runner.as_ref(), node, &self.settings.label)?;
            self.report(StatusTag::Fat32);
        }

        if self.settings.update_label {
            command::update_label(self.runner.as_ref(), node, &self.settings.label)?;
            self.report(StatusTag::Label);
        }

        self.create_mount_point()?;
        command::mount(
            self.runner.as_ref(),
            node,
            &self.mount_point,
            self.settings.user_mount,
        )?;
        self.report(StatusTag::Mount);

        // From here on the stick is mounted: unmount must happen no
        // matter how operate went.
        let operate_result = self.operate();

        let unmount_result = command::unmount(
            self.runner.as_ref(),
            &self.mount_point,
            self.settings.user_mount,
        );
        match &unmount_result {
            Ok(_) => {
                if let Err(e) = fs::remove_dir(&self.mount_point) {
                    debug!(
                        "Could not remove mount point {}: {}",
                        self.mount_point.display(),
                        e
                    );
                }
            }
            Err(e) => error!(
                "Unmount failed for port {}: {}",
                self.stick.port_name, e
            ),
        }

        operate_result?;
        unmount_result?;
        Ok(())
    }

    /// Create the mount-point directory. Idempotent.
    fn create_mount_point(&self) -> Result<()> {
        fs::create_dir_all(&self.mount_point)?;
        Ok(())
    }

    /// Configured steps in fixed order: copy -> remove-meta ->
    /// remove-named. A step failure is surfaced but does not stop the
    /// remaining steps; a missing mount point refuses the whole phase.
    fn operate(&self) -> Result<()> {
        if !self.mount_point.is_dir() {
            return Err(Error::MountPointMissing(self.mount_point.clone()));
        }

        let steps = &self.settings.auto_run_steps;
        let mut first_error: Option<Error> = None;

        if steps.copy_files_to_me {
            match command::copy_tree(self.runner.as_ref(), &self.source_folder, &self.mount_point)
            {
                Ok(_) => self.report(StatusTag::Copy),
                Err(e) => {
                    error!("Copy step failed on port {}: {}", self.stick.port_name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if steps.remove_all_meta_files {
            match remove_matching(&self.mount_point, is_meta_name) {
                Ok(count) => {
                    debug!("Removed {} meta entries on port {}", count, self.stick.port_name);
                    self.report(StatusTag::RmMeta);
                }
                Err(e) => {
                    error!(
                        "Meta cleanup failed on port {}: {}",
                        self.stick.port_name, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        if steps.remove_named_files {
            let names = self.settings.remove_files.clone();
            match remove_matching(&self.mount_point, |name| names.iter().any(|n| n == name)) {
                Ok(count) => {
                    debug!(
                        "Removed {} named entries on port {}",
                        count, self.stick.port_name
                    );
                    self.report(StatusTag::RmFiles);
                }
                Err(e) => {
                    error!(
                        "Named-file cleanup failed on port {}: {}",
                        self.stick.port_name, e
                    );
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn report(&self, tag: StatusTag) {
        match &self.relay {
            Some(relay) => {
                // Unbounded relay: a failure means the display consumer
                // is gone, which only happens during shutdown.
                let _ = relay.try_send(StatusMessage::Update {
                    bus_path: self.stick.info.bus_path.clone(),
                    tag,
                });
            }
            None => info!("[{}] {}", self.stick.port_name, tag),
        }
    }
}

impl Drop for StickWorker {
    fn drop(&mut self) {
        // `run` releases the pending-worker slot itself; a worker that
        // is dropped without ever running (spawn failure) must release
        // it here or `pending_workers` over-reports forever.
        if !self.finished.load(Ordering::SeqCst) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Operating-system metadata litter that should not end up on sticks.
fn is_meta_name(name: &str) -> bool {
    const META_NAMES: &[&str] = &[
        ".DS_Store",
        ".Spotlight-V100",
        ".Trashes",
        ".fseventsd",
        "System Volume Information",
        "Thumbs.db",
        "desktop.ini",
    ];
    META_NAMES.contains(&name) || name.starts_with("._")
}

/// Remove every entry under `root` whose file name matches. Matched
/// directories are removed whole without descending into them.
fn remove_matching(root: &Path, matches: impl Fn(&str) -> bool) -> Result<usize> {
    let mut removed = 0;
    let mut walker = WalkDir::new(root).min_depth(1).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| Error::Other(format!("walk failed: {}", e)))?;
        let name = entry.file_name().to_string_lossy();
        if matches(&name) {
            if entry.file_type().is_dir() {
                fs::remove_dir_all(entry.path())?;
                walker.skip_current_dir();
            } else {
                fs::remove_file(entry.path())?;
            }
            removed += 1;
        }
    }
    Ok(removed)
}
