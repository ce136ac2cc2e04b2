//! Device monitor boundary
//!
//! The rest of the system treats device discovery as a black box that
//! emits add/remove notifications with device identity and bus path.
//! `DeviceMonitor` is that boundary; the callback side of it only ever
//! performs a non-blocking enqueue into the event queue.
//!
//! The shipped backend polls `/sys/block` for removable USB partitions
//! and diffs the attached set. The poll interval comes from
//! `system.update_interval_ms`.

use common::{DeviceInfo, EventSink, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub trait DeviceMonitor: Send {
    /// List currently attached removable USB partitions.
    fn enumerate(&self) -> Result<Vec<DeviceInfo>>;

    /// Start emitting add/remove events into the sink. Runs on its own
    /// thread; events may arrive at any time until `stop`.
    fn start(&mut self, sink: EventSink) -> Result<()>;

    /// Stop emitting events. No new events are admitted after this
    /// returns.
    fn stop(&mut self);
}

/// Polling monitor over `/sys/block`.
pub struct SysfsMonitor {
    interval: Duration,
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SysfsMonitor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_flag: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl DeviceMonitor for SysfsMonitor {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        scan_usb_partitions(Path::new("/sys/block"))
    }

    fn start(&mut self, sink: EventSink) -> Result<()> {
        if self.handle.is_some() {
            return Err(common::Error::Monitor("monitor already running".into()));
        }

        self.stop_flag.store(false, Ordering::SeqCst);
        let stop_flag = Arc::clone(&self.stop_flag);
        let interval = self.interval;

        let handle = std::thread::Builder::new()
            .name("device-monitor".to_string())
            .spawn(move || {
                // Devices present at start are not replayed as events;
                // only changes from here on are reported.
                let mut known: HashMap<String, DeviceInfo> =
                    match scan_usb_partitions(Path::new("/sys/block")) {
                        Ok(devices) => devices
                            .into_iter()
                            .map(|d| (d.bus_path.clone(), d))
                            .collect(),
                        Err(e) => {
                            warn!("Initial device scan failed: {}", e);
                            HashMap::new()
                        }
                    };

                while !stop_flag.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);

                    let current = match scan_usb_partitions(Path::new("/sys/block")) {
                        Ok(devices) => devices,
                        Err(e) => {
                            warn!("Device scan failed: {}", e);
                            continue;
                        }
                    };

                    let mut seen: HashMap<String, DeviceInfo> = HashMap::new();
                    for device in current {
                        seen.insert(device.bus_path.clone(), device);
                    }

                    for (bus_path, device) in &seen {
                        if !known.contains_key(bus_path) {
                            debug!("Monitor: device added: {}", device);
                            if sink.added(device.clone()).is_err() {
                                return; // consumer gone
                            }
                        }
                    }
                    for bus_path in known.keys() {
                        if !seen.contains_key(bus_path) {
                            debug!("Monitor: device removed: {}", bus_path);
                            if sink.removed(bus_path.clone()).is_err() {
                                return;
                            }
                        }
                    }

                    known = seen;
                }
            })
            .map_err(|e| common::Error::Monitor(format!("failed to spawn monitor: {}", e)))?;

        self.handle = Some(handle);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("Monitor thread panicked");
        }
    }
}

impl Drop for SysfsMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Scan a sysfs block directory for removable USB partitions.
fn scan_usb_partitions(sys_block: &Path) -> Result<Vec<DeviceInfo>> {
    let mut devices = Vec::new();

    let entries = match fs::read_dir(sys_block) {
        Ok(entries) => entries,
        Err(e) => {
            return Err(common::Error::Monitor(format!(
                "cannot read {}: {}",
                sys_block.display(),
                e
            )));
        }
    };

    for entry in entries.flatten() {
        let disk_name = entry.file_name().to_string_lossy().to_string();
        let disk_dir = entry.path();

        if !is_removable(&disk_dir) {
            continue;
        }

        // Resolve the symlink to the full physical topology path.
        let physical = match fs::canonicalize(&disk_dir) {
            Ok(p) => p.to_string_lossy().to_string(),
            Err(_) => continue,
        };
        let Some(bus_prefix) = usb_interface_prefix(&physical) else {
            continue; // not attached through USB
        };

        // Partitions live as subdirectories named after the disk.
        let mut partitions = Vec::new();
        for sub in fs::read_dir(&disk_dir).into_iter().flatten().flatten() {
            let part_name = sub.file_name().to_string_lossy().to_string();
            if part_name.starts_with(&disk_name) && sub.path().join("partition").exists() {
                partitions.push(part_name);
            }
        }

        // One identity per physical socket: the lowest-numbered
        // partition stands for the stick.
        if let Some(part_name) = primary_partition(partitions) {
            let node = format!("/dev/{}", part_name);
            let label = label_for_node(Path::new("/dev/disk/by-label"), &node);
            devices.push(DeviceInfo::new(&bus_prefix, node, label));
        }
    }

    Ok(devices)
}

/// Pick the partition that represents the stick. Directory order is not
/// stable, so sort; length-first ordering keeps `sdb2` ahead of
/// `sdb10`.
fn primary_partition(mut names: Vec<String>) -> Option<String> {
    names.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    names.into_iter().next()
}

fn is_removable(disk_dir: &Path) -> bool {
    fs::read_to_string(disk_dir.join("removable"))
        .map(|s| s.trim() == "1")
        .unwrap_or(false)
}

/// Truncate a physical sysfs path at the USB interface segment
/// (`<bus>-<ports>:<config>.<interface>`). Returns `None` when the path
/// does not go through USB.
pub fn usb_interface_prefix(physical_path: &str) -> Option<String> {
    let mut prefix = String::new();
    for segment in physical_path.split('/') {
        if segment.is_empty() {
            continue;
        }
        prefix.push('/');
        prefix.push_str(segment);
        if is_usb_interface_segment(segment) {
            return Some(prefix);
        }
    }
    None
}

/// `2-1.2.2:1.0` style: hub chain, colon, config.interface.
fn is_usb_interface_segment(segment: &str) -> bool {
    let Some((chain, interface)) = segment.split_once(':') else {
        return false;
    };
    let chain_ok = chain.split_once('-').is_some_and(|(bus, ports)| {
        !bus.is_empty()
            && bus.chars().all(|c| c.is_ascii_digit())
            && !ports.is_empty()
            && ports.split('.').all(|p| {
                !p.is_empty() && p.chars().all(|c| c.is_ascii_digit())
            })
    });
    let interface_ok = interface
        .split('.')
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
    chain_ok && interface_ok
}

/// Look up the filesystem label for a device node via the by-label
/// symlink directory.
fn label_for_node(by_label_dir: &Path, node: &str) -> Option<String> {
    for entry in fs::read_dir(by_label_dir).ok()?.flatten() {
        let target = fs::canonicalize(entry.path()).ok()?;
        if target.to_string_lossy() == node {
            return Some(entry.file_name().to_string_lossy().to_string());
        }
    }
    None
}
