//! System manager
//!
//! Top-level orchestrator: owns the mode state machine, the event-queue
//! consumer thread, the status-relay consumer thread and the table of
//! live stick workers. The event consumer is the only writer of the
//! port map and the worker table; the status consumer is the only
//! writer of the status table. All cross-thread traffic goes through
//! the two queues.

use crate::command::CommandRunner;
use crate::config::{Config, PortMap, StickSettings};
use crate::monitor::DeviceMonitor;
use crate::stick::{StickWorker, WorkerOutcome};
use async_channel::{Receiver, Sender};
use common::{
    DeviceEvent, DeviceInfo, Error, EventSink, PortTree, Result, StatusMessage, StatusTag,
    create_event_queue, create_status_relay, port_id, port_name,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Operating mode. Transitions only go idle -> working and
/// working -> idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Idle,
    /// Discover and number ports without touching the sticks.
    Mapping,
    /// Full mount/operate/unmount lifecycle per inserted stick.
    Copy,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Mode::Idle => "idle",
            Mode::Mapping => "mapping",
            Mode::Copy => "copy",
        })
    }
}

/// Next sequential port number: one past the highest assigned so far.
fn next_port_number(port_map: &PortMap) -> u32 {
    port_map.values().max().map_or(0, |max| max + 1)
}

/// One currently-attached stick with a live worker.
struct WorkerRecord {
    handle: JoinHandle<WorkerOutcome>,
    finished: Arc<AtomicBool>,
}

/// State handed back by the event consumer when it drains its sentinel.
struct EventOutcome {
    port_map: PortMap,
    workers: Vec<(String, WorkerRecord)>,
}

/// Single consumer of the device event queue. Sole owner and writer of
/// the port map and the worker table while the session runs.
struct EventConsumer {
    mode: Mode,
    port_map: PortMap,
    workers: HashMap<String, WorkerRecord>,
    relay_tx: Sender<StatusMessage>,
    runner: Arc<dyn CommandRunner>,
    settings: StickSettings,
    source_folder: PathBuf,
    mount_base: PathBuf,
    active: Arc<AtomicUsize>,
}

impl EventConsumer {
    fn run(mut self, rx: Receiver<DeviceEvent>) -> EventOutcome {
        loop {
            match rx.recv_blocking() {
                Ok(DeviceEvent::Added(device)) => self.handle_add(device),
                Ok(DeviceEvent::Removed(bus_path)) => self.handle_remove(&bus_path),
                Ok(DeviceEvent::Shutdown) | Err(_) => break,
            }
        }
        EventOutcome {
            port_map: self.port_map,
            workers: self.workers.drain().collect(),
        }
    }

    fn handle_add(&mut self, device: DeviceInfo) {
        if self.workers.contains_key(&device.bus_path) {
            warn!("Add event for already-tracked device: {}", device.bus_path);
            return;
        }

        match self.mode {
            Mode::Copy => self.start_worker(device),
            Mode::Mapping => self.map_port(&device),
            Mode::Idle => {
                warn!("Add event while idle, ignoring: {}", device.bus_path);
            }
        }
    }

    fn start_worker(&mut self, device: DeviceInfo) {
        let bus_path = device.bus_path.clone();
        let worker = StickWorker::new(
            device,
            &self.mount_base,
            self.source_folder.clone(),
            self.settings.clone(),
            Arc::clone(&self.runner),
            Some(self.relay_tx.clone()),
            Arc::clone(&self.active),
        );
        let finished = worker.finished_flag();

        match worker.spawn() {
            Ok(handle) => {
                debug!("Started worker for {}", bus_path);
                self.workers.insert(bus_path, WorkerRecord { handle, finished });
            }
            Err(e) => error!("Could not start worker for {}: {}", bus_path, e),
        }
    }

    fn map_port(&mut self, device: &DeviceInfo) {
        if self.port_map.contains_key(&device.bus_path) {
            debug!(
                "Port already mapped: {} -> {}",
                device.bus_path, self.port_map[&device.bus_path]
            );
            return;
        }

        let port = next_port_number(&self.port_map);
        self.port_map.insert(device.bus_path.clone(), port);
        info!(
            "Mapped port {} (id {}) -> {}",
            port_name(&device.bus_path),
            port_id(&device.bus_path),
            port
        );
        let _ = self.relay_tx.try_send(StatusMessage::PortAssigned {
            bus_path: device.bus_path.clone(),
            port,
        });
    }

    fn handle_remove(&mut self, bus_path: &str) {
        let Some(record) = self.workers.remove(bus_path) else {
            if self.mode == Mode::Copy {
                // The external layer may emit spurious removals; never
                // let them mutate anything.
                warn!("Remove event for untracked device: {}", bus_path);
            } else {
                debug!("Remove event (no worker in {} mode): {}", self.mode, bus_path);
            }
            return;
        };

        if !record.finished.load(Ordering::SeqCst) {
            // Operator error: the stick was pulled while its worker was
            // still going. There is no cancellation; wait it out.
            warn!(
                "Device removed before its worker finished: {} -- waiting for completion",
                bus_path
            );
            let _ = self.relay_tx.try_send(StatusMessage::Update {
                bus_path: bus_path.to_string(),
                tag: StatusTag::Failed,
            });
        }

        match record.handle.join() {
            Ok(WorkerOutcome::Done) => debug!("Worker finished for {}", bus_path),
            Ok(WorkerOutcome::Failed(reason)) => {
                warn!("Worker for {} ended failed: {}", bus_path, reason)
            }
            Err(_) => error!("Worker thread for {} panicked", bus_path),
        }
    }
}

/// Single consumer of the status relay. Sole owner of the status table;
/// the only thread that writes to the display.
struct StatusConsumer {
    /// bus path -> port number, seeded from the persisted port map and
    /// extended by PortAssigned messages during mapping.
    ports: HashMap<String, u32>,
    /// port number -> last-known status tag.
    table: BTreeMap<u32, String>,
}

impl StatusConsumer {
    fn new(port_map: &PortMap) -> Self {
        let ports: HashMap<String, u32> = port_map
            .iter()
            .map(|(bus_path, port)| (bus_path.clone(), *port))
            .collect();
        let table = ports.values().map(|port| (*port, "-".to_string())).collect();
        Self { ports, table }
    }

    fn run(mut self, rx: Receiver<StatusMessage>) {
        loop {
            match rx.recv_blocking() {
                Ok(StatusMessage::Update { bus_path, tag }) => {
                    match self.ports.get(&bus_path) {
                        Some(port) => {
                            self.table.insert(*port, tag.to_string());
                        }
                        None => {
                            warn!("Status for unmapped device: {} {}", bus_path, tag);
                        }
                    }
                    self.render();
                }
                Ok(StatusMessage::PortAssigned { bus_path, port }) => {
                    self.ports.insert(bus_path, port);
                    self.table.entry(port).or_insert_with(|| "-".to_string());
                    self.render();
                }
                Ok(StatusMessage::Redraw) => self.render(),
                Ok(StatusMessage::Shutdown) | Err(_) => break,
            }
        }
    }

    fn render_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.table.len() + 2);
        lines.push(format!("{:>4} | {:<8}", "port", "status"));
        lines.push("-----+---------".to_string());
        for (port, tag) in &self.table {
            lines.push(format!("{:>4} | {:<8}", port, tag));
        }
        lines
    }

    fn render(&self) {
        let mut output = String::new();
        for line in self.render_lines() {
            output.push_str(&line);
            output.push('\n');
        }
        print!("{}", output);
    }
}

/// Running session: the two consumer threads plus their senders.
struct Session {
    event_sink: EventSink,
    status_tx: Sender<StatusMessage>,
    event_handle: JoinHandle<EventOutcome>,
    status_handle: JoinHandle<()>,
}

pub struct SystemManager {
    config: Config,
    config_path: PathBuf,
    mode: Mode,
    runner: Arc<dyn CommandRunner>,
    monitor: Box<dyn DeviceMonitor>,
    active_workers: Arc<AtomicUsize>,
    session: Option<Session>,
}

impl SystemManager {
    pub fn new(
        config: Config,
        config_path: PathBuf,
        runner: Arc<dyn CommandRunner>,
        monitor: Box<dyn DeviceMonitor>,
    ) -> Self {
        Self {
            config,
            config_path,
            mode: Mode::Idle,
            runner,
            monitor,
            active_workers: Arc::new(AtomicUsize::new(0)),
            session: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Number of workers that have been started and not yet terminated.
    /// Shutdown blocks until this reaches zero.
    pub fn pending_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save_config(&self) -> anyhow::Result<()> {
        self.config.save(&self.config_path)
    }

    /// Currently attached sticks, straight from the monitor.
    pub fn attached_devices(&self) -> Result<Vec<DeviceInfo>> {
        self.monitor.enumerate()
    }

    /// Ask the status consumer to re-render the table.
    pub fn redraw(&self) {
        if let Some(session) = &self.session {
            let _ = session.status_tx.try_send(StatusMessage::Redraw);
        }
    }

    /// idle -> mapping: forget the old port map, then learn ports from
    /// scratch as sticks are inserted.
    pub fn start_mapping(&mut self) -> Result<()> {
        self.ensure_idle("mapping")?;
        self.config.port_map.clear();
        self.start_session(Mode::Mapping)
    }

    /// idle -> copy: reuse the previously learned port map.
    pub fn start_copy(&mut self) -> Result<()> {
        self.ensure_idle("copy")?;
        self.start_session(Mode::Copy)
    }

    fn ensure_idle(&self, target: &str) -> Result<()> {
        if self.mode != Mode::Idle {
            return Err(Error::ModeTransition(format!(
                "cannot enter {} mode while in {} mode; run 'done' first",
                target, self.mode
            )));
        }
        Ok(())
    }

    fn start_session(&mut self, mode: Mode) -> Result<()> {
        let (event_sink, event_rx) = create_event_queue();
        let (status_tx, status_rx) = create_status_relay();

        let status_consumer = StatusConsumer::new(&self.config.port_map);
        let status_handle = std::thread::Builder::new()
            .name("status-relay".to_string())
            .spawn(move || status_consumer.run(status_rx))
            .map_err(|e| Error::Other(format!("failed to spawn status consumer: {}", e)))?;

        let event_consumer = EventConsumer {
            mode,
            port_map: self.config.port_map.clone(),
            workers: HashMap::new(),
            relay_tx: status_tx.clone(),
            runner: Arc::clone(&self.runner),
            settings: self.config.stick.clone(),
            source_folder: self.config.source_folder_path(),
            mount_base: self.config.mount_base_path(),
            active: Arc::clone(&self.active_workers),
        };
        let event_handle = std::thread::Builder::new()
            .name("event-queue".to_string())
            .spawn(move || event_consumer.run(event_rx))
            .map_err(|e| Error::Other(format!("failed to spawn event consumer: {}", e)))?;

        if let Err(e) = self.monitor.start(event_sink.clone()) {
            // Roll the consumers back down before reporting.
            let _ = event_sink.push(DeviceEvent::Shutdown);
            let _ = status_tx.try_send(StatusMessage::Shutdown);
            let _ = event_handle.join();
            let _ = status_handle.join();
            return Err(e);
        }

        self.session = Some(Session {
            event_sink,
            status_tx,
            event_handle,
            status_handle,
        });
        self.mode = mode;
        info!("Entered {} mode", mode);
        Ok(())
    }

    /// working -> idle. Stops the monitor first so no new events are
    /// admitted, drains both consumers via their sentinels, then waits
    /// for every still-running worker. No timeout: completing in-flight
    /// sticks wins over prompt shutdown.
    pub fn stop(&mut self) -> Result<()> {
        if self.mode == Mode::Idle {
            return Err(Error::ModeTransition(
                "not in a working mode; nothing to stop".to_string(),
            ));
        }
        let Some(session) = self.session.take() else {
            self.mode = Mode::Idle;
            return Err(Error::Other("mode active but session missing".to_string()));
        };

        self.monitor.stop();

        let _ = session.event_sink.push(DeviceEvent::Shutdown);
        let _ = session.status_tx.try_send(StatusMessage::Shutdown);

        let outcome = session
            .event_handle
            .join()
            .map_err(|_| Error::Other("event consumer panicked".to_string()))?;
        if session.status_handle.join().is_err() {
            error!("Status consumer panicked");
        }

        for (bus_path, record) in outcome.workers {
            if !record.finished.load(Ordering::SeqCst) {
                info!("Waiting for worker on {} to finish...", bus_path);
            }
            match record.handle.join() {
                Ok(WorkerOutcome::Done) => debug!("Worker finished for {}", bus_path),
                Ok(WorkerOutcome::Failed(reason)) => {
                    warn!("Worker for {} ended failed: {}", bus_path, reason)
                }
                Err(_) => error!("Worker thread for {} panicked", bus_path),
            }
        }

        let stopped_mode = self.mode;
        self.config.port_map = outcome.port_map;
        self.mode = Mode::Idle;

        if stopped_mode == Mode::Mapping {
            self.print_mapping_summary();
            self.save_config()
                .map_err(|e| Error::Config(format!("could not persist port map: {:#}", e)))?;
        }

        info!("Back to idle mode");
        Ok(())
    }

    fn print_mapping_summary(&self) {
        println!("mapped {} port(s):", self.config.port_map.len());
        let mut by_port: Vec<(&u32, &String)> = self
            .config
            .port_map
            .iter()
            .map(|(bus_path, port)| (port, bus_path))
            .collect();
        by_port.sort();
        for (port, bus_path) in by_port {
            println!("  port {} <- {} ({})", port, port_name(bus_path), bus_path);
            if let Some(tree) = PortTree::from_id(&port_id(bus_path)) {
                for line in tree.to_string().lines() {
                    println!("    {}", line);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoRunSteps;
    use common::Result as CommonResult;

    struct OkRunner;
    impl CommandRunner for OkRunner {
        fn run(&self, _program: &str, _args: &[&str]) -> CommonResult<String> {
            Ok(String::new())
        }
    }

    fn mapping_consumer(relay_tx: Sender<StatusMessage>) -> EventConsumer {
        EventConsumer {
            mode: Mode::Mapping,
            port_map: PortMap::new(),
            workers: HashMap::new(),
            relay_tx,
            runner: Arc::new(OkRunner),
            settings: StickSettings::default(),
            source_folder: PathBuf::from("/tmp/source"),
            mount_base: std::env::temp_dir().join("ustick-test-mounts"),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn device(bus_path: &str) -> DeviceInfo {
        DeviceInfo::new(bus_path, "/dev/sdb1", None)
    }

    #[test]
    fn test_next_port_number() {
        let mut map = PortMap::new();
        assert_eq!(next_port_number(&map), 0);
        map.insert("a".to_string(), 0);
        map.insert("b".to_string(), 1);
        map.insert("c".to_string(), 2);
        assert_eq!(next_port_number(&map), 3);
    }

    #[test]
    fn test_mapping_assigns_sequential_ports() {
        let (tx, rx) = create_status_relay();
        let mut consumer = mapping_consumer(tx);

        consumer.handle_add(device(".../usb2/2-1/2-1.2/2-1.2:1.0"));
        consumer.handle_add(device(".../usb2/2-1/2-1.3/2-1.3:1.0"));
        consumer.handle_add(device(".../usb2/2-1/2-1.2/2-1.2:1.0")); // re-insert

        assert_eq!(consumer.port_map.len(), 2);
        assert_eq!(consumer.port_map[".../usb2/2-1/2-1.2/2-1.2:1.0"], 0);
        assert_eq!(consumer.port_map[".../usb2/2-1/2-1.3/2-1.3:1.0"], 1);

        // One PortAssigned per newly-seen bus path.
        let mut assigned = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            if let StatusMessage::PortAssigned { port, .. } = msg {
                assigned.push(port);
            }
        }
        assert_eq!(assigned, vec![0, 1]);
    }

    #[test]
    fn test_mapping_with_preloaded_map_continues_numbering() {
        let (tx, _rx) = create_status_relay();
        let mut consumer = mapping_consumer(tx);
        consumer.port_map.insert("p0".into(), 0);
        consumer.port_map.insert("p1".into(), 1);
        consumer.port_map.insert("p2".into(), 2);

        consumer.handle_add(device(".../usb2/2-1/2-1.4/2-1.4:1.0"));
        assert_eq!(consumer.port_map[".../usb2/2-1/2-1.4/2-1.4:1.0"], 3);
    }

    #[test]
    fn test_remove_untracked_is_noop() {
        let (tx, rx) = create_status_relay();
        let mut consumer = mapping_consumer(tx);
        consumer.mode = Mode::Copy;
        consumer.port_map.insert("known".into(), 0);

        consumer.handle_remove("never-seen");

        assert!(consumer.workers.is_empty());
        assert_eq!(consumer.port_map.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_idle_mode_ignores_add() {
        let (tx, _rx) = create_status_relay();
        let mut consumer = mapping_consumer(tx);
        consumer.mode = Mode::Idle;

        consumer.handle_add(device(".../usb2/2-1/2-1.2/2-1.2:1.0"));
        assert!(consumer.port_map.is_empty());
        assert!(consumer.workers.is_empty());
    }

    #[test]
    fn test_copy_mode_spawns_and_remove_joins() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = create_status_relay();
        let mut consumer = mapping_consumer(tx);
        consumer.mode = Mode::Copy;
        consumer.mount_base = dir.path().to_path_buf();
        consumer.settings.auto_run_steps = AutoRunSteps::default();

        consumer.handle_add(device(".../usb2/2-1/2-1.2/2-1.2:1.0"));
        assert_eq!(consumer.workers.len(), 1);

        consumer.handle_remove(".../usb2/2-1/2-1.2/2-1.2:1.0");
        assert!(consumer.workers.is_empty());
        assert_eq!(consumer.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_event_consumer_processes_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let (sink, event_rx) = create_event_queue();
        let (tx, _status_rx) = create_status_relay();
        let mut consumer = mapping_consumer(tx);
        consumer.mode = Mode::Copy;
        consumer.mount_base = dir.path().to_path_buf();

        // add(A), add(B), remove(A) pushed before the consumer runs:
        // they must be consumed in exactly that order even though the
        // workers themselves run concurrently afterwards.
        sink.added(device("busA")).unwrap();
        sink.added(device("busB")).unwrap();
        sink.removed("busA").unwrap();
        sink.push(DeviceEvent::Shutdown).unwrap();

        let outcome = consumer.run(event_rx);

        // remove(A) was handled after add(A): only B is left tracked.
        assert_eq!(outcome.workers.len(), 1);
        assert_eq!(outcome.workers[0].0, "busB");
    }

    #[test]
    fn test_status_consumer_table() {
        let mut port_map = PortMap::new();
        port_map.insert("busA".to_string(), 0);
        let mut consumer = StatusConsumer::new(&port_map);

        assert_eq!(consumer.table[&0], "-");

        consumer.ports.insert("busB".to_string(), 1);
        consumer.table.insert(1, "-".to_string());
        consumer
            .table
            .insert(consumer.ports["busA"], StatusTag::Copy.to_string());

        let lines = consumer.render_lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].contains("0") && lines[2].contains("copy"));
        assert!(lines[3].contains("1") && lines[3].contains("-"));
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::Idle.to_string(), "idle");
        assert_eq!(Mode::Mapping.to_string(), "mapping");
        assert_eq!(Mode::Copy.to_string(), "copy");
    }
}
