//! Channel bridges between the monitor callback, the event consumer,
//! the stick workers and the status display.
//!
//! Two single-consumer queues carry all cross-thread communication:
//! the device event queue (monitor -> system manager) and the status
//! relay (workers -> display). Producers enqueue without blocking; the
//! consumers drain with `recv_blocking()`. A `Shutdown` value is the
//! sentinel that ends a consumer loop.

use async_channel::{Receiver, Sender, unbounded};

use crate::device::DeviceInfo;

/// Add/remove notification from the device monitor.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A stick was plugged in.
    Added(DeviceInfo),
    /// A stick was removed; carries the bus path only since the node is
    /// already gone.
    Removed(String),
    /// Sentinel: stop the event consumer.
    Shutdown,
}

/// Worker progress tag, rendered in the status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusTag {
    Start,
    Fat32,
    Label,
    Mount,
    Copy,
    RmMeta,
    RmFiles,
    Done,
    Failed,
}

impl StatusTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusTag::Start => "start",
            StatusTag::Fat32 => "fat32",
            StatusTag::Label => "label",
            StatusTag::Mount => "mount",
            StatusTag::Copy => "copy",
            StatusTag::RmMeta => "rm-meta",
            StatusTag::RmFiles => "rm-files",
            StatusTag::Done => "done",
            StatusTag::Failed => "failed",
        }
    }
}

impl std::fmt::Display for StatusTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message on the status relay.
#[derive(Debug, Clone)]
pub enum StatusMessage {
    /// A worker reached a new phase.
    Update { bus_path: String, tag: StatusTag },
    /// A port number was assigned during mapping; teaches the display
    /// consumer the bus-path -> port association.
    PortAssigned { bus_path: String, port: u32 },
    /// Re-render the table without changing it.
    Redraw,
    /// Sentinel: stop the status consumer.
    Shutdown,
}

/// Producer handle for the device event queue.
///
/// The monitor callback runs on an arbitrary thread; its only
/// responsibility at the boundary is this non-blocking enqueue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Sender<DeviceEvent>,
}

impl EventSink {
    pub fn push(&self, event: DeviceEvent) -> crate::Result<()> {
        // Unbounded queue: try_send only fails when the consumer side
        // is gone.
        self.tx
            .try_send(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    pub fn added(&self, device: DeviceInfo) -> crate::Result<()> {
        self.push(DeviceEvent::Added(device))
    }

    pub fn removed(&self, bus_path: impl Into<String>) -> crate::Result<()> {
        self.push(DeviceEvent::Removed(bus_path.into()))
    }
}

/// Create the device event queue.
///
/// Returns the sink for producers and the receiver for the single
/// consumer thread.
pub fn create_event_queue() -> (EventSink, Receiver<DeviceEvent>) {
    let (tx, rx) = unbounded();
    (EventSink { tx }, rx)
}

/// Create the status relay.
pub fn create_status_relay() -> (Sender<StatusMessage>, Receiver<StatusMessage>) {
    unbounded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_queue_fifo_order() {
        let (sink, rx) = create_event_queue();

        sink.added(DeviceInfo::new("busA", "/dev/sdb1", None)).unwrap();
        sink.added(DeviceInfo::new("busB", "/dev/sdc1", None)).unwrap();
        sink.removed("busA").unwrap();
        sink.push(DeviceEvent::Shutdown).unwrap();

        match rx.recv_blocking().unwrap() {
            DeviceEvent::Added(d) => assert_eq!(d.bus_path, "busA"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv_blocking().unwrap() {
            DeviceEvent::Added(d) => assert_eq!(d.bus_path, "busB"),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv_blocking().unwrap() {
            DeviceEvent::Removed(path) => assert_eq!(path, "busA"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.recv_blocking().unwrap(),
            DeviceEvent::Shutdown
        ));
    }

    #[test]
    fn test_push_from_other_thread() {
        let (sink, rx) = create_event_queue();

        let producer = std::thread::spawn(move || {
            for i in 0..10 {
                sink.removed(format!("bus{}", i)).unwrap();
            }
            sink.push(DeviceEvent::Shutdown).unwrap();
        });

        let mut count = 0;
        loop {
            match rx.recv_blocking().unwrap() {
                DeviceEvent::Shutdown => break,
                DeviceEvent::Removed(path) => {
                    assert_eq!(path, format!("bus{}", count));
                    count += 1;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(count, 10);
        producer.join().unwrap();
    }

    #[test]
    fn test_push_fails_when_consumer_gone() {
        let (sink, rx) = create_event_queue();
        drop(rx);
        assert!(sink.removed("bus0").is_err());
    }

    #[test]
    fn test_status_tag_render() {
        assert_eq!(StatusTag::RmMeta.to_string(), "rm-meta");
        assert_eq!(StatusTag::Done.to_string(), "done");
    }
}
