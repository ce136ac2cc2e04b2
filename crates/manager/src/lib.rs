//! ustick-copy manager
//!
//! Orchestration for automatic mass-copying onto hot-plugged USB
//! sticks: configuration, the external command seam, the device monitor
//! boundary, the per-stick worker and the system manager.

pub mod command;
pub mod config;
pub mod monitor;
pub mod stick;
pub mod system;

pub use command::{CommandRunner, SystemCommandRunner};
pub use config::{Config, PortMap};
pub use monitor::{DeviceMonitor, SysfsMonitor};
pub use stick::{StickWorker, UsbStick, WorkerOutcome};
pub use system::{Mode, SystemManager};
