//! Warden supervises QEMU hypervisor processes.
//!
//! For every virtual machine it manages, the crate spawns (or adopts) a
//! `qemu-system-*` process, keeps a bidirectional control channel over the
//! instance's QMP Unix socket, tracks lifecycle state from status queries and
//! asynchronous events, and exposes start, pause, resume, reset, graceful and
//! forced shutdown, key injection, block queries, and handoff of
//! already-accepted VNC/SPICE client sockets via `SCM_RIGHTS`.
//!
//! Start a new instance:
//!
//! ```no_run
//! use std::time::Duration;
//! use warden::{DiskBackend, DiskConfig, Instance, VmConfig};
//!
//! # fn main() -> warden::Result<()> {
//! let mut config = VmConfig::default();
//! config.name = "builder".to_string();
//! config.disks.push(DiskConfig {
//!     id: "disk0".to_string(),
//!     backend: DiskBackend::File {
//!         path: "/var/lib/warden/builder.qcow2".into(),
//!         format: "qcow2".to_string(),
//!         auto_read_only: false,
//!     },
//!     ..Default::default()
//! });
//!
//! let instance = Instance::start(&config)?;
//! instance.stop(Duration::from_secs(30))?;
//! # Ok(())
//! # }
//! ```
//!
//! Or adopt one that is already running:
//!
//! ```no_run
//! # fn main() -> warden::Result<()> {
//! let instance = warden::Instance::attach("/var/run/qemu/builder.sock")?;
//! println!("{} is {}", instance.name(), instance.state());
//! # Ok(())
//! # }
//! ```
//!
//! The control socket for spawned instances lives at
//! `<socket_dir>/<name>.sock`, where the directory defaults to
//! `/var/run/qemu` for root and the user cache directory otherwise.

mod builder;
mod cancel;
mod client;
mod config;
mod disk;
mod error;
mod guest;
mod instance;
mod locate;
mod network;
mod pci;
mod qmp;
mod state;

pub use builder::CommandBuilder;
pub use cancel::CancelToken;
pub use config::*;
pub use disk::*;
pub use error::{Error, Result};
pub use guest::{BlockInfo, InsertedMedia};
pub use instance::Instance;
pub use locate::{locate_qemu, qemu_arch_name, supported_arches};
pub use network::*;
pub use pci::SlotAllocator;
pub use qmp::{QmpClient, QmpEvent};
pub use state::VmState;
