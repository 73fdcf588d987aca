use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::disk::{CdRomConfig, DiskConfig};
use crate::error::{Error, Result};
use crate::network::NetworkConfig;

/// Configuration for a virtual machine.
///
/// The default value carries the recommended baseline: a Q35 machine with
/// KVM acceleration, one host-model vCPU, 1 GiB of memory, no display, and
/// QEMU's default devices disabled. Every field can be overridden before the
/// instance is started.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Instance name. Generated when empty.
    pub name: String,
    /// Target architecture (`x86_64`, `aarch64`, ...). Defaults to the host.
    pub arch: String,
    /// Explicit path to the QEMU binary or its directory.
    pub qemu_path: Option<PathBuf>,
    /// Directory for control sockets. Defaults per [`VmConfig::socket_dir`].
    pub socket_dir: Option<PathBuf>,
    pub machine: Option<MachineConfig>,
    pub cpu: Option<CpuConfig>,
    pub memory: Option<MemoryConfig>,
    pub efi: Option<EfiConfig>,
    pub boot: Option<BootConfig>,
    pub disks: Vec<DiskConfig>,
    pub cdroms: Vec<CdRomConfig>,
    pub networks: Vec<NetworkConfig>,
    pub display: Option<DisplayConfig>,
    pub audio: Option<AudioConfig>,
    pub serials: Vec<SerialConfig>,
    pub chardevs: Vec<ChardevConfig>,
    pub virtio_serial: Option<VirtioSerialConfig>,
    pub usb: Option<UsbControllerConfig>,
    pub usb_devices: Vec<UsbDeviceConfig>,
    pub balloon: bool,
    pub rtc: Option<RtcConfig>,
    pub secrets: Vec<SecretConfig>,
    /// Emit `-no-user-config -nodefaults`.
    pub no_defaults: bool,
    /// Raw arguments appended after everything the composer emits.
    pub extra_args: Vec<String>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            arch: String::new(),
            qemu_path: None,
            socket_dir: None,
            machine: Some(MachineConfig {
                kind: "q35".to_string(),
                accel: Some("kvm".to_string()),
                ..Default::default()
            }),
            cpu: Some(CpuConfig {
                model: Some("host".to_string()),
                sockets: 1,
                cores: 1,
                threads: 1,
                features: Vec::new(),
            }),
            memory: Some(MemoryConfig {
                size: 1024,
                backend: None,
                mem_lock: false,
            }),
            efi: None,
            boot: None,
            disks: Vec::new(),
            cdroms: Vec::new(),
            networks: Vec::new(),
            display: Some(DisplayConfig {
                kind: DisplayKind::None,
                video: None,
            }),
            audio: None,
            serials: Vec::new(),
            chardevs: Vec::new(),
            virtio_serial: None,
            usb: None,
            usb_devices: Vec::new(),
            balloon: false,
            rtc: None,
            secrets: Vec::new(),
            no_defaults: true,
            extra_args: Vec::new(),
        }
    }
}

impl VmConfig {
    /// Rejects configurations that cannot possibly boot. Runs before any
    /// filesystem or process work during [`Instance::start`].
    ///
    /// [`Instance::start`]: crate::Instance::start
    pub fn validate(&self) -> Result<()> {
        if let Some(memory) = &self.memory {
            if memory.size == 0 {
                return Err(Error::invalid_config("memory size must be positive"));
            }
        }
        for disk in &self.disks {
            if disk.id.is_empty() {
                return Err(Error::invalid_config("disk id must not be empty"));
            }
        }
        Ok(())
    }

    /// Directory the control socket lives in: the configured override,
    /// `/var/run/qemu` for root, or the user cache directory otherwise.
    pub fn socket_dir(&self) -> Result<PathBuf> {
        match &self.socket_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_socket_dir(),
        }
    }

    pub(crate) fn ensure_socket_dir(&self) -> Result<PathBuf> {
        let dir = self.socket_dir()?;
        std::fs::create_dir_all(&dir).map_err(|err| {
            Error::spawn(format!(
                "failed to create socket directory {}: {err}",
                dir.display()
            ))
        })?;
        Ok(dir)
    }

    /// Adds a guest-agent chardev plus the matching virtio-serial port.
    pub fn with_guest_agent(&mut self, socket_path: impl AsRef<Path>) -> &mut Self {
        self.chardevs.push(ChardevConfig {
            id: "qga0".to_string(),
            backend: "socket".to_string(),
            path: Some(socket_path.as_ref().to_path_buf()),
            server: true,
            wait: false,
            ..Default::default()
        });
        self.virtio_serial
            .get_or_insert_with(VirtioSerialConfig::default)
            .ports
            .push(VirtioSerialPortConfig {
                chardev: Some("qga0".to_string()),
                name: Some("org.qemu.guest_agent.0".to_string()),
                kind: None,
            });
        self
    }

    /// Adds a SPICE agent channel (`spicevmc` chardev + virtio-serial port).
    pub fn with_spice_agent(&mut self) -> &mut Self {
        self.chardevs.push(ChardevConfig {
            id: "vdagent0".to_string(),
            backend: "spicevmc".to_string(),
            name: Some("vdagent".to_string()),
            ..Default::default()
        });
        self.virtio_serial
            .get_or_insert_with(VirtioSerialConfig::default)
            .ports
            .push(VirtioSerialPortConfig {
                chardev: Some("vdagent0".to_string()),
                name: Some("com.redhat.spice.0".to_string()),
                kind: None,
            });
        self
    }

    /// Adds an XHCI controller (when absent) and a USB tablet for absolute
    /// pointer positioning.
    pub fn with_usb_tablet(&mut self) -> &mut Self {
        if self.usb.is_none() {
            self.usb = Some(UsbControllerConfig {
                kind: Some("qemu-xhci".to_string()),
            });
        }
        self.usb_devices.push(UsbDeviceConfig {
            kind: "usb-tablet".to_string(),
            chardev: None,
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct MachineConfig {
    /// Machine type, e.g. `q35`, `pc`, `virt`.
    pub kind: String,
    /// Accelerator, e.g. `kvm`, `tcg`, `hvf`.
    pub accel: Option<String>,
    pub usb: Option<bool>,
    pub dump_guest_core: Option<bool>,
    /// Node name backing pflash0 (UEFI code).
    pub pflash0: Option<String>,
    /// Node name backing pflash1 (UEFI variables).
    pub pflash1: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CpuConfig {
    /// CPU model, e.g. `host`, `qemu64`, `max`.
    pub model: Option<String>,
    /// Feature flags, e.g. `+aes`, `-svm`.
    pub features: Vec<String>,
    /// Topology dimensions; zero means one.
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

impl CpuConfig {
    pub fn vcpus(&self) -> u32 {
        self.sockets.max(1) * self.cores.max(1) * self.threads.max(1)
    }
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Memory size in MiB.
    pub size: u64,
    pub backend: Option<MemoryBackend>,
    /// Lock guest memory into host RAM (`-overcommit mem-lock=on`).
    pub mem_lock: bool,
}

#[derive(Debug, Clone)]
pub enum MemoryBackend {
    File {
        path: PathBuf,
        share: bool,
        prealloc: bool,
    },
    Memfd {
        share: bool,
    },
}

#[derive(Debug, Clone, Default)]
pub struct EfiConfig {
    /// Path to the UEFI code image (pflash0).
    pub code: PathBuf,
    /// Path to the writable UEFI variables image (pflash1).
    pub vars: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    /// Boot order string, e.g. `cdn`.
    pub order: Option<String>,
    pub menu: Option<bool>,
    pub strict: bool,
    pub kernel: Option<PathBuf>,
    pub initrd: Option<PathBuf>,
    pub append: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    pub kind: DisplayKind,
    pub video: Option<VideoConfig>,
}

#[derive(Debug, Clone)]
pub enum DisplayKind {
    None,
    Gtk,
    Sdl,
    /// VNC server; listener `none` means clients arrive via `add_client`.
    Vnc(VncConfig),
    Spice(SpiceConfig),
}

#[derive(Debug, Clone, Default)]
pub struct VncConfig {
    /// Listen spec (`:0`, `127.0.0.1:5900`, `none`). Defaults to `none`.
    pub listen: Option<String>,
    /// Enables password auth; the value itself is set over QMP.
    pub password: bool,
    /// Secret object id carrying the password.
    pub password_secret: Option<String>,
    pub lossy: bool,
    pub audiodev: Option<String>,
    pub websocket: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct SpiceConfig {
    /// Listen on a Unix socket instead of TCP.
    pub unix: bool,
    pub port: Option<u16>,
    pub password_secret: Option<String>,
    pub disable_ticketing: bool,
    pub image_compression: Option<String>,
    pub jpeg_wan_compression: Option<String>,
    pub zlib_glz_wan_compression: Option<String>,
    pub playback_compression: bool,
    pub seamless_migration: bool,
    pub disable_copy_paste: bool,
}

#[derive(Debug, Clone, Default)]
pub struct VideoConfig {
    /// Device type: `qxl-vga`, `virtio-vga`, `vga`, `cirrus`.
    pub kind: String,
    /// VGA memory in MiB.
    pub vga_mem: Option<u32>,
    /// QXL RAM size in bytes.
    pub ram: Option<u64>,
    /// QXL VRAM size in bytes.
    pub vram: Option<u64>,
    pub max_outputs: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct AudioConfig {
    /// Backend: `spice`, `pa`, `alsa`.
    pub backend: Option<String>,
    /// Sound device: `intel-hda`, `ich9-intel-hda`, `ac97`.
    pub device: Option<String>,
    /// Codec child for HDA devices: `hda-duplex`, `hda-micro`, `hda-output`.
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SerialConfig {
    /// Chardev backend: `socket`, `pty`, `file`, `pipe`.
    pub backend: String,
    pub path: Option<PathBuf>,
    pub server: bool,
    pub wait: bool,
    /// Guest-side device; defaults to `isa-serial`.
    pub device: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChardevConfig {
    pub id: String,
    pub backend: String,
    pub path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub server: bool,
    pub wait: bool,
    /// Reconnect interval in seconds.
    pub reconnect: Option<u32>,
    /// Channel name for `spicevmc` chardevs.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct VirtioSerialConfig {
    pub max_ports: Option<u32>,
    pub ports: Vec<VirtioSerialPortConfig>,
}

#[derive(Debug, Clone, Default)]
pub struct VirtioSerialPortConfig {
    pub chardev: Option<String>,
    /// Port name visible to the guest, e.g. `org.qemu.guest_agent.0`.
    pub name: Option<String>,
    /// `virtserialport` (default) or `virtconsole`.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UsbControllerConfig {
    /// Controller type; defaults to `qemu-xhci`.
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UsbDeviceConfig {
    /// Device type: `usb-tablet`, `usb-kbd`, `usb-redir`, ...
    pub kind: String,
    /// Chardev id for redirection devices.
    pub chardev: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RtcConfig {
    /// `utc`, `localtime`, or a datetime.
    pub base: Option<String>,
    /// `host`, `rt`, or `vm`.
    pub clock: Option<String>,
    /// `slew` or `none`.
    pub driftfix: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SecretConfig {
    pub id: String,
    pub data: Option<String>,
    pub file: Option<PathBuf>,
    /// `raw` or `base64`.
    pub format: Option<String>,
}

/// Default control-socket directory: `/var/run/qemu` for root, the user
/// cache directory suffix otherwise.
pub fn default_socket_dir() -> Result<PathBuf> {
    if unsafe { libc::geteuid() } == 0 {
        return Ok(PathBuf::from("/var/run/qemu"));
    }
    user_cache_dir()
        .map(|cache| cache.join("warden"))
        .ok_or_else(|| Error::os("cannot determine user cache directory"))
}

fn user_cache_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CACHE_HOME") {
        if !dir.is_empty() {
            return Some(PathBuf::from(dir));
        }
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".cache"))
}

static NAME_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique instance name for configs that leave `name` empty.
pub(crate) fn generate_name() -> String {
    let counter = NAME_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.subsec_nanos())
        .unwrap_or(0);
    format!("vm-{:08x}{:04x}", nanos, counter & 0xffff)
}
