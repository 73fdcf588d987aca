use std::os::unix::io::RawFd;
use std::path::PathBuf;

use crate::pci::SlotAllocator;

/// A guest NIC: a host-side backend lowered to one `-netdev` option string
/// plus the frontend device bound to it.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Netdev id; the device id becomes `<id>-device`.
    pub id: String,
    pub backend: NetBackend,
    /// NIC model; defaults to `virtio-net-pci`.
    pub model: Option<String>,
    pub mac_addr: Option<String>,
    /// Boot priority for network boot.
    pub boot_index: Option<u32>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            id: "net0".to_string(),
            backend: NetBackend::User(UserNetConfig::default()),
            model: None,
            mac_addr: None,
            boot_index: None,
        }
    }
}

/// Host-side network backends. Closed set; each lowers to one `-netdev`
/// option string.
#[derive(Debug, Clone)]
pub enum NetBackend {
    User(UserNetConfig),
    Tap(TapNetConfig),
    Socket(SocketNetConfig),
    Stream(StreamNetConfig),
    Vde(VdeNetConfig),
    Bridge(BridgeNetConfig),
}

/// User-mode (slirp) NAT networking.
#[derive(Debug, Clone, Default)]
pub struct UserNetConfig {
    /// Port forwards, e.g. `tcp::2222-:22`.
    pub hostfwd: Vec<String>,
    /// Guest network, e.g. `10.0.2.0/24`.
    pub net: Option<String>,
    /// Host address inside the guest network.
    pub host: Option<String>,
    pub dns: Option<String>,
    pub dhcp_start: Option<String>,
    /// Isolate the guest from the host network.
    pub restrict: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TapNetConfig {
    pub ifname: Option<String>,
    pub bridge: Option<String>,
    /// Up script; `no` disables.
    pub script: Option<String>,
    pub down_script: Option<String>,
    pub vhost: bool,
    /// Queue count for multiqueue; emitted when above one.
    pub queues: Option<u32>,
    /// Pre-opened TAP descriptor. The number is embedded in the option
    /// string; the caller must keep the descriptor inheritable across exec.
    pub fd: Option<RawFd>,
}

#[derive(Debug, Clone, Default)]
pub struct SocketNetConfig {
    pub path: Option<PathBuf>,
    /// Listen instead of connect.
    pub server: bool,
}

/// Stream socket backend (QEMU 7.2+).
#[derive(Debug, Clone, Default)]
pub struct StreamNetConfig {
    pub path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub server: bool,
    /// Client-side reconnect interval in seconds.
    pub reconnect: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct VdeNetConfig {
    pub sock: Option<PathBuf>,
    pub port: Option<u32>,
    pub group: Option<String>,
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct BridgeNetConfig {
    pub bridge: Option<String>,
    /// Bridge helper binary path.
    pub helper: Option<PathBuf>,
}

impl NetBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            NetBackend::User(_) => "user",
            NetBackend::Tap(_) => "tap",
            NetBackend::Socket(_) => "socket",
            NetBackend::Stream(_) => "stream",
            NetBackend::Vde(_) => "vde",
            NetBackend::Bridge(_) => "bridge",
        }
    }

    /// Lowers the backend to its `-netdev` argument pair.
    pub fn netdev_args(&self, id: &str) -> Vec<String> {
        let mut parts = vec![self.kind().to_string(), format!("id={id}")];
        match self {
            NetBackend::User(cfg) => {
                if let Some(net) = &cfg.net {
                    parts.push(format!("net={net}"));
                }
                if let Some(host) = &cfg.host {
                    parts.push(format!("host={host}"));
                }
                if let Some(dns) = &cfg.dns {
                    parts.push(format!("dns={dns}"));
                }
                if let Some(start) = &cfg.dhcp_start {
                    parts.push(format!("dhcpstart={start}"));
                }
                if cfg.restrict {
                    parts.push("restrict=on".to_string());
                }
                for fwd in &cfg.hostfwd {
                    parts.push(format!("hostfwd={fwd}"));
                }
            }
            NetBackend::Tap(cfg) => {
                if let Some(ifname) = &cfg.ifname {
                    parts.push(format!("ifname={ifname}"));
                }
                if let Some(bridge) = &cfg.bridge {
                    parts.push(format!("br={bridge}"));
                }
                if let Some(script) = &cfg.script {
                    parts.push(format!("script={script}"));
                }
                if let Some(script) = &cfg.down_script {
                    parts.push(format!("downscript={script}"));
                }
                if cfg.vhost {
                    parts.push("vhost=on".to_string());
                }
                if let Some(queues) = cfg.queues {
                    if queues > 1 {
                        parts.push(format!("queues={queues}"));
                    }
                }
                if let Some(fd) = cfg.fd {
                    parts.push(format!("fd={fd}"));
                }
            }
            NetBackend::Socket(cfg) => {
                if let Some(path) = &cfg.path {
                    if cfg.server {
                        parts.push(format!("listen={}", path.display()));
                    } else {
                        parts.push(format!("connect={}", path.display()));
                    }
                }
            }
            NetBackend::Stream(cfg) => {
                parts.push(if cfg.server {
                    "server=on".to_string()
                } else {
                    "server=off".to_string()
                });
                if let Some(path) = &cfg.path {
                    parts.push("addr.type=unix".to_string());
                    parts.push(format!("addr.path={}", path.display()));
                } else if let Some(host) = &cfg.host {
                    parts.push("addr.type=inet".to_string());
                    parts.push(format!("addr.host={host}"));
                    if let Some(port) = cfg.port {
                        parts.push(format!("addr.port={port}"));
                    }
                }
                if let Some(reconnect) = cfg.reconnect {
                    if !cfg.server {
                        parts.push(format!("reconnect={reconnect}"));
                    }
                }
            }
            NetBackend::Vde(cfg) => {
                if let Some(sock) = &cfg.sock {
                    parts.push(format!("sock={}", sock.display()));
                }
                if let Some(port) = cfg.port {
                    parts.push(format!("port={port}"));
                }
                if let Some(group) = &cfg.group {
                    parts.push(format!("group={group}"));
                }
                if let Some(mode) = &cfg.mode {
                    parts.push(format!("mode={mode}"));
                }
            }
            NetBackend::Bridge(cfg) => {
                if let Some(bridge) = &cfg.bridge {
                    parts.push(format!("br={bridge}"));
                }
                if let Some(helper) = &cfg.helper {
                    parts.push(format!("helper={}", helper.display()));
                }
            }
        }
        vec!["-netdev".to_string(), parts.join(",")]
    }
}

/// NIC models whose frontend sits directly on the PCI bus.
fn model_wants_pci_slot(model: &str) -> bool {
    matches!(model, "virtio-net-pci" | "e1000" | "e1000e" | "rtl8139")
}

impl NetworkConfig {
    /// Lowers the NIC to its netdev and device argument pairs.
    pub(crate) fn args(&self, alloc: &mut SlotAllocator) -> Vec<String> {
        let mut args = self.backend.netdev_args(&self.id);

        let model = self.model.as_deref().unwrap_or("virtio-net-pci");
        let mut device = format!("{model},netdev={},id={}-device", self.id, self.id);
        if let Some(mac) = &self.mac_addr {
            device.push_str(&format!(",mac={mac}"));
        }
        if model_wants_pci_slot(model) {
            device.push_str(&format!(",bus={},addr={}", alloc.bus(), alloc.alloc()));
        }
        if let Some(index) = self.boot_index {
            device.push_str(&format!(",bootindex={index}"));
        }

        args.push("-device".to_string());
        args.push(device);
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_backend_lists_forwards_and_topology() {
        let backend = NetBackend::User(UserNetConfig {
            hostfwd: vec!["tcp::2222-:22".to_string(), "tcp::8080-:80".to_string()],
            net: Some("10.0.2.0/24".to_string()),
            host: Some("10.0.2.2".to_string()),
            dns: Some("10.0.2.3".to_string()),
            dhcp_start: Some("10.0.2.15".to_string()),
            restrict: true,
        });
        let args = backend.netdev_args("net0");
        assert_eq!(args[0], "-netdev");
        assert_eq!(
            args[1],
            "user,id=net0,net=10.0.2.0/24,host=10.0.2.2,dns=10.0.2.3,dhcpstart=10.0.2.15,restrict=on,hostfwd=tcp::2222-:22,hostfwd=tcp::8080-:80"
        );
    }

    #[test]
    fn tap_backend_embeds_preopened_fd() {
        let backend = NetBackend::Tap(TapNetConfig {
            ifname: Some("tap0".to_string()),
            bridge: Some("br0".to_string()),
            script: Some("no".to_string()),
            down_script: Some("no".to_string()),
            vhost: true,
            queues: Some(4),
            fd: Some(23),
        });
        let line = backend.netdev_args("net0")[1].clone();
        assert_eq!(
            line,
            "tap,id=net0,ifname=tap0,br=br0,script=no,downscript=no,vhost=on,queues=4,fd=23"
        );
    }

    #[test]
    fn tap_single_queue_stays_implicit() {
        let backend = NetBackend::Tap(TapNetConfig {
            queues: Some(1),
            ..Default::default()
        });
        assert_eq!(backend.netdev_args("net0")[1], "tap,id=net0");
    }

    #[test]
    fn stream_backend_over_unix_socket() {
        let backend = NetBackend::Stream(StreamNetConfig {
            path: Some(PathBuf::from("/tmp/test.sock")),
            server: true,
            ..Default::default()
        });
        assert_eq!(
            backend.netdev_args("net0")[1],
            "stream,id=net0,server=on,addr.type=unix,addr.path=/tmp/test.sock"
        );
    }

    #[test]
    fn stream_client_reconnects_over_tcp() {
        let backend = NetBackend::Stream(StreamNetConfig {
            host: Some("192.168.1.1".to_string()),
            port: Some(5000),
            server: false,
            reconnect: Some(10),
            ..Default::default()
        });
        assert_eq!(
            backend.netdev_args("net0")[1],
            "stream,id=net0,server=off,addr.type=inet,addr.host=192.168.1.1,addr.port=5000,reconnect=10"
        );
    }

    #[test]
    fn socket_backend_picks_listen_or_connect() {
        let server = NetBackend::Socket(SocketNetConfig {
            path: Some(PathBuf::from("/tmp/vlan.sock")),
            server: true,
        });
        assert_eq!(
            server.netdev_args("net0")[1],
            "socket,id=net0,listen=/tmp/vlan.sock"
        );
        let client = NetBackend::Socket(SocketNetConfig {
            path: Some(PathBuf::from("/tmp/vlan.sock")),
            server: false,
        });
        assert_eq!(
            client.netdev_args("net0")[1],
            "socket,id=net0,connect=/tmp/vlan.sock"
        );
    }

    #[test]
    fn bridge_backend_names_helper() {
        let backend = NetBackend::Bridge(BridgeNetConfig {
            bridge: Some("br0".to_string()),
            helper: Some(PathBuf::from("/usr/lib/qemu/qemu-bridge-helper")),
        });
        assert_eq!(
            backend.netdev_args("net0")[1],
            "bridge,id=net0,br=br0,helper=/usr/lib/qemu/qemu-bridge-helper"
        );
    }

    #[test]
    fn device_line_allocates_pci_slot_for_virtio() {
        let mut alloc = SlotAllocator::new(true);
        let nic = NetworkConfig {
            id: "net0".to_string(),
            backend: NetBackend::User(UserNetConfig {
                hostfwd: vec!["tcp::22-:22".to_string()],
                ..Default::default()
            }),
            model: Some("virtio-net-pci".to_string()),
            mac_addr: Some("52:54:00:12:34:56".to_string()),
            boot_index: Some(2),
        };
        let args = nic.args(&mut alloc);
        assert_eq!(
            args[3],
            "virtio-net-pci,netdev=net0,id=net0-device,mac=52:54:00:12:34:56,bus=pcie.0,addr=0x3,bootindex=2"
        );
    }

    #[test]
    fn vfio_style_models_skip_slot_allocation() {
        let mut alloc = SlotAllocator::new(true);
        let nic = NetworkConfig {
            id: "net0".to_string(),
            backend: NetBackend::User(UserNetConfig::default()),
            model: Some("virtio-net-device".to_string()),
            ..Default::default()
        };
        let args = nic.args(&mut alloc);
        assert_eq!(args[3], "virtio-net-device,netdev=net0,id=net0-device");
        assert_eq!(alloc.alloc(), "0x3");
    }
}
