use std::path::PathBuf;

use serde_json::json;

use crate::pci::SlotAllocator;

/// A disk attached to the guest: a storage backend lowered to modern
/// `-blockdev` layers plus the frontend device referencing the outermost
/// node.
#[derive(Debug, Clone)]
pub struct DiskConfig {
    /// Node and device id prefix.
    pub id: String,
    pub backend: DiskBackend,
    pub interface: DiskInterface,
    /// Boot priority; lower wins.
    pub boot_index: Option<u32>,
    pub throttle: Option<ThrottleConfig>,
    /// Serial number reported to the guest.
    pub serial: Option<String>,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            id: "disk0".to_string(),
            backend: DiskBackend::File {
                path: PathBuf::new(),
                format: String::new(),
                auto_read_only: false,
            },
            interface: DiskInterface::Virtio,
            boot_index: None,
            throttle: None,
            serial: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DiskInterface {
    #[default]
    Virtio,
    Scsi,
    Ide,
    Nvme,
}

impl DiskInterface {
    fn device_type(self) -> &'static str {
        match self {
            DiskInterface::Virtio => "virtio-blk-pci",
            DiskInterface::Scsi => "scsi-hd",
            DiskInterface::Ide => "ide-hd",
            DiskInterface::Nvme => "nvme",
        }
    }

    /// Interfaces whose frontend sits directly on the PCI bus and needs a
    /// slot from the allocator.
    fn wants_pci_slot(self) -> bool {
        matches!(self, DiskInterface::Virtio | DiskInterface::Nvme)
    }
}

/// Storage backends the composer knows how to lower. Closed set; each
/// variant emits its own blockdev node(s) under the naming convention
/// `<id>-<kind>` for the protocol node and `<id>-format` for the format
/// layer.
#[derive(Debug, Clone)]
pub enum DiskBackend {
    File {
        path: PathBuf,
        /// Image format; `raw` when empty.
        format: String,
        auto_read_only: bool,
    },
    Nbd {
        server: NbdServer,
        export: Option<String>,
        tls_creds: Option<String>,
    },
    Rbd {
        pool: String,
        image: String,
        snapshot: Option<String>,
        conf: Option<PathBuf>,
        user: Option<String>,
        key_secret: Option<String>,
        auth_client_required: Vec<String>,
    },
    Iscsi {
        /// Portal address, `host:port`.
        portal: String,
        target: String,
        lun: u32,
        user: Option<String>,
        password_secret: Option<String>,
        initiator_name: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum NbdServer {
    Unix { path: PathBuf },
    Tcp { host: String, port: Option<u16> },
}

impl DiskBackend {
    pub fn kind(&self) -> &'static str {
        match self {
            DiskBackend::File { .. } => "file",
            DiskBackend::Nbd { .. } => "nbd",
            DiskBackend::Rbd { .. } => "rbd",
            DiskBackend::Iscsi { .. } => "iscsi",
        }
    }

    /// Name of the outermost node this backend emits, before any throttle
    /// layer wraps it.
    pub fn final_node(&self, id: &str) -> String {
        match self {
            // iSCSI attaches the device straight to the protocol node.
            DiskBackend::Iscsi { .. } => format!("{id}-iscsi"),
            _ => format!("{id}-format"),
        }
    }

    /// Lowers the backend to its `-blockdev` argument pairs. The option
    /// payloads are compact JSON objects with keys in sorted order.
    pub fn blockdev_args(&self, id: &str) -> Vec<String> {
        match self {
            DiskBackend::File {
                path,
                format,
                auto_read_only,
            } => {
                let file_node = format!("{id}-file");
                let mut file_opts = json!({
                    "driver": "file",
                    "filename": path,
                    "node-name": file_node,
                });
                if *auto_read_only {
                    file_opts["auto-read-only"] = json!(true);
                }

                let format = if format.is_empty() { "raw" } else { format };
                let format_opts = json!({
                    "driver": format,
                    "file": file_node,
                    "node-name": format!("{id}-format"),
                });

                vec![
                    "-blockdev".to_string(),
                    file_opts.to_string(),
                    "-blockdev".to_string(),
                    format_opts.to_string(),
                ]
            }
            DiskBackend::Nbd {
                server,
                export,
                tls_creds,
            } => {
                let nbd_node = format!("{id}-nbd");
                let mut nbd_opts = json!({
                    "driver": "nbd",
                    "node-name": nbd_node,
                    "cache": { "direct": true, "no-flush": false },
                });
                match server {
                    NbdServer::Unix { path } => {
                        nbd_opts["server"] = json!({ "type": "unix", "path": path });
                    }
                    NbdServer::Tcp { host, port } => {
                        let mut addr = json!({ "type": "inet", "host": host });
                        if let Some(port) = port {
                            addr["port"] = json!(port.to_string());
                        }
                        nbd_opts["server"] = addr;
                    }
                }
                if let Some(export) = export {
                    nbd_opts["export"] = json!(export);
                }
                if let Some(creds) = tls_creds {
                    nbd_opts["tls-creds"] = json!(creds);
                }

                let format_opts = json!({
                    "driver": "raw",
                    "file": nbd_node,
                    "node-name": format!("{id}-format"),
                    "read-only": false,
                });

                vec![
                    "-blockdev".to_string(),
                    nbd_opts.to_string(),
                    "-blockdev".to_string(),
                    format_opts.to_string(),
                ]
            }
            DiskBackend::Rbd {
                pool,
                image,
                snapshot,
                conf,
                user,
                key_secret,
                auth_client_required,
            } => {
                let rbd_node = format!("{id}-rbd");
                let mut rbd_opts = json!({
                    "driver": "rbd",
                    "node-name": rbd_node,
                    "pool": pool,
                    "image": image,
                    "cache": { "direct": true, "no-flush": false },
                    "discard": "unmap",
                });
                if let Some(snapshot) = snapshot {
                    rbd_opts["snapshot"] = json!(snapshot);
                }
                if let Some(conf) = conf {
                    rbd_opts["conf"] = json!(conf);
                }
                if let Some(user) = user {
                    rbd_opts["user"] = json!(user);
                }
                if let Some(secret) = key_secret {
                    rbd_opts["key-secret"] = json!(secret);
                }
                if !auth_client_required.is_empty() {
                    rbd_opts["auth-client-required"] = json!(auth_client_required);
                }

                let format_opts = json!({
                    "driver": "raw",
                    "file": rbd_node,
                    "node-name": format!("{id}-format"),
                    "read-only": false,
                });

                vec![
                    "-blockdev".to_string(),
                    rbd_opts.to_string(),
                    "-blockdev".to_string(),
                    format_opts.to_string(),
                ]
            }
            DiskBackend::Iscsi {
                portal,
                target,
                lun,
                user,
                password_secret,
                initiator_name,
            } => {
                let mut iscsi_opts = json!({
                    "driver": "iscsi",
                    "node-name": format!("{id}-iscsi"),
                    "transport": "tcp",
                    "portal": portal,
                    "target": target,
                    "lun": lun,
                    "cache": { "direct": true, "no-flush": false },
                    "discard": "unmap",
                });
                if let Some(user) = user {
                    iscsi_opts["user"] = json!(user);
                }
                if let Some(secret) = password_secret {
                    iscsi_opts["password-secret"] = json!(secret);
                }
                if let Some(name) = initiator_name {
                    iscsi_opts["initiator-name"] = json!(name);
                }

                vec!["-blockdev".to_string(), iscsi_opts.to_string()]
            }
        }
    }
}

/// I/O limits applied through a shared throttle group and a throttle filter
/// node stacked on the disk's format layer.
#[derive(Debug, Clone, Default)]
pub struct ThrottleConfig {
    /// Throttle group object id; shared by every disk naming the same group.
    pub group: String,
    pub bps: u64,
    pub bps_read: u64,
    pub bps_write: u64,
    pub iops: u64,
    pub iops_read: u64,
    pub iops_write: u64,
    pub bps_max: u64,
    pub iops_max: u64,
    /// Burst duration in seconds, applied to both byte and IOPS bursts.
    pub burst_length: Option<u32>,
}

impl ThrottleConfig {
    pub fn group_object_args(&self) -> Vec<String> {
        if self.group.is_empty() {
            return Vec::new();
        }
        let mut parts = vec!["throttle-group".to_string(), format!("id={}", self.group)];
        let limits = [
            ("x-bps-total", self.bps),
            ("x-bps-read", self.bps_read),
            ("x-bps-write", self.bps_write),
            ("x-iops-total", self.iops),
            ("x-iops-read", self.iops_read),
            ("x-iops-write", self.iops_write),
            ("x-bps-total-max", self.bps_max),
            ("x-iops-total-max", self.iops_max),
        ];
        for (key, value) in limits {
            if value > 0 {
                parts.push(format!("{key}={value}"));
            }
        }
        if let Some(length) = self.burst_length {
            parts.push(format!("x-bps-total-max-length={length}"));
            parts.push(format!("x-iops-total-max-length={length}"));
        }
        vec!["-object".to_string(), parts.join(",")]
    }

    pub fn filter_blockdev_args(&self, node: &str, file_node: &str) -> Vec<String> {
        if self.group.is_empty() {
            return Vec::new();
        }
        let opts = json!({
            "driver": "throttle",
            "node-name": node,
            "file": file_node,
            "throttle-group": self.group,
        });
        vec!["-blockdev".to_string(), opts.to_string()]
    }
}

impl DiskConfig {
    /// Lowers the disk to throttle objects, blockdev layers, and the
    /// frontend device line.
    pub(crate) fn args(&self, alloc: &mut SlotAllocator) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(throttle) = &self.throttle {
            args.extend(throttle.group_object_args());
        }

        args.extend(self.backend.blockdev_args(&self.id));

        let mut final_node = self.backend.final_node(&self.id);
        if let Some(throttle) = &self.throttle {
            if !throttle.group.is_empty() {
                let throttle_node = format!("{}-throttle", self.id);
                args.extend(throttle.filter_blockdev_args(&throttle_node, &final_node));
                final_node = throttle_node;
            }
        }

        let mut device = format!(
            "{},drive={final_node},id={}-device",
            self.interface.device_type(),
            self.id
        );
        if self.interface.wants_pci_slot() {
            device.push_str(&format!(",bus={},addr={}", alloc.bus(), alloc.alloc()));
        }
        if let Some(index) = self.boot_index {
            device.push_str(&format!(",bootindex={index}"));
        }
        if let Some(serial) = &self.serial {
            device.push_str(&format!(",serial={serial}"));
        }

        args.push("-device".to_string());
        args.push(device);
        args
    }
}

/// A CD-ROM drive, attached as an `ide-cd` device behind the shared SATA
/// controller.
#[derive(Debug, Clone, Default)]
pub struct CdRomConfig {
    /// ISO image path.
    pub path: PathBuf,
    pub boot_index: Option<u32>,
}

impl CdRomConfig {
    pub(crate) fn args(&self, index: usize, sata_controller: &str) -> Vec<String> {
        if self.path.as_os_str().is_empty() {
            return Vec::new();
        }
        let id = format!("cdrom{index}");
        let drive = format!(
            "file={},format=raw,if=none,id={id},media=cdrom,readonly=on",
            self.path.display()
        );
        let mut device = format!("ide-cd,bus={sata_controller}.{index},drive={id},id={id}-device");
        if let Some(boot_index) = self.boot_index {
            device.push_str(&format!(",bootindex={boot_index}"));
        }
        vec![
            "-drive".to_string(),
            drive,
            "-device".to_string(),
            device,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(args: &[String]) -> String {
        args.join(" ")
    }

    #[test]
    fn file_backend_emits_two_layers() {
        let backend = DiskBackend::File {
            path: PathBuf::from("/var/lib/qemu/disk.qcow2"),
            format: "qcow2".to_string(),
            auto_read_only: true,
        };
        let args = backend.blockdev_args("disk0");
        assert_eq!(args.len(), 4);
        assert_eq!(args[0], "-blockdev");
        assert_eq!(
            args[1],
            r#"{"auto-read-only":true,"driver":"file","filename":"/var/lib/qemu/disk.qcow2","node-name":"disk0-file"}"#
        );
        assert_eq!(
            args[3],
            r#"{"driver":"qcow2","file":"disk0-file","node-name":"disk0-format"}"#
        );
        assert_eq!(backend.final_node("disk0"), "disk0-format");
    }

    #[test]
    fn file_backend_defaults_to_raw() {
        let backend = DiskBackend::File {
            path: PathBuf::from("/dev/vg0/lv0"),
            format: String::new(),
            auto_read_only: false,
        };
        let args = backend.blockdev_args("disk0");
        assert!(args[3].contains(r#""driver":"raw""#));
    }

    #[test]
    fn nbd_backend_over_unix_socket() {
        let backend = DiskBackend::Nbd {
            server: NbdServer::Unix {
                path: PathBuf::from("/tmp/nbd.sock"),
            },
            export: Some("disk0".to_string()),
            tls_creds: None,
        };
        let args = backend.blockdev_args("disk0");
        let payload = &args[1];
        assert!(payload.contains(r#""driver":"nbd""#));
        assert!(payload.contains(r#""path":"/tmp/nbd.sock""#));
        assert!(payload.contains(r#""type":"unix""#));
        assert!(payload.contains(r#""export":"disk0""#));
        assert!(payload.contains(r#""direct":true"#));
        assert!(args[3].contains(r#""node-name":"disk0-format""#));
    }

    #[test]
    fn nbd_backend_over_tcp_stringifies_port() {
        let backend = DiskBackend::Nbd {
            server: NbdServer::Tcp {
                host: "192.168.1.100".to_string(),
                port: Some(10809),
            },
            export: None,
            tls_creds: None,
        };
        let payload = &backend.blockdev_args("disk0")[1];
        assert!(payload.contains(r#""type":"inet""#));
        assert!(payload.contains(r#""host":"192.168.1.100""#));
        assert!(payload.contains(r#""port":"10809""#));
    }

    #[test]
    fn rbd_backend_carries_auth_fields() {
        let backend = DiskBackend::Rbd {
            pool: "rbd".to_string(),
            image: "vm-disk-0".to_string(),
            snapshot: None,
            conf: Some(PathBuf::from("/etc/ceph/ceph.conf")),
            user: Some("admin".to_string()),
            key_secret: Some("ceph-key".to_string()),
            auth_client_required: Vec::new(),
        };
        let payload = &backend.blockdev_args("disk0")[1];
        assert!(payload.contains(r#""driver":"rbd""#));
        assert!(payload.contains(r#""pool":"rbd""#));
        assert!(payload.contains(r#""image":"vm-disk-0""#));
        assert!(payload.contains(r#""user":"admin""#));
        assert!(payload.contains(r#""key-secret":"ceph-key""#));
        assert!(payload.contains(r#""discard":"unmap""#));
    }

    #[test]
    fn iscsi_backend_is_single_layer() {
        let backend = DiskBackend::Iscsi {
            portal: "192.168.1.100:3260".to_string(),
            target: "iqn.2023-01.com.example:storage".to_string(),
            lun: 0,
            user: Some("admin".to_string()),
            password_secret: Some("iscsi-password".to_string()),
            initiator_name: Some("iqn.2023-01.com.example:client".to_string()),
        };
        let args = backend.blockdev_args("disk0");
        assert_eq!(args.len(), 2);
        let opts: serde_json::Value = serde_json::from_str(&args[1]).unwrap();
        assert_eq!(opts["driver"], "iscsi");
        assert_eq!(opts["portal"], "192.168.1.100:3260");
        assert_eq!(opts["target"], "iqn.2023-01.com.example:storage");
        assert_eq!(opts["transport"], "tcp");
        assert_eq!(opts["initiator-name"], "iqn.2023-01.com.example:client");
        assert_eq!(backend.final_node("disk0"), "disk0-iscsi");
    }

    #[test]
    fn throttle_group_lists_nonzero_limits() {
        let throttle = ThrottleConfig {
            group: "tg0".to_string(),
            bps: 100 * 1024 * 1024,
            iops: 1000,
            bps_max: 200 * 1024 * 1024,
            iops_max: 2000,
            ..Default::default()
        };
        let text = joined(&throttle.group_object_args());
        assert!(text.starts_with("-object throttle-group,id=tg0"));
        assert!(text.contains("x-bps-total=104857600"));
        assert!(text.contains("x-iops-total=1000"));
        assert!(text.contains("x-bps-total-max=209715200"));
        assert!(!text.contains("x-bps-read"));

        let filter = joined(&throttle.filter_blockdev_args("disk0-throttle", "disk0-format"));
        assert!(filter.contains(r#""driver":"throttle""#));
        assert!(filter.contains(r#""throttle-group":"tg0""#));
        assert!(filter.contains(r#""file":"disk0-format""#));
    }

    #[test]
    fn disk_device_wraps_throttle_node() {
        let mut alloc = SlotAllocator::new(true);
        let disk = DiskConfig {
            id: "disk0".to_string(),
            backend: DiskBackend::File {
                path: PathBuf::from("/var/lib/qemu/disk.qcow2"),
                format: "qcow2".to_string(),
                auto_read_only: false,
            },
            throttle: Some(ThrottleConfig {
                group: "tg0".to_string(),
                bps: 1024,
                ..Default::default()
            }),
            ..Default::default()
        };
        let text = joined(&disk.args(&mut alloc));
        assert!(text.contains("throttle-group,id=tg0"));
        assert!(text.contains(r#""node-name":"disk0-throttle""#));
        assert!(text.contains("virtio-blk-pci,drive=disk0-throttle,id=disk0-device"));
    }

    #[test]
    fn virtio_disk_takes_pci_slot_and_extras() {
        let mut alloc = SlotAllocator::new(true);
        let disk = DiskConfig {
            id: "disk0".to_string(),
            backend: DiskBackend::File {
                path: PathBuf::from("/var/lib/qemu/disk.qcow2"),
                format: "qcow2".to_string(),
                auto_read_only: false,
            },
            boot_index: Some(1),
            serial: Some("DISK001".to_string()),
            ..Default::default()
        };
        let text = joined(&disk.args(&mut alloc));
        assert!(text.contains("virtio-blk-pci,drive=disk0-format,id=disk0-device,bus=pcie.0,addr=0x3,bootindex=1,serial=DISK001"));
    }

    #[test]
    fn ide_disk_stays_off_the_pci_bus() {
        let mut alloc = SlotAllocator::new(true);
        let disk = DiskConfig {
            id: "disk0".to_string(),
            backend: DiskBackend::File {
                path: PathBuf::from("/var/lib/qemu/disk.img"),
                format: String::new(),
                auto_read_only: false,
            },
            interface: DiskInterface::Ide,
            ..Default::default()
        };
        let text = joined(&disk.args(&mut alloc));
        assert!(text.contains("ide-hd,drive=disk0-format,id=disk0-device"));
        assert!(!text.contains("addr="));
    }

    #[test]
    fn cdrom_rides_the_sata_controller() {
        let cdrom = CdRomConfig {
            path: PathBuf::from("/isos/install.iso"),
            boot_index: Some(2),
        };
        let args = cdrom.args(0, "sata0");
        assert_eq!(
            args[1],
            "file=/isos/install.iso,format=raw,if=none,id=cdrom0,media=cdrom,readonly=on"
        );
        assert_eq!(
            args[3],
            "ide-cd,bus=sata0.0,drive=cdrom0,id=cdrom0-device,bootindex=2"
        );
    }
}
