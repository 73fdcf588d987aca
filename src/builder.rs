use serde_json::json;

use crate::config::{
    ChardevConfig, DisplayKind, MachineConfig, MemoryBackend, SpiceConfig, VideoConfig, VmConfig,
    VncConfig,
};
use crate::pci::SlotAllocator;

/// Lowers a [`VmConfig`] plus a control-socket path into the positional
/// argument list for the hypervisor binary.
///
/// The output order is stable and the lowering is pure: the same
/// configuration always produces the same argument list, including PCI slot
/// assignments, because devices draw from the allocator in a fixed order
/// (SATA controller, disks, networks, virtio-serial, USB, balloon, RNG, with
/// video and audio devices inline in the display/audio sections).
#[derive(Debug)]
pub struct CommandBuilder<'a> {
    config: &'a VmConfig,
    q35: bool,
}

fn is_x86(arch: &str) -> bool {
    matches!(arch, "" | "x86_64" | "x86")
}

impl<'a> CommandBuilder<'a> {
    pub fn new(config: &'a VmConfig) -> Self {
        let q35 = match &config.machine {
            Some(machine) => machine.kind.starts_with("q35"),
            None => is_x86(&config.arch),
        };
        Self { config, q35 }
    }

    pub fn is_q35(&self) -> bool {
        self.q35
    }

    /// Produces the full argument list. No I/O happens here; file paths and
    /// descriptors are embedded as given.
    pub fn build(&self, name: &str, socket_path: &str) -> Vec<String> {
        let mut alloc = SlotAllocator::new(self.q35);
        let mut args = Vec::new();

        if !name.is_empty() {
            args.push("-name".to_string());
            args.push(format!("guest={name},debug-threads=on"));
        }

        if self.config.no_defaults {
            args.push("-no-user-config".to_string());
            args.push("-nodefaults".to_string());
        }

        self.push_machine(&mut args);
        self.push_efi(&mut args);
        self.push_cpu(&mut args);
        self.push_memory_extras(&mut args);
        self.push_rtc(&mut args);
        self.push_boot(&mut args);
        self.push_secrets(&mut args);
        self.push_display(&mut args, &mut alloc);
        self.push_audio(&mut args, &mut alloc);
        self.push_control_socket(&mut args, socket_path);
        self.push_sata_controller(&mut args, &mut alloc);
        for disk in &self.config.disks {
            args.extend(disk.args(&mut alloc));
        }
        for (index, cdrom) in self.config.cdroms.iter().enumerate() {
            args.extend(cdrom.args(index, "sata0"));
        }
        for network in &self.config.networks {
            args.extend(network.args(&mut alloc));
        }
        self.push_virtio_serial(&mut args, &mut alloc);
        self.push_serials(&mut args);
        for chardev in &self.config.chardevs {
            args.extend(chardev_args(chardev));
        }
        self.push_usb(&mut args, &mut alloc);
        self.push_balloon(&mut args, &mut alloc);
        self.push_rng(&mut args, &mut alloc);

        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    fn push_machine(&self, args: &mut Vec<String>) {
        let Some(machine) = &self.config.machine else {
            if is_x86(&self.config.arch) {
                args.push("-machine".to_string());
                args.push("q35,accel=kvm".to_string());
            }
            return;
        };
        args.extend(machine_args(machine));
    }

    fn push_efi(&self, args: &mut Vec<String>) {
        let Some(efi) = &self.config.efi else {
            return;
        };
        if efi.code.as_os_str().is_empty() {
            return;
        }

        let code_file = json!({
            "driver": "file",
            "filename": efi.code,
            "node-name": "pflash0-file",
            "read-only": true,
        });
        let code_format = json!({
            "driver": "raw",
            "file": "pflash0-file",
            "node-name": "pflash0",
            "read-only": true,
        });
        args.push("-blockdev".to_string());
        args.push(code_file.to_string());
        args.push("-blockdev".to_string());
        args.push(code_format.to_string());

        if let Some(vars) = &efi.vars {
            let vars_file = json!({
                "driver": "file",
                "filename": vars,
                "node-name": "pflash1-file",
            });
            let vars_format = json!({
                "driver": "raw",
                "file": "pflash1-file",
                "node-name": "pflash1",
            });
            args.push("-blockdev".to_string());
            args.push(vars_file.to_string());
            args.push("-blockdev".to_string());
            args.push(vars_format.to_string());
        }
    }

    fn push_cpu(&self, args: &mut Vec<String>) {
        let memory = self
            .config
            .memory
            .as_ref()
            .map(|memory| memory.size)
            .filter(|size| *size > 0)
            .unwrap_or(512);

        let Some(cpu) = &self.config.cpu else {
            args.push("-cpu".to_string());
            args.push("host".to_string());
            args.push("-m".to_string());
            args.push(memory.to_string());
            return;
        };

        if let Some(model) = &cpu.model {
            let mut value = model.clone();
            for feature in &cpu.features {
                value.push(',');
                value.push_str(feature);
            }
            args.push("-cpu".to_string());
            args.push(value);
        }

        args.push("-m".to_string());
        args.push(memory.to_string());

        let sockets = cpu.sockets.max(1);
        let cores = cpu.cores.max(1);
        let threads = cpu.threads.max(1);
        let total = sockets * cores * threads;
        if total > 1 {
            args.push("-smp".to_string());
            args.push(format!(
                "{total},sockets={sockets},cores={cores},threads={threads}"
            ));
        }
    }

    fn push_memory_extras(&self, args: &mut Vec<String>) {
        let Some(memory) = &self.config.memory else {
            return;
        };

        if let Some(backend) = &memory.backend {
            let mut parts = Vec::new();
            match backend {
                MemoryBackend::File {
                    path,
                    share,
                    prealloc,
                } => {
                    parts.push("memory-backend-file".to_string());
                    parts.push("id=mem0".to_string());
                    parts.push(format!("size={}M", memory.size));
                    parts.push(format!("mem-path={}", path.display()));
                    if *share {
                        parts.push("share=on".to_string());
                    }
                    if *prealloc {
                        parts.push("prealloc=on".to_string());
                    }
                }
                MemoryBackend::Memfd { share } => {
                    parts.push("memory-backend-memfd".to_string());
                    parts.push("id=mem0".to_string());
                    parts.push(format!("size={}M", memory.size));
                    if *share {
                        parts.push("share=on".to_string());
                    }
                }
            }
            args.push("-object".to_string());
            args.push(parts.join(","));
            args.push("-numa".to_string());
            args.push("node,memdev=mem0".to_string());
        }

        if memory.mem_lock {
            args.push("-overcommit".to_string());
            args.push("mem-lock=on".to_string());
        }
    }

    fn push_rtc(&self, args: &mut Vec<String>) {
        let Some(rtc) = &self.config.rtc else {
            args.push("-rtc".to_string());
            args.push("base=utc,driftfix=slew".to_string());
            return;
        };

        let mut parts = Vec::new();
        if let Some(base) = &rtc.base {
            parts.push(format!("base={base}"));
        }
        if let Some(clock) = &rtc.clock {
            parts.push(format!("clock={clock}"));
        }
        if let Some(driftfix) = &rtc.driftfix {
            parts.push(format!("driftfix={driftfix}"));
        }
        if !parts.is_empty() {
            args.push("-rtc".to_string());
            args.push(parts.join(","));
        }
    }

    fn push_boot(&self, args: &mut Vec<String>) {
        let Some(boot) = &self.config.boot else {
            return;
        };

        let mut parts = Vec::new();
        if let Some(order) = &boot.order {
            parts.push(format!("order={order}"));
        }
        if let Some(menu) = boot.menu {
            parts.push(if menu { "menu=on" } else { "menu=off" }.to_string());
        }
        if boot.strict {
            parts.push("strict=on".to_string());
        }
        if !parts.is_empty() {
            args.push("-boot".to_string());
            args.push(parts.join(","));
        }

        if let Some(kernel) = &boot.kernel {
            args.push("-kernel".to_string());
            args.push(kernel.display().to_string());
        }
        if let Some(initrd) = &boot.initrd {
            args.push("-initrd".to_string());
            args.push(initrd.display().to_string());
        }
        if let Some(append) = &boot.append {
            args.push("-append".to_string());
            args.push(append.clone());
        }
    }

    fn push_secrets(&self, args: &mut Vec<String>) {
        for secret in &self.config.secrets {
            if secret.id.is_empty() {
                continue;
            }
            let mut parts = vec!["secret".to_string(), format!("id={}", secret.id)];
            if let Some(data) = &secret.data {
                parts.push(format!("data={data}"));
            }
            if let Some(file) = &secret.file {
                parts.push(format!("file={}", file.display()));
            }
            if let Some(format) = &secret.format {
                parts.push(format!("format={format}"));
            }
            args.push("-object".to_string());
            args.push(parts.join(","));
        }
    }

    fn push_display(&self, args: &mut Vec<String>, alloc: &mut SlotAllocator) {
        let Some(display) = &self.config.display else {
            args.push("-display".to_string());
            args.push("none".to_string());
            return;
        };

        match &display.kind {
            DisplayKind::None => {
                args.push("-display".to_string());
                args.push("none".to_string());
            }
            DisplayKind::Gtk => {
                args.push("-display".to_string());
                args.push("gtk".to_string());
            }
            DisplayKind::Sdl => {
                args.push("-display".to_string());
                args.push("sdl".to_string());
            }
            DisplayKind::Vnc(vnc) => {
                args.extend(vnc_args(vnc));
                args.push("-display".to_string());
                args.push("none".to_string());
            }
            DisplayKind::Spice(spice) => {
                args.extend(spice_args(spice));
                args.push("-display".to_string());
                args.push("none".to_string());
            }
        }

        if let Some(video) = &display.video {
            args.extend(video_device_args(video, alloc));
        }
    }

    fn push_audio(&self, args: &mut Vec<String>, alloc: &mut SlotAllocator) {
        let Some(audio) = &self.config.audio else {
            return;
        };

        let backend = audio.backend.as_deref().filter(|value| *value != "none");
        if let Some(backend) = backend {
            args.push("-audiodev".to_string());
            args.push(format!("{backend},id=audio0"));
        }

        if let Some(device) = &audio.device {
            args.push("-device".to_string());
            args.push(format!(
                "{device},id=sound0,bus={},addr={}",
                alloc.bus(),
                alloc.alloc()
            ));

            let hda = matches!(device.as_str(), "intel-hda" | "ich9-intel-hda");
            if let Some(codec) = audio.codec.as_ref().filter(|_| hda) {
                let mut parts = vec![codec.clone(), "bus=sound0.0".to_string()];
                if backend.is_some() {
                    parts.push("audiodev=audio0".to_string());
                }
                args.push("-device".to_string());
                args.push(parts.join(","));
            }
        }
    }

    fn push_control_socket(&self, args: &mut Vec<String>, socket_path: &str) {
        if socket_path.is_empty() {
            return;
        }
        args.push("-chardev".to_string());
        args.push(format!(
            "socket,id=qmp,path={socket_path},server=on,wait=off"
        ));
        args.push("-mon".to_string());
        args.push("chardev=qmp,id=monitor,mode=control".to_string());
    }

    fn push_sata_controller(&self, args: &mut Vec<String>, alloc: &mut SlotAllocator) {
        if self.config.cdroms.is_empty() {
            return;
        }
        let controller = if self.q35 { "ich9-ahci" } else { "ahci" };
        args.push("-device".to_string());
        args.push(format!(
            "{controller},id=sata0,bus={},addr={}",
            alloc.bus(),
            alloc.alloc()
        ));
    }

    fn push_virtio_serial(&self, args: &mut Vec<String>, alloc: &mut SlotAllocator) {
        let virtio_serial = &self.config.virtio_serial;
        if virtio_serial.is_none() && self.config.chardevs.is_empty() {
            return;
        }

        let mut controller = format!(
            "virtio-serial-pci,id=virtio-serial0,bus={},addr={}",
            alloc.bus(),
            alloc.alloc()
        );
        if let Some(max_ports) = virtio_serial.as_ref().and_then(|cfg| cfg.max_ports) {
            controller.push_str(&format!(",max_ports={max_ports}"));
        }
        args.push("-device".to_string());
        args.push(controller);

        let Some(config) = virtio_serial else {
            return;
        };
        for port in &config.ports {
            let kind = port.kind.as_deref().unwrap_or("virtserialport");
            let mut parts = vec![kind.to_string(), "bus=virtio-serial0.0".to_string()];
            if let Some(chardev) = &port.chardev {
                parts.push(format!("chardev={chardev}"));
            }
            if let Some(name) = &port.name {
                parts.push(format!("name={name}"));
            }
            args.push("-device".to_string());
            args.push(parts.join(","));
        }
    }

    fn push_serials(&self, args: &mut Vec<String>) {
        for (index, serial) in self.config.serials.iter().enumerate() {
            let chardev_id = format!("serial{index}");

            let mut parts = vec![serial.backend.clone(), format!("id={chardev_id}")];
            if let Some(path) = &serial.path {
                parts.push(format!("path={}", path.display()));
            }
            if serial.server {
                parts.push("server=on".to_string());
            }
            if !serial.wait {
                parts.push("wait=off".to_string());
            }
            args.push("-chardev".to_string());
            args.push(parts.join(","));

            let device = serial.device.as_deref().unwrap_or("isa-serial");
            args.push("-device".to_string());
            args.push(format!(
                "{device},chardev={chardev_id},id={chardev_id}-device"
            ));
        }
    }

    fn push_usb(&self, args: &mut Vec<String>, alloc: &mut SlotAllocator) {
        if self.config.usb.is_none() && self.config.usb_devices.is_empty() {
            return;
        }

        let controller = self
            .config
            .usb
            .as_ref()
            .and_then(|usb| usb.kind.as_deref())
            .unwrap_or("qemu-xhci");
        args.push("-device".to_string());
        args.push(format!(
            "{controller},id=usb0,bus={},addr={}",
            alloc.bus(),
            alloc.alloc()
        ));

        for (index, device) in self.config.usb_devices.iter().enumerate() {
            let mut parts = vec![
                device.kind.clone(),
                format!("id=usb-dev{index}"),
                "bus=usb0.0".to_string(),
            ];
            if let Some(chardev) = &device.chardev {
                parts.push(format!("chardev={chardev}"));
            }
            args.push("-device".to_string());
            args.push(parts.join(","));
        }
    }

    fn push_balloon(&self, args: &mut Vec<String>, alloc: &mut SlotAllocator) {
        if !self.config.balloon {
            return;
        }
        args.push("-device".to_string());
        args.push(format!(
            "virtio-balloon-pci,id=balloon0,bus={},addr={}",
            alloc.bus(),
            alloc.alloc()
        ));
    }

    // Every guest gets an entropy source.
    fn push_rng(&self, args: &mut Vec<String>, alloc: &mut SlotAllocator) {
        args.push("-object".to_string());
        args.push("rng-random,id=rng0,filename=/dev/urandom".to_string());
        args.push("-device".to_string());
        args.push(format!(
            "virtio-rng-pci,rng=rng0,id=rng-dev0,bus={},addr={}",
            alloc.bus(),
            alloc.alloc()
        ));
    }
}

fn machine_args(machine: &MachineConfig) -> Vec<String> {
    let mut parts = Vec::new();
    if !machine.kind.is_empty() {
        parts.push(machine.kind.clone());
    }
    if let Some(accel) = &machine.accel {
        parts.push(format!("accel={accel}"));
    }
    if let Some(usb) = machine.usb {
        parts.push(if usb { "usb=on" } else { "usb=off" }.to_string());
    }
    if let Some(dump) = machine.dump_guest_core {
        parts.push(
            if dump {
                "dump-guest-core=on"
            } else {
                "dump-guest-core=off"
            }
            .to_string(),
        );
    }
    if let Some(pflash0) = &machine.pflash0 {
        parts.push(format!("pflash0={pflash0}"));
    }
    if let Some(pflash1) = &machine.pflash1 {
        parts.push(format!("pflash1={pflash1}"));
    }
    if parts.is_empty() {
        return Vec::new();
    }
    vec!["-machine".to_string(), parts.join(",")]
}

fn vnc_args(vnc: &VncConfig) -> Vec<String> {
    let mut parts = Vec::new();
    parts.push(vnc.listen.clone().unwrap_or_else(|| "none".to_string()));
    if let Some(secret) = &vnc.password_secret {
        parts.push(format!("password-secret={secret}"));
    } else if vnc.password {
        parts.push("password=on".to_string());
    }
    if vnc.lossy {
        parts.push("lossy=on".to_string());
    }
    if let Some(audiodev) = &vnc.audiodev {
        parts.push(format!("audiodev={audiodev}"));
    }
    if let Some(websocket) = vnc.websocket {
        parts.push(format!("websocket={websocket}"));
    }
    vec!["-vnc".to_string(), parts.join(",")]
}

fn spice_args(spice: &SpiceConfig) -> Vec<String> {
    let mut parts = Vec::new();
    if spice.unix {
        parts.push("unix=on".to_string());
    } else if let Some(port) = spice.port {
        parts.push(format!("port={port}"));
    }
    if let Some(secret) = &spice.password_secret {
        parts.push(format!("password-secret={secret}"));
    }
    if spice.disable_ticketing {
        parts.push("disable-ticketing=on".to_string());
    }
    if let Some(compression) = &spice.image_compression {
        parts.push(format!("image-compression={compression}"));
    }
    if let Some(compression) = &spice.jpeg_wan_compression {
        parts.push(format!("jpeg-wan-compression={compression}"));
    }
    if let Some(compression) = &spice.zlib_glz_wan_compression {
        parts.push(format!("zlib-glz-wan-compression={compression}"));
    }
    if spice.playback_compression {
        parts.push("playback-compression=on".to_string());
    }
    if spice.seamless_migration {
        parts.push("seamless-migration=on".to_string());
    }
    parts.push(
        if spice.disable_copy_paste {
            "disable-copy-paste=on"
        } else {
            "disable-copy-paste=off"
        }
        .to_string(),
    );
    vec!["-spice".to_string(), parts.join(",")]
}

fn video_device_args(video: &VideoConfig, alloc: &mut SlotAllocator) -> Vec<String> {
    if video.kind.is_empty() {
        return Vec::new();
    }

    let mut parts = vec![video.kind.clone(), "id=video0".to_string()];
    if let Some(vga_mem) = video.vga_mem {
        parts.push(format!("vgamem_mb={vga_mem}"));
    }
    if let Some(ram) = video.ram {
        parts.push(format!("ram_size={ram}"));
    }
    if let Some(vram) = video.vram {
        parts.push(format!("vram_size={vram}"));
    }
    if let Some(outputs) = video.max_outputs {
        parts.push(format!("max_outputs={outputs}"));
    }
    if matches!(video.kind.as_str(), "qxl-vga" | "virtio-vga" | "vga") {
        parts.push(format!("bus={}", alloc.bus()));
        parts.push(format!("addr={}", alloc.alloc()));
    }
    vec!["-device".to_string(), parts.join(",")]
}

fn chardev_args(chardev: &ChardevConfig) -> Vec<String> {
    if chardev.id.is_empty() {
        return Vec::new();
    }
    let mut parts = vec![chardev.backend.clone(), format!("id={}", chardev.id)];
    if let Some(path) = &chardev.path {
        parts.push(format!("path={}", path.display()));
    }
    if let Some(host) = &chardev.host {
        parts.push(format!("host={host}"));
    }
    if let Some(port) = chardev.port {
        parts.push(format!("port={port}"));
    }
    if chardev.server {
        parts.push("server=on".to_string());
    }
    if !chardev.wait {
        parts.push("wait=off".to_string());
    }
    if let Some(reconnect) = chardev.reconnect {
        parts.push(format!("reconnect={reconnect}"));
    }
    if let Some(name) = &chardev.name {
        parts.push(format!("name={name}"));
    }
    vec!["-chardev".to_string(), parts.join(",")]
}
