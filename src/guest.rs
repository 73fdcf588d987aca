use std::path::Path;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::instance::Instance;

/// One entry of a `query-block` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    #[serde(default)]
    pub device: String,
    #[serde(rename = "node-name", default)]
    pub node_name: String,
    #[serde(default)]
    pub qdev: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Absent while the drive has no medium.
    #[serde(default)]
    pub inserted: Option<InsertedMedia>,
}

/// The medium currently inserted in a block device.
#[derive(Debug, Clone, Deserialize)]
pub struct InsertedMedia {
    #[serde(default)]
    pub file: String,
    #[serde(rename = "node-name", default)]
    pub node_name: String,
    #[serde(default)]
    pub ro: bool,
    /// Format driver, e.g. `qcow2`.
    #[serde(default)]
    pub drv: String,
    #[serde(default)]
    pub backing_file: Option<String>,
    #[serde(default)]
    pub backing_file_depth: i64,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub detect_zeroes: String,
    #[serde(default)]
    pub bps: i64,
    #[serde(default)]
    pub bps_rd: i64,
    #[serde(default)]
    pub bps_wr: i64,
    #[serde(default)]
    pub iops: i64,
    #[serde(default)]
    pub iops_rd: i64,
    #[serde(default)]
    pub iops_wr: i64,
}

impl Instance {
    /// Lists the guest's block devices.
    pub fn query_block(&self) -> Result<Vec<BlockInfo>> {
        let reply = self.transport()?.execute("query-block", None)?;
        serde_json::from_value(reply)
            .map_err(|err| Error::transport(format!("malformed query-block reply: {err}")))
    }

    /// Applies byte and IOPS limits to a block device, with 8x bursts over a
    /// 60 second window.
    pub fn set_io_throttle(&self, device: &str, bps: u64, iops: u64) -> Result<()> {
        self.transport()?
            .execute("block_set_io_throttle", Some(throttle_arguments(device, bps, iops)))
            .map(|_| ())
    }

    /// Captures the guest's screen into `path` on the host.
    pub fn screendump(&self, path: impl AsRef<Path>) -> Result<()> {
        self.transport()?
            .execute(
                "screendump",
                Some(json!({ "filename": path.as_ref().to_string_lossy() })),
            )
            .map(|_| ())
    }

    /// Injects key presses into the guest. Keys use QEMU qcode names
    /// (`ctrl`, `alt`, `delete`, `a`, ...); QEMU validates the tokens.
    pub fn send_key(&self, keys: &[&str]) -> Result<()> {
        self.transport()?
            .execute("send-key", Some(json!({ "keys": key_list(keys) })))
            .map(|_| ())
    }

    /// Runs a human-monitor command for the few operations QMP does not
    /// expose, returning the monitor's text output.
    pub fn human_monitor_command(&self, command_line: &str) -> Result<String> {
        let reply = self.transport()?.execute(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        )?;
        reply
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::transport("human-monitor-command returned a non-string reply"))
    }
}

fn key_list(keys: &[&str]) -> Value {
    Value::Array(
        keys.iter()
            .map(|key| json!({ "type": "qcode", "data": key }))
            .collect(),
    )
}

fn throttle_arguments(device: &str, bps: u64, iops: u64) -> Value {
    json!({
        "id": device,
        "bps": bps,
        "bps_rd": 0,
        "bps_wr": 0,
        "iops": iops,
        "iops_rd": 0,
        "iops_wr": 0,
        "bps_max": bps * 8,
        "iops_max": iops * 8,
        "bps_max_length": 60,
        "iops_max_length": 60,
    })
}
