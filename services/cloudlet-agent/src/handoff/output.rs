//! Final status line printed by the receive worker.
//!
//! Grammar: `keyword \t disk_size \t memory_size \t disk_overlay_map \t memory_overlay_map`
//! where `keyword` is [`PLATFORM_KEYWORD`] in any case.

use std::path::PathBuf;

use super::HandoffError;

/// Sentinel the receive worker prints for this platform.
pub const PLATFORM_KEYWORD: &str = "openstack";

/// Parsed receive worker result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatusLine {
    pub disk_size: u64,
    pub memory_size: u64,
    pub disk_overlay_map: String,
    pub memory_overlay_map: String,
}

impl WorkerStatusLine {
    /// Parse the last non-empty line of the worker's stdout.
    pub fn parse(stdout: &str) -> Result<Self, HandoffError> {
        let line = stdout
            .lines()
            .map(|line| line.trim_end_matches('\r'))
            .rfind(|line| !line.trim().is_empty())
            .ok_or_else(|| HandoffError::MalformedOutput("no status line".to_string()))?;

        let fields: Vec<&str> = line.split('\t').collect();
        let [keyword, disk_size, memory_size, disk_overlay_map, memory_overlay_map] =
            fields.as_slice()
        else {
            return Err(HandoffError::MalformedOutput(format!(
                "expected 5 fields, got {}",
                fields.len()
            )));
        };

        if !keyword.eq_ignore_ascii_case(PLATFORM_KEYWORD) {
            return Err(HandoffError::MalformedOutput(format!(
                "unexpected keyword {keyword:?}"
            )));
        }

        let size = |name: &str, raw: &str| {
            raw.trim()
                .parse::<u64>()
                .map_err(|_| HandoffError::MalformedOutput(format!("invalid {name} {raw:?}")))
        };

        Ok(Self {
            disk_size: size("disk size", *disk_size)?,
            memory_size: size("memory size", *memory_size)?,
            disk_overlay_map: disk_overlay_map.to_string(),
            memory_overlay_map: memory_overlay_map.to_string(),
        })
    }
}

/// Everything the host needs to start a VM from a received handoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffLaunch {
    pub disk_size: u64,
    pub memory_size: u64,
    pub disk_overlay_map: String,
    pub memory_overlay_map: String,
    pub launch_disk: PathBuf,
    pub launch_memory: PathBuf,
}

impl HandoffLaunch {
    pub fn new(status: WorkerStatusLine, launch_disk: PathBuf, launch_memory: PathBuf) -> Self {
        Self {
            disk_size: status.disk_size,
            memory_size: status.memory_size,
            disk_overlay_map: status.disk_overlay_map,
            memory_overlay_map: status.memory_overlay_map,
            launch_disk,
            launch_memory,
        }
    }
}
