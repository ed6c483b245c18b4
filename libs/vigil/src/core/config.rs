// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Host-recognized configuration knobs.
//!
//! Everything else in a pipeline description passes through to stages
//! untouched; the host itself only consumes ring sizing, the monitor id
//! (threaded into logs and store-sink path templates) and the drop-report
//! cadence.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::descriptor::PipelineDescription;
use crate::core::error::{HostError, Result};

pub const DEFAULT_RING_SLOTS: usize = 256;
pub const DEFAULT_RING_SLOT_BYTES: usize = 1024 * 1024;
const DEFAULT_DROP_REPORT_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingConfig {
    #[serde(default = "default_slots")]
    pub slots: usize,
    #[serde(default = "default_slot_bytes")]
    pub slot_bytes: usize,
}

fn default_slots() -> usize {
    DEFAULT_RING_SLOTS
}

fn default_slot_bytes() -> usize {
    DEFAULT_RING_SLOT_BYTES
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_RING_SLOTS,
            slot_bytes: DEFAULT_RING_SLOT_BYTES,
        }
    }
}

/// Validated host configuration for one pipeline.
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub ring: RingConfig,
    pub monitor_id: Option<i64>,
    /// Minimum spacing between RingDropped reports from the dispatcher.
    pub drop_report_interval: Duration,
    /// Root for `kind`-based stage resolution
    /// (`<root>/<kind>/<kind><ext>`).
    pub plugin_root: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            monitor_id: None,
            drop_report_interval: Duration::from_millis(DEFAULT_DROP_REPORT_INTERVAL_MS),
            plugin_root: PathBuf::from("plugins"),
        }
    }
}

impl HostConfig {
    /// Extract and validate the host knobs from a pipeline description.
    pub fn from_description(desc: &PipelineDescription) -> Result<Self> {
        let ring = desc.ring.clone().unwrap_or_default();
        if ring.slots < 2 {
            return Err(HostError::Configuration(format!(
                "ring.slots must be at least 2, got {}",
                ring.slots
            )));
        }
        if ring.slot_bytes < vigil_plugin_abi::HEADER_BYTES {
            return Err(HostError::Configuration(format!(
                "ring.slot_bytes must hold at least a frame header, got {}",
                ring.slot_bytes
            )));
        }
        Ok(Self {
            ring,
            monitor_id: desc.monitor_id,
            drop_report_interval: Duration::from_millis(
                desc.drop_report_interval_ms
                    .unwrap_or(DEFAULT_DROP_REPORT_INTERVAL_MS),
            ),
            plugin_root: PathBuf::from("plugins"),
        })
    }
}
