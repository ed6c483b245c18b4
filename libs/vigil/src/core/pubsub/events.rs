// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use serde::{Deserialize, Serialize};

/// Common topic constants for host and stage events
pub mod topics {
    /// Everything stages publish through `publish_evt`, plus host
    /// operational events (ring drops, watchdog).
    pub const PLUGIN_EVENT: &str = "plugin_event";
}

/// The event taxonomy observed on the bus and inside Event units.
///
/// The wire form is a JSON object tagged by its `event` field, e.g.
/// `{"event":"StreamDisconnected","stream_id":0}`. Stages may publish
/// event types outside this set; the host passes unknown JSON through
/// untouched and only types the events it emits or inspects itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    /// Emitted by the input stage once transport setup succeeds.
    StreamConnected {
        url: String,
        video_streams: u32,
        audio_streams: u32,
    },
    /// Emitted by the input stage while re-establishing transport.
    StreamReconnecting {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stream_id: Option<u32>,
    },
    StreamDisconnected {
        stream_id: u32,
    },
    /// Per-stream codec parameters, pushed in-band ahead of the first
    /// dependent keyframe. `extradata` is base64; each receiver decodes
    /// into its own owned buffer, no pointers cross the ABI boundary.
    StreamMetadata {
        stream_id: u32,
        codec_id: i32,
        width: u32,
        height: u32,
        pix_fmt: i32,
        profile: i32,
        level: i32,
        extradata: String,
    },
    /// Emitted by store sinks when a segment is finalized. Duration in
    /// microseconds.
    FileClosed {
        path: String,
        duration: i64,
    },
    /// Emitted by the host dispatcher, rate-limited, when the ring
    /// displaced units since the last report.
    RingDropped {
        count: u64,
        since_usec: i64,
    },
    /// Emitted by the host when the input stage failed to observe its stop
    /// request within the bounded shutdown window.
    WatchdogTimeout {
        elapsed_usec: i64,
    },
}

impl PipelineEvent {
    /// Wire form of the event. Infallible for this enum shape.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a typed event out of arbitrary stage JSON; `None` for event
    /// types outside the host taxonomy.
    pub fn from_json(json: &str) -> Option<Self> {
        serde_json::from_str(json).ok()
    }
}
