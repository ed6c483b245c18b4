// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! # vigil - Plugin Host for Monitor Media Pipelines
//!
//! The runtime that turns a declarative pipeline description into a running
//! capture/dispatch topology: it loads dynamically-linked stage modules,
//! feeds packetized media and interleaved JSON metadata from the single
//! input stage to an ordered set of sink stages, and tears the whole thing
//! down deterministically.
//!
//! ```text
//! vigil
//!   └─ core/
//!        ├─ envelope    frame header + event envelope (the wire shape)
//!        ├─ ring        bounded SPSC frame ring, oldest-drop
//!        ├─ pubsub      per-pipeline event bus + typed event taxonomy
//!        ├─ loader      shared-library resolution and stage init
//!        ├─ descriptor  pipeline description schema + flattening
//!        ├─ assembler   description → Pipeline
//!        └─ pipeline    capture/dispatch threads + lifecycle
//! ```
//!
//! Codecs, RTSP transport, muxing and signaling live inside individual
//! stages; the host treats payloads as opaque byte ranges behind a small
//! structured header.
//!
//! ## Running a pipeline
//!
//! ```ignore
//! use vigil::core::{assemble, HostConfig, PipelineDescription};
//!
//! let desc = PipelineDescription::from_json_file(path)?;
//! let config = HostConfig::from_description(&desc)?;
//! let mut pipeline = assemble(&desc, config)?;
//! pipeline.start()?;
//! // ... until an external stop request ...
//! pipeline.stop();
//! ```

pub mod core;

pub use crate::core::{
    assemble, classify, encode_frame, EventBus, FrameRing, HostConfig, HostError, Pipeline,
    PipelineDescription, PipelineEvent, Result, StageHandle, StageKind, Unit,
};

// The ABI contract is re-exported so hosts and in-process test stages don't
// need a separate dependency on the contract crate.
pub use vigil_plugin_abi as abi;
