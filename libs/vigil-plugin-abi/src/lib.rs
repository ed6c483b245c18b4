// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! ABI-stable stage contract for vigil dynamic pipeline loading.
//!
//! This crate defines the complete surface a stage module shares with the
//! host: the `StageRecord` a module populates from its init symbol, the
//! `HostApi` callback table the host hands to `start`, and the 32-byte
//! frame header every unit on the wire begins with. Everything here is
//! `#[repr(C)]` with explicit little-endian encoding so stages can be built
//! in any language with C linkage.
//!
//! # Example Stage
//!
//! ```ignore
//! use vigil_plugin_abi::{export_stage, kind, HostApi, StageRecord};
//!
//! fn init(record: &mut StageRecord) {
//!     record.version = vigil_plugin_abi::PLUGIN_ABI_VERSION;
//!     record.kind = kind::OUTPUT;
//!     record.start = Some(my_start);
//!     record.stop = Some(my_stop);
//!     record.on_frame = Some(my_on_frame);
//! }
//!
//! export_stage!(init);
//! ```
//!
//! # Stage Cargo.toml
//!
//! ```toml
//! [lib]
//! crate-type = ["cdylib"]
//!
//! [dependencies]
//! vigil-plugin-abi = "0.1"
//! ```

use std::os::raw::{c_char, c_int, c_void};

/// Current ABI version. Stages must declare this exactly.
///
/// Increment when making breaking changes to the stage interface.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Symbol every stage module exports, nul-terminated for symbol lookup.
///
/// Signature: `void zm_plugin_init(StageRecord*)`. The host zeroes the
/// record before the call; the init function fills in version, kind and the
/// function pointers. Use [`export_stage!`] to generate it.
pub const STAGE_INIT_SYMBOL: &[u8] = b"zm_plugin_init\0";

/// Stage kind tags carried in [`StageRecord::kind`].
///
/// Raw `u32` values rather than a Rust enum: the value crosses the ABI
/// boundary and the host validates it, so an out-of-range write by a stage
/// is a rejected record, not undefined behavior.
pub mod kind {
    /// Sole frame producer of a pipeline. Leaves `on_frame` null.
    pub const INPUT: u32 = 0;
    pub const PROCESS: u32 = 1;
    pub const DETECT: u32 = 2;
    pub const OUTPUT: u32 = 3;
    pub const STORE: u32 = 4;
}

/// Log levels for [`HostApi::log`], lowest to highest severity.
pub mod log_level {
    pub const DEBUG: u32 = 0;
    pub const INFO: u32 = 1;
    pub const WARN: u32 = 2;
    pub const ERROR: u32 = 3;
}

/// Surface kinds carried in [`FrameHeader::hw_type`].
///
/// A pure tag: GPU frames carry their surface id in [`FrameHeader::handle`],
/// never a host pointer.
pub mod hw_type {
    pub const CPU: u32 = 0;
    pub const CUDA: u32 = 1;
    pub const VAAPI: u32 = 2;
    pub const VTB: u32 = 3;
    pub const DXVA: u32 = 4;
}

/// Bit 0 of [`FrameHeader::flags`]: the frame is a keyframe.
pub const FLAG_KEYFRAME: u32 = 1;

/// `start(stage, host_api, host_ctx, config_json) -> 0 on success`.
///
/// `host_ctx` is opaque to the stage and must be passed back verbatim on
/// every host callback. `config_json` is the stage's configuration blob as
/// nul-terminated UTF-8 JSON. The `HostApi` reference is only guaranteed
/// valid until `stop` returns; stages that spawn worker threads copy the
/// function pointers, not the reference.
pub type StageStartFn =
    unsafe extern "C-unwind" fn(*mut StageRecord, *const HostApi, *mut c_void, *const c_char) -> c_int;

/// `stop(stage)`. Releases all stage-owned resources and nulls `instance`.
pub type StageStopFn = unsafe extern "C-unwind" fn(*mut StageRecord);

/// `on_frame(stage, buf, size)`: a single contiguous unit, either a
/// [`FrameHeader`] followed by its payload or a UTF-8 JSON event object.
/// Sinks only; input stages leave this null.
///
/// All callback types use the `C-unwind` ABI: a Rust-implemented stage
/// that panics unwinds into the host, which isolates it at the dispatch
/// boundary instead of aborting the process.
pub type StageFrameFn = unsafe extern "C-unwind" fn(*mut StageRecord, *const u8, usize);

/// `log(host_ctx, level, msg)` with `level` from [`log_level`] and `msg`
/// nul-terminated UTF-8.
pub type HostLogFn = unsafe extern "C-unwind" fn(*mut c_void, u32, *const c_char);

/// `publish_evt(host_ctx, json)` with `json` a nul-terminated UTF-8 object.
pub type HostPublishFn = unsafe extern "C-unwind" fn(*mut c_void, *const c_char);

/// `on_frame(host_ctx, buf, size)`: input stages push header+payload units
/// (or JSON event units) into the pipeline with this.
pub type HostFrameFn = unsafe extern "C-unwind" fn(*mut c_void, *const u8, usize);

/// The record a stage module populates from `zm_plugin_init`.
///
/// The host allocates and zeroes it, calls the init symbol, then validates
/// `version` and `kind` before the stage is ever started.
#[repr(C)]
pub struct StageRecord {
    /// Must equal [`PLUGIN_ABI_VERSION`]; the loader rejects mismatches.
    pub version: u32,
    /// One of the [`kind`] constants.
    pub kind: u32,
    /// Opaque per-stage pointer, set by `start`, cleared by `stop`.
    pub instance: *mut c_void,
    pub start: Option<StageStartFn>,
    pub stop: Option<StageStopFn>,
    /// Null for input stages.
    pub on_frame: Option<StageFrameFn>,
}

impl StageRecord {
    /// A zeroed record, ready to hand to a module's init symbol.
    pub const fn zeroed() -> Self {
        Self {
            version: 0,
            kind: 0,
            instance: std::ptr::null_mut(),
            start: None,
            stop: None,
            on_frame: None,
        }
    }
}

/// Host callback table handed to every `start`.
///
/// Function pointers only; the companion `host_ctx` travels separately so
/// one table layout serves every context. Null entries mean the callback is
/// unavailable to this stage (input stages get `on_frame`, sinks do not).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct HostApi {
    pub log: Option<HostLogFn>,
    pub publish_evt: Option<HostPublishFn>,
    pub on_frame: Option<HostFrameFn>,
}

impl HostApi {
    pub const fn empty() -> Self {
        Self {
            log: None,
            publish_evt: None,
            on_frame: None,
        }
    }
}

/// Byte length of the encoded frame header.
pub const HEADER_BYTES: usize = 32;

/// Fixed-layout header prefixing every Frame unit, little-endian on the wire.
///
/// | offset | field     | width |
/// |-------:|-----------|------:|
/// |      0 | stream_id |     4 |
/// |      4 | hw_type   |     4 |
/// |      8 | handle    |     8 |
/// |     16 | bytes     |     4 |
/// |     20 | flags     |     4 |
/// |     24 | pts_usec  |     8 |
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Monitor-local stream index; 0 is the primary stream.
    pub stream_id: u32,
    /// One of the [`hw_type`] constants.
    pub hw_type: u32,
    /// CPU frames: ignored. GPU frames: opaque surface id, valid only for
    /// the single dispatcher pass delivering the frame.
    pub handle: u64,
    /// Payload length in bytes; the unit is `HEADER_BYTES + bytes` long.
    pub bytes: u32,
    /// Bit 0 = keyframe ([`FLAG_KEYFRAME`]); bits 1..31 reserved.
    pub flags: u32,
    /// Presentation timestamp in microseconds.
    pub pts_usec: i64,
}

// The repr(C) layout must match the wire layout exactly.
const _: () = assert!(std::mem::size_of::<FrameHeader>() == HEADER_BYTES);

impl FrameHeader {
    pub fn is_keyframe(&self) -> bool {
        self.flags & FLAG_KEYFRAME != 0
    }

    /// Encode into the fixed little-endian wire form. Never allocates.
    pub fn to_bytes(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0u8; HEADER_BYTES];
        out[0..4].copy_from_slice(&self.stream_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.hw_type.to_le_bytes());
        out[8..16].copy_from_slice(&self.handle.to_le_bytes());
        out[16..20].copy_from_slice(&self.bytes.to_le_bytes());
        out[20..24].copy_from_slice(&self.flags.to_le_bytes());
        out[24..32].copy_from_slice(&self.pts_usec.to_le_bytes());
        out
    }

    /// Decode from the wire form. Never allocates.
    pub fn from_bytes(raw: &[u8; HEADER_BYTES]) -> Self {
        // Unwraps are infallible: the slice bounds are compile-time exact.
        Self {
            stream_id: u32::from_le_bytes(raw[0..4].try_into().unwrap()),
            hw_type: u32::from_le_bytes(raw[4..8].try_into().unwrap()),
            handle: u64::from_le_bytes(raw[8..16].try_into().unwrap()),
            bytes: u32::from_le_bytes(raw[16..20].try_into().unwrap()),
            flags: u32::from_le_bytes(raw[20..24].try_into().unwrap()),
            pts_usec: i64::from_le_bytes(raw[24..32].try_into().unwrap()),
        }
    }
}

/// Export a stage init function under the symbol the host resolves.
///
/// The argument is a `fn(&mut StageRecord)` that fills in the record. The
/// macro generates the `zm_plugin_init` symbol with C linkage.
///
/// # Example
///
/// ```ignore
/// fn init(record: &mut StageRecord) { /* populate */ }
/// export_stage!(init);
/// ```
#[macro_export]
macro_rules! export_stage {
    ($init:path) => {
        #[no_mangle]
        pub unsafe extern "C" fn zm_plugin_init(record: *mut $crate::StageRecord) {
            if record.is_null() {
                return;
            }
            let f: fn(&mut $crate::StageRecord) = $init;
            f(&mut *record);
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let hdr = FrameHeader {
            stream_id: 3,
            hw_type: hw_type::CUDA,
            handle: 0xdead_beef_cafe_f00d,
            bytes: 4096,
            flags: FLAG_KEYFRAME,
            pts_usec: 1_234_567_890,
        };
        let raw = hdr.to_bytes();
        assert_eq!(FrameHeader::from_bytes(&raw), hdr);
    }

    #[test]
    fn test_header_wire_offsets() {
        let hdr = FrameHeader {
            stream_id: 0x0102_0304,
            hw_type: hw_type::CPU,
            handle: 0,
            bytes: 1,
            flags: 0,
            pts_usec: -1,
        };
        let raw = hdr.to_bytes();
        // Little-endian stream_id at offset 0.
        assert_eq!(&raw[0..4], &[0x04, 0x03, 0x02, 0x01]);
        // bytes at offset 16.
        assert_eq!(&raw[16..20], &[1, 0, 0, 0]);
        // pts_usec sign-extends across offset 24..32.
        assert_eq!(&raw[24..32], &[0xff; 8]);
    }

    #[test]
    fn test_zeroed_record_has_no_callbacks() {
        let record = StageRecord::zeroed();
        assert_eq!(record.version, 0);
        assert!(record.start.is_none());
        assert!(record.stop.is_none());
        assert!(record.on_frame.is_none());
        assert!(record.instance.is_null());
    }

    #[test]
    fn test_keyframe_flag() {
        let mut hdr = FrameHeader::default();
        assert!(!hdr.is_keyframe());
        hdr.flags = FLAG_KEYFRAME | 0x8000_0000;
        assert!(hdr.is_keyframe());
    }
}
