// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Runtime ownership record for a loaded, initialized stage.
//!
//! A [`StageHandle`] owns the populated [`StageRecord`], a reference to the
//! module it came from (absent for in-process stages built by tests), the
//! validated kind and the stage's configuration blob. Exactly one handle
//! exists per pipeline slot; handles never outlive their pipeline, and a
//! module is only unloaded once every handle referencing it is gone.

use std::ffi::CString;
use std::os::raw::c_void;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use vigil_plugin_abi::{kind, HostApi, StageRecord, PLUGIN_ABI_VERSION};

use crate::core::error::{HostError, Result};
use crate::core::loader::StageModule;

/// Host-side view of a stage's declared kind. A pipeline has exactly one
/// `Input`; everything else is a sink for dispatch purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Input,
    Process,
    Detect,
    Output,
    Store,
}

impl StageKind {
    /// Validate the raw tag a module wrote into its record.
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            kind::INPUT => Some(Self::Input),
            kind::PROCESS => Some(Self::Process),
            kind::DETECT => Some(Self::Detect),
            kind::OUTPUT => Some(Self::Output),
            kind::STORE => Some(Self::Store),
            _ => None,
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Self::Input => kind::INPUT,
            Self::Process => kind::PROCESS,
            Self::Detect => kind::DETECT,
            Self::Output => kind::OUTPUT,
            Self::Store => kind::STORE,
        }
    }

    pub fn is_input(self) -> bool {
        matches!(self, Self::Input)
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Input => "input",
            Self::Process => "process",
            Self::Detect => "detect",
            Self::Output => "output",
            Self::Store => "store",
        };
        f.write_str(name)
    }
}

pub struct StageHandle {
    record: Box<StageRecord>,
    // Declared after `record`: the library must outlive the code the record
    // points into, and fields drop in declaration order.
    module: Option<Arc<StageModule>>,
    stage_kind: StageKind,
    config_json: CString,
    label: String,
    started: bool,
}

// Safety: the record's raw pointers are only dereferenced through the
// handle's methods, and the host serializes those calls (start before any
// dispatch, deliver only from the dispatcher thread, stop after it joined).
unsafe impl Send for StageHandle {}

impl StageHandle {
    /// Validate a populated record into a handle.
    ///
    /// Rejects version mismatches, unknown kinds, records without `start`,
    /// sinks without `on_frame` and input stages that set one.
    pub fn new(
        record: Box<StageRecord>,
        module: Option<Arc<StageModule>>,
        config_json: &str,
        origin: &Path,
    ) -> Result<Self> {
        if record.version != PLUGIN_ABI_VERSION {
            return Err(HostError::IncompatibleVersion {
                got: record.version,
            });
        }
        let stage_kind =
            StageKind::from_raw(record.kind).ok_or_else(|| HostError::InvalidStage {
                path: origin.to_path_buf(),
                reason: format!("unknown stage kind {}", record.kind),
            })?;
        let invalid = |reason: &str| HostError::InvalidStage {
            path: origin.to_path_buf(),
            reason: reason.to_string(),
        };
        if record.start.is_none() {
            return Err(invalid("missing start entry point"));
        }
        if record.stop.is_none() {
            return Err(invalid("missing stop entry point"));
        }
        if stage_kind.is_input() {
            if record.on_frame.is_some() {
                return Err(invalid("input stage must leave on_frame null"));
            }
        } else if record.on_frame.is_none() {
            return Err(invalid("sink stage missing on_frame"));
        }
        let config_json = CString::new(config_json).map_err(|_| {
            HostError::MalformedPipeline {
                reason: format!("config for '{}' contains a NUL byte", origin.display()),
            }
        })?;
        Ok(Self {
            record,
            module,
            stage_kind,
            config_json,
            label: origin.display().to_string(),
            started: false,
        })
    }

    pub fn kind(&self) -> StageKind {
        self.stage_kind
    }

    pub fn is_sink(&self) -> bool {
        !self.stage_kind.is_input()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn config_json(&self) -> &str {
        // CString::new validated UTF-8 input came from &str.
        self.config_json.to_str().unwrap_or("{}")
    }

    /// Call the stage's `start` with a host-API view and its context.
    ///
    /// The caller guarantees `api` and `ctx` stay valid until `stop`
    /// returns (the pipeline owns both for its own lifetime). Returns the
    /// stage's raw status code on failure.
    pub fn start(&mut self, api: &HostApi, ctx: *mut c_void) -> std::result::Result<(), i32> {
        if self.started {
            return Ok(());
        }
        // Validated non-null in `new`.
        let Some(start) = self.record.start else {
            return Err(-1);
        };
        let code = unsafe {
            start(
                self.record.as_mut(),
                api as *const HostApi,
                ctx,
                self.config_json.as_ptr(),
            )
        };
        if code != 0 {
            return Err(code);
        }
        self.started = true;
        Ok(())
    }

    /// Call the stage's `stop`. Idempotent; a stage is stopped at most once
    /// per start.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        if let Some(stop) = self.record.stop {
            unsafe { stop(self.record.as_mut()) };
        }
        if !self.record.instance.is_null() {
            tracing::warn!("[{}] stage left instance pointer set after stop", self.label);
        }
    }

    /// Deliver a unit to a sink. No-op for stages without `on_frame`.
    pub fn deliver(&mut self, buf: &[u8]) {
        if let Some(on_frame) = self.record.on_frame {
            unsafe { on_frame(self.record.as_mut(), buf.as_ptr(), buf.len()) };
        }
    }

    /// The stage's opaque instance pointer (null before start/after stop).
    pub fn instance_ptr(&self) -> *mut c_void {
        self.record.instance
    }

    pub(crate) fn module(&self) -> Option<&Arc<StageModule>> {
        self.module.as_ref()
    }
}

impl Drop for StageHandle {
    fn drop(&mut self) {
        // Normal teardown stops stages explicitly and in order; this is the
        // backstop for assembly unwinding.
        if self.started {
            tracing::warn!("[{}] stage dropped while started; stopping", self.label);
            self.stop();
        }
    }
}
