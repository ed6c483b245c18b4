// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The capture side of a pipeline: host-API trampolines and the thread
//! bound to the input stage.
//!
//! Each pipeline constructs its own [`HostApi`] values and hands stages a
//! borrowed reference for the duration of start..stop; there is no global
//! host-API record. The capture flavor routes `on_frame` and `publish_evt`
//! into the frame ring so metadata events interleave with frames in push
//! order; the sink flavor routes `publish_evt` to the event bus and leaves
//! `on_frame` null.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};

use vigil_plugin_abi::{log_level, HostApi};

use crate::core::pubsub::{topics, EventBus};
use crate::core::ring::{DropReason, FrameRing, PushOutcome};
use crate::core::stage::StageHandle;

/// Context bound to the host-API callbacks via the `host_ctx` pointer.
///
/// The capture context carries the ring; sink contexts leave it `None`.
/// Stages receive the pointer at `start` and hand it back on every
/// callback; it stays valid until their `stop` returns.
pub(crate) struct HostContext {
    pub(crate) ring: Option<Arc<FrameRing>>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) label: String,
}

/// The host-API view handed to the input stage.
pub(crate) fn capture_host_api() -> HostApi {
    HostApi {
        log: Some(host_log),
        publish_evt: Some(publish_evt_to_ring),
        on_frame: Some(frame_to_ring),
    }
}

/// The host-API view handed to sink stages.
pub(crate) fn sink_host_api() -> HostApi {
    HostApi {
        log: Some(host_log),
        publish_evt: Some(publish_evt_to_bus),
        on_frame: None,
    }
}

/// `HostApi::log` trampoline: route stage logs into tracing.
unsafe extern "C-unwind" fn host_log(ctx: *mut c_void, level: u32, msg: *const c_char) {
    if ctx.is_null() || msg.is_null() {
        return;
    }
    let ctx = &*(ctx as *const HostContext);
    let msg = CStr::from_ptr(msg).to_string_lossy();
    match level {
        log_level::DEBUG => tracing::debug!("[{}] {}", ctx.label, msg),
        log_level::WARN => tracing::warn!("[{}] {}", ctx.label, msg),
        log_level::ERROR => tracing::error!("[{}] {}", ctx.label, msg),
        _ => tracing::info!("[{}] {}", ctx.label, msg),
    }
}

/// Capture-side `publish_evt`: the raw JSON text goes into the ring so
/// sinks observe it in order with the frames around it.
unsafe extern "C-unwind" fn publish_evt_to_ring(ctx: *mut c_void, json: *const c_char) {
    if ctx.is_null() || json.is_null() {
        return;
    }
    let ctx = &*(ctx as *const HostContext);
    let Some(ring) = ctx.ring.as_ref() else {
        return;
    };
    let json = CStr::from_ptr(json);
    if let PushOutcome::Dropped(DropReason::Oversized) = ring.push(json.to_bytes()) {
        tracing::warn!("[{}] event larger than a ring slot, discarded", ctx.label);
    }
}

/// Sink-side `publish_evt`: out-of-band events go to the pipeline bus.
unsafe extern "C-unwind" fn publish_evt_to_bus(ctx: *mut c_void, json: *const c_char) {
    if ctx.is_null() || json.is_null() {
        return;
    }
    let ctx = &*(ctx as *const HostContext);
    let json = CStr::from_ptr(json).to_string_lossy();
    ctx.bus.publish(topics::PLUGIN_EVENT, &json);
}

/// Capture-side `on_frame`: copy the unit into the ring. Overflow retires
/// the oldest pending unit; the capture thread is never blocked.
unsafe extern "C-unwind" fn frame_to_ring(ctx: *mut c_void, buf: *const u8, size: usize) {
    if ctx.is_null() || buf.is_null() || size == 0 {
        return;
    }
    let ctx = &*(ctx as *const HostContext);
    let Some(ring) = ctx.ring.as_ref() else {
        return;
    };
    let unit = std::slice::from_raw_parts(buf, size);
    if let PushOutcome::Dropped(DropReason::Oversized) = ring.push(unit) {
        tracing::warn!(
            "[{}] {}-byte unit exceeds ring slot size, discarded",
            ctx.label,
            size
        );
    }
}

/// Handles to a running capture thread.
pub(crate) struct CaptureRuntime {
    pub(crate) join: JoinHandle<StageHandle>,
    pub(crate) shutdown_tx: Sender<()>,
    /// Outcome of the input stage's `start`, reported once.
    pub(crate) ready_rx: Receiver<std::result::Result<(), i32>>,
    /// Signalled after `input.stop` has returned.
    pub(crate) done_rx: Receiver<()>,
}

/// Spawn the capture thread for `input`.
///
/// The thread owns the input stage, its host-API value and its context for
/// the whole run: it starts the stage, parks until a shutdown signal, stops
/// the stage, then hands the handle back through `join`.
pub(crate) fn spawn_capture(
    mut input: StageHandle,
    ring: Arc<FrameRing>,
    bus: Arc<EventBus>,
    label: String,
) -> std::io::Result<CaptureRuntime> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let (done_tx, done_rx) = crossbeam_channel::bounded(1);

    let thread_label = label.clone();
    let join = std::thread::Builder::new()
        .name(format!("capture-{}", label))
        .spawn(move || {
            let ctx = Box::new(HostContext {
                ring: Some(ring),
                bus,
                label: thread_label.clone(),
            });
            let api = capture_host_api();
            let ctx_ptr = &*ctx as *const HostContext as *mut c_void;

            let outcome = input.start(&api, ctx_ptr);
            let started = outcome.is_ok();
            if let Err(code) = outcome {
                tracing::error!(
                    "[{}] input stage '{}' failed to start (code {})",
                    thread_label,
                    input.label(),
                    code
                );
            }
            ready_tx.send(outcome).ok();

            if started {
                // The input stage runs its own I/O loop and calls back into
                // the host API; this thread just anchors its lifetime.
                let _ = shutdown_rx.recv();
                input.stop();
            }
            done_tx.send(()).ok();
            input
        })?;

    Ok(CaptureRuntime {
        join,
        shutdown_tx,
        ready_rx,
        done_rx,
    })
}
