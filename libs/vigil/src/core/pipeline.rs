// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! The composite runtime object for one monitor's pipeline.
//!
//! A `Pipeline` owns the frame ring, the event bus, every stage handle and
//! the capture/dispatcher threads. Lifecycle ordering:
//!
//! - start: sinks in declaration order, then the capture thread (which
//!   starts the input stage). A sink failure unwinds the already-started
//!   sinks in reverse and nothing runs.
//! - stop: signal the capture thread and wait (bounded by a watchdog) for
//!   `input.stop` to return, cancel the ring, join both threads, then stop
//!   sinks in reverse declaration order. Idempotent, callable from any
//!   thread. After `stop` returns no host thread remains runnable and no
//!   further call crosses the ABI into any stage.

use std::collections::HashSet;
use std::os::raw::c_void;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::RecvTimeoutError;
use parking_lot::Mutex;

use vigil_plugin_abi::HostApi;

use crate::core::capture::{self, CaptureRuntime, HostContext};
use crate::core::config::HostConfig;
use crate::core::dispatch::{self, SinkBinding};
use crate::core::error::{HostError, Result};
use crate::core::pubsub::{topics, EventBus, PipelineEvent};
use crate::core::ring::FrameRing;
use crate::core::stage::StageHandle;

/// Bound on how long `stop` waits for the input stage to observe its stop
/// request before surfacing a watchdog event. Sinks may assume the input
/// terminates within this window.
const STOP_WATCHDOG: Duration = Duration::from_secs(5);

pub struct Pipeline {
    label: String,
    config: HostConfig,
    bus: Arc<EventBus>,
    ring: Arc<FrameRing>,
    sinks: Arc<Mutex<Vec<SinkBinding>>>,
    /// The input stage handle: present before start and again after stop
    /// (the capture thread owns it in between).
    input: Mutex<Option<StageHandle>>,
    input_index: usize,
    runtime: Mutex<Option<Runtime>>,
    /// Serializes concurrent stop calls so the second returns only after
    /// teardown completed.
    stop_lock: Mutex<()>,
}

struct Runtime {
    capture: CaptureRuntime,
    dispatcher: JoinHandle<()>,
    // Sink host-API storage: the boxes pin the addresses stages hold until
    // after every sink stopped.
    _sink_api: Box<HostApi>,
    _sink_ctx: Box<HostContext>,
}

impl Pipeline {
    /// Build a pipeline from initialized stage handles in flatten order,
    /// each paired with its stream filter.
    ///
    /// Exactly one handle must be an input stage; everything else becomes a
    /// sink in the given order.
    pub fn from_parts(
        stages: Vec<(StageHandle, Option<HashSet<u32>>)>,
        config: HostConfig,
    ) -> Result<Self> {
        let mut input = None;
        let mut input_index = 0;
        let mut sinks = Vec::new();
        for (index, (handle, filter)) in stages.into_iter().enumerate() {
            if handle.kind().is_input() {
                if input.is_some() {
                    return Err(HostError::MalformedPipeline {
                        reason: "pipeline declares more than one input stage".to_string(),
                    });
                }
                input = Some(handle);
                input_index = index;
            } else {
                sinks.push(SinkBinding {
                    index,
                    handle,
                    filter,
                });
            }
        }
        let Some(input) = input else {
            return Err(HostError::MalformedPipeline {
                reason: "pipeline declares no input stage".to_string(),
            });
        };

        let label = match config.monitor_id {
            Some(id) => format!("monitor-{}", id),
            None => "pipeline".to_string(),
        };
        let ring = Arc::new(FrameRing::new(config.ring.slots, config.ring.slot_bytes));
        Ok(Self {
            label,
            config,
            bus: Arc::new(EventBus::new()),
            ring,
            sinks: Arc::new(Mutex::new(sinks)),
            input: Mutex::new(Some(input)),
            input_index,
            runtime: Mutex::new(None),
            stop_lock: Mutex::new(()),
        })
    }

    /// The pipeline's event bus. Per-pipeline; subscribe here for stage and
    /// host operational events.
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_running(&self) -> bool {
        self.runtime.lock().is_some()
    }

    /// True when every stage handle is stopped with its instance pointer
    /// cleared (trivially true before the first start).
    pub fn instances_cleared(&self) -> bool {
        let input_clear = self
            .input
            .lock()
            .as_ref()
            .map_or(false, |h| !h.started() && h.instance_ptr().is_null());
        input_clear
            && self
                .sinks
                .lock()
                .iter()
                .all(|s| !s.handle.started() && s.handle.instance_ptr().is_null())
    }

    /// Start every sink, then the capture thread (which starts the input
    /// stage). On failure nothing is left running.
    pub fn start(&mut self) -> Result<()> {
        if self.runtime.lock().is_some() {
            tracing::warn!("[{}] start called on a running pipeline", self.label);
            return Ok(());
        }
        if self.ring.is_cancelled() {
            return Err(HostError::Configuration(
                "pipeline already stopped; assemble a new one to restart".to_string(),
            ));
        }
        let Some(input) = self.input.lock().take() else {
            return Err(HostError::MalformedPipeline {
                reason: "pipeline already consumed its input stage".to_string(),
            });
        };
        tracing::info!(
            "[{}] starting pipeline: input '{}', {} sink(s), ring {}x{} bytes",
            self.label,
            input.label(),
            self.sinks.lock().len(),
            self.config.ring.slots,
            self.config.ring.slot_bytes
        );

        let sink_api = Box::new(capture::sink_host_api());
        let sink_ctx = Box::new(HostContext {
            ring: None,
            bus: Arc::clone(&self.bus),
            label: self.label.clone(),
        });
        let ctx_ptr = &*sink_ctx as *const HostContext as *mut c_void;

        // Start sinks in declaration order; unwind in reverse on failure.
        {
            let mut sinks = self.sinks.lock();
            for i in 0..sinks.len() {
                let index = sinks[i].index;
                if let Err(code) = sinks[i].handle.start(&sink_api, ctx_ptr) {
                    tracing::error!(
                        "[{}] sink '{}' failed to start (code {})",
                        self.label,
                        sinks[i].handle.label(),
                        code
                    );
                    for j in (0..i).rev() {
                        sinks[j].handle.stop();
                    }
                    *self.input.lock() = Some(input);
                    return Err(HostError::StageStartFailed { index, code });
                }
            }
        }

        let dispatcher = dispatch::spawn_dispatcher(
            Arc::clone(&self.ring),
            Arc::clone(&self.sinks),
            Arc::clone(&self.bus),
            self.config.drop_report_interval,
            self.label.clone(),
        )?;

        let capture = capture::spawn_capture(
            input,
            Arc::clone(&self.ring),
            Arc::clone(&self.bus),
            self.label.clone(),
        )?;

        // The capture thread reports the input stage's start outcome once.
        let started = match capture.ready_rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(code)) => Err(code),
            Err(_) => Err(-1),
        };
        if let Err(code) = started {
            self.ring.cancel();
            if dispatcher.join().is_err() {
                tracing::error!("[{}] dispatcher thread panicked", self.label);
            }
            capture.shutdown_tx.send(()).ok();
            match capture.join.join() {
                Ok(input) => *self.input.lock() = Some(input),
                Err(_) => tracing::error!("[{}] capture thread panicked", self.label),
            }
            let mut sinks = self.sinks.lock();
            for sink in sinks.iter_mut().rev() {
                sink.handle.stop();
            }
            return Err(HostError::StageStartFailed {
                index: self.input_index,
                code,
            });
        }

        *self.runtime.lock() = Some(Runtime {
            capture,
            dispatcher,
            _sink_api: sink_api,
            _sink_ctx: sink_ctx,
        });
        tracing::info!("[{}] pipeline running", self.label);
        Ok(())
    }

    /// Stop the pipeline. Idempotent and safe to call from any thread; a
    /// concurrent call blocks until teardown completed.
    pub fn stop(&self) {
        let _guard = self.stop_lock.lock();
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };
        tracing::info!("[{}] stopping pipeline", self.label);

        runtime.capture.shutdown_tx.send(()).ok();
        let waited = Instant::now();
        match runtime.capture.done_rx.recv_timeout(STOP_WATCHDOG) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                let elapsed_usec = waited.elapsed().as_micros() as i64;
                tracing::warn!(
                    "[{}] input stage did not stop within {:?}",
                    self.label,
                    STOP_WATCHDOG
                );
                let event = PipelineEvent::WatchdogTimeout { elapsed_usec };
                self.bus.publish(topics::PLUGIN_EVENT, &event.to_json());
            }
        }

        // Unblocks the dispatcher; pending units are discarded.
        self.ring.cancel();
        if runtime.dispatcher.join().is_err() {
            tracing::error!("[{}] dispatcher thread panicked", self.label);
        }
        match runtime.capture.join.join() {
            Ok(input) => *self.input.lock() = Some(input),
            Err(_) => tracing::error!("[{}] capture thread panicked", self.label),
        }

        // input.stop returned before any sink is stopped; reverse order.
        {
            let mut sinks = self.sinks.lock();
            for sink in sinks.iter_mut().rev() {
                sink.handle.stop();
            }
        }
        tracing::info!(
            "[{}] pipeline stopped ({} unit(s) displaced over the run)",
            self.label,
            self.ring.dropped_count()
        );
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop();
    }
}
