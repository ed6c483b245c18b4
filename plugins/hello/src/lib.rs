// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Minimal demo sink: counts the units it is fed and logs through the
//! host. Useful as a smoke-test stage and as the smallest worked example
//! of the stage ABI from the plugin side.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_void};

use vigil_plugin_abi::{
    export_stage, kind, log_level, HostApi, HostLogFn, StageRecord, HEADER_BYTES,
    PLUGIN_ABI_VERSION,
};

struct HelloState {
    frames: u64,
    events: u64,
    log: Option<HostLogFn>,
    host_ctx: *mut c_void,
}

impl HelloState {
    fn log(&self, level: u32, msg: &str) {
        let Some(log) = self.log else { return };
        let Ok(msg) = CString::new(msg) else { return };
        unsafe { log(self.host_ctx, level, msg.as_ptr()) };
    }
}

unsafe extern "C-unwind" fn hello_start(
    record: *mut StageRecord,
    host: *const HostApi,
    host_ctx: *mut c_void,
    _config_json: *const c_char,
) -> c_int {
    let mut state = Box::new(HelloState {
        frames: 0,
        events: 0,
        log: None,
        host_ctx,
    });
    if !host.is_null() {
        // Copy the callback out of the borrowed table; the reference is
        // only guaranteed valid until stop returns.
        state.log = (*host).log;
    }
    state.log(log_level::INFO, "hello stage started");
    (*record).instance = Box::into_raw(state) as *mut c_void;
    0
}

unsafe extern "C-unwind" fn hello_stop(record: *mut StageRecord) {
    let instance = (*record).instance;
    if instance.is_null() {
        return;
    }
    let state = Box::from_raw(instance as *mut HelloState);
    state.log(
        log_level::INFO,
        &format!(
            "hello stage stopping after {} frame(s), {} event(s)",
            state.frames, state.events
        ),
    );
    (*record).instance = std::ptr::null_mut();
}

unsafe extern "C-unwind" fn hello_on_frame(record: *mut StageRecord, buf: *const u8, size: usize) {
    let instance = (*record).instance;
    if instance.is_null() || buf.is_null() || size == 0 {
        return;
    }
    let state = &mut *(instance as *mut HelloState);
    if *buf == b'{' {
        state.events += 1;
    } else if size >= HEADER_BYTES {
        state.frames += 1;
    }
}

fn init(record: &mut StageRecord) {
    record.version = PLUGIN_ABI_VERSION;
    record.kind = kind::OUTPUT;
    record.start = Some(hello_start);
    record.stop = Some(hello_stop);
    record.on_frame = Some(hello_on_frame);
}

export_stage!(init);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_populates_record() {
        let mut record = StageRecord::zeroed();
        unsafe { zm_plugin_init(&mut record) };
        assert_eq!(record.version, PLUGIN_ABI_VERSION);
        assert_eq!(record.kind, kind::OUTPUT);
        assert!(record.start.is_some());
        assert!(record.stop.is_some());
        assert!(record.on_frame.is_some());
    }

    #[test]
    fn test_counts_frames_and_clears_instance() {
        let mut record = StageRecord::zeroed();
        unsafe { zm_plugin_init(&mut record) };

        let start = record.start.expect("start");
        let stop = record.stop.expect("stop");
        let on_frame = record.on_frame.expect("on_frame");

        let api = HostApi::empty();
        let code = unsafe { start(&mut record, &api, std::ptr::null_mut(), std::ptr::null()) };
        assert_eq!(code, 0);
        assert!(!record.instance.is_null());

        let frame = [0u8; HEADER_BYTES];
        let event = b"{\"event\":\"StreamConnected\"}";
        unsafe {
            on_frame(&mut record, frame.as_ptr(), frame.len());
            on_frame(&mut record, event.as_ptr(), event.len());
            let state = &*(record.instance as *const HelloState);
            assert_eq!(state.frames, 1);
            assert_eq!(state.events, 1);
            stop(&mut record);
        }
        assert!(record.instance.is_null());
    }
}
