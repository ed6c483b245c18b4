// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Dynamic stage module loading.
//!
//! Resolves a shared library (.so/.dylib/.dll), finds its `zm_plugin_init`
//! symbol and materializes [`StageHandle`]s from it. Loaded libraries must
//! remain alive while any handle built from them is in use; the pipeline
//! keeps an `Arc<StageModule>` per handle and drops the modules last, so
//! unloading cannot race live stage code.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;

use vigil_plugin_abi::{StageRecord, STAGE_INIT_SYMBOL};

use crate::core::error::{HostError, Result};
use crate::core::stage::StageHandle;

type StageInitFn = unsafe extern "C" fn(*mut StageRecord);

/// A loaded stage shared library.
pub struct StageModule {
    library: Library,
    path: PathBuf,
}

impl StageModule {
    /// Load the shared library at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>> {
        let library = unsafe { Library::new(path) }.map_err(|e| HostError::ModuleLoadFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        tracing::debug!("loaded stage module '{}'", path.display());
        Ok(Arc::new(Self {
            library,
            path: path.to_path_buf(),
        }))
    }

    /// Initialize a stage instance from this module.
    ///
    /// Hands the init symbol a zeroed record, then validates what the
    /// module wrote (ABI version, kind, entry points) before anything else
    /// can touch it.
    pub fn init(self: &Arc<Self>, config_json: &str) -> Result<StageHandle> {
        let init: libloading::Symbol<'_, StageInitFn> =
            unsafe { self.library.get(STAGE_INIT_SYMBOL) }.map_err(|_| {
                HostError::SymbolMissing {
                    path: self.path.clone(),
                }
            })?;

        let mut record = Box::new(StageRecord::zeroed());
        unsafe { init(record.as_mut()) };

        StageHandle::new(record, Some(Arc::clone(self)), config_json, &self.path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
