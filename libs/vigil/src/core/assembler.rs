// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Turns a pipeline description into a ready-to-start [`Pipeline`].
//!
//! Assembly is all-or-nothing: if any stage fails to load, init or
//! validate, every stage already materialized is torn down in reverse
//! order and the error is surfaced. A failed assembly leaves no stage
//! started and no thread running.

use crate::core::config::HostConfig;
use crate::core::descriptor::PipelineDescription;
use crate::core::error::{HostError, Result};
use crate::core::loader::StageModule;
use crate::core::pipeline::Pipeline;
use crate::core::stage::StageHandle;

/// Load every stage of `description` and assemble the capture/dispatch
/// topology. The returned pipeline has not been started.
pub fn assemble(description: &PipelineDescription, config: HostConfig) -> Result<Pipeline> {
    let resolved = description.resolve(&config.plugin_root)?;
    tracing::debug!("assembling pipeline with {} stage(s)", resolved.len());

    let mut loaded: Vec<(StageHandle, _)> = Vec::with_capacity(resolved.len());
    for stage in &resolved {
        // Store sinks template their output paths on the monitor id; every
        // stage gets it unless its own config already says otherwise.
        let config_json = match config.monitor_id {
            Some(id) => with_monitor_id(&stage.config_json, id)?,
            None => stage.config_json.clone(),
        };
        let handle = match StageModule::open(&stage.path)
            .and_then(|module| module.init(&config_json))
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("assembly failed at '{}': {}", stage.path.display(), e);
                // Reverse-order teardown of everything loaded so far; each
                // handle drops before the module it came from.
                while loaded.pop().is_some() {}
                return Err(e);
            }
        };
        tracing::debug!(
            "loaded {} stage from '{}'",
            handle.kind(),
            stage.path.display()
        );
        loaded.push((handle, stage.stream_filter.clone()));
    }

    Pipeline::from_parts(loaded, config)
}

fn with_monitor_id(config_json: &str, monitor_id: i64) -> Result<String> {
    let mut value: serde_json::Value =
        serde_json::from_str(config_json).map_err(|e| HostError::MalformedPipeline {
            reason: format!("stage config is not valid JSON: {}", e),
        })?;
    if let Some(object) = value.as_object_mut() {
        object
            .entry("monitor_id")
            .or_insert_with(|| monitor_id.into());
    }
    serde_json::to_string(&value).map_err(|e| HostError::MalformedPipeline {
        reason: format!("cannot re-serialize stage config: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembly_fails_on_missing_module() {
        let description = PipelineDescription::from_json_str(
            r#"{"plugins":[{"path":"/nonexistent/libcapture.so"}]}"#,
        )
        .unwrap();
        let config = HostConfig::from_description(&description).unwrap();
        match assemble(&description, config) {
            Err(HostError::ModuleLoadFailed { path, .. }) => {
                assert_eq!(path.to_str(), Some("/nonexistent/libcapture.so"));
            }
            Err(other) => panic!("expected ModuleLoadFailed, got {}", other),
            Ok(_) => panic!("assembly unexpectedly succeeded"),
        }
    }

    #[test]
    fn test_monitor_id_threaded_into_stage_configs() {
        let merged = with_monitor_id(r#"{"base_path":"/var/media"}"#, 7).unwrap();
        let value: serde_json::Value = serde_json::from_str(&merged).unwrap();
        assert_eq!(value["monitor_id"], 7);
        assert_eq!(value["base_path"], "/var/media");

        // A stage's own monitor_id wins.
        let kept = with_monitor_id(r#"{"monitor_id":3}"#, 7).unwrap();
        let value: serde_json::Value = serde_json::from_str(&kept).unwrap();
        assert_eq!(value["monitor_id"], 3);
    }

    #[test]
    fn test_assembly_rejects_malformed_description() {
        let description = PipelineDescription::from_json_str(r#"{"plugins":[{}]}"#).unwrap();
        let config = HostConfig::from_description(&description).unwrap();
        assert!(matches!(
            assemble(&description, config),
            Err(HostError::MalformedPipeline { .. })
        ));
    }
}
