// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Declarative pipeline description format.
//!
//! The description is an ordered tree of stage descriptors with per-stage
//! configuration blobs. The assembler flattens it depth-first; flatten
//! order is sink delivery order.
//!
//! # Example Pipeline File
//!
//! ```json
//! {
//!   "monitor_id": 3,
//!   "plugins": [
//!     { "kind": "capture_rtsp", "config": { "url": "rtsp://cam3/stream" },
//!       "children": [
//!         { "kind": "store_filesystem", "cfg": { "stream_filter": [0] } },
//!         { "path": "plugins/motion/motion.so" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::config::RingConfig;
use crate::core::error::{HostError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDescription {
    pub plugins: Vec<StageDescriptor>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ring: Option<RingConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monitor_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drop_report_interval_ms: Option<u64>,
}

/// One node of the stage tree. Either `path` (explicit shared library) or
/// `kind` (resolved against the plugin root layout) must be present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Arbitrary per-stage blob, re-serialized verbatim as the stage's
    /// config JSON. `cfg` is accepted as an alias.
    #[serde(default, alias = "cfg", skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StageDescriptor>,
}

/// A flattened, path-resolved stage ready for loading.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedStage {
    pub path: PathBuf,
    pub config_json: String,
    /// Host-recognized `stream_filter` key from the stage's config blob.
    /// `None` admits every stream; filters apply to Frame units only.
    pub stream_filter: Option<HashSet<u32>>,
}

impl PipelineDescription {
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| HostError::MalformedPipeline {
            reason: format!("cannot open pipeline file '{}': {}", path.display(), e),
        })?;
        serde_json::from_reader(file).map_err(|e| HostError::MalformedPipeline {
            reason: format!("cannot parse pipeline file '{}': {}", path.display(), e),
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| HostError::MalformedPipeline {
            reason: format!("cannot parse pipeline JSON: {}", e),
        })
    }

    /// Flatten the stage tree depth-first (parent before children,
    /// preserving child order) and resolve each node to a library path.
    pub fn resolve(&self, plugin_root: &Path) -> Result<Vec<ResolvedStage>> {
        if self.plugins.is_empty() {
            return Err(HostError::MalformedPipeline {
                reason: "pipeline has no stages".to_string(),
            });
        }
        let mut flat = Vec::new();
        for descriptor in &self.plugins {
            flatten_into(descriptor, plugin_root, &mut flat)?;
        }
        Ok(flat)
    }
}

fn flatten_into(
    descriptor: &StageDescriptor,
    plugin_root: &Path,
    out: &mut Vec<ResolvedStage>,
) -> Result<()> {
    out.push(resolve_one(descriptor, plugin_root)?);
    for child in &descriptor.children {
        flatten_into(child, plugin_root, out)?;
    }
    Ok(())
}

fn resolve_one(descriptor: &StageDescriptor, plugin_root: &Path) -> Result<ResolvedStage> {
    let path = match (&descriptor.path, &descriptor.kind) {
        (Some(path), _) => path.clone(),
        (None, Some(kind)) => plugin_root
            .join(kind)
            .join(format!("{}{}", kind, plugin_extension())),
        (None, None) => {
            return Err(HostError::MalformedPipeline {
                reason: "stage descriptor has neither 'path' nor 'kind'".to_string(),
            })
        }
    };

    let config_json = match &descriptor.config {
        Some(value) => serde_json::to_string(value).map_err(|e| HostError::MalformedPipeline {
            reason: format!("cannot serialize config for '{}': {}", path.display(), e),
        })?,
        None => "{}".to_string(),
    };

    let stream_filter = parse_stream_filter(descriptor.config.as_ref(), &path)?;

    Ok(ResolvedStage {
        path,
        config_json,
        stream_filter,
    })
}

/// Pull a `stream_filter` array out of a stage's config blob. An absent or
/// empty array admits all streams.
fn parse_stream_filter(
    config: Option<&serde_json::Value>,
    path: &Path,
) -> Result<Option<HashSet<u32>>> {
    let Some(raw) = config.and_then(|c| c.get("stream_filter")) else {
        return Ok(None);
    };
    let malformed = |detail: &str| HostError::MalformedPipeline {
        reason: format!(
            "stream_filter for '{}' {}, expected an array of stream ids",
            path.display(),
            detail
        ),
    };
    let entries = raw.as_array().ok_or_else(|| malformed("is not an array"))?;
    let mut filter = HashSet::with_capacity(entries.len());
    for entry in entries {
        let id = entry
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| malformed("contains a non-integer entry"))?;
        filter.insert(id);
    }
    if filter.is_empty() {
        return Ok(None);
    }
    Ok(Some(filter))
}

/// Shared-library suffix for the platform's `plugins/<kind>/<kind><ext>`
/// layout.
pub fn plugin_extension() -> &'static str {
    if cfg!(target_os = "windows") {
        ".dll"
    } else if cfg!(target_os = "macos") {
        ".dylib"
    } else {
        ".so"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_is_depth_first() {
        let desc = PipelineDescription::from_json_str(
            r#"{
                "plugins": [
                    { "path": "a.so", "children": [
                        { "path": "b.so", "children": [ { "path": "c.so" } ] },
                        { "path": "d.so" }
                    ]},
                    { "path": "e.so" }
                ]
            }"#,
        )
        .unwrap();
        let flat = desc.resolve(Path::new("plugins")).unwrap();
        let paths: Vec<&str> = flat
            .iter()
            .map(|s| s.path.to_str().unwrap_or_default())
            .collect();
        assert_eq!(paths, vec!["a.so", "b.so", "c.so", "d.so", "e.so"]);
    }

    #[test]
    fn test_kind_resolves_against_plugin_root() {
        let desc =
            PipelineDescription::from_json_str(r#"{"plugins":[{"kind":"store_filesystem"}]}"#)
                .unwrap();
        let flat = desc.resolve(Path::new("plugins")).unwrap();
        let expected = PathBuf::from("plugins")
            .join("store_filesystem")
            .join(format!("store_filesystem{}", plugin_extension()));
        assert_eq!(flat[0].path, expected);
    }

    #[test]
    fn test_cfg_alias_and_config_passthrough() {
        let desc = PipelineDescription::from_json_str(
            r#"{"plugins":[{"path":"s.so","cfg":{"base_path":"/var/media","max_secs":300}}]}"#,
        )
        .unwrap();
        let flat = desc.resolve(Path::new("plugins")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&flat[0].config_json).unwrap();
        assert_eq!(value["base_path"], "/var/media");
        assert_eq!(value["max_secs"], 300);
    }

    #[test]
    fn test_missing_path_and_kind_rejected() {
        let desc =
            PipelineDescription::from_json_str(r#"{"plugins":[{"config":{}}]}"#).unwrap();
        assert!(matches!(
            desc.resolve(Path::new("plugins")),
            Err(HostError::MalformedPipeline { .. })
        ));
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let desc = PipelineDescription::from_json_str(r#"{"plugins":[]}"#).unwrap();
        assert!(matches!(
            desc.resolve(Path::new("plugins")),
            Err(HostError::MalformedPipeline { .. })
        ));
    }

    #[test]
    fn test_invalid_json_is_hard_error() {
        assert!(matches!(
            PipelineDescription::from_json_str("{\"plugins\": ["),
            Err(HostError::MalformedPipeline { .. })
        ));
    }

    #[test]
    fn test_stream_filter_extraction() {
        let desc = PipelineDescription::from_json_str(
            r#"{"plugins":[
                {"path":"a.so","config":{"stream_filter":[0,2]}},
                {"path":"b.so","config":{"stream_filter":[]}},
                {"path":"c.so"}
            ]}"#,
        )
        .unwrap();
        let flat = desc.resolve(Path::new("plugins")).unwrap();
        assert_eq!(
            flat[0].stream_filter,
            Some(HashSet::from([0, 2]))
        );
        // Empty filter admits all, same as no filter.
        assert_eq!(flat[1].stream_filter, None);
        assert_eq!(flat[2].stream_filter, None);
    }

    #[test]
    fn test_stream_filter_type_errors_rejected() {
        for bad in [
            r#"{"plugins":[{"path":"a.so","config":{"stream_filter":"0"}}]}"#,
            r#"{"plugins":[{"path":"a.so","config":{"stream_filter":[0,"one"]}}]}"#,
            r#"{"plugins":[{"path":"a.so","config":{"stream_filter":[-1]}}]}"#,
        ] {
            let desc = PipelineDescription::from_json_str(bad).unwrap();
            assert!(matches!(
                desc.resolve(Path::new("plugins")),
                Err(HostError::MalformedPipeline { .. })
            ));
        }
    }
}
