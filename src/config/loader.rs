//! Reading and merging YAML configuration documents.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::error::ConfigError;

/// Reads every file in order and deep-merges them into one document.
///
/// Later files win. An empty file contributes nothing.
pub fn load_yaml_files<P: AsRef<Path>>(paths: &[P]) -> Result<Value, ConfigError> {
    if paths.is_empty() {
        return Err(ConfigError::NoConfigFiles);
    }

    let mut merged = Value::Mapping(Mapping::new());
    for path in paths {
        let path = path.as_ref();
        let document = load_yaml_file(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        merged = merge_values(&merged, &document);
    }
    Ok(merged)
}

fn load_yaml_file(path: &Path) -> Result<Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: PathBuf::from(path),
        source,
    })?;
    let value: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: PathBuf::from(path),
        source,
    })?;
    Ok(value)
}

/// Returns `overlay` merged onto `base`.
///
/// Mappings merge key by key, recursively. Any other overlay value,
/// sequences included, replaces the base value. A null overlay leaves the
/// base unchanged.
pub fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let value = match base_map.get(key) {
                    Some(base_value) => merge_values(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            Value::Mapping(merged)
        }
        (_, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}
