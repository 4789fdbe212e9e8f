//! Parameter persistence.
//!
//! The archive is a flat JSON map from `"<index>_<component>.<parameter>"`
//! keys to per-pixel parameter maps. Keys are lowercased with spaces
//! replaced by underscores, so archives stay stable across cosmetic
//! component renames that only change case or spacing. Unknown standard
//! errors serialize as JSON nulls and survive a round trip exactly.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::model::{Model, ParameterMap};

#[derive(Debug, Serialize, Deserialize)]
struct ParameterArchive {
    saved_at: String,
    entries: BTreeMap<String, ParameterMap>,
}

fn parameter_key(index: usize, component: &str, parameter: &str) -> String {
    format!("{index}_{component}.{parameter}")
        .to_lowercase()
        .replace(' ', "_")
}

/// Write every parameter map of the model to a JSON archive.
pub fn save_parameters_to_file(model: &Model, path: &Path) -> Result<(), EngineError> {
    let mut entries = BTreeMap::new();
    for (ci, component) in model.components().iter().enumerate() {
        for parameter in component.parameters() {
            let map = parameter.map().ok_or_else(|| {
                EngineError::io(format!(
                    "Parameter '{}' of component '{}' has no map to save.",
                    parameter.name, component.name
                ))
            })?;
            entries.insert(
                parameter_key(ci, &component.name, &parameter.name),
                map.clone(),
            );
        }
    }
    let archive = ParameterArchive {
        saved_at: Local::now().to_rfc3339(),
        entries,
    };
    let json = serde_json::to_string_pretty(&archive)
        .map_err(|e| EngineError::io(format!("Could not serialize parameters: {e}")))?;
    fs::write(path, json).map_err(|e| {
        EngineError::io(format!("Could not write {}: {e}", path.display()))
    })
}

/// Load parameter maps from a JSON archive into a structurally matching
/// model, then charge the working values at the current coordinate.
///
/// Every parameter of the model must be present in the archive with a
/// matching navigation size and element count.
pub fn load_parameters_from_file(model: &mut Model, path: &Path) -> Result<(), EngineError> {
    let json = fs::read_to_string(path).map_err(|e| {
        EngineError::io(format!("Could not read {}: {e}", path.display()))
    })?;
    let archive: ParameterArchive = serde_json::from_str(&json)
        .map_err(|e| EngineError::io(format!("Could not parse {}: {e}", path.display())))?;

    let nav_size = model.spectrum().nav_size();
    let keys: Vec<Vec<String>> = model
        .components()
        .iter()
        .enumerate()
        .map(|(ci, component)| {
            component
                .parameters()
                .iter()
                .map(|p| parameter_key(ci, &component.name, &p.name))
                .collect()
        })
        .collect();

    for (ci, component_keys) in keys.iter().enumerate() {
        for (pi, key) in component_keys.iter().enumerate() {
            let map = archive.entries.get(key).ok_or_else(|| {
                EngineError::io(format!("Archive {} has no entry '{key}'.", path.display()))
            })?;
            if map.nav_size() != nav_size {
                return Err(EngineError::io(format!(
                    "Entry '{key}' covers {} pixels, the dataset has {nav_size}.",
                    map.nav_size()
                )));
            }
            model.component_mut(ci).parameters_mut()[pi].set_map(map.clone())?;
        }
    }
    model.charge(false);
    Ok(())
}
