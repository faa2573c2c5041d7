//! Configuration loading from `~/.buslink/gateway.toml`.
//!
//! Supports config includes: the `include` field lists additional TOML files
//! to load and deep-merge before the root config (root overrides includes).
//! Every read, parse, include and validation problem is returned as an error.

use crate::error::{GatewayError, GatewayResult};
use buslink_types::config::GatewayConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

/// Maximum include nesting depth.
const MAX_INCLUDE_DEPTH: u32 = 10;

/// Load and validate the gateway configuration at `path`.
///
/// If the config contains an `include` field, included files are loaded
/// and deep-merged first, then the root config overrides them.
pub fn load_config(path: &Path) -> GatewayResult<GatewayConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| GatewayError::ReadConfig {
        path: path.to_path_buf(),
        source,
    })?;
    let parse_error = |message: String| GatewayError::ParseConfig {
        path: path.to_path_buf(),
        message,
    };

    let mut root_value: toml::Value =
        toml::from_str(&contents).map_err(|e| parse_error(e.to_string()))?;

    let config_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let mut visited = HashSet::new();
    visited.insert(std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()));
    resolve_config_includes(&mut root_value, &config_dir, &mut visited, 0).map_err(parse_error)?;

    if let toml::Value::Table(ref mut tbl) = root_value {
        tbl.remove("include");
    }

    let config: GatewayConfig = root_value
        .try_into()
        .map_err(|e: toml::de::Error| parse_error(e.to_string()))?;
    config.validate()?;

    info!(
        path = %path.display(),
        listeners = config.listeners.len(),
        inbound = config.inbound.len(),
        outbound = config.outbound.len(),
        "Loaded configuration"
    );
    Ok(config)
}

/// Resolve config includes by deep-merging included files into the root value.
///
/// Included files are loaded first and the root config overrides them.
/// Rejects absolute paths, `..` components, and circular references.
fn resolve_config_includes(
    root_value: &mut toml::Value,
    config_dir: &Path,
    visited: &mut HashSet<PathBuf>,
    depth: u32,
) -> Result<(), String> {
    if depth > MAX_INCLUDE_DEPTH {
        return Err(format!(
            "Config include depth exceeded maximum of {MAX_INCLUDE_DEPTH}"
        ));
    }

    let includes = match root_value {
        toml::Value::Table(tbl) => match tbl.get("include") {
            Some(toml::Value::Array(arr)) => arr
                .iter()
                .map(|v| {
                    v.as_str()
                        .map(String::from)
                        .ok_or_else(|| format!("Config include entries must be strings, got {v}"))
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(format!("Config include must be an array, got {other}"));
            }
            None => return Ok(()),
        },
        _ => return Ok(()),
    };

    if includes.is_empty() {
        return Ok(());
    }

    let mut merged_base = toml::Value::Table(toml::map::Map::new());

    for include_path_str in &includes {
        let include_path = Path::new(include_path_str);
        if include_path.is_absolute() {
            return Err(format!(
                "Config include rejects absolute path: {include_path_str}"
            ));
        }
        if include_path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(format!(
                "Config include rejects path traversal: {include_path_str}"
            ));
        }

        let resolved = config_dir.join(include_path);
        let canonical = std::fs::canonicalize(&resolved)
            .map_err(|e| format!("Config include '{include_path_str}' cannot be resolved: {e}"))?;
        let canonical_dir = std::fs::canonicalize(config_dir)
            .map_err(|e| format!("Config dir cannot be canonicalized: {e}"))?;
        if !canonical.starts_with(&canonical_dir) {
            return Err(format!(
                "Config include '{include_path_str}' escapes config directory"
            ));
        }

        if !visited.insert(canonical.clone()) {
            return Err(format!(
                "Circular config include detected: {include_path_str}"
            ));
        }

        info!(include = %include_path_str, "Loading config include");

        let contents = std::fs::read_to_string(&canonical)
            .map_err(|e| format!("Failed to read config include '{include_path_str}': {e}"))?;
        let mut include_value: toml::Value = toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config include '{include_path_str}': {e}"))?;

        let include_dir = canonical.parent().unwrap_or(config_dir).to_path_buf();
        resolve_config_includes(&mut include_value, &include_dir, visited, depth + 1)?;

        if let toml::Value::Table(ref mut tbl) = include_value {
            tbl.remove("include");
        }

        deep_merge_toml(&mut merged_base, &include_value);
    }

    let root_without_include = {
        let mut v = root_value.clone();
        if let toml::Value::Table(ref mut tbl) = v {
            tbl.remove("include");
        }
        v
    };
    deep_merge_toml(&mut merged_base, &root_without_include);
    *root_value = merged_base;

    Ok(())
}

/// Deep-merge two TOML values. `overlay` values override `base` values.
///
/// Tables merge recursively. Everything else, arrays of domains included,
/// is replaced by the overlay.
pub fn deep_merge_toml(base: &mut toml::Value, overlay: &toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base_tbl), toml::Value::Table(overlay_tbl)) => {
            for (key, overlay_val) in overlay_tbl {
                if let Some(base_val) = base_tbl.get_mut(key) {
                    deep_merge_toml(base_val, overlay_val);
                } else {
                    base_tbl.insert(key.clone(), overlay_val.clone());
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    buslink_home().join("gateway.toml")
}

/// Get the default Buslink home directory.
pub fn buslink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".buslink")
}
