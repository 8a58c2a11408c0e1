//! On-disk parameter file: INI sections per detector, `name=value` lines.
//!
//! Written atomically (temp file + rename) on every accepted control
//! command. The writer emits parameters in a fixed order with three-decimal
//! values, so rewriting an unchanged set is byte-identical. Reading is
//! lenient: unknown sections and keys are ignored, out-of-range values fall
//! back to the default with a warning.

use std::fs;
use std::path::Path;

use configparser::ini::Ini;

use crate::config::{ParamId, TunableParams};
use crate::errors::ConfigError;

/// Serialize the full parameter set in the canonical section order.
pub fn render(params: &TunableParams) -> String {
    let mut out = String::new();
    let mut current_section = "";
    for id in ParamId::ALL {
        let spec = id.spec();
        if spec.section != current_section {
            if !current_section.is_empty() {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", spec.section));
            current_section = spec.section;
        }
        out.push_str(&format!("{}={:.3}\n", spec.key, id.get(params)));
    }
    out
}

/// Atomic write: temp file in the same directory, then rename over.
pub fn store(path: &Path, params: &TunableParams) -> Result<(), ConfigError> {
    let rendered = render(params);
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, rendered)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Result of a lenient load.
pub struct LoadedParams {
    pub params: TunableParams,
    /// One message per ignored or defaulted value
    pub warnings: Vec<String>,
}

/// Read the file, fall back to defaults per-key. A missing file yields all
/// defaults with no warnings; a malformed file is an error.
pub fn load(path: &Path) -> Result<LoadedParams, ConfigError> {
    let mut params = TunableParams::default();
    let mut warnings = Vec::new();

    if !path.exists() {
        return Ok(LoadedParams { params, warnings });
    }

    let mut ini = Ini::new();
    ini.load(path).map_err(|e| ConfigError::ParameterFile {
        reason: e.to_string(),
    })?;

    for id in ParamId::ALL {
        let spec = id.spec();
        match ini.getfloat(spec.section, spec.key) {
            Ok(Some(value)) => {
                if id.set(&mut params, value).is_err() {
                    warnings.push(format!(
                        "{}.{} = {} out of range {}..{}, using default {}",
                        spec.section, spec.key, value, spec.min, spec.max, spec.default
                    ));
                }
            }
            Ok(None) => {}
            Err(_) => {
                warnings.push(format!(
                    "{}.{} is not a number, using default {}",
                    spec.section, spec.key, spec.default
                ));
            }
        }
    }

    Ok(LoadedParams { params, warnings })
}
