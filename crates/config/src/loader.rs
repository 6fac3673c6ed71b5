use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    Error, Result,
    env_subst::substitute_env,
    schema::NeuronConfig,
    validate::{Severity, validate},
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["neuron.toml", "neuron.yaml", "neuron.yml", "neuron.json"];

/// Load, env-substitute, parse, and validate the config at `path`.
pub fn load_config(path: &Path) -> Result<NeuronConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = parse_config(&substitute_env(&raw), path)?;

    let report = validate(&config);
    for diag in &report.diagnostics {
        match diag.severity {
            Severity::Error => {},
            Severity::Warning => warn!(path = %diag.path, "{}", diag.message),
        }
    }
    if let Some(first) = report.first_error() {
        return Err(Error::invalid(format!("{}: {}", first.path, first.message)));
    }
    Ok(config)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./neuron.{toml,yaml,yml,json}`
/// 2. `~/.config/neuron/neuron.{toml,yaml,yml,json}`
///
/// Falls back to `NeuronConfig::default()` when nothing is found or the file
/// cannot be loaded.
pub fn discover_and_load() -> NeuronConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return NeuronConfig::default();
    };

    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        NeuronConfig::default()
    })
}

fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/neuron/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "neuron").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<NeuronConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat {
            extension: other.to_string(),
        }),
    }
}
