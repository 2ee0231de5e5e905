use kiln_core::config::KilnConfig;
use kiln_core::provider::openai_compatible::ProviderKind;
use kiln_core::provider::selector::ProviderSpec;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Looked up in the current directory when no `--config` is given.
pub const CANDIDATES: &[&str] = &["kiln.yaml", "kiln.yml", "kiln.toml", "kiln.json"];

/// Load the configuration, falling back to defaults when no file exists.
///
/// A config without providers gets [`default_providers`].
pub fn load(explicit: Option<&Path>) -> Result<KilnConfig, String> {
    let mut config = match resolve_config_path(explicit)? {
        Some(path) => {
            debug!(path = %path.display(), "Loading config");
            KilnConfig::from_file(&path).map_err(|e| e.to_string())?
        }
        None => {
            debug!("No config file, using defaults");
            KilnConfig::default()
        }
    };

    if config.providers.is_empty() {
        config.providers = default_providers();
    }
    Ok(config)
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<Option<PathBuf>, String> {
    if let Some(p) = explicit {
        if p.exists() {
            return Ok(Some(p.to_path_buf()));
        }
        return Err(format!("Config file not found: {}", p.display()));
    }

    Ok(CANDIDATES
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists()))
}

/// Every supported vendor, hosted ones first, each reading its
/// conventional API key variable. Ollama needs no key and comes last.
pub fn default_providers() -> Vec<ProviderSpec> {
    ProviderKind::ALL.into_iter().map(ProviderSpec::new).collect()
}
