use kiln_core::config::KilnConfig;
use std::fs;
use std::path::Path;

use crate::config::default_providers;

const FORMATS: &[&str] = &["yaml", "toml", "json"];

/// Write a starter `kiln.<format>` into the current directory.
pub fn write_starter_config(format: &str, force: bool) -> Result<(), String> {
    if !FORMATS.contains(&format) {
        return Err(format!(
            "Unknown format '{format}'. Available: {}",
            FORMATS.join(", ")
        ));
    }

    let file_name = format!("kiln.{format}");
    let path = Path::new(&file_name);
    if path.exists() && !force {
        return Err(format!("{file_name} already exists (use --force to overwrite)"));
    }

    let content = match format {
        "yaml" => YAML_TEMPLATE.to_string(),
        "toml" => TOML_TEMPLATE.to_string(),
        _ => json_template()?,
    };
    fs::write(path, content).map_err(|e| format!("{file_name}: {e}"))?;

    println!("Created {file_name}");
    println!();
    println!("  export OPENAI_API_KEY=...   # or DEEPSEEK_API_KEY, GROQ_API_KEY, OPENROUTER_API_KEY");
    println!("  kiln runtimes               # check local interpreters");
    println!("  kiln generate \"fizzbuzz in python\" --execute");
    println!();
    Ok(())
}

fn json_template() -> Result<String, String> {
    let config = KilnConfig {
        providers: default_providers(),
        ..Default::default()
    };
    config.to_json().map_err(|e| e.to_string())
}

const YAML_TEMPLATE: &str = r#"# Kiln configuration
#
# Providers are tried in order; the first one whose API key resolves is used.
# `api_key` may be a literal or a ${VAR} reference and defaults to the
# provider's conventional environment variable.
providers:
  - kind: openai
    model: gpt-4o-mini
  - kind: deepseek
    model: deepseek-chat
  - kind: ollama
    model: llama3.2

sandbox:
  timeout_ms: 30000
  max_memory_mb: 512
  allow_network: false
  # Landlock (Linux); set false where `kiln runtimes` reports it unavailable
  read_only: true

execution:
  max_concurrent: 4
  python: true
  javascript: true
  shell: true

generation:
  temperature: 0.2
  stream: true
"#;

const TOML_TEMPLATE: &str = r#"# Kiln configuration
#
# Providers are tried in order; the first one whose API key resolves is used.

[[providers]]
kind = "openai"
model = "gpt-4o-mini"

[[providers]]
kind = "deepseek"
model = "deepseek-chat"

[[providers]]
kind = "ollama"
model = "llama3.2"

[sandbox]
timeout_ms = 30000
max_memory_mb = 512
allow_network = false
# Landlock (Linux); set false where `kiln runtimes` reports it unavailable
read_only = true

[execution]
max_concurrent = 4

[generation]
temperature = 0.2
stream = true
"#;
