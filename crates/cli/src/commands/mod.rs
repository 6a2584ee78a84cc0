pub mod check;
pub mod config_cmd;
pub mod render;

use promptloom_config::AppConfig;
use promptloom_template::{CompiledTemplate, Template, compile};
use std::path::Path;

/// Load a template by extension: `.json` is JSON, anything else TOML.
pub fn load_template(path: &Path) -> Result<Template, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read template {}: {e}", path.display()))?;
    let template = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => Template::from_json(&raw)?,
        _ => Template::from_toml(&raw)?,
    };
    tracing::debug!(path = %path.display(), id = %template.id, "Template loaded");
    Ok(template)
}

/// Load and compile, failing on lints when `render.strict_lints` is set.
pub fn load_compiled(
    path: &Path,
    config: &AppConfig,
) -> Result<CompiledTemplate, Box<dyn std::error::Error>> {
    let compiled = compile(&load_template(path)?)?;
    if config.render.strict_lints && !compiled.lints().is_empty() {
        let lints: Vec<String> = compiled.lints().iter().map(ToString::to_string).collect();
        return Err(format!("strict lints enabled: {}", lints.join("; ")).into());
    }
    Ok(compiled)
}
