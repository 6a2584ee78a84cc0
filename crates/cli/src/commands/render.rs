//! `promptloom render`: render a template against a JSON context.

use clap::Args;
use promptloom_config::AppConfig;
use promptloom_engine::{RenderOptions, SourceRegistry, render_with_report};
use promptloom_template::{Injection, Lane};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

#[derive(Args)]
pub struct RenderArgs {
    /// Template file (TOML or JSON)
    template: PathBuf,

    /// JSON context; each top-level key becomes a source
    #[arg(long)]
    context: Option<PathBuf>,

    /// JSON injection requests, or `{ "lanes": [...], "injections": [...] }`
    #[arg(long)]
    injections: Option<PathBuf>,

    /// Override budget.max_tokens
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Print the render report alongside the messages
    #[arg(long)]
    report: bool,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum InjectionFile {
    Requests(Vec<Injection>),
    Full {
        #[serde(default)]
        lanes: Vec<Lane>,
        #[serde(default)]
        injections: Vec<Injection>,
    },
}

pub fn run(args: &RenderArgs, config: &AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let compiled = super::load_compiled(&args.template, config)?;

    let context = match &args.context {
        Some(path) => read_json::<Value>(path)?,
        None => Value::Object(Default::default()),
    };
    let options = match &args.injections {
        Some(path) => match read_json::<InjectionFile>(path)? {
            InjectionFile::Requests(injections) => RenderOptions::default().with_injections(injections),
            InjectionFile::Full { lanes, injections } => RenderOptions::default()
                .with_lanes(lanes)
                .with_injections(injections),
        },
        None => RenderOptions::default(),
    };

    let mut budget = config.budget.clone();
    if let Some(max_tokens) = args.max_tokens {
        budget.max_tokens = max_tokens;
    }

    let registry = SourceRegistry::from_context_keys(&context);
    let output = render_with_report(&compiled, &context, &budget, &registry, &options)?;

    let json = if args.report {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string_pretty(&output.messages)?
    };
    println!("{json}");
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Box<dyn std::error::Error>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    serde_json::from_str(&raw).map_err(|e| format!("Invalid JSON in {}: {e}", path.display()).into())
}
