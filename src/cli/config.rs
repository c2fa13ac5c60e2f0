//! Translation of CLI flags into a configuration override

use crate::cli::main_impl::Cli;
use crate::config::ExecutionProvider;
use anyhow::{Context, Result};
use serde_json::{json, Map, Value};

pub(crate) struct CliConfigBuilder;

impl CliConfigBuilder {
    /// Reject flag combinations before any work starts
    pub(crate) fn validate_cli(cli: &Cli) -> Result<()> {
        if cli.scale == 0 {
            anyhow::bail!("--scale must be at least 1");
        }
        if let Some(min_score) = cli.min_score {
            if !(0.0..=1.0).contains(&min_score) {
                anyhow::bail!("--min-score must be within [0, 1], got {min_score}");
            }
        }
        if cli.concurrency == Some(0) {
            anyhow::bail!("--concurrency must be at least 1");
        }
        Ok(())
    }

    /// JSON fragment merged onto the loaded configuration; `None` when no
    /// flag overrides anything
    pub(crate) fn overrides(cli: &Cli) -> Result<Option<Value>> {
        let mut device = Map::new();
        if let Some(provider) = &cli.execution_provider {
            let provider: ExecutionProvider = provider
                .parse()
                .context("Invalid execution provider")?;
            device.insert("execution_provider".into(), serde_json::to_value(provider)?);
        }
        if let Some(memory) = cli.device_memory_mb {
            device.insert("device_memory_mb".into(), json!(memory));
        }
        if let Some(timeout) = cli.device_timeout_ms {
            device.insert("wait_timeout_ms".into(), json!(timeout));
        }
        if cli.threads > 0 {
            device.insert("intra_threads".into(), json!(cli.threads));
        }

        let mut patch = Map::new();
        if !device.is_empty() {
            patch.insert("backends".into(), json!({ "device": device }));
        }
        if let Some(min_score) = cli.min_score {
            patch.insert("quality".into(), json!({ "min_score": min_score }));
        }
        if let Some(concurrency) = cli.concurrency {
            patch.insert("engine".into(), json!({ "batch_concurrency": concurrency }));
        }
        if cli.scale > 8 {
            if let Some(engine) = patch
                .entry("engine")
                .or_insert_with(|| json!({}))
                .as_object_mut()
            {
                engine.insert("max_scale_factor".into(), json!(cli.scale));
            }
        }

        Ok((!patch.is_empty()).then_some(Value::Object(patch)))
    }
}
