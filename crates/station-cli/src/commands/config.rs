//! Config command - print the effective configuration

use std::path::Path;

use anyhow::{Context, Result};
use station_uds::StationConfig;

use crate::output::{OutputContext, OutputFormat};

pub fn show_config(config: &StationConfig, source: Option<&Path>, out: &OutputContext) -> Result<()> {
    match out.format {
        OutputFormat::Text => {
            let source = source
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_string());
            out.info(&format!("# source: {}", source));
            let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        OutputFormat::Json => {
            let rendered =
                serde_json::to_string_pretty(config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
    }
    Ok(())
}
