//! `validate` command
//!
//! Loads every given settings file the same way `serve` would, without
//! opening any socket.

use std::path::Path;

use serde_json::json;

use crate::cli::args::{OutputFormat, ValidateArgs};
use crate::config::{ConfigLoader, LoadResult};
use crate::error::{ConfigError, RsbbError};

/// Validate settings files and the documents they reference.
///
/// # Errors
///
/// Returns the first configuration error found, or
/// [`ConfigError::StrictWarnings`] when `--strict` is set and a file
/// produced warnings.
pub fn run(args: &ValidateArgs) -> Result<(), RsbbError> {
    let loader = ConfigLoader::with_defaults();
    for path in &args.files {
        tracing::info!(file = %path.display(), "validating configuration");
        let result = loader.load(path)?;

        for warning in &result.warnings {
            tracing::warn!(
                location = warning.location.as_deref().unwrap_or("<unknown>"),
                "{}",
                warning.message
            );
        }
        report(path, &result, args.format);

        if args.strict && !result.warnings.is_empty() {
            return Err(ConfigError::StrictWarnings {
                path: path.clone(),
                count: result.warnings.len(),
            }
            .into());
        }
    }
    Ok(())
}

fn report(path: &Path, result: &LoadResult, format: OutputFormat) {
    let config = &result.config;
    match format {
        OutputFormat::Human => {
            println!(
                "{}: ok ({} benchmarks, {} teams, {} scheduled trials, {} warnings)",
                path.display(),
                config.catalog.len(),
                config.passwords.len(),
                config.schedule.len(),
                result.warnings.len()
            );
        }
        OutputFormat::Json => {
            let line = json!({
                "file": path.display().to_string(),
                "benchmarks": config.catalog.codes().collect::<Vec<_>>(),
                "teams": config.passwords.len(),
                "schedule": config.schedule.iter().map(crate::config::TrialEvent::id).collect::<Vec<_>>(),
                "warnings": result.warnings.iter().map(|w| w.message.as_str()).collect::<Vec<_>>(),
            });
            println!("{line}");
        }
    }
}
