use anyhow::Context;
use killchain_core::config::{Config, WarnLevel};
use std::path::Path;

/// Command-line values that sit above the environment layer.
#[derive(Debug, Default)]
pub struct Overrides<'a> {
    pub url: Option<&'a str>,
    pub adversaries: Option<&'a str>,
    pub group: Option<&'a str>,
}

/// Build the effective configuration.
///
/// Precedence, lowest first:
/// 1. Built-in defaults
/// 2. YAML file from `--config` / `KC_CONFIG`
/// 3. Process environment (`CALDERA_URL`, `ADV_LIST`, `ENABLEKC<N>`, ...)
/// 4. Command-line flags
pub fn load(path: Option<&Path>, overrides: &Overrides<'_>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(p) => Config::load(p)
            .with_context(|| format!("failed to load config from {}", p.display()))?,
        None => Config::default(),
    };

    config
        .apply_env(std::env::vars())
        .context("invalid environment configuration")?;

    if let Some(url) = overrides.url {
        config.control_plane.url = url.to_string();
    }
    if let Some(list) = overrides.adversaries {
        config.adversaries.list = list.to_string();
    }
    if let Some(group) = overrides.group {
        config.adversaries.default_group = group.to_string();
    }

    let warnings = config.validate();
    for w in &warnings {
        let label = match w.level {
            WarnLevel::Warning => "warning",
            WarnLevel::Error => "error",
        };
        eprintln!("config {label}: {}", w.message);
    }
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("configuration has {errors} error(s)");
    }

    Ok(config)
}
