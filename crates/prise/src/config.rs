//! Configuration loading.
//!
//! `~/.config/prise/prise.toml`, resolved through XDG. Everything is
//! optional; CLI flags override config values, config overrides defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PriseConfig {
  /// Listener socket path override.
  #[serde(default)]
  pub socket_path: Option<String>,
  /// Default argv for spawns that name no command.
  #[serde(default)]
  pub shell: Option<Vec<String>>,
  /// Frame clamp override in milliseconds.
  #[serde(default)]
  pub min_frame_interval_ms: Option<u64>,
}

/// Resolve the global config file path.
///
/// # Errors
/// Returns an error if the XDG config home cannot be resolved.
pub fn global_config_path() -> Result<PathBuf> {
  let xdg = xdg::BaseDirectories::with_prefix("prise");
  let config_home = xdg
    .get_config_home()
    .ok_or_else(|| anyhow::anyhow!("unable to resolve XDG config home"))?;
  Ok(config_home.join("prise.toml"))
}

/// Loads config from an explicit path, or from the XDG location when one
/// exists there. No file at all is not an error; defaults apply.
pub fn load(path: Option<&Path>) -> Result<PriseConfig> {
  let file = match path {
    Some(explicit) => Some(explicit.to_path_buf()),
    None => {
      let xdg = xdg::BaseDirectories::with_prefix("prise");
      xdg.find_config_file("prise.toml")
    }
  };
  let Some(file) = file else {
    return Ok(PriseConfig::default());
  };
  let text = fs::read_to_string(&file)
    .with_context(|| format!("read config {}", file.display()))?;
  let config: PriseConfig =
    toml::from_str(&text).with_context(|| format!("parse config {}", file.display()))?;
  Ok(config)
}

/// The user's shell as argv, for spawns that name no command.
#[must_use]
pub fn fallback_shell() -> Vec<String> {
  match std::env::var("SHELL") {
    Ok(shell) if !shell.is_empty() => vec![shell],
    _ => vec!["/bin/sh".to_string()],
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_full_config() {
    let config: PriseConfig = toml::from_str(
      r#"
        socket_path = "/tmp/custom.sock"
        shell = ["/bin/zsh", "-l"]
        min_frame_interval_ms = 16
      "#,
    )
    .unwrap();
    assert_eq!(config.socket_path.as_deref(), Some("/tmp/custom.sock"));
    assert_eq!(
      config.shell,
      Some(vec!["/bin/zsh".to_string(), "-l".to_string()])
    );
    assert_eq!(config.min_frame_interval_ms, Some(16));
  }

  #[test]
  fn empty_config_is_all_defaults() {
    let config: PriseConfig = toml::from_str("").unwrap();
    assert!(config.socket_path.is_none());
    assert!(config.shell.is_none());
    assert!(config.min_frame_interval_ms.is_none());
  }

  #[test]
  fn missing_file_falls_back_to_defaults() {
    let config = load(None).unwrap_or_default();
    let _ = config;
  }

  #[test]
  fn unknown_keys_are_rejected_gracefully() {
    // serde ignores unknown keys by default; the config stays usable.
    let config: PriseConfig = toml::from_str("unknown_key = 1").unwrap();
    assert!(config.socket_path.is_none());
  }
}
