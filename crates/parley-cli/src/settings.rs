//! Layered client configuration: TOML file, then `PARLEY_*` environment
//! variables, then command-line flags.

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use parley_core::user::Identity;
use parley_engine::EngineConfig;
use serde::Deserialize;

/// Shape of `parley.toml`.
///
/// ```toml
/// store_path = "~/.local/share/parley/parley.db"
///
/// [user]
/// id    = "ada"
/// name  = "Ada"
/// email = "ada@example.com"
///
/// [engine]
/// typing_quiet_ms = 1500
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
  #[serde(default = "default_store_path")]
  pub store_path: PathBuf,
  #[serde(default)]
  pub user:       UserConfig,
  #[serde(default)]
  pub engine:     EngineConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserConfig {
  pub id:    Option<String>,
  pub name:  Option<String>,
  pub email: Option<String>,
}

fn default_store_path() -> PathBuf { PathBuf::from("parley.db") }

impl ClientConfig {
  /// Read `path` (if it exists) and the environment. Nested keys use a
  /// double underscore, e.g. `PARLEY_USER__ID` or
  /// `PARLEY_ENGINE__AUTO_MARK_SEEN`.
  pub fn load(path: &Path) -> Result<Self> {
    config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(
        config::Environment::with_prefix("PARLEY")
          .prefix_separator("_")
          .separator("__"),
      )
      .build()
      .context("failed to read config file")?
      .try_deserialize()
      .context("failed to deserialise ClientConfig")
  }

  /// The identity to sign in as. Fails if no user id is configured.
  pub fn identity(&self) -> Result<Identity> {
    let id = self
      .user
      .id
      .as_deref()
      .map(str::trim)
      .filter(|id| !id.is_empty())
      .context("no user id configured (set user.id, PARLEY_USER__ID or --user)")?;

    let mut identity = Identity::new(id);
    if let Some(name) = &self.user.name {
      identity = identity.with_display_name(name.clone());
    }
    if let Some(email) = &self.user.email {
      identity = identity.with_email(email.clone());
    }
    Ok(identity)
  }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
