//! Data layer configuration (YAML, with environment variable expansion)

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::{parse_duration, CacheConfig};

/// Expand `${VAR}` and `$VAR` references. Unset variables expand to an empty
/// string.
pub fn expand_env_vars(input: &str) -> String {
  let mut result = String::with_capacity(input.len());
  let mut chars = input.chars().peekable();

  while let Some(c) = chars.next() {
    if c != '$' {
      result.push(c);
      continue;
    }
    match chars.peek() {
      Some('{') => {
        chars.next();
        let name: String = chars.by_ref().take_while(|c| *c != '}').collect();
        result.push_str(&std::env::var(&name).unwrap_or_default());
      }
      Some(c) if c.is_ascii_alphanumeric() || *c == '_' => {
        let mut name = String::new();
        while let Some(c) = chars.peek() {
          if c.is_ascii_alphanumeric() || *c == '_' {
            name.push(*c);
            chars.next();
          } else {
            break;
          }
        }
        result.push_str(&std::env::var(&name).unwrap_or_default());
      }
      _ => result.push('$'),
    }
  }

  result
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataLayerConfig {
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub fetch: FetchSection,
  #[serde(default)]
  pub search: SearchSection,
  #[serde(default)]
  pub logging: LoggingSection,
}

/// Entity fetching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchSection {
  /// Bound on every store read; `"0"` disables it
  #[serde(default = "default_fetch_timeout")]
  pub timeout: String,

  /// Relation loads for the same root within this window run once
  #[serde(default = "default_coalesce_window")]
  pub related_coalesce_window: String,
}

fn default_fetch_timeout() -> String {
  "30s".into()
}

fn default_coalesce_window() -> String {
  "250ms".into()
}

impl Default for FetchSection {
  fn default() -> Self {
    Self {
      timeout: default_fetch_timeout(),
      related_coalesce_window: default_coalesce_window(),
    }
  }
}

impl FetchSection {
  pub fn timeout(&self) -> Option<Duration> {
    let timeout = parse_duration(&self.timeout).unwrap_or(Duration::from_secs(30));
    (!timeout.is_zero()).then_some(timeout)
  }

  pub fn coalesce_window(&self) -> Duration {
    parse_duration(&self.related_coalesce_window).unwrap_or(Duration::from_millis(250))
  }
}

/// Search boxes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSection {
  #[serde(default = "default_debounce")]
  pub debounce: String,
  /// Terms shorter than this (after trimming) never search
  #[serde(default = "default_min_length")]
  pub min_length: usize,
  #[serde(default = "default_max_results")]
  pub max_results: usize,
  #[serde(default = "default_history_size")]
  pub history_size: usize,
}

fn default_debounce() -> String {
  "300ms".into()
}

fn default_min_length() -> usize {
  2
}

fn default_max_results() -> usize {
  10
}

fn default_history_size() -> usize {
  10
}

impl Default for SearchSection {
  fn default() -> Self {
    Self {
      debounce: default_debounce(),
      min_length: default_min_length(),
      max_results: default_max_results(),
      history_size: default_history_size(),
    }
  }
}

impl SearchSection {
  pub fn debounce(&self) -> Duration {
    parse_duration(&self.debounce).unwrap_or(Duration::from_millis(300))
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
  #[serde(default = "default_level")]
  pub level: String,
}

fn default_level() -> String {
  "info".into()
}

impl Default for LoggingSection {
  fn default() -> Self {
    Self {
      level: default_level(),
    }
  }
}

impl DataLayerConfig {
  pub fn from_yaml(yaml: &str) -> Result<Self, anyhow::Error> {
    Ok(serde_yaml::from_str(&expand_env_vars(yaml))?)
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
    let content = std::fs::read_to_string(&path)?;
    Self::from_yaml(&content)
  }

  pub fn find_and_load() -> Result<Option<Self>, anyhow::Error> {
    for p in ["encore.yaml", "encore.yml"] {
      if Path::new(p).exists() {
        tracing::info!("Loading config from {}", p);
        return Ok(Some(Self::from_file(p)?));
      }
    }
    Ok(None)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn expands_both_syntaxes() {
    std::env::set_var("ENCORE_TEST_TTL", "45s");
    assert_eq!(expand_env_vars("ttl: ${ENCORE_TEST_TTL}"), "ttl: 45s");
    assert_eq!(expand_env_vars("ttl: $ENCORE_TEST_TTL!"), "ttl: 45s!");
    assert_eq!(expand_env_vars("cost: 5$"), "cost: 5$");
    assert_eq!(expand_env_vars("${ENCORE_TEST_UNSET_VAR}x"), "x");
  }

  #[test]
  fn zero_timeout_disables_it() {
    let fetch = FetchSection {
      timeout: "0".into(),
      ..FetchSection::default()
    };
    assert_eq!(fetch.timeout(), None);
    assert_eq!(FetchSection::default().timeout(), Some(Duration::from_secs(30)));
  }
}
