//! Configuration loader and validator for the channel synchronizer.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::model::{Channel, ImportConfig, Remote, Subscription};
use crate::schema::Schema;

static MACHINE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9_]+$").expect("valid regex"));

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub app: App,
    #[serde(default)]
    pub remotes: Vec<Remote>,
    #[serde(default)]
    pub channels: Vec<Channel>,
    #[serde(default)]
    pub import_configs: Vec<ImportConfig>,
    #[serde(default)]
    pub entity_types: Schema,
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    /// Pages fetched per run before a continuation is queued; 0 is unbounded.
    #[serde(default)]
    pub page_budget: u32,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,
}

fn default_max_backoff() -> u64 {
    3600
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/channel_sync.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }

    pub fn remote(&self, id: &str) -> Option<&Remote> {
        self.remotes.iter().find(|r| r.id == id)
    }

    pub fn channel(&self, id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Named import config; an undeclared id falls back to built-in defaults.
    pub fn import_config(&self, id: &str) -> ImportConfig {
        self.import_configs
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .unwrap_or_else(|| ImportConfig::new(id))
    }

    pub fn enabled_subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter().filter(|s| s.enabled)
    }

    fn normalize(&mut self) {
        for remote in &mut self.remotes {
            remote.normalize();
        }
    }
}

/// Load configuration from a YAML file, normalize and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    parse(&content)
}

pub fn parse(content: &str) -> Result<Config, ConfigError> {
    let mut cfg: Config = serde_yaml::from_str(content)?;
    cfg.normalize();
    validate(&cfg)?;
    Ok(cfg)
}

fn check_machine_name(kind: &str, id: &str) -> Result<(), ConfigError> {
    if !MACHINE_NAME.is_match(id) {
        return Err(invalid(format!(
            "{kind} id '{id}' must match [a-z0-9_]+"
        )));
    }
    Ok(())
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(invalid(format!("duplicate {kind} id '{id}'")));
        }
    }
    Ok(())
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(invalid("app.poll_interval_ms must be > 0"));
    }

    for remote in &cfg.remotes {
        check_machine_name("remote", &remote.id)?;
        if !(remote.url.starts_with("http://") || remote.url.starts_with("https://")) {
            return Err(invalid(format!(
                "remotes.{}.url must be an http(s) URL",
                remote.id
            )));
        }
        if remote.auth.plugin.trim().is_empty() {
            return Err(invalid(format!(
                "remotes.{}.auth.plugin must be non-empty",
                remote.id
            )));
        }
    }
    check_unique("remote", cfg.remotes.iter().map(|r| r.id.as_str()))?;

    for channel in &cfg.channels {
        check_machine_name("channel", &channel.id)?;
        if channel.entity_type.trim().is_empty() || channel.bundle.trim().is_empty() {
            return Err(invalid(format!(
                "channels.{}: entity_type and bundle must be non-empty",
                channel.id
            )));
        }
        if channel.max_page_size == 0 {
            return Err(invalid(format!(
                "channels.{}.max_page_size must be > 0",
                channel.id
            )));
        }
        // Filters and groups share the `filter[...]` namespace.
        check_unique(
            "filter/group",
            channel
                .filters
                .iter()
                .map(|f| f.id.as_str())
                .chain(channel.groups.iter().map(|g| g.id.as_str())),
        )?;
        check_unique("sort", channel.sorts.iter().map(|s| s.id.as_str()))?;
        let group_ids: HashSet<&str> = channel.groups.iter().map(|g| g.id.as_str()).collect();
        let parents = channel
            .filters
            .iter()
            .filter_map(|f| f.member_of.as_deref())
            .chain(channel.groups.iter().filter_map(|g| g.member_of.as_deref()));
        for parent in parents {
            if !group_ids.contains(parent) {
                return Err(invalid(format!(
                    "channels.{}: memberOf '{}' names no group",
                    channel.id, parent
                )));
            }
        }
    }
    check_unique("channel", cfg.channels.iter().map(|c| c.id.as_str()))?;

    for import_config in &cfg.import_configs {
        check_machine_name("import config", &import_config.id)?;
    }
    check_unique(
        "import config",
        cfg.import_configs.iter().map(|c| c.id.as_str()),
    )?;

    for remote in &cfg.remotes {
        if let Some(id) = &remote.import_config {
            if !cfg.import_configs.iter().any(|c| &c.id == id) {
                return Err(invalid(format!(
                    "remotes.{}: unknown import config '{id}'",
                    remote.id
                )));
            }
        }
    }

    for sub in &cfg.subscriptions {
        if cfg.remote(&sub.remote).is_none() {
            return Err(invalid(format!(
                "subscription references unknown remote '{}'",
                sub.remote
            )));
        }
        if cfg.channel(&sub.channel).is_none() {
            return Err(invalid(format!(
                "subscription references unknown channel '{}'",
                sub.channel
            )));
        }
        if let Some(id) = &sub.import_config {
            if !cfg.import_configs.iter().any(|c| &c.id == id) {
                return Err(invalid(format!(
                    "subscription references unknown import config '{id}'"
                )));
            }
        }
    }
    let mut pairs = HashSet::new();
    for sub in &cfg.subscriptions {
        if !pairs.insert((sub.remote.as_str(), sub.channel.as_str())) {
            return Err(invalid(format!(
                "duplicate subscription {}/{}",
                sub.remote, sub.channel
            )));
        }
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 60000
  page_budget: 0
  max_backoff_seconds: 3600

remotes:
  - id: origin
    label: "Origin site"
    url: "https://origin.example.com/"
    auth:
      plugin: basic_auth
      settings:
        username: "sync"
        password: "CHANGE_ME"

channels:
  - id: articles_en
    label: "English articles"
    entity_type: node
    bundle: article
    language: en
    max_page_size: 100
    groups:
      - { id: featured, conjunction: OR }
    filters:
      - { id: f0, path: status, operator: "=", value: ["1"] }
      - { id: promoted, path: promote, operator: "=", value: ["1"], member_of: featured }
      - { id: sticky, path: sticky, operator: "=", value: ["1"], member_of: featured }
    sorts:
      - { id: s0, path: created, direction: DESC, weight: 0 }
    searches:
      - { id: title, path: title, label: "Title" }
    access:
      by_permission: true
      allowed_roles: [editor]

import_configs:
  - id: default
    max_size: 50
    processors:
      default_data_processor: { weight: 0, settings: { policy: default } }
      skip_imported: { weight: 10 }

entity_types:
  node:
    shareable: true
    keys: { id: nid, uuid: uuid, label: title, langcode: langcode, bundle: type, revision: vid, default_langcode: default_langcode }
    revision_metadata_keys: [revision_uid, revision_timestamp, revision_log]
    fields:
      - { name: title, label: "Title", type: string }
      - { name: langcode, label: "Language", type: language }
      - { name: body, label: "Body", type: text_with_summary }
      - { name: field_tags, label: "Tags", type: entity_reference, cardinality: -1, target_type: taxonomy_term }
      - { name: field_sections, label: "Sections", type: entity_reference_revisions, cardinality: -1, target_type: paragraph }
      - { name: changed, label: "Changed", type: changed }
  taxonomy_term:
    shareable: true
    keys: { id: tid, uuid: uuid, label: name, langcode: langcode, bundle: vid }
    fields:
      - { name: name, label: "Name", type: string }
  paragraph:
    shareable: true
    keys: { id: id, uuid: uuid, langcode: langcode, bundle: type }
    fields:
      - { name: field_text, label: "Text", type: text_long }
      - { name: parent_id, type: string }

subscriptions:
  - remote: origin
    channel: articles_en
    import_config: default
    operations: { create: true, update: true }
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_config() -> Config {
        parse(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_config();
        assert_eq!(cfg.remotes[0].url, "https://origin.example.com");
        assert_eq!(cfg.channels[0].filters.len(), 3);
        assert_eq!(cfg.import_config("default").max_size, 50);
        assert_eq!(cfg.entity_types.language_path("node"), "langcode");
    }

    #[test]
    fn undeclared_import_config_uses_defaults() {
        let cfg = example_config();
        let fallback = cfg.import_config("other");
        assert_eq!(fallback.id, "other");
        assert!(fallback.processors.is_empty());
    }

    #[test]
    fn invalid_poll_interval() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.poll_interval_ms = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("poll_interval_ms")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_machine_names_and_duplicates() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.channels[0].id = "Bad Id".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        let dup = cfg.remotes[0].clone();
        cfg.remotes.push(dup);
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("duplicate remote")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn filter_ids_must_be_unique_and_groups_known() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.channels[0].filters[1].id = "f0".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.channels[0].filters[1].member_of = Some("missing".into());
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("memberOf")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn subscriptions_must_reference_known_entries() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.subscriptions[0].channel = "missing".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        let dup = cfg.subscriptions[0].clone();
        cfg.subscriptions.push(dup);
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn remote_import_config_must_be_declared() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.remotes[0].import_config = Some("default".into());
        assert!(validate(&cfg).is_ok());

        cfg.remotes[0].import_config = Some("defualt".into());
        match validate(&cfg) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("defualt")),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_config();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.subscriptions[0].remote, "origin");
        assert!(cfg.subscriptions[0].operations.update);
    }
}
