use anyhow::{anyhow, Context};
use once_cell::sync::OnceCell;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::remote::auth::{AuthorizationRegistry, CredentialedHttpClient};
use crate::remote::FetchError;

/// Language code meaning "no language restriction".
pub const LANGCODE_NOT_SPECIFIED: &str = "und";
/// Policy tag stamped on import status rows unless a processor overrides it.
pub const DEFAULT_POLICY: &str = "default";
pub const DEFAULT_IMPORT_MAX_SIZE: u32 = 50;
pub const DEFAULT_CHANNEL_MAX_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Conjunction {
    And,
    Or,
}

impl Conjunction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conjunction::And => "AND",
            Conjunction::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelFilter {
    pub id: String,
    pub path: String,
    pub operator: String,
    #[serde(default)]
    pub value: Option<Vec<String>>,
    #[serde(default)]
    pub member_of: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelGroup {
    pub id: String,
    pub conjunction: Conjunction,
    #[serde(default)]
    pub member_of: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelSort {
    pub id: String,
    pub path: String,
    pub direction: SortDirection,
    #[serde(default)]
    pub weight: i32,
}

/// Free-text search hint published with the channel; never part of the query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelSearch {
    pub id: String,
    pub path: String,
    pub label: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessRule {
    #[serde(default)]
    pub by_permission: bool,
    #[serde(default)]
    pub allowed_roles: BTreeSet<String>,
    #[serde(default)]
    pub allowed_users: BTreeSet<String>,
}

/// Export definition over one entity type and bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Channel {
    pub id: String,
    pub label: String,
    pub entity_type: String,
    pub bundle: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub filters: Vec<ChannelFilter>,
    #[serde(default)]
    pub groups: Vec<ChannelGroup>,
    #[serde(default)]
    pub sorts: Vec<ChannelSort>,
    #[serde(default)]
    pub searches: Vec<ChannelSearch>,
    #[serde(default = "default_channel_max_page_size")]
    pub max_page_size: u32,
    #[serde(default)]
    pub access: AccessRule,
}

fn default_channel_max_page_size() -> u32 {
    DEFAULT_CHANNEL_MAX_PAGE_SIZE
}

impl Channel {
    /// Language the channel is restricted to, if any.
    pub fn language_restriction(&self) -> Option<&str> {
        self.language
            .as_deref()
            .map(str::trim)
            .filter(|l| !l.is_empty() && *l != LANGCODE_NOT_SPECIFIED)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthSettings {
    pub plugin: String,
    #[serde(default)]
    pub settings: Value,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            plugin: "anonymous".into(),
            settings: Value::Null,
        }
    }
}

/// Lazily created client; a remote owns at most one.
#[derive(Clone, Default)]
pub struct LazyClient(OnceCell<Arc<dyn CredentialedHttpClient>>);

impl fmt::Debug for LazyClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyClient")
            .field("initialized", &self.0.get().is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    pub id: String,
    pub label: String,
    pub url: String,
    #[serde(default = "default_jsonapi_prefix")]
    pub jsonapi_prefix: String,
    #[serde(default)]
    pub auth: AuthSettings,
    /// Remote-wide default import config, used when a subscription names none.
    #[serde(default)]
    pub import_config: Option<String>,
    #[serde(default)]
    pub page_budget: Option<u32>,
    #[serde(skip)]
    client: LazyClient,
}

fn default_jsonapi_prefix() -> String {
    "jsonapi".into()
}

impl Remote {
    pub fn new(id: &str, url: &str, auth: AuthSettings) -> Self {
        let mut remote = Self {
            id: id.to_string(),
            label: id.to_string(),
            url: url.to_string(),
            jsonapi_prefix: default_jsonapi_prefix(),
            auth,
            import_config: None,
            page_budget: None,
            client: LazyClient::default(),
        };
        remote.normalize();
        remote
    }

    /// Strip trailing slashes from the base URL.
    pub fn normalize(&mut self) {
        let trimmed = self.url.trim().trim_end_matches('/').to_string();
        self.url = trimmed;
        self.jsonapi_prefix = self.jsonapi_prefix.trim_matches('/').to_string();
    }

    pub fn collection_url(&self, entity_type: &str, bundle: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.url, self.jsonapi_prefix, entity_type, bundle
        )
    }

    /// Single-record URL, side-loading the `include` relationship paths.
    pub fn record_url(
        &self,
        entity_type: &str,
        bundle: &str,
        uuid: &str,
        include: &[String],
    ) -> anyhow::Result<Url> {
        let base = self.collection_url(entity_type, bundle);
        let mut url = Url::parse(&base).with_context(|| format!("invalid collection URL {base}"))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("collection URL {base} cannot take a path"))?
            .push(uuid);
        if !include.is_empty() {
            url.query_pairs_mut()
                .append_pair("include", &include.join(","));
        }
        Ok(url)
    }

    /// Credentialed client for this remote, created on first use.
    pub fn client(
        &self,
        registry: &AuthorizationRegistry,
    ) -> Result<Arc<dyn CredentialedHttpClient>, FetchError> {
        self.client
            .0
            .get_or_try_init(|| registry.create(&self.auth.plugin, &self.auth.settings))
            .cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorSettings {
    #[serde(default)]
    pub weight: i32,
    #[serde(default)]
    pub settings: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImportConfig {
    pub id: String,
    #[serde(default = "default_import_max_size")]
    pub max_size: u32,
    #[serde(default)]
    pub processors: BTreeMap<String, ProcessorSettings>,
}

fn default_import_max_size() -> u32 {
    DEFAULT_IMPORT_MAX_SIZE
}

impl ImportConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            max_size: DEFAULT_IMPORT_MAX_SIZE,
            processors: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationPolicy {
    #[serde(default = "enabled")]
    pub create: bool,
    #[serde(default = "enabled")]
    pub update: bool,
}

fn enabled() -> bool {
    true
}

impl Default for OperationPolicy {
    fn default() -> Self {
        Self {
            create: true,
            update: true,
        }
    }
}

/// An enabled (remote, channel) pair the scheduler pulls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Subscription {
    pub remote: String,
    pub channel: String,
    #[serde(default)]
    pub import_config: Option<String>,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub operations: OperationPolicy,
    #[serde(default)]
    pub page_budget: Option<u32>,
}

/// Unit of work for one synchronization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportContext {
    pub remote_id: String,
    pub channel_id: String,
    pub import_config_id: String,
    /// First page to fetch; `None` starts from the channel root.
    pub channel_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingSyncWorkItem {
    pub id: i64,
    pub remote_id: String,
    pub channel_id: String,
    pub url: Option<String>,
    pub attempt: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityImportStatus {
    pub entity_id: String,
    pub entity_uuid: String,
    pub entity_type_id: String,
    pub entity_bundle: String,
    pub remote_website_id: String,
    pub channel_id: String,
    pub last_import: i64,
    pub policy: String,
}

/// One resource object from a remote collection page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawRecord {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default)]
    pub relationships: Map<String, Value>,
}

impl RawRecord {
    /// Entity type half of `"<entityType>--<bundle>"`.
    pub fn entity_type(&self) -> &str {
        self.resource_type
            .split_once("--")
            .map(|(t, _)| t)
            .unwrap_or(&self.resource_type)
    }

    pub fn bundle(&self) -> &str {
        self.resource_type
            .split_once("--")
            .map(|(_, b)| b)
            .unwrap_or(&self.resource_type)
    }

    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }

    pub fn langcode(&self) -> Option<&str> {
        self.attribute("langcode").and_then(Value::as_str)
    }

    /// Remote `changed` attribute as unix seconds, if present.
    pub fn changed_timestamp(&self) -> Option<i64> {
        match self.attribute("changed")? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s
                .parse::<i64>()
                .ok()
                .or_else(|| {
                    chrono::DateTime::parse_from_rfc3339(s)
                        .ok()
                        .map(|dt| dt.timestamp())
                }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn remote_url_is_normalized() {
        let remote = Remote::new("site", "https://example.com///", AuthSettings::default());
        assert_eq!(remote.url, "https://example.com");
        assert_eq!(
            remote.collection_url("node", "article"),
            "https://example.com/jsonapi/node/article"
        );
    }

    #[test]
    fn record_url_encodes_uuid_and_includes() {
        let remote = Remote::new("site", "https://example.com/", AuthSettings::default());
        let url = remote
            .record_url("node", "article", "a b/c", &[])
            .unwrap();
        assert_eq!(url.as_str(), "https://example.com/jsonapi/node/article/a%20b%2Fc");

        let include = vec!["field_tags".to_string(), "field_sections".to_string()];
        let url = remote.record_url("node", "article", "n1", &include).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/jsonapi/node/article/n1?include=field_tags%2Cfield_sections"
        );
    }

    #[test]
    fn raw_record_splits_type() {
        let record: RawRecord = serde_json::from_value(json!({
            "type": "node--article",
            "id": "a",
            "attributes": { "changed": "2024-01-02T00:00:00+00:00", "langcode": "en" }
        }))
        .unwrap();
        assert_eq!(record.entity_type(), "node");
        assert_eq!(record.bundle(), "article");
        assert_eq!(record.langcode(), Some("en"));
        assert_eq!(record.changed_timestamp(), Some(1704153600));
    }

    #[test]
    fn not_specified_language_is_no_restriction() {
        let mut channel: Channel = serde_yaml::from_str(
            "id: c\nlabel: C\nentity_type: node\nbundle: page\nlanguage: und\n",
        )
        .unwrap();
        assert_eq!(channel.language_restriction(), None);
        channel.language = Some("fr".into());
        assert_eq!(channel.language_restriction(), Some("fr"));
        assert_eq!(channel.max_page_size, DEFAULT_CHANNEL_MAX_PAGE_SIZE);
    }
}
