//! Authorization plugins that hand out credentialed HTTP clients.
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::FetchError;

const USER_AGENT: &str = "channel-sync/0.1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Body of a successful GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// GET with credentials attached. Non-2xx answers are errors.
#[async_trait]
pub trait CredentialedHttpClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<RawResponse, FetchError>;
}

pub trait AuthorizationPlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn client(&self, settings: &Value) -> Result<Arc<dyn CredentialedHttpClient>, FetchError>;
}

#[derive(Clone)]
enum Credentials {
    None,
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

#[derive(Clone)]
pub struct ReqwestClient {
    http: Client,
    credentials: Credentials,
}

impl fmt::Debug for ReqwestClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.credentials {
            Credentials::None => "anonymous",
            Credentials::Basic { .. } => "basic_auth",
            Credentials::Header { .. } => "header",
        };
        f.debug_struct("ReqwestClient")
            .field("credentials", &kind)
            .finish_non_exhaustive()
    }
}

impl ReqwestClient {
    fn new(credentials: Credentials) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| FetchError::Transport {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { http, credentials })
    }

    pub fn build_request(&self, url: &str) -> Result<reqwest::Request, FetchError> {
        let mut builder = self
            .http
            .get(url)
            .header("Accept", "application/vnd.api+json");
        builder = match &self.credentials {
            Credentials::None => builder,
            Credentials::Basic { username, password } => {
                builder.basic_auth(username, Some(password))
            }
            Credentials::Header { name, value } => builder.header(name.as_str(), value.as_str()),
        };
        builder
            .build()
            .map_err(|err| FetchError::InvalidRequest(format!("{url}: {err}")))
    }
}

#[async_trait]
impl CredentialedHttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<RawResponse, FetchError> {
        let request = self.build_request(url)?;
        debug!(%url, "requesting remote page");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| FetchError::Transport {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        let status = res.status();
        let body = res.text().await.map_err(|err| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        })?;
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body,
            });
        }
        Ok(RawResponse {
            status: status.as_u16(),
            body,
        })
    }
}

fn parse_settings<T: for<'de> Deserialize<'de>>(
    plugin: &str,
    settings: &Value,
) -> Result<T, FetchError> {
    serde_json::from_value(settings.clone()).map_err(|err| FetchError::InvalidSettings {
        plugin: plugin.to_string(),
        reason: err.to_string(),
    })
}

pub struct Anonymous;

impl AuthorizationPlugin for Anonymous {
    fn id(&self) -> &'static str {
        "anonymous"
    }

    fn client(&self, _settings: &Value) -> Result<Arc<dyn CredentialedHttpClient>, FetchError> {
        Ok(Arc::new(ReqwestClient::new(Credentials::None)?))
    }
}

#[derive(Deserialize)]
struct BasicAuthSettings {
    username: String,
    password: String,
}

pub struct BasicAuth;

impl AuthorizationPlugin for BasicAuth {
    fn id(&self) -> &'static str {
        "basic_auth"
    }

    fn client(&self, settings: &Value) -> Result<Arc<dyn CredentialedHttpClient>, FetchError> {
        let s: BasicAuthSettings = parse_settings(self.id(), settings)?;
        Ok(Arc::new(ReqwestClient::new(Credentials::Basic {
            username: s.username,
            password: s.password,
        })?))
    }
}

#[derive(Deserialize)]
struct HeaderSettings {
    header_name: String,
    header_value: String,
}

/// Sends one fixed header, typically `Authorization: Bearer ...`.
pub struct Header;

impl AuthorizationPlugin for Header {
    fn id(&self) -> &'static str {
        "header"
    }

    fn client(&self, settings: &Value) -> Result<Arc<dyn CredentialedHttpClient>, FetchError> {
        let s: HeaderSettings = parse_settings(self.id(), settings)?;
        if s.header_name.trim().is_empty() {
            return Err(FetchError::InvalidSettings {
                plugin: self.id().into(),
                reason: "header_name must be non-empty".into(),
            });
        }
        Ok(Arc::new(ReqwestClient::new(Credentials::Header {
            name: s.header_name,
            value: s.header_value,
        })?))
    }
}

/// Plugin id to implementation, filled at startup.
#[derive(Clone, Default)]
pub struct AuthorizationRegistry {
    plugins: BTreeMap<String, Arc<dyn AuthorizationPlugin>>,
}

impl fmt::Debug for AuthorizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.plugins.keys()).finish()
    }
}

impl AuthorizationRegistry {
    pub fn with_builtin() -> Self {
        let mut registry = Self::default();
        registry.register(Arc::new(Anonymous));
        registry.register(Arc::new(BasicAuth));
        registry.register(Arc::new(Header));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn AuthorizationPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }

    pub fn create(
        &self,
        plugin_id: &str,
        settings: &Value,
    ) -> Result<Arc<dyn CredentialedHttpClient>, FetchError> {
        let plugin = self
            .plugins
            .get(plugin_id)
            .ok_or_else(|| FetchError::UnknownPlugin(plugin_id.to_string()))?;
        plugin.client(settings)
    }
}
