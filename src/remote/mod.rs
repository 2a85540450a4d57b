//! Fetching and decoding pages of a remote collection.
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::model::{Channel, RawRecord, Remote};
use crate::query;
use crate::schema::Schema;

pub mod auth;

use auth::AuthorizationRegistry;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("remote returned {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("unknown authorization plugin: {0}")]
    UnknownPlugin(String),
    #[error("invalid settings for authorization plugin {plugin}: {reason}")]
    InvalidSettings { plugin: String, reason: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// One decoded page of a collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub records: Vec<RawRecord>,
    /// Side-loaded resources from `?include=`.
    pub included: Vec<RawRecord>,
    pub next_url: Option<String>,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(alias = "records")]
    data: Data,
    #[serde(default)]
    included: Vec<RawRecord>,
    #[serde(default)]
    links: Option<Links>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Data {
    Many(Vec<RawRecord>),
    One(Box<RawRecord>),
}

#[derive(Deserialize)]
struct Links {
    #[serde(default)]
    next: Option<Link>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Link {
    Object { href: String },
    Href(String),
}

/// Decode a collection envelope. `None` when the body is not one.
pub fn decode_page(body: &str) -> Option<Page> {
    let envelope: Envelope = serde_json::from_str(body).ok()?;
    let records = match envelope.data {
        Data::Many(records) => records,
        Data::One(record) => vec![*record],
    };
    let next_url = envelope
        .links
        .and_then(|l| l.next)
        .map(|link| match link {
            Link::Object { href } => href,
            Link::Href(href) => href,
        })
        .filter(|href| !href.trim().is_empty());
    Some(Page {
        records,
        included: envelope.included,
        next_url,
    })
}

/// First page URL of a channel on a remote.
pub fn channel_root_url(
    remote: &Remote,
    channel: &Channel,
    schema: &Schema,
    requested_page_size: u32,
) -> Result<String> {
    let language_path = schema.language_path(&channel.entity_type);
    let url = query::compile(channel, &language_path)
        .with_requested_page_size(requested_page_size)
        .apply_to(&remote.collection_url(&channel.entity_type, &channel.bundle))?;
    Ok(url.to_string())
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(&self, remote: &Remote, url: &str) -> Result<Page, FetchError>;
}

/// Fetches pages over HTTP with the remote's authorization plugin.
#[derive(Debug, Clone)]
pub struct HttpPageFetcher {
    registry: Arc<AuthorizationRegistry>,
}

impl HttpPageFetcher {
    pub fn new(registry: Arc<AuthorizationRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    #[instrument(skip_all, fields(remote = %remote.id))]
    async fn fetch_page(&self, remote: &Remote, url: &str) -> Result<Page, FetchError> {
        let client = remote.client(&self.registry)?;
        let response = client.get(url).await?;
        // An unparseable body counts as an empty final page.
        Ok(decode_page(&response.body).unwrap_or_else(|| {
            warn!(%url, status = response.status, "malformed collection envelope; treating as empty");
            Page::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthSettings;
    use serde_json::json;

    #[test]
    fn decodes_records_and_next_link() {
        let body = json!({
            "data": [
                { "type": "node--article", "id": "a", "attributes": { "title": "A" } },
                { "type": "node--article", "id": "b" }
            ],
            "links": { "next": { "href": "https://example.com/jsonapi/node/article?page[offset]=2" } }
        })
        .to_string();
        let page = decode_page(&body).unwrap();
        assert_eq!(page.records.len(), 2);
        assert_eq!(page.records[0].attributes["title"], "A");
        assert_eq!(
            page.next_url.as_deref(),
            Some("https://example.com/jsonapi/node/article?page[offset]=2")
        );
    }

    #[test]
    fn last_page_has_no_next() {
        let body = json!({ "data": [], "links": { "self": { "href": "x" } } }).to_string();
        let page = decode_page(&body).unwrap();
        assert!(page.records.is_empty());
        assert!(page.next_url.is_none());
    }

    #[test]
    fn single_resource_document_becomes_one_record() {
        let body = json!({
            "data": { "type": "node--page", "id": "p" },
            "included": [ { "type": "paragraph--text", "id": "x" } ]
        })
        .to_string();
        let page = decode_page(&body).unwrap();
        assert_eq!(page.records[0].id, "p");
        assert_eq!(page.included[0].bundle(), "text");
    }

    #[test]
    fn records_alias_is_accepted() {
        let body = json!({ "records": [ { "type": "node--page", "id": "p" } ] }).to_string();
        assert_eq!(decode_page(&body).unwrap().records.len(), 1);
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(decode_page("<html>oops</html>").is_none());
        assert!(decode_page(r#"{"errors": []}"#).is_none());
        assert!(decode_page(r#"{"data": "nope"}"#).is_none());
    }

    #[test]
    fn channel_root_url_includes_query() {
        let remote = Remote::new("site", "https://example.com/", AuthSettings::default());
        let channel: Channel = serde_yaml::from_str(
            "id: c\nlabel: C\nentity_type: node\nbundle: article\nmax_page_size: 10\n",
        )
        .unwrap();
        let url = channel_root_url(&remote, &channel, &Schema::default(), 50).unwrap();
        assert!(url.starts_with("https://example.com/jsonapi/node/article?"));
        assert!(url.ends_with("page%5Blimit%5D=10"));
    }
}
