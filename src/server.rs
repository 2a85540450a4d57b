//! Server side: the channel index published for clients to discover.
use anyhow::Result;
use serde::Serialize;

use crate::access::{can_access, Principal};
use crate::model::{Channel, ChannelSearch};
use crate::query;
use crate::schema::Schema;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChannelListing {
    pub id: String,
    pub label: String,
    pub entity_type: String,
    pub bundle: String,
    /// Collection URL with the compiled channel query applied.
    pub url: String,
    pub searches: Vec<ChannelSearch>,
}

/// Channels `principal` may read, in configuration order.
pub fn list_channels(
    channels: &[Channel],
    principal: &Principal,
    base_url: &str,
    schema: &Schema,
) -> Result<Vec<ChannelListing>> {
    let base_url = base_url.trim_end_matches('/');
    channels
        .iter()
        .filter(|channel| can_access(channel, principal))
        .map(|channel| {
            let collection = format!(
                "{base_url}/jsonapi/{}/{}",
                channel.entity_type, channel.bundle
            );
            let url = query::compile(channel, &schema.language_path(&channel.entity_type))
                .apply_to(&collection)?;
            Ok(ChannelListing {
                id: channel.id.clone(),
                label: channel.label.clone(),
                entity_type: channel.entity_type.clone(),
                bundle: channel.bundle.clone(),
                url: url.to_string(),
                searches: channel.searches.clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::ACCESS_CHANNELS_PERMISSION;
    use crate::config;

    #[test]
    fn lists_only_accessible_channels() {
        let cfg = config::parse(config::example()).unwrap();
        let mut hidden = cfg.channels[0].clone();
        hidden.id = "private".into();
        hidden.access.by_permission = false;
        hidden.access.allowed_roles.clear();
        let channels = vec![cfg.channels[0].clone(), hidden];

        let reader = Principal::user("u1", &[]).with_permission(ACCESS_CHANNELS_PERMISSION);
        let listed = list_channels(&channels, &reader, "https://server.example.com/", &cfg.entity_types)
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "articles_en");
        assert!(listed[0]
            .url
            .starts_with("https://server.example.com/jsonapi/node/article?"));
        assert_eq!(listed[0].searches[0].label, "Title");

        assert!(list_channels(&channels, &Principal::anonymous(), "https://s", &cfg.entity_types)
            .unwrap()
            .is_empty());
    }
}
