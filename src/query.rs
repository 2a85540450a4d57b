//! Compiles a channel definition into the query sent to a remote collection.
//!
//! The compiler is pure: identical channels yield identical queries, and no
//! I/O happens here. The resulting [`ChannelQuery`] renders either as a JSON
//! tree (`filter.<id>.condition`, `sort.<id>`, `page.limit`) or as the
//! bracketed query-string pairs a JSON:API server expects.
use anyhow::{Context, Result};
use reqwest::Url;
use serde_json::{json, Map, Value};

use crate::model::{Channel, Conjunction};

/// Filter id used for the implicit language restriction.
pub const LANGUAGE_FILTER_ID: &str = "channel_langcode";

const MULTIPLE_VALUE_OPERATORS: &[&str] = &["IN", "NOT IN", "BETWEEN", "NOT BETWEEN"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterValue {
    Single(String),
    Multiple(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterEntry {
    Condition {
        path: String,
        operator: String,
        value: Option<FilterValue>,
        member_of: Option<String>,
    },
    Group {
        conjunction: Conjunction,
        member_of: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortEntry {
    pub path: String,
    pub direction: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelQuery {
    pub filter: Vec<(String, FilterEntry)>,
    pub sort: Vec<(String, SortEntry)>,
    pub page_limit: u32,
}

pub fn accepts_multiple_values(operator: &str) -> bool {
    MULTIPLE_VALUE_OPERATORS
        .iter()
        .any(|op| op.eq_ignore_ascii_case(operator.trim()))
}

/// Build the query for `channel`. `language_path` is the remote path of the
/// entity type's language key.
pub fn compile(channel: &Channel, language_path: &str) -> ChannelQuery {
    let mut filter = Vec::new();

    if let Some(langcode) = channel.language_restriction() {
        filter.push((
            LANGUAGE_FILTER_ID.to_string(),
            FilterEntry::Condition {
                path: language_path.to_string(),
                operator: "=".into(),
                value: Some(FilterValue::Single(langcode.to_string())),
                member_of: None,
            },
        ));
    }

    for group in &channel.groups {
        filter.push((
            group.id.clone(),
            FilterEntry::Group {
                conjunction: group.conjunction,
                member_of: group.member_of.clone(),
            },
        ));
    }

    for f in &channel.filters {
        let value = f.value.as_ref().map(|values| {
            if accepts_multiple_values(&f.operator) {
                FilterValue::Multiple(values.clone())
            } else {
                FilterValue::Single(values.concat())
            }
        });
        filter.push((
            f.id.clone(),
            FilterEntry::Condition {
                path: f.path.clone(),
                operator: f.operator.clone(),
                value,
                member_of: f.member_of.clone(),
            },
        ));
    }

    // Stable sort keeps declaration order between equal weights.
    let mut sorts: Vec<_> = channel.sorts.iter().collect();
    sorts.sort_by_key(|s| s.weight);
    let sort = sorts
        .into_iter()
        .map(|s| {
            (
                s.id.clone(),
                SortEntry {
                    path: s.path.clone(),
                    direction: s.direction.as_str().to_string(),
                },
            )
        })
        .collect();

    ChannelQuery {
        filter,
        sort,
        page_limit: channel.max_page_size,
    }
}

impl ChannelQuery {
    /// Lower the page size to what the client asked for, never above the
    /// channel bound.
    pub fn with_requested_page_size(mut self, requested: u32) -> Self {
        if requested > 0 {
            self.page_limit = self.page_limit.min(requested);
        }
        self
    }

    pub fn to_json(&self) -> Value {
        let mut filter = Map::new();
        for (id, entry) in &self.filter {
            let rendered = match entry {
                FilterEntry::Condition {
                    path,
                    operator,
                    value,
                    member_of,
                } => {
                    let mut condition = Map::new();
                    condition.insert("path".into(), json!(path));
                    condition.insert("operator".into(), json!(operator));
                    match value {
                        Some(FilterValue::Single(v)) => {
                            condition.insert("value".into(), json!(v));
                        }
                        Some(FilterValue::Multiple(vs)) => {
                            condition.insert("value".into(), json!(vs));
                        }
                        None => {}
                    }
                    if let Some(group) = member_of {
                        condition.insert("memberOf".into(), json!(group));
                    }
                    json!({ "condition": condition })
                }
                FilterEntry::Group {
                    conjunction,
                    member_of,
                } => {
                    let mut group = Map::new();
                    group.insert("conjunction".into(), json!(conjunction.as_str()));
                    if let Some(parent) = member_of {
                        group.insert("memberOf".into(), json!(parent));
                    }
                    json!({ "group": group })
                }
            };
            filter.insert(id.clone(), rendered);
        }

        let mut sort = Map::new();
        for (id, entry) in &self.sort {
            sort.insert(
                id.clone(),
                json!({ "path": entry.path, "direction": entry.direction }),
            );
        }

        json!({
            "filter": filter,
            "sort": sort,
            "page": { "limit": self.page_limit },
        })
    }

    /// Flatten into `filter[id][condition][path]=...` style pairs.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (id, entry) in &self.filter {
            match entry {
                FilterEntry::Condition {
                    path,
                    operator,
                    value,
                    member_of,
                } => {
                    let prefix = format!("filter[{id}][condition]");
                    pairs.push((format!("{prefix}[path]"), path.clone()));
                    pairs.push((format!("{prefix}[operator]"), operator.clone()));
                    match value {
                        Some(FilterValue::Single(v)) => {
                            pairs.push((format!("{prefix}[value]"), v.clone()));
                        }
                        Some(FilterValue::Multiple(vs)) => {
                            for (i, v) in vs.iter().enumerate() {
                                pairs.push((format!("{prefix}[value][{i}]"), v.clone()));
                            }
                        }
                        None => {}
                    }
                    if let Some(group) = member_of {
                        pairs.push((format!("{prefix}[memberOf]"), group.clone()));
                    }
                }
                FilterEntry::Group {
                    conjunction,
                    member_of,
                } => {
                    let prefix = format!("filter[{id}][group]");
                    pairs.push((
                        format!("{prefix}[conjunction]"),
                        conjunction.as_str().to_string(),
                    ));
                    if let Some(parent) = member_of {
                        pairs.push((format!("{prefix}[memberOf]"), parent.clone()));
                    }
                }
            }
        }
        for (id, entry) in &self.sort {
            pairs.push((format!("sort[{id}][path]"), entry.path.clone()));
            pairs.push((format!("sort[{id}][direction]"), entry.direction.clone()));
        }
        pairs.push(("page[limit]".into(), self.page_limit.to_string()));
        pairs
    }

    /// Append the query to a collection URL.
    pub fn apply_to(&self, base: &str) -> Result<Url> {
        let mut url = Url::parse(base).with_context(|| format!("invalid collection URL {base}"))?;
        {
            let mut query = url.query_pairs_mut();
            for (key, value) in self.to_query_pairs() {
                query.append_pair(&key, &value);
            }
        }
        Ok(url)
    }
}
