//! Per-pair settings resolved through an ordered chain of providers.
//!
//! Each provider either has an opinion or returns `None`; the first opinion
//! wins. The default chain is subscription, then remote, then app.
use crate::config::Config;

/// Import config id used when no provider names one.
pub const DEFAULT_IMPORT_CONFIG: &str = "default";

/// Key of a subscribed (remote, channel) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    pub remote_id: String,
    pub channel_id: String,
}

impl PairKey {
    pub fn new(remote_id: &str, channel_id: &str) -> Self {
        Self {
            remote_id: remote_id.to_string(),
            channel_id: channel_id.to_string(),
        }
    }
}

pub trait SettingsProvider: Send + Sync {
    fn import_config(&self, _pair: &PairKey) -> Option<String> {
        None
    }

    /// Pages per run; `0` means unbounded.
    fn page_budget(&self, _pair: &PairKey) -> Option<u32> {
        None
    }
}

struct SubscriptionSettings {
    entries: Vec<(PairKey, Option<String>, Option<u32>)>,
}

impl SettingsProvider for SubscriptionSettings {
    fn import_config(&self, pair: &PairKey) -> Option<String> {
        self.entries
            .iter()
            .find(|(key, _, _)| key == pair)
            .and_then(|(_, config, _)| config.clone())
    }

    fn page_budget(&self, pair: &PairKey) -> Option<u32> {
        self.entries
            .iter()
            .find(|(key, _, _)| key == pair)
            .and_then(|(_, _, budget)| *budget)
    }
}

struct RemoteSettings {
    entries: Vec<(String, Option<String>, Option<u32>)>,
}

impl SettingsProvider for RemoteSettings {
    fn import_config(&self, pair: &PairKey) -> Option<String> {
        self.entries
            .iter()
            .find(|(id, _, _)| *id == pair.remote_id)
            .and_then(|(_, config, _)| config.clone())
    }

    fn page_budget(&self, pair: &PairKey) -> Option<u32> {
        self.entries
            .iter()
            .find(|(id, _, _)| *id == pair.remote_id)
            .and_then(|(_, _, budget)| *budget)
    }
}

struct AppDefaults {
    page_budget: u32,
}

impl SettingsProvider for AppDefaults {
    fn import_config(&self, _pair: &PairKey) -> Option<String> {
        Some(DEFAULT_IMPORT_CONFIG.to_string())
    }

    fn page_budget(&self, _pair: &PairKey) -> Option<u32> {
        Some(self.page_budget)
    }
}

#[derive(Default)]
pub struct SettingsChain {
    providers: Vec<Box<dyn SettingsProvider>>,
}

impl SettingsChain {
    pub fn from_config(cfg: &Config) -> Self {
        let mut chain = Self::default();
        chain.push(Box::new(SubscriptionSettings {
            entries: cfg
                .subscriptions
                .iter()
                .map(|s| {
                    (
                        PairKey::new(&s.remote, &s.channel),
                        s.import_config.clone(),
                        s.page_budget,
                    )
                })
                .collect(),
        }));
        chain.push(Box::new(RemoteSettings {
            entries: cfg
                .remotes
                .iter()
                .map(|r| (r.id.clone(), r.import_config.clone(), r.page_budget))
                .collect(),
        }));
        chain.push(Box::new(AppDefaults {
            page_budget: cfg.app.page_budget,
        }));
        chain
    }

    pub fn push(&mut self, provider: Box<dyn SettingsProvider>) {
        self.providers.push(provider);
    }

    pub fn import_config(&self, pair: &PairKey) -> String {
        self.providers
            .iter()
            .find_map(|p| p.import_config(pair))
            .unwrap_or_else(|| DEFAULT_IMPORT_CONFIG.to_string())
    }

    pub fn page_budget(&self, pair: &PairKey) -> u32 {
        self.providers
            .iter()
            .find_map(|p| p.page_budget(pair))
            .unwrap_or(0)
    }
}
