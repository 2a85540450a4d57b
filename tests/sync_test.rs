use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

use channel_sync::config::{self, Config};
use channel_sync::db;
use channel_sync::import::{RecordImporter, SyncService};
use channel_sync::model::{OperationPolicy, RawRecord, Remote};
use channel_sync::remote::auth::{
    AuthorizationPlugin, AuthorizationRegistry, CredentialedHttpClient, RawResponse,
};
use channel_sync::remote::{FetchError, HttpPageFetcher, Page, PageFetcher};
use channel_sync::scheduler;
use channel_sync::store::SqliteEntityStore;

const NEXT_PREFIX: &str = "https://origin.example.com/next/";

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn article(uuid: &str) -> RawRecord {
    serde_json::from_value(json!({
        "type": "node--article",
        "id": uuid,
        "attributes": { "title": format!("Article {uuid}"), "langcode": "en", "changed": 100 }
    }))
    .unwrap()
}

/// Serves `pages` fixed pages; the first is served for any URL that is not
/// a next link.
#[derive(Clone, Default)]
struct RecordingFetcher {
    pages: Arc<Vec<Vec<RawRecord>>>,
    calls: Arc<Mutex<Vec<usize>>>,
    fail_once: Arc<Mutex<HashSet<usize>>>,
}

impl RecordingFetcher {
    fn with_pages(count: usize) -> Self {
        let pages = (1..=count)
            .map(|n| vec![article(&format!("p{n}a")), article(&format!("p{n}b"))])
            .collect();
        Self {
            pages: Arc::new(pages),
            ..Default::default()
        }
    }

    fn with_records(records: Vec<RawRecord>) -> Self {
        Self {
            pages: Arc::new(vec![records]),
            ..Default::default()
        }
    }

    async fn fail_once_on(&self, page: usize) {
        self.fail_once.lock().await.insert(page);
    }

    async fn calls(&self) -> Vec<usize> {
        self.calls.lock().await.clone()
    }
}

#[async_trait]
impl PageFetcher for RecordingFetcher {
    async fn fetch_page(&self, _remote: &Remote, url: &str) -> Result<Page, FetchError> {
        let number = url
            .strip_prefix(NEXT_PREFIX)
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(1);
        self.calls.lock().await.push(number);
        if self.fail_once.lock().await.remove(&number) {
            return Err(FetchError::Transport {
                url: url.to_string(),
                message: "connection reset".into(),
            });
        }
        let records = self.pages.get(number - 1).cloned().unwrap_or_default();
        let next_url = (number < self.pages.len()).then(|| format!("{NEXT_PREFIX}{}", number + 1));
        Ok(Page {
            records,
            included: Vec::new(),
            next_url,
        })
    }
}

fn config_with(budget: Option<u32>, operations: OperationPolicy) -> Config {
    let mut cfg = config::parse(config::example()).unwrap();
    cfg.subscriptions[0].page_budget = budget;
    cfg.subscriptions[0].operations = operations;
    cfg
}

fn service(pool: &sqlx::SqlitePool, cfg: Config, fetcher: &RecordingFetcher) -> SyncService {
    let store = Arc::new(SqliteEntityStore::new(pool.clone()));
    SyncService::new(
        pool.clone(),
        Arc::new(cfg),
        Arc::new(fetcher.clone()),
        store.clone(),
        store,
    )
}

#[tokio::test]
async fn budget_two_over_five_pages_resumes_across_ticks() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(5);
    let service = service(&pool, config_with(Some(2), OperationPolicy::default()), &fetcher);

    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.started, 1);
    assert_eq!(db::count_entities(&pool).await.unwrap(), 4);
    let pending = db::list_pending_sync(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url.as_deref(), Some("https://origin.example.com/next/3"));

    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.resumed, 1);
    assert_eq!(db::count_entities(&pool).await.unwrap(), 8);
    let pending = db::list_pending_sync(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url.as_deref(), Some("https://origin.example.com/next/5"));

    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.resumed, 1);
    assert_eq!(db::count_pending_sync(&pool).await.unwrap(), 0);
    assert_eq!(db::count_entities(&pool).await.unwrap(), 10);
    assert_eq!(db::count_import_status(&pool).await.unwrap(), 10);

    assert_eq!(fetcher.calls().await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn zero_budget_drains_channel_in_one_run() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(5);
    let service = service(&pool, config_with(None, OperationPolicy::default()), &fetcher);

    let report = service.sync("origin", "articles_en", None).await.unwrap();
    assert_eq!(report.pages, 5);
    assert_eq!(report.fetched, 10);
    assert!(report.continuation.is_none());
    assert_eq!(db::count_pending_sync(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn empty_channel_terminates_without_work_item() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(0);
    let service = service(&pool, config_with(Some(2), OperationPolicy::default()), &fetcher);

    let report = service.sync("origin", "articles_en", None).await.unwrap();
    assert_eq!(report.pages, 1);
    assert_eq!(report.imported, 0);
    assert_eq!(db::count_pending_sync(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn transport_error_keeps_cursor_and_backs_off() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(5);
    fetcher.fail_once_on(3).await;
    let service = service(&pool, config_with(Some(2), OperationPolicy::default()), &fetcher);

    scheduler::drain(&service, 60).await.unwrap();
    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.failed, 1);

    let pending = db::list_pending_sync(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url.as_deref(), Some("https://origin.example.com/next/3"));
    assert_eq!(pending[0].attempt, 1);
    assert_eq!(db::count_entities(&pool).await.unwrap(), 4);

    // Still backing off: neither resumed nor restarted.
    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.waiting, 1);
    assert_eq!(tick.started + tick.resumed, 0);
    assert_eq!(fetcher.calls().await, vec![1, 2, 3]);
}

#[tokio::test]
async fn explicit_enqueue_resumes_from_given_url() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(5);
    let service = service(&pool, config_with(Some(2), OperationPolicy::default()), &fetcher);

    scheduler::enqueue(&pool, "origin", "articles_en", Some("https://origin.example.com/next/4"))
        .await
        .unwrap();
    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.resumed, 1);
    assert_eq!(fetcher.calls().await, vec![4, 5]);
    assert_eq!(db::count_pending_sync(&pool).await.unwrap(), 0);
}

async fn run_gated(operations: OperationPolicy) -> (bool, bool) {
    let pool = setup_pool().await;
    let store = SqliteEntityStore::new(pool.clone());
    store.import_records(&[article("A")]).await.unwrap();

    let fetcher = RecordingFetcher::with_records(vec![article("A"), article("B")]);
    let service = service(&pool, config_with(None, operations), &fetcher);
    service.sync("origin", "articles_en", None).await.unwrap();

    let a = db::fetch_import_status(&pool, "A").await.unwrap().is_some();
    let b = db::fetch_import_status(&pool, "B").await.unwrap().is_some();
    (a, b)
}

#[tokio::test]
async fn create_update_gating() {
    let both = OperationPolicy { create: true, update: true };
    let update_only = OperationPolicy { create: false, update: true };
    let create_only = OperationPolicy { create: true, update: false };
    let neither = OperationPolicy { create: false, update: false };

    assert_eq!(run_gated(both).await, (true, true));
    assert_eq!(run_gated(update_only).await, (true, false));
    assert_eq!(run_gated(create_only).await, (false, true));
    assert_eq!(run_gated(neither).await, (false, false));
}

#[tokio::test]
async fn reimport_is_idempotent() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(3);
    let mut cfg = config_with(None, OperationPolicy::default());
    // No processors, so the second run really writes again.
    cfg.subscriptions[0].import_config = Some("plain".into());
    let service = service(&pool, cfg, &fetcher);

    service.sync("origin", "articles_en", None).await.unwrap();
    let first: Vec<(String, String)> =
        sqlx::query_as("SELECT uuid, payload FROM imported_entities ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    let status_before = db::fetch_import_status(&pool, "p1a").await.unwrap().unwrap();

    service.sync("origin", "articles_en", None).await.unwrap();
    let second: Vec<(String, String)> =
        sqlx::query_as("SELECT uuid, payload FROM imported_entities ORDER BY id")
            .fetch_all(&pool)
            .await
            .unwrap();
    let status_after = db::fetch_import_status(&pool, "p1a").await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(db::count_import_status(&pool).await.unwrap(), 6);
    assert_eq!(status_before.entity_id, status_after.entity_id);
    assert_eq!(status_after.policy, "default");
}

#[tokio::test]
async fn skip_imported_leaves_unchanged_records_alone() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(1);
    let service = service(&pool, config_with(None, OperationPolicy::default()), &fetcher);

    let first = service.sync("origin", "articles_en", None).await.unwrap();
    assert_eq!(first.imported, 2);
    let second = service.sync("origin", "articles_en", None).await.unwrap();
    assert_eq!(second.fetched, 2);
    assert_eq!(second.imported, 0);
}

#[tokio::test]
async fn unknown_pair_fails_without_queueing() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(1);
    let service = service(&pool, config_with(None, OperationPolicy::default()), &fetcher);

    let err = service.sync("nowhere", "articles_en", None).await.unwrap_err();
    assert!(err.to_string().contains("unknown remote"));
    assert_eq!(db::count_pending_sync(&pool).await.unwrap(), 0);
    assert!(fetcher.calls().await.is_empty());
}

/// Answers each URL with a fixed status and body; non-2xx become errors the
/// way the real client reports them.
#[derive(Default)]
struct CannedClient {
    responses: Mutex<HashMap<String, (u16, String)>>,
}

#[async_trait]
impl CredentialedHttpClient for CannedClient {
    async fn get(&self, url: &str) -> Result<RawResponse, FetchError> {
        let (status, body) = self
            .responses
            .lock()
            .await
            .get(url)
            .cloned()
            .unwrap_or((404, String::new()));
        if !(200..300).contains(&status) {
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
                body,
            });
        }
        Ok(RawResponse { status, body })
    }
}

struct CannedPlugin(Arc<CannedClient>);

impl AuthorizationPlugin for CannedPlugin {
    fn id(&self) -> &'static str {
        "canned"
    }

    fn client(&self, _settings: &Value) -> Result<Arc<dyn CredentialedHttpClient>, FetchError> {
        Ok(self.0.clone())
    }
}

async fn http_service(
    pool: &sqlx::SqlitePool,
    responses: &[(&str, u16, &str)],
) -> SyncService {
    let client = Arc::new(CannedClient::default());
    {
        let mut canned = client.responses.lock().await;
        for (url, status, body) in responses {
            canned.insert(url.to_string(), (*status, body.to_string()));
        }
    }
    let mut registry = AuthorizationRegistry::with_builtin();
    registry.register(Arc::new(CannedPlugin(client)));

    let mut cfg = config_with(Some(2), OperationPolicy::default());
    cfg.remotes[0].auth.plugin = "canned".into();
    let store = Arc::new(SqliteEntityStore::new(pool.clone()));
    SyncService::new(
        pool.clone(),
        Arc::new(cfg),
        Arc::new(HttpPageFetcher::new(Arc::new(registry))),
        store.clone(),
        store,
    )
}

#[tokio::test]
async fn malformed_body_ends_resumed_run() {
    let pool = setup_pool().await;
    let url = "https://origin.example.com/next/3";
    let service = http_service(&pool, &[(url, 200, "<html>maintenance</html>")]).await;

    scheduler::enqueue(&pool, "origin", "articles_en", Some(url))
        .await
        .unwrap();
    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.resumed, 1);
    assert_eq!(tick.failed, 0);
    assert_eq!(db::count_pending_sync(&pool).await.unwrap(), 0);
    assert_eq!(db::count_entities(&pool).await.unwrap(), 0);
}

#[tokio::test]
async fn server_error_keeps_work_item_queued() {
    let pool = setup_pool().await;
    let url = "https://origin.example.com/next/3";
    let service = http_service(&pool, &[(url, 500, "upstream down")]).await;

    scheduler::enqueue(&pool, "origin", "articles_en", Some(url))
        .await
        .unwrap();
    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.failed, 1);

    let pending = db::list_pending_sync(&pool).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].url.as_deref(), Some(url));
    assert_eq!(pending[0].attempt, 1);
}

#[tokio::test]
async fn queue_error_on_one_pair_does_not_stop_the_tick() {
    let pool = setup_pool().await;
    let fetcher = RecordingFetcher::with_pages(1);
    let mut cfg = config_with(None, OperationPolicy::default());
    let mut copy = cfg.channels[0].clone();
    copy.id = "articles_copy".into();
    cfg.channels.push(copy);
    let mut second = cfg.subscriptions[0].clone();
    second.channel = "articles_copy".into();
    cfg.subscriptions.push(second);
    let service = service(&pool, cfg, &fetcher);

    // A row the queue cannot decode poisons only its own pair.
    sqlx::query(
        "INSERT INTO pending_sync (remote_id, channel_id, url, attempt) \
         VALUES ('origin', 'articles_en', NULL, 'not a number')",
    )
    .execute(&pool)
    .await
    .unwrap();

    let tick = scheduler::drain(&service, 60).await.unwrap();
    assert_eq!(tick.failed, 1);
    assert_eq!(tick.started, 1);
    assert_eq!(db::count_entities(&pool).await.unwrap(), 2);
}
