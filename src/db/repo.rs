use super::model::StoredEntityRow;
use crate::model::{EntityImportStatus, PendingSyncWorkItem};
use anyhow::{Context, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::collections::{BTreeSet, HashMap};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn work_item_from_row(row: &SqliteRow) -> sqlx::Result<PendingSyncWorkItem> {
    Ok(PendingSyncWorkItem {
        id: row.try_get("id")?,
        remote_id: row.try_get("remote_id")?,
        channel_id: row.try_get("channel_id")?,
        url: row.try_get("url")?,
        attempt: row.try_get("attempt")?,
    })
}

// ---------------------------------------------------------------------------
// Continuation queue

#[instrument(skip_all)]
pub async fn enqueue_pending_sync(
    pool: &Pool,
    remote_id: &str,
    channel_id: &str,
    url: Option<&str>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_pending_sync_tx(&mut tx, remote_id, channel_id, url).await?;
    tx.commit().await?;
    Ok(id)
}

async fn enqueue_pending_sync_tx(
    tx: &mut Transaction<'_, Sqlite>,
    remote_id: &str,
    channel_id: &str,
    url: Option<&str>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO pending_sync (remote_id, channel_id, url, attempt) VALUES (?, ?, ?, 0) RETURNING id",
    )
    .bind(remote_id)
    .bind(channel_id)
    .bind(url)
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Oldest work item of a pair and whether it is due.
#[instrument(skip_all)]
pub async fn head_pending_sync(
    pool: &Pool,
    remote_id: &str,
    channel_id: &str,
) -> Result<Option<(PendingSyncWorkItem, bool)>> {
    let row = sqlx::query(
        "SELECT id, remote_id, channel_id, url, attempt, \
                (datetime(due_at) <= CURRENT_TIMESTAMP) AS due \
         FROM pending_sync WHERE remote_id = ? AND channel_id = ? ORDER BY id ASC LIMIT 1",
    )
    .bind(remote_id)
    .bind(channel_id)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let item = work_item_from_row(&row)
        .with_context(|| format!("corrupt work item for {remote_id}/{channel_id}"))?;
    let due: i64 = row.try_get("due")?;
    Ok(Some((item, due != 0)))
}

/// Drop a finished work item and, in the same transaction, queue the cursor
/// its run stopped at.
#[instrument(skip_all)]
pub async fn complete_pending_sync(
    pool: &Pool,
    item_id: Option<i64>,
    remote_id: &str,
    channel_id: &str,
    next_url: Option<&str>,
) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    if let Some(id) = item_id {
        sqlx::query("DELETE FROM pending_sync WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
    }
    let queued = match next_url {
        Some(url) => Some(enqueue_pending_sync_tx(&mut tx, remote_id, channel_id, Some(url)).await?),
        None => None,
    };
    tx.commit().await?;
    Ok(queued)
}

#[instrument(skip_all)]
pub async fn backoff_pending_sync_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    // Exponential backoff: 5s * 2^attempt
    let secs = 5_i64 * (1_i64 << attempt.clamp(0, 10));
    let secs = if max_cap_secs <= 0 {
        secs
    } else {
        secs.min(max_cap_secs)
    };
    sqlx::query(
        "UPDATE pending_sync SET attempt = ?, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_pending_sync(pool: &Pool) -> Result<Vec<PendingSyncWorkItem>> {
    let rows = sqlx::query(
        "SELECT id, remote_id, channel_id, url, attempt FROM pending_sync ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .iter()
        .map(work_item_from_row)
        .collect::<sqlx::Result<_>>()?)
}

#[instrument(skip_all)]
pub async fn count_pending_sync(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_sync")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Import status

#[instrument(skip_all)]
pub async fn upsert_import_status(pool: &Pool, status: &EntityImportStatus) -> Result<()> {
    sqlx::query(
        "INSERT INTO entity_import_status \
            (entity_id, entity_uuid, entity_type_id, entity_bundle, remote_website_id, channel_id, last_import, policy) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(entity_uuid) DO UPDATE SET \
            entity_id = excluded.entity_id, \
            entity_type_id = excluded.entity_type_id, \
            entity_bundle = excluded.entity_bundle, \
            remote_website_id = excluded.remote_website_id, \
            channel_id = excluded.channel_id, \
            last_import = excluded.last_import, \
            policy = excluded.policy",
    )
    .bind(&status.entity_id)
    .bind(&status.entity_uuid)
    .bind(&status.entity_type_id)
    .bind(&status.entity_bundle)
    .bind(&status.remote_website_id)
    .bind(&status.channel_id)
    .bind(status.last_import)
    .bind(&status.policy)
    .execute(pool)
    .await
    .context("failed to persist import status")?;
    Ok(())
}

pub async fn fetch_import_status(pool: &Pool, uuid: &str) -> Result<Option<EntityImportStatus>> {
    let row = sqlx::query(
        "SELECT entity_id, entity_uuid, entity_type_id, entity_bundle, remote_website_id, channel_id, last_import, policy \
         FROM entity_import_status WHERE entity_uuid = ?",
    )
    .bind(uuid)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| EntityImportStatus {
        entity_id: row.get("entity_id"),
        entity_uuid: row.get("entity_uuid"),
        entity_type_id: row.get("entity_type_id"),
        entity_bundle: row.get("entity_bundle"),
        remote_website_id: row.get("remote_website_id"),
        channel_id: row.get("channel_id"),
        last_import: row.get("last_import"),
        policy: row.get("policy"),
    }))
}

/// Last import timestamps keyed by UUID, for the given UUIDs only.
pub async fn last_import_times(
    pool: &Pool,
    uuids: &BTreeSet<String>,
) -> Result<HashMap<String, i64>> {
    if uuids.is_empty() {
        return Ok(HashMap::new());
    }
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT entity_uuid, last_import FROM entity_import_status WHERE entity_uuid IN (",
    );
    let mut separated = qb.separated(", ");
    for uuid in uuids {
        separated.push_bind(uuid);
    }
    separated.push_unseparated(")");
    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows
        .into_iter()
        .map(|row| (row.get("entity_uuid"), row.get("last_import")))
        .collect())
}

pub async fn count_import_status(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_import_status")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Local entity store

/// Insert or replace one translation of a record; returns the entity id.
#[instrument(skip_all)]
pub async fn upsert_entity(
    pool: &Pool,
    uuid: &str,
    langcode: &str,
    entity_type_id: &str,
    bundle: &str,
    payload: &str,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO imported_entities (uuid, langcode, entity_type_id, bundle, payload) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(uuid, langcode) DO UPDATE SET \
            entity_type_id = excluded.entity_type_id, \
            bundle = excluded.bundle, \
            payload = excluded.payload, \
            updated_at = CURRENT_TIMESTAMP",
    )
    .bind(uuid)
    .bind(langcode)
    .bind(entity_type_id)
    .bind(bundle)
    .bind(payload)
    .execute(&mut *tx)
    .await
    .context("failed to store imported entity")?;
    // Translations share the id of the first stored row.
    let id: i64 = sqlx::query_scalar("SELECT MIN(id) FROM imported_entities WHERE uuid = ?")
        .bind(uuid)
        .fetch_one(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(id)
}

/// Subset of `uuids` already stored as entities of `entity_type_id`.
#[instrument(skip_all)]
pub async fn existing_uuids(
    pool: &Pool,
    entity_type_id: &str,
    uuids: &BTreeSet<String>,
) -> Result<BTreeSet<String>> {
    if uuids.is_empty() {
        return Ok(BTreeSet::new());
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("SELECT DISTINCT uuid FROM imported_entities WHERE entity_type_id = ");
    qb.push_bind(entity_type_id);
    qb.push(" AND uuid IN (");
    let mut separated = qb.separated(", ");
    for uuid in uuids {
        separated.push_bind(uuid);
    }
    separated.push_unseparated(")");
    let rows = qb.build().fetch_all(pool).await?;
    Ok(rows.into_iter().map(|row| row.get("uuid")).collect())
}

/// All stored translations of one entity, oldest first.
pub async fn fetch_entity_rows(pool: &Pool, uuid: &str) -> Result<Vec<StoredEntityRow>> {
    let rows = sqlx::query(
        "SELECT id, uuid, langcode, entity_type_id, bundle, payload FROM imported_entities WHERE uuid = ? ORDER BY id ASC",
    )
    .bind(uuid)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| StoredEntityRow {
            id: row.get("id"),
            uuid: row.get("uuid"),
            langcode: row.get("langcode"),
            entity_type_id: row.get("entity_type_id"),
            bundle: row.get("bundle"),
            payload: row.get("payload"),
        })
        .collect())
}

pub async fn count_entities(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT uuid) FROM imported_entities")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
