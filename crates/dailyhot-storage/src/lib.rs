//! Durable hot-item storage: natural-key upserts and per-item enrichment commits.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dailyhot_core::{HotItem, PageCursor, RawItem, RawTimestamp, RetryState};
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "dailyhot-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("item in category {category} has no title")]
    MissingTitle { category: String },
    #[error("hot item {0} not found")]
    NotFound(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Display fields of a raw item mapped onto the stored row shape.
#[derive(Debug, Clone, PartialEq)]
pub struct HotItemDraft {
    pub category: String,
    pub title: String,
    pub description: Option<String>,
    pub cover: Option<String>,
    pub hot_score: Option<i64>,
    pub url: Option<String>,
    pub mobile_url: Option<String>,
    pub publish_time: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
}

impl HotItemDraft {
    pub fn from_raw(
        category: &str,
        raw: &RawItem,
        collected_at: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let title = raw
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| StoreError::MissingTitle {
                category: category.to_string(),
            })?;
        let publish_time = resolve_publish_time(category, &title, raw.timestamp.as_ref());
        Ok(Self {
            category: category.to_string(),
            title,
            description: raw.desc.clone(),
            cover: raw.cover.clone(),
            hot_score: raw.hot,
            url: raw.url.clone(),
            mobile_url: raw.mobile_url.clone(),
            publish_time,
            collected_at,
        })
    }
}

/// Bad timestamps degrade to "no publish time" instead of failing the upsert.
fn resolve_publish_time(
    category: &str,
    title: &str,
    raw: Option<&RawTimestamp>,
) -> Option<DateTime<Utc>> {
    let raw = raw.filter(|r| !r.is_blank())?;
    match raw.to_publish_time() {
        Ok(at) => Some(at),
        Err(err) => {
            warn!(category, title, error = %err, "ignoring publish timestamp");
            None
        }
    }
}

/// Outcome of one enrichment decision, committed on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum EnrichmentUpdate {
    Enriched {
        summary: String,
        tags: Vec<String>,
        at: DateTime<Utc>,
    },
    Failed(RetryState),
}

/// Read contract of the digest reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestQuery {
    pub categories: Vec<String>,
    pub collected_since: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for DigestQuery {
    fn default() -> Self {
        Self {
            categories: Vec::new(),
            collected_since: None,
            limit: 12,
        }
    }
}

type RunningJobs = Arc<StdMutex<HashSet<String>>>;

enum LeaseBacking {
    Released,
    Memory(RunningJobs),
    Advisory(PoolConnection<Postgres>, i64),
}

/// Exclusive right to run a named job. Release it explicitly when the job ends.
pub struct JobLease {
    job: String,
    backing: LeaseBacking,
}

impl JobLease {
    pub fn job(&self) -> &str {
        &self.job
    }

    pub async fn release(mut self) {
        match std::mem::replace(&mut self.backing, LeaseBacking::Released) {
            LeaseBacking::Released => {}
            LeaseBacking::Memory(running) => {
                forget_job(&running, &self.job);
                debug!(job = %self.job, "released job lease");
            }
            LeaseBacking::Advisory(mut conn, key) => {
                let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                    .bind(key)
                    .fetch_one(&mut *conn)
                    .await;
                match unlocked {
                    Ok(true) => debug!(job = %self.job, "released job lease"),
                    Ok(false) => {
                        warn!(job = %self.job, "job lease was not held at release");
                        conn.close_on_drop();
                    }
                    Err(err) => {
                        warn!(job = %self.job, error = %err, "failed to release job lease; closing connection");
                        conn.close_on_drop();
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for JobLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let advisory_key = match &self.backing {
            LeaseBacking::Advisory(_, key) => Some(*key),
            _ => None,
        };
        f.debug_struct("JobLease")
            .field("job", &self.job)
            .field("advisory_key", &advisory_key)
            .finish()
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        match &mut self.backing {
            LeaseBacking::Released => {}
            LeaseBacking::Memory(running) => forget_job(running, &self.job),
            // Session-level advisory locks die with the session.
            LeaseBacking::Advisory(conn, _) => conn.close_on_drop(),
        }
    }
}

fn forget_job(running: &RunningJobs, job: &str) {
    running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(job);
}

/// Stable advisory-lock key for a job name (FNV-1a).
pub fn job_lock_key(job: &str) -> i64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in "dailyhot:".bytes().chain(job.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash as i64
}

#[async_trait]
pub trait HotItemStore: Send + Sync {
    /// Insert or refresh the row for (category, title); enrichment fields are left alone.
    async fn upsert(
        &self,
        category: &str,
        raw: &RawItem,
        collected_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Next page of rows pending enrichment, newest first, strictly after `after`.
    async fn eligible_page(
        &self,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<HotItem>, StoreError>;

    async fn save_enrichment(&self, id: i64, update: &EnrichmentUpdate) -> Result<(), StoreError>;

    async fn find(&self, category: &str, title: &str) -> Result<Option<HotItem>, StoreError>;

    /// Returns false when no such row exists.
    async fn set_skip(&self, category: &str, title: &str, skip: bool) -> Result<bool, StoreError>;

    /// Forget enrichment output and retry history so the row is picked up again.
    async fn reset_enrichment(&self, category: &str, title: &str) -> Result<bool, StoreError>;

    async fn digest_candidates(&self, query: &DigestQuery) -> Result<Vec<HotItem>, StoreError>;

    /// `None` when another worker holds the job.
    async fn try_lock_job(&self, job: &str) -> Result<Option<JobLease>, StoreError>;
}

const ITEM_COLUMNS: &str = "id, category, title, description, cover, hot_score, url, mobile_url, \
     publish_time, collected_at, ai_summary, ai_tags, last_summarized_at, \
     analysis_fail_count, last_error, skip_enrichment";

#[derive(Debug, sqlx::FromRow)]
struct HotItemRow {
    id: i64,
    category: String,
    title: String,
    description: Option<String>,
    cover: Option<String>,
    hot_score: Option<i64>,
    url: Option<String>,
    mobile_url: Option<String>,
    publish_time: Option<DateTime<Utc>>,
    collected_at: DateTime<Utc>,
    ai_summary: Option<String>,
    ai_tags: Option<Vec<String>>,
    last_summarized_at: Option<DateTime<Utc>>,
    analysis_fail_count: i32,
    last_error: Option<String>,
    skip_enrichment: bool,
}

impl From<HotItemRow> for HotItem {
    fn from(row: HotItemRow) -> Self {
        Self {
            id: row.id,
            category: row.category,
            title: row.title,
            description: row.description,
            cover: row.cover,
            hot_score: row.hot_score,
            url: row.url,
            mobile_url: row.mobile_url,
            publish_time: row.publish_time,
            collected_at: row.collected_at,
            ai_summary: row.ai_summary,
            ai_tags: row.ai_tags,
            last_summarized_at: row.last_summarized_at,
            retry: RetryState {
                fail_count: row.analysis_fail_count.max(0) as u32,
                last_error: row.last_error,
                skip: row.skip_enrichment,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgHotItemStore {
    pool: PgPool,
}

impl PgHotItemStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl HotItemStore for PgHotItemStore {
    async fn upsert(
        &self,
        category: &str,
        raw: &RawItem,
        collected_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let draft = HotItemDraft::from_raw(category, raw, collected_at)?;

        // Dropping the transaction on error rolls back this item only.
        let mut tx = self.pool.begin().await?;
        let inserted: bool = sqlx::query_scalar(
            r#"
            INSERT INTO daily_hot
                (category, title, description, cover, hot_score, url, mobile_url, publish_time, collected_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (category, title) DO UPDATE SET
                description  = EXCLUDED.description,
                cover        = EXCLUDED.cover,
                hot_score    = EXCLUDED.hot_score,
                url          = EXCLUDED.url,
                mobile_url   = EXCLUDED.mobile_url,
                publish_time = EXCLUDED.publish_time,
                collected_at = EXCLUDED.collected_at
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(&draft.category)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(&draft.cover)
        .bind(draft.hot_score)
        .bind(&draft.url)
        .bind(&draft.mobile_url)
        .bind(draft.publish_time)
        .bind(draft.collected_at)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn eligible_page(
        &self,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<HotItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM daily_hot
            WHERE last_summarized_at IS NULL
              AND url IS NOT NULL AND url <> ''
              AND ($1::timestamptz IS NULL OR (collected_at, id) < ($1, $2))
            ORDER BY collected_at DESC, id DESC
            LIMIT $3
            "#
        );
        let rows: Vec<HotItemRow> = sqlx::query_as(&sql)
            .bind(after.map(|c| c.collected_at))
            .bind(after.map(|c| c.id).unwrap_or(i64::MAX))
            .bind(limit.max(1) as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(HotItem::from).collect())
    }

    async fn save_enrichment(&self, id: i64, update: &EnrichmentUpdate) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = match update {
            EnrichmentUpdate::Enriched { summary, tags, at } => {
                sqlx::query(
                    r#"
                    UPDATE daily_hot
                    SET ai_summary = $2,
                        ai_tags = $3,
                        last_summarized_at = $4,
                        analysis_fail_count = 0,
                        last_error = NULL
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(summary)
                .bind(tags)
                .bind(at)
                .execute(&mut *tx)
                .await?
            }
            EnrichmentUpdate::Failed(retry) => {
                sqlx::query(
                    "UPDATE daily_hot SET analysis_fail_count = $2, last_error = $3 WHERE id = $1",
                )
                .bind(id)
                .bind(i32::try_from(retry.fail_count).unwrap_or(i32::MAX))
                .bind(&retry.last_error)
                .execute(&mut *tx)
                .await?
            }
        };
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
        tx.commit().await?;
        Ok(())
    }

    async fn find(&self, category: &str, title: &str) -> Result<Option<HotItem>, StoreError> {
        let sql = format!("SELECT {ITEM_COLUMNS} FROM daily_hot WHERE category = $1 AND title = $2");
        let row: Option<HotItemRow> = sqlx::query_as(&sql)
            .bind(category)
            .bind(title)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(HotItem::from))
    }

    async fn set_skip(&self, category: &str, title: &str, skip: bool) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE daily_hot SET skip_enrichment = $3 WHERE category = $1 AND title = $2",
        )
        .bind(category)
        .bind(title)
        .bind(skip)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_enrichment(&self, category: &str, title: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE daily_hot
            SET ai_summary = NULL,
                ai_tags = NULL,
                last_summarized_at = NULL,
                analysis_fail_count = 0,
                last_error = NULL
            WHERE category = $1 AND title = $2
            "#,
        )
        .bind(category)
        .bind(title)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn digest_candidates(&self, query: &DigestQuery) -> Result<Vec<HotItem>, StoreError> {
        let sql = format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM daily_hot
            WHERE ai_summary IS NOT NULL
              AND ai_tags IS NOT NULL
              AND hot_score IS NOT NULL
              AND publish_time IS NOT NULL
              AND (cardinality($1::text[]) = 0 OR category = ANY($1))
              AND ($2::timestamptz IS NULL OR collected_at >= $2)
            ORDER BY hot_score DESC, publish_time DESC
            LIMIT $3
            "#
        );
        let rows: Vec<HotItemRow> = sqlx::query_as(&sql)
            .bind(&query.categories)
            .bind(query.collected_since)
            .bind(query.limit.max(1) as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(HotItem::from).collect())
    }

    async fn try_lock_job(&self, job: &str) -> Result<Option<JobLease>, StoreError> {
        let key = job_lock_key(job);
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Ok(None);
        }
        Ok(Some(JobLease {
            job: job.to_string(),
            backing: LeaseBacking::Advisory(conn, key),
        }))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    items: Vec<HotItem>,
}

/// In-process store with the same semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryHotItemStore {
    state: Mutex<MemoryState>,
    running_jobs: RunningJobs,
}

impl MemoryHotItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<HotItem> {
        let state = self.state.lock().await;
        let mut items = state.items.clone();
        items.sort_by_key(|i| i.id);
        items
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a row wholesale; handy for seeding fixtures.
    pub async fn put(&self, item: HotItem) {
        let mut state = self.state.lock().await;
        state.next_id = state.next_id.max(item.id);
        match state.items.iter_mut().find(|i| i.id == item.id) {
            Some(existing) => *existing = item,
            None => state.items.push(item),
        }
    }

    /// Mark a job as running elsewhere, as another process holding the lease would.
    pub async fn hold_job(&self, job: &str) {
        self.running_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.to_string());
    }

    pub async fn release_job(&self, job: &str) {
        forget_job(&self.running_jobs, job);
    }
}

#[async_trait]
impl HotItemStore for MemoryHotItemStore {
    async fn upsert(
        &self,
        category: &str,
        raw: &RawItem,
        collected_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let draft = HotItemDraft::from_raw(category, raw, collected_at)?;
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .items
            .iter_mut()
            .find(|i| i.category == draft.category && i.title == draft.title)
        {
            existing.description = draft.description;
            existing.cover = draft.cover;
            existing.hot_score = draft.hot_score;
            existing.url = draft.url;
            existing.mobile_url = draft.mobile_url;
            existing.publish_time = draft.publish_time;
            existing.collected_at = draft.collected_at;
            return Ok(UpsertOutcome::Updated);
        }

        state.next_id += 1;
        let id = state.next_id;
        state.items.push(HotItem {
            id,
            category: draft.category,
            title: draft.title,
            description: draft.description,
            cover: draft.cover,
            hot_score: draft.hot_score,
            url: draft.url,
            mobile_url: draft.mobile_url,
            publish_time: draft.publish_time,
            collected_at: draft.collected_at,
            ai_summary: None,
            ai_tags: None,
            last_summarized_at: None,
            retry: RetryState::default(),
        });
        Ok(UpsertOutcome::Inserted)
    }

    async fn eligible_page(
        &self,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<HotItem>, StoreError> {
        let state = self.state.lock().await;
        let mut page = state
            .items
            .iter()
            .filter(|i| i.is_pending_enrichment())
            .filter(|i| after.map_or(true, |c| c.admits(i)))
            .cloned()
            .collect::<Vec<_>>();
        page.sort_by(|a, b| (b.collected_at, b.id).cmp(&(a.collected_at, a.id)));
        page.truncate(limit.max(1));
        Ok(page)
    }

    async fn save_enrichment(&self, id: i64, update: &EnrichmentUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StoreError::NotFound(id))?;
        match update {
            EnrichmentUpdate::Enriched { summary, tags, at } => {
                item.ai_summary = Some(summary.clone());
                item.ai_tags = Some(tags.clone());
                item.last_summarized_at = Some(*at);
                item.retry.clear();
            }
            EnrichmentUpdate::Failed(retry) => {
                item.retry.fail_count = retry.fail_count;
                item.retry.last_error = retry.last_error.clone();
            }
        }
        Ok(())
    }

    async fn find(&self, category: &str, title: &str) -> Result<Option<HotItem>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .items
            .iter()
            .find(|i| i.category == category && i.title == title)
            .cloned())
    }

    async fn set_skip(&self, category: &str, title: &str, skip: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state
            .items
            .iter_mut()
            .find(|i| i.category == category && i.title == title)
        {
            Some(item) => {
                item.retry.skip = skip;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reset_enrichment(&self, category: &str, title: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state
            .items
            .iter_mut()
            .find(|i| i.category == category && i.title == title)
        {
            Some(item) => {
                item.ai_summary = None;
                item.ai_tags = None;
                item.last_summarized_at = None;
                item.retry.clear();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn digest_candidates(&self, query: &DigestQuery) -> Result<Vec<HotItem>, StoreError> {
        let state = self.state.lock().await;
        let mut items = state
            .items
            .iter()
            .filter(|i| i.is_digest_ready())
            .filter(|i| query.categories.is_empty() || query.categories.contains(&i.category))
            .filter(|i| query.collected_since.map_or(true, |since| i.collected_at >= since))
            .cloned()
            .collect::<Vec<_>>();
        items.sort_by(|a, b| (b.hot_score, b.publish_time).cmp(&(a.hot_score, a.publish_time)));
        items.truncate(query.limit.max(1));
        Ok(items)
    }

    async fn try_lock_job(&self, job: &str) -> Result<Option<JobLease>, StoreError> {
        let mut running = self
            .running_jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !running.insert(job.to_string()) {
            return Ok(None);
        }
        Ok(Some(JobLease {
            job: job.to_string(),
            backing: LeaseBacking::Memory(Arc::clone(&self.running_jobs)),
        }))
    }
}
