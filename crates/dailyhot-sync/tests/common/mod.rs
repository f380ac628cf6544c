#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dailyhot_adapters::{EnrichError, Enricher, HotListSource};
use dailyhot_core::{AnalysisResponse, Category, HotItem, HotList, PageCursor, RawItem};
use dailyhot_storage::{
    DigestQuery, EnrichmentUpdate, HotItemStore, JobLease, MemoryHotItemStore, StoreError,
    UpsertOutcome,
};
use dailyhot_sync::EnrichmentConfig;

pub fn fast_config(batch_size: usize) -> EnrichmentConfig {
    EnrichmentConfig {
        batch_size,
        max_failures: 2,
        item_delay: Duration::ZERO,
        page_delay: Duration::ZERO,
    }
}

pub fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap()
}

pub fn raw(title: &str, url: Option<&str>) -> RawItem {
    RawItem {
        title: Some(title.to_string()),
        desc: Some(format!("about {title}")),
        hot: Some(1000),
        url: url.map(str::to_string),
        ..RawItem::default()
    }
}

pub async fn seed(store: &MemoryHotItemStore, category: &str, title: &str, url: Option<&str>, minute: u32) -> HotItem {
    store
        .upsert(category, &raw(title, url), at(minute))
        .await
        .expect("seed upsert");
    store
        .find(category, title)
        .await
        .expect("find")
        .expect("seeded row")
}

/// Serves a fixed set of categories; paths without a list come back absent.
#[derive(Default)]
pub struct StaticSource {
    pub categories: Vec<Category>,
    pub lists: HashMap<String, HotList>,
}

impl StaticSource {
    pub fn with_list(mut self, name: &str, items: Vec<RawItem>) -> Self {
        let path = format!("/{name}");
        self.categories.push(Category {
            name: name.to_string(),
            path: path.clone(),
        });
        self.lists.insert(
            path,
            HotList {
                title: Some(name.to_string()),
                items,
                ..HotList::default()
            },
        );
        self
    }

    pub fn with_missing(mut self, name: &str) -> Self {
        self.categories.push(Category {
            name: name.to_string(),
            path: format!("/{name}"),
        });
        self
    }
}

#[async_trait]
impl HotListSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch_categories(&self) -> Vec<Category> {
        self.categories.clone()
    }

    async fn fetch_items(&self, path: &str) -> Option<HotList> {
        self.lists.get(path).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Summary,
    Empty,
    Error,
}

/// Answers every url with the same reply and records what it was asked.
pub struct ScriptedEnricher {
    reply: Reply,
    calls: Mutex<Vec<String>>,
    pub hold: Option<Duration>,
}

impl ScriptedEnricher {
    pub fn new(reply: Reply) -> Self {
        Self {
            reply,
            calls: Mutex::new(Vec::new()),
            hold: None,
        }
    }

    pub fn slow(reply: Reply, hold: Duration) -> Self {
        Self {
            hold: Some(hold),
            ..Self::new(reply)
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Enricher for ScriptedEnricher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn analyze(&self, url: &str) -> Result<AnalysisResponse, EnrichError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(hold) = self.hold {
            tokio::time::sleep(hold).await;
        }
        match self.reply {
            Reply::Summary => Ok(AnalysisResponse {
                summary: Some(format!("summary of {url}")),
                tags: Some(vec!["tech".into(), "news".into()]),
            }),
            Reply::Empty => Ok(AnalysisResponse {
                summary: Some("  ".into()),
                tags: Some(Vec::new()),
            }),
            Reply::Error => Err(EnrichError::Message("upstream returned 500".into())),
        }
    }
}

/// Memory store that can be told to fail specific writes or reads.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryHotItemStore,
    failing_titles: Mutex<HashSet<String>>,
    failing_saves: Mutex<HashSet<i64>>,
    fail_pages: AtomicBool,
    pub pages_served: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_upsert_of(&self, title: &str) {
        self.failing_titles.lock().unwrap().insert(title.to_string());
    }

    pub fn fail_save_of(&self, id: i64) {
        self.failing_saves.lock().unwrap().insert(id);
    }

    pub fn fail_pages(&self) {
        self.fail_pages.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HotItemStore for FlakyStore {
    async fn upsert(
        &self,
        category: &str,
        raw: &RawItem,
        collected_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let title = raw.title.clone().unwrap_or_default();
        if self.failing_titles.lock().unwrap().contains(&title) {
            return Err(StoreError::MissingTitle {
                category: category.to_string(),
            });
        }
        self.inner.upsert(category, raw, collected_at).await
    }

    async fn eligible_page(
        &self,
        after: Option<PageCursor>,
        limit: usize,
    ) -> Result<Vec<HotItem>, StoreError> {
        if self.fail_pages.load(Ordering::SeqCst) {
            return Err(StoreError::NotFound(0));
        }
        self.pages_served.fetch_add(1, Ordering::SeqCst);
        self.inner.eligible_page(after, limit).await
    }

    async fn save_enrichment(&self, id: i64, update: &EnrichmentUpdate) -> Result<(), StoreError> {
        if self.failing_saves.lock().unwrap().contains(&id) {
            return Err(StoreError::NotFound(id));
        }
        self.inner.save_enrichment(id, update).await
    }

    async fn find(&self, category: &str, title: &str) -> Result<Option<HotItem>, StoreError> {
        self.inner.find(category, title).await
    }

    async fn set_skip(&self, category: &str, title: &str, skip: bool) -> Result<bool, StoreError> {
        self.inner.set_skip(category, title, skip).await
    }

    async fn reset_enrichment(&self, category: &str, title: &str) -> Result<bool, StoreError> {
        self.inner.reset_enrichment(category, title).await
    }

    async fn digest_candidates(&self, query: &DigestQuery) -> Result<Vec<HotItem>, StoreError> {
        self.inner.digest_candidates(query).await
    }

    async fn try_lock_job(&self, job: &str) -> Result<Option<JobLease>, StoreError> {
        self.inner.try_lock_job(job).await
    }
}
