use std::collections::{BTreeSet, HashMap};

use metering_core::{MeterRecord, Subject, TimeWindow, Timestamp};
use tokio::sync::RwLock;

pub mod questdb;

pub use questdb::QuestDbRecordStore;

/// The identity readings are computed for: one subject in one workspace/universe.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubjectKey {
    pub workspace_id: String,
    pub universe_id: String,
    pub subject: Subject,
}

impl SubjectKey {
    pub fn of(record: &MeterRecord) -> Self {
        Self {
            workspace_id: record.workspace_id.clone(),
            universe_id: record.universe_id.clone(),
            subject: record.subject.clone(),
        }
    }

    fn matches(&self, record: &MeterRecord) -> bool {
        self.subject == record.subject
            && self.workspace_id == record.workspace_id
            && self.universe_id == record.universe_id
    }
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored record {record_id} is malformed: {reason}")]
    Malformed { record_id: String, reason: String },
}

/// Persistence for meter records.
///
/// Writes are upserts keyed by record id, so replaying events is idempotent.
/// Window membership is by `observed_at`, half-open like [`TimeWindow`].
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, records: &[MeterRecord]) -> Result<(), StoreError>;

    /// Every subject with at least one stored record, in key order.
    async fn subjects(&self) -> Result<Vec<SubjectKey>, StoreError>;

    /// Records for `key` observed within `window`, ordered by `observed_at`.
    async fn records_in_window(
        &self,
        key: &SubjectKey,
        window: &TimeWindow,
    ) -> Result<Vec<MeterRecord>, StoreError>;

    /// The most recent record for `key` observed strictly before `before`.
    async fn last_before(
        &self,
        key: &SubjectKey,
        before: Timestamp,
    ) -> Result<Option<MeterRecord>, StoreError>;
}

/// Record store held in process memory.
#[derive(Default)]
pub struct InMemoryRecordStore {
    records: RwLock<HashMap<String, MeterRecord>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert(&self, records: &[MeterRecord]) -> Result<(), StoreError> {
        let mut guard = self.records.write().await;
        for record in records {
            guard.insert(record.id.clone(), record.clone());
        }
        Ok(())
    }

    async fn subjects(&self) -> Result<Vec<SubjectKey>, StoreError> {
        let guard = self.records.read().await;
        let keys: BTreeSet<SubjectKey> = guard.values().map(SubjectKey::of).collect();
        Ok(keys.into_iter().collect())
    }

    async fn records_in_window(

        &self,

        key: &SubjectKey,

        window: &TimeWindow,

    ) -> Result<Vec<MeterRecord>, StoreError> {
        let guard = self.records.read().await;
        let mut out: Vec<MeterRecord> = guard
            .values()
            .filter(|r| key.matches(r) && window.contains(r.observed_at))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.observed_at, &a.id).cmp(&(b.observed_at, &b.id)));
        Ok(out)
    }

    async fn last_before(

        &self,

        key: &SubjectKey,

        before: Timestamp,

    ) -> Result<Option<MeterRecord>, StoreError> {
        let guard = self.records.read().await;
        Ok(guard
            .values()
            .filter(|r| key.matches(r) && r.observed_at < before)
            .max_by_key(|r| (r.observed_at, r.metered_at, &r.id))
            .cloned())
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::*, *};
    use time::macros::datetime;

    fn feb() -> TimeWindow {
        TimeWindow::new(
            ts(datetime!(2024-02-01 00:00:00 UTC)),
            ts(datetime!(2024-03-01 00:00:00 UTC)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn upsert_is_keyed_by_record_id() {
        let store = InMemoryRecordStore::new();
        let first = record("customer:1", "evt1", datetime!(2024-02-02 00:00:00 UTC), "seats", "5");
        let replay = record("customer:1", "evt1", datetime!(2024-02-02 00:00:00 UTC), "seats", "6");

        store.upsert(&[first]).await.unwrap();
        store.upsert(&[replay]).await.unwrap();

        assert_eq!(store.len().await, 1);
        let any = record("customer:1", "x", datetime!(2024-02-02 00:00:00 UTC), "seats", "1");
        let key = SubjectKey::of(&any);
        let rows = store.records_in_window(&key, &feb()).await.unwrap();
        assert_eq!(rows[0].observations()[0].quantity.to_string(), "6");
    }

    #[tokio::test]
    async fn window_queries_are_half_open_and_per_subject() {
        let store = InMemoryRecordStore::new();
        store
            .upsert(&[
                record("customer:1", "jan", datetime!(2024-01-20 00:00:00 UTC), "seats", "3"),
                record("customer:1", "jan-late", datetime!(2024-01-31 12:00:00 UTC), "seats", "4"),
                record("customer:1", "start", datetime!(2024-02-01 00:00:00 UTC), "seats", "5"),
                record("customer:1", "end", datetime!(2024-03-01 00:00:00 UTC), "seats", "9"),
                record("customer:2", "other", datetime!(2024-02-10 00:00:00 UTC), "seats", "1"),
            ])
            .await
            .unwrap();

        let subjects = store.subjects().await.unwrap();
        assert_eq!(subjects.len(), 2);
        assert_eq!(subjects[0].subject.as_str(), "customer:1");

        let in_window = store.records_in_window(&subjects[0], &feb()).await.unwrap();
        let ids: Vec<_> = in_window.iter().map(|r| r.source_event_id.as_str()).collect();
        assert_eq!(ids, ["start"]);

        let prior = store.last_before(&subjects[0], feb().start()).await.unwrap().unwrap();
        assert_eq!(prior.source_event_id, "jan-late");

        assert!(store.last_before(&subjects[1], feb().start()).await.unwrap().is_none());
    }
}
