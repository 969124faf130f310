use std::collections::BTreeMap;

use metering_core::{Decimal, MeterRecord, Observation, Subject, TimeWindow, Timestamp, Unit};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use super::{RecordStore, StoreError, SubjectKey};

/// One row per observation; a record is the set of rows sharing `record_id`.
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meter_observations (
    ts TIMESTAMP,
    record_id SYMBOL,
    position INT,
    workspace_id SYMBOL,
    universe_id SYMBOL,
    subject SYMBOL,
    unit SYMBOL,
    quantity STRING,
    window_start TIMESTAMP,
    window_end TIMESTAMP,
    dimensions STRING,
    source_event_id STRING,
    metered_at TIMESTAMP
) TIMESTAMP(ts) PARTITION BY DAY WAL
DEDUP UPSERT KEYS(ts, record_id, position)
"#;

const SELECT_COLUMNS: &str = r#"
    SELECT
        ts,
        record_id,
        position,
        workspace_id,
        universe_id,
        subject,
        unit,
        quantity,
        window_start,
        window_end,
        dimensions,
        source_event_id,
        metered_at
    FROM meter_observations
"#;

#[derive(Debug, Clone, sqlx::FromRow)]
struct ObservationRow {
    ts: OffsetDateTime,
    record_id: String,
    position: i32,
    workspace_id: String,
    universe_id: String,
    subject: String,
    unit: String,
    quantity: String,
    window_start: OffsetDateTime,
    window_end: OffsetDateTime,
    dimensions: String,
    source_event_id: String,
    metered_at: OffsetDateTime,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct SubjectRow {
    workspace_id: String,
    universe_id: String,
    subject: String,
}

/// Insert every observation of `records` in a single statement.
pub async fn insert_records<'a, I>(pool: &PgPool, records: I) -> Result<u64, StoreError>
where
    I: IntoIterator<Item = &'a MeterRecord>,
{
    let mut rows = Vec::new();
    for record in records {
        let dimensions =
            serde_json::to_string(&record.dimensions).map_err(|e| malformed(&record.id, e))?;
        for (position, observation) in record.observations().iter().enumerate() {
            rows.push((record, position as i32, observation, dimensions.clone()));
        }
    }
    if rows.is_empty() {
        return Ok(0);
    }

    let mut builder = QueryBuilder::<Postgres>::new(
        "INSERT INTO meter_observations (ts, record_id, position, workspace_id, universe_id, \
         subject, unit, quantity, window_start, window_end, dimensions, source_event_id, \
         metered_at) ",
    );
    builder.push("VALUES ");
    builder.push_values(&rows, |mut b, (record, position, observation, dimensions)| {
        b.push_bind(record.observed_at.as_offset())
            .push_bind(&record.id)
            .push_bind(*position)
            .push_bind(&record.workspace_id)
            .push_bind(&record.universe_id)
            .push_bind(record.subject.as_str())
            .push_bind(observation.unit.as_str())
            .push_bind(observation.quantity.to_string())
            .push_bind(observation.window.start().as_offset())
            .push_bind(observation.window.end().as_offset())
            .push_bind(dimensions)
            .push_bind(&record.source_event_id)
            .push_bind(record.metered_at.as_offset());
    });

    let result = builder.build().execute(pool).await?;
    Ok(result.rows_affected())
}

fn malformed(record_id: &str, reason: impl ToString) -> StoreError {
    StoreError::Malformed {
        record_id: record_id.to_string(),
        reason: reason.to_string(),
    }
}

fn row_to_observation(row: &ObservationRow) -> Result<Observation, StoreError> {
    let start = Timestamp::new(row.window_start).map_err(|e| malformed(&row.record_id, e))?;
    let end = Timestamp::new(row.window_end).map_err(|e| malformed(&row.record_id, e))?;
    Ok(Observation {
        quantity: Decimal::parse(&row.quantity).map_err(|e| malformed(&row.record_id, e))?,
        unit: Unit::new(row.unit.clone()).map_err(|e| malformed(&row.record_id, e))?,
        window: TimeWindow::new(start, end).map_err(|e| malformed(&row.record_id, e))?,
    })
}

/// Fold rows (ordered by record, then position) back into records.
fn fold_rows(rows: Vec<ObservationRow>) -> Result<Vec<MeterRecord>, StoreError> {
    let mut grouped: Vec<(ObservationRow, Vec<Observation>)> = Vec::new();
    for row in rows {
        let observation = row_to_observation(&row)?;
        match grouped.last_mut() {
            Some((head, observations)) if head.record_id == row.record_id => {
                observations.push(observation)
            }
            _ => grouped.push((row, vec![observation])),
        }
    }

    grouped
        .into_iter()
        .map(|(head, observations)| {
            let id = &head.record_id;
            let subject = Subject::new(head.subject.clone()).map_err(|e| malformed(id, e))?;
            let dimensions: BTreeMap<String, String> =
                serde_json::from_str(&head.dimensions).map_err(|e| malformed(id, e))?;
            let observed_at = Timestamp::new(head.ts).map_err(|e| malformed(id, e))?;
            let metered_at = Timestamp::new(head.metered_at).map_err(|e| malformed(id, e))?;

            MeterRecord::builder(id.clone(), head.workspace_id, head.universe_id, subject)
                .observed_at(observed_at)
                .observations(observations)
                .dimensions(dimensions)
                .source_event_id(head.source_event_id)
                .metered_at(metered_at)
                .build()
                .map_err(|e| malformed(id, e))
        })
        .collect()
}

/// Record store over QuestDB's Postgres wire endpoint.
pub struct QuestDbRecordStore {
    pool: PgPool,
}

impl QuestDbRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn load_record(
        &self,
        record_id: &str,
        observed_at: OffsetDateTime,
    ) -> Result<Option<MeterRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE record_id = $1 AND ts = $2 ORDER BY position");
        let rows = sqlx::query_as::<_, ObservationRow>(&sql)
            .bind(record_id)
            .bind(observed_at)
            .fetch_all(&self.pool)
            .await?;
        Ok(fold_rows(rows)?.into_iter().next())
    }
}

#[async_trait::async_trait]
impl RecordStore for QuestDbRecordStore {
    async fn upsert(&self, records: &[MeterRecord]) -> Result<(), StoreError> {
        insert_records(&self.pool, records).await.map(|_| ())
    }

    async fn subjects(&self) -> Result<Vec<SubjectKey>, StoreError> {
        let rows = sqlx::query_as::<_, SubjectRow>(
            r#"
            SELECT DISTINCT workspace_id, universe_id, subject
            FROM meter_observations
            ORDER BY workspace_id, universe_id, subject
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let subject =
                    Subject::new(row.subject.clone()).map_err(|e| malformed(&row.subject, e))?;
                Ok(SubjectKey {
                    workspace_id: row.workspace_id,
                    universe_id: row.universe_id,
                    subject,
                })
            })
            .collect()
    }

    async fn records_in_window(

        &self,

        key: &SubjectKey,

        window: &TimeWindow,

    ) -> Result<Vec<MeterRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS}
            WHERE workspace_id = $1
              AND universe_id = $2
              AND subject = $3
              AND ts >= $4
              AND ts <  $5
            ORDER BY ts, record_id, position"
        );
        let rows = sqlx::query_as::<_, ObservationRow>(&sql)
            .bind(&key.workspace_id)
            .bind(&key.universe_id)
            .bind(key.subject.as_str())
            .bind(window.start().as_offset())
            .bind(window.end().as_offset())
            .fetch_all(&self.pool)
            .await?;

        fold_rows(rows)
    }

    async fn last_before(

        &self,

        key: &SubjectKey,

        before: Timestamp,

    ) -> Result<Option<MeterRecord>, StoreError> {
        // Find the latest record first, then load all of its observations.
        let latest: Option<(String, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT record_id, ts
            FROM meter_observations
            WHERE workspace_id = $1
              AND universe_id = $2
              AND subject = $3
              AND ts < $4
            ORDER BY ts DESC, metered_at DESC, record_id DESC
            LIMIT 1
            "#,
        )
        .bind(&key.workspace_id)
        .bind(&key.universe_id)
        .bind(key.subject.as_str())
        .bind(before.as_offset())
        .fetch_optional(&self.pool)
        .await?;

        match latest {
            Some((record_id, ts)) => self.load_record(&record_id, ts).await,
            None => Ok(None),
        }
    }
}
