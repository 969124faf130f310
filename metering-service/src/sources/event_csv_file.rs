use std::{collections::BTreeMap, path::PathBuf};

use csv::StringRecord;
use metering_core::{EventPayload, Subject, Timestamp};

use crate::pipeline::{Envelope, EnvelopeStream, PipelineError, Source};

const FIXED_COLUMNS: [&str; 6] = ["id", "workspace_id", "universe_id", "type", "subject", "time"];

/// Delimited-text event source (`,` for CSV, `|` for `.dat` exports).
///
/// Expected header columns (by name):
/// - id, workspace_id, universe_id, type, subject
/// - time (RFC3339 timestamp)
///
/// Every other column becomes an event property; empty cells are omitted.
pub struct EventCsvFileSource {
    path: PathBuf,
    delimiter: u8,
}

impl EventCsvFileSource {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            delimiter: b',',
        }
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }
}

fn record_to_event(
    record: &StringRecord,
    headers: &StringRecord,
) -> Result<EventPayload, PipelineError> {
    let get = |name: &str| -> Result<&str, PipelineError> {
        headers
            .iter()
            .position(|h| h == name)
            .and_then(|idx| record.get(idx))
            .map(str::trim)
            .ok_or_else(|| {
                PipelineError::Source(format!("missing column '{name}' in event record"))
            })
    };

    let time_str = get("time")?;
    let time = Timestamp::parse_rfc3339(time_str)
        .map_err(|e| PipelineError::Source(format!("invalid time '{time_str}': {e}")))?;
    let subject = Subject::new(get("subject")?).map_err(|e| PipelineError::Source(e.to_string()))?;

    let properties: BTreeMap<String, String> = headers
        .iter()
        .zip(record.iter())
        .filter(|(h, _)| !FIXED_COLUMNS.contains(h))
        .map(|(h, v)| (h.to_string(), v.trim().to_string()))
        .filter(|(_, v)| !v.is_empty())
        .collect();

    EventPayload::new(
        get("id")?,
        get("workspace_id")?,
        get("universe_id")?,
        get("type")?,
        subject,
        time,
        properties,
    )
    .map_err(|e| PipelineError::Source(e.to_string()))
}

#[async_trait::async_trait]
impl Source<EventPayload> for EventCsvFileSource {
    async fn stream(&self) -> EnvelopeStream<EventPayload> {
        // Blocking csv reader inside a single async task; fine for backfills.
        let path = self.path.clone();
        let delimiter = self.delimiter;
        let s = async_stream::stream! {
            let mut rdr = match csv::ReaderBuilder::new().delimiter(delimiter).from_path(&path) {
                Ok(rdr) => rdr,
                Err(e) => {
                    let reason = format!("failed to open {}: {e}", path.display());
                    yield Err(PipelineError::Source(reason));
                    return;
                }
            };
            let headers = match rdr.headers() {
                Ok(h) => h.clone(),
                Err(e) => {
                    let reason = format!("failed to read headers of {}: {e}", path.display());
                    yield Err(PipelineError::Source(reason));
                    return;
                }
            };

            // A bad row is reported and skipped; an unreadable file ends the stream.
            for result in rdr.records() {
                let record = match result {
                    Ok(record) => record,
                    Err(e) if e.is_io_error() => {
                        let reason = format!("failed to read {}: {e}", path.display());
                        yield Err(PipelineError::Source(reason));
                        break;
                    }
                    Err(e) => {
                        metrics::counter!("event_file_parse_errors_total").increment(1);
                        yield Err(PipelineError::Source(format!("malformed row: {e}")));
                        continue;
                    }
                };

                match record_to_event(&record, &headers) {
                    Ok(event) => yield Ok(Envelope::now(event)),
                    Err(e) => {
                        metrics::counter!("event_file_parse_errors_total").increment(1);
                        yield Err(e);
                    }
                }
            }
        };

        Box::pin(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(cols: &[&str]) -> StringRecord {
        StringRecord::from(cols.to_vec())
    }

    #[test]
    fn extra_columns_become_properties() {
        let h = headers(&[
            "id",
            "workspace_id",
            "universe_id",
            "type",
            "subject",
            "time",
            "tokens",
            "model",
            "note",
        ]);
        let r = StringRecord::from(vec![
            "evt1",
            "ws",
            "prod",
            "completion",
            "customer:1",
            "2024-03-01T10:00:00Z",
            " 1500 ",
            "large",
            "",
        ]);

        let event = record_to_event(&r, &h).unwrap();
        assert_eq!(event.id, "evt1");
        assert_eq!(event.property("tokens"), Some("1500"));
        assert_eq!(event.property("model"), Some("large"));
        assert!(!event.properties.contains_key("note"));
        assert!(!event.properties.contains_key("subject"));
    }

    #[test]
    fn missing_or_invalid_fixed_columns_are_errors() {
        let h = headers(&["id", "workspace_id", "universe_id", "type", "subject"]);
        let r = StringRecord::from(vec!["evt1", "ws", "prod", "completion", "customer:1"]);
        assert!(matches!(record_to_event(&r, &h), Err(PipelineError::Source(_))));

        let h = headers(&["id", "workspace_id", "universe_id", "type", "subject", "time"]);
        let r =
            StringRecord::from(vec!["evt1", "ws", "prod", "completion", "customer:1", "yesterday"]);
        assert!(record_to_event(&r, &h).is_err());
    }

    #[tokio::test]
    async fn pipe_delimited_file_streams_events_and_reports_bad_rows() {
        use futures::StreamExt;

        let path = std::env::temp_dir().join(format!("events-{}.dat", std::process::id()));
        let contents = "id|workspace_id|universe_id|type|subject|time|seats\n\
                        evt1|ws|prod|seats.changed|customer:1|2024-02-01T00:00:00Z|10\n\
                        evt2|ws|prod|seats.changed|customer:1|not-a-time|12\n\
                        evt3|ws|prod|seats.changed|customer:1|2024-02-15T00:00:00Z|15\n";
        tokio::fs::write(&path, contents).await.unwrap();

        let source = EventCsvFileSource::new(&path).with_delimiter(b'|');
        let items: Vec<_> = source.stream().await.collect().await;
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().payload.property("seats"), Some("10"));
        assert!(items[1].is_err());
        assert_eq!(items[2].as_ref().unwrap().payload.id, "evt3");
    }
}
