pub mod event_csv_file;
pub mod http_json;
pub mod ndjson_file;

pub use event_csv_file::EventCsvFileSource;
pub use http_json::HttpJsonSource;
pub use ndjson_file::NdjsonFileSource;
