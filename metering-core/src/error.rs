//! Error taxonomy for metering and aggregation.
//!
//! Every fallible constructor and both engine entry points return one of these
//! explicitly; nothing in the core panics on bad input.

use thiserror::Error;

/// Result alias over the umbrella [`MeteringError`].
pub type Result<T> = std::result::Result<T, MeteringError>;

/// Malformed value objects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required string field was empty or whitespace.
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    /// A timestamp carried the zero value of a wire format.
    #[error("{0} must not be a zero timestamp")]
    ZeroTimestamp(&'static str),

    #[error("invalid timestamp '{input}': {reason}")]
    InvalidTimestamp { input: String, reason: String },

    #[error("window start {start} is after window end {end}")]
    InvertedWindow { start: String, end: String },

    #[error("unrecognized aggregation: {0}")]
    UnknownAggregation(String),

    #[error("invalid decimal '{input}': {reason}")]
    InvalidDecimal { input: String, reason: String },

    /// A record was built without any observation.
    #[error("meter record must carry at least one observation")]
    NoObservations,
}

/// Extraction failures; any one of them discards the whole candidate record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("event {event_id}: source property '{property}' is missing")]
    MissingProperty { event_id: String, property: String },

    #[error("event {event_id}: property '{property}' value '{value}' is not a decimal")]
    InvalidQuantity {
        event_id: String,
        property: String,
        value: String,
    },

    #[error("event {event_id}: {source}")]
    InvalidRecord {
        event_id: String,
        #[source]
        source: ValidationError,
    },
}

/// Aggregation failures; a reading is either complete or not produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregationError {
    #[error("no records in window and no carried-forward record")]
    NoData,

    /// Every step of a gauge unit fell outside the window.
    #[error("unit '{0}' has no state inside the window")]
    NoStateInWindow(String),

    #[error("records span multiple subjects or namespaces: '{expected}' vs '{found}'")]
    MixedSubjects { expected: String, found: String },

    #[error("arithmetic failure on unit '{unit}': {reason}")]
    Arithmetic { unit: String, reason: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Invalid extraction or aggregation configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("metering config must contain at least one extraction")]
    EmptyExtractions,

    #[error("extraction #{index}: {reason}")]
    InvalidExtraction { index: usize, reason: String },

    #[error("aggregation window must satisfy start < end (got {start} .. {end})")]
    DegenerateWindow { start: String, end: String },

    #[error("no configuration registered under key '{0}'")]
    UnknownKey(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Umbrella error for callers that do not care which stage failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeteringError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}
