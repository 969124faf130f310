//! Usage metering core.
//!
//! Two pure stages turn business events into billable readings:
//!
//! - [`meter`]: one [`EventPayload`] plus a [`MeteringConfig`] becomes at most
//!   one [`MeterRecord`] bundling every matched [`Observation`].
//! - [`aggregate`]: the records of one subject over a window (plus, for gauges,
//!   the last record before it) become one [`MeterReading`].
//!
//! All quantities are [`Decimal`]s and all identities are content-derived, so
//! replaying an event or recomputing a window is an idempotent upsert.

pub mod aggregate;
pub mod config;
pub mod decimal;
pub mod domain;
pub mod error;
pub mod identity;
pub mod meter;
pub mod temporal;

pub use aggregate::{aggregate, aggregate_at};
pub use config::{
    AggregateConfig, Aggregation, CounterAggregation, GaugeAggregation, MeteringConfig,
    ObservationExtraction, PropertyFilter,
};
pub use decimal::Decimal;
pub use domain::{
    ComputedValue, EventPayload, MeterReading, MeterRecord, Observation, Subject, Unit,
};
pub use error::{
    AggregationError, ConfigurationError, ExtractionError, MeteringError, Result, ValidationError,
};
pub use meter::{meter, meter_at};
pub use temporal::{TimeWindow, Timestamp};
