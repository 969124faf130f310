pub mod event;
pub(crate) mod ids;
pub mod reading;
pub mod record;

pub use event::EventPayload;
pub use ids::{Subject, Unit};
pub use reading::{ComputedValue, MeterReading};
pub use record::{MeterRecord, MeterRecordBuilder, Observation};
