//! Reference collaborators for the Strata engine.
//!
//! Deterministic price feeds, a simulated yield venue, custody stand-ins and a
//! JSON file snapshot sink. The keeper wires these together; tests use them to
//! drive the engine without external services.

#![deny(unsafe_code)]

pub mod custody;
pub mod error;
pub mod prices;
pub mod sink;
pub mod venue;

pub use custody::{FailingCustody, RecordingCustody, TransferRecord};
pub use error::AdapterError;
pub use prices::{FeedEntry, FeedFilePriceSource, StaticPriceSource};
pub use sink::JsonFileSnapshotSink;
pub use venue::SimulatedVenue;
