//! Shared data model for the ESS campaign orchestrator.
//!
//! Types here are intentionally dumb: no I/O, no async, just the owned
//! representations that flow between the scheduler, the instrument workers,
//! the aggregator and the chamber compiler.

pub mod chamber;
pub mod error;
pub mod label;
pub mod record;
pub mod tick;

pub use error::{EssError, Result};
pub use record::FieldValue;
pub use tick::{Basetime, TickDetail, TickEvent, TickOffset};
