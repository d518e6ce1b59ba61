//! Real-time orchestration fabric: transports, scheduler, aggregator, data
//! processors and the climate-program compiler.

pub mod aggregator;
pub mod chamber;
pub mod power_control;
pub mod processors;
pub mod scheduler;
pub mod sinks;
pub mod transport;
