//! Trait surfaces that describe interactions with ESS campaign components.

pub mod chamber_driver;
pub mod filter;
pub mod power_control;
pub mod sink;
pub mod ticker;
pub mod transport;

pub mod prelude {
    pub use super::chamber_driver::ChamberDriver;
    pub use super::filter::Filter;
    pub use super::power_control::PowerControlDriver;
    pub use super::sink::Sink;
    pub use super::ticker::Ticker;
    pub use super::transport::FramedRead;
}
