//! Transport primitives: framed serial reads, Modbus-RTU, Tek instrument
//! transports, and an HTTPS client with mutual TLS.

pub mod framed;
pub mod https;
pub mod modbus;
pub mod tek;

pub use framed::read_until;
pub use modbus::{ModbusClient, ModbusError};
