//! Declarative climate-program types and their device-lowered form.
//!
//! `ChamberProgram` is what a campaign author writes; `DeviceSegment` is
//! what the compiler in `ess-core::chamber` produces and what the MB1/MB2
//! drivers transmit over the wire, each in its own encoding.

use serde::{Deserialize, Serialize};

/// One step of a declarative chamber program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberSegment {
    pub duration: u32,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub anticond: Option<bool>,
    pub meas: Option<u32>,
}

/// A `[start, end, repeat]` triple over segment *indices* implementing a
/// back-jump on the device. Cycles do not nest and are referenced by index
/// into `ChamberProgram::segments` rather than by value, since Rust owned
/// segments can't be compared by identity the way the Python reference
/// compares `seg is chamberprog.cycles[...][0]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Cycle {
    pub start_index: usize,
    pub repeat: u32,
    pub end_index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChamberProgram {
    pub title: String,
    pub temperature: f64,
    pub humidity: Option<f64>,
    pub anticond: bool,
    pub cycles: Vec<Cycle>,
    pub segments: Vec<ChamberSegment>,
}

/// Lowered device segment: the logical fields common to both MB1 and MB2.
/// Each driver encodes these into its own register layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSegment {
    pub temperature: f64,
    pub humidity: Option<f64>,
    pub duration: u32,
    pub anticond: bool,
    /// set when the program carries no humidity stream at all
    pub humidity_disabled: bool,
    pub numjump: u16,
    pub segjump: u16,
}

impl DeviceSegment {
    pub fn hold(temperature: f64, humidity: Option<f64>, anticond: bool, humidity_disabled: bool) -> Self {
        Self {
            temperature,
            humidity,
            duration: 1,
            anticond,
            humidity_disabled,
            numjump: 0,
            segjump: 0,
        }
    }
}
