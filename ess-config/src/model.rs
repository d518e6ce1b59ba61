use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigLoadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Pretest,
    Ess,
    Combo,
    Burnin,
    Final,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerDev {
    PowerCpx,
    PowerHmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    RPi,
    TrigDelay,
    AFG,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitterConfig {
    pub calibration: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlirConfig {
    pub imtype: Option<String>,
    #[serde(default)]
    pub uubnum: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickersConfig {
    #[serde(rename = "meas.thp", default = "default_period")]
    pub meas_thp: u32,
    #[serde(rename = "meas.sc", default = "default_period")]
    pub meas_sc: u32,
    pub essprogram: Option<String>,
    #[serde(rename = "essprogram.macros", default)]
    pub essprogram_macros: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub startprog: u32,
}

fn default_period() -> u32 {
    30
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataloggersConfig {
    #[serde(flatten)]
    pub sinks: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowerControlLimits {
    pub current_max_ma: f64,
    pub voltage_min: f64,
    pub voltage_max: f64,
}

/// Typed shape of the campaign JSON config. Field names track spec section
/// 6 verbatim; loading/validating untrusted JSON beyond basic parse and the
/// guard-rails in [`Config::validate`] is left to the caller's own UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub phase: Phase,
    pub tester: String,
    pub uubnums: Vec<Option<u32>>,
    #[serde(default = "default_chans")]
    pub chans: Vec<u32>,
    pub datadir: String,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub logging: serde_json::Value,
    #[serde(default)]
    pub afg: serde_json::Value,
    pub splitmode: Option<u8>,
    pub splitter: SplitterConfig,
    #[serde(default)]
    pub n_dp: Option<usize>,
    #[serde(default)]
    pub devlist: Vec<String>,
    pub powerdev: PowerDev,
    #[serde(default)]
    pub ports: HashMap<String, String>,
    pub pc_limits: PowerControlLimits,
    #[serde(default = "default_pc_rz_tout")]
    pub pc_rz_tout: f64,
    pub tickers: TickersConfig,
    pub dataloggers: DataloggersConfig,
    pub dbinfo: serde_json::Value,
    #[serde(default)]
    pub download_fn: Option<String>,
    #[serde(default)]
    pub flir: Option<FlirConfig>,
    #[serde(default)]
    pub evtdisp: bool,
    pub trigger: Trigger,
}

fn default_chans() -> Vec<u32> {
    (1..=10).collect()
}

fn default_pc_rz_tout() -> f64 {
    2.0
}

impl Config {
    /// Guard-rail validation beyond what serde's schema already enforces:
    /// the things that would otherwise surface as a confusing panic deep
    /// inside the scheduler or a worker.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.uubnums.is_empty() {
            return Err(ConfigLoadError::Invalid("uubnums must not be empty".into()));
        }
        if self.uubnums.len() > 10 {
            return Err(ConfigLoadError::Invalid(
                "at most ten UUBs are supported per campaign".into(),
            ));
        }
        if self.chans.is_empty() {
            return Err(ConfigLoadError::Invalid("chans must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "phase": "pretest",
            "tester": "jdoe",
            "uubnums": [12, null, 34],
            "datadir": "data-%Y%m%d/",
            "splitmode": 0,
            "splitter": {"calibration": null},
            "powerdev": "power_hmp",
            "pc_limits": {"current_max_ma": 500.0, "voltage_min": 0.0, "voltage_max": 13.0},
            "tickers": {"meas.thp": 30, "meas.sc": 30, "essprogram": "prog.json", "startprog": 60},
            "dataloggers": {},
            "dbinfo": {},
            "trigger": "RPi"
        }"#
    }

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::from_reader(minimal_json().as_bytes()).unwrap();
        assert_eq!(cfg.phase, Phase::Pretest);
        assert_eq!(cfg.uubnums, vec![Some(12), None, Some(34)]);
        assert_eq!(cfg.tickers.meas_thp, 30);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_empty_uubnums() {
        let mut cfg = Config::from_reader(minimal_json().as_bytes()).unwrap();
        cfg.uubnums.clear();
        assert!(cfg.validate().is_err());
    }
}
