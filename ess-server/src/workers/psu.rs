//! Voltage-ramp scheduling and the power-supply worker loop, grounded on
//! `PowerSupply.run`/`_voltRamp_validate`/`voltageRamp` in
//! `original_source/power.py`.

use std::sync::Arc;

use ess_core::scheduler::STOP_FLAG;
use ess_model::error::{EssError, Result};
use ess_model::record::PartialRecord;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Duration;
use tracing::{error, warn};

use super::power::{ChannelConfig, PowerSupply};
use super::WorkerContext;

const EPS: f64 = 1e-3;

/// Caller-supplied ramp request, as carried in a tick's `power.volt_ramp`
/// flag payload.
#[derive(Debug, Clone, Copy)]
pub struct VoltRampRequest {
    pub volt_start: f64,
    pub volt_end: f64,
    pub volt_step: f64,
    pub time_step_secs: f64,
}

/// A validated, ready-to-run ramp: `_voltRamp_validate` adjusts the sign of
/// `volt_step` and computes `nstep` from the requested span.
#[derive(Debug, Clone, Copy)]
pub struct VoltRampPlan {
    pub volt_start: f64,
    pub volt_step: f64,
    pub nstep: u32,
    pub tdelta: Duration,
}

pub fn validate_ramp(req: VoltRampRequest) -> Result<VoltRampPlan> {
    if req.volt_step == 0.0 {
        return Err(EssError::Invariant("voltage ramp step must be non-zero".to_string()));
    }
    let vstep_abs = req.volt_step.abs();
    let nstep = ((req.volt_end - req.volt_start).abs() + EPS) / vstep_abs;
    let nstep = nstep.floor() as u32;
    let signed_step = if req.volt_end < req.volt_start { -vstep_abs } else { vstep_abs };
    Ok(VoltRampPlan {
        volt_start: req.volt_start,
        volt_step: signed_step,
        nstep,
        tdelta: Duration::from_secs_f64(req.time_step_secs),
    })
}

/// Drives `setVoltage` once at `t0` and once per step thereafter, sleeping
/// `tdelta` between steps — the async equivalent of `voltageRamp`'s
/// blocking loop.
pub async fn run_ramp<S>(psu: Arc<PowerSupply<S>>, ch: u8, plan: VoltRampPlan) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut volt = plan.volt_start;
    psu.set_voltage(ch, volt).await?;
    for _ in 0..plan.nstep {
        tokio::time::sleep(plan.tdelta).await;
        volt += plan.volt_step;
        psu.set_voltage(ch, volt).await?;
    }
    Ok(())
}

/// Per-tick worker loop: applies `power` config deltas, answers
/// `meas.sc` readback requests, and spawns voltage ramps as background
/// tasks, matching `PowerSupply.run`.
pub async fn run<S>(ctx: WorkerContext, psu: Arc<PowerSupply<S>>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut rx = ctx.subscribe();
    let mut ramps: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "psu worker lagged behind tick broadcast");
                continue;
            }
        };

        ramps.retain(|handle| !handle.is_finished());

        if event.has_flag(STOP_FLAG) {
            break;
        }

        if let Some(serde_json::Value::Object(power_cfg)) = event.flags.get("power") {
            if let Some(ch) = psu.uubch {
                let cfg = ChannelConfig {
                    voltage: power_cfg.get("voltage").and_then(|v| v.as_f64()),
                    curr_lim: power_cfg.get("currLim").and_then(|v| v.as_f64()),
                    on: power_cfg.get("on").and_then(|v| v.as_bool()).unwrap_or(false),
                    off: power_cfg.get("off").and_then(|v| v.as_bool()).unwrap_or(false),
                };
                let mut by_channel = std::collections::HashMap::new();
                by_channel.insert(ch, cfg);
                if let Err(err) = psu.config(by_channel).await {
                    error!(error = %err, "power config update failed");
                }
            }
        }

        if event.has_flag("meas.sc") {
            if let Some(ch) = psu.uubch {
                match psu.read_volt_curr(ch).await {
                    Ok((voltage, current)) => {
                        let mut record = PartialRecord::with_timestamp(event.timestamp);
                        record.insert("ps_u", voltage);
                        record.insert("ps_i", current);
                        if ctx.response_tx.send(record).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => error!(error = %err, "psu readback failed"),
                }
            }
        }

        if let Some(serde_json::Value::Object(power_cfg)) = event.flags.get("power") {
            if let Some(ramp_cfg) = power_cfg.get("volt_ramp") {
                if let (Some(ch), Ok(req)) = (psu.uubch, parse_ramp_request(ramp_cfg)) {
                    match validate_ramp(req) {
                        Ok(plan) => {
                            let psu = Arc::clone(&psu);
                            ramps.push(tokio::spawn(async move {
                                if let Err(err) = run_ramp(psu, ch, plan).await {
                                    error!(error = %err, "voltage ramp failed");
                                }
                            }));
                        }
                        Err(err) => error!(error = %err, "voltage ramp rejected"),
                    }
                }
            }
        }
    }
    for handle in ramps {
        let _ = handle.await;
    }
    Ok(())
}

fn parse_ramp_request(value: &serde_json::Value) -> Result<VoltRampRequest> {
    let get = |key: &str| -> Result<f64> {
        value
            .get(key)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| EssError::Configuration(format!("volt_ramp missing numeric field {key}")))
    };
    Ok(VoltRampRequest {
        volt_start: get("volt_start")?,
        volt_end: get("volt_end")?,
        volt_step: get("volt_step")?,
        time_step_secs: get("time_step")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::power::PowerSupply;
    use tokio::io::duplex;

    /// Scenario 6: start 10.5V, end 12.0V, step 0.5V, dt 0.25s → exactly 3
    /// `setVoltage` calls at 11.0, 11.5, 12.0V plus the initial 10.5V at t0.
    #[tokio::test(start_paused = true)]
    async fn voltage_ramp_emits_expected_setvoltage_sequence() {
        let (mut probe_side, psu_side) = duplex(4096);
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            tokio::io::AsyncReadExt::read(&mut probe_side, &mut buf).await.unwrap();
            tokio::io::AsyncWriteExt::write_all(&mut probe_side, b"HMP4040\n").await.unwrap();
            let mut log = Vec::new();
            loop {
                let mut chunk = [0u8; 256];
                match tokio::io::AsyncReadExt::read(&mut probe_side, &mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => log.extend_from_slice(&chunk[..n]),
                }
            }
            log
        });

        let psu = Arc::new(PowerSupply::connect(psu_side).await.unwrap());
        let plan = validate_ramp(VoltRampRequest {
            volt_start: 10.5,
            volt_end: 12.0,
            volt_step: 0.5,
            time_step_secs: 0.25,
        })
        .unwrap();
        assert_eq!(plan.nstep, 3);

        run_ramp(Arc::clone(&psu), 1, plan).await.unwrap();
        drop(psu);

        let log = tokio::time::timeout(Duration::from_secs(1), responder).await.unwrap().unwrap();
        let text = String::from_utf8_lossy(&log);
        let volt_cmds: Vec<&str> = text.lines().filter(|l| l.starts_with("VOLT")).collect();
        assert_eq!(volt_cmds, vec!["VOLT 10.5", "VOLT 11", "VOLT 11.5", "VOLT 12"]);
    }

    #[test]
    fn validate_ramp_rejects_zero_step() {
        let err = validate_ramp(VoltRampRequest {
            volt_start: 1.0,
            volt_end: 2.0,
            volt_step: 0.0,
            time_step_secs: 1.0,
        })
        .unwrap_err();
        assert!(matches!(err, EssError::Invariant(_)));
    }
}
