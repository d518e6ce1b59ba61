//! Chamber worker: owns a `ChamberDriver` and reacts to `meas.thp` (readback
//! into the response queue), `meas.point` (program-position markers),
//! `binder.prog` (compile + upload a new program) and `binder.state`
//! (start/stop) flags, grounded on `Binder_MKFT115.run` in
//! `original_source/binder.py`.

use ess_contracts::chamber_driver::ChamberDriver;
use ess_core::chamber::{compile, SegjumpBase};
use ess_core::scheduler::STOP_FLAG;
use ess_model::chamber::ChamberProgram;
use ess_model::error::Result;
use ess_model::record::PartialRecord;
use tracing::{error, warn};

use super::WorkerContext;

pub struct ChamberWorker<D> {
    driver: D,
    segjump_base: SegjumpBase,
    progno: u8,
}

impl<D: ChamberDriver> ChamberWorker<D> {
    pub fn new(driver: D, segjump_base: SegjumpBase, progno: u8) -> Self {
        Self {
            driver,
            segjump_base,
            progno,
        }
    }

    pub async fn run(mut self, ctx: WorkerContext) -> Result<()> {
        let mut rx = ctx.subscribe();
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "chamber worker lagged behind tick broadcast");
                    continue;
                }
            };

            if event.has_flag(STOP_FLAG) {
                return Ok(());
            }

            if event.has_flag("meas.thp") {
                let temp = self.driver.get_temp().await;
                let humid = self.driver.get_humid().await;
                match (temp, humid) {
                    (Ok(temp), Ok(humid)) => {
                        let mut record = PartialRecord::with_timestamp(event.timestamp);
                        record.insert("chamber_temp", temp);
                        if let Some(humid) = humid {
                            record.insert("chamber_humid", humid);
                        }
                        if ctx.response_tx.send(record).await.is_err() {
                            return Ok(());
                        }
                    }
                    (temp, humid) => {
                        if let Err(err) = temp {
                            error!(error = %err, "chamber temperature readback failed");
                        }
                        if let Err(err) = humid {
                            error!(error = %err, "chamber humidity readback failed");
                        }
                    }
                }
            }

            if let Some(program) = event.flags.get("binder.prog").and_then(|v| serde_json::from_value::<ChamberProgram>(v.clone()).ok()) {
                if let Err(err) = self.upload_program(&program).await {
                    error!(error = %err, "chamber program upload failed");
                }
            }

            if let Some(state) = event.flags.get("binder.state").and_then(|v| v.as_str()) {
                let result = match state {
                    "start" => self.driver.start_prog(self.progno).await,
                    "stop" => self.driver.stop_prog(false).await,
                    other => {
                        warn!(state = other, "unrecognized binder.state value");
                        continue;
                    }
                };
                if let Err(err) = result {
                    error!(error = %err, "chamber state transition failed");
                }
            }
        }
    }

    async fn upload_program(&mut self, program: &ChamberProgram) -> Result<()> {
        let segments = compile(program, self.segjump_base)?;
        self.driver.load_prog(self.progno, program, &segments).await
    }
}
