//! ESS campaign orchestrator entry point: loads the campaign config, starts
//! the tick scheduler and aggregator, opens every configured instrument
//! transport, and spawns one worker task per instrument plus the evaluator,
//! grounded on `ess.py`'s `main`/`ESS.__init__` startup sequence and on
//! `ferrex-server/src/main.rs`'s `Args`/`#[tokio::main]` shape.

mod evaluator;
mod workers;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ess_config::Config;
use ess_contracts::chamber_driver::{ChamberDriver, ChamberState};
use ess_core::chamber::{mb1::Mb1Driver, mb2::Mb2Driver, SegjumpBase};
use ess_core::power_control::SerialPowerControl;
use ess_core::processors;
use ess_core::scheduler::{PeriodicSource, PointEntry, PointSource, Scheduler, TickerSource};
use ess_core::sinks::FileSink;
use ess_core::transport::tek::connect_tcp;
use ess_core::transport::ModbusClient;
use ess_model::chamber::ChamberProgram;
use ess_model::tick::{Basetime, TickOffset};
use tokio::sync::Mutex;
use tokio_serial::SerialPortBuilderExt;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evaluator::{CriticalError, DbIsnTable, Evaluator, LiveIsnTable, RemovalChannels};
use workers::WorkerContext;

/// Modbus-RTU chamber link and the Arduino-based relay bank both run at
/// this rate; the PSU and BME instruments run faster, at `SERIAL_BAUD`.
const MODBUS_BAUD: u32 = 9600;
const SERIAL_BAUD: u32 = 115200;

#[derive(Parser, Debug)]
#[command(name = "ess-server")]
#[command(about = "Environmental stress screening campaign orchestrator")]
struct Args {
    /// Path to the campaign JSON config.
    #[arg(long, env = "ESS_CONFIG")]
    config: PathBuf,
}

/// Dispatches to whichever Binder MKFT115 wire dialect the campaign config
/// selects, so the rest of `main` only has to hold one concrete
/// `ChamberDriver` type.
enum AnyChamberDriver {
    Mb1(Mb1Driver<tokio_serial::SerialStream>),
    Mb2(Mb2Driver<tokio_serial::SerialStream>),
}

#[async_trait::async_trait]
impl ChamberDriver for AnyChamberDriver {
    async fn get_state(&mut self) -> ess_model::Result<ChamberState> {
        match self {
            AnyChamberDriver::Mb1(d) => d.get_state().await,
            AnyChamberDriver::Mb2(d) => d.get_state().await,
        }
    }

    async fn get_temp(&mut self) -> ess_model::Result<f64> {
        match self {
            AnyChamberDriver::Mb1(d) => d.get_temp().await,
            AnyChamberDriver::Mb2(d) => d.get_temp().await,
        }
    }

    async fn get_humid(&mut self) -> ess_model::Result<Option<f64>> {
        match self {
            AnyChamberDriver::Mb1(d) => d.get_humid().await,
            AnyChamberDriver::Mb2(d) => d.get_humid().await,
        }
    }

    async fn load_prog(&mut self, progno: u8, program: &ChamberProgram, segments: &[ess_model::chamber::DeviceSegment]) -> ess_model::Result<()> {
        match self {
            AnyChamberDriver::Mb1(d) => d.load_prog(progno, program, segments).await,
            AnyChamberDriver::Mb2(d) => d.load_prog(progno, program, segments).await,
        }
    }

    async fn start_prog(&mut self, progno: u8) -> ess_model::Result<()> {
        match self {
            AnyChamberDriver::Mb1(d) => d.start_prog(progno).await,
            AnyChamberDriver::Mb2(d) => d.start_prog(progno).await,
        }
    }

    async fn stop_prog(&mut self, manual: bool) -> ess_model::Result<()> {
        match self {
            AnyChamberDriver::Mb1(d) => d.stop_prog(manual).await,
            AnyChamberDriver::Mb2(d) => d.stop_prog(manual).await,
        }
    }

    async fn set_manual(&mut self, temperature: Option<f64>, humidity: Option<f64>) -> ess_model::Result<()> {
        match self {
            AnyChamberDriver::Mb1(d) => d.set_manual(temperature, humidity).await,
            AnyChamberDriver::Mb2(d) => d.set_manual(temperature, humidity).await,
        }
    }
}

async fn open_serial(path: &str, baud: u32) -> anyhow::Result<tokio_serial::SerialStream> {
    let stream = tokio_serial::new(path, baud).open_native_async()?;
    Ok(stream)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "ess_server=info,ess_core=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load(&args.config)?;
    info!(phase = ?config.phase, tester = %config.tester, "campaign configuration loaded");

    let datadir = chrono::Utc::now().format(&config.datadir).to_string();
    std::fs::create_dir_all(&datadir)?;

    let basetime = Basetime::now();
    let (scheduler, _scheduler_join) = Scheduler::spawn(basetime);

    let (response_tx, remove_tx, aggregator) = ess_core::aggregator::Aggregator::spawn(10);
    let ctx = WorkerContext::new(scheduler.tick_sender(), response_tx.clone());

    let (job_tx, job_rx) = tokio::sync::mpsc::channel(256);
    let _processor_handles = processors::spawn_pool(None, job_rx, response_tx.clone());

    let mut aggregator = aggregator;
    aggregator.register_chain("root", None, ess_core::aggregator::FilterChain::new(vec![]));
    for (label, spec) in &config.dataloggers.sinks {
        let columns: Vec<String> = spec
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        if columns.is_empty() {
            warn!(sink = %label, "datalogger sink has no columns configured, skipping");
            continue;
        }
        let path = format!("{datadir}/{label}.log");
        match FileSink::create(&path, columns).await {
            Ok(sink) => aggregator.register_handler("root", None, Box::new(sink)),
            Err(err) => error!(sink = %label, error = %err, "failed to open datalogger sink"),
        }
    }
    tokio::spawn(aggregator.run());

    let critical_error = CriticalError::default();
    let mut removal = RemovalChannels::new();
    removal = removal.with_subsystem(remove_tx);

    if let Some(path) = config.ports.get("bme") {
        match open_serial(path, SERIAL_BAUD).await {
            Ok(stream) => {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = workers::bme::run(ctx, stream).await {
                        error!(error = %err, "bme worker exited");
                    }
                });
            }
            Err(err) => warn!(port = %path, error = %err, "failed to open bme serial port"),
        }
    }

    if let Some(path) = config.ports.get("psu") {
        match open_serial(path, SERIAL_BAUD).await {
            Ok(stream) => match workers::power::PowerSupply::connect(stream).await {
                Ok(psu) => {
                    let psu = Arc::new(psu);
                    let ctx = ctx.clone();
                    tokio::spawn(async move {
                        if let Err(err) = workers::psu::run(ctx, psu).await {
                            error!(error = %err, "psu worker exited");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "failed to identify power supply"),
            },
            Err(err) => warn!(port = %path, error = %err, "failed to open psu serial port"),
        }
    }

    let http_client = reqwest::Client::new();
    for uubnum in config.uubnums.iter().filter_map(|u| *u) {
        let ctx = ctx.clone();
        let client = http_client.clone();
        tokio::spawn(async move {
            if let Err(err) = workers::uub::run(ctx, uubnum, client).await {
                error!(uubnum, error = %err, "uub worker exited");
            }
        });
    }

    if let Some(path) = config.ports.get("afg") {
        if let Some((host, port)) = path.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                match connect_tcp(host, port).await {
                    Ok(transport) => match workers::afg::Afg::connect(transport, workers::afg::AfgParams::default()).await {
                        Ok(mut afg) => {
                            let mut rx = ctx.subscribe();
                            tokio::spawn(async move {
                                loop {
                                    let event = match rx.recv().await {
                                        Ok(event) => event,
                                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                                    };
                                    if event.has_flag(ess_core::scheduler::STOP_FLAG) {
                                        return;
                                    }
                                    if event.has_flag("meas.pulse") {
                                        if let Err(err) = afg.trigger().await {
                                            error!(error = %err, "afg trigger failed");
                                        }
                                    }
                                }
                            });
                        }
                        Err(err) => warn!(error = %err, "failed to initialize afg"),
                    },
                    Err(err) => warn!(addr = %path, error = %err, "failed to connect to afg"),
                }
            }
        }
    }

    if let Some(path) = config.ports.get("mdo") {
        if let Some((host, port)) = path.rsplit_once(':') {
            if let Ok(port) = port.parse::<u16>() {
                match connect_tcp(host, port).await {
                    Ok(transport) => {
                        let ctx = ctx.clone();
                        let job_tx = job_tx.clone();
                        let uubnum = config.uubnums.iter().flatten().next().copied().unwrap_or(0);
                        let chans = config.chans.clone();
                        tokio::spawn(async move {
                            if let Err(err) = workers::mdo::run(ctx, transport, uubnum, chans, 2.5e9, job_tx).await {
                                error!(error = %err, "mdo worker exited");
                            }
                        });
                    }
                    Err(err) => warn!(addr = %path, error = %err, "failed to connect to mdo"),
                }
            }
        }
    }

    if let Some(path) = config.ports.get("chamber") {
        let segjump_base = if config.ports.contains_key("chamber_mb2") {
            SegjumpBase::CycleStartPlusOne
        } else {
            SegjumpBase::CycleStart
        };
        match open_serial(path, MODBUS_BAUD).await {
            Ok(stream) => {
                let client = ModbusClient::new(stream, 1, false);
                let driver = if config.ports.contains_key("chamber_mb2") {
                    AnyChamberDriver::Mb2(Mb2Driver::new(client))
                } else {
                    AnyChamberDriver::Mb1(Mb1Driver::new(client))
                };
                let worker = workers::chamber::ChamberWorker::new(driver, segjump_base, 1);
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(err) = worker.run(ctx).await {
                        error!(error = %err, "chamber worker exited");
                    }
                });
            }
            Err(err) => warn!(port = %path, error = %err, "failed to open chamber serial port"),
        }
    }

    let pc: Option<Arc<Mutex<SerialPowerControl<tokio_serial::SerialStream>>>> = match config.ports.get("powercontrol") {
        Some(path) => match open_serial(path, MODBUS_BAUD).await {
            Ok(stream) => match SerialPowerControl::new(stream, &config.uubnums) {
                Ok(driver) => Some(Arc::new(Mutex::new(driver))),
                Err(err) => {
                    warn!(error = %err, "failed to build power control driver");
                    None
                }
            },
            Err(err) => {
                warn!(port = %path, error = %err, "failed to open power control serial port");
                None
            }
        },
        None => None,
    };

    if let Some(pc) = pc {
        let db_isn: DbIsnTable = DbIsnTable::new();
        let live_isn: Arc<Mutex<LiveIsnTable>> = Arc::new(Mutex::new(LiveIsnTable::new()));
        let (transcript_tx, mut transcript_rx) = tokio::sync::mpsc::channel::<String>(64);
        tokio::spawn(async move {
            while let Some(line) = transcript_rx.recv().await {
                info!(%line, "evaluator transcript");
            }
        });

        let evaluator = Evaluator::new(config.uubnums.clone(), db_isn, live_isn, pc, critical_error.clone(), removal, transcript_tx);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = evaluator.run(ctx).await {
                error!(error = %err, "evaluator exited");
            }
        });
    } else {
        warn!("no power control port configured; UUB fleet supervision is disabled for this run");
    }

    scheduler
        .add_ticker(
            "meas.thp",
            TickerSource::Periodic(PeriodicSource::new(config.tickers.meas_thp as i64, None)),
            TickOffset(0),
        )
        .await;
    scheduler
        .add_ticker(
            "meas.sc",
            TickerSource::Periodic(PeriodicSource::new(config.tickers.meas_sc as i64, None)),
            TickOffset(0),
        )
        .await;

    if let Some(prog_path) = &config.tickers.essprogram {
        match std::fs::read_to_string(prog_path) {
            Ok(text) => match serde_json::from_str::<ChamberProgram>(&text) {
                Ok(program) => {
                    let start = TickOffset(config.tickers.startprog as i64);
                    let entries = vec![
                        PointEntry {
                            offset: start.0,
                            detail: serde_json::json!({ "binder.prog": program }),
                        },
                        PointEntry {
                            offset: start.0 + 1,
                            detail: serde_json::json!({ "binder.state": "start" }),
                        },
                    ];
                    scheduler
                        .add_ticker("essprogram", TickerSource::Point(PointSource::new(entries, None)), start)
                        .await;
                }
                Err(err) => error!(path = %prog_path, error = %err, "failed to parse ess program"),
            },
            Err(err) => error!(path = %prog_path, error = %err, "failed to read ess program file"),
        }
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, stopping campaign");
        }
        _ = critical_error.notified() => {
            error!("critical error triggered, stopping campaign");
        }
    }
    scheduler.stop().await;

    Ok(())
}
