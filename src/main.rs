//! EMS RS485 bridge
//!
//! A daemon that connects an EMS (Energy Management System) on an RS485 bus
//! with an MQTT broker:
//! - Polls the telemetry registers every cycle and one of five diagnostic
//!   register blocks in rotation.
//! - Publishes every decoded register to `solar/ems/<id>/<name>`.
//! - Accepts `EMS_EM/turn`, `EMS_Bypass/turn` and `EMS_Power_Limit/set`
//!   commands and writes them to the device.
//!
//! The bus engine lives in the `ems_rs485_lib` crate; this binary provides
//! the serial port, the MQTT client, configuration and logging.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ems_rs485_lib::{
    command::PendingCommands,
    publisher::Publisher,
    scheduler::Scheduler,
    shutdown::Shutdown,
    transport::{serial_port_builder, SerialTransport, Session},
};
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::sync::{mpsc, Arc};
use std::{panic, thread};

mod commandline;
mod mqtt;

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown_file>", 0, 0));

        let cause = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            *s
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.as_str()
        } else {
            "<unknown_panic_cause>"
        };

        error!(
            target: "panic",
            "Thread '{}' panicked at {}:{}:{}: {}",
            thread::current().name().unwrap_or("<unnamed>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = commandline::CliArgs::parse();

    // 1. Initialize logging as early as possible
    let log_handle = logging_init(args.verbose.log_level_filter());
    info!(
        "EMS bridge started. Log level: {}",
        args.verbose.log_level_filter()
    );

    // 2. Configuration and cancellation
    let config = mqtt::MqttConfig::load(&args.config_file)?;
    trace!("Config: {config:?}");

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        ctrlc::set_handler(move || {
            trace!("Received Ctrl-C");
            shutdown.trigger();
        })
        .context("Error setting Ctrl-C handler")?;
    }

    // 3. Open both ends
    info!(
        "Opening serial port {} (Address: {}, Baud: {})...",
        args.device, args.address, args.baud_rate
    );
    let builder = serial_port_builder(&args.device, args.baud_rate, args.timeout);
    let transport = SerialTransport::open(&builder)
        .with_context(|| format!("Cannot open serial port {}", args.device))?;

    let bridge = mqtt::Bridge::connect(&config)?;
    bridge.go_online()?;

    // 4. Start the workers
    let pending = Arc::new(PendingCommands::new());
    let (facts_tx, facts_rx) = mpsc::channel();

    let scheduler = Scheduler::new(
        Session::new(transport, shutdown.clone()),
        args.address,
        pending.clone(),
        facts_tx,
        shutdown.clone(),
    )
    .with_poll_interval(args.poll_interval);
    let scheduler_thread = thread::Builder::new()
        .name("scheduler".into())
        .spawn(move || scheduler.run())
        .context("Cannot spawn scheduler thread")?;

    let publisher = Publisher::new(bridge.sink(), config.ems_id.clone(), shutdown.clone())
        .with_pacing(args.pacing);
    let publisher_thread = thread::Builder::new()
        .name("publisher".into())
        .spawn(move || publisher.run(facts_rx))
        .context("Cannot spawn publisher thread")?;

    // 5. The MQTT event pump runs on the main thread
    let pump_result = bridge.run_event_pump(&pending, &shutdown);
    shutdown.trigger();

    let bus_result = scheduler_thread
        .join()
        .map_err(|_| anyhow!("Scheduler thread panicked"))?
        .map(drop)
        .context("EMS bus failure");
    if publisher_thread.join().is_err() {
        warn!("Publisher thread panicked");
    }

    info!("Stopping...");
    if let Err(error) = bridge.disconnect() {
        warn!("{error:#}");
    }

    if let Err(error) = bus_result.and(pump_result) {
        error!("Fatal: {error:#}");
        drop(log_handle);
        std::process::exit(1);
    }
    Ok(())
}
