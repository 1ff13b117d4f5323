//! `benchrig-cli` – entry point of the bench-rig controller.
//!
//! Without arguments the binary:
//!
//! 1. Loads `~/.benchrig/config.toml` (defaults when absent) and applies the
//!    `BENCHRIG_*` environment overrides.
//! 2. Builds the hardware: a fully simulated rig, or an SCPI generator on a
//!    serial port next to simulated relays, potentiometer and probe.
//! 3. Connects the pulse generator. Failure here is fatal (exit code 1).
//! 4. Opens the event journal, starts the [`RigService`] on an in-process
//!    broker and exposes that broker to UI clients over the WebSocket bridge.
//! 5. On **Ctrl-C** cancels any sequence, switches every relay and the
//!    generator output off, publishes `offline` and exits.
//!
//! The offline sub-commands live in [`commands`].

mod commands;
mod config;

use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use benchrig_hal::serial::SerialConnector;
use benchrig_hal::sim::SimRig;
use benchrig_hal::HardwareFacade;
use benchrig_journal::SqliteJournal;
use benchrig_middleware::{LoopbackBroker, LoopbackTransport, MessageBus, WsBridge};
use benchrig_runtime::{RigService, init_tracing};

use crate::commands::Invocation;
use crate::config::{Config, GeneratorDriver};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = match Invocation::parse(&args) {
        Ok(invocation) => invocation,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let cfg = match config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {}", "Config error".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match invocation {
        Invocation::Run => run(cfg).await,
        Invocation::Init => init(),
        Invocation::Help => {
            commands::print_help();
            Ok(())
        }
        Invocation::Journal { kind, limit } => open_journal_file(&cfg).and_then(|journal| {
            for line in commands::journal_lines(&journal, kind, limit)? {
                println!("{line}");
            }
            Ok(())
        }),
        Invocation::Calibrate { name, code, notes } => {
            open_journal_file(&cfg).and_then(|journal| {
                let point = commands::calibrate(&journal, cfg.rails(), &name, code, &notes)?;
                println!(
                    "  {} {} code {} ≈ {:.3} V",
                    "✓".green().bold(),
                    point.name.bold(),
                    point.code,
                    point.voltage
                );
                Ok(())
            })
        }
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Service
// ─────────────────────────────────────────────────────────────────────────────

async fn run(cfg: Config) -> Result<(), String> {
    let _tracing = init_tracing("benchrig");
    print_banner();
    cfg.validate()?;

    println!(
        "  Config {} ({} generator)",
        config::config_path().display().to_string().bold(),
        cfg.generator.driver.to_string().cyan()
    );

    let hw = build_hardware(&cfg);
    match hw.connect_generator().await {
        Ok(id) => info!(generator = %id, "pulse generator ready"),
        Err(e) => {
            error!(error = %e, "pulse generator could not be opened");
            return Err(format!("generator init failed: {e}"));
        }
    }

    let journal = Arc::new(open_journal(&cfg)?);
    let broker = LoopbackBroker::new();
    let bus = MessageBus::new(
        Arc::new(LoopbackTransport::new(Arc::clone(&broker))),
        cfg.client_id.clone(),
        cfg.status_topic.clone(),
    );

    let service = RigService::start(cfg.service(), hw, bus, journal)
        .await
        .map_err(|e| format!("rig service failed to start: {e}"))?;

    let bridge_addr = cfg.bridge_socket()?;
    let bridge = tokio::spawn(async move {
        if let Err(e) = WsBridge::new(broker).run(bridge_addr).await {
            error!(error = %e, "websocket bridge stopped");
        }
    });
    println!(
        "  UI bridge on {}. Press {} to stop.\n",
        format!("ws://{bridge_addr}").bold(),
        "Ctrl-C".bold().yellow()
    );

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let handler_tx = stop_tx.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = handler_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; stop the process to exit");
    }
    if stop_rx.wait_for(|stop| *stop).await.is_err() {
        warn!("shutdown signal lost");
    }

    drop(stop_tx);

    println!();
    println!("{}", "⚠  Ctrl-C received – shutting the rig down …".yellow().bold());
    bridge.abort();
    let result = service.shutdown().await;
    match &result {
        Ok(()) => println!("{}", "  ✓ Relays and generator output off.".green()),
        Err(e) => warn!(error = %e, "offline presence not published"),
    }
    result.map_err(|e| e.to_string())
}

fn build_hardware(cfg: &Config) -> HardwareFacade {
    match cfg.generator.driver {
        GeneratorDriver::Sim => {
            let (hw, _sim) = SimRig::new().build();
            hw
        }
        GeneratorDriver::Serial => {
            let mut connector = SerialConnector::new(cfg.generator.baud_rate)
                .with_scan_ports(cfg.generator.scan_ports.clone());
            if let Some(port) = &cfg.generator.port {
                connector = connector.with_port(port.clone());
            }
            warn!("no relay, potentiometer or probe drivers configured; those stay simulated");
            let (hw, _sim) = SimRig::new().build_with_connector(Box::new(connector));
            hw
        }
    }
}

fn open_journal(cfg: &Config) -> Result<SqliteJournal, String> {
    let journal = match &cfg.journal_path {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("Failed to create journal directory: {e}"))?;
            }
            info!(path = %path.display(), "opening journal");
            SqliteJournal::open(path)
        }
        None => {
            warn!("no journal_path configured; events are kept in memory only");
            SqliteJournal::open_in_memory()
        }
    };
    journal.map_err(|e| format!("Failed to open journal: {e}"))
}

/// The on-disk journal, for the offline sub-commands.
fn open_journal_file(cfg: &Config) -> Result<SqliteJournal, String> {
    let Some(path) = &cfg.journal_path else {
        return Err("no journal_path configured (set it in the config or BENCHRIG_JOURNAL)".into());
    };
    SqliteJournal::open(path)
        .map_err(|e| format!("Failed to open journal at {}: {e}", path.display()))
}

/// Write the default config unless one exists already.
fn init() -> Result<(), String> {
    let path = config::config_path();
    if path.exists() {
        println!("  Config already present at {}", path.display().to_string().bold());
        return Ok(());
    }
    config::save(&Config::default())?;
    println!(
        "\n  {} Config saved to {}\n",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __                    __          _      "#.bold().cyan());
    println!("{}", r#"  / /  ___ ___  ____ __ / /  ____  (_)__ _ "#.bold().cyan());
    println!("{}", r#" / _ \/ -_) _ \/ __// _ \/ _ \/ __/ / / _ `/"#.bold().cyan());
    println!("{}", r#"/_.__/\__/_//_/\__//_//_/_//_/_/   /_/\_, / "#.bold().cyan());
    println!("{}", r#"                                     /___/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "benchrig".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Bench-rig relay, signal and sweep controller");
    println!();
}
