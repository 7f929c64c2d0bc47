//! proximity-lock CLI
//!
//! Usage:
//!   proximity-lock scan                      # List keys in range
//!   proximity-lock run                       # Track the last key, read commands from stdin
//!   proximity-lock run --device <id> --arm   # Track <id> and arm right away

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use proximity_lock_lib::commands::{self, Flow, HELP};
use proximity_lock_lib::config::store::CONFIG_FILE_NAME;
use proximity_lock_lib::core::bluetooth::{DEFAULT_SCAN_DURATION_SECS, Transport};
use proximity_lock_lib::core::{BluetoothManager, ControllerNotice, PeripheralId};
use proximity_lock_lib::logging::ConsoleLogger;
use proximity_lock_lib::state::AppState;

#[derive(Parser, Debug)]
#[command(
    name = "proximity-lock",
    version,
    about = "Locks this device when its Bluetooth key moves out of range"
)]
struct Args {
    /// Path of the JSON config file
    #[arg(long, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: log::Level,

    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// List peripherals that can serve as the key
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value_t = DEFAULT_SCAN_DURATION_SECS)]
        duration: u64,
    },
    /// Track the key and lock when it leaves
    Run {
        /// Peripheral id to track instead of the last one
        #[arg(short, long)]
        device: Option<String>,

        /// Arm the lock policy on start
        #[arg(long)]
        arm: bool,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if ConsoleLogger::init(args.log_level).is_err() {
        env_logger::builder()
            .filter_level(args.log_level.to_level_filter())
            .init();
    }

    let result = match args.mode {
        Some(Mode::Scan { duration }) => run_scan(duration).await,
        Some(Mode::Run { device, arm }) => run(&args.config, device, arm).await,
        None => run(&args.config, None, false).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_scan(duration: u64) -> Result<()> {
    let manager = BluetoothManager::new().await?;
    let keys = manager.available_keys(Duration::from_secs(duration)).await?;
    println!("{}", serde_json::to_string_pretty(&keys)?);
    Ok(())
}

async fn run(config: &Path, device: Option<String>, arm: bool) -> Result<()> {
    let app_state = AppState::new(config).await?;

    match device {
        Some(id) => app_state.link(PeripheralId::new(id), None).await?,
        None => app_state.resume().await?,
    }
    if arm {
        if let Err(e) = app_state.controller.arm().await {
            warn!("Armed, but the first lock attempt failed: {}", e);
        }
    }
    app_state.controller.set_foreground(true).await?;

    spawn_printers(&app_state);
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let command = match commands::parse(&line) {
                    Ok(command) => command,
                    Err(commands::ParseError::Empty) => continue,
                    Err(e) => {
                        println!("{}", e);
                        continue;
                    }
                };
                match commands::execute(command, &app_state).await {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => println!("error: {:#}", e),
                }
            }
        }
    }

    app_state.controller.shutdown().await;
    Ok(())
}

/// Prints key, status and notice changes as they happen.
fn spawn_printers(app_state: &AppState) {
    let mut key = app_state.controller.key();
    tokio::spawn(async move {
        while key.changed().await.is_ok() {
            let line = match key.borrow_and_update().as_ref() {
                Some(k) => format!(
                    "key {}: connected={} rssi={:?}",
                    k.name, k.connected, k.signal_strength
                ),
                None => "key: none".to_string(),
            };
            println!("{}", line);
        }
    });

    let mut status = app_state.controller.status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let s = *status.borrow_and_update();
            println!(
                "armed={} grace={} foreground={} polling={}",
                s.armed, s.in_grace_period, s.foreground, s.polling
            );
        }
    });

    let mut notices = app_state.controller.notices();
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(ControllerNotice::Locked { at }) => println!("locked at {}", at.format("%H:%M:%S")),
                Ok(ControllerNotice::LockNotAuthorized { reason }) => {
                    println!("could not lock: {}", reason)
                }
                Ok(ControllerNotice::KeyLost { address, reason }) => {
                    println!("key {} lost: {}", address, reason)
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
