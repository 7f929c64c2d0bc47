//! Console commands
//! This module defines the commands that can be typed on the console and
//! dispatches them to the controller and the settings store.

use std::time::Duration;

use anyhow::Result;
use thiserror::Error;

use crate::core::PeripheralId;
use crate::core::bluetooth::{DEFAULT_SCAN_DURATION_SECS, extract_mac_address};
use crate::state::AppState;

pub const HELP: &str = "\
commands:
  keys               list keys in range
  link <id>          track the key with this id
  unlink             stop tracking and disarm
  arm | disarm       turn the lock policy on or off
  wake               the owner is present, start a grace period
  fg on|off          keep polling while disarmed
  threshold <dBm>    weakest acceptable signal
  grace <s>          grace period length
  poll <s>           polling interval
  status             show key and controller state
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Keys,
    Link(String),
    Unlink,
    Arm,
    Disarm,
    Wake,
    Foreground(bool),
    Threshold(i16),
    Grace(u64),
    Poll(u64),
    Status,
    Help,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}', type 'help'")]
    Unknown(String),
    #[error("'{0}' needs an argument")]
    MissingArgument(&'static str),
    #[error("invalid argument for '{command}': {value}")]
    InvalidArgument { command: &'static str, value: String },
}

/// Whether the console should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

pub fn parse(line: &str) -> Result<ConsoleCommand, ParseError> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Err(ParseError::Empty);
    };
    let arg = words.next();

    let command = match word.to_ascii_lowercase().as_str() {
        "keys" | "scan" => ConsoleCommand::Keys,
        "link" => ConsoleCommand::Link(required("link", arg)?.to_string()),
        "unlink" => ConsoleCommand::Unlink,
        "arm" => ConsoleCommand::Arm,
        "disarm" => ConsoleCommand::Disarm,
        "wake" => ConsoleCommand::Wake,
        "fg" => match required("fg", arg)? {
            "on" => ConsoleCommand::Foreground(true),
            "off" => ConsoleCommand::Foreground(false),
            other => return Err(invalid("fg", other)),
        },
        "threshold" => ConsoleCommand::Threshold(number("threshold", arg)?),
        "grace" => ConsoleCommand::Grace(number("grace", arg)?),
        "poll" => ConsoleCommand::Poll(number("poll", arg)?),
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(command)
}

fn required<'a>(command: &'static str, arg: Option<&'a str>) -> Result<&'a str, ParseError> {
    arg.ok_or(ParseError::MissingArgument(command))
}

fn number<T: std::str::FromStr>(command: &'static str, arg: Option<&str>) -> Result<T, ParseError> {
    let arg = required(command, arg)?;
    arg.parse().map_err(|_| invalid(command, arg))
}

fn invalid(command: &'static str, value: &str) -> ParseError {
    ParseError::InvalidArgument {
        command,
        value: value.to_string(),
    }
}

/// Runs one command against the application state, printing its outcome.
pub async fn execute(command: ConsoleCommand, app_state: &AppState) -> Result<Flow> {
    let controller = &app_state.controller;
    let store = &app_state.settings_store;

    match command {
        ConsoleCommand::Keys => {
            let keys = app_state
                .transport
                .available_keys(Duration::from_secs(DEFAULT_SCAN_DURATION_SECS))
                .await?;
            if keys.is_empty() {
                println!("no keys in range");
            }
            for key in keys {
                println!(
                    "{:<40} {:<20} {:>5}  {}",
                    key.id,
                    key.address,
                    key.rssi.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
                    key.name.as_deref().unwrap_or("")
                );
            }
        }
        ConsoleCommand::Link(id) => app_state.link(PeripheralId::new(id), None).await?,
        ConsoleCommand::Unlink => app_state.unlink().await?,
        ConsoleCommand::Arm => controller.arm().await?,
        ConsoleCommand::Disarm => controller.disarm().await?,
        ConsoleCommand::Wake => controller.user_present().await?,
        ConsoleCommand::Foreground(foreground) => controller.set_foreground(foreground).await?,
        ConsoleCommand::Threshold(dbm) => {
            let settings = store.update_settings(|s| s.signal_threshold = dbm).await?;
            println!("threshold: {} dBm", settings.signal_threshold);
        }
        ConsoleCommand::Grace(secs) => {
            let settings = store.update_settings(|s| s.grace_period_secs = secs).await?;
            println!("grace period: {} s", settings.grace_period_secs);
        }
        ConsoleCommand::Poll(secs) => {
            let settings = store.update_settings(|s| s.polling_interval_secs = secs).await?;
            println!("polling interval: {} s", settings.polling_interval_secs);
        }
        ConsoleCommand::Status => {
            let status = *controller.status().borrow();
            println!("{}", serde_json::to_string_pretty(&status)?);
            match controller.key().borrow().as_ref() {
                Some(key) => println!(
                    "key: {} ({}) connected: {} rssi: {:?}",
                    key.name,
                    extract_mac_address(key.address.as_str()).unwrap_or_else(|| key.address.to_string()),
                    key.connected,
                    key.signal_strength
                ),
                None => println!("key: none"),
            }
            println!("lock authorized: {}", app_state.lock_gate.is_authorized().await);
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return Ok(Flow::Quit),
    }
    Ok(Flow::Continue)
}
