// src/main.rs
//
// pttlink CLI: validate and inspect driver documents, or run a live session
// against a device and print the events it produces.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use pttlink::events::{DeviceEvent, EventBroadcaster};
use pttlink::model::{ConnectionType, Device, DeviceType, PttDriver};
use pttlink::pipeline::{self, PipelineConfig};
use pttlink::{logging, tlog};

#[derive(Parser)]
#[command(name = "pttlink", version, about = "Push-to-talk device driver toolkit")]
struct Cli {
    /// Also write logs to a timestamped file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a driver document, printing every violation
    Validate {
        /// Path to the driver JSON document
        driver: PathBuf,
    },
    /// Parse a driver document and print its normalized form
    Show {
        driver: PathBuf,
    },
    /// Run a session against a device and print its events
    Run {
        /// Path to the driver JSON document
        #[arg(long)]
        driver: PathBuf,
        /// Device address: BLE MAC or peripheral id, serial device node
        /// (/dev/rfcomm0), or a local id for filestream drivers
        #[arg(long)]
        device: String,
        /// Display name for the device
        #[arg(long, default_value = "")]
        name: String,
        /// Override the driver's key-down delay (milliseconds)
        #[arg(long)]
        delay: Option<u64>,
        /// Do not reconnect automatically on errors
        #[arg(long)]
        no_reconnect: bool,
    },
}

fn load_driver(path: &PathBuf) -> Result<PttDriver, String> {
    PttDriver::from_file(path)
}

fn validate(path: &PathBuf) -> ExitCode {
    let driver = match load_driver(path) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let report = driver.validate();
    if report.is_empty() {
        println!(
            "{}: OK ({})",
            driver.driver_name.as_deref().unwrap_or("unnamed"),
            driver
                .connection_type
                .map(|ct| ct.human_readable())
                .unwrap_or("unknown type")
        );
        ExitCode::SUCCESS
    } else {
        print!("{}", report);
        ExitCode::FAILURE
    }
}

fn show(path: &PathBuf) -> ExitCode {
    match load_driver(path).and_then(|driver| {
        serde_json::to_string_pretty(&driver).map_err(|e| format!("Failed to render driver: {}", e))
    }) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(
    driver_path: &PathBuf,
    address: &str,
    name: &str,
    delay: Option<u64>,
    no_reconnect: bool,
) -> ExitCode {
    let driver = match load_driver(driver_path) {
        Ok(driver) => driver,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let report = driver.validate();
    if !report.is_empty() {
        eprintln!("Driver failed validation:");
        eprint!("{}", report);
        return ExitCode::FAILURE;
    }

    let device_type = match driver.connection_type {
        Some(ConnectionType::Filestream) => DeviceType::Local,
        _ => DeviceType::Bluetooth,
    };
    let mut device = Device::new(device_type, name, address);
    device.auto_reconnect = !no_reconnect;

    let events = EventBroadcaster::new(64);
    let mut rx = events.subscribe();
    let handle = pipeline::spawn_with_defaults(
        PipelineConfig {
            driver,
            device,
            ptt_down_delay_override: delay,
        },
        events,
    );
    handle.connect();

    // Print the event stream until the process is killed
    loop {
        match rx.recv().await {
            Ok(DeviceEvent::Status { message }) => println!("status: {}", message),
            Ok(DeviceEvent::Connected { name, address }) => {
                println!("connected: {} ({})", name, address)
            }
            Ok(DeviceEvent::Disconnected { name, address }) => {
                println!("disconnected: {} ({})", name, address)
            }
            Ok(DeviceEvent::Ready { name, .. }) => println!("ready: {}", name),
            Ok(DeviceEvent::Battery { level, .. }) => println!("battery: {}%", level),
            Ok(DeviceEvent::Intent { action, key }) => match key {
                Some(key) => println!(
                    "event: {} (key {} {:?})",
                    action, key.name, key.action
                ),
                None => println!("event: {}", action),
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tlog!("[cli] event stream lagged, skipped {}", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return ExitCode::SUCCESS,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(dir) = &cli.log_dir {
        if let Err(e) = logging::init_file_logging(dir) {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    }
    match &cli.command {
        Command::Validate { driver } => validate(driver),
        Command::Show { driver } => show(driver),
        Command::Run {
            driver,
            device,
            name,
            delay,
            no_reconnect,
        } => run(driver, device, name, *delay, *no_reconnect).await,
    }
}
