// Single device capture example
//
// This example connects to one analyzer, runs a capture with an edge trigger
// and prints the recorded samples as a table.

use clap::Parser;
use logic_analyzer_rs::transport::available_devices;
use logic_analyzer_rs::{
    AnalyzerDriver, CaptureSession, ConnectionParams, EdgeTrigger, ProtocolKind, SingleDriver,
};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "capture")]
#[command(version = "1.0")]
#[command(about = "Capture digital signals from a logic analyzer")]
#[command(long_about = "Connect to a logic analyzer over serial or TCP, capture the selected channels and print the samples. Without a device argument the first analyzer found on USB is used.")]
struct Args {
    /// Connection string, e.g. /dev/ttyACM0, COM3@921600 or tcp://192.168.4.1:4045
    device: Option<String>,

    /// Channels to capture
    #[arg(short, long, value_delimiter = ',', default_values_t = vec![0u8, 1])]
    channels: Vec<u8>,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    frequency: u32,

    #[arg(long, default_value_t = 100, help = "Samples kept before the trigger")]
    pre: u32,

    #[arg(long, default_value_t = 900, help = "Samples recorded after the trigger")]
    post: u32,

    #[arg(short, long, default_value_t = 0, help = "Channel whose rising edge starts the capture")]
    trigger: u8,

    #[arg(long, value_parser = ["binary", "text"], help = "Device protocol, overrides a ?text suffix")]
    protocol: Option<String>,

    /// Give up waiting for the trigger after this many seconds
    #[arg(long, default_value_t = 10)]
    wait: u64,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let connection = match &args.device {
        Some(device) => device.clone(),
        None => {
            let devices = available_devices()?;
            let Some(first) = devices.first() else {
                eprintln!("No analyzer found on USB. Pass a connection string.");
                std::process::exit(1);
            };
            println!("Found {} at {}", first.name, first.port);
            first.port.clone()
        }
    };
    let mut params: ConnectionParams = connection.parse::<ConnectionParams>()?.with_retries(2);
    if let Some(protocol) = &args.protocol {
        params = params.with_protocol(protocol.parse::<ProtocolKind>()?);
    }

    let mut driver = SingleDriver::new(params);
    let info = driver.connect().await?;
    println!("✓ Connected to {} ({} channels, up to {} Hz)", info.name, info.channels, info.max_frequency);
    if let Some(voltage) = driver.status().await?.voltage {
        println!("Supply: {}", voltage);
    }

    let session = CaptureSession::new(args.frequency, args.pre, args.post)
        .with_channels(&args.channels)
        .with_trigger(EdgeTrigger::on(args.trigger).rising_edge());

    println!("Waiting for trigger on channel {}...", args.trigger);
    let mut handle = driver.start_capture(session)?;
    let outcome = match handle.wait_timeout(Duration::from_secs(args.wait)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            println!("No trigger, stopping");
            driver.stop_capture()?;
            handle.wait().await?
        }
    };

    if outcome.success {
        println!("{}", outcome.session.to_dataframe()?);
    } else if let Some(error) = &outcome.error {
        eprintln!("Capture failed ({:?}): {}", outcome.code(), error);
    }

    driver.disconnect().await?;
    Ok(())
}
