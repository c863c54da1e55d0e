// Multi-device capture example
//
// Several analyzers are combined into one: logical channels are numbered
// device after device, so with two 24 channel units channel 24 is the first
// channel of the second one.

use clap::Parser;
use logic_analyzer_rs::{AnalyzerDriver, CaptureSession, ConnectionParams, Driver, EdgeTrigger};

#[derive(Parser)]
#[command(name = "multi_capture")]
#[command(version = "1.0")]
#[command(about = "Capture across several logic analyzers at once")]
struct Args {
    /// Connection strings, the first one gets channels 0..24
    #[arg(required = true, num_args = 2..)]
    devices: Vec<String>,

    /// Logical channels to capture
    #[arg(short, long, value_delimiter = ',', default_values_t = vec![0u8, 24])]
    channels: Vec<u8>,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = 1_000_000)]
    frequency: u32,

    #[arg(short, long, default_value_t = 0, help = "Logical channel whose rising edge starts the capture")]
    trigger: u8,

    /// Enable verbose logging
    #[arg(short, long)]
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

    let params = args
        .devices
        .iter()
        .map(|device| device.parse::<ConnectionParams>())
        .collect::<Result<Vec<_>, _>>()?;
    let mut driver = Driver::multi(params);

    let info = driver.connect().await?;
    println!("✓ Connected: {} ({} channels)", info.name, info.channels);
    if let Driver::Multi(multi) = &driver {
        for (device, range) in multi.devices().iter().zip(multi.channel_ranges()) {
            println!("  {} -> channels {}..{}", device.name(), range.first, range.first + range.count);
        }
    }

    let session = CaptureSession::new(args.frequency, 100, 900)
        .with_channels(&args.channels)
        .with_trigger(EdgeTrigger::on(args.trigger).rising_edge());
    let outcome = driver.start_capture(session)?.wait().await?;

    for channel in &outcome.session.capture_channels {
        let high = channel.samples.iter().filter(|&&s| s == 1).count();
        println!("ch{:>2}: {} samples, {} high", channel.channel_number, channel.samples.len(), high);
    }
    if let Some(error) = outcome.error {
        eprintln!("Capture failed: {}", error);
    }

    driver.disconnect().await?;
    Ok(())
}
