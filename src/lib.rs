//! # Logic Analyzer RS
//!
//! A Rust library for driving logic analyzer capture hardware over serial and network links.
//!
//! This library talks to one or more analyzers, negotiates their capabilities, configures and
//! triggers captures and hands back the recorded samples as per-channel buffers.
//!
//! ## Features
//!
//! - **Bit-exact wire protocol**: Framed, byte-stuffed packets and fixed-layout request structs
//! - **Command channel**: One command in flight per connection, late answers never misapplied
//! - **Serial and network transports**: `tokio-serial` and TCP, chosen from a connection string
//! - **Multi-device captures**: Channels spread over several analyzers and merged back in order
//! - **Trigger configuration**: Edge and pattern triggers with builder patterns
//! - **DataFrame output**: Uses `polars` for the finished capture
//!
//! ## Examples
//!
//! ### Single Device Capture
//!
//! ```rust,no_run
//! use logic_analyzer_rs::{AnalyzerDriver, CaptureSession, Driver, EdgeTrigger};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut driver: Driver = "/dev/ttyACM0".parse()?;
//! let info = driver.connect().await?;
//! println!("Connected to {} with {} channels", info.name, info.channels);
//!
//! // 1 MHz, 100 samples before and 900 after a rising edge on channel 0
//! let session = CaptureSession::new(1_000_000, 100, 900)
//!     .with_channels(&[0, 1, 2])
//!     .with_trigger(EdgeTrigger::on(0).rising_edge());
//!
//! let outcome = driver.start_capture(session)?.wait().await?;
//! if outcome.success {
//!     println!("{}", outcome.session.to_dataframe()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Pattern Trigger
//!
//! ```rust
//! use logic_analyzer_rs::trigger_config::{BitState, PatternTrigger};
//! use logic_analyzer_rs::CaptureSession;
//!
//! let trigger = PatternTrigger::start_capturing_when(4)
//!     .bit(BitState::High)
//!     .bit(BitState::Low)
//!     .matches()
//!     .unwrap();
//!
//! let session = CaptureSession::new(10_000_000, 500, 4500)
//!     .with_channels(&[4, 5, 6])
//!     .with_trigger(trigger);
//! assert_eq!(session.trigger_pattern, 0b01);
//! ```
//!
//! ### Several Devices
//!
//! ```rust,no_run
//! use logic_analyzer_rs::{AnalyzerDriver, CaptureSession, Driver};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Channels 0..24 live on the first analyzer, 24..48 on the second
//! let mut driver: Driver = "/dev/ttyACM0,tcp://192.168.4.1:4045".parse()?;
//! driver.connect().await?;
//!
//! let session = CaptureSession::new(1_000_000, 100, 900).with_channels(&[0, 24]);
//! let outcome = driver.start_capture(session)?.wait().await?;
//! println!("success: {}", outcome.success);
//! # Ok(())
//! # }
//! ```
//!
//! ### Device Discovery
//!
//! ```rust,no_run
//! use logic_analyzer_rs::transport::available_devices;
//!
//! for device in available_devices()? {
//!     println!("Found device: {} at {}", device.name, device.port);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod analyzer_driver;
pub mod capture_run;
pub mod capture_session;
pub mod command_channel;
pub mod multi_driver;
pub mod output_packet;
pub mod protocol;
pub mod transport;
pub mod trigger_config;
pub mod wire_structs;

#[cfg(test)]
mod test_device;

// Re-export the main types for convenience
pub use analyzer_driver::{AnalyzerDriver, DeviceStatus, Driver, SingleDriver};

pub use capture_run::{CaptureError, CaptureErrorCode, CaptureHandle, CaptureOptions, CaptureOutcome, CaptureState};

pub use capture_session::{AnalyzerChannel, CaptureMode, CaptureSession, ConfigError, DeviceInfo, TriggerType};

pub use command_channel::{CommandChannel, CommandError, Expect};

pub use multi_driver::{ChannelRange, MultiDriver};

pub use output_packet::{OutputPacket, PacketDecoder, PacketError};

pub use protocol::ProtocolKind;

pub use transport::{ConnectionParams, TransportError};

pub use trigger_config::{BitState, EdgeTrigger, PatternTrigger, Trigger};

pub use wire_structs::{CaptureRequest, NetConfig, WireStruct};
