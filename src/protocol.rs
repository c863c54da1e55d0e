//! What goes over a [`CommandChannel`] for each firmware family.
//!
//! The binary firmware frames every command with [`OutputPacket`] and pushes
//! capture data unsolicited once the trigger fired. Template firmwares speak
//! plain text lines and are polled for their status.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture_run::{CaptureError, CaptureOptions};
use crate::capture_session::{unpack_samples, CaptureSession, DeviceInfo, TriggerType, MAX_CHANNELS_PER_DEVICE};
use crate::command_channel::{CommandChannel, CommandError, Expect};
use crate::output_packet::OutputPacket;
use crate::wire_structs::{CaptureRequest, NetConfig};

const CMD_IDENTIFY: u8 = 0;
const CMD_START_CAPTURE: u8 = 1;
const CMD_NETWORK_CONFIG: u8 = 2;
const CMD_VOLTAGE: u8 = 3;
const CMD_BOOTLOADER: u8 = 4;
/// Sent raw, outside any frame.
const ABORT_BYTE: u8 = 0xFF;

const SETTLE_TIME: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtocolKind {
    /// Framed packet protocol of the reference firmware.
    #[default]
    Binary,
    /// Line based template firmware.
    Text,
}

impl ProtocolKind {
    pub fn build(&self, options: &CaptureOptions) -> Arc<dyn DeviceProtocol> {
        match self {
            Self::Binary => Arc::new(BinaryProtocol::new(options)),
            Self::Text => Arc::new(TextProtocol::new(options)),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary => f.write_str("binary"),
            Self::Text => f.write_str("text"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" => Ok(Self::Binary),
            "text" | "txt" => Ok(Self::Text),
            other => Err(format!("Unknown protocol '{other}'")),
        }
    }
}

/// Answer to one status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureStatus {
    Running,
    /// Finished; binary devices announce the sample count up front.
    Complete { sample_count: Option<u32> },
    Failed(String),
}

#[async_trait]
pub trait DeviceProtocol: Send + Sync + fmt::Debug {
    fn kind(&self) -> ProtocolKind;

    /// Reset the device to a known state and read its capabilities.
    async fn handshake(&self, channel: &CommandChannel) -> Result<DeviceInfo, CaptureError>;

    /// Send the capture configuration; returns the command that starts it.
    async fn configure(&self, channel: &CommandChannel, session: &CaptureSession) -> Result<Vec<u8>, CaptureError>;

    async fn start(&self, channel: &CommandChannel, start_command: Vec<u8>) -> Result<(), CaptureError>;

    /// Ask (or wait up to `interval`) for the capture status.
    async fn poll(&self, channel: &CommandChannel, interval: Duration) -> Result<CaptureStatus, CaptureError>;

    /// Sleep between two `Running` polls. Protocols whose poll already blocks
    /// for the interval return zero.
    fn poll_pause(&self, interval: Duration) -> Duration {
        interval
    }

    /// Read the samples into `session.capture_channels`.
    async fn transfer(
        &self,
        channel: &CommandChannel,
        session: &mut CaptureSession,
        sample_count: Option<u32>,
    ) -> Result<(), CaptureError>;

    async fn stop(&self, channel: &CommandChannel) -> Result<(), CaptureError>;

    /// Whether a stopped capture still has readable samples.
    fn supports_partial_transfer(&self) -> bool {
        false
    }

    async fn voltage(&self, _channel: &CommandChannel) -> Result<Option<String>, CaptureError> {
        Ok(None)
    }

    async fn enter_bootloader(&self, channel: &CommandChannel) -> Result<(), CaptureError>;

    async fn configure_network(&self, _channel: &CommandChannel, _config: &NetConfig) -> Result<(), CaptureError> {
        Err(CaptureError::Unsupported(format!(
            "network configuration over the {} protocol",
            self.kind()
        )))
    }
}

fn parse_prefixed<T: FromStr>(line: &str, prefix: &str) -> Result<T, CaptureError> {
    line.strip_prefix(prefix)
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| CaptureError::Hardware(format!("Expected '{prefix}<value>', device sent '{line}'")))
}

fn expect_reply(line: &str, expected: &str) -> Result<(), CaptureError> {
    if line == expected {
        Ok(())
    } else {
        Err(CaptureError::Hardware(format!("Expected '{expected}', device sent '{line}'")))
    }
}

#[derive(Debug, Clone)]
pub struct BinaryProtocol {
    command_timeout: Duration,
    transfer_timeout: Duration,
}

impl BinaryProtocol {
    pub fn new(options: &CaptureOptions) -> Self {
        Self {
            command_timeout: options.command_timeout,
            transfer_timeout: options.transfer_timeout,
        }
    }

    fn frame(command: u8) -> Vec<u8> {
        OutputPacket::new().add_byte(command).serialize()
    }

    async fn read_line(&self, channel: &CommandChannel) -> Result<String, CaptureError> {
        let line = channel.receive(Expect::Line, self.command_timeout).await?;
        Ok(String::from_utf8_lossy(&line).trim().to_string())
    }

    async fn read_u32(&self, channel: &CommandChannel, timeout: Duration) -> Result<u32, CaptureError> {
        let bytes = channel.receive(Expect::Bytes(4), timeout).await?;
        let word: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| CaptureError::Unexpected(format!("Expected 4 bytes, got {}", bytes.len())))?;
        Ok(u32::from_le_bytes(word))
    }

    async fn abort(&self, channel: &CommandChannel) -> Result<(), CaptureError> {
        channel.send(vec![ABORT_BYTE], Expect::Nothing, self.command_timeout).await?;
        tokio::time::sleep(SETTLE_TIME).await;
        channel.clear_input().await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceProtocol for BinaryProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Binary
    }

    async fn handshake(&self, channel: &CommandChannel) -> Result<DeviceInfo, CaptureError> {
        // A device left capturing by a previous host ignores everything else.
        self.abort(channel).await?;

        let name = channel
            .query_line(Self::frame(CMD_IDENTIFY), self.command_timeout)
            .await?;
        if !name.starts_with("ANALYZER_V") {
            return Err(CaptureError::Hardware(format!("Unknown device identification '{name}'")));
        }

        let max_frequency = parse_prefixed(&self.read_line(channel).await?, "FREQ:")?;
        let blast_frequency = parse_prefixed(&self.read_line(channel).await?, "BLASTFREQ:")?;
        let buffer_size = parse_prefixed(&self.read_line(channel).await?, "BUFFER:")?;
        let channels: u8 = parse_prefixed(&self.read_line(channel).await?, "CHANNELS:")?;

        let info = DeviceInfo {
            name,
            channels: channels.min(MAX_CHANNELS_PER_DEVICE),
            max_frequency,
            blast_frequency,
            buffer_size,
        };
        log::info!(
            "{}: {} with {} channels, {} Hz max, {} bytes buffer",
            channel.name(),
            info.name,
            info.channels,
            info.max_frequency,
            info.buffer_size
        );
        Ok(info)
    }

    async fn configure(&self, _channel: &CommandChannel, session: &CaptureSession) -> Result<Vec<u8>, CaptureError> {
        let request = CaptureRequest::from_session(session);
        log::debug!("Capture request: {:?}", request);
        let mut packet = OutputPacket::new();
        packet.add_byte(CMD_START_CAPTURE).add_struct(Some(&request))?;
        Ok(packet.serialize())
    }

    async fn start(&self, channel: &CommandChannel, start_command: Vec<u8>) -> Result<(), CaptureError> {
        let reply = channel.query_line(start_command, self.command_timeout).await?;
        expect_reply(&reply, "CAPTURE_STARTED")
    }

    async fn poll(&self, channel: &CommandChannel, interval: Duration) -> Result<CaptureStatus, CaptureError> {
        match self.read_u32(channel, interval).await {
            Ok(sample_count) => Ok(CaptureStatus::Complete {
                sample_count: Some(sample_count),
            }),
            Err(CaptureError::CommandTimeout(_)) => Ok(CaptureStatus::Running),
            Err(e) => Err(e),
        }
    }

    fn poll_pause(&self, _interval: Duration) -> Duration {
        Duration::ZERO
    }

    async fn transfer(
        &self,
        channel: &CommandChannel,
        session: &mut CaptureSession,
        sample_count: Option<u32>,
    ) -> Result<(), CaptureError> {
        let sample_count = match sample_count {
            Some(count) => count,
            None => self.read_u32(channel, self.transfer_timeout).await?,
        };
        // A mismatch means the count itself is corrupt; never size a read on it.
        if u64::from(sample_count) != session.total_samples() {
            return Err(CaptureError::Hardware(format!(
                "device announced {} samples, {} were requested",
                sample_count,
                session.total_samples()
            )));
        }

        let length = sample_count as usize * session.capture_mode.bytes_per_sample();
        let raw = channel.receive(Expect::Bytes(length), self.transfer_timeout).await?;
        let unpacked = unpack_samples(&raw, session.capture_mode, session.capture_channels.len());
        for (analyzer_channel, samples) in session.capture_channels.iter_mut().zip(unpacked) {
            analyzer_channel.samples = samples;
        }

        if session.measure_bursts && session.loop_count > 0 {
            let flag = channel.receive(Expect::Bytes(1), self.command_timeout).await?;
            if flag.first().copied().unwrap_or(0) != 0 {
                let count = usize::from(session.loop_count) + 2;
                let raw = channel.receive(Expect::Bytes(count * 4), self.command_timeout).await?;
                session.burst_timestamps = raw
                    .chunks_exact(4)
                    .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .collect();
            }
        }
        log::debug!("{}: transferred {} samples", channel.name(), sample_count);
        Ok(())
    }

    async fn stop(&self, channel: &CommandChannel) -> Result<(), CaptureError> {
        self.abort(channel).await
    }

    async fn voltage(&self, channel: &CommandChannel) -> Result<Option<String>, CaptureError> {
        let reply = channel
            .query_line(Self::frame(CMD_VOLTAGE), self.command_timeout)
            .await?;
        Ok(Some(reply))
    }

    async fn enter_bootloader(&self, channel: &CommandChannel) -> Result<(), CaptureError> {
        let reply = channel
            .query_line(Self::frame(CMD_BOOTLOADER), self.command_timeout)
            .await?;
        expect_reply(&reply, "RESTARTING_BOOTLOADER")
    }

    async fn configure_network(&self, channel: &CommandChannel, config: &NetConfig) -> Result<(), CaptureError> {
        let mut packet = OutputPacket::new();
        packet.add_byte(CMD_NETWORK_CONFIG).add_struct(Some(config))?;
        let reply = channel.query_line(packet.serialize(), self.command_timeout).await?;
        expect_reply(&reply, "SETTINGS_SAVED")
    }
}

#[derive(Debug, Clone)]
pub struct TextProtocol {
    command_timeout: Duration,
    transfer_timeout: Duration,
}

impl TextProtocol {
    pub fn new(options: &CaptureOptions) -> Self {
        Self {
            command_timeout: options.command_timeout,
            transfer_timeout: options.transfer_timeout,
        }
    }

    async fn query(&self, channel: &CommandChannel, command: &str) -> Result<String, CaptureError> {
        let reply = channel
            .query_line(format!("{command}\n"), self.command_timeout)
            .await?;
        if let Some(reason) = reply.strip_prefix("ERR") {
            return Err(CaptureError::Hardware(format!(
                "'{command}' rejected:{}",
                reason.trim_start_matches(':')
            )));
        }
        Ok(reply)
    }

    async fn command(&self, channel: &CommandChannel, command: &str) -> Result<(), CaptureError> {
        let reply = self.query(channel, command).await?;
        expect_reply(&reply, "OK")
    }

    fn trigger_name(session: &CaptureSession) -> &'static str {
        match session.trigger_type {
            TriggerType::Edge if session.trigger_inverted => "falling",
            TriggerType::Edge => "rising",
            other => other.as_str(),
        }
    }
}

/// Samples of one channel, either comma separated or as a run of `0`/`1`.
fn parse_text_samples(line: &str) -> Result<Vec<u8>, CaptureError> {
    let invalid = || CaptureError::Hardware(format!("Malformed sample data '{line}'"));
    if line.contains(',') {
        line.split(',')
            .map(|value| match value.trim() {
                "0" => Ok(0),
                "1" => Ok(1),
                _ => Err(invalid()),
            })
            .collect()
    } else {
        line.chars()
            .map(|c| match c {
                '0' => Ok(0),
                '1' => Ok(1),
                _ => Err(invalid()),
            })
            .collect()
    }
}

#[async_trait]
impl DeviceProtocol for TextProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Text
    }

    async fn handshake(&self, channel: &CommandChannel) -> Result<DeviceInfo, CaptureError> {
        channel.clear_input().await?;
        let name = self.query(channel, "*IDN?").await?;
        if name.is_empty() {
            return Err(CaptureError::Hardware("Empty identification".to_string()));
        }
        let parse = |what: &str, value: String| -> Result<u32, CaptureError> {
            value
                .parse()
                .map_err(|_| CaptureError::Hardware(format!("Invalid {what} reply '{value}'")))
        };
        let channels = parse("CHANNELS?", self.query(channel, "CHANNELS?").await?)?;
        let max_frequency = parse("MAXRATE?", self.query(channel, "MAXRATE?").await?)?;
        let buffer_size = parse("BUFFER?", self.query(channel, "BUFFER?").await?)?;

        let info = DeviceInfo {
            name,
            channels: channels.min(u32::from(MAX_CHANNELS_PER_DEVICE)) as u8,
            max_frequency,
            blast_frequency: max_frequency,
            buffer_size,
        };
        log::info!("{}: {} with {} channels", channel.name(), info.name, info.channels);
        Ok(info)
    }

    async fn configure(&self, channel: &CommandChannel, session: &CaptureSession) -> Result<Vec<u8>, CaptureError> {
        let channels = session
            .capture_channels
            .iter()
            .map(|c| c.channel_number.to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.command(channel, &format!("RATE {}", session.frequency)).await?;
        self.command(channel, &format!("CHANNELS {channels}")).await?;
        self.command(channel, &format!("SAMPLES {}", session.total_samples())).await?;
        self.command(
            channel,
            &format!("TRIGGER {} {}", session.trigger_channel, Self::trigger_name(session)),
        )
        .await?;
        Ok(b"START\n".to_vec())
    }

    async fn start(&self, channel: &CommandChannel, start_command: Vec<u8>) -> Result<(), CaptureError> {
        let reply = channel.query_line(start_command, self.command_timeout).await?;
        expect_reply(&reply, "OK")
    }

    async fn poll(&self, channel: &CommandChannel, _interval: Duration) -> Result<CaptureStatus, CaptureError> {
        let reply = self.query(channel, "CAPTURE_STATUS?").await?;
        Ok(match reply.as_str() {
            "COMPLETE" | "DONE" | "STOPPED" => CaptureStatus::Complete { sample_count: None },
            "RUNNING" | "WAITING" | "TRIGGERED" => CaptureStatus::Running,
            other => match other.strip_prefix("ERROR") {
                Some(reason) => CaptureStatus::Failed(reason.trim_start_matches([':', ' ']).to_string()),
                None => return Err(CaptureError::Hardware(format!("Unknown capture status '{other}'"))),
            },
        })
    }

    async fn transfer(
        &self,
        channel: &CommandChannel,
        session: &mut CaptureSession,
        _sample_count: Option<u32>,
    ) -> Result<(), CaptureError> {
        let expected = session.total_samples();
        for analyzer_channel in &mut session.capture_channels {
            let line = channel
                .query_line(
                    format!("DATA {}\n", analyzer_channel.channel_number),
                    self.transfer_timeout,
                )
                .await?;
            let samples = parse_text_samples(&line)?;
            if samples.len() as u64 != expected {
                log::debug!(
                    "{}: channel {} returned {} of {} samples",
                    channel.name(),
                    analyzer_channel.channel_number,
                    samples.len(),
                    expected
                );
            }
            analyzer_channel.samples = samples;
        }
        Ok(())
    }

    async fn stop(&self, channel: &CommandChannel) -> Result<(), CaptureError> {
        self.command(channel, "STOP").await
    }

    fn supports_partial_transfer(&self) -> bool {
        true
    }

    async fn enter_bootloader(&self, channel: &CommandChannel) -> Result<(), CaptureError> {
        self.command(channel, "BOOTLOADER").await
    }
}

impl From<CommandError> for CaptureError {
    fn from(error: CommandError) -> Self {
        match error {
            CommandError::Timeout(timeout) => Self::CommandTimeout(timeout),
            other => Self::Hardware(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_kind_parsing() {
        assert_eq!("binary".parse::<ProtocolKind>(), Ok(ProtocolKind::Binary));
        assert_eq!("TEXT".parse::<ProtocolKind>(), Ok(ProtocolKind::Text));
        assert!("morse".parse::<ProtocolKind>().is_err());
        assert_eq!(ProtocolKind::Text.to_string(), "text");
    }

    #[test]
    fn test_parse_prefixed() {
        assert_eq!(parse_prefixed::<u32>("FREQ:100000000", "FREQ:"), Ok(100_000_000));
        assert!(parse_prefixed::<u32>("BUFFER:lots", "BUFFER:").is_err());
        assert!(parse_prefixed::<u32>("100000000", "FREQ:").is_err());
    }

    #[test]
    fn test_parse_text_samples() {
        assert_eq!(parse_text_samples("0,1, 1,0"), Ok(vec![0, 1, 1, 0]));
        assert_eq!(parse_text_samples("0110"), Ok(vec![0, 1, 1, 0]));
        assert_eq!(parse_text_samples(""), Ok(vec![]));
        assert!(parse_text_samples("0,2").is_err());
    }

    #[test]
    fn test_command_error_mapping() {
        let timeout = Duration::from_millis(5);
        assert_eq!(
            CaptureError::from(CommandError::Timeout(timeout)),
            CaptureError::CommandTimeout(timeout)
        );
        assert!(matches!(
            CaptureError::from(CommandError::Closed),
            CaptureError::Hardware(_)
        ));
    }

    #[tokio::test]
    async fn test_binary_configure_builds_framed_request() {
        let options = CaptureOptions::default();
        let protocol = BinaryProtocol::new(&options);
        let (host, _device) = tokio::io::duplex(64);
        let channel = CommandChannel::start("test", host, options.late_response_grace);

        let session = CaptureSession::new(1_000_000, 100, 900).with_channels(&[0, 1]);
        let frame = protocol.configure(&channel, &session).await.unwrap();
        let payload = crate::output_packet::decode(&frame).unwrap();
        assert_eq!(payload[0], CMD_START_CAPTURE);
        assert_eq!(
            CaptureRequest::from_bytes(&payload[1..]).unwrap(),
            CaptureRequest::from_session(&session)
        );
    }

    #[test]
    fn test_text_trigger_names() {
        let mut session = CaptureSession::new(1_000_000, 10, 90);
        assert_eq!(TextProtocol::trigger_name(&session), "rising");
        session.trigger_inverted = true;
        assert_eq!(TextProtocol::trigger_name(&session), "falling");
        session.trigger_type = TriggerType::Complex;
        assert_eq!(TextProtocol::trigger_name(&session), "complex");
    }
}
