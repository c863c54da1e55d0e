//! Fixed-layout little-endian structures understood by the analyzer firmware.

use crate::capture_session::{CaptureSession, TriggerType};

/// A structure with a fixed wire representation.
pub trait WireStruct {
    fn wire_size(&self) -> usize;
    fn serialize(&self) -> Vec<u8>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StructError {
    #[error("Expected {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

fn check_length(bytes: &[u8], expected: usize) -> Result<(), StructError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(StructError::Length {
            expected,
            actual: bytes.len(),
        })
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Capture configuration sent with the start-capture command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureRequest {
    pub trigger_type: u8,
    pub trigger: u8,
    /// Inversion flag for edge triggers, pattern bit count otherwise.
    pub inverted_or_count: u8,
    pub trigger_value: u16,
    pub channels: [u8; 24],
    pub channel_count: u8,
    pub frequency: u32,
    pub pre_samples: u32,
    pub post_samples: u32,
    pub loop_count: u8,
    pub measure: u8,
    pub capture_mode: u8,
}

impl CaptureRequest {
    pub const SIZE: usize = 45;

    const OFFSET_TRIGGER_VALUE: usize = 3;
    const OFFSET_CHANNELS: usize = 5;
    const OFFSET_CHANNEL_COUNT: usize = 29;
    const OFFSET_FREQUENCY: usize = 30;
    const OFFSET_PRE_SAMPLES: usize = 34;
    const OFFSET_POST_SAMPLES: usize = 38;
    const OFFSET_LOOP_COUNT: usize = 42;

    /// Channel numbers past the flag array are dropped from `channels`, but
    /// `channel_count` keeps the number of channels that were requested. The
    /// firmware relies on exactly this behaviour.
    pub fn from_session(session: &CaptureSession) -> Self {
        let mut channels = [0u8; 24];
        for channel in &session.capture_channels {
            if let Some(flag) = channels.get_mut(usize::from(channel.channel_number)) {
                *flag = 1;
            }
        }

        let inverted_or_count = match session.trigger_type {
            TriggerType::Edge => u8::from(session.trigger_inverted),
            _ => session.trigger_bit_count,
        };

        Self {
            trigger_type: session.trigger_type as u8,
            trigger: session.trigger_channel,
            inverted_or_count,
            trigger_value: session.trigger_pattern,
            channels,
            channel_count: session.capture_channels.len() as u8,
            frequency: session.frequency,
            pre_samples: session.pre_trigger_samples,
            post_samples: session.post_trigger_samples,
            loop_count: session.loop_count,
            measure: u8::from(session.measure_bursts),
            capture_mode: session.capture_mode as u8,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StructError> {
        check_length(bytes, Self::SIZE)?;
        let mut channels = [0u8; 24];
        channels.copy_from_slice(&bytes[Self::OFFSET_CHANNELS..Self::OFFSET_CHANNEL_COUNT]);
        Ok(Self {
            trigger_type: bytes[0],
            trigger: bytes[1],
            inverted_or_count: bytes[2],
            trigger_value: read_u16(bytes, Self::OFFSET_TRIGGER_VALUE),
            channels,
            channel_count: bytes[Self::OFFSET_CHANNEL_COUNT],
            frequency: read_u32(bytes, Self::OFFSET_FREQUENCY),
            pre_samples: read_u32(bytes, Self::OFFSET_PRE_SAMPLES),
            post_samples: read_u32(bytes, Self::OFFSET_POST_SAMPLES),
            loop_count: bytes[Self::OFFSET_LOOP_COUNT],
            measure: bytes[Self::OFFSET_LOOP_COUNT + 1],
            capture_mode: bytes[Self::OFFSET_LOOP_COUNT + 2],
        })
    }
}

impl WireStruct for CaptureRequest {
    fn wire_size(&self) -> usize {
        Self::SIZE
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.push(self.trigger_type);
        out.push(self.trigger);
        out.push(self.inverted_or_count);
        out.extend_from_slice(&self.trigger_value.to_le_bytes());
        out.extend_from_slice(&self.channels);
        out.push(self.channel_count);
        out.extend_from_slice(&self.frequency.to_le_bytes());
        out.extend_from_slice(&self.pre_samples.to_le_bytes());
        out.extend_from_slice(&self.post_samples.to_le_bytes());
        out.push(self.loop_count);
        out.push(self.measure);
        out.push(self.capture_mode);
        out
    }
}

/// WiFi settings stored by network-capable analyzers.
///
/// Strings longer than their field are cut to the field width without error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetConfig {
    pub access_point_name: String,
    pub password: String,
    pub ip_address: String,
    pub port: u16,
}

impl NetConfig {
    pub const SIZE: usize = 115;
    pub const ACCESS_POINT_LEN: usize = 33;
    pub const PASSWORD_LEN: usize = 64;
    pub const IP_ADDRESS_LEN: usize = 16;

    const OFFSET_PASSWORD: usize = Self::ACCESS_POINT_LEN;
    const OFFSET_IP_ADDRESS: usize = Self::OFFSET_PASSWORD + Self::PASSWORD_LEN;
    const OFFSET_PORT: usize = Self::OFFSET_IP_ADDRESS + Self::IP_ADDRESS_LEN;

    pub fn new(access_point_name: &str, password: &str, ip_address: &str, port: u16) -> Self {
        Self {
            access_point_name: access_point_name.to_string(),
            password: password.to_string(),
            ip_address: ip_address.to_string(),
            port,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StructError> {
        check_length(bytes, Self::SIZE)?;
        Ok(Self {
            access_point_name: read_padded(&bytes[..Self::OFFSET_PASSWORD]),
            password: read_padded(&bytes[Self::OFFSET_PASSWORD..Self::OFFSET_IP_ADDRESS]),
            ip_address: read_padded(&bytes[Self::OFFSET_IP_ADDRESS..Self::OFFSET_PORT]),
            port: read_u16(bytes, Self::OFFSET_PORT),
        })
    }
}

fn write_padded(out: &mut Vec<u8>, text: &str, width: usize) {
    let bytes = text.as_bytes();
    let used = bytes.len().min(width);
    out.extend_from_slice(&bytes[..used]);
    out.resize(out.len() + width - used, 0);
}

fn read_padded(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

impl WireStruct for NetConfig {
    fn wire_size(&self) -> usize {
        Self::SIZE
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        write_padded(&mut out, &self.access_point_name, Self::ACCESS_POINT_LEN);
        write_padded(&mut out, &self.password, Self::PASSWORD_LEN);
        write_padded(&mut out, &self.ip_address, Self::IP_ADDRESS_LEN);
        out.extend_from_slice(&self.port.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture_session::{AnalyzerChannel, CaptureMode};

    fn sample_request(fill: u8, wide: u32) -> CaptureRequest {
        CaptureRequest {
            trigger_type: fill,
            trigger: fill,
            inverted_or_count: fill,
            trigger_value: u16::from(fill) << 8 | u16::from(fill),
            channels: [fill; 24],
            channel_count: fill,
            frequency: wide,
            pre_samples: wide,
            post_samples: wide,
            loop_count: fill,
            measure: fill,
            capture_mode: fill,
        }
    }

    #[test]
    fn test_capture_request_size_at_boundaries() {
        for (fill, wide) in [(0, 0), (0xFF, 0xFFFF_FFFF), (1, 1)] {
            let request = sample_request(fill, wide);
            let bytes = request.serialize();
            assert_eq!(bytes.len(), CaptureRequest::SIZE);
            assert_eq!(CaptureRequest::from_bytes(&bytes).unwrap(), request);
        }
    }

    #[test]
    fn test_capture_request_offsets() {
        let mut request = CaptureRequest {
            trigger_type: 2,
            trigger: 5,
            inverted_or_count: 3,
            trigger_value: 0x1234,
            channel_count: 2,
            frequency: 0x0A0B_0C0D,
            pre_samples: 0x0102_0304,
            post_samples: 0x1122_3344,
            loop_count: 7,
            measure: 1,
            capture_mode: 2,
            ..Default::default()
        };
        request.channels[0] = 1;
        request.channels[23] = 1;

        let bytes = request.serialize();
        assert_eq!(&bytes[0..3], &[2, 5, 3]);
        assert_eq!(&bytes[3..5], &[0x34, 0x12]);
        assert_eq!(bytes[5], 1);
        assert_eq!(bytes[28], 1);
        assert_eq!(bytes[29], 2);
        assert_eq!(&bytes[30..34], &[0x0D, 0x0C, 0x0B, 0x0A]);
        assert_eq!(&bytes[34..38], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[38..42], &[0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[42..45], &[7, 1, 2]);
    }

    #[test]
    fn test_from_session_maps_fields() {
        let mut session = CaptureSession::new(1_000_000, 100, 900);
        session.capture_channels = vec![AnalyzerChannel::new(3), AnalyzerChannel::new(9)];
        session.capture_mode = CaptureMode::Channels16;
        session.trigger_channel = 3;
        session.trigger_inverted = true;
        session.loop_count = 4;
        session.measure_bursts = true;

        let request = CaptureRequest::from_session(&session);
        assert_eq!(request.trigger_type, 0);
        assert_eq!(request.trigger, 3);
        assert_eq!(request.inverted_or_count, 1);
        assert_eq!(request.trigger_value, 0);
        assert_eq!(request.channels[3], 1);
        assert_eq!(request.channels[9], 1);
        assert_eq!(request.channels.iter().filter(|&&c| c == 1).count(), 2);
        assert_eq!(request.channel_count, 2);
        assert_eq!(request.frequency, 1_000_000);
        assert_eq!(request.pre_samples, 100);
        assert_eq!(request.post_samples, 900);
        assert_eq!(request.loop_count, 4);
        assert_eq!(request.measure, 1);
        assert_eq!(request.capture_mode, 1);
    }

    #[test]
    fn test_pattern_trigger_sends_bit_count() {
        let mut session = CaptureSession::new(1_000_000, 10, 90);
        session.capture_channels = vec![AnalyzerChannel::new(0)];
        session.trigger_type = TriggerType::Complex;
        session.trigger_inverted = true;
        session.trigger_bit_count = 4;
        session.trigger_pattern = 0b1010;

        let request = CaptureRequest::from_session(&session);
        assert_eq!(request.trigger_type, 1);
        assert_eq!(request.inverted_or_count, 4);
        assert_eq!(request.trigger_value, 0b1010);
    }

    #[test]
    fn test_out_of_range_channels_still_counted() {
        // Hardware quirk: flags ignore channels past 23, the count does not.
        let mut session = CaptureSession::new(1_000_000, 10, 90);
        session.capture_channels = vec![
            AnalyzerChannel::new(1),
            AnalyzerChannel::new(24),
            AnalyzerChannel::new(40),
        ];

        let request = CaptureRequest::from_session(&session);
        assert_eq!(request.channel_count, 3);
        assert_eq!(request.channels.iter().filter(|&&c| c == 1).count(), 1);
        assert_eq!(request.serialize().len(), CaptureRequest::SIZE);
    }

    #[test]
    fn test_net_config_layout() {
        let config = NetConfig::new("lab", "secret", "192.168.4.1", 0x1FCD);
        let bytes = config.serialize();
        assert_eq!(bytes.len(), NetConfig::SIZE);
        assert_eq!(&bytes[0..3], b"lab");
        assert!(bytes[3..33].iter().all(|&b| b == 0));
        assert_eq!(&bytes[33..39], b"secret");
        assert_eq!(&bytes[97..108], b"192.168.4.1");
        assert_eq!(&bytes[113..115], &[0xCD, 0x1F]);
        assert_eq!(NetConfig::from_bytes(&bytes).unwrap(), config);
    }

    #[test]
    fn test_net_config_truncates_long_strings() {
        // Hardware quirk: oversized strings are cut, never rejected.
        let name: String = (0..50).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
        let password = "p".repeat(100);
        let config = NetConfig::new(&name, &password, "255.255.255.255.255", u16::MAX);

        let bytes = config.serialize();
        assert_eq!(bytes.len(), NetConfig::SIZE);
        assert_eq!(&bytes[0..33], &name.as_bytes()[..33]);
        assert_eq!(&bytes[33..97], "p".repeat(64).as_bytes());
        assert_eq!(&bytes[97..113], &b"255.255.255.255.255"[..16]);
        assert_eq!(&bytes[113..115], &[0xFF, 0xFF]);

        let empty = NetConfig::default().serialize();
        assert_eq!(empty, vec![0u8; NetConfig::SIZE]);
    }

    #[test]
    fn test_from_bytes_checks_length() {
        assert_eq!(
            CaptureRequest::from_bytes(&[0u8; 44]),
            Err(StructError::Length { expected: 45, actual: 44 })
        );
        assert!(NetConfig::from_bytes(&[0u8; 116]).is_err());
    }
}
