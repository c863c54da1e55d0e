//! Byte-stuffed packet framing used for every host-to-device command.
//!
//! A frame is `55 AA <escaped payload> AA 55`. Payload bytes that collide with
//! a marker (`0xAA`, `0x55`) or with the escape byte itself (`0xF0`) are sent
//! as `F0 <byte ^ F0>`.

use std::any::Any;

use crate::wire_structs::{CaptureRequest, NetConfig, WireStruct};

pub const FRAME_START: [u8; 2] = [0x55, 0xAA];
pub const FRAME_END: [u8; 2] = [0xAA, 0x55];
pub const ESCAPE: u8 = 0xF0;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidStruct {
    #[error("Invalid struct: no struct was supplied")]
    Missing,

    #[error("Invalid struct: {type_name} does not provide a wire serializer")]
    NotSerializable { type_name: &'static str },

    #[error("Invalid struct: serializer returned {actual} bytes, expected {expected}")]
    WrongLength { expected: usize, actual: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error(transparent)]
    InvalidStruct(#[from] InvalidStruct),

    #[error("Frame does not start with 55 AA")]
    MissingStart,

    #[error("Frame does not end with AA 55")]
    MissingEnd,

    #[error("Dangling escape byte at end of frame")]
    DanglingEscape,

    #[error("Unescaped marker byte 0x{0:02x} inside frame")]
    UnescapedMarker(u8),
}

fn needs_escape(byte: u8) -> bool {
    matches!(byte, 0xAA | 0x55 | ESCAPE)
}

/// Frame a payload for the wire.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 8);
    frame.extend_from_slice(&FRAME_START);
    for &byte in payload {
        if needs_escape(byte) {
            frame.push(ESCAPE);
            frame.push(byte ^ ESCAPE);
        } else {
            frame.push(byte);
        }
    }
    frame.extend_from_slice(&FRAME_END);
    frame
}

/// Strip the markers and undo the escaping of a single complete frame.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>, PacketError> {
    let inner = frame
        .strip_prefix(&FRAME_START[..])
        .ok_or(PacketError::MissingStart)?
        .strip_suffix(&FRAME_END[..])
        .ok_or(PacketError::MissingEnd)?;

    let mut payload = Vec::with_capacity(inner.len());
    let mut bytes = inner.iter();
    while let Some(&byte) = bytes.next() {
        match byte {
            ESCAPE => {
                let escaped = bytes.next().ok_or(PacketError::DanglingEscape)?;
                payload.push(escaped ^ ESCAPE);
            }
            0xAA | 0x55 => return Err(PacketError::UnescapedMarker(byte)),
            _ => payload.push(byte),
        }
    }
    Ok(payload)
}

/// Accumulates a command payload. Values are truncated to a byte the same way
/// the firmware tolerates oversized inputs.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OutputPacket {
    data: Vec<u8>,
}

impl OutputPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_byte(&mut self, value: impl Into<i64>) -> &mut Self {
        self.data.push(value.into().rem_euclid(256) as u8);
        self
    }

    pub fn add_bytes<I>(&mut self, values: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: Into<i64>,
    {
        for value in values {
            self.add_byte(value);
        }
        self
    }

    /// Each character contributes its code point modulo 256.
    pub fn add_string(&mut self, text: &str) -> &mut Self {
        self.add_bytes(text.chars().map(u32::from))
    }

    pub fn add_struct(&mut self, value: Option<&dyn WireStruct>) -> Result<&mut Self, PacketError> {
        let value = value.ok_or(InvalidStruct::Missing)?;
        let bytes = value.serialize();
        if bytes.len() != value.wire_size() {
            return Err(InvalidStruct::WrongLength {
                expected: value.wire_size(),
                actual: bytes.len(),
            }
            .into());
        }
        self.data.extend_from_slice(&bytes);
        Ok(self)
    }

    /// Type-erased variant of [`add_struct`](Self::add_struct) for callers that
    /// hold configuration values behind `dyn Any`.
    pub fn add_any_struct(&mut self, value: Option<&dyn Any>) -> Result<&mut Self, PacketError> {
        let value = value.ok_or(InvalidStruct::Missing)?;
        if let Some(request) = value.downcast_ref::<CaptureRequest>() {
            return self.add_struct(Some(request));
        }
        if let Some(config) = value.downcast_ref::<NetConfig>() {
            return self.add_struct(Some(config));
        }
        Err(InvalidStruct::NotSerializable {
            type_name: any_type_name(value),
        }
        .into())
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Framed bytes; calling it repeatedly yields the same output.
    pub fn serialize(&self) -> Vec<u8> {
        encode(&self.data)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

fn any_type_name(value: &dyn Any) -> &'static str {
    if value.is::<String>() || value.is::<&str>() {
        "string"
    } else if value.is::<Vec<u8>>() {
        "byte vector"
    } else {
        "value"
    }
}

/// Incremental unframing of a byte stream.
///
/// Bytes outside of a frame are ignored; a start marker seen inside a frame
/// restarts the frame.
#[derive(Debug, Default)]
pub struct PacketDecoder {
    buf: Vec<u8>,
    in_frame: bool,
    escaped: bool,
    last: Option<u8>,
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while no frame is being assembled.
    pub fn is_idle(&self) -> bool {
        !self.in_frame && self.last != Some(FRAME_START[0])
    }

    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        let previous = self.last.replace(byte);

        if self.escaped {
            self.escaped = false;
            self.buf.push(byte ^ ESCAPE);
            return None;
        }

        if previous == Some(FRAME_START[0]) && byte == FRAME_START[1] {
            if self.in_frame {
                log::warn!("Frame restarted before end marker, dropping {} bytes", self.buf.len());
            }
            self.buf.clear();
            self.in_frame = true;
            // A start marker must not double as the first half of an end marker.
            self.last = None;
            return None;
        }

        if !self.in_frame {
            return None;
        }

        match byte {
            ESCAPE => {
                self.escaped = true;
                None
            }
            0xAA => None,
            0x55 if previous == Some(FRAME_END[0]) => {
                self.in_frame = false;
                self.last = None;
                Some(std::mem::take(&mut self.buf))
            }
            0x55 => None,
            _ => {
                if previous == Some(0xAA) {
                    log::warn!("Stray 0xAA inside frame");
                }
                self.buf.push(byte);
                None
            }
        }
    }

    pub fn push_slice(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        bytes.iter().filter_map(|&b| self.push(b)).collect()
    }
}
