use polars::prelude::*;
use serde::{Deserialize, Serialize};

/// Channels a single analyzer can sample.
pub const MAX_CHANNELS_PER_DEVICE: u8 = 24;

/// Trigger input that is not a sampled channel. Multi-device followers are
/// armed on it so the leader's trigger output starts them.
pub const EXT_TRIGGER_CHANNEL: u8 = 24;

const TIME_COLUMN_NAME: &str = "time";
const ROW_INDEX_COLUMN_NAME: &str = "row_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum TriggerType {
    #[default]
    Edge = 0,
    Complex = 1,
    Fast = 2,
    Blast = 3,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Edge => "edge",
            Self::Complex => "complex",
            Self::Fast => "fast",
            Self::Blast => "blast",
        }
    }

    /// Largest pattern width the firmware accepts, `None` for edge triggers.
    pub fn max_pattern_bits(&self) -> Option<u8> {
        match self {
            Self::Complex => Some(16),
            Self::Fast => Some(5),
            Self::Edge | Self::Blast => None,
        }
    }
}

/// Bit-width class of a capture; decides how many bytes each sample takes on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaptureMode {
    #[default]
    Channels8 = 0,
    Channels16 = 1,
    Channels24 = 2,
}

impl CaptureMode {
    /// Narrowest mode that can carry `highest_channel`.
    pub fn for_channel(highest_channel: u8) -> Self {
        match highest_channel {
            0..=7 => Self::Channels8,
            8..=15 => Self::Channels16,
            _ => Self::Channels24,
        }
    }

    pub fn channel_width(&self) -> u8 {
        match self {
            Self::Channels8 => 8,
            Self::Channels16 => 16,
            Self::Channels24 => 24,
        }
    }

    pub fn bytes_per_sample(&self) -> usize {
        match self {
            Self::Channels8 => 1,
            Self::Channels16 => 2,
            Self::Channels24 => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AnalyzerChannel {
    pub channel_number: u8,
    /// Display metadata, carried through untouched.
    pub name: Option<String>,
    pub color: Option<u32>,
    /// One byte per sample, `0` or `1`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub samples: Vec<u8>,
}

impl AnalyzerChannel {
    pub fn new(channel_number: u8) -> Self {
        Self {
            channel_number,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn column_name(&self) -> String {
        format!("ch{}", self.channel_number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSession {
    pub frequency: u32,
    pub pre_trigger_samples: u32,
    pub post_trigger_samples: u32,
    pub loop_count: u8,
    pub measure_bursts: bool,
    pub trigger_type: TriggerType,
    pub trigger_channel: u8,
    pub trigger_inverted: bool,
    pub trigger_pattern: u16,
    /// Pattern width for complex and fast triggers.
    pub trigger_bit_count: u8,
    /// Wire order of the channels.
    pub capture_channels: Vec<AnalyzerChannel>,
    pub capture_mode: CaptureMode,
    /// Burst timestamps reported when `measure_bursts` is set.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub burst_timestamps: Vec<u32>,
}

impl CaptureSession {
    pub fn new(frequency: u32, pre_trigger_samples: u32, post_trigger_samples: u32) -> Self {
        Self {
            frequency,
            pre_trigger_samples,
            post_trigger_samples,
            loop_count: 0,
            measure_bursts: false,
            trigger_type: TriggerType::Edge,
            trigger_channel: 0,
            trigger_inverted: false,
            trigger_pattern: 0,
            trigger_bit_count: 0,
            capture_channels: Vec::new(),
            capture_mode: CaptureMode::Channels8,
            burst_timestamps: Vec::new(),
        }
    }

    /// Replace the channel list and pick the narrowest capture mode for it.
    pub fn with_channels(mut self, channel_numbers: &[u8]) -> Self {
        self.capture_channels = channel_numbers.iter().copied().map(AnalyzerChannel::new).collect();
        self.capture_mode = self.required_mode();
        self
    }

    pub fn required_mode(&self) -> CaptureMode {
        self.capture_channels
            .iter()
            .map(|c| c.channel_number)
            .max()
            .map_or(CaptureMode::Channels8, CaptureMode::for_channel)
    }

    /// Samples the device records, loops included.
    pub fn total_samples(&self) -> u64 {
        u64::from(self.pre_trigger_samples)
            + u64::from(self.post_trigger_samples) * (u64::from(self.loop_count) + 1)
    }

    pub fn clear_samples(&mut self) {
        for channel in &mut self.capture_channels {
            channel.samples.clear();
        }
        self.burst_timestamps.clear();
    }

    /// Range checks against what the device reported at connect time.
    pub fn validate(&self, info: &DeviceInfo) -> Result<(), ConfigError> {
        let available = info.channels.min(MAX_CHANNELS_PER_DEVICE);
        self.validate_channel_set(available)?;

        let highest = self.capture_channels.iter().map(|c| c.channel_number).max().unwrap_or(0);
        if highest >= self.capture_mode.channel_width() {
            return Err(ConfigError::ModeTooNarrow {
                channel: highest,
                mode: self.capture_mode,
            });
        }

        self.validate_trigger(available)?;
        self.validate_timing(info)
    }

    pub(crate) fn validate_channel_set(&self, available: u8) -> Result<(), ConfigError> {
        if self.capture_channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        if self.capture_channels.len() > usize::from(available) {
            return Err(ConfigError::TooManyChannels {
                count: self.capture_channels.len(),
                max: available,
            });
        }
        let mut seen = [false; 256];
        for channel in &self.capture_channels {
            if channel.channel_number >= available {
                return Err(ConfigError::ChannelOutOfRange {
                    channel: channel.channel_number,
                    available,
                });
            }
            let flag = &mut seen[usize::from(channel.channel_number)];
            if *flag {
                return Err(ConfigError::DuplicateChannel(channel.channel_number));
            }
            *flag = true;
        }
        Ok(())
    }

    fn validate_trigger(&self, available: u8) -> Result<(), ConfigError> {
        let external = self.trigger_type == TriggerType::Edge && self.trigger_channel == EXT_TRIGGER_CHANNEL;
        if self.trigger_channel >= available && !external {
            return Err(ConfigError::TriggerChannelOutOfRange {
                channel: self.trigger_channel,
                available,
            });
        }

        if let Some(max_bits) = self.trigger_type.max_pattern_bits() {
            if self.trigger_bit_count == 0 || self.trigger_bit_count > max_bits {
                return Err(ConfigError::TriggerBitCount {
                    count: self.trigger_bit_count,
                    max: max_bits,
                });
            }
            if u16::from(self.trigger_channel) + u16::from(self.trigger_bit_count) > 16 {
                return Err(ConfigError::PatternOutOfRange {
                    first: self.trigger_channel,
                    bits: self.trigger_bit_count,
                });
            }
        }
        Ok(())
    }

    fn validate_timing(&self, info: &DeviceInfo) -> Result<(), ConfigError> {
        let limits = info.limits(self.capture_mode);

        if self.trigger_type == TriggerType::Blast {
            if self.frequency == 0 || self.frequency > info.blast_frequency {
                return Err(ConfigError::FrequencyOutOfRange {
                    frequency: self.frequency,
                    min: 1,
                    max: info.blast_frequency,
                });
            }
            if self.pre_trigger_samples != 0 {
                return Err(ConfigError::BlastPreTrigger);
            }
            if self.loop_count != 0 || self.measure_bursts {
                return Err(ConfigError::BlastLoops);
            }
        } else {
            let min = info.min_frequency();
            if self.frequency < min || self.frequency > info.max_frequency {
                return Err(ConfigError::FrequencyOutOfRange {
                    frequency: self.frequency,
                    min,
                    max: info.max_frequency,
                });
            }
            if !(limits.min_pre_samples..=limits.max_pre_samples).contains(&self.pre_trigger_samples) {
                return Err(ConfigError::PreTriggerOutOfRange {
                    samples: self.pre_trigger_samples,
                    min: limits.min_pre_samples,
                    max: limits.max_pre_samples,
                });
            }
        }

        if !(limits.min_post_samples..=limits.max_post_samples).contains(&self.post_trigger_samples) {
            return Err(ConfigError::PostTriggerOutOfRange {
                samples: self.post_trigger_samples,
                min: limits.min_post_samples,
                max: limits.max_post_samples,
            });
        }

        if self.total_samples() > u64::from(limits.max_total_samples) {
            return Err(ConfigError::TotalSamplesExceeded {
                total: self.total_samples(),
                max: limits.max_total_samples,
            });
        }
        Ok(())
    }

    /// One boolean column per channel plus a `time` column in seconds.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let columns: Vec<Column> = self
            .capture_channels
            .iter()
            .map(|channel| {
                let values: Vec<bool> = channel.samples.iter().map(|&s| s != 0).collect();
                Series::new(channel.column_name().into(), values).into()
            })
            .collect();

        let period = 1.0 / f64::from(self.frequency.max(1));
        let mut selection = vec![col(TIME_COLUMN_NAME)];
        selection.extend(self.capture_channels.iter().map(|c| col(c.column_name())));

        DataFrame::new(columns)?
            .lazy()
            .with_row_index(ROW_INDEX_COLUMN_NAME, Some(0))
            .with_columns([
                (col(ROW_INDEX_COLUMN_NAME).cast(DataType::Float64) * lit(period)).alias(TIME_COLUMN_NAME),
            ])
            .select(selection)
            .collect()
    }
}

/// Split raw little-endian sample words into one byte-per-sample vector per
/// captured channel. Bit `k` of every word belongs to the k-th channel of the
/// request.
pub fn unpack_samples(raw: &[u8], mode: CaptureMode, channel_count: usize) -> Vec<Vec<u8>> {
    #[cfg(feature = "cpu-profiling")]
    let _span = tracy_client::Client::running()
        .map(|client| client.span(tracy_client::span_location!("unpack_samples"), 0));

    let width = mode.bytes_per_sample();
    let mut channels = vec![Vec::with_capacity(raw.len() / width); channel_count];
    for chunk in raw.chunks_exact(width) {
        let mut word = [0u8; 4];
        word[..width].copy_from_slice(chunk);
        let value = u32::from_le_bytes(word);
        for (bit, samples) in channels.iter_mut().enumerate() {
            let level = value.checked_shr(bit as u32).unwrap_or(0) & 1;
            samples.push(level as u8);
        }
    }
    channels
}

/// What the device reported during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub channels: u8,
    pub max_frequency: u32,
    pub blast_frequency: u32,
    /// Sample memory in bytes.
    pub buffer_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureLimits {
    pub min_pre_samples: u32,
    pub max_pre_samples: u32,
    pub min_post_samples: u32,
    pub max_post_samples: u32,
    pub max_total_samples: u32,
}

impl DeviceInfo {
    pub fn limits(&self, mode: CaptureMode) -> CaptureLimits {
        let total = self.buffer_size / mode.bytes_per_sample() as u32;
        CaptureLimits {
            min_pre_samples: 2,
            max_pre_samples: total / 10,
            min_post_samples: 2,
            max_post_samples: total.saturating_sub(2),
            max_total_samples: total,
        }
    }

    /// Slowest rate the firmware's 16-bit clock divider can reach.
    pub fn min_frequency(&self) -> u32 {
        ((u64::from(self.max_frequency) * 2) / 65535) as u32
    }

    /// `(major, minor)` parsed from names such as `ANALYZER_V6_5`.
    pub fn version(&self) -> Option<(u32, u32)> {
        let version = self.name.rsplit_once("_V").map(|(_, v)| v)?;
        let (major, minor) = version.split_once('_')?;
        Some((major.trim().parse().ok()?, minor.trim().parse().ok()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("No channels selected")]
    NoChannels,

    #[error("{count} channels requested, device supports {max}")]
    TooManyChannels { count: usize, max: u8 },

    #[error("Channel {channel} does not exist (device has {available})")]
    ChannelOutOfRange { channel: u8, available: u8 },

    #[error("Channel {0} selected twice")]
    DuplicateChannel(u8),

    #[error("Channel {channel} does not fit capture mode {mode:?}")]
    ModeTooNarrow { channel: u8, mode: CaptureMode },

    #[error("Trigger channel {channel} does not exist (device has {available})")]
    TriggerChannelOutOfRange { channel: u8, available: u8 },

    #[error("Trigger pattern width {count} invalid (1..={max})")]
    TriggerBitCount { count: u8, max: u8 },

    #[error("Trigger pattern starting at {first} with {bits} bits exceeds channel 15")]
    PatternOutOfRange { first: u8, bits: u8 },

    #[error("Frequency {frequency} Hz out of range ({min}..={max})")]
    FrequencyOutOfRange { frequency: u32, min: u32, max: u32 },

    #[error("Pre-trigger samples {samples} out of range ({min}..={max})")]
    PreTriggerOutOfRange { samples: u32, min: u32, max: u32 },

    #[error("Post-trigger samples {samples} out of range ({min}..={max})")]
    PostTriggerOutOfRange { samples: u32, min: u32, max: u32 },

    #[error("Capture needs {total} samples, buffer holds {max}")]
    TotalSamplesExceeded { total: u64, max: u32 },

    #[error("Blast captures take no pre-trigger samples")]
    BlastPreTrigger,

    #[error("Blast captures cannot loop or measure bursts")]
    BlastLoops,

    #[error("Blast captures cannot be synchronized across devices")]
    BlastAcrossDevices,

    #[error("Device {device} owns the trigger channel but captures no channels")]
    TriggerDeviceIdle { device: usize },
}
