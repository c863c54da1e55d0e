//! In-memory stand-ins for analyzer firmwares, driven over `tokio::io::duplex`.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream, WriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::capture_session::DeviceInfo;
use crate::output_packet::PacketDecoder;
use crate::wire_structs::{CaptureRequest, NetConfig};

const DUPLEX_BUFFER: usize = 1 << 16;

/// Level of the sample at `index` for the channel at request position
/// `position`.
pub(crate) type LevelFn = fn(index: usize, position: usize) -> bool;

pub(crate) fn counter_level(index: usize, position: usize) -> bool {
    (index >> position) & 1 == 1
}

#[derive(Debug, Clone)]
pub(crate) struct BinaryDeviceConfig {
    pub identification: &'static str,
    pub channels: u8,
    /// Time between the start acknowledgement and the data.
    pub capture_delay: Duration,
    pub level: LevelFn,
    pub reject_capture: bool,
    /// Announce the full sample count but send only half of the samples.
    pub truncate_data: bool,
    /// Added to the sample count announced ahead of the data.
    pub count_error: u32,
}

impl Default for BinaryDeviceConfig {
    fn default() -> Self {
        Self {
            identification: "ANALYZER_V6_5",
            channels: 24,
            capture_delay: Duration::from_millis(20),
            level: counter_level,
            reject_capture: false,
            truncate_data: false,
            count_error: 0,
        }
    }
}

/// What the handshake of a default binary device yields.
pub(crate) fn binary_device_info() -> DeviceInfo {
    DeviceInfo {
        name: "ANALYZER_V6_5".to_string(),
        channels: 24,
        max_frequency: 100_000_000,
        blast_frequency: 200_000_000,
        buffer_size: 262_144,
    }
}

pub(crate) fn spawn_binary_device(config: BinaryDeviceConfig) -> DuplexStream {
    let (host, device) = tokio::io::duplex(DUPLEX_BUFFER);
    tokio::spawn(run_binary_device(device, config));
    host
}

type SharedWriter = Arc<Mutex<WriteHalf<DuplexStream>>>;

async fn write(writer: &SharedWriter, bytes: &[u8]) {
    let _ = writer.lock().await.write_all(bytes).await;
}

async fn run_binary_device(device: DuplexStream, config: BinaryDeviceConfig) {
    let (mut reader, writer) = tokio::io::split(device);
    let writer: SharedWriter = Arc::new(Mutex::new(writer));
    let mut decoder = PacketDecoder::new();
    let mut capture: Option<JoinHandle<()>> = None;
    let mut buf = [0u8; 512];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &byte in &buf[..n] {
            if byte == 0xFF && decoder.is_idle() {
                if let Some(task) = capture.take() {
                    task.abort();
                }
                continue;
            }
            let Some(frame) = decoder.push(byte) else {
                continue;
            };
            match frame.split_first() {
                Some((&0, _)) => {
                    let lines = format!(
                        "{}\nFREQ:100000000\nBLASTFREQ:200000000\nBUFFER:262144\nCHANNELS:{}\n",
                        config.identification, config.channels
                    );
                    write(&writer, lines.as_bytes()).await;
                }
                Some((&1, body)) => match CaptureRequest::from_bytes(body) {
                    Ok(request) if !config.reject_capture => {
                        write(&writer, b"CAPTURE_STARTED\n").await;
                        capture = Some(tokio::spawn(send_capture(writer.clone(), request, config.clone())));
                    }
                    _ => write(&writer, b"CAPTURE_ERROR\n").await,
                },
                Some((&2, body)) if NetConfig::from_bytes(body).is_ok() => {
                    write(&writer, b"SETTINGS_SAVED\n").await;
                }
                Some((&3, _)) => write(&writer, b"3.30V\n").await,
                Some((&4, _)) => write(&writer, b"RESTARTING_BOOTLOADER\n").await,
                _ => write(&writer, b"ERROR\n").await,
            }
        }
    }

    if let Some(task) = capture {
        task.abort();
    }
}

async fn send_capture(writer: SharedWriter, request: CaptureRequest, config: BinaryDeviceConfig) {
    tokio::time::sleep(config.capture_delay).await;

    let loops = usize::from(request.loop_count) + 1;
    let total = request.pre_samples as usize + request.post_samples as usize * loops;
    let width = match request.capture_mode {
        0 => 1,
        1 => 2,
        _ => 4,
    };
    let sent = if config.truncate_data { total / 2 } else { total };

    let mut data = (total as u32 + config.count_error).to_le_bytes().to_vec();
    for index in 0..sent {
        let mut word = 0u32;
        for position in 0..usize::from(request.channel_count).min(24) {
            if (config.level)(index, position) {
                word |= 1 << position;
            }
        }
        data.extend_from_slice(&word.to_le_bytes()[..width]);
    }
    if !config.truncate_data && request.measure == 1 && request.loop_count > 0 {
        data.push(1);
        for burst in 0..(loops + 1) as u32 {
            data.extend_from_slice(&(burst * 1000).to_le_bytes());
        }
    }
    write(&writer, &data).await;
}

#[derive(Debug, Clone)]
pub(crate) struct TextDeviceConfig {
    pub channels: u8,
    pub max_rate: u32,
    pub buffer: u32,
    /// `CAPTURE_STATUS?` answers `RUNNING` this many times after `START`.
    pub running_polls: usize,
    pub level: LevelFn,
}

impl Default for TextDeviceConfig {
    fn default() -> Self {
        Self {
            channels: 8,
            max_rate: 24_000_000,
            buffer: 65_536,
            running_polls: 2,
            level: counter_level,
        }
    }
}

pub(crate) fn spawn_text_device(config: TextDeviceConfig) -> DuplexStream {
    let (host, device) = tokio::io::duplex(DUPLEX_BUFFER);
    tokio::spawn(run_text_device(device, config));
    host
}

async fn run_text_device(device: DuplexStream, config: TextDeviceConfig) {
    let (reader, mut writer) = tokio::io::split(device);
    let mut lines = BufReader::new(reader).lines();
    let mut samples = 0usize;
    let mut polls_left = 0usize;
    let mut stopped = false;

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
        let reply = match command {
            "*IDN?" => "TEMPLATE_LA_V1".to_string(),
            "CHANNELS?" => config.channels.to_string(),
            "MAXRATE?" => config.max_rate.to_string(),
            "BUFFER?" => config.buffer.to_string(),
            "RATE" | "CHANNELS" | "TRIGGER" => "OK".to_string(),
            "SAMPLES" => match argument.parse() {
                Ok(n) => {
                    samples = n;
                    "OK".to_string()
                }
                Err(_) => "ERR bad sample count".to_string(),
            },
            "START" => {
                polls_left = config.running_polls;
                stopped = false;
                "OK".to_string()
            }
            "CAPTURE_STATUS?" if stopped || polls_left == 0 => "COMPLETE".to_string(),
            "CAPTURE_STATUS?" => {
                polls_left -= 1;
                "RUNNING".to_string()
            }
            "DATA" => {
                let position = argument.parse().unwrap_or(0);
                let count = if stopped { samples / 2 } else { samples };
                (0..count)
                    .map(|index| if (config.level)(index, position) { "1" } else { "0" })
                    .collect::<Vec<_>>()
                    .join(",")
            }
            "STOP" => {
                stopped = true;
                "OK".to_string()
            }
            "BOOTLOADER" => "OK".to_string(),
            _ => "ERR unknown command".to_string(),
        };
        if writer.write_all(format!("{reply}\n").as_bytes()).await.is_err() {
            break;
        }
    }
}
