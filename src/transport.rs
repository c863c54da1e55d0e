use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serialport::SerialPortType;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_serial::{SerialPort, SerialPortBuilderExt};

use crate::protocol::ProtocolKind;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_NETWORK_PORT: u16 = 4045;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// USB vendor/product ids of analyzer firmwares that enumerate as CDC serial.
const KNOWN_USB_IDS: [(u16, u16); 3] = [(0x1209, 0x3020), (0x2E8A, 0x000A), (0x2E8A, 0x0009)];

/// Byte stream to a device.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Serial port error: {0}")]
    SerialPort(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid connection string '{0}'")]
    InvalidConnectionString(String),

    #[error("Timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout { endpoint: String, timeout: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Serial { port: String, baud_rate: u32 },
    Network { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial { port, baud_rate } => write!(f, "{port}@{baud_rate}"),
            Self::Network { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

/// Where and how to reach one device. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub endpoint: Endpoint,
    pub protocol: ProtocolKind,
    /// Used for opening the link and as the default command timeout.
    pub timeout: Duration,
    /// Extra connect attempts after the first one failed.
    pub retries: u32,
}

impl ConnectionParams {
    pub fn serial(port: &str) -> Self {
        Self::new(Endpoint::Serial {
            port: port.to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        })
    }

    pub fn network(host: &str, port: u16) -> Self {
        Self::new(Endpoint::Network {
            host: host.to_string(),
            port,
        })
    }

    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            protocol: ProtocolKind::Binary,
            timeout: DEFAULT_TIMEOUT,
            retries: 0,
        }
    }

    pub fn with_protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn is_network(&self) -> bool {
        matches!(self.endpoint, Endpoint::Network { .. })
    }

    pub async fn open(&self) -> Result<BoxedTransport, TransportError> {
        match &self.endpoint {
            Endpoint::Serial { port, baud_rate } => {
                log::debug!("Opening serial port {} at {} baud", port, baud_rate);
                let mut stream = tokio_serial::new(port, *baud_rate)
                    .timeout(self.timeout)
                    .open_native_async()?;
                // USB CDC firmwares only transmit once DTR is asserted.
                if let Err(e) = stream.write_data_terminal_ready(true) {
                    log::warn!("Cannot assert DTR on {}: {}", port, e);
                }
                Ok(Box::new(stream))
            }
            Endpoint::Network { host, port } => {
                log::debug!("Connecting to {}:{}", host, port);
                let stream = tokio::time::timeout(self.timeout, TcpStream::connect((host.as_str(), *port)))
                    .await
                    .map_err(|_| TransportError::ConnectTimeout {
                        endpoint: self.endpoint.to_string(),
                        timeout: self.timeout,
                    })??;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
        }
    }
}

impl fmt::Display for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.endpoint.fmt(f)?;
        if self.protocol != ProtocolKind::default() {
            write!(f, "?{}", self.protocol)?;
        }
        Ok(())
    }
}

/// Accepts `/dev/ttyACM0`, `COM3`, `/dev/ttyACM0@921600`,
/// `tcp://192.168.4.1:4045`, `tcp://192.168.4.1` and `192.168.4.1:4045`.
/// A `?text` or `?binary` suffix picks the device protocol.
impl FromStr for ConnectionParams {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || TransportError::InvalidConnectionString(s.to_string());
        match s.rsplit_once('?') {
            Some((endpoint, protocol)) => {
                let protocol: ProtocolKind = protocol.parse().map_err(|_| invalid())?;
                Ok(Self::parse_endpoint(endpoint).ok_or_else(invalid)?.with_protocol(protocol))
            }
            None => Self::parse_endpoint(s).ok_or_else(invalid),
        }
    }
}

impl ConnectionParams {
    fn parse_endpoint(s: &str) -> Option<Self> {
        if s.is_empty() {
            return None;
        }

        if let Some(address) = s.strip_prefix("tcp://") {
            return match address.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() => Some(Self::network(host, port.parse().ok()?)),
                Some(_) => None,
                None if !address.is_empty() => Some(Self::network(address, DEFAULT_NETWORK_PORT)),
                None => None,
            };
        }

        if let Some((port, baud)) = s.rsplit_once('@') {
            if port.is_empty() {
                return None;
            }
            return Some(Self::new(Endpoint::Serial {
                port: port.to_string(),
                baud_rate: baud.parse().ok()?,
            }));
        }

        if !s.starts_with('/') {
            if let Some((host, port)) = s.rsplit_once(':') {
                if let Ok(port) = port.parse() {
                    return Some(Self::network(host, port));
                }
            }
        }

        Some(Self::serial(s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzerPort {
    pub name: String,
    pub port: String,
}

fn is_known_analyzer(vid: u16, pid: u16) -> bool {
    KNOWN_USB_IDS.iter().any(|&(v, p)| v == vid && p == pid)
}

/// USB serial ports that look like analyzers.
pub fn available_devices() -> Result<Vec<AnalyzerPort>, TransportError> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(info) if is_known_analyzer(info.vid, info.pid) => Some(AnalyzerPort {
                name: info.product.unwrap_or_else(|| "Logic Analyzer".to_string()),
                port: port.port_name,
            }),
            _ => None,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_serial_strings() {
        let params: ConnectionParams = "/dev/ttyACM0".parse().unwrap();
        assert_eq!(
            params.endpoint,
            Endpoint::Serial {
                port: "/dev/ttyACM0".to_string(),
                baud_rate: DEFAULT_BAUD_RATE
            }
        );
        assert_eq!(params.protocol, ProtocolKind::Binary);

        let params: ConnectionParams = "COM3@921600".parse().unwrap();
        assert_eq!(
            params.endpoint,
            Endpoint::Serial {
                port: "COM3".to_string(),
                baud_rate: 921_600
            }
        );
        assert!(!params.is_network());
    }

    #[test]
    fn test_parse_network_strings() {
        let params: ConnectionParams = "tcp://192.168.4.1:5000".parse().unwrap();
        assert_eq!(
            params.endpoint,
            Endpoint::Network {
                host: "192.168.4.1".to_string(),
                port: 5000
            }
        );

        let params: ConnectionParams = "tcp://analyzer.local".parse().unwrap();
        assert_eq!(params.to_string(), "tcp://analyzer.local:4045");

        let params: ConnectionParams = "10.0.0.7:4045".parse().unwrap();
        assert!(params.is_network());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ConnectionParams>().is_err());
        assert!("tcp://host:notaport".parse::<ConnectionParams>().is_err());
        assert!("/dev/ttyACM0@fast".parse::<ConnectionParams>().is_err());
        assert!("tcp://:4045".parse::<ConnectionParams>().is_err());
    }

    #[test]
    fn test_builder() {
        let params = ConnectionParams::serial("/dev/ttyUSB0")
            .with_protocol(ProtocolKind::Text)
            .with_timeout(Duration::from_millis(250))
            .with_retries(3);
        assert_eq!(params.protocol, ProtocolKind::Text);
        assert_eq!(params.timeout, Duration::from_millis(250));
        assert_eq!(params.retries, 3);
    }

    #[tokio::test]
    async fn test_network_connect_timeout_or_refused() {
        // Nothing listens on port 1 of the loopback interface.
        let params = ConnectionParams::network("127.0.0.1", 1).with_timeout(Duration::from_millis(200));
        assert!(params.open().await.is_err());
    }

    #[test]
    fn test_known_analyzer_ids() {
        assert!(is_known_analyzer(0x1209, 0x3020));
        assert!(is_known_analyzer(0x2E8A, 0x000A));
        assert!(is_known_analyzer(0x2E8A, 0x0009));
        assert!(!is_known_analyzer(0x2E8A, 0x0003));
        assert!(!is_known_analyzer(0x0403, 0x6001));
    }

    #[test]
    fn test_protocol_suffix() {
        let params: ConnectionParams = "/dev/ttyUSB0@57600?text".parse().unwrap();
        assert_eq!(params.protocol, ProtocolKind::Text);
        assert_eq!(
            params.endpoint,
            Endpoint::Serial {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 57_600
            }
        );
        assert_eq!(params.to_string().parse::<ConnectionParams>().unwrap(), params);

        let params: ConnectionParams = "tcp://10.0.0.2:4045?binary".parse().unwrap();
        assert_eq!(params.protocol, ProtocolKind::Binary);
        assert!(params.is_network());

        assert!("/dev/ttyUSB0?morse".parse::<ConnectionParams>().is_err());
        assert!("?text".parse::<ConnectionParams>().is_err());
    }
}
