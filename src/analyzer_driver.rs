use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, watch};

use crate::capture_run::{CaptureError, CaptureHandle, CaptureOptions, CaptureRun, CaptureState, DeviceLink};
use crate::capture_session::{CaptureSession, DeviceInfo};
use crate::command_channel::CommandChannel;
use crate::multi_driver::MultiDriver;
use crate::protocol::ProtocolKind;
use crate::transport::{BoxedTransport, ConnectionParams, Transport, TransportError};
use crate::wire_structs::NetConfig;

const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(500);

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStatus {
    pub name: String,
    pub connected: bool,
    pub capturing: bool,
    pub state: CaptureState,
    pub info: Option<DeviceInfo>,
    /// Supply voltage as reported by the firmware, e.g. `3.30V`.
    pub voltage: Option<String>,
}

/// Connection and capture lifecycle shared by every driver variant.
///
/// `start_capture` only accepts or rejects a capture; the capture itself runs
/// in the background and reports through the returned [`CaptureHandle`]. It
/// has to be called from within a tokio runtime.
#[async_trait]
pub trait AnalyzerDriver: Send + Sync {
    async fn connect(&mut self) -> Result<DeviceInfo, CaptureError>;

    /// Stops a running capture first.
    async fn disconnect(&mut self) -> Result<(), CaptureError>;

    async fn status(&self) -> Result<DeviceStatus, CaptureError>;

    fn start_capture(&self, session: CaptureSession) -> Result<CaptureHandle, CaptureError>;

    /// Idempotent; succeeds when nothing is running. Takes effect while
    /// waiting for the trigger and while samples are read back.
    fn stop_capture(&self) -> Result<(), CaptureError>;

    async fn enter_bootloader(&mut self) -> Result<(), CaptureError>;

    fn device_info(&self) -> Option<DeviceInfo>;

    fn state(&self) -> watch::Receiver<CaptureState>;
}

enum LinkSource {
    Params(ConnectionParams),
    /// A transport opened by the caller; usable for a single connection.
    Transport(Mutex<Option<BoxedTransport>>),
}

/// Driver for one device reached over serial or network.
pub struct SingleDriver {
    name: String,
    source: LinkSource,
    protocol: ProtocolKind,
    options: CaptureOptions,
    retries: u32,
    link: Option<Arc<DeviceLink>>,
    state: Arc<watch::Sender<CaptureState>>,
    /// Stop switch of the running capture, if any.
    active: Arc<Mutex<Option<watch::Sender<bool>>>>,
}

impl std::fmt::Debug for SingleDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleDriver")
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("connected", &self.link.is_some())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl SingleDriver {
    pub fn new(params: ConnectionParams) -> Self {
        let options = CaptureOptions {
            command_timeout: params.timeout,
            ..CaptureOptions::default()
        };
        Self {
            name: params.to_string(),
            protocol: params.protocol,
            retries: params.retries,
            source: LinkSource::Params(params),
            options,
            link: None,
            state: Arc::new(watch::channel(CaptureState::Idle).0),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Drive a device over an already open byte stream.
    pub fn from_transport(name: &str, transport: impl Transport, protocol: ProtocolKind, options: CaptureOptions) -> Self {
        Self {
            name: name.to_string(),
            source: LinkSource::Transport(Mutex::new(Some(Box::new(transport)))),
            protocol,
            options,
            retries: 0,
            link: None,
            state: Arc::new(watch::channel(CaptureState::Idle).0),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_options(mut self, options: CaptureOptions) -> Self {
        self.options = options;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &CaptureOptions {
        &self.options
    }

    pub fn is_connected(&self) -> bool {
        self.link.as_ref().is_some_and(|link| !link.channel.is_closed())
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.active).is_some()
    }

    pub(crate) fn link(&self) -> Option<Arc<DeviceLink>> {
        self.link.clone()
    }

    fn enter(&self, state: CaptureState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("{}: {:?} -> {:?}", self.name, previous, state);
        }
    }

    fn connected_link(&self) -> Result<Arc<DeviceLink>, CaptureError> {
        self.link.clone().ok_or(CaptureError::NotConnected)
    }

    fn take_transport(slot: &Mutex<Option<BoxedTransport>>) -> Option<BoxedTransport> {
        lock(slot).take()
    }

    async fn open_link(&self) -> Result<DeviceLink, CaptureError> {
        let transport = match &self.source {
            LinkSource::Params(params) => params.open().await?,
            LinkSource::Transport(slot) => Self::take_transport(slot).ok_or_else(|| {
                CaptureError::Hardware("transport was consumed by an earlier connection".to_string())
            })?,
        };

        let channel = CommandChannel::start(&self.name, transport, self.options.late_response_grace);
        let protocol = self.protocol.build(&self.options);
        match protocol.handshake(&channel).await {
            Ok(info) => Ok(DeviceLink {
                channel,
                protocol,
                info,
                state: self.state.clone(),
            }),
            Err(e) => {
                channel.close();
                Err(CaptureError::Hardware(format!("Handshake with {} failed: {}", self.name, e)))
            }
        }
    }

    /// Store new access point credentials and address on the device.
    pub async fn configure_network(&self, config: &NetConfig) -> Result<(), CaptureError> {
        let link = self.connected_link()?;
        if self.is_capturing() {
            return Err(CaptureError::Busy);
        }
        link.protocol.configure_network(&link.channel, config).await?;
        log::info!("{}: network settings saved", self.name);
        Ok(())
    }
}

#[async_trait]
impl AnalyzerDriver for SingleDriver {
    async fn connect(&mut self) -> Result<DeviceInfo, CaptureError> {
        if let Some(link) = &self.link {
            return Ok(link.info.clone());
        }
        self.enter(CaptureState::Connecting);

        let attempts = self.retries + 1;
        let mut attempt = 1;
        loop {
            match self.open_link().await {
                Ok(link) => {
                    let info = link.info.clone();
                    log::info!("Connected to {} ({})", self.name, info.name);
                    self.link = Some(Arc::new(link));
                    self.enter(CaptureState::Idle);
                    break Ok(info);
                }
                Err(e) if attempt < attempts => {
                    log::debug!("Connecting to {} failed ({}), retrying {}/{}", self.name, e, attempt, attempts);
                    attempt += 1;
                    tokio::time::sleep(CONNECT_RETRY_DELAY).await;
                }
                Err(e) => {
                    log::warn!("Cannot connect to {}: {}", self.name, e);
                    self.enter(CaptureState::Failed);
                    break Err(e);
                }
            }
        }
    }

    async fn disconnect(&mut self) -> Result<(), CaptureError> {
        self.stop_capture()?;
        let mut state = self.state.subscribe();
        let wait = self.options.command_timeout * 3 + self.options.poll_interval;
        let settled = tokio::time::timeout(wait, state.wait_for(|s| !s.is_busy())).await.is_ok();
        if !settled {
            log::warn!("{}: capture did not wind down before disconnecting", self.name);
        }

        if let Some(link) = self.link.take() {
            link.channel.close();
            log::info!("Disconnected from {}", self.name);
        }
        self.enter(CaptureState::Idle);
        Ok(())
    }

    async fn status(&self) -> Result<DeviceStatus, CaptureError> {
        let state = *self.state.borrow();
        let capturing = self.is_capturing();
        // Queries would interleave with the capture traffic.
        let voltage = match &self.link {
            Some(link) if !capturing => match link.protocol.voltage(&link.channel).await {
                Ok(voltage) => voltage,
                Err(e) => {
                    log::debug!("{}: voltage query failed: {}", self.name, e);
                    None
                }
            },
            _ => None,
        };
        Ok(DeviceStatus {
            name: self.name.clone(),
            connected: self.is_connected(),
            capturing,
            state,
            info: self.device_info(),
            voltage,
        })
    }

    fn start_capture(&self, session: CaptureSession) -> Result<CaptureHandle, CaptureError> {
        let link = self.connected_link()?;
        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(CaptureError::Busy);
        }
        session.validate(&link.info)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = oneshot::channel();
        link.enter(CaptureState::Configuring);
        let run = CaptureRun::new(link, self.options.clone(), stop_rx);
        let slot = self.active.clone();
        tokio::spawn(async move {
            let outcome = run.run(session).await;
            lock(&slot).take();
            let _ = done_tx.send(outcome);
        });
        *active = Some(stop_tx);
        Ok(CaptureHandle::new(done_rx))
    }

    fn stop_capture(&self) -> Result<(), CaptureError> {
        if let Some(stop) = lock(&self.active).as_ref() {
            if !stop.send_replace(true) {
                log::info!("{}: stopping capture", self.name);
            }
        }
        Ok(())
    }

    async fn enter_bootloader(&mut self) -> Result<(), CaptureError> {
        let link = self.connected_link()?;
        if self.is_capturing() {
            return Err(CaptureError::Busy);
        }
        link.protocol.enter_bootloader(&link.channel).await?;
        log::info!("{} restarts into its bootloader", self.name);
        link.channel.close();
        self.link = None;
        self.enter(CaptureState::Idle);
        Ok(())
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.link.as_ref().map(|link| link.info.clone())
    }

    fn state(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }
}

/// Driver chosen from the connection parameters.
#[derive(Debug)]
pub enum Driver {
    Serial(SingleDriver),
    Network(SingleDriver),
    Multi(MultiDriver),
}

impl Driver {
    pub fn from_params(params: ConnectionParams) -> Self {
        if params.is_network() {
            Self::Network(SingleDriver::new(params))
        } else {
            Self::Serial(SingleDriver::new(params))
        }
    }

    pub fn multi(params: Vec<ConnectionParams>) -> Self {
        Self::Multi(MultiDriver::new(params.into_iter().map(SingleDriver::new).collect()))
    }

    fn inner(&self) -> &dyn AnalyzerDriver {
        match self {
            Self::Serial(driver) | Self::Network(driver) => driver,
            Self::Multi(driver) => driver,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn AnalyzerDriver {
        match self {
            Self::Serial(driver) | Self::Network(driver) => driver,
            Self::Multi(driver) => driver,
        }
    }
}

/// A single connection string, or several separated by commas for a
/// multi-device setup.
impl FromStr for Driver {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let params = s
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<ConnectionParams>, _>>()?;
        match <[ConnectionParams; 1]>::try_from(params) {
            Ok([single]) => Ok(Self::from_params(single)),
            Err(params) => Ok(Self::multi(params)),
        }
    }
}

#[async_trait]
impl AnalyzerDriver for Driver {
    async fn connect(&mut self) -> Result<DeviceInfo, CaptureError> {
        self.inner_mut().connect().await
    }

    async fn disconnect(&mut self) -> Result<(), CaptureError> {
        self.inner_mut().disconnect().await
    }

    async fn status(&self) -> Result<DeviceStatus, CaptureError> {
        self.inner().status().await
    }

    fn start_capture(&self, session: CaptureSession) -> Result<CaptureHandle, CaptureError> {
        self.inner().start_capture(session)
    }

    fn stop_capture(&self) -> Result<(), CaptureError> {
        self.inner().stop_capture()
    }

    async fn enter_bootloader(&mut self) -> Result<(), CaptureError> {
        self.inner_mut().enter_bootloader().await
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        self.inner().device_info()
    }

    fn state(&self) -> watch::Receiver<CaptureState> {
        self.inner().state()
    }
}
