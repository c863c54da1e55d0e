//! One capture from configuration to the final outcome.
//!
//! A `CaptureRun` walks `Configuring -> Arming -> Capturing -> Transferring`
//! and ends in `Completed` or `Failed`. The run owns the [`CaptureSession`]
//! while it is in progress and hands it back inside the [`CaptureOutcome`],
//! which is delivered exactly once through a [`CaptureHandle`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::instrument;

use crate::capture_session::{CaptureSession, ConfigError, DeviceInfo};
use crate::command_channel::{CommandChannel, DEFAULT_LATE_RESPONSE_GRACE};
use crate::output_packet::PacketError;
use crate::protocol::{CaptureStatus, DeviceProtocol};
use crate::transport::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureState {
    #[default]
    Idle,
    Connecting,
    Configuring,
    Arming,
    Capturing,
    Transferring,
    Completed,
    Failed,
}

impl CaptureState {
    /// A capture is between acceptance and its terminal state.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Configuring | Self::Arming | Self::Capturing | Self::Transferring
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Coarse error classes reported to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureErrorCode {
    None,
    Busy,
    HardwareError,
    CommandTimeout,
    InvalidStruct,
    InvalidConfiguration,
    UnexpectedError,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    /// Position of the device in the multi-device list.
    pub device: usize,
    pub error: CaptureError,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    #[error("A capture is already running")]
    Busy,

    #[error("Device is not connected")]
    NotConnected,

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("Device did not answer within {0:?}")]
    CommandTimeout(Duration),

    #[error("Invalid struct: {0}")]
    InvalidStruct(#[from] PacketError),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Capture stopped")]
    Stopped,

    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("{} of {} devices failed", .failures.len(), .devices)]
    Devices { devices: usize, failures: Vec<DeviceFailure> },
}

impl CaptureError {
    pub fn code(&self) -> CaptureErrorCode {
        match self {
            Self::Busy => CaptureErrorCode::Busy,
            Self::NotConnected | Self::Hardware(_) | Self::Unsupported(_) => CaptureErrorCode::HardwareError,
            Self::CommandTimeout(_) => CaptureErrorCode::CommandTimeout,
            Self::InvalidStruct(_) => CaptureErrorCode::InvalidStruct,
            Self::InvalidConfiguration(_) => CaptureErrorCode::InvalidConfiguration,
            Self::Stopped | Self::Unexpected(_) => CaptureErrorCode::UnexpectedError,
            Self::Devices { failures, .. } => failures
                .first()
                .map_or(CaptureErrorCode::UnexpectedError, |f| f.error.code()),
        }
    }
}

impl From<TransportError> for CaptureError {
    fn from(error: TransportError) -> Self {
        Self::Hardware(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    /// Upper bound for noticing a stop request or a finished capture.
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    /// Budget for reading the sample data of one device.
    pub transfer_timeout: Duration,
    /// How long a timed-out command keeps its slot for a late answer.
    pub late_response_grace: Duration,
    /// Read back what the device has when a capture is stopped, if the
    /// protocol allows it. Otherwise a stopped capture fails.
    pub stop_yields_partial: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            command_timeout: Duration::from_secs(1),
            transfer_timeout: Duration::from_secs(30),
            late_response_grace: DEFAULT_LATE_RESPONSE_GRACE,
            stop_yields_partial: false,
        }
    }
}

/// Terminal result of a capture. `session` is always handed back; on failure
/// it holds whatever samples were read.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub success: bool,
    pub session: CaptureSession,
    pub error: Option<CaptureError>,
}

impl CaptureOutcome {
    pub(crate) fn from_result(session: CaptureSession, result: Result<(), CaptureError>) -> Self {
        match result {
            Ok(()) => Self {
                success: true,
                session,
                error: None,
            },
            Err(error) => Self {
                success: false,
                session,
                error: Some(error),
            },
        }
    }

    pub fn code(&self) -> CaptureErrorCode {
        self.error.as_ref().map_or(CaptureErrorCode::None, CaptureError::code)
    }
}

/// Resolves once with the outcome of an accepted capture.
#[derive(Debug)]
pub struct CaptureHandle {
    outcome: oneshot::Receiver<CaptureOutcome>,
}

impl CaptureHandle {
    pub(crate) fn new(outcome: oneshot::Receiver<CaptureOutcome>) -> Self {
        Self { outcome }
    }

    pub async fn wait(self) -> Result<CaptureOutcome, CaptureError> {
        self.outcome
            .await
            .map_err(|_| CaptureError::Unexpected("capture task ended without an outcome".to_string()))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`; the handle stays
    /// usable after a timeout.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> Result<CaptureOutcome, CaptureError> {
        match tokio::time::timeout(timeout, &mut self.outcome).await {
            Ok(Ok(outcome)) => Ok(outcome),
            Ok(Err(_)) => Err(CaptureError::Unexpected(
                "capture task ended without an outcome".to_string(),
            )),
            Err(_) => Err(CaptureError::CommandTimeout(timeout)),
        }
    }
}

/// Everything a capture needs to talk to one connected device.
#[derive(Debug)]
pub(crate) struct DeviceLink {
    pub channel: CommandChannel,
    pub protocol: Arc<dyn DeviceProtocol>,
    pub info: DeviceInfo,
    pub state: Arc<watch::Sender<CaptureState>>,
}

impl DeviceLink {
    pub fn name(&self) -> &str {
        self.channel.name()
    }

    pub fn enter(&self, state: CaptureState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("{}: {:?} -> {:?}", self.name(), previous, state);
        }
    }
}

/// Resolves once a stop was requested or the requesting side went away.
pub(crate) async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|&stop| stop).await;
}

pub(crate) struct CaptureRun {
    link: Arc<DeviceLink>,
    options: CaptureOptions,
    stop: watch::Receiver<bool>,
    started: bool,
}

impl CaptureRun {
    pub fn new(link: Arc<DeviceLink>, options: CaptureOptions, stop: watch::Receiver<bool>) -> Self {
        Self {
            link,
            options,
            stop,
            started: false,
        }
    }

    fn stop_pending(&self) -> bool {
        *self.stop.borrow()
    }

    /// Validate the session and push its configuration to the device.
    #[instrument(skip_all, fields(device = %self.link.name()))]
    pub async fn configure(&self, session: &CaptureSession) -> Result<Vec<u8>, CaptureError> {
        self.link.enter(CaptureState::Configuring);
        if self.stop_pending() {
            return Err(CaptureError::Stopped);
        }
        session.validate(&self.link.info)?;
        self.link.protocol.configure(&self.link.channel, session).await
    }

    #[instrument(skip_all, fields(device = %self.link.name()))]
    pub async fn start(&mut self, start_command: Vec<u8>) -> Result<(), CaptureError> {
        self.link.enter(CaptureState::Arming);
        if self.stop_pending() {
            return Err(CaptureError::Stopped);
        }
        // Once the command is on the wire the device may be capturing, even
        // if the acknowledgement gets lost.
        self.started = true;
        self.link.protocol.start(&self.link.channel, start_command).await?;
        self.link.enter(CaptureState::Capturing);
        log::info!("{}: capture started", self.link.name());
        Ok(())
    }

    /// Poll until the device reports a result. A stop request ends the wait
    /// within one poll interval.
    async fn monitor(&mut self) -> Result<Option<u32>, CaptureError> {
        let interval = self.options.poll_interval;
        loop {
            if self.stop_pending() {
                return Err(CaptureError::Stopped);
            }
            let status = tokio::select! {
                biased;
                () = stop_requested(&mut self.stop) => return Err(CaptureError::Stopped),
                status = self.link.protocol.poll(&self.link.channel, interval) => status?,
            };
            match status {
                CaptureStatus::Running => {
                    let pause = self.link.protocol.poll_pause(interval);
                    if !pause.is_zero() {
                        tokio::select! {
                            biased;
                            () = stop_requested(&mut self.stop) => return Err(CaptureError::Stopped),
                            () = tokio::time::sleep(pause) => {}
                        }
                    }
                }
                CaptureStatus::Complete { sample_count } => return Ok(sample_count),
                CaptureStatus::Failed(reason) => return Err(CaptureError::Hardware(reason)),
            }
        }
    }

    async fn transfer(&self, session: &mut CaptureSession, sample_count: Option<u32>) -> Result<(), CaptureError> {
        self.link.enter(CaptureState::Transferring);
        session.clear_samples();
        self.link
            .protocol
            .transfer(&self.link.channel, session, sample_count)
            .await
    }

    /// Wait for the started capture and read its samples. A stop request also
    /// cuts a transfer short.
    #[instrument(skip_all, fields(device = %self.link.name()))]
    pub async fn complete(&mut self, session: &mut CaptureSession) -> Result<(), CaptureError> {
        let sample_count = self.monitor().await?;
        let mut stop = self.stop.clone();
        tokio::select! {
            biased;
            () = stop_requested(&mut stop) => Err(CaptureError::Stopped),
            result = self.transfer(session, sample_count) => result,
        }
    }

    /// Settle the terminal state. Stopped captures are aborted on the device
    /// and, where allowed, still return the samples recorded so far.
    pub async fn conclude(
        &self,
        session: &mut CaptureSession,
        result: Result<(), CaptureError>,
    ) -> Result<(), CaptureError> {
        let result = match result {
            Ok(()) => Ok(()),
            Err(error) => {
                if self.started {
                    if let Err(e) = self.link.protocol.stop(&self.link.channel).await {
                        log::warn!("{}: stopping the device failed: {}", self.link.name(), e);
                    }
                }
                let partial = error == CaptureError::Stopped
                    && self.started
                    && self.options.stop_yields_partial
                    && self.link.protocol.supports_partial_transfer();
                if partial {
                    log::info!("{}: capture stopped, reading partial data", self.link.name());
                    self.transfer(session, None).await
                } else {
                    Err(error)
                }
            }
        };

        match &result {
            Ok(()) => self.link.enter(CaptureState::Completed),
            Err(e) => {
                log::warn!("{}: capture failed: {}", self.link.name(), e);
                self.link.enter(CaptureState::Failed);
            }
        }
        result
    }

    pub async fn run(mut self, mut session: CaptureSession) -> CaptureOutcome {
        let result = match self.configure(&session).await {
            Ok(start_command) => match self.start(start_command).await {
                Ok(()) => self.complete(&mut session).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let result = self.conclude(&mut session, result).await;
        CaptureOutcome::from_result(session, result)
    }
}
