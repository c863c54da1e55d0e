//! Several analyzers combined into one logical device.
//!
//! Logical channel numbers are laid out device after device in connection
//! order: with two 24-channel analyzers, channels `0..24` live on the first
//! and `24..48` on the second. The device owning the trigger channel leads;
//! the others are armed on their external trigger input and started first so
//! they are waiting when the leader fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{oneshot, watch};

use crate::analyzer_driver::{lock, AnalyzerDriver, DeviceStatus, SingleDriver};
use crate::capture_run::{
    CaptureError, CaptureHandle, CaptureOutcome, CaptureRun, CaptureState, DeviceFailure,
};
use crate::capture_session::{
    CaptureSession, ConfigError, DeviceInfo, TriggerType, EXT_TRIGGER_CHANNEL, MAX_CHANNELS_PER_DEVICE,
};

/// Logical channels served by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub first: u8,
    pub count: u8,
}

impl ChannelRange {
    pub fn contains(&self, channel: u8) -> bool {
        channel >= self.first && u16::from(channel) < u16::from(self.first) + u16::from(self.count)
    }
}

/// The part of a logical capture one device performs.
#[derive(Debug, Clone)]
pub(crate) struct SubCapture {
    pub device: usize,
    pub session: CaptureSession,
    /// Index into the logical channel list for every local channel.
    pub positions: Vec<usize>,
    pub leader: bool,
}

fn total_channels(ranges: &[ChannelRange]) -> u8 {
    let total: u16 = ranges.iter().map(|r| u16::from(r.count)).sum();
    total.min(u16::from(u8::MAX)) as u8
}

/// Split a logical session into per-device sessions with local channel
/// numbers.
pub(crate) fn partition(session: &CaptureSession, ranges: &[ChannelRange]) -> Result<Vec<SubCapture>, ConfigError> {
    let available = total_channels(ranges);
    session.validate_channel_set(available)?;
    if session.trigger_type == TriggerType::Blast {
        return Err(ConfigError::BlastAcrossDevices);
    }

    let leader = ranges
        .iter()
        .position(|range| range.contains(session.trigger_channel))
        .ok_or(ConfigError::TriggerChannelOutOfRange {
            channel: session.trigger_channel,
            available,
        })?;
    let leader_range = ranges[leader];
    if session.trigger_type.max_pattern_bits().is_some() {
        let end = u16::from(session.trigger_channel) + u16::from(session.trigger_bit_count);
        if end > u16::from(leader_range.first) + u16::from(leader_range.count) {
            return Err(ConfigError::PatternOutOfRange {
                first: session.trigger_channel,
                bits: session.trigger_bit_count,
            });
        }
    }

    let mut parts = Vec::new();
    for (device, range) in ranges.iter().enumerate() {
        let positions: Vec<usize> = session
            .capture_channels
            .iter()
            .enumerate()
            .filter(|(_, channel)| range.contains(channel.channel_number))
            .map(|(position, _)| position)
            .collect();
        let is_leader = device == leader;
        if positions.is_empty() {
            if is_leader {
                return Err(ConfigError::TriggerDeviceIdle { device });
            }
            continue;
        }

        let mut sub = CaptureSession {
            capture_channels: Vec::new(),
            burst_timestamps: Vec::new(),
            ..session.clone()
        };
        sub.capture_channels = positions
            .iter()
            .map(|&position| {
                let mut channel = session.capture_channels[position].clone();
                channel.channel_number -= range.first;
                channel.samples.clear();
                channel
            })
            .collect();
        sub.capture_mode = sub.required_mode();

        if is_leader {
            sub.trigger_channel -= range.first;
        } else {
            sub.trigger_type = TriggerType::Edge;
            sub.trigger_channel = EXT_TRIGGER_CHANNEL;
            sub.trigger_inverted = false;
            sub.trigger_pattern = 0;
            sub.trigger_bit_count = 0;
            sub.measure_bursts = false;
        }

        parts.push(SubCapture {
            device,
            session: sub,
            positions,
            leader: is_leader,
        });
    }
    Ok(parts)
}

#[derive(Debug)]
pub struct MultiDriver {
    devices: Vec<SingleDriver>,
    ranges: Vec<ChannelRange>,
    state: Arc<watch::Sender<CaptureState>>,
    /// Stop switch shared with the running capture, which also flips it to
    /// halt the remaining devices once one of them failed.
    active: Arc<Mutex<Option<Arc<watch::Sender<bool>>>>>,
}

impl MultiDriver {
    pub fn new(devices: Vec<SingleDriver>) -> Self {
        Self {
            devices,
            ranges: Vec::new(),
            state: Arc::new(watch::channel(CaptureState::Idle).0),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn devices(&self) -> &[SingleDriver] {
        &self.devices
    }

    /// Known once connected.
    pub fn channel_ranges(&self) -> &[ChannelRange] {
        &self.ranges
    }

    pub fn is_capturing(&self) -> bool {
        lock(&self.active).is_some()
    }

    fn enter(&self, state: CaptureState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("multi: {:?} -> {:?}", previous, state);
        }
    }

    fn name(&self) -> String {
        self.devices
            .iter()
            .map(SingleDriver::name)
            .collect::<Vec<_>>()
            .join(" + ")
    }

    pub async fn device_statuses(&self) -> Vec<Result<DeviceStatus, CaptureError>> {
        join_all(self.devices.iter().map(|device| device.status())).await
    }

    async fn disconnect_all(&mut self) {
        for device in &mut self.devices {
            if let Err(e) = device.disconnect().await {
                log::warn!("Disconnecting {} failed: {}", device.name(), e);
            }
        }
        self.ranges.clear();
    }
}

async fn run_multi(
    mut runs: Vec<(CaptureRun, SubCapture)>,
    mut session: CaptureSession,
    state: Arc<watch::Sender<CaptureState>>,
    halt: Arc<watch::Sender<bool>>,
    device_count: usize,
) -> CaptureOutcome {
    session.clear_samples();
    let mut early: Vec<Option<CaptureError>> = vec![None; runs.len()];

    state.send_replace(CaptureState::Configuring);
    let configured = join_all(runs.iter().map(|(run, part)| run.configure(&part.session))).await;
    let mut commands = Vec::with_capacity(runs.len());
    for (index, result) in configured.into_iter().enumerate() {
        match result {
            Ok(command) => commands.push(command),
            Err(error) => {
                early[index] = Some(error);
                commands.push(Vec::new());
            }
        }
    }

    let mut aborted = early.iter().any(Option::is_some);
    if !aborted {
        state.send_replace(CaptureState::Arming);
        let mut order: Vec<usize> = (0..runs.len()).collect();
        order.sort_by_key(|&index| runs[index].1.leader);
        for index in order {
            let command = std::mem::take(&mut commands[index]);
            if let Err(error) = runs[index].0.start(command).await {
                early[index] = Some(error);
                aborted = true;
                break;
            }
        }
    }

    if !aborted {
        state.send_replace(CaptureState::Capturing);
    }
    // Followers wait for an external trigger that never comes once another
    // device failed, so the first real failure halts everyone else.
    let halted = AtomicBool::new(false);
    let (halt, halted) = (&*halt, &halted);
    let results = join_all(runs.iter_mut().zip(&early).map(|((run, part), early)| async move {
        let result = match early {
            Some(error) => Err(error.clone()),
            None if aborted => Err(CaptureError::Stopped),
            None => run.complete(&mut part.session).await,
        };
        if let Err(error) = &result {
            if early.is_none() && *error != CaptureError::Stopped && !halt.send_replace(true) {
                log::warn!("multi: device {} failed ({}), halting the others", part.device, error);
                halted.store(true, Ordering::SeqCst);
            }
        }
        run.conclude(&mut part.session, result).await
    }))
    .await;
    let halted = halted.load(Ordering::SeqCst);

    let mut failures = Vec::new();
    for ((index, result), (_, part)) in results.into_iter().enumerate().zip(&runs) {
        if let Err(error) = result {
            // Devices halted because another one failed are not failures.
            let halted_by_other = (aborted && early[index].is_none()) || (halted && error == CaptureError::Stopped);
            if !halted_by_other {
                failures.push(DeviceFailure {
                    device: part.device,
                    error,
                });
            }
        }
    }

    for (_, mut part) in runs {
        for (local, &logical) in part.positions.iter().enumerate() {
            session.capture_channels[logical].samples = std::mem::take(&mut part.session.capture_channels[local].samples);
        }
        if part.leader {
            session.burst_timestamps = part.session.burst_timestamps;
        }
    }

    let result = if failures.is_empty() {
        Ok(())
    } else if failures.iter().all(|f| f.error == CaptureError::Stopped) {
        Err(CaptureError::Stopped)
    } else {
        Err(CaptureError::Devices {
            devices: device_count,
            failures,
        })
    };
    match &result {
        Ok(()) => {
            log::info!("multi: capture completed on {} devices", device_count);
            state.send_replace(CaptureState::Completed);
        }
        Err(e) => {
            log::warn!("multi: capture failed: {}", e);
            state.send_replace(CaptureState::Failed);
        }
    }
    CaptureOutcome::from_result(session, result)
}

#[async_trait]
impl AnalyzerDriver for MultiDriver {
    async fn connect(&mut self) -> Result<DeviceInfo, CaptureError> {
        if self.devices.is_empty() {
            return Err(CaptureError::Hardware("No devices configured".to_string()));
        }
        self.enter(CaptureState::Connecting);

        let results = join_all(self.devices.iter_mut().map(|device| device.connect())).await;
        let mut ranges = Vec::with_capacity(results.len());
        let mut failures = Vec::new();
        let mut first = 0u8;
        for (device, result) in results.into_iter().enumerate() {
            match result {
                Ok(info) => {
                    let count = info.channels.min(MAX_CHANNELS_PER_DEVICE);
                    ranges.push(ChannelRange { first, count });
                    first = first.saturating_add(count);
                }
                Err(error) => failures.push(DeviceFailure { device, error }),
            }
        }

        if !failures.is_empty() {
            self.disconnect_all().await;
            self.enter(CaptureState::Failed);
            return Err(CaptureError::Devices {
                devices: self.devices.len(),
                failures,
            });
        }

        self.ranges = ranges;
        log::info!("multi: connected {} devices: {:?}", self.devices.len(), self.ranges);
        self.enter(CaptureState::Idle);
        self.device_info()
            .ok_or_else(|| CaptureError::Unexpected("device information missing after connect".to_string()))
    }

    async fn disconnect(&mut self) -> Result<(), CaptureError> {
        self.stop_capture()?;
        let mut state = self.state.subscribe();
        let settled = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            state.wait_for(|s| !s.is_busy()),
        )
        .await
        .is_ok();
        if !settled {
            log::warn!("multi: capture did not wind down before disconnecting");
        }
        self.disconnect_all().await;
        self.enter(CaptureState::Idle);
        Ok(())
    }

    async fn status(&self) -> Result<DeviceStatus, CaptureError> {
        Ok(DeviceStatus {
            name: self.name(),
            connected: !self.ranges.is_empty() && self.devices.iter().all(SingleDriver::is_connected),
            capturing: self.is_capturing(),
            state: *self.state.borrow(),
            info: self.device_info(),
            voltage: None,
        })
    }

    fn start_capture(&self, session: CaptureSession) -> Result<CaptureHandle, CaptureError> {
        let links = self
            .devices
            .iter()
            .map(|device| device.link().ok_or(CaptureError::NotConnected))
            .collect::<Result<Vec<_>, _>>()?;
        if links.is_empty() || self.ranges.len() != links.len() {
            return Err(CaptureError::NotConnected);
        }

        let mut active = lock(&self.active);
        if active.is_some() {
            return Err(CaptureError::Busy);
        }
        let parts = partition(&session, &self.ranges)?;
        for part in &parts {
            part.session.validate(&links[part.device].info)?;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let (done_tx, done_rx) = oneshot::channel();
        let runs: Vec<(CaptureRun, SubCapture)> = parts
            .into_iter()
            .map(|part| {
                let options = self.devices[part.device].options().clone();
                let run = CaptureRun::new(links[part.device].clone(), options, stop_rx.clone());
                (run, part)
            })
            .collect();
        log::info!(
            "multi: starting capture on {} of {} devices",
            runs.len(),
            self.devices.len()
        );

        self.enter(CaptureState::Configuring);
        let slot = self.active.clone();
        let state = self.state.clone();
        let device_count = self.devices.len();
        let halt = stop_tx.clone();
        tokio::spawn(async move {
            let outcome = run_multi(runs, session, state, halt, device_count).await;
            lock(&slot).take();
            let _ = done_tx.send(outcome);
        });
        *active = Some(stop_tx);
        Ok(CaptureHandle::new(done_rx))
    }

    fn stop_capture(&self) -> Result<(), CaptureError> {
        if let Some(stop) = lock(&self.active).as_ref() {
            if !stop.send_replace(true) {
                log::info!("multi: stopping capture");
            }
        }
        Ok(())
    }

    async fn enter_bootloader(&mut self) -> Result<(), CaptureError> {
        if self.is_capturing() {
            return Err(CaptureError::Busy);
        }
        for device in &mut self.devices {
            device.enter_bootloader().await?;
        }
        self.ranges.clear();
        self.enter(CaptureState::Idle);
        Ok(())
    }

    /// Combined view: summed channels, the slowest device's limits.
    fn device_info(&self) -> Option<DeviceInfo> {
        if self.ranges.is_empty() {
            return None;
        }
        let infos = self
            .devices
            .iter()
            .map(SingleDriver::device_info)
            .collect::<Option<Vec<_>>>()?;
        Some(DeviceInfo {
            name: infos.iter().map(|i| i.name.as_str()).collect::<Vec<_>>().join(" + "),
            channels: total_channels(&self.ranges),
            max_frequency: infos.iter().map(|i| i.max_frequency).min()?,
            blast_frequency: infos.iter().map(|i| i.blast_frequency).min()?,
            buffer_size: infos.iter().map(|i| i.buffer_size).min()?,
        })
    }

    fn state(&self) -> watch::Receiver<CaptureState> {
        self.state.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::capture_run::{CaptureErrorCode, CaptureOptions};
    use crate::protocol::ProtocolKind;
    use crate::test_device::{spawn_binary_device, BinaryDeviceConfig};
    use crate::trigger_config::{BitState, EdgeTrigger, PatternTrigger};

    fn ranges() -> Vec<ChannelRange> {
        vec![ChannelRange { first: 0, count: 24 }, ChannelRange { first: 24, count: 24 }]
    }

    fn simulated(configs: Vec<(BinaryDeviceConfig, CaptureOptions)>) -> MultiDriver {
        MultiDriver::new(
            configs
                .into_iter()
                .enumerate()
                .map(|(index, (config, options))| {
                    SingleDriver::from_transport(
                        &format!("sim{index}"),
                        spawn_binary_device(config),
                        ProtocolKind::Binary,
                        options,
                    )
                })
                .collect(),
        )
    }

    fn constant_device(position: usize) -> BinaryDeviceConfig {
        let level: fn(usize, usize) -> bool = match position {
            0 => |_, p| p == 0,
            _ => |_, p| p == 1,
        };
        BinaryDeviceConfig {
            level,
            ..Default::default()
        }
    }

    #[test]
    fn test_partition_remaps_channels() {
        let session = CaptureSession::new(1_000_000, 100, 900)
            .with_channels(&[0, 24, 1, 30])
            .with_trigger(EdgeTrigger::on(30).falling_edge());
        let parts = partition(&session, &ranges()).unwrap();
        assert_eq!(parts.len(), 2);

        let follower = &parts[0];
        assert!(!follower.leader);
        assert_eq!(follower.positions, vec![0, 2]);
        let numbers: Vec<u8> = follower.session.capture_channels.iter().map(|c| c.channel_number).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(follower.session.trigger_channel, EXT_TRIGGER_CHANNEL);
        assert_eq!(follower.session.trigger_type, TriggerType::Edge);
        assert!(!follower.session.trigger_inverted);

        let leader = &parts[1];
        assert!(leader.leader);
        assert_eq!(leader.positions, vec![1, 3]);
        let numbers: Vec<u8> = leader.session.capture_channels.iter().map(|c| c.channel_number).collect();
        assert_eq!(numbers, vec![0, 6]);
        assert_eq!(leader.session.trigger_channel, 6);
        assert!(leader.session.trigger_inverted);
    }

    #[test]
    fn test_partition_skips_unused_devices() {
        let session = CaptureSession::new(1_000_000, 100, 900).with_channels(&[3, 5]);
        let parts = partition(&session, &ranges()).unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].device, 0);
        assert!(parts[0].leader);
    }

    #[test]
    fn test_partition_rejections() {
        let idle_leader = CaptureSession::new(1_000_000, 100, 900)
            .with_channels(&[0])
            .with_trigger(EdgeTrigger::on(25).rising_edge());
        assert_eq!(
            partition(&idle_leader, &ranges()).err(),
            Some(ConfigError::TriggerDeviceIdle { device: 1 })
        );

        let out_of_range = CaptureSession::new(1_000_000, 100, 900).with_channels(&[48]);
        assert!(matches!(
            partition(&out_of_range, &ranges()),
            Err(ConfigError::ChannelOutOfRange { channel: 48, .. })
        ));

        let straddling = CaptureSession::new(1_000_000, 100, 900)
            .with_channels(&[22, 23, 24])
            .with_trigger(
                PatternTrigger::start_capturing_when(22)
                    .bits(&[BitState::High; 3])
                    .matches()
                    .unwrap(),
            );
        assert!(matches!(
            partition(&straddling, &ranges()),
            Err(ConfigError::PatternOutOfRange { .. })
        ));

        let blast = CaptureSession::new(1_000_000, 0, 900)
            .with_channels(&[0])
            .with_trigger(EdgeTrigger::on(0).rising_edge().blast());
        assert_eq!(partition(&blast, &ranges()).err(), Some(ConfigError::BlastAcrossDevices));
    }

    #[tokio::test]
    async fn test_merge_restores_logical_order() {
        let mut driver = simulated(vec![
            (constant_device(0), CaptureOptions::default()),
            (constant_device(1), CaptureOptions::default()),
        ]);
        let info = driver.connect().await.unwrap();
        assert_eq!(info.channels, 48);
        assert_eq!(driver.channel_ranges(), ranges().as_slice());

        let session = CaptureSession::new(1_000_000, 100, 900).with_channels(&[0, 24, 1, 25]);
        let outcome = driver.start_capture(session).unwrap().wait().await.unwrap();
        assert!(outcome.success, "{:?}", outcome.error);

        let channels = &outcome.session.capture_channels;
        let numbers: Vec<u8> = channels.iter().map(|c| c.channel_number).collect();
        assert_eq!(numbers, vec![0, 24, 1, 25]);
        for channel in channels {
            assert_eq!(channel.samples.len(), 1000);
        }
        assert!(channels[0].samples.iter().all(|&s| s == 1));
        assert!(channels[1].samples.iter().all(|&s| s == 0));
        assert!(channels[2].samples.iter().all(|&s| s == 0));
        assert!(channels[3].samples.iter().all(|&s| s == 1));
        assert_eq!(*driver.state().borrow(), CaptureState::Completed);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_good_data() {
        let failing = BinaryDeviceConfig {
            truncate_data: true,
            ..Default::default()
        };
        let short_transfer = CaptureOptions {
            transfer_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let mut driver = simulated(vec![
            (BinaryDeviceConfig::default(), CaptureOptions::default()),
            (failing, short_transfer),
        ]);
        driver.connect().await.unwrap();

        let session = CaptureSession::new(1_000_000, 100, 900).with_channels(&[0, 24]);
        let outcome = driver.start_capture(session).unwrap().wait().await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.code(), CaptureErrorCode::CommandTimeout);
        match &outcome.error {
            Some(CaptureError::Devices { devices, failures }) => {
                assert_eq!(*devices, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].device, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(outcome.session.capture_channels[0].samples.len(), 1000);
        assert!(outcome.session.capture_channels[1].samples.is_empty());
    }

    #[tokio::test]
    async fn test_leader_failure_halts_waiting_followers() {
        let never_triggered = BinaryDeviceConfig {
            capture_delay: Duration::from_secs(20),
            ..Default::default()
        };
        let failing_leader = BinaryDeviceConfig {
            truncate_data: true,
            ..Default::default()
        };
        let short_transfer = CaptureOptions {
            transfer_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let mut driver = simulated(vec![
            (never_triggered, CaptureOptions::default()),
            (failing_leader, short_transfer),
        ]);
        driver.connect().await.unwrap();

        let session = CaptureSession::new(1_000_000, 100, 900)
            .with_channels(&[0, 24])
            .with_trigger(EdgeTrigger::on(24).rising_edge());
        let mut handle = driver.start_capture(session).unwrap();
        let outcome = handle.wait_timeout(Duration::from_secs(3)).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.code(), CaptureErrorCode::CommandTimeout);
        match &outcome.error {
            Some(CaptureError::Devices { failures, .. }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].device, 1);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(*driver.state().borrow(), CaptureState::Failed);
        assert!(!driver.is_capturing());
    }

    #[tokio::test]
    async fn test_multi_busy_and_stop() {
        let slow = || BinaryDeviceConfig {
            capture_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let mut driver = simulated(vec![(slow(), CaptureOptions::default()), (slow(), CaptureOptions::default())]);
        driver.connect().await.unwrap();

        let session = CaptureSession::new(1_000_000, 100, 900).with_channels(&[0, 24]);
        let handle = driver.start_capture(session.clone()).unwrap();
        assert_eq!(driver.start_capture(session).err(), Some(CaptureError::Busy));

        tokio::time::sleep(Duration::from_millis(150)).await;
        driver.stop_capture().unwrap();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.error, Some(CaptureError::Stopped));
        assert!(!driver.is_capturing());
        assert_eq!(driver.stop_capture(), Ok(()));
    }

    #[tokio::test]
    async fn test_multi_requires_connection() {
        let driver = simulated(vec![(BinaryDeviceConfig::default(), CaptureOptions::default())]);
        let session = CaptureSession::new(1_000_000, 100, 900).with_channels(&[0]);
        assert_eq!(driver.start_capture(session).err(), Some(CaptureError::NotConnected));
        assert_eq!(driver.device_info(), None);
    }

    #[tokio::test]
    async fn test_multi_connect_failure_names_device() {
        let broken = BinaryDeviceConfig {
            identification: "NOT_AN_ANALYZER",
            ..Default::default()
        };
        let mut driver = simulated(vec![
            (BinaryDeviceConfig::default(), CaptureOptions::default()),
            (broken, CaptureOptions::default()),
        ]);
        match driver.connect().await {
            Err(CaptureError::Devices { failures, .. }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].device, 1);
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert!(!driver.devices()[0].is_connected());
    }
}
