//! Logical channel multiplexing over one physical pass-thru device.
//!
//! The manager owns the device exclusively. Protocol engines borrow a
//! channel for the duration of an exchange through [ChannelManager::can_channel];
//! a background pump thread dispatches inbound traffic to the channels whose
//! filters accept it, answers ISO-TP first frames for flow-control filters,
//! and drives periodic transmissions.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::{CanFrame, ChannelError, ChannelResult, PacketChannel};
use crate::timing::{TimingParam, TimingParams};

use super::filter::{evaluate, Filter, FilterKind};
use super::periodic::PeriodicMessage;
use super::{ConnectFlags, PassThruDevice, PassThruFrame, Protocol, TxFlags};

/// Scheduling weight of a channel. Bandwidth is granted to higher priority
/// channels first when the requests oversubscribe the device.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, strum_macros::Display,
)]
pub enum ChannelPriority {
    /// Background traffic
    Low,
    /// Ordinary diagnostics
    Normal,
    /// Interactive sessions
    High,
    /// Reprogramming and other operations that must not starve
    Critical,
}

/// Lifecycle state of a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq, strum_macros::Display)]
pub enum ChannelState {
    /// Channel is exchanging traffic
    Active,
    /// Channel is parked: buffers dropped, filters disabled, bandwidth freed
    Suspended,
    /// Channel has been torn down
    Closed,
}

/// Resource envelope requested for a channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResourceAllocation {
    /// Share of the device bandwidth this channel may use, percent
    pub max_bandwidth_percent: u8,
    /// Filters the channel may install
    pub max_filters: u8,
    /// Receive buffer budget in bytes
    pub max_buffer_size: u32,
    /// Scheduling slice granted per turn
    pub time_slice_ms: u32,
    /// Channel may steal bandwidth from lower priority channels
    pub can_preempt: bool,
    /// No other channel may be active on the device while this one exists
    pub exclusive_protocol: bool,
}

impl Default for ResourceAllocation {
    fn default() -> Self {
        Self {
            max_bandwidth_percent: 25,
            max_filters: 10,
            max_buffer_size: 8192,
            time_slice_ms: 50,
            can_preempt: false,
            exclusive_protocol: false,
        }
    }
}

impl ResourceAllocation {
    fn validate(&self, device_filter_cap: u8) -> ChannelResult<()> {
        if !(1..=100).contains(&self.max_bandwidth_percent) {
            return Err(ChannelError::Other(
                "bandwidth allocation must be 1..=100 percent".into(),
            ));
        }
        if self.max_filters == 0 || self.max_filters > device_filter_cap {
            return Err(ChannelError::Other(format!(
                "filter allocation must be 1..={}",
                device_filter_cap
            )));
        }
        if !(512..=65536).contains(&self.max_buffer_size) {
            return Err(ChannelError::Other(
                "buffer allocation must be 512..=65536 bytes".into(),
            ));
        }
        if !(10..=1000).contains(&self.time_slice_ms) {
            return Err(ChannelError::Other(
                "time slice must be 10..=1000 ms".into(),
            ));
        }
        Ok(())
    }
}

/// Everything needed to open a channel
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    /// Protocol the channel speaks
    pub protocol: Protocol,
    /// Link baud rate
    pub baud: u32,
    /// Connect flags
    pub flags: ConnectFlags,
    /// Scheduling priority
    pub priority: ChannelPriority,
    /// Requested resource envelope
    pub allocation: ResourceAllocation,
}

impl ChannelRequest {
    /// A plain ISO 15765 channel at 500 kbit with default resources.
    pub fn iso15765(baud: u32) -> Self {
        Self {
            protocol: Protocol::Iso15765,
            baud,
            flags: ConnectFlags::ISO15765_FRAME_PAD,
            priority: ChannelPriority::Normal,
            allocation: ResourceAllocation::default(),
        }
    }
}

/// Traffic counters of one channel
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Frames transmitted
    pub messages_sent: u64,
    /// Frames accepted by the channel's filters
    pub messages_received: u64,
    /// Send failures and buffer overruns
    pub errors: u64,
    /// Time since the channel was created
    pub uptime_ms: u64,
    /// Time since the last send or receive, if any traffic ever flowed
    pub last_activity_age_ms: Option<u64>,
}

/// Computed resource consumption of one channel
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ResourceUsage {
    /// Bandwidth share granted by the last rebalance, percent
    pub bandwidth_percent: u8,
    /// Installed filters
    pub filter_count: usize,
    /// Receive buffer fill level, percent
    pub buffer_percent: u8,
    /// Share of the scheduler's attention, derived from time slices
    pub cpu_percent: u8,
}

/// Manager-wide limits
#[derive(Debug, Copy, Clone)]
pub struct ManagerConfig {
    /// Most channels that may be active at once
    pub max_channels: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { max_channels: 10 }
    }
}

struct ChannelEntry {
    protocol: Protocol,
    #[allow(dead_code)]
    baud: u32,
    flags: ConnectFlags,
    priority: ChannelPriority,
    allocation: ResourceAllocation,
    state: ChannelState,
    filters: Vec<Filter>,
    next_filter_id: u32,
    periodics: Vec<PeriodicMessage>,
    next_periodic_id: u32,
    granted_bandwidth: u8,
    rx_queue: VecDeque<PassThruFrame>,
    rx_bytes: usize,
    borrowed: bool,
    timing: TimingParams,
    sent: u64,
    received: u64,
    errors: u64,
    opened_at: Instant,
    last_activity: Option<Instant>,
}

struct Inner {
    device: PassThruDevice,
    channels: BTreeMap<u32, ChannelEntry>,
    next_channel_id: u32,
    config: ManagerConfig,
}

impl Inner {
    fn channel_mut(&mut self, id: u32) -> ChannelResult<&mut ChannelEntry> {
        self.channels
            .get_mut(&id)
            .ok_or(ChannelError::InterfaceNotOpen)
    }

    fn active_count(&self) -> usize {
        self.channels
            .values()
            .filter(|c| c.state == ChannelState::Active)
            .count()
    }

    /// Admission checks for opening (or resuming) a channel. `ignore` skips
    /// the channel being resumed.
    fn admit(
        &self,
        protocol: Protocol,
        allocation: &ResourceAllocation,
        ignore: Option<u32>,
    ) -> ChannelResult<()> {
        if !self.device.info().capabilities.supports(protocol) {
            return Err(ChannelError::UnsupportedRequest);
        }
        let active = || {
            self.channels
                .iter()
                .filter(|(id, c)| Some(**id) != ignore && c.state == ChannelState::Active)
                .map(|(_, c)| c)
        };
        if active().count() >= self.config.max_channels {
            return Err(ChannelError::ResourceExhausted {
                resource: "channel slots",
            });
        }
        if active().any(|c| c.allocation.exclusive_protocol) {
            return Err(ChannelError::ProtocolConflict);
        }
        if allocation.exclusive_protocol && active().count() > 0 {
            return Err(ChannelError::ProtocolConflict);
        }
        let count_of = |protos: &[Protocol]| active().filter(|c| protos.contains(&c.protocol)).count();
        let cap_hit = match protocol {
            Protocol::Can | Protocol::Iso15765 => {
                count_of(&[Protocol::Can, Protocol::Iso15765]) >= 4
            }
            Protocol::Iso14230 | Protocol::Iso9141 => {
                count_of(&[Protocol::Iso14230, Protocol::Iso9141]) >= 1
            }
            Protocol::J1850Vpw | Protocol::J1850Pwm => {
                count_of(&[Protocol::J1850Vpw, Protocol::J1850Pwm]) >= 1
            }
        };
        if cap_hit {
            return Err(ChannelError::ProtocolConflict);
        }
        Ok(())
    }

    /// Re-grants bandwidth: priority order, greedy, capped at each channel's
    /// request, ties broken by channel id for determinism.
    fn rebalance(&mut self) {
        let mut order: Vec<u32> = self
            .channels
            .iter()
            .filter(|(_, c)| c.state == ChannelState::Active)
            .map(|(id, _)| *id)
            .collect();
        order.sort_by(|a, b| {
            let pa = self.channels[a].priority;
            let pb = self.channels[b].priority;
            pb.cmp(&pa).then(a.cmp(b))
        });
        let mut remaining: u8 = 100;
        for id in order {
            let entry = self.channels.get_mut(&id).expect("sorted from same map");
            let granted = entry.allocation.max_bandwidth_percent.min(remaining);
            entry.granted_bandwidth = granted;
            remaining -= granted;
        }
        for entry in self
            .channels
            .values_mut()
            .filter(|c| c.state != ChannelState::Active)
        {
            entry.granted_bandwidth = 0;
        }
    }

    /// One pump pass: drain the device, dispatch to channels, answer
    /// flow-control filters, fire due periodics.
    fn pump(&mut self, now: Instant) {
        let frames = self
            .device
            .interface_mut()
            .recv(32, 0)
            .unwrap_or_default();
        for frame in frames {
            let mut responses: Vec<PassThruFrame> = Vec::new();
            for entry in self.channels.values_mut() {
                if entry.state != ChannelState::Active || entry.protocol != frame.protocol {
                    continue;
                }
                let (accept, responder) = evaluate(&entry.filters, &frame);
                if !accept {
                    continue;
                }
                if let Some(f) = responder {
                    // Auto-answer ISO-TP first frames with the canned flow control
                    let pci = frame.can_payload().first().copied().unwrap_or(0);
                    if pci >> 4 == 0x1 {
                        if let Some(payload) = f.flow_control_payload() {
                            if let Ok(resp) = PassThruFrame::new(
                                entry.protocol,
                                TxFlags::empty(),
                                payload.to_vec(),
                            ) {
                                responses.push(resp);
                            }
                        }
                    }
                }
                if entry.rx_bytes + frame.data().len() > entry.allocation.max_buffer_size as usize {
                    entry.errors += 1;
                    log::warn!("channel rx buffer full, dropping frame");
                    continue;
                }
                entry.rx_bytes += frame.data().len();
                entry.received += 1;
                entry.last_activity = Some(now);
                entry.rx_queue.push_back(frame.clone());
            }
            for resp in responses {
                if let Err(e) = self.device.interface_mut().send(resp, 0) {
                    log::warn!("flow control auto-response failed: {e}");
                }
            }
        }

        let mut due: Vec<(u32, PassThruFrame)> = Vec::new();
        for (id, entry) in self.channels.iter_mut() {
            if entry.state != ChannelState::Active {
                continue;
            }
            for periodic in entry.periodics.iter_mut() {
                if let Some(frame) = periodic.poll(now) {
                    due.push((*id, frame));
                }
            }
        }
        for (id, frame) in due {
            let res = self.device.interface_mut().send(frame, 0);
            if let Some(entry) = self.channels.get_mut(&id) {
                match res {
                    Ok(()) => {
                        entry.sent += 1;
                        entry.last_activity = Some(now);
                    }
                    Err(e) => {
                        entry.errors += 1;
                        log::warn!("periodic transmission failed: {e}");
                    }
                }
            }
        }
    }
}

/// Multiplexes logical channels over one physical pass-thru device.
pub struct ChannelManager {
    inner: Arc<Mutex<Inner>>,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChannelManager")
    }
}

impl ChannelManager {
    /// Takes exclusive ownership of an opened device and starts the pump.
    pub fn new(device: PassThruDevice, config: ManagerConfig) -> Self {
        let inner = Arc::new(Mutex::new(Inner {
            device,
            channels: BTreeMap::new(),
            next_channel_id: 1,
            config,
        }));
        let running = Arc::new(AtomicBool::new(true));
        let inner_t = inner.clone();
        let running_t = running.clone();
        let handle = std::thread::spawn(move || {
            log::debug!("channel pump running");
            while running_t.load(Ordering::Relaxed) {
                {
                    let mut guard = match inner_t.lock() {
                        Ok(g) => g,
                        Err(_) => break,
                    };
                    guard.pump(Instant::now());
                }
                std::thread::sleep(Duration::from_millis(2));
            }
            log::debug!("channel pump stopped");
        });
        Self {
            inner,
            running,
            handle: Some(handle),
        }
    }

    fn lock(&self) -> ChannelResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ChannelError::Other("channel manager poisoned".into()))
    }

    /// Opens a logical channel, applying the protocol's default timing table.
    pub fn create_channel(&self, request: ChannelRequest) -> ChannelResult<u32> {
        let mut inner = self.lock()?;
        request
            .allocation
            .validate(inner.device.filter_cap())?;
        inner.admit(request.protocol, &request.allocation, None)?;
        let id = inner.next_channel_id;
        inner.next_channel_id += 1;
        let timing = TimingParams::defaults_for(request.protocol);
        inner.channels.insert(
            id,
            ChannelEntry {
                protocol: request.protocol,
                baud: request.baud,
                flags: request.flags,
                priority: request.priority,
                allocation: request.allocation,
                state: ChannelState::Active,
                filters: Vec::new(),
                next_filter_id: 1,
                periodics: Vec::new(),
                next_periodic_id: 1,
                granted_bandwidth: 0,
                rx_queue: VecDeque::new(),
                rx_bytes: 0,
                borrowed: false,
                timing,
                sent: 0,
                received: 0,
                errors: 0,
                opened_at: Instant::now(),
                last_activity: None,
            },
        );
        inner.rebalance();
        log::debug!("channel {id} created ({})", request.protocol);
        Ok(id)
    }

    /// Tears a channel down and frees its resources.
    pub fn close_channel(&self, id: u32) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        let mut entry = inner
            .channels
            .remove(&id)
            .ok_or(ChannelError::InterfaceNotOpen)?;
        entry.state = ChannelState::Closed;
        inner.rebalance();
        log::debug!("channel {id} closed");
        Ok(())
    }

    /// Parks a channel: buffers dropped, filters disabled, bandwidth freed.
    pub fn suspend_channel(&self, id: u32) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(id)?;
        if entry.state != ChannelState::Active {
            return Err(ChannelError::UnsupportedRequest);
        }
        entry.state = ChannelState::Suspended;
        entry.rx_queue.clear();
        entry.rx_bytes = 0;
        inner.rebalance();
        Ok(())
    }

    /// Re-activates a suspended channel, subject to the same admission
    /// checks as creation.
    pub fn resume_channel(&self, id: u32) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.channels.get(&id).ok_or(ChannelError::InterfaceNotOpen)?;
        if entry.state != ChannelState::Suspended {
            return Err(ChannelError::UnsupportedRequest);
        }
        inner.admit(entry.protocol, &entry.allocation, Some(id))?;
        inner.channel_mut(id)?.state = ChannelState::Active;
        inner.rebalance();
        Ok(())
    }

    /// Changes a channel's scheduling priority and rebalances.
    pub fn set_priority(&self, id: u32, priority: ChannelPriority) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        inner.channel_mut(id)?.priority = priority;
        inner.rebalance();
        Ok(())
    }

    /// Installs a filter, returning its id.
    pub fn add_filter(
        &self,
        id: u32,
        kind: FilterKind,
        mask: Vec<u8>,
        pattern: Vec<u8>,
        flow_control_payload: Option<Vec<u8>>,
    ) -> ChannelResult<u32> {
        let mut inner = self.lock()?;
        let device_cap = inner.device.filter_cap();
        let entry = inner.channel_mut(id)?;
        let cap = entry.allocation.max_filters.min(device_cap) as usize;
        if entry.filters.len() >= cap {
            return Err(ChannelError::ResourceExhausted { resource: "filters" });
        }
        let filter_id = entry.next_filter_id;
        let filter = Filter::new(filter_id, kind, mask, pattern, flow_control_payload)?;
        entry.next_filter_id += 1;
        entry.filters.push(filter);
        Ok(filter_id)
    }

    /// Removes one filter.
    pub fn remove_filter(&self, id: u32, filter_id: u32) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(id)?;
        let before = entry.filters.len();
        entry.filters.retain(|f| f.id != filter_id);
        if entry.filters.len() == before {
            return Err(ChannelError::FilterInvalid {
                reason: format!("no filter {filter_id} on channel {id}"),
            });
        }
        Ok(())
    }

    /// Starts repeating a frame every `period_ms` until stopped or the
    /// channel closes. Delivery jitter is within ten percent of the period.
    pub fn start_periodic(
        &self,
        id: u32,
        frame: PassThruFrame,
        period_ms: u32,
    ) -> ChannelResult<u32> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(id)?;
        let periodic_id = entry.next_periodic_id;
        let periodic = PeriodicMessage::new(periodic_id, frame, period_ms, Instant::now())
            .ok_or(ChannelError::UnsupportedRequest)?;
        entry.next_periodic_id += 1;
        entry.periodics.push(periodic);
        Ok(periodic_id)
    }

    /// Stops one periodic message.
    pub fn stop_periodic(&self, id: u32, periodic_id: u32) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(id)?;
        let before = entry.periodics.len();
        entry.periodics.retain(|p| p.id != periodic_id);
        if entry.periodics.len() == before {
            return Err(ChannelError::UnsupportedRequest);
        }
        Ok(())
    }

    /// Reads a timing parameter of a channel.
    pub fn get_param(&self, id: u32, param: TimingParam) -> ChannelResult<u32> {
        let mut inner = self.lock()?;
        Ok(inner.channel_mut(id)?.timing.get(param))
    }

    /// Writes a timing parameter of a channel.
    pub fn set_param(&self, id: u32, param: TimingParam, value: u32) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        if inner.channel_mut(id)?.timing.set(param, value) {
            Ok(())
        } else {
            Err(ChannelError::IoctlFailed {
                param: param.to_string(),
            })
        }
    }

    /// Traffic counters of a channel.
    pub fn stats(&self, id: u32) -> ChannelResult<ChannelStats> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(id)?;
        Ok(ChannelStats {
            messages_sent: entry.sent,
            messages_received: entry.received,
            errors: entry.errors,
            uptime_ms: entry.opened_at.elapsed().as_millis() as u64,
            last_activity_age_ms: entry
                .last_activity
                .map(|t| t.elapsed().as_millis() as u64),
        })
    }

    /// Computed resource consumption of a channel.
    pub fn usage(&self, id: u32) -> ChannelResult<ResourceUsage> {
        let inner = self.lock()?;
        let entry = inner.channels.get(&id).ok_or(ChannelError::InterfaceNotOpen)?;
        let slice_total: u32 = inner
            .channels
            .values()
            .filter(|c| c.state == ChannelState::Active)
            .map(|c| c.allocation.time_slice_ms)
            .sum();
        let cpu = if slice_total == 0 || entry.state != ChannelState::Active {
            0
        } else {
            (entry.allocation.time_slice_ms * 100 / slice_total) as u8
        };
        Ok(ResourceUsage {
            bandwidth_percent: entry.granted_bandwidth,
            filter_count: entry.filters.len(),
            buffer_percent: (entry.rx_bytes * 100 / entry.allocation.max_buffer_size as usize)
                .min(100) as u8,
            cpu_percent: cpu,
        })
    }

    /// Lifecycle state of a channel.
    pub fn channel_state(&self, id: u32) -> ChannelResult<ChannelState> {
        let inner = self.lock()?;
        inner
            .channels
            .get(&id)
            .map(|c| c.state)
            .ok_or(ChannelError::InterfaceNotOpen)
    }

    /// Ids of all channels currently active.
    pub fn active_channels(&self) -> Vec<u32> {
        self.lock()
            .map(|inner| {
                inner
                    .channels
                    .iter()
                    .filter(|(_, c)| c.state == ChannelState::Active)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sum of granted bandwidth across active channels; never above 100.
    pub fn total_granted_bandwidth(&self) -> u32 {
        self.lock()
            .map(|inner| {
                inner
                    .channels
                    .values()
                    .map(|c| c.granted_bandwidth as u32)
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Battery voltage reported by the adapter, for precondition checks.
    pub fn read_battery_voltage(&self) -> Option<f32> {
        self.lock().ok()?.device.read_battery_voltage()
    }

    /// Borrows a channel as a CAN frame channel for a protocol engine.
    ///
    /// The borrow is exclusive: a second call for the same channel fails
    /// until the first [ManagedCanChannel] is dropped.
    pub fn can_channel(&self, id: u32) -> ChannelResult<ManagedCanChannel> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(id)?;
        if entry.borrowed {
            return Err(ChannelError::ProtocolConflict);
        }
        if !matches!(entry.protocol, Protocol::Can | Protocol::Iso15765) {
            return Err(ChannelError::UnsupportedRequest);
        }
        entry.borrowed = true;
        Ok(ManagedCanChannel {
            inner: self.inner.clone(),
            id,
            extended: entry.flags.contains(ConnectFlags::CAN_29BIT_ID),
        })
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Exclusive borrow of a managed channel, shaped as a CAN frame channel so
/// the ISO-TP link can run on top of it.
pub struct ManagedCanChannel {
    inner: Arc<Mutex<Inner>>,
    id: u32,
    extended: bool,
}

impl std::fmt::Debug for ManagedCanChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ManagedCanChannel(#{})", self.id)
    }
}

impl ManagedCanChannel {
    fn lock(&self) -> ChannelResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| ChannelError::Other("channel manager poisoned".into()))
    }
}

impl PacketChannel<CanFrame> for ManagedCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }

    fn write_packets(&mut self, packets: Vec<CanFrame>, timeout_ms: u32) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(self.id)?;
        if entry.state != ChannelState::Active {
            return Err(ChannelError::InterfaceNotOpen);
        }
        let protocol = entry.protocol;
        let now = Instant::now();
        for frame in packets {
            let pt = PassThruFrame::with_can_id(protocol, frame.id(), frame.data(), self.extended)?;
            let res = inner.device.interface_mut().send(pt, timeout_ms);
            let entry = inner.channel_mut(self.id)?;
            match res {
                Ok(()) => {
                    entry.sent += 1;
                    entry.last_activity = Some(now);
                }
                Err(e) => {
                    entry.errors += 1;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn read_packets(&mut self, max: usize, timeout_ms: u32) -> ChannelResult<Vec<CanFrame>> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            {
                let mut inner = self.lock()?;
                let entry = inner.channel_mut(self.id)?;
                if !entry.rx_queue.is_empty() {
                    let mut out = Vec::new();
                    while out.len() < max {
                        match entry.rx_queue.pop_front() {
                            Some(f) => {
                                entry.rx_bytes = entry.rx_bytes.saturating_sub(f.data().len());
                                if let Some(id) = f.can_id() {
                                    out.push(CanFrame::new(id, f.can_payload(), self.extended));
                                }
                            }
                            None => break,
                        }
                    }
                    return Ok(out);
                }
            }
            if timeout_ms == 0 || Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        let mut inner = self.lock()?;
        let entry = inner.channel_mut(self.id)?;
        entry.rx_queue.clear();
        entry.rx_bytes = 0;
        Ok(())
    }

    fn clear_tx_buffer(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

impl Drop for ManagedCanChannel {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(entry) = inner.channels.get_mut(&self.id) {
                entry.borrowed = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthru::{DeviceCapabilities, DeviceInfo, LoopbackInterface, PassThruInterface};

    fn full_caps_device() -> (PassThruDevice, LoopbackInterface) {
        let (iface, peer) = LoopbackInterface::pair();
        let info = DeviceInfo {
            vendor: "Bench".into(),
            product: "Virtual VCI".into(),
            firmware: None,
            api_version: Some("04.04".into()),
            capabilities: DeviceCapabilities {
                can: true,
                iso15765: true,
                iso14230: true,
                iso9141: true,
                j1850_vpw: true,
                j1850_pwm: true,
            },
        };
        (
            PassThruDevice::open(info, Box::new(iface)).unwrap(),
            peer,
        )
    }

    fn manager() -> (ChannelManager, LoopbackInterface) {
        let (dev, peer) = full_caps_device();
        (ChannelManager::new(dev, ManagerConfig::default()), peer)
    }

    fn request(protocol: Protocol, priority: ChannelPriority, bandwidth: u8) -> ChannelRequest {
        ChannelRequest {
            protocol,
            baud: 500_000,
            flags: ConnectFlags::empty(),
            priority,
            allocation: ResourceAllocation {
                max_bandwidth_percent: bandwidth,
                ..Default::default()
            },
        }
    }

    #[test]
    fn kline_protocols_are_mutually_exclusive() {
        let (mgr, _peer) = manager();
        mgr.create_channel(request(Protocol::Iso14230, ChannelPriority::Normal, 20))
            .unwrap();
        let before = mgr.active_channels();
        let err = mgr
            .create_channel(request(Protocol::Iso9141, ChannelPriority::Normal, 20))
            .unwrap_err();
        assert!(matches!(err, ChannelError::ProtocolConflict));
        assert_eq!(mgr.active_channels(), before);
    }

    #[test]
    fn can_family_caps_at_four() {
        let (mgr, _peer) = manager();
        for _ in 0..2 {
            mgr.create_channel(request(Protocol::Can, ChannelPriority::Normal, 10))
                .unwrap();
            mgr.create_channel(request(Protocol::Iso15765, ChannelPriority::Normal, 10))
                .unwrap();
        }
        let err = mgr
            .create_channel(request(Protocol::Can, ChannelPriority::Normal, 10))
            .unwrap_err();
        assert!(matches!(err, ChannelError::ProtocolConflict));
    }

    #[test]
    fn exclusive_channel_blocks_and_is_blocked() {
        let (mgr, _peer) = manager();
        let mut exclusive = request(Protocol::Iso15765, ChannelPriority::Critical, 100);
        exclusive.allocation.exclusive_protocol = true;

        // Exclusive onto an occupied device is refused
        let first = mgr
            .create_channel(request(Protocol::Can, ChannelPriority::Normal, 10))
            .unwrap();
        assert!(matches!(
            mgr.create_channel(exclusive.clone()),
            Err(ChannelError::ProtocolConflict)
        ));

        // Exclusive on an empty device then refuses everyone else
        mgr.close_channel(first).unwrap();
        mgr.create_channel(exclusive).unwrap();
        assert!(matches!(
            mgr.create_channel(request(Protocol::Can, ChannelPriority::Normal, 10)),
            Err(ChannelError::ProtocolConflict)
        ));
    }

    #[test]
    fn bandwidth_rebalances_by_priority() {
        let (mgr, _peer) = manager();
        let low = mgr
            .create_channel(request(Protocol::Can, ChannelPriority::Low, 60))
            .unwrap();
        let critical = mgr
            .create_channel(request(Protocol::Iso15765, ChannelPriority::Critical, 80))
            .unwrap();
        // Critical is served first: 80, low gets the 20 that remain
        assert_eq!(mgr.usage(critical).unwrap().bandwidth_percent, 80);
        assert_eq!(mgr.usage(low).unwrap().bandwidth_percent, 20);
        assert!(mgr.total_granted_bandwidth() <= 100);

        mgr.close_channel(critical).unwrap();
        assert_eq!(mgr.usage(low).unwrap().bandwidth_percent, 60);
    }

    #[test]
    fn suspension_frees_bandwidth_until_resume() {
        let (mgr, _peer) = manager();
        let a = mgr
            .create_channel(request(Protocol::Can, ChannelPriority::Normal, 70))
            .unwrap();
        let b = mgr
            .create_channel(request(Protocol::Iso15765, ChannelPriority::Normal, 70))
            .unwrap();
        assert_eq!(mgr.usage(a).unwrap().bandwidth_percent, 70);
        assert_eq!(mgr.usage(b).unwrap().bandwidth_percent, 30);

        mgr.suspend_channel(a).unwrap();
        assert_eq!(mgr.channel_state(a).unwrap(), ChannelState::Suspended);
        assert_eq!(mgr.usage(a).unwrap().bandwidth_percent, 0);
        assert_eq!(mgr.usage(b).unwrap().bandwidth_percent, 70);

        mgr.resume_channel(a).unwrap();
        assert_eq!(mgr.usage(a).unwrap().bandwidth_percent, 70);
        assert_eq!(mgr.usage(b).unwrap().bandwidth_percent, 30);
    }

    #[test]
    fn filter_cap_is_enforced() {
        let (mgr, _peer) = manager();
        let mut req = request(Protocol::Iso15765, ChannelPriority::Normal, 20);
        req.allocation.max_filters = 2;
        let ch = mgr.create_channel(req).unwrap();
        for i in 0..2u32 {
            mgr.add_filter(
                ch,
                FilterKind::Pass,
                vec![0xFF; 4],
                (0x7E8 + i).to_be_bytes().to_vec(),
                None,
            )
            .unwrap();
        }
        let err = mgr
            .add_filter(ch, FilterKind::Pass, vec![0xFF; 4], vec![0, 0, 7, 0xEA], None)
            .unwrap_err();
        assert!(matches!(err, ChannelError::ResourceExhausted { .. }));
    }

    #[test]
    fn channel_borrow_is_exclusive() {
        let (mgr, _peer) = manager();
        let ch = mgr
            .create_channel(request(Protocol::Iso15765, ChannelPriority::Normal, 20))
            .unwrap();
        let borrow = mgr.can_channel(ch).unwrap();
        assert!(matches!(
            mgr.can_channel(ch),
            Err(ChannelError::ProtocolConflict)
        ));
        drop(borrow);
        assert!(mgr.can_channel(ch).is_ok());
    }

    #[test]
    fn inbound_frames_reach_only_matching_channels() {
        let (mgr, mut peer) = manager();
        let ch = mgr
            .create_channel(request(Protocol::Iso15765, ChannelPriority::Normal, 20))
            .unwrap();
        mgr.add_filter(ch, FilterKind::Pass, vec![0xFF; 4], vec![0, 0, 7, 0xE8], None)
            .unwrap();
        let mut borrow = mgr.can_channel(ch).unwrap();

        let hit = PassThruFrame::with_can_id(Protocol::Iso15765, 0x7E8, &[0x02, 0x50, 0x03], false)
            .unwrap();
        let miss =
            PassThruFrame::with_can_id(Protocol::Iso15765, 0x123, &[0x01, 0xFF], false).unwrap();
        peer.send(miss, 0).unwrap();
        peer.send(hit, 0).unwrap();

        let frames = borrow.read_packets(8, 500).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].id(), 0x7E8);
        assert_eq!(frames[0].data(), &[0x02, 0x50, 0x03]);
    }

    #[test]
    fn flow_control_filter_answers_first_frames() {
        let (mgr, mut peer) = manager();
        let ch = mgr
            .create_channel(request(Protocol::Iso15765, ChannelPriority::Normal, 20))
            .unwrap();
        let fc_payload = {
            let mut d = 0x7E0u32.to_be_bytes().to_vec();
            d.extend_from_slice(&[0x30, 0x00, 0x00]);
            d
        };
        mgr.add_filter(
            ch,
            FilterKind::FlowControl,
            vec![0xFF; 4],
            vec![0, 0, 7, 0xE8],
            Some(fc_payload.clone()),
        )
        .unwrap();

        let ff =
            PassThruFrame::with_can_id(Protocol::Iso15765, 0x7E8, &[0x10, 0x14, 0x62], false)
                .unwrap();
        peer.send(ff, 0).unwrap();

        // The pump must answer with the canned flow control
        let start = Instant::now();
        let mut answered = Vec::new();
        while answered.is_empty() && start.elapsed() < Duration::from_millis(500) {
            answered = peer.recv(4, 50).unwrap();
        }
        assert_eq!(answered.len(), 1);
        assert_eq!(answered[0].data(), &fc_payload[..]);
    }

    #[test]
    fn periodic_messages_repeat_until_stopped() {
        let (mgr, mut peer) = manager();
        let ch = mgr
            .create_channel(request(Protocol::Can, ChannelPriority::Normal, 20))
            .unwrap();
        let frame = PassThruFrame::with_can_id(Protocol::Can, 0x7DF, &[0x01, 0x3E], false).unwrap();
        let pid = mgr.start_periodic(ch, frame, 20).unwrap();

        std::thread::sleep(Duration::from_millis(110));
        mgr.stop_periodic(ch, pid).unwrap();
        let seen = peer.recv(64, 50).unwrap().len();
        // 110 ms at a 20 ms period: five transmissions plus the immediate one,
        // give the scheduler generous slack either way
        assert!((3..=8).contains(&seen), "saw {seen} transmissions");

        std::thread::sleep(Duration::from_millis(60));
        assert!(peer.recv(64, 10).unwrap().is_empty());
    }

    #[test]
    fn stats_track_traffic() {
        let (mgr, mut peer) = manager();
        let ch = mgr
            .create_channel(request(Protocol::Iso15765, ChannelPriority::Normal, 20))
            .unwrap();
        mgr.add_filter(ch, FilterKind::Pass, vec![0xFF; 4], vec![0, 0, 7, 0xE8], None)
            .unwrap();
        let mut borrow = mgr.can_channel(ch).unwrap();
        borrow
            .write_packets(vec![CanFrame::new(0x7E0, &[0x02, 0x10, 0x03], false)], 0)
            .unwrap();
        peer.send(
            PassThruFrame::with_can_id(Protocol::Iso15765, 0x7E8, &[0x02, 0x50, 0x03], false)
                .unwrap(),
            0,
        )
        .unwrap();
        borrow.read_packets(1, 500).unwrap();
        let stats = mgr.stats(ch).unwrap();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.errors, 0);
    }
}
