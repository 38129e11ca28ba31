// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Events and event pools.
//!
//! A regular event completes when every partition slot in its pool storage
//! reads [`STATE_SIGNALED`]. A counter-based event instead completes when
//! the in-order counter it was last signalled with reaches its signal value.

use crate::in_order::InOrderExecInfo;
use crate::L0Device;
use crate::ZeError;
use bitfield_struct::bitfield;
use gpu_memory::AllocationProperties;
use gpu_memory::AllocationType;
use gpu_memory::GraphicsAllocation;
use gpu_memory::WaitStatus;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// Slot value of a signalled regular event.
pub const STATE_SIGNALED: u32 = 0;
/// Slot value of a reset regular event.
pub const STATE_CLEARED: u32 = u32::MAX;

/// `ze_event_counter_based_exp_flags_t`
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct CounterBasedFlags {
    pub immediate: bool,
    pub non_immediate: bool,
    pub host_visible: bool,
    pub ipc: bool,
    pub device_timestamp: bool,
    pub host_timestamp: bool,
    #[bits(26)]
    _rsvd: u32,
}

impl CounterBasedFlags {
    const VALID: u32 = 0x3f;
    /// Bits an event pool may request.
    const POOL_VALID: u32 = 0x3;

    fn has_timestamps(&self) -> bool {
        self.device_timestamp() || self.host_timestamp()
    }
}

/// Memory visibility at signal or wait time.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EventScope {
    pub subdevice: bool,
    pub device: bool,
    pub host: bool,
    #[bits(29)]
    _rsvd: u32,
}

/// `ze_event_pool_flags_t`
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct EventPoolFlags {
    pub host_visible: bool,
    pub ipc: bool,
    pub kernel_timestamp: bool,
    pub kernel_mapped_timestamp: bool,
    #[bits(28)]
    _rsvd: u32,
}

impl EventPoolFlags {
    fn has_timestamps(&self) -> bool {
        self.kernel_timestamp() || self.kernel_mapped_timestamp()
    }
}

/// How an event relates to in-order counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CounterBasedMode {
    /// Created counter-based.
    ExplicitlyEnabled,
    /// A regular event converted when signalled from an immediate in-order
    /// list.
    ImplicitlyEnabled,
    /// A regular event that may still be converted.
    InitiallyDisabled,
    /// A regular event that may no longer be converted.
    ImplicitlyDisabled,
}

/// Parameters for [`EventPool::create`].
#[derive(Debug, Default, Copy, Clone)]
pub struct EventPoolDesc {
    pub flags: EventPoolFlags,
    pub count: u32,
    /// Makes every event of the pool counter-based.
    pub counter_based_flags: Option<CounterBasedFlags>,
}

/// A block of event slots sharing one allocation.
pub struct EventPool {
    device: Arc<L0Device>,
    flags: EventPoolFlags,
    counter_based_flags: Option<CounterBasedFlags>,
    allocation: Arc<GraphicsAllocation>,
    slot_size: u64,
    in_use: Mutex<Vec<bool>>,
}

impl fmt::Debug for EventPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPool")
            .field("flags", &self.flags)
            .field("counter_based_flags", &self.counter_based_flags)
            .field("count", &self.count())
            .finish()
    }
}

impl EventPool {
    /// Allocates storage for `desc.count` events. IPC pools use a
    /// shareable allocation.
    pub fn create(device: &Arc<L0Device>, desc: &EventPoolDesc) -> Result<Arc<Self>, ZeError> {
        if desc.count == 0 {
            return Err(ZeError::InvalidArgument);
        }
        let counter_based_flags = match desc.counter_based_flags {
            Some(_) if desc.flags.ipc() => {
                tracing::error!("counter-based events cannot come from an ipc pool");
                return Err(ZeError::UnsupportedFeature);
            }
            Some(flags) if flags.into_bits() & !CounterBasedFlags::POOL_VALID != 0 => {
                return Err(ZeError::InvalidArgument);
            }
            Some(flags) if flags.into_bits() == 0 => {
                Some(CounterBasedFlags::new().with_immediate(true))
            }
            flags => flags,
        };

        let partitions = device.num_partitions();
        let stride = device.family().partition_stride();
        let slot_size = u64::from(partitions) * stride;
        let allocation_type = if desc.flags.host_visible() {
            AllocationType::BufferHostMemory
        } else {
            AllocationType::Buffer
        };
        let allocation = device
            .memory_manager()
            .allocate_graphics_memory(&AllocationProperties::new(
                device.root_device_index(),
                u64::from(desc.count) * slot_size,
                allocation_type,
            ))
            .map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to allocate event pool"
                );
                ZeError::OutOfDeviceMemory
            })?;
        for slot in 0..u64::from(desc.count) * u64::from(partitions) {
            allocation
                .storage()
                .write_u32((slot * stride) as usize, STATE_CLEARED);
        }

        Ok(Arc::new(Self {
            device: device.clone(),
            flags: desc.flags,
            counter_based_flags,
            allocation,
            slot_size,
            in_use: Mutex::new(vec![false; desc.count as usize]),
        }))
    }

    pub fn flags(&self) -> EventPoolFlags {
        self.flags
    }

    pub fn counter_based_flags(&self) -> Option<CounterBasedFlags> {
        self.counter_based_flags
    }

    pub fn count(&self) -> u32 {
        self.in_use.lock().len() as u32
    }

    pub fn is_ipc(&self) -> bool {
        self.flags.ipc()
    }

    /// The memory backing every slot of the pool.
    pub fn allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.allocation
    }

    fn slot_address(&self, index: u32) -> u64 {
        self.allocation.gpu_address() + u64::from(index) * self.slot_size
    }
}

/// Where in its pool an event lives and the scopes it synchronizes.
#[derive(Debug, Default, Copy, Clone)]
pub struct EventDesc {
    pub index: u32,
    pub signal: EventScope,
    pub wait: EventScope,
}

/// Describes a standalone counter-based event, which has no pool slot.
#[derive(Debug, Default, Copy, Clone)]
pub struct CounterBasedEventDesc {
    pub flags: CounterBasedFlags,
    pub signal: EventScope,
    pub wait: EventScope,
}

struct PoolSlot {
    pool: Arc<EventPool>,
    index: u32,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        if let Some(in_use) = self.pool.in_use.lock().get_mut(self.index as usize) {
            *in_use = false;
        }
    }
}

struct EventState {
    mode: CounterBasedMode,
    counter_based_flags: CounterBasedFlags,
    in_order: Option<Arc<InOrderExecInfo>>,
    signal_value: u64,
    /// The counter's allocation offset when the event was signalled.
    allocation_offset: u64,
}

/// A synchronization point signalled by the device and waited on by the
/// device or the host.
///
/// Regular events store [`STATE_SIGNALED`] in their pool slot. Counter-based
/// events complete when an in-order counter reaches the value recorded at
/// signal time.
pub struct Event {
    device: Arc<L0Device>,
    slot: Option<PoolSlot>,
    signal_scope: EventScope,
    wait_scope: EventScope,
    shareable: bool,
    from_ipc_pool: bool,
    pub(crate) imported: Vec<Arc<GraphicsAllocation>>,
    state: Mutex<EventState>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Event")
            .field("mode", &state.mode)
            .field("counter_based_flags", &state.counter_based_flags)
            .field("signal_value", &state.signal_value)
            .field("shareable", &self.shareable)
            .field("from_ipc_pool", &self.from_ipc_pool)
            .finish()
    }
}

impl Event {
    /// Creates the event at `desc.index` of `pool`.
    pub fn create(pool: &Arc<EventPool>, desc: &EventDesc) -> Result<Arc<Self>, ZeError> {
        {
            let mut in_use = pool.in_use.lock();
            let slot = in_use
                .get_mut(desc.index as usize)
                .ok_or(ZeError::InvalidArgument)?;
            if *slot {
                return Err(ZeError::InvalidArgument);
            }
            *slot = true;
        }
        let slot = PoolSlot {
            pool: pool.clone(),
            index: desc.index,
        };

        let (mode, counter_based_flags, shareable) = match pool.counter_based_flags {
            _ if pool.is_ipc() => (
                CounterBasedMode::ImplicitlyDisabled,
                CounterBasedFlags::new(),
                false,
            ),
            Some(flags) => (
                CounterBasedMode::ExplicitlyEnabled,
                flags,
                !pool.flags.has_timestamps(),
            ),
            None => (
                CounterBasedMode::InitiallyDisabled,
                CounterBasedFlags::new(),
                false,
            ),
        };

        let event = Self {
            device: pool.device.clone(),
            slot: Some(slot),
            signal_scope: desc.signal,
            wait_scope: desc.wait,
            shareable,
            from_ipc_pool: pool.is_ipc(),
            imported: Vec::new(),
            state: Mutex::new(EventState {
                mode,
                counter_based_flags,
                in_order: None,
                signal_value: 0,
                allocation_offset: 0,
            }),
        };
        event.write_slots(STATE_CLEARED);
        Ok(Arc::new(event))
    }

    /// Creates a counter-based event without a pool.
    pub fn create_counter_based(
        device: &Arc<L0Device>,
        desc: &CounterBasedEventDesc,
    ) -> Result<Arc<Self>, ZeError> {
        let mut flags = desc.flags;
        if flags.into_bits() & !CounterBasedFlags::VALID != 0 {
            return Err(ZeError::InvalidArgument);
        }
        if flags.ipc() && flags.has_timestamps() {
            tracing::error!("ipc counter-based events cannot carry timestamps");
            return Err(ZeError::InvalidArgument);
        }
        if !flags.immediate() && !flags.non_immediate() {
            flags.set_immediate(true);
        }
        Ok(Arc::new(Self {
            device: device.clone(),
            slot: None,
            signal_scope: desc.signal,
            wait_scope: desc.wait,
            shareable: flags.ipc(),
            from_ipc_pool: false,
            imported: Vec::new(),
            state: Mutex::new(EventState {
                mode: CounterBasedMode::ExplicitlyEnabled,
                counter_based_flags: flags,
                in_order: None,
                signal_value: 0,
                allocation_offset: 0,
            }),
        }))
    }

    /// Builds an event around counter storage opened from another process.
    pub(crate) fn new_imported(
        device: Arc<L0Device>,
        in_order: Arc<InOrderExecInfo>,
        signal_value: u64,
        counter_based_flags: CounterBasedFlags,
        signal_scope: EventScope,
        wait_scope: EventScope,
        imported: Vec<Arc<GraphicsAllocation>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device,
            slot: None,
            signal_scope,
            wait_scope,
            shareable: counter_based_flags.ipc(),
            from_ipc_pool: true,
            imported,
            state: Mutex::new(EventState {
                mode: CounterBasedMode::ExplicitlyEnabled,
                counter_based_flags,
                in_order: Some(in_order),
                signal_value,
                allocation_offset: 0,
            }),
        })
    }

    pub fn device(&self) -> &Arc<L0Device> {
        &self.device
    }

    pub fn signal_scope(&self) -> EventScope {
        self.signal_scope
    }

    pub fn wait_scope(&self) -> EventScope {
        self.wait_scope
    }

    /// Whether [`Event::get_ipc_handle`] may export the event.
    pub fn is_shareable(&self) -> bool {
        self.shareable
    }

    /// Whether the event was opened from another process's handle.
    pub fn is_from_ipc_pool(&self) -> bool {
        self.from_ipc_pool
    }

    pub fn counter_based_mode(&self) -> CounterBasedMode {
        self.state.lock().mode
    }

    pub fn counter_based_flags(&self) -> CounterBasedFlags {
        self.state.lock().counter_based_flags
    }

    /// Whether completion currently follows an in-order counter.
    pub fn is_counter_based(&self) -> bool {
        matches!(
            self.counter_based_mode(),
            CounterBasedMode::ExplicitlyEnabled | CounterBasedMode::ImplicitlyEnabled
        )
    }

    /// The counter the event was last signalled on.
    pub fn in_order_exec_info(&self) -> Option<Arc<InOrderExecInfo>> {
        self.state.lock().in_order.clone()
    }

    /// The counter value that completes the event, as recorded when it was
    /// signalled.
    pub fn in_order_exec_signal_value(&self) -> u64 {
        self.state.lock().signal_value
    }

    /// Where in the counter storage the event's signal lands, fixed when
    /// the event was signalled.
    pub fn in_order_allocation_offset(&self) -> u64 {
        self.state.lock().allocation_offset
    }

    /// The counter value that completes the event for the latest submission
    /// of the list that signals it.
    pub fn effective_signal_value(&self) -> u64 {
        let state = self.state.lock();
        match &state.in_order {
            Some(info) => info.value_for_latest_submission(state.signal_value),
            None => state.signal_value,
        }
    }

    /// GPU address of the first partition slot of a pool event.
    pub fn slot_address(&self) -> Option<u64> {
        self.slot
            .as_ref()
            .map(|slot| slot.pool.slot_address(slot.index))
    }

    /// Storage of a pool event's slots.
    pub(crate) fn pool_allocation(&self) -> Option<&Arc<GraphicsAllocation>> {
        self.slot.as_ref().map(|slot| &slot.pool.allocation)
    }

    /// The number of pool slot partitions a device wait checks.
    pub fn num_partitions(&self) -> u32 {
        self.device.num_partitions()
    }

    pub fn partition_stride(&self) -> u64 {
        self.device.family().partition_stride()
    }

    fn write_slots(&self, state: u32) {
        let Some(slot) = &self.slot else {
            return;
        };
        let base = u64::from(slot.index) * slot.pool.slot_size;
        for partition in 0..self.num_partitions() {
            let offset = base + u64::from(partition) * self.partition_stride();
            slot.pool
                .allocation
                .storage()
                .write_u32(offset as usize, state);
        }
    }

    fn slots_signaled(&self) -> bool {
        let Some(slot) = &self.slot else {
            return false;
        };
        let base = u64::from(slot.index) * slot.pool.slot_size;
        (0..self.num_partitions()).all(|partition| {
            let offset = base + u64::from(partition) * self.partition_stride();
            slot.pool.allocation.storage().read_u32(offset as usize) == STATE_SIGNALED
        })
    }

    /// Records that the next completion of the event is `info` reaching
    /// `signal_value`.
    pub(crate) fn update_in_order_exec_state(&self, info: &Arc<InOrderExecInfo>, signal_value: u64) {
        let mut state = self.state.lock();
        state.in_order = Some(info.clone());
        state.signal_value = signal_value;
        state.allocation_offset = info.allocation_offset();
    }

    /// Converts a regular event to counter-based. Only events that were
    /// never disabled can be converted.
    pub fn enable_counter_based_mode(&self, flags: CounterBasedFlags) -> bool {
        let mut state = self.state.lock();
        if state.mode != CounterBasedMode::InitiallyDisabled {
            return false;
        }
        state.mode = CounterBasedMode::ImplicitlyEnabled;
        state.counter_based_flags = flags;
        true
    }

    /// Stops a regular event from being converted to counter-based.
    pub fn make_counter_based_implicitly_disabled(&self) {
        let mut state = self.state.lock();
        if matches!(
            state.mode,
            CounterBasedMode::InitiallyDisabled | CounterBasedMode::ImplicitlyEnabled
        ) {
            state.mode = CounterBasedMode::ImplicitlyDisabled;
            state.counter_based_flags = CounterBasedFlags::new();
            state.in_order = None;
            state.signal_value = 0;
            state.allocation_offset = 0;
        }
    }

    /// Returns `Ok` if the event is complete, `NotReady` otherwise.
    pub fn query_status(&self) -> Result<(), ZeError> {
        let (in_order, signal_value, allocation_offset, counter_based) = {
            let state = self.state.lock();
            let counter_based = matches!(
                state.mode,
                CounterBasedMode::ExplicitlyEnabled | CounterBasedMode::ImplicitlyEnabled
            );
            (
                state.in_order.clone(),
                state.signal_value,
                state.allocation_offset,
                counter_based,
            )
        };
        let ready = if counter_based {
            match in_order {
                Some(info) => info.is_counter_already_done_at(
                    info.value_for_latest_submission(signal_value),
                    allocation_offset,
                ),
                None => true,
            }
        } else {
            self.slots_signaled()
        };
        if ready {
            Ok(())
        } else {
            Err(ZeError::NotReady)
        }
    }

    /// Waits up to `timeout` for the event to complete.
    pub fn host_synchronize(&self, timeout: Duration) -> Result<(), ZeError> {
        let start = Instant::now();
        loop {
            if self.query_status().is_ok() {
                return Ok(());
            }
            for engine in self.device.device().all_engines() {
                let status = engine.csr.wait_for_completion_with_timeout(
                    engine.csr.latest_flushed_task_count(),
                    Duration::ZERO,
                );
                if status == WaitStatus::GpuHang {
                    tracing::error!(
                        context_id = engine.context_id(),
                        "gpu hang while synchronizing event"
                    );
                    return Err(ZeError::DeviceLost);
                }
            }
            if self.query_status().is_ok() {
                return Ok(());
            }
            if start.elapsed() >= timeout {
                return Err(ZeError::NotReady);
            }
            std::thread::yield_now();
        }
    }

    /// Signals the event from the host.
    pub fn host_signal(&self) -> Result<(), ZeError> {
        if self.is_counter_based() {
            return Err(ZeError::UnsupportedFeature);
        }
        self.write_slots(STATE_SIGNALED);
        Ok(())
    }

    /// Resets the event from the host. An implicitly converted event goes
    /// back to being a regular event.
    pub fn host_reset(&self) -> Result<(), ZeError> {
        {
            let mut state = self.state.lock();
            match state.mode {
                CounterBasedMode::ExplicitlyEnabled => return Err(ZeError::UnsupportedFeature),
                CounterBasedMode::ImplicitlyEnabled => {
                    state.mode = CounterBasedMode::InitiallyDisabled;
                    state.counter_based_flags = CounterBasedFlags::new();
                    state.in_order = None;
                    state.signal_value = 0;
                    state.allocation_offset = 0;
                }
                CounterBasedMode::InitiallyDisabled | CounterBasedMode::ImplicitlyDisabled => {}
            }
        }
        self.write_slots(STATE_CLEARED);
        Ok(())
    }
}
