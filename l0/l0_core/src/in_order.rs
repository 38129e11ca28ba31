// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-order execution counters.
//!
//! An in-order command list (or a standalone counter-based event) owns a
//! monotonically increasing counter. Each dependent operation signals the
//! next value, and anything that depends on the operation waits for the
//! counter to reach that value. On devices with several partitions every
//! partition keeps its own copy of the counter at a fixed stride, and a
//! value is only reached once every copy has reached it.

use crate::counter_allocator::CounterLocation;
use crate::counter_allocator::CounterNode;
use crate::L0Device;
use crate::ZeError;
use gpu_memory::GraphicsAllocation;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Default)]
struct CounterState {
    counter_value: u64,
    allocation_offset: u64,
    regular_cmd_list_submission_counter: u64,
    last_waited_counter_value: u64,
}

/// Describes where an in-order counter lives and how to wait for it.
pub struct InOrderExecInfo {
    node: CounterNode,
    capacity: u64,
    num_device_partitions_to_wait: u32,
    num_host_partitions_to_wait: u32,
    partition_stride: u64,
    qword: bool,
    atomic_device_signalling: bool,
    regular_cmd_list: bool,
    state: Mutex<CounterState>,
}

impl fmt::Debug for InOrderExecInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InOrderExecInfo")
            .field("node", &self.node)
            .field("device_partitions", &self.num_device_partitions_to_wait)
            .field("host_partitions", &self.num_host_partitions_to_wait)
            .field("regular", &self.regular_cmd_list)
            .field("counter_value", &state.counter_value)
            .field("allocation_offset", &state.allocation_offset)
            .finish()
    }
}

impl InOrderExecInfo {
    /// Allocates a counter for `device`.
    pub fn new(device: &L0Device, regular_cmd_list: bool) -> Result<Arc<Self>, ZeError> {
        let allocator = device.counter_allocator();
        let family = device.family();
        let partitions = device.num_partitions();
        let stride = family.partition_stride();
        debug_assert!(partitions <= family.max_partitions());
        debug_assert!(u64::from(partitions) * stride <= allocator.node_size());

        let node = allocator.allocate()?;
        Ok(Arc::new(Self {
            node,
            capacity: allocator.node_size(),
            num_device_partitions_to_wait: partitions,
            num_host_partitions_to_wait: partitions,
            partition_stride: stride,
            qword: family.qword_counters(),
            atomic_device_signalling: device.atomic_signalling(),
            regular_cmd_list,
            state: Mutex::new(CounterState::default()),
        }))
    }

    /// Wraps counter storage owned by the caller, such as memory opened from
    /// another process. The counter starts at `counter_value`.
    ///
    /// Without a separate host location, host waits read the device
    /// location, so the host and device partition counts must match. Neither
    /// count may exceed `max_partitions`, and every partition slot must be
    /// aligned to the counter width and lie within its allocation.
    pub fn create_from_external_allocation(
        device: CounterLocation,
        host: Option<CounterLocation>,
        counter_value: u64,
        num_device_partitions_to_wait: u32,
        num_host_partitions_to_wait: u32,
        max_partitions: u32,
        partition_stride: u64,
        qword: bool,
    ) -> Result<Arc<Self>, ZeError> {
        let valid_count = |count: u32| (1..=max_partitions).contains(&count);
        if !valid_count(num_device_partitions_to_wait)
            || !valid_count(num_host_partitions_to_wait)
        {
            tracing::error!(
                num_device_partitions_to_wait,
                num_host_partitions_to_wait,
                max_partitions,
                "invalid partition count for external counter"
            );
            return Err(ZeError::InvalidArgument);
        }
        let width = if qword { 8 } else { 4 };
        if partition_stride % width != 0
            || device.offset % width != 0
            || host.as_ref().is_some_and(|host| host.offset % width != 0)
        {
            tracing::error!(
                device_offset = device.offset,
                partition_stride,
                "misaligned external counter"
            );
            return Err(ZeError::InvalidArgument);
        }
        if host.is_none() && num_host_partitions_to_wait != num_device_partitions_to_wait {
            tracing::error!(
                num_device_partitions_to_wait,
                num_host_partitions_to_wait,
                "partition counts differ without host storage"
            );
            return Err(ZeError::InvalidArgument);
        }
        let fits = |location: &CounterLocation, partitions: u32| {
            u64::from(partitions)
                .checked_mul(partition_stride)
                .and_then(|span| location.offset.checked_add(span))
                .is_some_and(|end| end <= location.allocation.size())
        };
        if !fits(&device, num_device_partitions_to_wait)
            || host
                .as_ref()
                .is_some_and(|host| !fits(host, num_host_partitions_to_wait))
        {
            return Err(ZeError::InvalidArgument);
        }

        let capacity = device.allocation.size() - device.offset;
        Ok(Arc::new(Self {
            node: CounterNode::external(device, host),
            capacity,
            num_device_partitions_to_wait,
            num_host_partitions_to_wait,
            partition_stride,
            qword,
            atomic_device_signalling: false,
            regular_cmd_list: false,
            state: Mutex::new(CounterState {
                counter_value,
                ..Default::default()
            }),
        }))
    }

    /// Advances the counter and returns the value the next operation
    /// signals.
    pub fn next_value(&self) -> u64 {
        let mut state = self.state.lock();
        state.counter_value += 1;
        state.counter_value
    }

    /// The last value handed out.
    pub fn counter_value(&self) -> u64 {
        self.state.lock().counter_value
    }

    /// Whether host waits read a separate host-visible copy of the counter.
    pub fn is_host_storage_duplicated(&self) -> bool {
        self.node.host().is_some()
    }

    /// Whether the counter storage belongs to someone else, such as an
    /// exporting process.
    pub fn is_external(&self) -> bool {
        self.node.is_external()
    }

    pub fn is_regular_cmd_list(&self) -> bool {
        self.regular_cmd_list
    }

    /// Whether counter slots are 64 bits wide.
    pub fn is_qword(&self) -> bool {
        self.qword
    }

    /// Whether partitions signal with one atomic increment each instead of
    /// storing the value.
    pub fn is_atomic_device_signalling(&self) -> bool {
        self.atomic_device_signalling
    }

    pub fn num_device_partitions_to_wait(&self) -> u32 {
        self.num_device_partitions_to_wait
    }

    pub fn num_host_partitions_to_wait(&self) -> u32 {
        self.num_host_partitions_to_wait
    }

    /// Distance in bytes between the slots of consecutive partitions.
    pub fn partition_stride(&self) -> u64 {
        self.partition_stride
    }

    pub fn device_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.node.device().allocation
    }

    /// The allocation host waits read. This is the device allocation unless
    /// host storage is duplicated.
    pub fn host_allocation(&self) -> &Arc<GraphicsAllocation> {
        &self.host_location().allocation
    }

    fn host_location(&self) -> &CounterLocation {
        self.node.host().unwrap_or(self.node.device())
    }

    /// The current offset of the counter within its node.
    pub fn allocation_offset(&self) -> u64 {
        self.state.lock().allocation_offset
    }

    /// The device address of partition 0 at the current offset.
    pub fn base_device_address(&self) -> u64 {
        self.node.device().gpu_address() + self.allocation_offset()
    }

    /// The device address of `partition`'s slot when the counter sits at
    /// `allocation_offset`.
    pub fn device_partition_address_at(&self, allocation_offset: u64, partition: u32) -> u64 {
        self.node.device().gpu_address()
            + allocation_offset
            + u64::from(partition) * self.partition_stride
    }

    /// The address of partition 0 of the storage host waits read.
    pub fn base_host_address(&self) -> u64 {
        self.host_location().gpu_address() + self.allocation_offset()
    }

    pub fn device_partition_address(&self, partition: u32) -> u64 {
        self.device_partition_address_at(self.allocation_offset(), partition)
    }

    pub fn host_partition_address(&self, partition: u32) -> u64 {
        self.base_host_address() + u64::from(partition) * self.partition_stride
    }

    /// Byte offset of the counter within the device allocation, including
    /// the allocation offset.
    pub fn counter_offset(&self) -> u64 {
        self.counter_offset_at(self.allocation_offset())
    }

    /// Byte offset of the counter within the device allocation when it sits
    /// at `allocation_offset`.
    pub fn counter_offset_at(&self, allocation_offset: u64) -> u64 {
        self.node.device().offset + allocation_offset
    }

    /// Moves the counter within its storage. The new slots start at zero.
    pub fn set_allocation_offset(&self, offset: u64) -> Result<(), ZeError> {
        let span = u64::from(
            self.num_device_partitions_to_wait
                .max(self.num_host_partitions_to_wait),
        ) * self.partition_stride;
        if offset % 8 != 0 || offset.checked_add(span).is_none_or(|end| end > self.capacity) {
            return Err(ZeError::InvalidArgument);
        }
        let mut state = self.state.lock();
        state.allocation_offset = offset;
        self.clear_slots(offset);
        Ok(())
    }

    /// How many times the owning regular list has been submitted.
    pub fn regular_cmd_list_submission_counter(&self) -> u64 {
        self.state.lock().regular_cmd_list_submission_counter
    }

    pub fn add_regular_cmd_list_submission_counter(&self, count: u64) {
        self.state.lock().regular_cmd_list_submission_counter += count;
    }

    /// Translates a value signalled by a regular command list's first
    /// submission to the value signalled by its latest submission.
    pub fn value_for_latest_submission(&self, value: u64) -> u64 {
        let state = self.state.lock();
        if !self.regular_cmd_list || state.regular_cmd_list_submission_counter == 0 {
            return value;
        }
        value + (state.regular_cmd_list_submission_counter - 1) * state.counter_value
    }

    /// The highest value a host wait has seen completed.
    pub fn last_waited_counter_value(&self) -> u64 {
        self.state.lock().last_waited_counter_value
    }

    fn read(&self, location: &CounterLocation, allocation_offset: u64, partition: u32) -> u64 {
        let offset = (location.offset
            + allocation_offset
            + u64::from(partition) * self.partition_stride) as usize;
        let storage = location.allocation.storage();
        if self.qword {
            storage.read_u64(offset)
        } else {
            storage.read_u32(offset).into()
        }
    }

    /// The device copy of the counter for `partition`.
    pub fn read_device_counter(&self, partition: u32) -> u64 {
        let allocation_offset = self.allocation_offset();
        self.read(self.node.device(), allocation_offset, partition)
    }

    /// The copy of the counter host waits observe for `partition`.
    pub fn read_host_counter(&self, partition: u32) -> u64 {
        let allocation_offset = self.allocation_offset();
        self.read(self.host_location(), allocation_offset, partition)
    }

    /// Whether every partition has reached `wait_value`, as seen from the
    /// host.
    pub fn is_counter_already_done(&self, wait_value: u64) -> bool {
        let allocation_offset = self.allocation_offset();
        self.is_counter_already_done_at(wait_value, allocation_offset)
    }

    /// Like [`Self::is_counter_already_done`], for a signal that landed at
    /// `allocation_offset`.
    pub fn is_counter_already_done_at(&self, wait_value: u64, allocation_offset: u64) -> bool {
        let mut state = self.state.lock();
        let current = state.allocation_offset == allocation_offset;
        if current && state.last_waited_counter_value >= wait_value {
            return true;
        }
        let (location, partitions) = match self.node.host() {
            Some(host) => (host, self.num_host_partitions_to_wait),
            None => (self.node.device(), self.num_device_partitions_to_wait),
        };
        let done = (0..partitions)
            .all(|partition| self.read(location, allocation_offset, partition) >= wait_value);
        if done && current {
            state.last_waited_counter_value = wait_value;
        }
        done
    }

    fn clear_slots(&self, allocation_offset: u64) {
        let partitions = self
            .num_device_partitions_to_wait
            .max(self.num_host_partitions_to_wait);
        let zeroes = vec![0; (u64::from(partitions) * self.partition_stride) as usize];
        for location in std::iter::once(self.node.device()).chain(self.node.host()) {
            location
                .allocation
                .storage()
                .write_bytes((location.offset + allocation_offset) as usize, &zeroes);
        }
    }

    /// Restarts the counter from zero. No submitted work may still reference
    /// the counter.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        *state = CounterState::default();
        self.clear_slots(0);
    }
}
