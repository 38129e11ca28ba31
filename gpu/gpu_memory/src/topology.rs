// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Devices, sub-devices, and the OS contexts that submit work on them.

use crate::CommandStreamReceiver;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// The set of tiles (sub-devices) an object spans.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct DeviceBitfield(u32);

impl DeviceBitfield {
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn single(tile: u32) -> Self {
        Self(1 << tile)
    }

    /// All of the first `count` tiles, and tile 0 when `count` is zero.
    pub const fn all(count: u32) -> Self {
        if count <= 1 {
            Self(1)
        } else {
            Self((1 << count) - 1)
        }
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub fn contains(&self, tile: u32) -> bool {
        tile < 32 && self.0 & (1 << tile) != 0
    }

    pub fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub fn tiles(&self) -> impl Iterator<Item = u32> + '_ {
        (0..32).filter(|&tile| self.contains(tile))
    }
}

impl fmt::Debug for DeviceBitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum EngineType {
    Compute,
    Copy,
}

/// A kernel-level submission context.
#[derive(Debug)]
pub struct OsContext {
    context_id: u32,
    root_device_index: u32,
    device_bitfield: DeviceBitfield,
    engine_type: EngineType,
    /// Private address spaces, indexed by tile. Empty when the context uses
    /// the root device's shared address spaces.
    vm_ids: Vec<u32>,
    /// Bumped each time a resource is newly bound into one of the context's
    /// address spaces.
    tlb_flush_counter: AtomicU64,
    last_flushed_tlb_flush_counter: AtomicU64,
}

impl OsContext {
    pub fn new(
        context_id: u32,
        root_device_index: u32,
        device_bitfield: DeviceBitfield,
        engine_type: EngineType,
        vm_ids: Vec<u32>,
    ) -> Self {
        Self {
            context_id,
            root_device_index,
            device_bitfield,
            engine_type,
            vm_ids,
            tlb_flush_counter: AtomicU64::new(0),
            last_flushed_tlb_flush_counter: AtomicU64::new(0),
        }
    }

    pub fn context_id(&self) -> u32 {
        self.context_id
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    pub fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    /// The context's private VM for `tile`, if it has one.
    pub fn vm_id(&self, tile: u32) -> Option<u32> {
        self.vm_ids.get(tile as usize).copied()
    }

    pub fn has_private_vms(&self) -> bool {
        !self.vm_ids.is_empty()
    }

    /// Records that a new resource was bound, so the next submission on this
    /// context must flush the TLB.
    pub fn set_new_resource_bound(&self) {
        self.tlb_flush_counter.fetch_add(1, Ordering::AcqRel);
    }

    pub fn peek_tlb_flush_counter(&self) -> u64 {
        self.tlb_flush_counter.load(Ordering::Acquire)
    }

    pub fn is_tlb_flush_required(&self) -> bool {
        self.peek_tlb_flush_counter()
            > self.last_flushed_tlb_flush_counter.load(Ordering::Acquire)
    }

    /// Records that a submission flushed the TLB for every bind up to
    /// `counter`, a value previously read with
    /// [`Self::peek_tlb_flush_counter`].
    pub fn set_tlb_flushed(&self, counter: u64) {
        self.last_flushed_tlb_flush_counter
            .fetch_max(counter, Ordering::AcqRel);
    }
}

/// An OS context paired with the command stream receiver submitting to it.
#[derive(Clone)]
pub struct EngineControl {
    pub os_context: Arc<OsContext>,
    pub csr: Arc<dyn CommandStreamReceiver>,
}

impl EngineControl {
    pub fn new(csr: Arc<dyn CommandStreamReceiver>) -> Self {
        Self {
            os_context: csr.os_context().clone(),
            csr,
        }
    }

    pub fn context_id(&self) -> u32 {
        self.os_context.context_id()
    }
}

impl fmt::Debug for EngineControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineControl")
            .field("os_context", &self.os_context)
            .finish_non_exhaustive()
    }
}

/// A root device or one of its sub-devices (tiles).
#[derive(Debug)]
pub struct Device {
    root_device_index: u32,
    sub_device_index: Option<u32>,
    device_bitfield: DeviceBitfield,
    engines: Vec<EngineControl>,
    sub_devices: Vec<Arc<Device>>,
}

impl Device {
    pub fn new_root(
        root_device_index: u32,
        device_bitfield: DeviceBitfield,
        engines: Vec<EngineControl>,
        sub_devices: Vec<Arc<Device>>,
    ) -> Self {
        Self {
            root_device_index,
            sub_device_index: None,
            device_bitfield,
            engines,
            sub_devices,
        }
    }

    pub fn new_sub_device(
        root_device_index: u32,
        sub_device_index: u32,
        engines: Vec<EngineControl>,
    ) -> Self {
        Self {
            root_device_index,
            sub_device_index: Some(sub_device_index),
            device_bitfield: DeviceBitfield::single(sub_device_index),
            engines,
            sub_devices: Vec::new(),
        }
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn sub_device_index(&self) -> Option<u32> {
        self.sub_device_index
    }

    pub fn device_bitfield(&self) -> DeviceBitfield {
        self.device_bitfield
    }

    pub fn all_engines(&self) -> &[EngineControl] {
        &self.engines
    }

    pub fn default_engine(&self) -> Option<&EngineControl> {
        self.engines.first()
    }

    pub fn engine(&self, engine_type: EngineType) -> Option<&EngineControl> {
        self.engines
            .iter()
            .find(|e| e.os_context.engine_type() == engine_type)
    }

    pub fn sub_devices(&self) -> &[Arc<Device>] {
        &self.sub_devices
    }

    /// The number of partitions an implicit-scaling dispatch on this device
    /// spreads across.
    pub fn num_partitions(&self) -> u32 {
        self.device_bitfield.count().max(1)
    }
}
