// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Suballocation of in-order counter storage.
//!
//! Counters are small, so nodes are carved out of page sized chunk
//! allocations. When host storage is duplicated, every device chunk has a
//! host chunk and a node occupies the same offset in both.

use crate::ZeError;
use gpu_memory::AllocationProperties;
use gpu_memory::AllocationType;
use gpu_memory::DeviceBitfield;
use gpu_memory::GraphicsAllocation;
use gpu_memory::MemoryManager;
use gpu_memory::MemoryPool;
use gpu_memory::PAGE_SIZE;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

/// Size of each chunk allocation.
pub const COUNTER_CHUNK_SIZE: u64 = PAGE_SIZE;

/// A counter's place in graphics memory.
#[derive(Clone)]
pub struct CounterLocation {
    pub allocation: Arc<GraphicsAllocation>,
    pub offset: u64,
}

impl CounterLocation {
    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address() + self.offset
    }
}

impl fmt::Debug for CounterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterLocation")
            .field("allocation", &self.allocation.id())
            .field("offset", &self.offset)
            .finish()
    }
}

struct Chunk {
    device: Arc<GraphicsAllocation>,
    host: Option<Arc<GraphicsAllocation>>,
}

#[derive(Default)]
struct AllocatorState {
    chunks: Vec<Chunk>,
    free: Vec<(usize, u64)>,
}

struct Lease {
    state: Weak<Mutex<AllocatorState>>,
    chunk: usize,
    offset: u64,
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.lock().free.push((self.chunk, self.offset));
        }
    }
}

/// Storage for one counter: a device location and, when duplicated, a host
/// location. Allocator nodes return to their allocator on drop.
pub struct CounterNode {
    device: CounterLocation,
    host: Option<CounterLocation>,
    lease: Option<Lease>,
}

impl fmt::Debug for CounterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterNode")
            .field("device", &self.device)
            .field("host", &self.host)
            .field("external", &self.is_external())
            .finish()
    }
}

impl CounterNode {
    /// Wraps caller owned storage.
    pub fn external(device: CounterLocation, host: Option<CounterLocation>) -> Self {
        Self {
            device,
            host,
            lease: None,
        }
    }

    pub fn device(&self) -> &CounterLocation {
        &self.device
    }

    /// The host-visible copy, when host storage is duplicated.
    pub fn host(&self) -> Option<&CounterLocation> {
        self.host.as_ref()
    }

    /// Whether the node wraps storage not handed out by an allocator.
    pub fn is_external(&self) -> bool {
        self.lease.is_none()
    }
}

/// Hands out counter nodes for one device.
pub struct CounterAllocator {
    memory_manager: Arc<MemoryManager>,
    root_device_index: u32,
    device_bitfield: DeviceBitfield,
    node_size: u64,
    duplicated: bool,
    state: Arc<Mutex<AllocatorState>>,
}

impl fmt::Debug for CounterAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CounterAllocator")
            .field("root_device_index", &self.root_device_index)
            .field("node_size", &self.node_size)
            .field("duplicated", &self.duplicated)
            .field("chunks", &self.chunk_count())
            .finish()
    }
}

impl CounterAllocator {
    pub fn new(
        memory_manager: Arc<MemoryManager>,
        root_device_index: u32,
        device_bitfield: DeviceBitfield,
        node_size: u64,
        duplicated: bool,
    ) -> Self {
        assert!(node_size > 0 && COUNTER_CHUNK_SIZE % node_size == 0);
        Self {
            memory_manager,
            root_device_index,
            device_bitfield,
            node_size,
            duplicated,
            state: Arc::new(Mutex::new(AllocatorState::default())),
        }
    }

    pub fn node_size(&self) -> u64 {
        self.node_size
    }

    /// Whether nodes carry a separate host location.
    pub fn is_duplicated(&self) -> bool {
        self.duplicated
    }

    pub fn chunk_count(&self) -> usize {
        self.state.lock().chunks.len()
    }

    /// Nodes available without allocating another chunk.
    pub fn free_nodes(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Allocates a zeroed node.
    pub fn allocate(&self) -> Result<CounterNode, ZeError> {
        let mut state = self.state.lock();
        if state.free.is_empty() {
            self.grow(&mut state)?;
        }
        let (chunk_index, offset) = state.free.pop().ok_or(ZeError::OutOfResources)?;
        let chunk = &state.chunks[chunk_index];
        let node = CounterNode {
            device: CounterLocation {
                allocation: chunk.device.clone(),
                offset,
            },
            host: chunk.host.as_ref().map(|host| CounterLocation {
                allocation: host.clone(),
                offset,
            }),
            lease: Some(Lease {
                state: Arc::downgrade(&self.state),
                chunk: chunk_index,
                offset,
            }),
        };
        drop(state);

        let zeroes = vec![0; self.node_size as usize];
        for location in std::iter::once(&node.device).chain(node.host.as_ref()) {
            location
                .allocation
                .storage()
                .write_bytes(location.offset as usize, &zeroes);
        }
        Ok(node)
    }

    fn grow(&self, state: &mut AllocatorState) -> Result<(), ZeError> {
        let pool = if self.duplicated {
            MemoryPool::LocalMemory
        } else {
            MemoryPool::System4KBPages
        };
        let device = self
            .memory_manager
            .allocate_graphics_memory(
                &AllocationProperties::new(
                    self.root_device_index,
                    COUNTER_CHUNK_SIZE,
                    AllocationType::DeviceCounter,
                )
                .with_pool(pool)
                .with_device_bitfield(self.device_bitfield),
            )
            .map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to allocate device counter chunk"
                );
                ZeError::OutOfDeviceMemory
            })?;
        let host = if self.duplicated {
            let host = self
                .memory_manager
                .allocate_graphics_memory(&AllocationProperties::new(
                    self.root_device_index,
                    COUNTER_CHUNK_SIZE,
                    AllocationType::HostCounter,
                ))
                .map_err(|err| {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to allocate host counter chunk"
                    );
                    ZeError::OutOfHostMemory
                })?;
            Some(host)
        } else {
            None
        };

        let chunk_index = state.chunks.len();
        tracing::debug!(
            root_device_index = self.root_device_index,
            chunk_index,
            gpu_address = device.gpu_address(),
            duplicated = self.duplicated,
            "new counter chunk"
        );
        state.chunks.push(Chunk { device, host });
        let nodes = COUNTER_CHUNK_SIZE / self.node_size;
        state
            .free
            .extend((0..nodes).rev().map(|i| (chunk_index, i * self.node_size)));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpu_mock::MockEnvironment;

    fn allocator(env: &MockEnvironment, duplicated: bool) -> CounterAllocator {
        CounterAllocator::new(
            env.memory_manager().clone(),
            0,
            DeviceBitfield::single(0),
            64,
            duplicated,
        )
    }

    #[test]
    fn nodes_are_reused() {
        let env = MockEnvironment::new();
        let allocator = allocator(&env, false);

        let first = allocator.allocate().unwrap();
        let second = allocator.allocate().unwrap();
        assert_eq!(first.device().offset, 0);
        assert_eq!(second.device().offset, 64);
        assert!(Arc::ptr_eq(
            &first.device().allocation,
            &second.device().allocation
        ));
        assert!(first.host().is_none());
        assert_eq!(allocator.chunk_count(), 1);

        let per_chunk = (COUNTER_CHUNK_SIZE / 64) as usize;
        assert_eq!(allocator.free_nodes(), per_chunk - 2);
        first.device().allocation.storage().write_u64(0, 5);
        drop(first);
        assert_eq!(allocator.free_nodes(), per_chunk - 1);

        let again = allocator.allocate().unwrap();
        assert_eq!(again.device().offset, 0);
        assert_eq!(again.device().allocation.storage().read_u64(0), 0);
    }

    #[test]
    fn chunks_grow_on_demand() {
        let env = MockEnvironment::new();
        let allocator = allocator(&env, false);
        let per_chunk = (COUNTER_CHUNK_SIZE / 64) as usize;
        let nodes: Vec<_> = (0..=per_chunk)
            .map(|_| allocator.allocate().unwrap())
            .collect();
        assert_eq!(allocator.chunk_count(), 2);
        assert!(!Arc::ptr_eq(
            &nodes[0].device().allocation,
            &nodes[per_chunk].device().allocation
        ));
    }

    #[test]
    fn duplicated_nodes_share_offsets() {
        let env = MockEnvironment::new();
        let allocator = allocator(&env, true);
        let _first = allocator.allocate().unwrap();
        let node = allocator.allocate().unwrap();
        let host = node.host().unwrap();
        assert_eq!(host.offset, node.device().offset);
        assert_eq!(
            host.allocation.allocation_type(),
            AllocationType::HostCounter
        );
        assert_eq!(node.device().allocation.memory_pool(), MemoryPool::LocalMemory);
        assert!(!node.is_external());
    }

    #[test]
    fn failed_chunk_allocation() {
        let env = MockEnvironment::new();
        let allocator = CounterAllocator::new(
            env.memory_manager().clone(),
            5,
            DeviceBitfield::single(0),
            64,
            false,
        );
        assert_eq!(allocator.allocate().unwrap_err(), ZeError::OutOfDeviceMemory);
    }
}
