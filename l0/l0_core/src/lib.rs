// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Level Zero in-order execution.
//!
//! In-order command lists advance a monotonic counter in GPU memory after
//! every operation. Counter-based events complete when that counter reaches
//! the value recorded at signal time, so dependencies between lists, engines,
//! and processes reduce to semaphore waits on counter memory.

#![cfg(unix)]

mod command_list;
mod command_queue;
mod counter_allocator;
mod device;
pub mod dispatch;
pub mod encoder;
mod event;
mod family;
mod in_order;
mod ipc;
mod result;

pub use command_list::CommandList;
pub use command_list::CommandListDesc;
pub use command_list::CommandListKind;
pub use command_list::HostFunction;
pub use command_list::KernelLaunch;
pub use command_queue::CommandQueue;
pub use counter_allocator::CounterAllocator;
pub use counter_allocator::CounterLocation;
pub use counter_allocator::CounterNode;
pub use counter_allocator::COUNTER_CHUNK_SIZE;
pub use device::L0Device;
pub use device::COUNTER_NODE_SIZE;
pub use event::CounterBasedEventDesc;
pub use event::CounterBasedFlags;
pub use event::CounterBasedMode;
pub use event::Event;
pub use event::EventDesc;
pub use event::EventPool;
pub use event::EventPoolDesc;
pub use event::EventPoolFlags;
pub use event::EventScope;
pub use event::STATE_CLEARED;
pub use event::STATE_SIGNALED;
pub use family::GfxFamily;
pub use in_order::InOrderExecInfo;
pub use ipc::IpcCounterBasedEventData;
pub use ipc::IpcEventCounterBasedHandle;
pub use ipc::IPC_HANDLE_SIZE;
pub use result::ZeError;
pub use result::ZeResult;
