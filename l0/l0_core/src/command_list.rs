// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command lists.
//!
//! Every append runs the same sequence: validate the events, encode waits
//! for dependencies, encode the operation, then signal. In-order lists
//! signal their counter after every operation and record the counter value
//! in the signal event. Immediate lists submit after each append; regular
//! lists are closed and executed through a
//! [`CommandQueue`](crate::CommandQueue).

use crate::encoder::encode_signal_counter;
use crate::encoder::encode_store_event_slots;
use crate::encoder::encode_wait_on_counter;
use crate::encoder::encode_wait_on_event_slots;
use crate::encoder::CounterPatch;
use crate::event::CounterBasedFlags;
use crate::event::CounterBasedMode;
use crate::event::Event;
use crate::event::STATE_SIGNALED;
use crate::in_order::InOrderExecInfo;
use crate::GfxFamily;
use crate::L0Device;
use crate::ZeError;
use command_stream::commands::BlitCopy;
use command_stream::commands::CompareOperation;
use command_stream::commands::ComputeWalker;
use command_stream::commands::MiBatchBufferEnd;
use command_stream::commands::MiSemaphoreWait;
use command_stream::commands::MiStoreDataImm;
use command_stream::commands::PipeControl;
use command_stream::CmdRef;
use command_stream::CommandStream;
use command_stream::StreamError;
use gpu_memory::BatchBuffer;
use gpu_memory::EngineControl;
use gpu_memory::EngineType;
use gpu_memory::GraphicsAllocation;
use gpu_memory::HostFunctionStreamer;
use gpu_memory::HostFunctionTicket;
use gpu_memory::SubmissionError;
use gpu_memory::WaitStatus;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// A callback run on the host when a command stream reaches it.
pub type HostFunction = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommandListKind {
    /// Recorded once, executed any number of times through a queue.
    Regular,
    /// Submitted as commands are appended.
    Immediate,
}

#[derive(Debug, Default, Copy, Clone)]
pub struct CommandListDesc {
    pub in_order: bool,
    /// Dependencies on the list's own earlier work are encoded explicitly.
    pub relaxed_ordering: bool,
    /// The engine to submit to. Defaults to the device's first engine.
    pub engine: Option<EngineType>,
}

/// A kernel dispatch.
#[derive(Debug, Clone, Default)]
pub struct KernelLaunch {
    pub kernel_id: u32,
    pub group_count: u32,
    /// Allocations the kernel accesses.
    pub residency: Vec<Arc<GraphicsAllocation>>,
}

pub(crate) enum Patch {
    Counter(CounterPatch),
    HostFunction {
        store: CmdRef<MiStoreDataImm>,
        wait: CmdRef<MiSemaphoreWait>,
        callback: HostFunction,
    },
}

/// A recorded sequence of GPU operations for one engine.
pub struct CommandList {
    device: Arc<L0Device>,
    kind: CommandListKind,
    family: GfxFamily,
    engine: EngineControl,
    in_order: Option<Arc<InOrderExecInfo>>,
    relaxed_ordering: bool,
    stream: CommandStream,
    residency: Vec<Arc<GraphicsAllocation>>,
    base_residency: usize,
    patches: Vec<Patch>,
    closed: bool,
    task_count: u64,
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("kind", &self.kind)
            .field("family", &self.family)
            .field("context_id", &self.engine.context_id())
            .field("in_order", &self.in_order)
            .field("used", &self.stream.used())
            .field("closed", &self.closed)
            .finish()
    }
}

impl CommandList {
    /// Creates an empty list on the engine `desc` selects. In-order lists
    /// take a counter node from the device.
    pub fn create(
        device: &Arc<L0Device>,
        kind: CommandListKind,
        desc: &CommandListDesc,
    ) -> Result<Self, ZeError> {
        let engine = match desc.engine {
            Some(engine_type) => device.device().engine(engine_type),
            None => device.device().default_engine(),
        }
        .ok_or(ZeError::InvalidArgument)?
        .clone();

        let in_order = if desc.in_order {
            Some(InOrderExecInfo::new(device, kind == CommandListKind::Regular)?)
        } else {
            None
        };
        let residency: Vec<_> = in_order
            .iter()
            .flat_map(|info| {
                let mut allocations = vec![info.device_allocation().clone()];
                if info.is_host_storage_duplicated() {
                    allocations.push(info.host_allocation().clone());
                }
                allocations
            })
            .collect();

        tracing::debug!(
            ?kind,
            family = device.family().name(),
            context_id = engine.context_id(),
            in_order = desc.in_order,
            "created command list"
        );
        Ok(Self {
            device: device.clone(),
            kind,
            family: device.family(),
            engine,
            base_residency: residency.len(),
            in_order,
            relaxed_ordering: desc.relaxed_ordering && desc.in_order,
            stream: CommandStream::new(),
            residency,
            patches: Vec::new(),
            closed: false,
            task_count: 0,
        })
    }

    pub fn kind(&self) -> CommandListKind {
        self.kind
    }

    pub fn family(&self) -> GfxFamily {
        self.family
    }

    pub fn device(&self) -> &Arc<L0Device> {
        &self.device
    }

    pub fn engine(&self) -> &EngineControl {
        &self.engine
    }

    pub fn is_in_order(&self) -> bool {
        self.in_order.is_some()
    }

    /// The counter of an in-order list.
    pub fn in_order_exec_info(&self) -> Option<&Arc<InOrderExecInfo>> {
        self.in_order.as_ref()
    }

    /// Commands recorded and not yet submitted.
    pub fn stream(&self) -> &CommandStream {
        &self.stream
    }

    /// Allocations the next submission makes resident.
    pub fn residency(&self) -> &[Arc<GraphicsAllocation>] {
        &self.residency
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Task count of the latest submission of an immediate list.
    pub fn task_count(&self) -> u64 {
        self.task_count
    }

    fn add_residency(&mut self, allocation: &Arc<GraphicsAllocation>) {
        if !self.residency.iter().any(|a| Arc::ptr_eq(a, allocation)) {
            self.residency.push(allocation.clone());
        }
    }

    fn dc_flush_required(&self, event: &Event) -> bool {
        self.engine.csr.dc_flush_support() && event.signal_scope().host()
    }

    fn validate(&self, signal: Option<&Arc<Event>>, waits: &[&Arc<Event>]) -> Result<(), ZeError> {
        if self.closed {
            return Err(ZeError::InvalidArgument);
        }
        if let Some(event) = signal {
            if event.counter_based_mode() == CounterBasedMode::ExplicitlyEnabled
                && !self.is_in_order()
            {
                tracing::error!("counter-based events need an in-order command list");
                return Err(ZeError::InvalidArgument);
            }
            if event.is_from_ipc_pool() && event.is_counter_based() {
                return Err(ZeError::InvalidArgument);
            }
        }
        for event in waits {
            if event.is_counter_based() && event.in_order_exec_info().is_none() {
                tracing::error!("waiting on a counter-based event that was never signalled");
                return Err(ZeError::InvalidArgument);
            }
        }
        Ok(())
    }

    fn program_dependencies(&mut self, waits: &[&Arc<Event>]) {
        let regular = self.kind == CommandListKind::Regular;
        if self.relaxed_ordering {
            if let Some(info) = &self.in_order {
                let value = info.counter_value();
                if value > 0 {
                    let patches = encode_wait_on_counter(
                        &mut self.stream,
                        info,
                        value,
                        info.allocation_offset(),
                        regular,
                    );
                    self.patches.extend(patches.into_iter().map(Patch::Counter));
                }
            }
        }

        for event in waits {
            if let Some(allocation) = event.pool_allocation() {
                self.add_residency(allocation);
            }
            if event.is_counter_based() {
                let Some(info) = event.in_order_exec_info() else {
                    continue;
                };
                if self
                    .in_order
                    .as_ref()
                    .is_some_and(|own| Arc::ptr_eq(own, &info))
                {
                    continue;
                }
                let value = event.effective_signal_value();
                let allocation_offset = event.in_order_allocation_offset();
                if info.is_counter_already_done_at(value, allocation_offset) {
                    tracing::trace!(value, "dependency already satisfied");
                    continue;
                }
                self.add_residency(info.device_allocation());
                encode_wait_on_counter(&mut self.stream, &info, value, allocation_offset, false);
            } else if let Some(address) = event.slot_address() {
                encode_wait_on_event_slots(
                    &mut self.stream,
                    address,
                    event.num_partitions(),
                    event.partition_stride(),
                    STATE_SIGNALED,
                );
            }
        }
    }

    fn program_signal(&mut self, signal: Option<&Arc<Event>>) {
        let dc_flush = signal.is_some_and(|event| self.dc_flush_required(event));
        if dc_flush {
            self.stream.append(PipeControl::barrier(true));
        }

        let signalled = self.in_order.clone().map(|info| {
            let value = info.next_value();
            let patches = encode_signal_counter(&mut self.stream, &info, value);
            if self.kind == CommandListKind::Regular {
                self.patches.extend(patches.into_iter().map(Patch::Counter));
            }
            (info, value)
        });

        let Some(event) = signal else {
            return;
        };
        if let Some(allocation) = event.pool_allocation() {
            self.add_residency(allocation);
        }
        match (signalled, event.counter_based_mode()) {
            (Some((info, value)), CounterBasedMode::ExplicitlyEnabled) => {
                event.update_in_order_exec_state(&info, value);
            }
            (
                Some((info, value)),
                CounterBasedMode::InitiallyDisabled | CounterBasedMode::ImplicitlyEnabled,
            ) if self.kind == CommandListKind::Immediate && !dc_flush => {
                event.enable_counter_based_mode(CounterBasedFlags::new().with_immediate(true));
                event.update_in_order_exec_state(&info, value);
            }
            _ => {
                if !dc_flush {
                    event.make_counter_based_implicitly_disabled();
                }
                if let Some(address) = event.slot_address() {
                    encode_store_event_slots(
                        &mut self.stream,
                        address,
                        event.num_partitions(),
                        event.partition_stride(),
                        STATE_SIGNALED,
                    );
                }
            }
        }
    }

    fn append_with_dependencies(
        &mut self,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
        body: impl FnOnce(&mut Self),
    ) -> Result<(), ZeError> {
        self.validate(signal, waits)?;
        self.program_dependencies(waits);
        body(self);
        self.program_signal(signal);
        if self.kind == CommandListKind::Immediate {
            self.flush()?;
        }
        Ok(())
    }

    /// Dispatches a kernel after `waits` complete, then signals `signal`.
    pub fn append_launch_kernel(
        &mut self,
        launch: &KernelLaunch,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<(), ZeError> {
        if launch.group_count == 0 {
            return Err(ZeError::InvalidArgument);
        }
        let partitions = self.device.num_partitions();
        self.append_with_dependencies(signal, waits, |list| {
            for allocation in &launch.residency {
                list.add_residency(allocation);
            }
            list.stream.append(ComputeWalker::new(
                launch.kernel_id,
                launch.group_count,
                partitions,
            ));
        })
    }

    /// Copies `size` bytes between two GPU addresses.
    pub fn append_memory_copy(
        &mut self,
        dst: u64,
        src: u64,
        size: u64,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<(), ZeError> {
        let size32 = u32::try_from(size).map_err(|_| ZeError::InvalidArgument)?;
        if size == 0 {
            return Err(ZeError::InvalidArgument);
        }
        let memory_manager = self.device.memory_manager();
        let root = self.device.root_device_index();
        let find = |address: u64| {
            memory_manager
                .find_allocation(root, address)
                .filter(|allocation| allocation.contains(address + size - 1))
                .ok_or(ZeError::InvalidArgument)
        };
        let dst_allocation = find(dst)?;
        let src_allocation = find(src)?;
        self.append_with_dependencies(signal, waits, |list| {
            list.add_residency(&dst_allocation);
            list.add_residency(&src_allocation);
            list.stream.append(BlitCopy::new(dst, src, size32));
        })
    }

    /// Orders everything after the barrier behind everything before it.
    pub fn append_barrier(
        &mut self,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<(), ZeError> {
        self.append_with_dependencies(signal, waits, |list| {
            list.stream.append(PipeControl::barrier(false));
        })
    }

    /// Runs `callback` on the host when the engine reaches this point. The
    /// engine does not continue until the callback returns.
    pub fn append_host_function(
        &mut self,
        callback: HostFunction,
        signal: Option<&Arc<Event>>,
        waits: &[&Arc<Event>],
    ) -> Result<(), ZeError> {
        let engine = self.engine.clone();
        let streamer = engine
            .csr
            .host_function_streamer()
            .ok_or(ZeError::UnsupportedFeature)?;
        self.append_with_dependencies(signal, waits, |list| match list.kind {
            CommandListKind::Immediate => {
                let ticket = register_host_function(streamer, &callback);
                list.stream.append(MiStoreDataImm::new(
                    ticket.dispatch_address,
                    ticket.id,
                    true,
                ));
                list.stream.append(MiSemaphoreWait::new(
                    ticket.dispatch_address,
                    0,
                    CompareOperation::Equal,
                    false,
                ));
            }
            CommandListKind::Regular => {
                // Registered again on every execution.
                let store = list.stream.append(MiStoreDataImm::new(0, 0, true));
                let wait = list.stream.append(MiSemaphoreWait::new(
                    0,
                    0,
                    CompareOperation::Equal,
                    false,
                ));
                list.patches.push(Patch::HostFunction {
                    store,
                    wait,
                    callback,
                });
            }
        })
    }

    /// Blocks the engine until every event in `waits` completes.
    pub fn append_wait_on_events(&mut self, waits: &[&Arc<Event>]) -> Result<(), ZeError> {
        if waits.is_empty() {
            return Err(ZeError::InvalidArgument);
        }
        self.append_with_dependencies(None, waits, |_| {})
    }

    /// Signals `event` once earlier work on the list completes.
    pub fn append_signal_event(&mut self, event: &Arc<Event>) -> Result<(), ZeError> {
        self.append_with_dependencies(Some(event), &[], |_| {})
    }

    /// Finishes recording a regular list.
    pub fn close(&mut self) -> Result<(), ZeError> {
        if self.kind != CommandListKind::Regular {
            return Err(ZeError::InvalidArgument);
        }
        self.closed = true;
        Ok(())
    }

    /// Discards recorded commands and restarts the in-order counter. No
    /// submitted work may still be running.
    pub fn reset(&mut self) {
        self.stream.clear();
        self.patches.clear();
        self.residency.truncate(self.base_residency);
        self.closed = false;
        if let Some(info) = &self.in_order {
            info.reset();
        }
    }

    /// Rewrites counter values and host function tickets for the next
    /// execution of a regular list. The submission is only counted once
    /// every patch applied.
    pub(crate) fn prepare_for_submission(
        &mut self,
        streamer: Option<&dyn HostFunctionStreamer>,
    ) -> Result<(), ZeError> {
        if streamer.is_none()
            && self
                .patches
                .iter()
                .any(|patch| matches!(patch, Patch::HostFunction { .. }))
        {
            return Err(ZeError::UnsupportedFeature);
        }
        let (submission, increment) = match &self.in_order {
            Some(info) => (
                info.regular_cmd_list_submission_counter() + 1,
                info.counter_value(),
            ),
            None => (1, 0),
        };
        for patch in &self.patches {
            let result = match patch {
                Patch::Counter(patch) => patch.apply(&mut self.stream, submission, increment),
                Patch::HostFunction {
                    store,
                    wait,
                    callback,
                } => {
                    let streamer = streamer.ok_or(ZeError::UnsupportedFeature)?;
                    let ticket = register_host_function(streamer, callback);
                    patch_host_function(&mut self.stream, *store, *wait, ticket)
                }
            };
            result.map_err(|err| {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to patch command list"
                );
                ZeError::OutOfResources
            })?;
        }
        if let Some(info) = &self.in_order {
            info.add_regular_cmd_list_submission_counter(1);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ZeError> {
        self.stream.append(MiBatchBufferEnd::new());
        let result = submit(
            &self.device,
            &self.engine,
            self.stream.as_bytes(),
            &self.residency,
        );
        self.stream.clear();
        self.residency.truncate(self.base_residency);
        self.task_count = result?;
        Ok(())
    }

    /// Waits up to `timeout` for everything submitted by an immediate list.
    pub fn host_synchronize(&self, timeout: Duration) -> Result<(), ZeError> {
        if self.kind != CommandListKind::Immediate {
            return Err(ZeError::InvalidArgument);
        }
        wait_for_task_count(&self.engine, self.task_count, timeout)
    }
}

fn register_host_function(
    streamer: &dyn HostFunctionStreamer,
    callback: &HostFunction,
) -> HostFunctionTicket {
    let callback = callback.clone();
    streamer.register(Box::new(move || callback()))
}

fn patch_host_function(
    stream: &mut CommandStream,
    store: CmdRef<MiStoreDataImm>,
    wait: CmdRef<MiSemaphoreWait>,
    ticket: HostFunctionTicket,
) -> Result<(), StreamError> {
    let sdi = stream.get_mut(store)?;
    sdi.address_low = ticket.dispatch_address as u32;
    sdi.address_high = (ticket.dispatch_address >> 32) as u32;
    sdi.data_low = ticket.id as u32;
    sdi.data_high = (ticket.id >> 32) as u32;
    let semaphore = stream.get_mut(wait)?;
    semaphore.address_low = ticket.dispatch_address as u32;
    semaphore.address_high = (ticket.dispatch_address >> 32) as u32;
    Ok(())
}

/// Makes `residency` resident on `engine` and submits `commands`.
pub(crate) fn submit(
    device: &L0Device,
    engine: &EngineControl,
    commands: &[u8],
    residency: &[Arc<GraphicsAllocation>],
) -> Result<u64, ZeError> {
    device.make_resident(&engine.os_context, residency)?;
    let task_count = engine
        .csr
        .flush(&BatchBuffer {
            commands,
            residency,
        })
        .map_err(|err| {
            tracing::error!(
                context_id = engine.context_id(),
                error = &err as &dyn std::error::Error,
                "submission failed"
            );
            match err {
                SubmissionError::GpuHang => ZeError::DeviceLost,
                SubmissionError::Rejected(_) => ZeError::OutOfResources,
            }
        })?;
    for allocation in residency {
        allocation.update_task_count(task_count, engine.context_id());
    }
    tracing::trace!(
        context_id = engine.context_id(),
        task_count,
        bytes = commands.len(),
        "submitted"
    );
    Ok(task_count)
}

pub(crate) fn wait_for_task_count(
    engine: &EngineControl,
    task_count: u64,
    timeout: Duration,
) -> Result<(), ZeError> {
    let deadline = Instant::now().checked_add(timeout);
    loop {
        let remaining = deadline.map_or(timeout, |deadline| {
            deadline.saturating_duration_since(Instant::now())
        });
        match engine
            .csr
            .wait_for_completion_with_timeout(task_count, remaining)
        {
            WaitStatus::Ready => return Ok(()),
            WaitStatus::GpuHang => return Err(ZeError::DeviceLost),
            WaitStatus::NotReady if remaining.is_zero() => return Err(ZeError::NotReady),
            WaitStatus::NotReady => std::thread::yield_now(),
        }
    }
}
