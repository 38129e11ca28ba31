// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A command stream receiver that executes submitted commands on the CPU.

use command_stream::commands::CompareOperation;
use command_stream::commands::CS_GPR_R0;
use command_stream::commands::CS_GPR_R0_HIGH;
use command_stream::parse_commands;
use command_stream::ParsedCommand;
use gpu_memory::BatchBuffer;
use gpu_memory::CommandStreamReceiver;
use gpu_memory::GraphicsAllocation;
use gpu_memory::HostFunctionStreamer;
use gpu_memory::HostFunctionTicket;
use gpu_memory::MemoryManager;
use gpu_memory::OsContext;
use gpu_memory::SubmissionError;
use gpu_memory::WaitStatus;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

/// Runs every simulated engine of an environment until none can make
/// progress, so cross-engine semaphores resolve as producers signal.
#[derive(Default)]
pub struct Scheduler {
    engines: Mutex<Vec<Weak<SimulatedCsr>>>,
}

impl Scheduler {
    /// Creates a scheduler with no engines.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn add(&self, csr: &Arc<SimulatedCsr>) {
        self.engines.lock().push(Arc::downgrade(csr));
    }

    /// Runs all engines until they are idle or blocked.
    pub fn run(&self) {
        loop {
            let engines: Vec<_> = self
                .engines
                .lock()
                .iter()
                .filter_map(Weak::upgrade)
                .collect();
            let mut progress = false;
            for engine in engines {
                progress |= engine.step();
            }
            if !progress {
                break;
            }
        }
    }
}

/// Host function streamer backed by a dispatch slot in graphics memory.
pub struct MockHostFunctionStreamer {
    slot: Arc<GraphicsAllocation>,
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<u64, Box<dyn FnOnce() + Send>>>,
}

impl MockHostFunctionStreamer {
    /// Creates a streamer dispatching through `slot`.
    pub fn new(slot: Arc<GraphicsAllocation>) -> Self {
        Self {
            slot,
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    /// The GPU address engines write ticket ids to.
    pub fn dispatch_address(&self) -> u64 {
        self.slot.gpu_address()
    }

    /// Runs the callback requested through the dispatch slot, if any, and
    /// releases the waiting engine.
    fn service(&self) -> bool {
        let id = self.slot.storage().read_u64(0);
        if id == 0 {
            return false;
        }
        let callback = self.callbacks.lock().remove(&id);
        if let Some(callback) = callback {
            callback();
        } else {
            tracing::warn!(id, "unknown host function");
        }
        self.slot.storage().write_u64(0, 0);
        true
    }

    /// Registered callbacks not yet run.
    pub fn pending(&self) -> usize {
        self.callbacks.lock().len()
    }
}

impl HostFunctionStreamer for MockHostFunctionStreamer {
    fn register(&self, callback: Box<dyn FnOnce() + Send>) -> HostFunctionTicket {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks.lock().insert(id, callback);
        HostFunctionTicket {
            id,
            dispatch_address: self.dispatch_address(),
        }
    }
}

struct PendingBatch {
    task_count: u64,
    commands: Vec<ParsedCommand>,
    next: usize,
}

#[derive(Default)]
struct EngineState {
    pending: VecDeque<PendingBatch>,
    latest_flushed: u64,
    completed: u64,
    gpr0: u64,
}

/// Counters describing what an engine executed.
#[derive(Debug, Default, Clone)]
pub struct ExecutionStats {
    /// Batches submitted.
    pub flushes: u64,
    /// Kernel ids dispatched, in order.
    pub kernels: Vec<u32>,
    /// Pipe controls that flushed the data cache.
    pub dc_flushes: u64,
    /// Addresses that resolved to no allocation.
    pub faults: Vec<u64>,
    /// Residency list sizes, per batch.
    pub residency_sizes: Vec<usize>,
    /// Batches preceded by a TLB flush for newly bound resources.
    pub tlb_flushes: u64,
}

/// A command stream receiver that interprets batches against the memory
/// manager's allocations.
pub struct SimulatedCsr {
    os_context: Arc<OsContext>,
    memory_manager: Weak<MemoryManager>,
    scheduler: Arc<Scheduler>,
    host_functions: Option<MockHostFunctionStreamer>,
    dc_flush_support: bool,
    tbx_mode: bool,
    gpu_hang: AtomicBool,
    completed_override: Mutex<Option<u64>>,
    state: Mutex<EngineState>,
    stats: Mutex<ExecutionStats>,
}

impl SimulatedCsr {
    /// Creates an engine and adds it to `scheduler`.
    pub fn new(
        os_context: Arc<OsContext>,
        memory_manager: &Arc<MemoryManager>,
        scheduler: &Arc<Scheduler>,
        host_functions: Option<MockHostFunctionStreamer>,
        dc_flush_support: bool,
        tbx_mode: bool,
    ) -> Arc<Self> {
        let csr = Arc::new(Self {
            os_context,
            memory_manager: Arc::downgrade(memory_manager),
            scheduler: scheduler.clone(),
            host_functions,
            dc_flush_support,
            tbx_mode,
            gpu_hang: AtomicBool::new(false),
            completed_override: Mutex::new(None),
            state: Mutex::new(EngineState::default()),
            stats: Mutex::new(ExecutionStats::default()),
        });
        scheduler.add(&csr);
        csr
    }

    /// Makes waits and submissions report a GPU hang.
    pub fn set_gpu_hang(&self, hang: bool) {
        self.gpu_hang.store(hang, Ordering::SeqCst);
    }

    /// Reports `completed` as the completed task count instead of the
    /// executed one.
    pub fn set_completed_task_count(&self, completed: Option<u64>) {
        *self.completed_override.lock() = completed;
    }

    /// Execution counters.
    pub fn stats(&self) -> ExecutionStats {
        self.stats.lock().clone()
    }

    /// Whether batches are waiting on a semaphore.
    pub fn is_blocked(&self) -> bool {
        !self.state.lock().pending.is_empty()
    }

    /// The mock streamer, if the engine has one.
    pub fn mock_host_functions(&self) -> Option<&MockHostFunctionStreamer> {
        self.host_functions.as_ref()
    }

    fn resolve(&self, address: u64) -> Option<(Arc<GraphicsAllocation>, usize)> {
        let memory_manager = self.memory_manager.upgrade()?;
        let allocation =
            memory_manager.find_allocation(self.os_context.root_device_index(), address)?;
        let offset = (address - allocation.gpu_address()) as usize;
        Some((allocation, offset))
    }

    fn fault(&self, address: u64) {
        tracing::warn!(address, "simulated page fault");
        self.stats.lock().faults.push(address);
    }

    /// Executes one command. Returns false if it blocked.
    fn execute(&self, state: &mut EngineState, command: &ParsedCommand) -> bool {
        match command {
            ParsedCommand::LoadRegisterImm(lri) => match lri.register_offset {
                CS_GPR_R0 => state.gpr0 = (state.gpr0 & !0xffff_ffff) | lri.data as u64,
                CS_GPR_R0_HIGH => {
                    state.gpr0 = (state.gpr0 & 0xffff_ffff) | ((lri.data as u64) << 32)
                }
                _ => {}
            },
            ParsedCommand::SemaphoreWait(wait) => {
                let Some((allocation, offset)) = self.resolve(wait.address()) else {
                    self.fault(wait.address());
                    return true;
                };
                let op = wait
                    .compare_operation()
                    .unwrap_or(CompareOperation::GreaterThanOrEqual);
                let satisfied = if wait.control.indirect() {
                    op.evaluate(allocation.storage().read_u64(offset), state.gpr0)
                } else {
                    op.evaluate(
                        allocation.storage().read_u32(offset) as u64,
                        wait.semaphore_data as u64,
                    )
                };
                return satisfied;
            }
            ParsedCommand::StoreDataImm(sdi) => match self.resolve(sdi.address()) {
                Some((allocation, offset)) if sdi.is_qword() => {
                    allocation.storage().write_u64(offset, sdi.data())
                }
                Some((allocation, offset)) => allocation.storage().write_u32(offset, sdi.data_low),
                None => self.fault(sdi.address()),
            },
            ParsedCommand::Atomic(atomic) => match self.resolve(atomic.address()) {
                Some((allocation, offset)) if atomic.control.qword() => {
                    allocation.storage().fetch_add_u64(offset, 1);
                }
                Some((allocation, offset)) => {
                    allocation.storage().fetch_add_u32(offset, 1);
                }
                None => self.fault(atomic.address()),
            },
            ParsedCommand::PipeControl(pc) => {
                if pc.flags.dc_flush() {
                    self.stats.lock().dc_flushes += 1;
                }
                if pc.flags.post_sync_write() {
                    let address = (pc.address_high as u64) << 32 | pc.address_low as u64;
                    let data = (pc.data_high as u64) << 32 | pc.data_low as u64;
                    match self.resolve(address) {
                        Some((allocation, offset)) => allocation.storage().write_u64(offset, data),
                        None => self.fault(address),
                    }
                }
            }
            ParsedCommand::ComputeWalker(walker) => {
                self.stats.lock().kernels.push(walker.kernel_id);
            }
            ParsedCommand::BlitCopy(blit) => {
                match (self.resolve(blit.src()), self.resolve(blit.dst())) {
                    (Some((src, src_offset)), Some((dst, dst_offset))) => {
                        let mut data = vec![0; blit.size as usize];
                        src.storage().read_bytes(src_offset, &mut data);
                        dst.storage().write_bytes(dst_offset, &data);
                    }
                    (None, _) => self.fault(blit.src()),
                    (_, None) => self.fault(blit.dst()),
                }
            }
            ParsedCommand::BatchBufferEnd(_) => {}
        }
        true
    }

    /// Advances pending batches. Returns whether anything executed.
    fn step(&self) -> bool {
        let mut progress = false;
        if let Some(streamer) = &self.host_functions {
            progress |= streamer.service();
        }
        let mut state = self.state.lock();
        while let Some(mut batch) = state.pending.pop_front() {
            let mut blocked = false;
            while batch.next < batch.commands.len() {
                let command = batch.commands[batch.next];
                if !self.execute(&mut state, &command) {
                    blocked = true;
                    break;
                }
                batch.next += 1;
                progress = true;
            }
            if blocked {
                state.pending.push_front(batch);
                break;
            }
            state.completed = batch.task_count;
            progress = true;
        }
        progress
    }
}

impl CommandStreamReceiver for SimulatedCsr {
    fn os_context(&self) -> &Arc<OsContext> {
        &self.os_context
    }

    fn dc_flush_support(&self) -> bool {
        self.dc_flush_support
    }

    fn host_function_streamer(&self) -> Option<&dyn HostFunctionStreamer> {
        self.host_functions
            .as_ref()
            .map(|s| s as &dyn HostFunctionStreamer)
    }

    fn wait_for_completion_with_timeout(&self, task_count: u64, _timeout: Duration) -> WaitStatus {
        if self.gpu_hang.load(Ordering::SeqCst) {
            return WaitStatus::GpuHang;
        }
        self.scheduler.run();
        if self.completed_task_count() >= task_count {
            WaitStatus::Ready
        } else {
            WaitStatus::NotReady
        }
    }

    fn latest_flushed_task_count(&self) -> u64 {
        self.state.lock().latest_flushed
    }

    fn completed_task_count(&self) -> u64 {
        if let Some(completed) = *self.completed_override.lock() {
            return completed;
        }
        self.state.lock().completed
    }

    fn is_tbx_mode(&self) -> bool {
        self.tbx_mode
    }

    fn flush(&self, batch: &BatchBuffer<'_>) -> Result<u64, SubmissionError> {
        if self.gpu_hang.load(Ordering::SeqCst) {
            return Err(SubmissionError::GpuHang);
        }
        let commands = parse_commands(batch.commands)
            .map_err(|err| {
                tracing::error!(error = &err as &dyn std::error::Error, "malformed batch");
                SubmissionError::Rejected(drm_sys::Errno::EINVAL)
            })?
            .into_iter()
            .map(|(_, command)| command)
            .collect();
        let task_count = {
            let mut state = self.state.lock();
            state.latest_flushed += 1;
            let task_count = state.latest_flushed;
            state.pending.push_back(PendingBatch {
                task_count,
                commands,
                next: 0,
            });
            task_count
        };
        {
            let mut stats = self.stats.lock();
            stats.flushes += 1;
            stats.residency_sizes.push(batch.residency.len());
            let tlb_flush_counter = self.os_context.peek_tlb_flush_counter();
            if self.os_context.is_tlb_flush_required() {
                stats.tlb_flushes += 1;
                self.os_context.set_tlb_flushed(tlb_flush_counter);
            }
        }
        self.scheduler.run();
        Ok(task_count)
    }
}
