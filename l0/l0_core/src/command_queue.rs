// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command queues execute closed regular command lists.

use crate::command_list::submit;
use crate::command_list::wait_for_task_count;
use crate::command_list::CommandList;
use crate::command_list::CommandListKind;
use crate::L0Device;
use crate::ZeError;
use command_stream::commands::MiBatchBufferEnd;
use gpu_memory::EngineControl;
use gpu_memory::EngineType;
use gpu_memory::GraphicsAllocation;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use zerocopy::IntoBytes;

#[derive(Debug)]
pub struct CommandQueue {
    device: Arc<L0Device>,
    engine: EngineControl,
    task_count: Mutex<u64>,
}

impl CommandQueue {
    /// Creates a queue on `engine`, or on the device's default engine.
    pub fn create(device: &Arc<L0Device>, engine: Option<EngineType>) -> Result<Self, ZeError> {
        let engine = match engine {
            Some(engine_type) => device.device().engine(engine_type),
            None => device.device().default_engine(),
        }
        .ok_or(ZeError::InvalidArgument)?
        .clone();
        Ok(Self {
            device: device.clone(),
            engine,
            task_count: Mutex::new(0),
        })
    }

    pub fn engine(&self) -> &EngineControl {
        &self.engine
    }

    /// Submits `lists` as one batch.
    ///
    /// Each in-order list advances its submission count, and its counter
    /// values are rewritten for the new submission before the commands are
    /// copied into the batch.
    pub fn execute_command_lists(&self, lists: &mut [&mut CommandList]) -> Result<(), ZeError> {
        if lists.is_empty()
            || lists
                .iter()
                .any(|list| list.kind() != CommandListKind::Regular || !list.is_closed())
        {
            return Err(ZeError::InvalidArgument);
        }

        let mut task_count = self.task_count.lock();
        let streamer = self.engine.csr.host_function_streamer();
        let mut commands = Vec::new();
        let mut residency: Vec<Arc<GraphicsAllocation>> = Vec::new();
        let mut seen = HashSet::new();
        for list in lists.iter_mut() {
            list.prepare_for_submission(streamer)?;
            commands.extend_from_slice(list.stream().as_bytes());
            for allocation in list.residency() {
                if seen.insert(allocation.id()) {
                    residency.push(allocation.clone());
                }
            }
        }
        commands.extend_from_slice(MiBatchBufferEnd::new().as_bytes());

        *task_count = submit(&self.device, &self.engine, &commands, &residency)?;
        tracing::debug!(
            lists = lists.len(),
            task_count = *task_count,
            "executed command lists"
        );
        Ok(())
    }

    /// Waits up to `timeout` for the latest execution.
    pub fn synchronize(&self, timeout: Duration) -> Result<(), ZeError> {
        let task_count = *self.task_count.lock();
        wait_for_task_count(&self.engine, task_count, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_list::CommandListDesc;
    use crate::command_list::HostFunction;
    use crate::command_list::KernelLaunch;
    use crate::event::CounterBasedEventDesc;
    use crate::event::Event;
    use crate::GfxFamily;
    use gpu_memory::AllocationProperties;
    use gpu_memory::AllocationType;
    use gpu_memory::PAGE_SIZE;
    use gpu_mock::MockEnvironment;
    use std::sync::atomic::AtomicU32;
    use std::sync::atomic::Ordering;

    fn device(env: &MockEnvironment) -> Arc<L0Device> {
        L0Device::new(
            env.device(0).clone(),
            env.memory_manager().clone(),
            GfxFamily::XeHpcCore,
        )
        .unwrap()
    }

    fn in_order_list(
        device: &Arc<L0Device>,
        kind: CommandListKind,
        engine: Option<EngineType>,
    ) -> CommandList {
        CommandList::create(
            device,
            kind,
            &CommandListDesc {
                in_order: true,
                relaxed_ordering: false,
                engine,
            },
        )
        .unwrap()
    }

    fn kernel(id: u32) -> KernelLaunch {
        KernelLaunch {
            kernel_id: id,
            group_count: 1,
            residency: Vec::new(),
        }
    }

    #[test]
    fn re_execution_patches_counter_values() {
        let env = MockEnvironment::new();
        let device = device(&env);
        let queue = CommandQueue::create(&device, None).unwrap();
        let event = Event::create_counter_based(&device, &CounterBasedEventDesc::default()).unwrap();
        let mut list = in_order_list(&device, CommandListKind::Regular, None);
        list.append_launch_kernel(&kernel(1), Some(&event), &[])
            .unwrap();
        list.append_launch_kernel(&kernel(2), None, &[]).unwrap();
        list.close().unwrap();
        let info = list.in_order_exec_info().unwrap().clone();

        for execution in 1..=3 {
            queue.execute_command_lists(&mut [&mut list]).unwrap();
            queue.synchronize(Duration::ZERO).unwrap();
            assert_eq!(info.read_device_counter(0), 2 * execution);
            assert_eq!(event.effective_signal_value(), 1 + (execution - 1) * 2);
            event.query_status().unwrap();
        }
        assert_eq!(info.regular_cmd_list_submission_counter(), 3);
    }

    #[test]
    fn open_and_immediate_lists_are_rejected() {
        let env = MockEnvironment::new();
        let device = device(&env);
        let queue = CommandQueue::create(&device, None).unwrap();
        let mut open = in_order_list(&device, CommandListKind::Regular, None);
        open.append_barrier(None, &[]).unwrap();
        assert_eq!(
            queue.execute_command_lists(&mut [&mut open]).unwrap_err(),
            ZeError::InvalidArgument
        );

        let mut immediate = in_order_list(&device, CommandListKind::Immediate, None);
        assert_eq!(
            queue.execute_command_lists(&mut [&mut immediate]).unwrap_err(),
            ZeError::InvalidArgument
        );
        assert_eq!(
            queue.execute_command_lists(&mut []).unwrap_err(),
            ZeError::InvalidArgument
        );
    }

    #[test]
    fn cross_engine_wait_blocks_until_signalled() {
        let env = MockEnvironment::builder().copy_engine(true).build();
        let device = device(&env);
        let allocate = || {
            env.memory_manager()
                .allocate_graphics_memory(&AllocationProperties::new(
                    0,
                    PAGE_SIZE,
                    AllocationType::Buffer,
                ))
                .unwrap()
        };
        let (src, dst) = (allocate(), allocate());
        src.storage().write_u32(0, 0xc0ffee);

        let event = Event::create_counter_based(&device, &CounterBasedEventDesc::default()).unwrap();
        let mut compute = in_order_list(&device, CommandListKind::Regular, None);
        compute
            .append_launch_kernel(&kernel(7), Some(&event), &[])
            .unwrap();
        compute.close().unwrap();

        let mut copy = in_order_list(&device, CommandListKind::Immediate, Some(EngineType::Copy));
        copy.append_memory_copy(dst.gpu_address(), src.gpu_address(), 4, None, &[&event])
            .unwrap();
        let copy_csr = env.csr(copy.engine());
        assert!(copy_csr.is_blocked());
        assert_eq!(
            copy.host_synchronize(Duration::ZERO).unwrap_err(),
            ZeError::NotReady
        );
        assert_eq!(dst.storage().read_u32(0), 0);

        let queue = CommandQueue::create(&device, None).unwrap();
        queue.execute_command_lists(&mut [&mut compute]).unwrap();
        copy.host_synchronize(Duration::ZERO).unwrap();
        assert!(!copy_csr.is_blocked());
        assert_eq!(dst.storage().read_u32(0), 0xc0ffee);
    }

    #[test]
    fn host_functions_run_once_per_execution() {
        let env = MockEnvironment::builder().host_functions(true).build();
        let device = device(&env);
        let calls = Arc::new(AtomicU32::new(0));
        let callback: HostFunction = {
            let calls = calls.clone();
            Arc::new(move || {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        let mut list = in_order_list(&device, CommandListKind::Regular, None);
        list.append_host_function(callback, None, &[]).unwrap();
        list.close().unwrap();

        let queue = CommandQueue::create(&device, None).unwrap();
        for execution in 1..=2 {
            queue.execute_command_lists(&mut [&mut list]).unwrap();
            queue.synchronize(Duration::ZERO).unwrap();
            assert_eq!(calls.load(Ordering::SeqCst), execution);
        }
    }

    #[test]
    fn lists_share_one_batch() {
        let env = MockEnvironment::new();
        let device = device(&env);
        let mut first = in_order_list(&device, CommandListKind::Regular, None);
        let mut second = in_order_list(&device, CommandListKind::Regular, None);
        first.append_launch_kernel(&kernel(1), None, &[]).unwrap();
        second.append_launch_kernel(&kernel(2), None, &[]).unwrap();
        first.close().unwrap();
        second.close().unwrap();

        let queue = CommandQueue::create(&device, None).unwrap();
        queue
            .execute_command_lists(&mut [&mut first, &mut second])
            .unwrap();
        queue.synchronize(Duration::ZERO).unwrap();
        let stats = env.default_csr(env.device(0)).stats();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.kernels, [1, 2]);
    }

    #[test]
    fn gpu_hang_is_device_lost() {
        let env = MockEnvironment::new();
        let device = device(&env);
        let mut list = in_order_list(&device, CommandListKind::Regular, None);
        list.append_barrier(None, &[]).unwrap();
        list.close().unwrap();
        let queue = CommandQueue::create(&device, None).unwrap();
        queue.execute_command_lists(&mut [&mut list]).unwrap();

        env.default_csr(env.device(0)).set_gpu_hang(true);
        assert_eq!(
            queue.synchronize(Duration::ZERO).unwrap_err(),
            ZeError::DeviceLost
        );
    }
}
