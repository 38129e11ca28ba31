// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Encoding of counter waits and signals into command streams.
//!
//! Waits use a greater-or-equal comparison so an older wait is still
//! satisfied once the counter has moved past it. Everything is replicated
//! once per partition.

use crate::in_order::InOrderExecInfo;
use command_stream::commands::CompareOperation;
use command_stream::commands::MiAtomic;
use command_stream::commands::MiLoadRegisterImm;
use command_stream::commands::MiSemaphoreWait;
use command_stream::commands::MiStoreDataImm;
use command_stream::commands::CS_GPR_R0;
use command_stream::commands::CS_GPR_R0_HIGH;
use command_stream::CmdRef;
use command_stream::CommandStream;
use command_stream::StreamError;

/// A command whose counter value depends on which submission of a regular
/// command list is executing. `base` is the value for the first submission.
#[derive(Debug, Copy, Clone)]
pub enum CounterPatch {
    Store {
        cmd: CmdRef<MiStoreDataImm>,
        base: u64,
    },
    Wait {
        cmd: CmdRef<MiSemaphoreWait>,
        base: u64,
    },
    WaitRegister {
        low: CmdRef<MiLoadRegisterImm>,
        high: CmdRef<MiLoadRegisterImm>,
        base: u64,
    },
}

impl CounterPatch {
    /// Rewrites the command for the `submission`th execution (1 based) of a
    /// list that advances its counter by `increment` per execution.
    pub fn apply(
        &self,
        stream: &mut CommandStream,
        submission: u64,
        increment: u64,
    ) -> Result<(), StreamError> {
        let value = |base: u64| base + submission.saturating_sub(1) * increment;
        match *self {
            CounterPatch::Store { cmd, base } => {
                let sdi = stream.get_mut(cmd)?;
                let value = value(base);
                sdi.data_low = value as u32;
                if sdi.is_qword() {
                    sdi.data_high = (value >> 32) as u32;
                }
            }
            CounterPatch::Wait { cmd, base } => {
                stream.get_mut(cmd)?.semaphore_data = value(base) as u32;
            }
            CounterPatch::WaitRegister { low, high, base } => {
                let value = value(base);
                stream.get_mut(low)?.data = value as u32;
                stream.get_mut(high)?.data = (value >> 32) as u32;
            }
        }
        Ok(())
    }
}

/// Emits a wait for every device partition of `info` to reach `value`.
///
/// Returns patch records when `patch` is set, for waits on the list's own
/// counter. The counter is read at `allocation_offset`, which is where the
/// awaited value was signalled.
pub fn encode_wait_on_counter(
    stream: &mut CommandStream,
    info: &InOrderExecInfo,
    value: u64,
    allocation_offset: u64,
    patch: bool,
) -> Vec<CounterPatch> {
    let mut patches = Vec::new();
    for partition in 0..info.num_device_partitions_to_wait() {
        let address = info.device_partition_address_at(allocation_offset, partition);
        if info.is_qword() {
            let low = stream.append(MiLoadRegisterImm::new(CS_GPR_R0, value as u32));
            let high = stream.append(MiLoadRegisterImm::new(CS_GPR_R0_HIGH, (value >> 32) as u32));
            stream.append(MiSemaphoreWait::new(
                address,
                0,
                CompareOperation::GreaterThanOrEqual,
                true,
            ));
            if patch {
                patches.push(CounterPatch::WaitRegister {
                    low,
                    high,
                    base: value,
                });
            }
        } else {
            let cmd = stream.append(MiSemaphoreWait::new(
                address,
                value as u32,
                CompareOperation::GreaterThanOrEqual,
                false,
            ));
            if patch {
                patches.push(CounterPatch::Wait { cmd, base: value });
            }
        }
    }
    patches
}

/// Emits the signal of `value` on every partition of `info`, plus the host
/// copy when host storage is duplicated.
///
/// Atomic signalling increments each device slot by one, so `value` must be
/// exactly one past the previous signal.
pub fn encode_signal_counter(
    stream: &mut CommandStream,
    info: &InOrderExecInfo,
    value: u64,
) -> Vec<CounterPatch> {
    let mut patches = Vec::new();
    let qword = info.is_qword();
    for partition in 0..info.num_device_partitions_to_wait() {
        let address = info.device_partition_address(partition);
        if info.is_atomic_device_signalling() {
            stream.append(MiAtomic::increment(address, qword));
        } else {
            let cmd = stream.append(MiStoreDataImm::new(address, value, qword));
            patches.push(CounterPatch::Store { cmd, base: value });
        }
    }
    if info.is_host_storage_duplicated() {
        for partition in 0..info.num_host_partitions_to_wait() {
            let address = info.host_partition_address(partition);
            let cmd = stream.append(MiStoreDataImm::new(address, value, qword));
            patches.push(CounterPatch::Store { cmd, base: value });
        }
    }
    patches
}

/// Emits a wait for every slot of a regular event to read `state`.
pub fn encode_wait_on_event_slots(
    stream: &mut CommandStream,
    address: u64,
    partitions: u32,
    stride: u64,
    state: u32,
) {
    for partition in 0..partitions {
        stream.append(MiSemaphoreWait::new(
            address + u64::from(partition) * stride,
            state,
            CompareOperation::Equal,
            false,
        ));
    }
}

/// Emits stores of `state` into every slot of a regular event.
pub fn encode_store_event_slots(
    stream: &mut CommandStream,
    address: u64,
    partitions: u32,
    stride: u64,
    state: u32,
) {
    for partition in 0..partitions {
        stream.append(MiStoreDataImm::new(
            address + u64::from(partition) * stride,
            state.into(),
            false,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GfxFamily;
    use crate::L0Device;
    use command_stream::ParsedCommand;
    use gpu_memory::DebugFlags;
    use gpu_mock::MockEnvironment;
    use std::sync::Arc;

    fn info(env: &MockEnvironment, family: GfxFamily) -> Arc<InOrderExecInfo> {
        let device =
            L0Device::new(env.device(0).clone(), env.memory_manager().clone(), family).unwrap();
        InOrderExecInfo::new(&device, false).unwrap()
    }

    fn commands(stream: &CommandStream) -> Vec<ParsedCommand> {
        stream
            .commands_from(0)
            .unwrap()
            .into_iter()
            .map(|(_, command)| command)
            .collect()
    }

    #[test]
    fn qword_wait_loads_the_register() {
        let env = MockEnvironment::new();
        let info = info(&env, GfxFamily::XeHpcCore);
        let mut stream = CommandStream::new();
        let value = 0x1_0000_0002;
        encode_wait_on_counter(&mut stream, &info, value, 0, false);

        let commands = commands(&stream);
        assert_eq!(commands.len(), 3);
        let ParsedCommand::LoadRegisterImm(low) = commands[0] else {
            panic!("{:?}", commands[0]);
        };
        let ParsedCommand::LoadRegisterImm(high) = commands[1] else {
            panic!("{:?}", commands[1]);
        };
        assert_eq!((low.register_offset, low.data), (CS_GPR_R0, 2));
        assert_eq!((high.register_offset, high.data), (CS_GPR_R0_HIGH, 1));
        let ParsedCommand::SemaphoreWait(wait) = commands[2] else {
            panic!("{:?}", commands[2]);
        };
        assert!(wait.control.indirect());
        assert_eq!(wait.address(), info.base_device_address());
        assert_eq!(
            wait.compare_operation(),
            Some(CompareOperation::GreaterThanOrEqual)
        );
    }

    #[test]
    fn dword_wait_uses_inline_data() {
        let env = MockEnvironment::new();
        let info = info(&env, GfxFamily::Gen12Lp);
        let mut stream = CommandStream::new();
        let patches = encode_wait_on_counter(&mut stream, &info, 9, 0, true);
        assert_eq!(patches.len(), 1);

        let commands = commands(&stream);
        let [ParsedCommand::SemaphoreWait(wait)] = commands[..] else {
            panic!("{commands:?}");
        };
        assert!(!wait.control.indirect());
        assert_eq!(wait.semaphore_data, 9);
    }

    #[test]
    fn waits_are_replicated_per_partition() {
        let env = MockEnvironment::builder().tiles(4).build();
        let info = info(&env, GfxFamily::XeHpcCore);
        let mut stream = CommandStream::new();
        encode_wait_on_counter(&mut stream, &info, 1, 0, false);

        let waits = stream.find_all::<MiSemaphoreWait>(0).unwrap();
        assert_eq!(waits.len(), 4);
        let base = info.base_device_address();
        for (i, wait) in waits.into_iter().enumerate() {
            assert_eq!(
                stream.get(wait).unwrap().address(),
                base + i as u64 * info.partition_stride()
            );
        }
    }

    #[test]
    fn waits_read_the_given_offset() {
        let env = MockEnvironment::new();
        let info = info(&env, GfxFamily::XeHpcCore);
        let base = info.base_device_address();
        info.set_allocation_offset(64).unwrap();

        let mut stream = CommandStream::new();
        encode_wait_on_counter(&mut stream, &info, 1, 0, false);
        encode_wait_on_counter(&mut stream, &info, 1, info.allocation_offset(), false);
        let waits = stream.find_all::<MiSemaphoreWait>(0).unwrap();
        assert_eq!(stream.get(waits[0]).unwrap().address(), base);
        assert_eq!(stream.get(waits[1]).unwrap().address(), base + 64);
    }

    #[test]
    fn signal_stores_per_partition() {
        let env = MockEnvironment::builder().tiles(2).build();
        let info = info(&env, GfxFamily::XeHpcCore);
        let mut stream = CommandStream::new();
        let patches = encode_signal_counter(&mut stream, &info, 3);
        assert_eq!(patches.len(), 2);

        let stores = stream.find_all::<MiStoreDataImm>(0).unwrap();
        assert_eq!(stores.len(), 2);
        let second = stream.get(stores[1]).unwrap();
        assert_eq!(second.address(), info.device_partition_address(1));
        assert_eq!(second.data(), 3);
        assert!(second.is_qword());
    }

    #[test]
    fn atomic_signalling_increments() {
        let env = MockEnvironment::builder()
            .flags(DebugFlags {
                in_order_atomic_signalling_enabled: Some(true),
                ..Default::default()
            })
            .build();
        let info = info(&env, GfxFamily::XeHpcCore);
        assert!(info.is_atomic_device_signalling());
        let mut stream = CommandStream::new();
        let patches = encode_signal_counter(&mut stream, &info, 1);
        assert!(patches.is_empty());
        assert_eq!(stream.find_all::<MiAtomic>(0).unwrap().len(), 1);
        assert!(stream.find_all::<MiStoreDataImm>(0).unwrap().is_empty());
    }

    #[test]
    fn atomic_signalling_needs_family_support() {
        let env = MockEnvironment::builder()
            .flags(DebugFlags {
                in_order_atomic_signalling_enabled: Some(true),
                ..Default::default()
            })
            .build();
        let info = info(&env, GfxFamily::Gen12Lp);
        assert!(!info.is_atomic_device_signalling());
    }

    #[test]
    fn duplicated_storage_signals_host() {
        let env = MockEnvironment::builder()
            .flags(DebugFlags {
                in_order_duplicated_counter_storage_enabled: Some(true),
                ..Default::default()
            })
            .build();
        let info = info(&env, GfxFamily::XeHpcCore);
        let mut stream = CommandStream::new();
        encode_signal_counter(&mut stream, &info, 5);

        let stores = stream.find_all::<MiStoreDataImm>(0).unwrap();
        assert_eq!(stores.len(), 2);
        assert_eq!(
            stream.get(stores[1]).unwrap().address(),
            info.base_host_address()
        );
        assert_eq!(stream.get(stores[1]).unwrap().data(), 5);
    }

    #[test]
    fn patches_follow_submissions() {
        let env = MockEnvironment::new();
        let info = info(&env, GfxFamily::XeHpcCore);
        let mut stream = CommandStream::new();
        let mut patches = encode_wait_on_counter(&mut stream, &info, 1, 0, true);
        patches.extend(encode_signal_counter(&mut stream, &info, 2));

        for patch in &patches {
            patch.apply(&mut stream, 3, 2).unwrap();
        }
        let commands = commands(&stream);
        let ParsedCommand::LoadRegisterImm(low) = commands[0] else {
            panic!("{:?}", commands[0]);
        };
        assert_eq!(low.data, 5);
        let store = stream.find_all::<MiStoreDataImm>(0).unwrap()[0];
        assert_eq!(stream.get(store).unwrap().data(), 6);
    }
}
