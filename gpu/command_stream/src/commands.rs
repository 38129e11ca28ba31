// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The command primitives used for synchronization and work submission.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Low dword of command streamer general purpose register 0.
pub const CS_GPR_R0: u32 = 0x2600;
/// High dword of command streamer general purpose register 0.
pub const CS_GPR_R0_HIGH: u32 = 0x2604;

pub const COMMAND_TYPE_MI: u8 = 0;
pub const COMMAND_TYPE_BLITTER: u8 = 2;
pub const COMMAND_TYPE_GFXPIPE: u8 = 3;

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct CommandHeader {
    /// Command length in dwords, excluding the first two.
    #[bits(8)]
    pub dword_length: u8,
    #[bits(15)]
    _rsvd: u16,
    #[bits(6)]
    pub opcode: u8,
    #[bits(3)]
    pub command_type: u8,
}

impl CommandHeader {
    pub fn total_dwords(&self) -> usize {
        self.dword_length() as usize + 2
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandKind {
    LoadRegisterImm,
    SemaphoreWait,
    StoreDataImm,
    Atomic,
    BatchBufferEnd,
    PipeControl,
    ComputeWalker,
    BlitCopy,
}

impl CommandKind {
    const fn encoding(self) -> (u8, u8) {
        match self {
            CommandKind::LoadRegisterImm => (COMMAND_TYPE_MI, 0x22),
            CommandKind::SemaphoreWait => (COMMAND_TYPE_MI, 0x1c),
            CommandKind::StoreDataImm => (COMMAND_TYPE_MI, 0x20),
            CommandKind::Atomic => (COMMAND_TYPE_MI, 0x2f),
            CommandKind::BatchBufferEnd => (COMMAND_TYPE_MI, 0x0a),
            CommandKind::PipeControl => (COMMAND_TYPE_GFXPIPE, 0x3a),
            CommandKind::ComputeWalker => (COMMAND_TYPE_GFXPIPE, 0x2a),
            CommandKind::BlitCopy => (COMMAND_TYPE_BLITTER, 0x01),
        }
    }

    pub fn from_header(header: CommandHeader) -> Option<Self> {
        const ALL: [CommandKind; 8] = [
            CommandKind::LoadRegisterImm,
            CommandKind::SemaphoreWait,
            CommandKind::StoreDataImm,
            CommandKind::Atomic,
            CommandKind::BatchBufferEnd,
            CommandKind::PipeControl,
            CommandKind::ComputeWalker,
            CommandKind::BlitCopy,
        ];
        ALL.into_iter()
            .find(|kind| kind.encoding() == (header.command_type(), header.opcode()))
    }

    fn header(self, total_dwords: usize) -> CommandHeader {
        let (command_type, opcode) = self.encoding();
        CommandHeader::new()
            .with_command_type(command_type)
            .with_opcode(opcode)
            .with_dword_length((total_dwords - 2) as u8)
    }
}

/// A fixed-layout command that can be placed in a command stream.
pub trait Command: IntoBytes + FromBytes + Immutable + KnownLayout + Copy {
    const KIND: CommandKind;

    fn header(&self) -> CommandHeader;

    /// An instance with a valid header and all other fields zero.
    fn init() -> Self;
}

macro_rules! command {
    ($ty:ty, $kind:expr) => {
        impl Command for $ty {
            const KIND: CommandKind = $kind;

            fn header(&self) -> CommandHeader {
                self.header
            }

            fn init() -> Self {
                let mut this = Self::new_zeroed();
                this.header = $kind.header(size_of::<Self>() / 4);
                this
            }
        }
    };
}

fn split(address: u64) -> (u32, u32) {
    (address as u32, (address >> 32) as u32)
}

fn join(low: u32, high: u32) -> u64 {
    (high as u64) << 32 | low as u64
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MiLoadRegisterImm {
    pub header: CommandHeader,
    pub register_offset: u32,
    pub data: u32,
}

command!(MiLoadRegisterImm, CommandKind::LoadRegisterImm);

impl MiLoadRegisterImm {
    pub fn new(register_offset: u32, data: u32) -> Self {
        Self {
            register_offset,
            data,
            ..Self::init()
        }
    }
}

/// Comparison between the memory value (SAD) and the semaphore data (SDD).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum CompareOperation {
    GreaterThan = 0,
    GreaterThanOrEqual = 1,
    LessThan = 2,
    LessThanOrEqual = 3,
    Equal = 4,
    NotEqual = 5,
}

impl CompareOperation {
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::GreaterThan,
            1 => Self::GreaterThanOrEqual,
            2 => Self::LessThan,
            3 => Self::LessThanOrEqual,
            4 => Self::Equal,
            5 => Self::NotEqual,
            _ => return None,
        })
    }

    /// Whether `memory` satisfies the comparison against `data`.
    pub fn evaluate(self, memory: u64, data: u64) -> bool {
        match self {
            Self::GreaterThan => memory > data,
            Self::GreaterThanOrEqual => memory >= data,
            Self::LessThan => memory < data,
            Self::LessThanOrEqual => memory <= data,
            Self::Equal => memory == data,
            Self::NotEqual => memory != data,
        }
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct SemaphoreControl {
    #[bits(3)]
    pub compare_op: u8,
    /// Poll until satisfied rather than waiting for a signal.
    pub polling: bool,
    /// Compare against GPR0 (qword) instead of the inline data.
    pub indirect: bool,
    #[bits(27)]
    _rsvd: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MiSemaphoreWait {
    pub header: CommandHeader,
    pub control: SemaphoreControl,
    pub semaphore_data: u32,
    pub address_low: u32,
    pub address_high: u32,
}

command!(MiSemaphoreWait, CommandKind::SemaphoreWait);

impl MiSemaphoreWait {
    pub fn new(address: u64, data: u32, op: CompareOperation, indirect: bool) -> Self {
        let (address_low, address_high) = split(address);
        Self {
            control: SemaphoreControl::new()
                .with_compare_op(op as u8)
                .with_polling(true)
                .with_indirect(indirect),
            semaphore_data: data,
            address_low,
            address_high,
            ..Self::init()
        }
    }

    pub fn address(&self) -> u64 {
        join(self.address_low, self.address_high)
    }

    pub fn compare_operation(&self) -> Option<CompareOperation> {
        CompareOperation::from_raw(self.control.compare_op())
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct StoreDataControl {
    pub store_qword: bool,
    #[bits(31)]
    _rsvd: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MiStoreDataImm {
    pub header: CommandHeader,
    pub control: StoreDataControl,
    pub address_low: u32,
    pub address_high: u32,
    pub data_low: u32,
    pub data_high: u32,
}

command!(MiStoreDataImm, CommandKind::StoreDataImm);

impl MiStoreDataImm {
    pub fn new(address: u64, data: u64, store_qword: bool) -> Self {
        let (address_low, address_high) = split(address);
        let (data_low, data_high) = split(data);
        Self {
            control: StoreDataControl::new().with_store_qword(store_qword),
            address_low,
            address_high,
            data_low,
            data_high: if store_qword { data_high } else { 0 },
            ..Self::init()
        }
    }

    pub fn address(&self) -> u64 {
        join(self.address_low, self.address_high)
    }

    pub fn data(&self) -> u64 {
        join(self.data_low, self.data_high)
    }

    pub fn is_qword(&self) -> bool {
        self.control.store_qword()
    }
}

pub const ATOMIC_OPCODE_INCREMENT: u8 = 0x5;

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct AtomicControl {
    #[bits(4)]
    pub operation: u8,
    /// Operate on 8 bytes rather than 4.
    pub qword: bool,
    pub return_data: bool,
    #[bits(26)]
    _rsvd: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MiAtomic {
    pub header: CommandHeader,
    pub control: AtomicControl,
    pub address_low: u32,
    pub address_high: u32,
}

command!(MiAtomic, CommandKind::Atomic);

impl MiAtomic {
    pub fn increment(address: u64, qword: bool) -> Self {
        let (address_low, address_high) = split(address);
        Self {
            control: AtomicControl::new()
                .with_operation(ATOMIC_OPCODE_INCREMENT)
                .with_qword(qword),
            address_low,
            address_high,
            ..Self::init()
        }
    }

    pub fn address(&self) -> u64 {
        join(self.address_low, self.address_high)
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct MiBatchBufferEnd {
    pub header: CommandHeader,
    pub reserved: u32,
}

command!(MiBatchBufferEnd, CommandKind::BatchBufferEnd);

impl MiBatchBufferEnd {
    pub fn new() -> Self {
        Self::init()
    }
}

#[bitfield(u32)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct PipeControlFlags {
    pub dc_flush: bool,
    pub cs_stall: bool,
    /// Write the immediate data to the post-sync address.
    pub post_sync_write: bool,
    pub tlb_invalidate: bool,
    #[bits(28)]
    _rsvd: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PipeControl {
    pub header: CommandHeader,
    pub flags: PipeControlFlags,
    pub address_low: u32,
    pub address_high: u32,
    pub data_low: u32,
    pub data_high: u32,
}

command!(PipeControl, CommandKind::PipeControl);

impl PipeControl {
    pub fn barrier(dc_flush: bool) -> Self {
        Self {
            flags: PipeControlFlags::new()
                .with_cs_stall(true)
                .with_dc_flush(dc_flush),
            ..Self::init()
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ComputeWalker {
    pub header: CommandHeader,
    pub kernel_id: u32,
    pub thread_group_count: u32,
    pub partition_count: u32,
}

command!(ComputeWalker, CommandKind::ComputeWalker);

impl ComputeWalker {
    pub fn new(kernel_id: u32, thread_group_count: u32, partition_count: u32) -> Self {
        Self {
            kernel_id,
            thread_group_count,
            partition_count,
            ..Self::init()
        }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct BlitCopy {
    pub header: CommandHeader,
    pub size: u32,
    pub src_low: u32,
    pub src_high: u32,
    pub dst_low: u32,
    pub dst_high: u32,
}

command!(BlitCopy, CommandKind::BlitCopy);

impl BlitCopy {
    pub fn new(dst: u64, src: u64, size: u32) -> Self {
        let (src_low, src_high) = split(src);
        let (dst_low, dst_high) = split(dst);
        Self {
            size,
            src_low,
            src_high,
            dst_low,
            dst_high,
            ..Self::init()
        }
    }

    pub fn src(&self) -> u64 {
        join(self.src_low, self.src_high)
    }

    pub fn dst(&self) -> u64 {
        join(self.dst_low, self.dst_high)
    }
}

const_assert_eq!(size_of::<MiLoadRegisterImm>(), 12);
const_assert_eq!(size_of::<MiSemaphoreWait>(), 20);
const_assert_eq!(size_of::<MiStoreDataImm>(), 24);
const_assert_eq!(size_of::<MiAtomic>(), 16);
const_assert_eq!(size_of::<MiBatchBufferEnd>(), 8);
const_assert_eq!(size_of::<PipeControl>(), 24);
const_assert_eq!(size_of::<ComputeWalker>(), 16);
const_assert_eq!(size_of::<BlitCopy>(), 24);
