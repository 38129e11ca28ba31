// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire layouts for the DRM/i915 uAPI structures used by the residency path.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

pub const DRM_IOCTL_BASE: u8 = b'd';
pub const DRM_COMMAND_BASE: u8 = 0x40;

pub const DRM_GEM_CLOSE: u8 = 0x09;
pub const DRM_PRIME_HANDLE_TO_FD: u8 = 0x2d;
pub const DRM_PRIME_FD_TO_HANDLE: u8 = 0x2e;

pub const I915_GETPARAM: u8 = 0x06;
pub const I915_GEM_CREATE: u8 = 0x1b;
pub const I915_GEM_MMAP_OFFSET: u8 = 0x24;
pub const I915_GEM_VM_CREATE: u8 = 0x3a;
pub const I915_GEM_VM_BIND: u8 = 0x3d;
pub const I915_GEM_VM_UNBIND: u8 = 0x3e;

/// Base for parameters and extensions that are not yet upstream.
pub const PRELIM_BASE: u32 = 1 << 16;

pub const I915_PARAM_HAS_VM_BIND: i32 = 57;
pub const I915_PARAM_HAS_SET_PAIR: i32 = (PRELIM_BASE | 4) as i32;
pub const I915_PARAM_HAS_CHUNK_SIZE: i32 = (PRELIM_BASE | 5) as i32;

pub const I915_VM_BIND_EXT_SET_PAT: u32 = PRELIM_BASE | 2;

pub const DRM_CLOEXEC: u32 = libc::O_CLOEXEC as u32;
pub const DRM_RDWR: u32 = libc::O_RDWR as u32;

pub const I915_MMAP_OFFSET_WB: u64 = 2;

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GemClose {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GemCreate {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GemMmapOffset {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub flags: u64,
    pub extensions: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GemVmControl {
    pub extensions: u64,
    pub flags: u32,
    pub vm_id: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct PrimeHandle {
    pub handle: u32,
    pub flags: u32,
    pub fd: i32,
}

/// `drm_i915_getparam`. `value` is a user pointer to an `i32`.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct GetParam {
    pub param: i32,
    pub pad: u32,
    pub value: u64,
}

#[bitfield(u64)]
#[derive(IntoBytes, Immutable, KnownLayout, FromBytes, PartialEq, Eq)]
pub struct VmBindFlags {
    #[bits(59)]
    _rsvd: u64,
    pub fd: bool,
    pub make_resident: bool,
    pub capture: bool,
    pub readonly: bool,
    pub immediate: bool,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VmBindParams {
    pub vm_id: u32,
    pub handle: u32,
    pub start: u64,
    pub offset: u64,
    pub length: u64,
    pub flags: VmBindFlags,
    /// User pointer to the first chained extension, or zero.
    pub extensions: u64,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct UserExtension {
    pub next_extension: u64,
    pub name: u32,
    pub flags: u32,
    pub rsvd: [u32; 4],
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VmBindExtSetPat {
    pub base: UserExtension,
    pub pat_index: u64,
}

const_assert_eq!(size_of::<GemClose>(), 8);
const_assert_eq!(size_of::<GemCreate>(), 16);
const_assert_eq!(size_of::<GemMmapOffset>(), 32);
const_assert_eq!(size_of::<GemVmControl>(), 16);
const_assert_eq!(size_of::<PrimeHandle>(), 12);
const_assert_eq!(size_of::<GetParam>(), 16);
const_assert_eq!(size_of::<VmBindParams>(), 48);
const_assert_eq!(size_of::<VmBindExtSetPat>(), 40);
