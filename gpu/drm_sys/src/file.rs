// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::defs::*;
use crate::BoMemory;
use crate::DrmIoctl;
use crate::VmBindRequest;
use anyhow::Context;
use nix::errno::Errno;
use std::fs::File;
use std::os::unix::prelude::*;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;
use zerocopy::FromZeros;

mod ioctl {
    use crate::defs::*;
    use nix::ioctl_readwrite;
    use nix::ioctl_write_ptr;

    ioctl_write_ptr!(drm_gem_close, DRM_IOCTL_BASE, DRM_GEM_CLOSE, GemClose);
    ioctl_readwrite!(
        drm_prime_handle_to_fd,
        DRM_IOCTL_BASE,
        DRM_PRIME_HANDLE_TO_FD,
        PrimeHandle
    );
    ioctl_readwrite!(
        drm_prime_fd_to_handle,
        DRM_IOCTL_BASE,
        DRM_PRIME_FD_TO_HANDLE,
        PrimeHandle
    );
    ioctl_readwrite!(
        i915_getparam,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + I915_GETPARAM,
        GetParam
    );
    ioctl_readwrite!(
        i915_gem_create,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + I915_GEM_CREATE,
        GemCreate
    );
    ioctl_readwrite!(
        i915_gem_mmap_offset,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + I915_GEM_MMAP_OFFSET,
        GemMmapOffset
    );
    ioctl_readwrite!(
        i915_gem_vm_create,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + I915_GEM_VM_CREATE,
        GemVmControl
    );
    ioctl_readwrite!(
        i915_gem_vm_bind,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + I915_GEM_VM_BIND,
        VmBindParams
    );
    ioctl_readwrite!(
        i915_gem_vm_unbind,
        DRM_IOCTL_BASE,
        DRM_COMMAND_BASE + I915_GEM_VM_UNBIND,
        VmBindParams
    );
}

/// An open DRM render node.
#[derive(Debug)]
pub struct DrmFile {
    file: File,
}

impl DrmFile {
    /// Opens the render node at `path`, e.g. `/dev/dri/renderD128`.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self { file })
    }

    fn vm_bind_params(
        request: &VmBindRequest,
        pat: &VmBindExtSetPat,
    ) -> VmBindParams {
        VmBindParams {
            vm_id: request.vm_id,
            handle: request.handle,
            start: request.start,
            offset: request.offset,
            length: request.length,
            flags: request.flags,
            extensions: if request.pat_index.is_some() {
                std::ptr::from_ref(pat) as u64
            } else {
                0
            },
        }
    }

    fn pat_extension(request: &VmBindRequest) -> VmBindExtSetPat {
        VmBindExtSetPat {
            base: UserExtension {
                name: I915_VM_BIND_EXT_SET_PAT,
                ..FromZeros::new_zeroed()
            },
            pat_index: request.pat_index.unwrap_or(0),
        }
    }
}

impl DrmIoctl for DrmFile {
    fn get_param(&self, param: i32) -> Result<i32, Errno> {
        let mut value = 0i32;
        let mut arg = GetParam {
            param,
            pad: 0,
            value: std::ptr::from_mut(&mut value) as u64,
        };
        // SAFETY: `arg` points at a live i32 for the duration of the call.
        unsafe { ioctl::i915_getparam(self.file.as_raw_fd(), &mut arg)? };
        Ok(value)
    }

    fn gem_create(&self, size: u64) -> Result<u32, Errno> {
        let mut arg = GemCreate {
            size,
            ..FromZeros::new_zeroed()
        };
        // SAFETY: `arg` is a valid, initialized ioctl argument.
        unsafe { ioctl::i915_gem_create(self.file.as_raw_fd(), &mut arg)? };
        Ok(arg.handle)
    }

    fn gem_close(&self, handle: u32) -> Result<(), Errno> {
        let arg = GemClose { handle, pad: 0 };
        // SAFETY: `arg` is a valid, initialized ioctl argument.
        unsafe { ioctl::drm_gem_close(self.file.as_raw_fd(), &arg)? };
        Ok(())
    }

    fn vm_create(&self) -> Result<u32, Errno> {
        let mut arg = GemVmControl::new_zeroed();
        // SAFETY: `arg` is a valid, initialized ioctl argument.
        unsafe { ioctl::i915_gem_vm_create(self.file.as_raw_fd(), &mut arg)? };
        Ok(arg.vm_id)
    }

    fn vm_bind(&self, request: &VmBindRequest) -> Result<(), Errno> {
        let pat = Self::pat_extension(request);
        let mut arg = Self::vm_bind_params(request, &pat);
        // SAFETY: the chained extension outlives the call.
        unsafe { ioctl::i915_gem_vm_bind(self.file.as_raw_fd(), &mut arg)? };
        Ok(())
    }

    fn vm_unbind(&self, request: &VmBindRequest) -> Result<(), Errno> {
        let pat = Self::pat_extension(request);
        let mut arg = Self::vm_bind_params(request, &pat);
        // SAFETY: the chained extension outlives the call.
        unsafe { ioctl::i915_gem_vm_unbind(self.file.as_raw_fd(), &mut arg)? };
        Ok(())
    }

    fn prime_handle_to_fd(&self, handle: u32) -> Result<OwnedFd, Errno> {
        let mut arg = PrimeHandle {
            handle,
            flags: DRM_CLOEXEC | DRM_RDWR,
            fd: -1,
        };
        // SAFETY: `arg` is a valid, initialized ioctl argument.
        unsafe { ioctl::drm_prime_handle_to_fd(self.file.as_raw_fd(), &mut arg)? };
        // SAFETY: the kernel returned a new descriptor owned by the caller.
        Ok(unsafe { OwnedFd::from_raw_fd(arg.fd) })
    }

    fn prime_fd_to_handle(&self, fd: i32) -> Result<u32, Errno> {
        let mut arg = PrimeHandle {
            handle: 0,
            flags: 0,
            fd,
        };
        // SAFETY: `arg` is a valid, initialized ioctl argument.
        unsafe { ioctl::drm_prime_fd_to_handle(self.file.as_raw_fd(), &mut arg)? };
        Ok(arg.handle)
    }

    fn map_bo(&self, handle: u32, size: u64) -> Result<Arc<BoMemory>, Errno> {
        let mut arg = GemMmapOffset {
            handle,
            flags: I915_MMAP_OFFSET_WB,
            ..FromZeros::new_zeroed()
        };
        // SAFETY: `arg` is a valid, initialized ioctl argument.
        unsafe { ioctl::i915_gem_mmap_offset(self.file.as_raw_fd(), &mut arg)? };

        let len = usize::try_from(size).map_err(|_| Errno::EINVAL)?;
        // SAFETY: mapping a fresh shared region of the device; the kernel
        // validates the fake offset.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                arg.offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Errno::last());
        }
        let base = NonNull::new(ptr.cast::<u8>()).ok_or(Errno::ENOMEM)?;
        // SAFETY: the mapping was just created with the requested length and
        // is page aligned.
        Ok(Arc::new(unsafe { BoMemory::from_mapping(base, len) }))
    }
}
