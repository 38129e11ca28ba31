// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per root device kernel interface: capabilities, address spaces, and
//! buffer object binding.

use crate::flags::DebugFlags;
use crate::product::CachePolicy;
use crate::product::CacheRegion;
use crate::product::PatIndexError;
use crate::product::ProductHelper;
use crate::AllocationType;
use crate::BufferObject;
use crate::OsContext;
use drm_sys::defs::I915_PARAM_HAS_CHUNK_SIZE;
use drm_sys::defs::I915_PARAM_HAS_SET_PAIR;
use drm_sys::defs::I915_PARAM_HAS_VM_BIND;
use drm_sys::DrmIoctl;
use drm_sys::Errno;
use drm_sys::VmBindFlags;
use drm_sys::VmBindRequest;
use std::sync::Arc;
use std::sync::OnceLock;

/// The kernel device backing one root device.
pub struct Drm {
    ioctl: Arc<dyn DrmIoctl>,
    product: Arc<dyn ProductHelper>,
    flags: Arc<DebugFlags>,
    root_device_index: u32,
    num_tiles: u32,
    per_context_vms: bool,
    /// Shared address spaces, one per tile.
    vm_ids: Vec<u32>,
    vm_bind: OnceLock<bool>,
    set_pair: OnceLock<bool>,
    chunking: OnceLock<bool>,
}

impl std::fmt::Debug for Drm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drm")
            .field("product", &self.product.name())
            .field("root_device_index", &self.root_device_index)
            .field("num_tiles", &self.num_tiles)
            .field("per_context_vms", &self.per_context_vms)
            .field("vm_ids", &self.vm_ids)
            .finish()
    }
}

impl Drm {
    /// Creates the shared per-tile address spaces for a root device.
    pub fn new(
        ioctl: Arc<dyn DrmIoctl>,
        product: Arc<dyn ProductHelper>,
        flags: Arc<DebugFlags>,
        root_device_index: u32,
        num_tiles: u32,
        per_context_vms: bool,
    ) -> Result<Self, Errno> {
        let num_tiles = num_tiles.max(1);
        let vm_ids = (0..num_tiles)
            .map(|_| ioctl.vm_create())
            .collect::<Result<Vec<_>, _>>()?;
        tracing::debug!(root_device_index, ?vm_ids, product = product.name(), "drm created");
        Ok(Self {
            ioctl,
            product,
            flags,
            root_device_index,
            num_tiles,
            per_context_vms,
            vm_ids,
            vm_bind: OnceLock::new(),
            set_pair: OnceLock::new(),
            chunking: OnceLock::new(),
        })
    }

    pub fn ioctl(&self) -> &dyn DrmIoctl {
        self.ioctl.as_ref()
    }

    pub fn product(&self) -> &dyn ProductHelper {
        self.product.as_ref()
    }

    pub fn flags(&self) -> &Arc<DebugFlags> {
        &self.flags
    }

    pub fn root_device_index(&self) -> u32 {
        self.root_device_index
    }

    pub fn num_tiles(&self) -> u32 {
        self.num_tiles
    }

    pub fn per_context_vms(&self) -> bool {
        self.per_context_vms
    }

    fn query_param(&self, param: i32) -> bool {
        match self.ioctl.get_param(param) {
            Ok(value) => value != 0,
            Err(err) => {
                tracing::debug!(param, error = &err as &dyn std::error::Error, "query failed");
                false
            }
        }
    }

    /// Whether buffer objects are made resident through VM bind. The kernel
    /// is queried once; `UseVmBind` overrides its answer.
    pub fn is_vm_bind_available(&self) -> bool {
        *self.vm_bind.get_or_init(|| {
            let queried = self.query_param(I915_PARAM_HAS_VM_BIND);
            self.flags.use_vm_bind.unwrap_or(queried)
        })
    }

    /// Whether the kernel pairs buffer objects for cross-tile placement.
    /// Queried only when `EnableSetPair` is set; the answer is cached.
    pub fn is_set_pair_available(&self) -> bool {
        *self.set_pair.get_or_init(|| {
            self.flags.enable_set_pair == Some(true) && self.query_param(I915_PARAM_HAS_SET_PAIR)
        })
    }

    /// Whether the kernel splits large buffer objects into chunks placed on
    /// different tiles. Not queried when `EnableBOChunking` is cleared; the
    /// answer is cached.
    pub fn is_chunking_available(&self) -> bool {
        *self.chunking.get_or_init(|| {
            self.flags.enable_bo_chunking != Some(false)
                && self.query_param(I915_PARAM_HAS_CHUNK_SIZE)
        })
    }

    /// Whether newly bound resources require a TLB flush. `ForceTlbFlush`
    /// overrides the product.
    pub fn is_tlb_flush_required(&self) -> bool {
        self.flags
            .force_tlb_flush
            .unwrap_or_else(|| self.product.is_tlb_flush_required())
    }

    /// Creates private address spaces for a new OS context when contexts do
    /// not share the root device's address spaces.
    pub fn create_context_vms(&self) -> Result<Vec<u32>, Errno> {
        if !self.per_context_vms {
            return Ok(Vec::new());
        }
        (0..self.num_tiles).map(|_| self.ioctl.vm_create()).collect()
    }

    /// The address space `os_context` uses on tile `vm_handle_id`.
    pub fn vm_id(&self, os_context: &OsContext, vm_handle_id: u32) -> u32 {
        if self.per_context_vms {
            if let Some(vm_id) = os_context.vm_id(vm_handle_id) {
                return vm_id;
            }
        }
        self.vm_ids[vm_handle_id as usize % self.vm_ids.len()]
    }

    /// The bind table slot for `os_context`. Contexts sharing an address
    /// space share a slot.
    pub fn bind_slot(&self, os_context: &OsContext) -> u32 {
        if self.per_context_vms {
            os_context.context_id()
        } else {
            0
        }
    }

    /// Resolves the PAT index for a mapping, or `None` when the product
    /// does not take one.
    pub fn pat_index(
        &self,
        region: CacheRegion,
        policy: CachePolicy,
        is_system_memory: bool,
        allocation_type: AllocationType,
    ) -> Result<Option<u64>, PatIndexError> {
        let product = self.product.as_ref();
        if !product.is_vm_bind_pat_index_programming_supported() {
            return Ok(None);
        }

        let memory_override = if is_system_memory {
            self.flags.override_pat_index_for_system_memory
        } else {
            self.flags.override_pat_index_for_device_memory
        };
        if let Some(index) = memory_override.or(self.flags.override_pat_index) {
            return Ok(Some(index));
        }

        let uncached = self.flags.force_all_resources_uncached || policy == CachePolicy::Uncached;
        if uncached {
            let index = product.default_pat_index(true);
            return Ok(Some(product.override_pat_index(true, index, allocation_type)));
        }

        if self.flags.clos_enabled == Some(true) && product.num_cache_regions() > 0 {
            return product.pat_index(region, policy).map(Some);
        }

        let index = product.default_pat_index(false);
        Ok(Some(product.override_pat_index(false, index, allocation_type)))
    }

    fn bind_request(
        &self,
        os_context: &OsContext,
        vm_handle_id: u32,
        bo: &BufferObject,
        flags: VmBindFlags,
        pat_index: Option<u64>,
    ) -> VmBindRequest {
        VmBindRequest {
            vm_id: self.vm_id(os_context, vm_handle_id),
            handle: bo.handle(),
            start: bo.gpu_address(),
            offset: 0,
            length: bo.size(),
            flags,
            pat_index,
        }
    }

    /// Binds `bo` and returns the PAT index the bind carried.
    pub fn bind_buffer_object(
        &self,
        os_context: &OsContext,
        vm_handle_id: u32,
        bo: &BufferObject,
    ) -> Result<Option<u64>, Errno> {
        let locked = bo.requires_explicit_locked_memory();
        let flags = VmBindFlags::new()
            .with_immediate(bo.requires_immediate_binding() || locked)
            .with_make_resident(locked);
        let request = self.bind_request(os_context, vm_handle_id, bo, flags, bo.pat_index());
        tracing::trace!(
            vm_id = request.vm_id,
            handle = request.handle,
            start = request.start,
            pat_index = request.pat_index,
            "vm bind"
        );
        self.ioctl.vm_bind(&request)?;
        Ok(request.pat_index)
    }

    /// Unbinds with `pat_index`, which must be the index returned by the
    /// matching bind.
    pub fn unbind_buffer_object(
        &self,
        os_context: &OsContext,
        vm_handle_id: u32,
        bo: &BufferObject,
        pat_index: Option<u64>,
    ) -> Result<(), Errno> {
        let request =
            self.bind_request(os_context, vm_handle_id, bo, VmBindFlags::new(), pat_index);
        tracing::trace!(
            vm_id = request.vm_id,
            handle = request.handle,
            start = request.start,
            "vm unbind"
        );
        self.ioctl.vm_unbind(&request)
    }
}
