// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! GEM buffer objects and their VM bind state.

use crate::Drm;
use crate::OsContext;
use drm_sys::Errno;
use parking_lot::Mutex;
use std::collections::hash_map;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

/// Identifies one binding of a buffer object: a tile's address space and
/// the context slot within it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BindKey {
    pub vm_handle_id: u32,
    pub slot: u32,
}

#[derive(Debug, Default)]
struct BoState {
    /// Bound pairs and the PAT index each was bound with.
    bound: HashMap<BindKey, Option<u64>>,
    pat_index: Option<u64>,
    require_immediate_binding: bool,
    require_explicit_locked_memory: bool,
}

/// A GEM object. The handle is closed when the last reference drops.
pub struct BufferObject {
    drm: Arc<Drm>,
    pool: Arc<SharedBoPool>,
    handle: u32,
    size: u64,
    gpu_address: u64,
    state: Mutex<BoState>,
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("gpu_address", &self.gpu_address)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl BufferObject {
    pub fn new(
        drm: Arc<Drm>,
        pool: Arc<SharedBoPool>,
        handle: u32,
        size: u64,
        gpu_address: u64,
        pat_index: Option<u64>,
    ) -> Self {
        Self {
            drm,
            pool,
            handle,
            size,
            gpu_address,
            state: Mutex::new(BoState {
                pat_index,
                ..Default::default()
            }),
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    pub fn root_device_index(&self) -> u32 {
        self.drm.root_device_index()
    }

    pub fn pat_index(&self) -> Option<u64> {
        self.state.lock().pat_index
    }

    pub fn set_pat_index(&self, pat_index: Option<u64>) {
        self.state.lock().pat_index = pat_index;
    }

    pub fn requires_immediate_binding(&self) -> bool {
        self.state.lock().require_immediate_binding
    }

    pub fn require_immediate_binding(&self, required: bool) {
        self.state.lock().require_immediate_binding = required;
    }

    pub fn requires_explicit_locked_memory(&self) -> bool {
        self.state.lock().require_explicit_locked_memory
    }

    pub fn require_explicit_locked_memory(&self, required: bool) {
        self.state.lock().require_explicit_locked_memory = required;
    }

    fn key(&self, os_context: &OsContext, vm_handle_id: u32) -> BindKey {
        BindKey {
            vm_handle_id,
            slot: self.drm.bind_slot(os_context),
        }
    }

    /// The PAT index the pair was bound with, if it is bound.
    pub fn bound_pat_index(
        &self,
        os_context: &OsContext,
        vm_handle_id: u32,
    ) -> Option<Option<u64>> {
        let key = self.key(os_context, vm_handle_id);
        self.state.lock().bound.get(&key).copied()
    }

    pub fn is_bound(&self, os_context: &OsContext, vm_handle_id: u32) -> bool {
        let key = self.key(os_context, vm_handle_id);
        self.state.lock().bound.contains_key(&key)
    }

    /// The number of (address space, slot) pairs the object is bound in.
    pub fn bind_count(&self) -> usize {
        self.state.lock().bound.len()
    }

    /// Binds the object into `os_context`'s address space on tile
    /// `vm_handle_id`. Returns false if the pair was already bound, in which
    /// case nothing is sent to the kernel.
    pub fn bind(&self, os_context: &OsContext, vm_handle_id: u32) -> Result<bool, Errno> {
        let key = self.key(os_context, vm_handle_id);
        if self.state.lock().bound.contains_key(&key) {
            return Ok(false);
        }
        let pat_index = self.drm.bind_buffer_object(os_context, vm_handle_id, self)?;
        self.state.lock().bound.insert(key, pat_index);
        Ok(true)
    }

    /// Unbinds the pair bound by [`Self::bind`], with the PAT index it was
    /// bound with. Unbinding a pair that is not bound is a no-op.
    pub fn unbind(&self, os_context: &OsContext, vm_handle_id: u32) -> Result<(), Errno> {
        let key = self.key(os_context, vm_handle_id);
        let Some(&pat_index) = self.state.lock().bound.get(&key) else {
            return Ok(());
        };
        self.drm
            .unbind_buffer_object(os_context, vm_handle_id, self, pat_index)?;
        self.state.lock().bound.remove(&key);
        Ok(())
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        let mut entries = self.pool.entries.lock();
        if let hash_map::Entry::Occupied(entry) = entries.entry(self.handle) {
            if entry.get().strong_count() != 0 {
                // A later import of the same memory owns the handle now.
                return;
            }
            entry.remove();
        }
        if let Err(err) = self.drm.ioctl().gem_close(self.handle) {
            tracing::error!(
                handle = self.handle,
                error = &err as &dyn std::error::Error,
                "failed to close gem handle"
            );
        }
    }
}

/// Buffer objects that can be reached through a shared (prime) handle.
///
/// Importing memory that is already open in this process yields the
/// existing buffer object. Entries are removed when the last reference to
/// the buffer object drops.
#[derive(Debug, Default)]
pub struct SharedBoPool {
    entries: Mutex<HashMap<u32, Weak<BufferObject>>>,
}

impl SharedBoPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `bo` so that imports of its handle reuse it.
    pub fn insert(&self, bo: &Arc<BufferObject>) {
        self.entries.lock().insert(bo.handle(), Arc::downgrade(bo));
    }

    /// Resolves a handle with `import` and returns the live buffer object for
    /// it, or publishes the one built by `create`. The second value is true
    /// when an existing object was reused.
    ///
    /// `import` runs under the pool lock so that a concurrent drop cannot
    /// close the handle between resolution and lookup.
    pub fn find_or_import<E>(
        &self,
        import: impl FnOnce() -> Result<u32, E>,
        create: impl FnOnce(u32) -> Result<BufferObject, E>,
    ) -> Result<(Arc<BufferObject>, bool), E> {
        let mut entries = self.entries.lock();
        let handle = import()?;
        if let Some(bo) = entries.get(&handle).and_then(Weak::upgrade) {
            return Ok((bo, true));
        }
        let bo = Arc::new(create(handle)?);
        entries.insert(handle, Arc::downgrade(&bo));
        Ok((bo, false))
    }

    /// The number of live shared buffer objects.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|bo| bo.strong_count() != 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
