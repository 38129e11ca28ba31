// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A fake DRM kernel driver.

use drm_sys::defs::I915_PARAM_HAS_VM_BIND;
use drm_sys::BoMemory;
use drm_sys::DrmIoctl;
use drm_sys::Errno;
use drm_sys::VmBindRequest;
use nix::fcntl::OFlag;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct KernelObject {
    memory: Arc<BoMemory>,
    size: u64,
}

/// An exported object. The caller holds the read end of a pipe as its
/// descriptor; the kernel keeps the write end to detect when it is closed.
struct DmaBuf {
    object: u64,
    peer: OwnedFd,
}

impl DmaBuf {
    fn is_open(&self) -> bool {
        nix::unistd::write(&self.peer, &[0]) != Err(Errno::EPIPE)
    }
}

#[derive(Default)]
struct KernelState {
    next_object: u64,
    objects: HashMap<u64, KernelObject>,
    dma_bufs: HashMap<i32, DmaBuf>,
}

/// Kernel-wide state shared by every [`MockDrm`] file, standing in for
/// memory that can be shared across processes.
#[derive(Default)]
pub struct MockKernel {
    state: Mutex<KernelState>,
}

impl MockKernel {
    /// Creates an empty kernel.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(KernelState {
                next_object: 1,
                ..Default::default()
            }),
        })
    }

    fn create_object(&self, size: u64) -> u64 {
        let mut state = self.state.lock();
        let id = state.next_object;
        state.next_object += 1;
        state.objects.insert(
            id,
            KernelObject {
                memory: Arc::new(BoMemory::new_heap(size as usize)),
                size,
            },
        );
        id
    }

    /// The number of live GEM objects.
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Whether the descriptor returned by an export of `fd` is still open.
    pub fn is_dma_buf_open(&self, fd: i32) -> bool {
        self.state
            .lock()
            .dma_bufs
            .get(&fd)
            .is_some_and(DmaBuf::is_open)
    }
}

#[derive(Default)]
struct FileState {
    next_handle: u32,
    handles: HashMap<u32, u64>,
    next_vm_id: u32,
}

/// One recorded bind or unbind call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindCall {
    /// The request as received.
    pub request: VmBindRequest,
    /// The result returned to the caller.
    pub result: Result<(), Errno>,
}

/// Call counters and captured arguments.
#[derive(Default)]
pub struct MockDrmContext {
    /// Successful and failed bind calls, in order.
    pub vm_binds: Vec<BindCall>,
    /// Successful and failed unbind calls, in order.
    pub vm_unbinds: Vec<BindCall>,
    /// PAT index of the last bind, if one was sent.
    pub received_vm_bind_pat_index: Option<u64>,
    /// PAT index of the last unbind, if one was sent.
    pub received_vm_unbind_pat_index: Option<u64>,
    /// Number of queries per parameter.
    pub param_queries: HashMap<i32, u32>,
    /// Closed handles, in order.
    pub closed_handles: Vec<u32>,
}

/// A DRM file backed by a [`MockKernel`].
pub struct MockDrm {
    kernel: Arc<MockKernel>,
    file: Mutex<FileState>,
    params: Mutex<HashMap<i32, i32>>,
    context: Mutex<MockDrmContext>,
    bind_failures: Mutex<VecDeque<Errno>>,
    unbind_failures: Mutex<VecDeque<Errno>>,
    fail_exports: AtomicU32,
    fail_imports: AtomicU32,
}

impl MockDrm {
    /// Opens a new file on `kernel`. VM bind is reported as available.
    pub fn new(kernel: Arc<MockKernel>) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            file: Mutex::new(FileState {
                next_handle: 1,
                next_vm_id: 1,
                ..Default::default()
            }),
            params: Mutex::new([(I915_PARAM_HAS_VM_BIND, 1)].into()),
            context: Mutex::new(MockDrmContext::default()),
            bind_failures: Mutex::new(VecDeque::new()),
            unbind_failures: Mutex::new(VecDeque::new()),
            fail_exports: AtomicU32::new(0),
            fail_imports: AtomicU32::new(0),
        })
    }

    /// The kernel behind this file.
    pub fn kernel(&self) -> &Arc<MockKernel> {
        &self.kernel
    }

    /// Sets the value returned for `param`.
    pub fn set_param(&self, param: i32, value: i32) {
        self.params.lock().insert(param, value);
    }

    /// Captured calls.
    pub fn context(&self) -> parking_lot::MutexGuard<'_, MockDrmContext> {
        self.context.lock()
    }

    /// Successful bind calls.
    pub fn bind_count(&self) -> usize {
        self.context
            .lock()
            .vm_binds
            .iter()
            .filter(|c| c.result.is_ok())
            .count()
    }

    /// Successful unbind calls.
    pub fn unbind_count(&self) -> usize {
        self.context
            .lock()
            .vm_unbinds
            .iter()
            .filter(|c| c.result.is_ok())
            .count()
    }

    /// Number of times `param` was queried.
    pub fn query_count(&self, param: i32) -> u32 {
        self.context
            .lock()
            .param_queries
            .get(&param)
            .copied()
            .unwrap_or(0)
    }

    /// Fails the next `times` binds with `errno`.
    pub fn fail_vm_bind(&self, errno: Errno, times: usize) {
        self.bind_failures
            .lock()
            .extend(std::iter::repeat_n(errno, times));
    }

    /// Fails the next `times` unbinds with `errno`.
    pub fn fail_vm_unbind(&self, errno: Errno, times: usize) {
        self.unbind_failures
            .lock()
            .extend(std::iter::repeat_n(errno, times));
    }

    /// Fails the next `times` handle exports.
    pub fn fail_exports(&self, times: u32) {
        self.fail_exports.store(times, Ordering::SeqCst);
    }

    /// Fails the next `times` handle imports.
    pub fn fail_imports(&self, times: u32) {
        self.fail_imports.store(times, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn object(&self, handle: u32) -> Result<u64, Errno> {
        self.file
            .lock()
            .handles
            .get(&handle)
            .copied()
            .ok_or(Errno::ENOENT)
    }

    fn record(
        &self,
        request: &VmBindRequest,
        failures: &Mutex<VecDeque<Errno>>,
        unbind: bool,
    ) -> Result<(), Errno> {
        let result = match failures.lock().pop_front() {
            Some(errno) => Err(errno),
            None => self.object(request.handle).map(drop),
        };
        let mut context = self.context.lock();
        let call = BindCall {
            request: request.clone(),
            result,
        };
        if unbind {
            context.received_vm_unbind_pat_index = request.pat_index;
            context.vm_unbinds.push(call);
        } else {
            context.received_vm_bind_pat_index = request.pat_index;
            context.vm_binds.push(call);
        }
        result
    }
}

impl DrmIoctl for MockDrm {
    fn get_param(&self, param: i32) -> Result<i32, Errno> {
        *self.context.lock().param_queries.entry(param).or_default() += 1;
        self.params.lock().get(&param).copied().ok_or(Errno::EINVAL)
    }

    fn gem_create(&self, size: u64) -> Result<u32, Errno> {
        let object = self.kernel.create_object(size);
        let mut file = self.file.lock();
        let handle = file.next_handle;
        file.next_handle += 1;
        file.handles.insert(handle, object);
        Ok(handle)
    }

    fn gem_close(&self, handle: u32) -> Result<(), Errno> {
        let object = self
            .file
            .lock()
            .handles
            .remove(&handle)
            .ok_or(Errno::ENOENT)?;
        self.context.lock().closed_handles.push(handle);
        let mut kernel = self.kernel.state.lock();
        if !kernel
            .dma_bufs
            .values()
            .any(|buf| buf.object == object && buf.is_open())
        {
            kernel.objects.remove(&object);
        }
        Ok(())
    }

    fn vm_create(&self) -> Result<u32, Errno> {
        let mut file = self.file.lock();
        let vm_id = file.next_vm_id;
        file.next_vm_id += 1;
        Ok(vm_id)
    }

    fn vm_bind(&self, request: &VmBindRequest) -> Result<(), Errno> {
        self.record(request, &self.bind_failures, false)
    }

    fn vm_unbind(&self, request: &VmBindRequest) -> Result<(), Errno> {
        self.record(request, &self.unbind_failures, true)
    }

    fn prime_handle_to_fd(&self, handle: u32) -> Result<OwnedFd, Errno> {
        if Self::take_failure(&self.fail_exports) {
            return Err(Errno::EMFILE);
        }
        let object = self.object(handle)?;
        let (fd, peer) = nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
        // A closed descriptor's number may be handed out again.
        self.kernel
            .state
            .lock()
            .dma_bufs
            .insert(fd.as_raw_fd(), DmaBuf { object, peer });
        Ok(fd)
    }

    fn prime_fd_to_handle(&self, fd: i32) -> Result<u32, Errno> {
        if Self::take_failure(&self.fail_imports) {
            return Err(Errno::EBADF);
        }
        let object = self
            .kernel
            .state
            .lock()
            .dma_bufs
            .get(&fd)
            .filter(|buf| buf.is_open())
            .ok_or(Errno::EBADF)?
            .object;
        let mut file = self.file.lock();
        if let Some((&handle, _)) = file.handles.iter().find(|&(_, &o)| o == object) {
            return Ok(handle);
        }
        let handle = file.next_handle;
        file.next_handle += 1;
        file.handles.insert(handle, object);
        Ok(handle)
    }

    fn map_bo(&self, handle: u32, size: u64) -> Result<Arc<BoMemory>, Errno> {
        let object = self.object(handle)?;
        let kernel = self.kernel.state.lock();
        let object = kernel.objects.get(&object).ok_or(Errno::ENOENT)?;
        if size > object.size {
            return Err(Errno::EINVAL);
        }
        Ok(object.memory.clone())
    }
}
