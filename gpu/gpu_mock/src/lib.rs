// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test doubles for the GPU stack: a fake DRM kernel, engines that execute
//! command streams on the CPU, and a builder for complete device
//! topologies.
//!
//! Nothing here touches real hardware. Memory written through
//! [`gpu_memory::GraphicsAllocation::storage`] is the same memory the
//! simulated engines read and write.

#![cfg(unix)]
#![warn(missing_docs)]

mod csr;
mod drm;

pub use csr::ExecutionStats;
pub use csr::MockHostFunctionStreamer;
pub use csr::Scheduler;
pub use csr::SimulatedCsr;
pub use drm::BindCall;
pub use drm::MockDrm;
pub use drm::MockDrmContext;
pub use drm::MockKernel;

use drm_sys::defs::I915_PARAM_HAS_VM_BIND;
use gpu_memory::product::Gen12LpProductHelper;
use gpu_memory::product::ProductHelper;
use gpu_memory::product::XeProductHelper;
use gpu_memory::AllocationProperties;
use gpu_memory::AllocationType;
use gpu_memory::DebugFlags;
use gpu_memory::Device;
use gpu_memory::DeviceBitfield;
use gpu_memory::Drm;
use gpu_memory::EngineControl;
use gpu_memory::EngineType;
use gpu_memory::MemoryManager;
use gpu_memory::PAGE_SIZE;
use std::collections::HashMap;
use std::sync::Arc;

/// Initializes tracing for a test, once per process. `RUST_LOG` selects
/// targets; the default is debug for everything.
pub fn init_tracing() {
    use std::sync::Once;
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::filter::Targets;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let targets = std::env::var("RUST_LOG")
            .ok()
            .and_then(|var| var.parse::<Targets>().ok())
            .unwrap_or_else(|| Targets::new().with_default(LevelFilter::DEBUG));

        tracing_subscriber::fmt()
            .pretty()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

/// The simulated product family.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MockProduct {
    /// Supports VM bind PAT programming and cache regions.
    Xe,
    /// No PAT programming.
    Gen12Lp,
}

impl MockProduct {
    fn helper(self) -> Arc<dyn ProductHelper> {
        match self {
            MockProduct::Xe => Arc::new(XeProductHelper),
            MockProduct::Gen12Lp => Arc::new(Gen12LpProductHelper),
        }
    }
}

/// Configures a [`MockEnvironment`].
#[derive(Clone)]
pub struct MockEnvironmentBuilder {
    root_devices: u32,
    tiles: u32,
    per_context_vms: bool,
    vm_bind: bool,
    flags: DebugFlags,
    product: MockProduct,
    kernel: Option<Arc<MockKernel>>,
    copy_engine: bool,
    host_functions: bool,
    dc_flush: bool,
    tbx: bool,
}

impl Default for MockEnvironmentBuilder {
    fn default() -> Self {
        Self {
            root_devices: 1,
            tiles: 1,
            per_context_vms: false,
            vm_bind: true,
            flags: DebugFlags::default(),
            product: MockProduct::Xe,
            kernel: None,
            copy_engine: false,
            host_functions: false,
            dc_flush: false,
            tbx: false,
        }
    }
}

impl MockEnvironmentBuilder {
    /// The number of root devices.
    pub fn root_devices(mut self, count: u32) -> Self {
        self.root_devices = count.max(1);
        self
    }

    /// The number of tiles per root device.
    pub fn tiles(mut self, count: u32) -> Self {
        self.tiles = count.max(1);
        self
    }

    /// Gives each OS context its own address spaces.
    pub fn per_context_vms(mut self, enabled: bool) -> Self {
        self.per_context_vms = enabled;
        self
    }

    /// Whether the kernel reports VM bind support.
    pub fn vm_bind(mut self, available: bool) -> Self {
        self.vm_bind = available;
        self
    }

    /// Debug flags shared by every root device.
    pub fn flags(mut self, flags: DebugFlags) -> Self {
        self.flags = flags;
        self
    }

    /// The product family of every root device.
    pub fn product(mut self, product: MockProduct) -> Self {
        self.product = product;
        self
    }

    /// Shares GEM objects with other environments on the same kernel, as
    /// separate processes would.
    pub fn kernel(mut self, kernel: Arc<MockKernel>) -> Self {
        self.kernel = Some(kernel);
        self
    }

    /// Adds a copy engine to each root device.
    pub fn copy_engine(mut self, enabled: bool) -> Self {
        self.copy_engine = enabled;
        self
    }

    /// Gives each engine a host function streamer.
    pub fn host_functions(mut self, enabled: bool) -> Self {
        self.host_functions = enabled;
        self
    }

    /// Whether engines require data-cache flushes before host-visible
    /// signals.
    pub fn dc_flush(mut self, enabled: bool) -> Self {
        self.dc_flush = enabled;
        self
    }

    /// Runs every engine in TBX mode.
    pub fn tbx(mut self, enabled: bool) -> Self {
        self.tbx = enabled;
        self
    }

    /// Creates the environment.
    pub fn build(self) -> MockEnvironment {
        init_tracing();
        let kernel = self.kernel.clone().unwrap_or_else(MockKernel::new);
        let flags = Arc::new(self.flags.clone());

        let files: Vec<_> = (0..self.root_devices)
            .map(|_| {
                let file = MockDrm::new(kernel.clone());
                file.set_param(I915_PARAM_HAS_VM_BIND, self.vm_bind as i32);
                file
            })
            .collect();
        let drms = files
            .iter()
            .enumerate()
            .map(|(index, file)| {
                Drm::new(
                    file.clone(),
                    self.product.helper(),
                    flags.clone(),
                    index as u32,
                    self.tiles,
                    self.per_context_vms,
                )
                .map(Arc::new)
                .expect("mock vm creation cannot fail")
            })
            .collect();
        let memory_manager = Arc::new(MemoryManager::new(drms));
        let scheduler = Scheduler::new();

        let mut env = MockEnvironment {
            kernel,
            files,
            memory_manager,
            scheduler,
            devices: Vec::new(),
            csrs: HashMap::new(),
        };
        for root in 0..self.root_devices {
            let sub_devices = if self.tiles > 1 {
                (0..self.tiles)
                    .map(|tile| {
                        let engine = env.create_engine(
                            &self,
                            root,
                            DeviceBitfield::single(tile),
                            EngineType::Compute,
                        );
                        Arc::new(Device::new_sub_device(root, tile, vec![engine]))
                    })
                    .collect()
            } else {
                Vec::new()
            };
            let bitfield = DeviceBitfield::all(self.tiles);
            let mut engines = vec![env.create_engine(&self, root, bitfield, EngineType::Compute)];
            if self.copy_engine {
                engines.push(env.create_engine(&self, root, bitfield, EngineType::Copy));
            }
            env.devices
                .push(Arc::new(Device::new_root(root, bitfield, engines, sub_devices)));
        }
        env
    }
}

/// A complete simulated process: root devices, their engines, and the
/// memory manager.
pub struct MockEnvironment {
    kernel: Arc<MockKernel>,
    files: Vec<Arc<MockDrm>>,
    memory_manager: Arc<MemoryManager>,
    scheduler: Arc<Scheduler>,
    devices: Vec<Arc<Device>>,
    csrs: HashMap<u32, Arc<SimulatedCsr>>,
}

impl MockEnvironment {
    /// Starts configuring an environment.
    pub fn builder() -> MockEnvironmentBuilder {
        MockEnvironmentBuilder::default()
    }

    /// One root device with one tile and default flags.
    pub fn new() -> Self {
        Self::builder().build()
    }

    fn create_engine(
        &mut self,
        config: &MockEnvironmentBuilder,
        root: u32,
        bitfield: DeviceBitfield,
        engine_type: EngineType,
    ) -> EngineControl {
        let os_context = self
            .memory_manager
            .create_os_context(root, bitfield, engine_type)
            .expect("mock context creation cannot fail");
        let host_functions = config.host_functions.then(|| {
            let slot = self
                .memory_manager
                .allocate_graphics_memory(&AllocationProperties::new(
                    root,
                    PAGE_SIZE,
                    AllocationType::TagBuffer,
                ))
                .expect("mock allocation cannot fail");
            MockHostFunctionStreamer::new(slot)
        });
        let csr = SimulatedCsr::new(
            os_context.clone(),
            &self.memory_manager,
            &self.scheduler,
            host_functions,
            config.dc_flush,
            config.tbx,
        );
        self.csrs.insert(os_context.context_id(), csr.clone());
        let engine = EngineControl::new(csr);
        self.memory_manager
            .register_engine(engine.clone())
            .expect("root device exists");
        engine
    }

    /// The kernel shared by this environment's files.
    pub fn kernel(&self) -> &Arc<MockKernel> {
        &self.kernel
    }

    /// The DRM file of `root`.
    pub fn drm(&self, root: u32) -> &Arc<MockDrm> {
        &self.files[root as usize]
    }

    /// The memory manager.
    pub fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.memory_manager
    }

    /// Runs all engines until they are idle or blocked.
    pub fn run(&self) {
        self.scheduler.run();
    }

    /// The root device `root`.
    pub fn device(&self, root: u32) -> &Arc<Device> {
        &self.devices[root as usize]
    }

    /// The simulated engine behind `engine`.
    pub fn csr(&self, engine: &EngineControl) -> &Arc<SimulatedCsr> {
        &self.csrs[&engine.context_id()]
    }

    /// The simulated engine for the default engine of `device`.
    pub fn default_csr(&self, device: &Device) -> &Arc<SimulatedCsr> {
        self.csr(device.default_engine().expect("devices have an engine"))
    }
}

impl Default for MockEnvironment {
    fn default() -> Self {
        Self::new()
    }
}
