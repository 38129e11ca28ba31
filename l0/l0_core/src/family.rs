// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hardware generation differences in how dependencies are encoded.

/// The graphics core family a command list encodes for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum GfxFamily {
    /// 64-bit counters, atomic signalling, implicit scaling across tiles.
    XeHpcCore,
    /// 32-bit counters on a single partition.
    Gen12Lp,
}

impl GfxFamily {
    pub fn name(self) -> &'static str {
        match self {
            GfxFamily::XeHpcCore => "xe_hpc_core",
            GfxFamily::Gen12Lp => "gen12lp",
        }
    }

    /// Whether in-order counters are 64 bits wide. Waits on 64-bit
    /// counters compare against a register loaded with the value.
    pub fn qword_counters(self) -> bool {
        match self {
            GfxFamily::XeHpcCore => true,
            GfxFamily::Gen12Lp => false,
        }
    }

    /// Whether counters may be signalled with an atomic increment.
    pub fn atomic_signalling_supported(self) -> bool {
        match self {
            GfxFamily::XeHpcCore => true,
            GfxFamily::Gen12Lp => false,
        }
    }

    /// Bytes between the counter slots of consecutive partitions.
    pub fn partition_stride(self) -> u64 {
        match self {
            GfxFamily::XeHpcCore => 16,
            GfxFamily::Gen12Lp => 8,
        }
    }

    /// The most partitions a dispatch can span.
    pub fn max_partitions(self) -> u32 {
        match self {
            GfxFamily::XeHpcCore => 4,
            GfxFamily::Gen12Lp => 1,
        }
    }
}
