// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-product knowledge of page attribute table (PAT) programming.

use crate::AllocationType;
use thiserror::Error;

/// A cache-of-service region an allocation may be reserved in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum CacheRegion {
    #[default]
    Default,
    Region1,
    Region2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub enum CachePolicy {
    Uncached,
    WriteCombined,
    WriteThrough,
    #[default]
    WriteBack,
}

#[derive(Debug, Error)]
#[error("no pat index for {policy:?} caching in {region:?}")]
pub struct PatIndexError {
    pub region: CacheRegion,
    pub policy: CachePolicy,
}

/// Product specific behavior consumed by the memory manager.
pub trait ProductHelper: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether VM bind accepts an explicit PAT index extension.
    fn is_vm_bind_pat_index_programming_supported(&self) -> bool;

    fn num_cache_regions(&self) -> u32;

    /// The PAT index for `policy` within a reserved cache region.
    fn pat_index(&self, region: CacheRegion, policy: CachePolicy) -> Result<u64, PatIndexError>;

    /// The PAT index used when cache regions are not in play.
    fn default_pat_index(&self, uncached: bool) -> u64;

    /// Whether binding a new resource requires a TLB flush before the next
    /// submission.
    fn is_tlb_flush_required(&self) -> bool {
        true
    }

    fn override_pat_index(
        &self,
        uncached: bool,
        pat_index: u64,
        allocation_type: AllocationType,
    ) -> u64 {
        let _ = (uncached, allocation_type);
        pat_index
    }
}

/// Xe products with cache-region reservation.
#[derive(Debug, Default)]
pub struct XeProductHelper;

impl ProductHelper for XeProductHelper {
    fn name(&self) -> &'static str {
        "xe"
    }

    fn is_vm_bind_pat_index_programming_supported(&self) -> bool {
        true
    }

    fn num_cache_regions(&self) -> u32 {
        3
    }

    fn pat_index(&self, region: CacheRegion, policy: CachePolicy) -> Result<u64, PatIndexError> {
        let index = match (region, policy) {
            (CacheRegion::Default, CachePolicy::Uncached) => 0,
            (CacheRegion::Default, CachePolicy::WriteCombined) => 1,
            (CacheRegion::Default, CachePolicy::WriteThrough) => 2,
            (CacheRegion::Default, CachePolicy::WriteBack) => 3,
            (CacheRegion::Region1, CachePolicy::WriteThrough) => 4,
            (CacheRegion::Region1, CachePolicy::WriteBack) => 5,
            (CacheRegion::Region2, CachePolicy::WriteThrough) => 6,
            (CacheRegion::Region2, CachePolicy::WriteBack) => 7,
            _ => return Err(PatIndexError { region, policy }),
        };
        Ok(index)
    }

    fn default_pat_index(&self, uncached: bool) -> u64 {
        if uncached {
            0
        } else {
            3
        }
    }
}

/// Gen12LP products. The kernel picks caching; no PAT extension is sent.
#[derive(Debug, Default)]
pub struct Gen12LpProductHelper;

impl ProductHelper for Gen12LpProductHelper {
    fn name(&self) -> &'static str {
        "gen12lp"
    }

    fn is_vm_bind_pat_index_programming_supported(&self) -> bool {
        false
    }

    fn num_cache_regions(&self) -> u32 {
        0
    }

    fn pat_index(&self, region: CacheRegion, policy: CachePolicy) -> Result<u64, PatIndexError> {
        Err(PatIndexError { region, policy })
    }

    fn default_pat_index(&self, _uncached: bool) -> u64 {
        0
    }
}
