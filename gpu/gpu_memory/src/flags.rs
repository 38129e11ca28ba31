// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Driver debug flags.

use anyhow::Context;
use std::ffi::OsString;

/// Debug and tuning knobs read from the environment.
///
/// Each flag is read from an environment variable of the same name. A value
/// of `-1`, or an unset variable, selects the driver default, represented as
/// `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugFlags {
    /// (UseVmBind=0|1) Override the kernel's VM-bind capability.
    pub use_vm_bind: Option<bool>,
    /// (EnableSetPair=0|1) Query the set-pair capability.
    pub enable_set_pair: Option<bool>,
    /// (EnableBOChunking=0|1) Query the chunking capability.
    pub enable_bo_chunking: Option<bool>,
    /// (ForceAllResourcesUncached=1) Map every allocation uncached.
    pub force_all_resources_uncached: bool,
    /// (ClosEnabled=0|1) Use cache-region specific PAT indices.
    pub clos_enabled: Option<bool>,
    /// (OverridePatIndex=\<number\>)
    pub override_pat_index: Option<u64>,
    /// (OverridePatIndexForDeviceMemory=\<number\>) Takes precedence over
    /// `OverridePatIndex` for local memory.
    pub override_pat_index_for_device_memory: Option<u64>,
    /// (OverridePatIndexForSystemMemory=\<number\>) Takes precedence over
    /// `OverridePatIndex` for system memory.
    pub override_pat_index_for_system_memory: Option<u64>,
    /// (InOrderDuplicatedCounterStorageEnabled=0|1) Mirror in-order counters
    /// into a separate host allocation.
    pub in_order_duplicated_counter_storage_enabled: Option<bool>,
    /// (InOrderAtomicSignallingEnabled=0|1) Signal in-order counters with
    /// atomic increments instead of stores.
    pub in_order_atomic_signalling_enabled: Option<bool>,
    /// (MakeEachAllocationResident=1|2) Bind every allocation into all
    /// registered contexts when it is created (1), or make every allocation
    /// of the root device resident on each submission (2).
    pub make_each_allocation_resident: Option<u32>,
    /// (ForceTlbFlush=0|1) Override whether new bindings require a TLB
    /// flush.
    pub force_tlb_flush: Option<bool>,
}

impl DebugFlags {
    /// Reads the flags from the process environment.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var_os(name))
    }

    /// Reads the flags through `lookup`, which maps a flag name to its raw
    /// value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<OsString>) -> anyhow::Result<Self> {
        let parse_env_number = |name: &str| -> anyhow::Result<Option<i64>> {
            let value = lookup(name)
                .map(|v| {
                    v.to_string_lossy().trim().parse::<i64>().context(format!(
                        "Error parsing numeric environment variable {} {:?}",
                        name, v
                    ))
                })
                .transpose()?;
            Ok(value.filter(|&v| v != -1))
        };
        let parse_env_bool = |name: &str| -> anyhow::Result<Option<bool>> {
            Ok(parse_env_number(name)?.map(|v| v != 0))
        };
        let parse_env_index = |name: &str| -> anyhow::Result<Option<u64>> {
            parse_env_number(name)?
                .map(|v| u64::try_from(v).with_context(|| format!("{name} is negative")))
                .transpose()
        };

        Ok(Self {
            use_vm_bind: parse_env_bool("UseVmBind")?,
            enable_set_pair: parse_env_bool("EnableSetPair")?,
            enable_bo_chunking: parse_env_bool("EnableBOChunking")?,
            force_all_resources_uncached: parse_env_bool("ForceAllResourcesUncached")?
                .unwrap_or_default(),
            clos_enabled: parse_env_bool("ClosEnabled")?,
            override_pat_index: parse_env_index("OverridePatIndex")?,
            override_pat_index_for_device_memory: parse_env_index(
                "OverridePatIndexForDeviceMemory",
            )?,
            override_pat_index_for_system_memory: parse_env_index(
                "OverridePatIndexForSystemMemory",
            )?,
            in_order_duplicated_counter_storage_enabled: parse_env_bool(
                "InOrderDuplicatedCounterStorageEnabled",
            )?,
            in_order_atomic_signalling_enabled: parse_env_bool("InOrderAtomicSignallingEnabled")?,
            make_each_allocation_resident: parse_env_index("MakeEachAllocationResident")?
                .map(|v| v as u32),
            force_tlb_flush: parse_env_bool("ForceTlbFlush")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(vars: &[(&str, &str)]) -> anyhow::Result<DebugFlags> {
        let vars: HashMap<String, OsString> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), OsString::from(v)))
            .collect();
        DebugFlags::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn unset_and_minus_one_are_default() {
        let flags = parse(&[("UseVmBind", "-1"), ("OverridePatIndex", "-1")]).unwrap();
        assert_eq!(flags, DebugFlags::default());
    }

    #[test]
    fn values_are_parsed() {
        let flags = parse(&[
            ("UseVmBind", "1"),
            ("EnableSetPair", "0"),
            ("ForceAllResourcesUncached", "1"),
            ("OverridePatIndexForSystemMemory", "3"),
            ("MakeEachAllocationResident", "2"),
            ("ForceTlbFlush", "0"),
        ])
        .unwrap();
        assert_eq!(flags.use_vm_bind, Some(true));
        assert_eq!(flags.enable_set_pair, Some(false));
        assert!(flags.force_all_resources_uncached);
        assert_eq!(flags.override_pat_index_for_system_memory, Some(3));
        assert_eq!(flags.make_each_allocation_resident, Some(2));
        assert_eq!(flags.force_tlb_flush, Some(false));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse(&[("ClosEnabled", "yes")]).is_err());
        assert!(parse(&[("OverridePatIndex", "-5")]).is_err());
    }
}
