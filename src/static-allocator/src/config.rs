// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Tunables of an allocation run.

use serde::{Deserialize, Serialize};

/// Memory kept back from the service VM hugepage pool for the runtime, in MiB.
pub const DEFAULT_RUNTIME_OVERHEAD_MIB: u64 = 4 * 1024;
/// Memory kept back for every virtio GPU, in MiB.
pub const DEFAULT_GPU_RESERVATION_MIB: u64 = 300;
/// First IRQ of the pool used for legacy vUARTs of VMs other than the service VM.
pub const DEFAULT_VUART_IRQ_START: u32 = 5;
/// Last IRQ of the pool used for legacy vUARTs of VMs other than the service VM.
pub const DEFAULT_VUART_IRQ_END: u32 = 14;

/// Strongly typed structure that represents the configuration of an allocation run.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AllocatorConfig {
    /// Treat every warning as a fatal error.
    #[serde(default)]
    pub strict: bool,
    /// Memory subtracted from the hugepage budget for the service VM runtime, in MiB.
    #[serde(default = "default_runtime_overhead_mib")]
    pub runtime_overhead_mib: u64,
    /// Memory subtracted from the hugepage budget per virtio GPU, in MiB.
    #[serde(default = "default_gpu_reservation_mib")]
    pub gpu_reservation_mib: u64,
    /// IRQ pool for legacy vUARTs of VMs other than the service VM.
    #[serde(default)]
    pub vuart_irq_pool: IrqRange,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        AllocatorConfig {
            strict: false,
            runtime_overhead_mib: DEFAULT_RUNTIME_OVERHEAD_MIB,
            gpu_reservation_mib: DEFAULT_GPU_RESERVATION_MIB,
            vuart_irq_pool: IrqRange::default(),
        }
    }
}

impl AllocatorConfig {
    /// Parses a configuration file.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

fn default_runtime_overhead_mib() -> u64 {
    DEFAULT_RUNTIME_OVERHEAD_MIB
}

fn default_gpu_reservation_mib() -> u64 {
    DEFAULT_GPU_RESERVATION_MIB
}

/// Inclusive range of IRQ lines.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IrqRange {
    pub start: u32,
    pub end: u32,
}

impl Default for IrqRange {
    fn default() -> Self {
        IrqRange {
            start: DEFAULT_VUART_IRQ_START,
            end: DEFAULT_VUART_IRQ_END,
        }
    }
}

impl IrqRange {
    pub fn to_vec(self) -> Vec<u32> {
        (self.start..=self.end).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AllocatorConfig::from_json("{}").unwrap();
        assert_eq!(config, AllocatorConfig::default());
        assert!(!config.strict);
        assert_eq!(config.vuart_irq_pool.to_vec(), (5..=14).collect::<Vec<_>>());
    }

    #[test]
    fn test_overrides() {
        let config = AllocatorConfig::from_json(
            r#"{"strict": true, "gpu_reservation_mib": 512, "vuart_irq_pool": {"start": 9, "end": 10}}"#,
        )
        .unwrap();
        assert!(config.strict);
        assert_eq!(config.gpu_reservation_mib, 512);
        assert_eq!(config.runtime_overhead_mib, DEFAULT_RUNTIME_OVERHEAD_MIB);
        assert_eq!(config.vuart_irq_pool.to_vec(), vec![9, 10]);

        AllocatorConfig::from_json(r#"{"verbose": true}"#).unwrap_err();
    }
}
