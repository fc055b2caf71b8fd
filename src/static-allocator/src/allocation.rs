// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The allocation document, populated by the allocators and consumed by the code generators.
//!
//! Every collection is ordered (`BTreeMap` or a `Vec` filled in a fixed order), so serializing
//! the same allocation always yields the same bytes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::pci::PciBdf;
use crate::scenario::{InterruptMapping, VmId};
use crate::utils::hex;

/// Resources assigned to the hypervisor and every VM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Allocation {
    #[serde(default)]
    pub hv: HvAllocation,
    #[serde(default)]
    pub vms: BTreeMap<VmId, VmAllocation>,
}

impl Allocation {
    /// Parses a (possibly partially populated) allocation document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Serializes the allocation document.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn vm(&self, id: VmId) -> Option<&VmAllocation> {
        self.vms.get(&id)
    }

    /// Section of VM `id`, created empty on first access.
    pub fn vm_mut(&mut self, id: VmId) -> &mut VmAllocation {
        self.vms.entry(id).or_default()
    }
}

/// Hypervisor-wide allocation results.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HvAllocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub igd_sbdf: Option<IgdSbdf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clos_masks: Vec<ClosMaskTable>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cpufreq: BTreeMap<u32, CpuFreqLimits>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_hole: Option<PciHole>,
}

impl HvAllocation {
    pub fn clos_mask_table(&self, level: u8, cache_id: u32) -> Option<&ClosMaskTable> {
        self.clos_masks
            .iter()
            .find(|table| table.level == level && table.cache_id == cache_id)
    }
}

/// Native location of the integrated graphics device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgdSbdf {
    Absent,
    Present(PciBdf),
}

impl IgdSbdf {
    /// Raw value used by the hypervisor when no IGD exists.
    pub const INVALID: u32 = 0xffff;

    pub fn raw(&self) -> u32 {
        match self {
            Self::Absent => Self::INVALID,
            Self::Present(bdf) => bdf.raw(),
        }
    }
}

impl Serialize for IgdSbdf {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        hex::serialize(&self.raw(), serializer)
    }
}

impl<'de> Deserialize<'de> for IgdSbdf {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw: u32 = hex::deserialize(deserializer)?;
        Ok(Self::from(raw))
    }
}

impl From<u32> for IgdSbdf {
    fn from(raw: u32) -> Self {
        match raw {
            Self::INVALID => Self::Absent,
            raw => Self::Present(PciBdf::from(raw)),
        }
    }
}

/// Native PCI hole the service VM sees, as `[start, end)` bounds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PciHole {
    #[serde(with = "hex")]
    pub mmio32_start: u64,
    #[serde(with = "hex")]
    pub mmio32_end: u64,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex::option")]
    pub mmio64_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex::option")]
    pub mmio64_end: Option<u64>,
}

/// Capacity bitmasks of one cache instance, indexed by CLOS id.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClosMaskTable {
    pub level: u8,
    #[serde(with = "hex")]
    pub cache_id: u32,
    pub masks: Vec<ClosMask>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClosMask(#[serde(with = "hex")] pub u64);

/// Frequency window of one physical CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CpuFreqLimits {
    pub limit_guaranteed_lvl: u8,
    pub limit_highest_lvl: u8,
    pub limit_lowest_lvl: u8,
    pub limit_nominal_pstate: u32,
    pub limit_highest_pstate: u32,
    pub limit_lowest_pstate: u32,
}

/// Resources assigned to a single VM.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VmAllocation {
    /// Virtual PCI address of every emulated or passthrough device, by device name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub devices: BTreeMap<String, PciBdf>,
    /// Guest-physical BAR values of every emulated or passthrough device, by device name then
    /// BAR index.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vbars: BTreeMap<String, BTreeMap<u8, VirtualBar>>,
    /// CLOS id of every vCPU with a cache policy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vcpu_clos: BTreeMap<u32, u32>,
    /// Physical to virtual INTx lines, by native device address.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pt_intx: BTreeMap<String, Vec<InterruptMapping>>,
    /// IRQ of every legacy vUART, by vUART id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub legacy_vuart_irqs: BTreeMap<u32, u32>,
    /// Host-physical memory regions in ascending address order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hpa_regions: Vec<HpaRegion>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hugepages: Option<Hugepages>,
}

impl VmAllocation {
    /// Records the virtual address of `name` unless it already has one.
    ///
    /// Returns the address the device ends up with.
    pub fn insert_device(&mut self, name: impl Into<String>, bdf: PciBdf) -> PciBdf {
        *self.devices.entry(name.into()).or_insert(bdf)
    }
}

/// A virtual memory BAR.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualBar {
    /// Register value: the base address with the memory BAR type bits.
    #[serde(with = "hex")]
    pub value: u64,
    #[serde(with = "hex")]
    pub size: u64,
}

impl VirtualBar {
    /// Low bits of a memory BAR that hold its type rather than its address.
    pub const TYPE_MASK: u64 = 0xf;

    pub fn address(&self) -> u64 {
        self.value & !Self::TYPE_MASK
    }

    pub fn end(&self) -> u64 {
        self.address().saturating_add(self.size)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HpaRegion {
    #[serde(with = "hex")]
    pub start: u64,
    #[serde(with = "hex")]
    pub size: u64,
}

impl HpaRegion {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

impl fmt::Display for HpaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x})", self.start, self.end())
    }
}

/// Hugepages reserved by the service VM for post-launched VMs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Hugepages {
    /// Number of 1 GiB pages.
    pub gb: u64,
    /// Number of 2 MiB pages.
    pub mb: u64,
}
