// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Read-only description of the desired VM deployment.

use serde::{Deserialize, Serialize};

use crate::pci::PciBdf;
use crate::utils::hex;

/// Identifier of a VM, unique within a scenario.
pub type VmId = u16;

/// A multi-VM deployment on one board.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub hv: HypervisorConfig,
    /// VMs in document order.
    #[serde(default)]
    pub vms: Vec<VmConfig>,
}

impl Scenario {
    /// Parses a scenario document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn vm(&self, id: VmId) -> Option<&VmConfig> {
        self.vms.iter().find(|vm| vm.id == id)
    }

    pub fn vm_by_name(&self, name: &str) -> Option<&VmConfig> {
        self.vms.iter().find(|vm| vm.name == name)
    }

    pub fn service_vm(&self) -> Option<&VmConfig> {
        self.vms.iter().find(|vm| vm.load_order == LoadOrder::Service)
    }

    pub fn pre_launched_vms(&self) -> impl Iterator<Item = &VmConfig> {
        self.vms_with(LoadOrder::PreLaunched)
    }

    pub fn post_launched_vms(&self) -> impl Iterator<Item = &VmConfig> {
        self.vms_with(LoadOrder::PostLaunched)
    }

    fn vms_with(&self, load_order: LoadOrder) -> impl Iterator<Item = &VmConfig> {
        self.vms
            .iter()
            .filter(move |vm| vm.load_order == load_order)
    }
}

/// Hypervisor-wide settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HypervisorConfig {
    /// Physical memory reserved for the hypervisor image and its data.
    #[serde(default)]
    pub memory: HvMemory,
    /// Name of the native serial port used as the hypervisor console, e.g. `ttyS0`.
    #[serde(default)]
    pub debug_console: Option<String>,
    /// PCI serial controller owned by the hypervisor console.
    #[serde(default)]
    pub console_bdf: Option<PciBdf>,
    #[serde(default)]
    pub rdt: RdtConfig,
    #[serde(default)]
    pub ivshmem_regions: Vec<IvshmemRegion>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HvMemory {
    #[serde(with = "hex")]
    pub start: u64,
    #[serde(with = "hex")]
    pub size: u64,
}

impl HvMemory {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

/// Cache allocation requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RdtConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Code and data prioritization.
    #[serde(default)]
    pub cdp_enabled: bool,
    /// Virtual CAT exposed to VMs that opt in with `virtual_cat_support`.
    #[serde(default)]
    pub vcat_enabled: bool,
    #[serde(default)]
    pub cache_allocations: Vec<CacheAllocation>,
}

/// Policies requested for one cache instance.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CacheAllocation {
    #[serde(with = "hex")]
    pub cache_id: u32,
    pub level: u8,
    #[serde(default)]
    pub policies: Vec<CachePolicy>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CachePolicy {
    /// Name of the owning VM.
    pub vm: String,
    pub vcpu: u32,
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Capacity bitmask; absent means any mask is acceptable.
    #[serde(default, with = "hex::option")]
    pub clos_mask: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum CacheType {
    Code,
    Data,
    Unified,
}

/// An inter-VM shared memory region.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IvshmemRegion {
    pub name: String,
    pub size_mib: u64,
    pub peers: Vec<IvshmemPeer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct IvshmemPeer {
    pub vm_id: VmId,
    /// Virtual address of the shared memory device inside the peer.
    #[serde(default)]
    pub vbdf: Option<PciBdf>,
}

/// Launch category of a VM, in descending privilege order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum LoadOrder {
    #[serde(rename = "PRE_LAUNCHED_VM")]
    PreLaunched,
    #[serde(rename = "SERVICE_VM")]
    Service,
    #[serde(rename = "POST_LAUNCHED_VM")]
    PostLaunched,
}

/// Requests of a single VM.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VmConfig {
    pub id: VmId,
    pub name: String,
    pub load_order: LoadOrder,
    /// Real-time VM with latency guarantees.
    #[serde(default)]
    pub rtvm: bool,
    #[serde(default)]
    pub lapic_passthrough: bool,
    #[serde(default)]
    pub virtual_cat_support: bool,
    /// Physical CPUs the vCPUs are pinned to, in vCPU order.
    #[serde(default)]
    pub cpu_affinity: Vec<u32>,
    #[serde(default)]
    pub pci_devs: Vec<PassthroughDevice>,
    #[serde(default)]
    pub console_vuart: Option<Vuart>,
    #[serde(default)]
    pub communication_vuarts: Vec<Vuart>,
    #[serde(default)]
    pub legacy_vuarts: Vec<LegacyVuart>,
    #[serde(default)]
    pub memory: VmMemory,
    /// Number of virtio GPU devices given to a post-launched VM.
    #[serde(default)]
    pub virtio_gpu: u32,
}

impl VmConfig {
    pub fn is_pre_launched(&self) -> bool {
        self.load_order == LoadOrder::PreLaunched
    }

    pub fn is_service(&self) -> bool {
        self.load_order == LoadOrder::Service
    }

    pub fn is_post_launched(&self) -> bool {
        self.load_order == LoadOrder::PostLaunched
    }
}

/// A physical PCI function assigned to a VM.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PassthroughDevice {
    pub bdf: PciBdf,
    /// Explicit physical to virtual INTx remapping.
    #[serde(default)]
    pub interrupts: Vec<InterruptMapping>,
    /// Treat the device as the integrated graphics device.
    #[serde(default)]
    pub igd: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InterruptMapping {
    pub physical: u32,
    pub virtual_line: u32,
}

/// Emulation backing a console or communication vUART.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VuartKind {
    #[default]
    Pci,
    Legacy,
    None,
}

/// A console or communication virtual UART.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Vuart {
    pub id: u32,
    #[serde(default)]
    pub kind: VuartKind,
    /// I/O port base of a legacy vUART.
    #[serde(default, with = "hex::option")]
    pub port: Option<u16>,
    /// VM on the other end of a communication vUART.
    #[serde(default)]
    pub target_vm: Option<VmId>,
}

impl Vuart {
    /// Whether the vUART occupies a virtual PCI slot.
    pub fn is_pci(&self) -> bool {
        self.kind == VuartKind::Pci
    }
}

/// A port I/O virtual UART.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LegacyVuart {
    pub id: u32,
    /// I/O port base; absent when the vUART is disabled.
    #[serde(default, with = "hex::option")]
    pub port: Option<u16>,
}

/// Memory requested by a VM.
///
/// A size placed anywhere above 4 GiB, explicit host-physical regions, or both.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct VmMemory {
    #[serde(default)]
    pub size_mib: Option<u64>,
    #[serde(default)]
    pub hpa_regions: Vec<HpaRequest>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HpaRequest {
    #[serde(with = "hex")]
    pub start: u64,
    pub size_mib: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"{
        "hv": {
            "memory": {"start": "0x1000000", "size": "0x400000"},
            "debug_console": "ttyS0",
            "rdt": {
                "enabled": true,
                "cache_allocations": [
                    {"cache_id": "0x0", "level": 3, "policies": [
                        {"vm": "RTVM", "vcpu": 0, "type": "Unified", "clos_mask": "0xf"},
                        {"vm": "SOS", "vcpu": 0, "type": "Unified"}
                    ]}
                ]
            },
            "ivshmem_regions": [
                {"name": "shm0", "size_mib": 2, "peers": [{"vm_id": 0, "vbdf": "00:05.0"}, {"vm_id": 1}]}
            ]
        },
        "vms": [
            {"id": 0, "name": "RTVM", "load_order": "PRE_LAUNCHED_VM", "rtvm": true,
             "cpu_affinity": [2, 3],
             "pci_devs": [{"bdf": "00:14.0", "interrupts": [{"physical": 16, "virtual_line": 5}]}],
             "legacy_vuarts": [{"id": 0, "port": "0x3f8"}, {"id": 1}],
             "memory": {"hpa_regions": [{"start": "0x100000000", "size_mib": 1024}]}},
            {"id": 1, "name": "SOS", "load_order": "SERVICE_VM", "console_vuart": {"id": 0},
             "communication_vuarts": [{"id": 1, "kind": "legacy", "port": "0x2f8", "target_vm": 0}]},
            {"id": 2, "name": "UOS", "load_order": "POST_LAUNCHED_VM",
             "memory": {"size_mib": 2048}, "virtio_gpu": 1}
        ]
    }"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_json(SCENARIO).unwrap();
        assert_eq!(scenario.hv.memory.end(), 0x140_0000);
        assert_eq!(scenario.hv.rdt.cache_allocations[0].policies[1].clos_mask, None);
        assert_eq!(
            scenario.hv.ivshmem_regions[0].peers[0].vbdf,
            Some(PciBdf::new(0, 0, 5, 0))
        );

        let rtvm = scenario.vm(0).unwrap();
        assert!(rtvm.is_pre_launched() && rtvm.rtvm);
        assert_eq!(rtvm.pci_devs[0].interrupts[0].virtual_line, 5);
        assert_eq!(rtvm.legacy_vuarts[0].port, Some(0x3f8));
        assert_eq!(rtvm.legacy_vuarts[1].port, None);
        assert_eq!(rtvm.memory.hpa_regions[0].start, 0x1_0000_0000);

        let service_vm = scenario.service_vm().unwrap();
        assert_eq!(service_vm.name, "SOS");
        assert!(service_vm.console_vuart.as_ref().unwrap().is_pci());
        assert_eq!(service_vm.communication_vuarts[0].kind, VuartKind::Legacy);
        assert_eq!(service_vm.communication_vuarts[0].port, Some(0x2f8));
        assert_eq!(scenario.vm_by_name("UOS").unwrap().id, 2);
        assert_eq!(scenario.pre_launched_vms().count(), 1);
        assert_eq!(scenario.post_launched_vms().count(), 1);
        assert!(scenario.vm(7).is_none());
    }

    #[test]
    fn test_invalid_load_order() {
        let err = Scenario::from_json(r#"{"vms": [{"id": 0, "name": "a", "load_order": "X"}]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("unknown variant"), "{err}");
    }
}
