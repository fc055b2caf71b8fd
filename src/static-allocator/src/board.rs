// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Read-only description of the physical platform.
//!
//! The board document is produced by an external inspection tool; this module only models the
//! facts the allocators consume.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::pci::{PCI_CLASS_VGA, PciBdf, PciInterruptPin};
use crate::utils::hex;

/// Hardware capabilities and topology of the target platform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Board {
    /// Board name, used to select board-specific quirks.
    #[serde(default)]
    pub name: String,
    /// All PCI functions found on the platform.
    #[serde(default)]
    pub pci_devices: Vec<PciDevice>,
    /// ACPI `_PRT` tables, one per bus that has one.
    #[serde(default)]
    pub interrupt_routing: Vec<RoutingTable>,
    /// Interrupt lines deliverable by each ACPI interrupt link device.
    #[serde(default)]
    pub interrupt_links: BTreeMap<String, Vec<u32>>,
    /// Cache instances.
    #[serde(default)]
    pub caches: Vec<Cache>,
    /// CPU topology and frequency capability.
    #[serde(default)]
    pub processors: Processors,
    /// Physical memory map.
    #[serde(default)]
    pub memory: Vec<MemoryRange>,
    /// Legacy IRQ lines not used by any native device.
    #[serde(default)]
    pub free_irqs: Vec<u32>,
    /// Native legacy (port I/O) serial ports.
    #[serde(default)]
    pub serial_ports: Vec<SerialPort>,
    /// Memory windows the host bridge decodes for PCI devices.
    #[serde(default)]
    pub pci_windows: Vec<MmioRange>,
}

impl Board {
    /// Parses a board document.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn pci_device(&self, bdf: PciBdf) -> Option<&PciDevice> {
        self.pci_devices.iter().find(|dev| dev.bdf == bdf)
    }

    /// The integrated graphics device, if the platform has one.
    pub fn igd(&self) -> Option<&PciDevice> {
        self.pci_devices.iter().find(|dev| dev.is_igd())
    }

    /// The routing table describing interrupt pins of devices on `bus`.
    pub fn routing_table(&self, bus: u8) -> Option<&RoutingTable> {
        self.interrupt_routing.iter().find(|table| table.bus == bus)
    }

    pub fn cache(&self, level: u8, id: u32) -> Option<&Cache> {
        self.caches
            .iter()
            .find(|cache| cache.level == level && cache.id == id)
    }

    pub fn thread(&self, cpu_id: u32) -> Option<&CpuThread> {
        self.processors
            .threads
            .iter()
            .find(|thread| thread.cpu_id == cpu_id)
    }
}

/// A single PCI function.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PciDevice {
    pub bdf: PciBdf,
    #[serde(default, with = "hex::option")]
    pub vendor_id: Option<u16>,
    #[serde(default, with = "hex::option")]
    pub device_id: Option<u16>,
    #[serde(with = "hex")]
    pub class_code: u32,
    /// Memory BARs as programmed by the firmware.
    #[serde(default)]
    pub bars: Vec<PciBar>,
    #[serde(default)]
    pub capabilities: Vec<PciCapability>,
    /// Pin reported by the interrupt pin register, if any.
    #[serde(default)]
    pub interrupt_pin: Option<PciInterruptPin>,
    /// Bridge on whose secondary bus this device sits.
    #[serde(default)]
    pub parent_bridge: Option<PciBdf>,
    /// Interrupt lines listed explicitly for this device in ACPI.
    #[serde(default)]
    pub irqs: Vec<u32>,
}

impl PciDevice {
    /// Whether the device signals interrupts through MSI or MSI-X.
    pub fn has_msi(&self) -> bool {
        self.capabilities
            .iter()
            .any(|cap| matches!(cap, PciCapability::Msi | PciCapability::Msix))
    }

    pub fn is_igd(&self) -> bool {
        self.class_code == PCI_CLASS_VGA && self.bdf.is_igd_slot()
    }
}

/// Memory base address register of a PCI function.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PciBar {
    pub index: u8,
    #[serde(with = "hex")]
    pub base: u64,
    #[serde(with = "hex")]
    pub size: u64,
    /// A 64-bit BAR also takes the register at `index + 1`.
    #[serde(default)]
    pub is_64bit: bool,
}

/// PCI capability records relevant to resource allocation.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PciCapability {
    Msi,
    Msix,
    Pcie,
    #[serde(other)]
    Other,
}

/// Interrupt routing of one PCI bus, as described by ACPI.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingTable {
    #[serde(with = "hex")]
    pub bus: u8,
    pub entries: Vec<RoutingEntry>,
}

impl RoutingTable {
    pub fn lookup(&self, device: u8, pin: PciInterruptPin) -> Option<&RoutingSource> {
        self.entries
            .iter()
            .find(|entry| entry.device == device && entry.pin == pin)
            .map(|entry| &entry.source)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingEntry {
    #[serde(with = "hex")]
    pub device: u8,
    pub pin: PciInterruptPin,
    pub source: RoutingSource,
}

/// Where a routed interrupt pin ends up.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingSource {
    /// Hard-wired to a global system interrupt.
    Gsi(u32),
    /// Routed through an ACPI interrupt link device.
    Link(String),
}

/// A cache instance shared by a set of logical processors.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Cache {
    pub level: u8,
    #[serde(with = "hex")]
    pub id: u32,
    #[serde(default, with = "hex")]
    pub size: u64,
    /// APIC ids of the processors sharing this cache.
    #[serde(default)]
    pub processors: Vec<u32>,
    #[serde(default)]
    pub rdt: Option<RdtCapability>,
}

/// Cache allocation technology support of a cache instance.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RdtCapability {
    pub capacity_mask_length: u32,
    pub clos_number: u32,
    #[serde(default)]
    pub cdp: bool,
}

impl RdtCapability {
    /// A mask selecting the whole cache, `None` when the mask length is not reported.
    pub fn full_mask(&self) -> Option<u64> {
        match self.capacity_mask_length {
            0 => None,
            len if len >= 64 => Some(u64::MAX),
            len => Some((1u64 << len) - 1),
        }
    }
}

/// Processor topology and performance management capability.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Processors {
    #[serde(default)]
    pub capabilities: ProcessorCapabilities,
    /// Ratio of the maximum non-turbo frequency to the bus clock.
    #[serde(default)]
    pub max_none_turbo_ratio: Option<u32>,
    /// ACPI `_PSS` performance states, fastest first.
    #[serde(default)]
    pub p_states: Vec<PState>,
    #[serde(default)]
    pub threads: Vec<CpuThread>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessorCapabilities {
    /// Hardware-controlled performance states.
    #[serde(default)]
    pub hwp: bool,
    /// Opportunistic frequency boost.
    #[serde(default)]
    pub turbo: bool,
    /// Enhanced SpeedStep (ACPI P-states).
    #[serde(default)]
    pub eist: bool,
    /// Heterogeneous core types.
    #[serde(default)]
    pub hybrid: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PState {
    /// Core frequency in MHz.
    pub core_frequency: u32,
    /// Value written to the performance control register to enter this state.
    #[serde(with = "hex")]
    pub control: u64,
}

impl PState {
    /// The bus ratio encoded in the control value.
    pub fn ratio(&self) -> u32 {
        ((self.control >> 8) & 0xff) as u32
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum CoreType {
    #[default]
    Core,
    Atom,
}

/// A logical processor.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct CpuThread {
    pub cpu_id: u32,
    #[serde(with = "hex")]
    pub apic_id: u32,
    #[serde(default)]
    pub core_type: CoreType,
    #[serde(default)]
    pub hwp: Option<HwpLevels>,
    /// CPUs in the same ACPI `_PSD` frequency coordination domain.
    #[serde(default)]
    pub freqdomain_cpus: Option<Vec<u32>>,
}

/// Performance levels from `IA32_HWP_CAPABILITIES`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HwpLevels {
    pub guaranteed: u8,
    pub highest: u8,
    pub lowest: u8,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryKind {
    #[default]
    Usable,
    Reserved,
}

/// A physical address range of the memory map.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryRange {
    #[serde(with = "hex")]
    pub start: u64,
    #[serde(with = "hex")]
    pub size: u64,
    #[serde(default)]
    pub kind: MemoryKind,
}

/// A physical address window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MmioRange {
    #[serde(with = "hex")]
    pub start: u64,
    #[serde(with = "hex")]
    pub size: u64,
}

impl MmioRange {
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.size)
    }
}

/// A native legacy serial port.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SerialPort {
    /// Device name, e.g. `ttyS0`.
    pub name: String,
    #[serde(with = "hex")]
    pub port: u16,
    pub irq: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &str = r#"{
        "name": "sample",
        "pci_devices": [
            {"bdf": "00:02.0", "vendor_id": "0x8086", "class_code": "0x030000",
             "capabilities": ["msi"],
             "bars": [{"index": 0, "base": "0x6000000000", "size": "0x1000000", "is_64bit": true},
                      {"index": 2, "base": "0xc0000000", "size": "0x10000000"}]},
            {"bdf": "00:1f.3", "class_code": "0x040300", "interrupt_pin": "INTA#",
             "capabilities": ["pcie", "vendor_specific"]}
        ],
        "interrupt_routing": [
            {"bus": "0x0", "entries": [
                {"device": "0x1f", "pin": "INTA#", "source": {"gsi": 16}},
                {"device": "0x1f", "pin": "INTB#", "source": {"link": "LNKB"}}
            ]}
        ],
        "interrupt_links": {"LNKB": [10, 11]},
        "caches": [
            {"level": 2, "id": "0x8", "processors": [0, 1],
             "rdt": {"capacity_mask_length": 16, "clos_number": 8}}
        ],
        "processors": {
            "capabilities": {"hwp": true, "eist": true},
            "p_states": [{"core_frequency": 2001, "control": "0x1d00"}],
            "threads": [{"cpu_id": 0, "apic_id": "0x0", "core_type": "Atom"}]
        },
        "memory": [{"start": 0, "size": "0x40000000"}],
        "free_irqs": [5, 6, 7],
        "serial_ports": [{"name": "ttyS0", "port": "0x3f8", "irq": 4}],
        "pci_windows": [{"start": "0x80000000", "size": "0x7f000000"}]
    }"#;

    #[test]
    fn test_parse_board() {
        let board = Board::from_json(BOARD).unwrap();
        assert_eq!(board.name, "sample");

        let igd = board.igd().unwrap();
        assert!(igd.has_msi());
        assert_eq!(igd.bdf, PciBdf::new(0, 0, 2, 0));
        assert_eq!(igd.vendor_id, Some(0x8086));
        assert_eq!(igd.device_id, None);
        assert!(igd.bars[0].is_64bit);
        assert!(!igd.bars[1].is_64bit);

        let audio = board.pci_device(PciBdf::new(0, 0, 0x1f, 3)).unwrap();
        assert!(!audio.has_msi());
        assert!(!audio.is_igd());
        assert_eq!(audio.capabilities[1], PciCapability::Other);

        let table = board.routing_table(0).unwrap();
        assert_eq!(
            table.lookup(0x1f, PciInterruptPin::IntA),
            Some(&RoutingSource::Gsi(16))
        );
        assert_eq!(
            table.lookup(0x1f, PciInterruptPin::IntB),
            Some(&RoutingSource::Link("LNKB".to_string()))
        );
        assert_eq!(table.lookup(0x1f, PciInterruptPin::IntC), None);

        let cache = board.cache(2, 8).unwrap();
        assert_eq!(cache.rdt.as_ref().unwrap().full_mask(), Some(0xffff));
        assert!(board.cache(3, 8).is_none());

        assert_eq!(board.processors.p_states[0].ratio(), 0x1d);
        assert_eq!(board.thread(0).unwrap().core_type, CoreType::Atom);
        assert_eq!(board.memory[0].kind, MemoryKind::Usable);
        assert_eq!(board.serial_ports[0].port, 0x3f8);
        assert_eq!(board.pci_windows[0].end(), 0xff00_0000);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        Board::from_json(r#"{"name": "x", "cpus": []}"#).unwrap_err();
    }

    #[test]
    fn test_full_mask() {
        let cap = |len| RdtCapability {
            capacity_mask_length: len,
            clos_number: 4,
            cdp: false,
        };
        assert_eq!(cap(0).full_mask(), None);
        assert_eq!(cap(11).full_mask(), Some(0x7ff));
        assert_eq!(cap(64).full_mask(), Some(u64::MAX));
    }
}
