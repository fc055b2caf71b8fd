// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use crate::board::{
    Board, Cache, CpuThread, HwpLevels, MemoryKind, MemoryRange, MmioRange, PState, PciBar,
    PciCapability, PciDevice, ProcessorCapabilities, Processors, RdtCapability, RoutingEntry,
    RoutingSource, RoutingTable, SerialPort,
};
use crate::pci::{PCI_CLASS_VGA, PciBdf, PciInterruptPin};
use crate::scenario::{
    CacheAllocation, CachePolicy, CacheType, HvMemory, HypervisorConfig, LoadOrder,
    PassthroughDevice, RdtConfig, Scenario, VmConfig, VmId, VmMemory, Vuart, VuartKind,
};
use crate::utils::{FOUR_GIB, GIB};

/// Id of the real-time pre-launched VM of [`sample_scenario`].
pub const SAMPLE_RTVM: VmId = 0;
/// Id of the service VM of [`sample_scenario`].
pub const SAMPLE_SERVICE_VM: VmId = 1;
/// Id of the post-launched VM of [`sample_scenario`].
pub const SAMPLE_POST_VM: VmId = 2;
/// Network controller passed through to the real-time VM of [`sample_scenario`].
pub const SAMPLE_NIC: &str = "01:00.0";

fn parse_bdf(bdf: &str) -> PciBdf {
    bdf.parse()
        .unwrap_or_else(|err| panic!("invalid test BDF {bdf:?}: {err}"))
}

/// A PCI function at `bdf` with no interrupt, BAR or capability.
pub fn board_device(bdf: &str) -> PciDevice {
    PciDevice {
        bdf: parse_bdf(bdf),
        vendor_id: None,
        device_id: None,
        class_code: 0,
        bars: Vec::new(),
        capabilities: Vec::new(),
        interrupt_pin: None,
        parent_bridge: None,
        irqs: Vec::new(),
    }
}

/// A VM with no request beyond its identity.
pub fn vm_config(id: VmId, name: &str, load_order: LoadOrder) -> VmConfig {
    VmConfig {
        id,
        name: name.to_string(),
        load_order,
        rtvm: false,
        lapic_passthrough: false,
        virtual_cat_support: false,
        cpu_affinity: Vec::new(),
        pci_devs: Vec::new(),
        console_vuart: None,
        communication_vuarts: Vec::new(),
        legacy_vuarts: Vec::new(),
        memory: VmMemory::default(),
        virtio_gpu: 0,
    }
}

fn thread(cpu_id: u32) -> CpuThread {
    CpuThread {
        cpu_id,
        apic_id: cpu_id,
        core_type: Default::default(),
        hwp: Some(HwpLevels {
            guaranteed: 0x20,
            highest: 0x30,
            lowest: 0x05,
        }),
        freqdomain_cpus: None,
    }
}

fn bar(index: u8, base: u64, size: u64, is_64bit: bool) -> PciBar {
    PciBar {
        index,
        base,
        size,
        is_64bit,
    }
}

/// Native PCI hole of [`sample_board`] below 4 GiB.
pub const SAMPLE_MMIO32: MmioRange = MmioRange {
    start: 0xc000_0000,
    size: 0x3000_0000,
};
/// Native PCI hole of [`sample_board`] above 4 GiB.
pub const SAMPLE_MMIO64: MmioRange = MmioRange {
    start: 0x40_0000_0000,
    size: 0x40_0000_0000,
};

/// A four thread board with 16 GiB of RAM, an IGD, a USB controller on bus 0 and a network
/// controller behind a root port.
///
/// The USB controller raises GSI 16, the network controller goes through link `LNKA` to line 17.
/// The network controller has two 32-bit BARs at the bottom of the PCI hole.
pub fn sample_board() -> Board {
    let mut igd = board_device("00:02.0");
    igd.class_code = PCI_CLASS_VGA;
    igd.capabilities = vec![PciCapability::Msi];
    igd.bars = vec![
        bar(0, SAMPLE_MMIO64.start, 0x100_0000, true),
        bar(2, 0xd000_0000, 0x1000_0000, false),
    ];

    let mut usb = board_device("00:14.0");
    usb.interrupt_pin = Some(PciInterruptPin::IntA);
    usb.bars = vec![bar(0, 0xc010_0000, 0x1_0000, true)];

    let mut sata = board_device("00:17.0");
    sata.interrupt_pin = Some(PciInterruptPin::IntA);
    sata.capabilities = vec![PciCapability::Msi];

    let root_port = board_device("00:1c.0");

    let mut nic = board_device(SAMPLE_NIC);
    nic.interrupt_pin = Some(PciInterruptPin::IntA);
    nic.parent_bridge = Some(root_port.bdf);
    nic.bars = vec![
        bar(0, SAMPLE_MMIO32.start, 0x2_0000, false),
        bar(3, 0xc002_0000, 0x4000, false),
    ];

    Board {
        name: "sample-board".to_string(),
        pci_devices: vec![igd, usb, sata, root_port, nic],
        interrupt_routing: vec![RoutingTable {
            bus: 0,
            entries: vec![
                RoutingEntry {
                    device: 0x14,
                    pin: PciInterruptPin::IntA,
                    source: RoutingSource::Gsi(16),
                },
                RoutingEntry {
                    device: 0x1c,
                    pin: PciInterruptPin::IntA,
                    source: RoutingSource::Link("LNKA".to_string()),
                },
            ],
        }],
        interrupt_links: BTreeMap::from([("LNKA".to_string(), vec![17])]),
        caches: vec![Cache {
            level: 3,
            id: 0,
            size: 0x80_0000,
            processors: vec![0, 1, 2, 3],
            rdt: Some(RdtCapability {
                capacity_mask_length: 11,
                clos_number: 4,
                cdp: false,
            }),
        }],
        processors: Processors {
            capabilities: ProcessorCapabilities {
                hwp: true,
                turbo: true,
                eist: true,
                hybrid: false,
            },
            max_none_turbo_ratio: Some(0x20),
            p_states: vec![
                PState {
                    core_frequency: 3601,
                    control: 0x2400,
                },
                PState {
                    core_frequency: 3200,
                    control: 0x2000,
                },
                PState {
                    core_frequency: 1600,
                    control: 0x1000,
                },
            ],
            threads: (0..4).map(thread).collect(),
        },
        memory: vec![
            MemoryRange {
                start: 0,
                size: 2 * GIB,
                kind: MemoryKind::Usable,
            },
            MemoryRange {
                start: 2 * GIB,
                size: 2 * GIB,
                kind: MemoryKind::Reserved,
            },
            MemoryRange {
                start: FOUR_GIB,
                size: 12 * GIB,
                kind: MemoryKind::Usable,
            },
        ],
        free_irqs: vec![3, 4, 5, 6, 7, 10, 11, 12],
        serial_ports: vec![SerialPort {
            name: "ttyS0".to_string(),
            port: 0x3f8,
            irq: 4,
        }],
        pci_windows: vec![SAMPLE_MMIO32, SAMPLE_MMIO64],
    }
}

/// A real-time pre-launched VM, a service VM and a post-launched VM on [`sample_board`].
///
/// The real-time VM runs on CPUs 2 and 3, owns the network controller and 2 GiB of memory. The
/// post-launched VM asks for 2 GiB as well.
pub fn sample_scenario() -> Scenario {
    let mut rtvm = vm_config(SAMPLE_RTVM, "RTVM", LoadOrder::PreLaunched);
    rtvm.rtvm = true;
    rtvm.cpu_affinity = vec![2, 3];
    rtvm.pci_devs = vec![PassthroughDevice {
        bdf: parse_bdf(SAMPLE_NIC),
        interrupts: Vec::new(),
        igd: false,
    }];
    rtvm.console_vuart = Some(Vuart {
        id: 0,
        kind: VuartKind::Pci,
        port: None,
        target_vm: None,
    });
    rtvm.memory.size_mib = Some(2048);

    let mut service = vm_config(SAMPLE_SERVICE_VM, "SERVICE_VM", LoadOrder::Service);
    service.cpu_affinity = vec![0, 1];
    service.console_vuart = Some(Vuart {
        id: 0,
        kind: VuartKind::Legacy,
        port: Some(0x3f8),
        target_vm: None,
    });
    service.communication_vuarts = vec![Vuart {
        id: 1,
        kind: VuartKind::Pci,
        port: None,
        target_vm: Some(SAMPLE_RTVM),
    }];

    let mut post = vm_config(SAMPLE_POST_VM, "POST_STD_VM", LoadOrder::PostLaunched);
    post.cpu_affinity = vec![0, 1];
    post.memory.size_mib = Some(2048);

    let policy = |vm: &str, vcpu, mask| CachePolicy {
        vm: vm.to_string(),
        vcpu,
        cache_type: CacheType::Unified,
        clos_mask: Some(mask),
    };

    Scenario {
        hv: HypervisorConfig {
            memory: HvMemory {
                start: GIB,
                size: 0x400_0000,
            },
            debug_console: Some("ttyS0".to_string()),
            console_bdf: None,
            rdt: RdtConfig {
                enabled: true,
                cdp_enabled: false,
                vcat_enabled: false,
                cache_allocations: vec![CacheAllocation {
                    cache_id: 0,
                    level: 3,
                    policies: vec![
                        policy("RTVM", 0, 0x00f),
                        policy("RTVM", 1, 0x00f),
                        policy("SERVICE_VM", 0, 0x7f0),
                        policy("SERVICE_VM", 1, 0x7f0),
                    ],
                }],
            },
            ivshmem_regions: Vec::new(),
        },
        vms: vec![rtvm, service, post],
    }
}
