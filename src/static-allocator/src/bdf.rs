// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Virtual PCI address allocation.
//!
//! Every VM sees a single virtual bus 0. Slots 0, 1, 2 and 31 have fixed owners; emulated
//! and passthrough devices draw the lowest free slot from 3..=29.

use std::collections::BTreeSet;

use vm_allocator::IdAllocator;

use crate::allocation::{Allocation, IgdSbdf};
use crate::board::Board;
use crate::pci::{IGD_DEVICE, PciBdf};
use crate::scenario::{Scenario, VmConfig, VmId};

/// Slot of the virtual host bridge.
pub const HOST_BRIDGE_DEVICE: u8 = 0x0;
/// Slot of the virtual LPC bridge.
pub const LPC_BRIDGE_DEVICE: u8 = 0x1;
/// Slot of the LPC companion function the IGD driver expects.
pub const IGD_LPC_DEVICE: u8 = 0x1f;
/// First slot handed out to emulated and passthrough devices.
pub const FIRST_FREE_DEVICE: u8 = 0x3;
/// Last slot handed out to emulated and passthrough devices.
pub const LAST_FREE_DEVICE: u8 = 0x1d;

/// Name prefix of PCI vUART devices.
pub const VUART_PREFIX: &str = "VUART";
/// Name prefix of inter-VM shared memory devices.
pub const IVSHMEM_PREFIX: &str = "IVSHMEM";
/// Name of the LPC companion of a passed-through IGD.
pub const IGD_LPC_NAME: &str = "IGD_LPC";

/// Slots no scenario device may ask for: the bridges, the IGD and its LPC companion.
const RESERVED_DEVICES: [u8; 4] = [
    HOST_BRIDGE_DEVICE,
    LPC_BRIDGE_DEVICE,
    IGD_DEVICE,
    IGD_LPC_DEVICE,
];

/// Native devices that are always passed through at their native address.
const HARDCODED_BDFS: [PciBdf; 1] = [PciBdf::new(0, 0, 0x0e, 0)];

/// Slots some boards need kept free in the service VM.
const BOARD_QUIRKS: [(&str, PciBdf); 1] = [("tgl-rvp", PciBdf::new(0, 0, 0x1, 0))];

/// Errors associated with virtual PCI address allocation.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum BdfError {
    /// VM {vm_id}: no free virtual PCI slot for {device}, slots in use: {used}
    Exhausted {
        vm_id: VmId,
        device: String,
        used: String,
    },
    /// VM {vm_id}: virtual PCI address {bdf} requested by {device} is already in use
    Duplicated {
        vm_id: VmId,
        device: String,
        bdf: PciBdf,
    },
    /// VM {vm_id}: virtual PCI address {bdf} requested by {device} belongs to a fixed device
    Reserved {
        vm_id: VmId,
        device: String,
        bdf: PciBdf,
    },
    /// Cannot create the virtual PCI slot pool: {0}
    Allocator(vm_allocator::Error),
}

/// Options of a single slot request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocOptions {
    /// The device is the integrated graphics device and goes to its fixed slot.
    pub igd: bool,
}

/// The virtual PCI bus of one VM.
#[derive(Debug)]
pub struct VirtualPciBus {
    vm_id: VmId,
    used: BTreeSet<u8>,
    free: IdAllocator,
}

impl VirtualPciBus {
    /// Creates the bus of VM `vm_id` with the slots of `used` and both bridges already taken.
    pub fn new(vm_id: VmId, used: impl IntoIterator<Item = PciBdf>) -> Result<Self, BdfError> {
        let free = IdAllocator::new(u32::from(FIRST_FREE_DEVICE), u32::from(LAST_FREE_DEVICE))
            .map_err(BdfError::Allocator)?;
        let mut bus = VirtualPciBus {
            vm_id,
            used: used.into_iter().map(|bdf| bdf.device()).collect(),
            free,
        };
        bus.used.insert(HOST_BRIDGE_DEVICE);
        bus.used.insert(LPC_BRIDGE_DEVICE);
        Ok(bus)
    }

    /// Gives `device` the address the scenario asked for.
    pub fn request(&mut self, device: &str, bdf: PciBdf) -> Result<PciBdf, BdfError> {
        if RESERVED_DEVICES.contains(&bdf.device()) {
            return Err(BdfError::Reserved {
                vm_id: self.vm_id,
                device: device.to_string(),
                bdf,
            });
        }
        self.claim(device, bdf)
    }

    /// Takes the slot of `bdf` for `device`, which must still be free.
    fn claim(&mut self, device: &str, bdf: PciBdf) -> Result<PciBdf, BdfError> {
        if !self.used.insert(bdf.device()) {
            return Err(BdfError::Duplicated {
                vm_id: self.vm_id,
                device: device.to_string(),
                bdf,
            });
        }
        Ok(bdf)
    }

    pub fn is_used(&self, device: u8) -> bool {
        self.used.contains(&device)
    }

    /// Picks the virtual address of `device`.
    pub fn allocate(&mut self, device: &str, options: AllocOptions) -> Result<PciBdf, BdfError> {
        if options.igd {
            return self.claim(device, PciBdf::new(0, 0, IGD_DEVICE, 0));
        }

        loop {
            match self.free.allocate_id() {
                // Slots skipped here are already taken, so they stay consumed in the pool.
                Ok(id) => {
                    let slot = u8::try_from(id).map_err(|_| self.exhausted(device))?;
                    if self.used.insert(slot) {
                        return Ok(PciBdf::new(0, 0, slot, 0));
                    }
                }
                Err(vm_allocator::Error::ResourceNotAvailable) => {
                    return Err(self.exhausted(device));
                }
                Err(err) => return Err(BdfError::Allocator(err)),
            }
        }
    }

    fn exhausted(&self, device: &str) -> BdfError {
        let used = self
            .used
            .iter()
            .map(|slot| format!("{slot:#04x}"))
            .collect::<Vec<_>>()
            .join(", ");
        BdfError::Exhausted {
            vm_id: self.vm_id,
            device: device.to_string(),
            used,
        }
    }
}

/// Native devices on bus 0 that stay visible to the service VM.
fn service_vm_used(board: &Board, scenario: &Scenario) -> Vec<PciBdf> {
    let passthrough: BTreeSet<PciBdf> = scenario
        .pre_launched_vms()
        .flat_map(|vm| vm.pci_devs.iter().map(|dev| dev.bdf))
        .collect();

    let mut used: Vec<PciBdf> = board
        .pci_devices
        .iter()
        .map(|dev| dev.bdf)
        .filter(|bdf| bdf.segment() == 0 && bdf.bus() == 0 && !passthrough.contains(bdf))
        .collect();
    used.extend(
        BOARD_QUIRKS
            .iter()
            .filter(|(name, _)| *name == board.name)
            .map(|(_, bdf)| *bdf),
    );
    used
}

/// Assigns virtual addresses to every device of `vm`.
pub fn allocate_vm(
    board: &Board,
    scenario: &Scenario,
    vm: &VmConfig,
    allocation: &mut Allocation,
) -> Result<(), BdfError> {
    let mut used = if vm.is_service() {
        service_vm_used(board, scenario)
    } else {
        Vec::new()
    };
    // Addresses recorded by an earlier run are kept.
    if let Some(existing) = allocation.vm(vm.id) {
        used.extend(existing.devices.values().copied());
    }
    let mut bus = VirtualPciBus::new(vm.id, used)?;
    let vm_alloc = allocation.vm_mut(vm.id);

    let vuarts = vm
        .console_vuart
        .iter()
        .chain(vm.communication_vuarts.iter())
        .filter(|vuart| vuart.is_pci());
    for vuart in vuarts {
        let name = format!("{VUART_PREFIX}_{}", vuart.id);
        if vm_alloc.devices.contains_key(&name) {
            continue;
        }
        let bdf = bus.allocate(&name, AllocOptions::default())?;
        log::debug!("VM {}: {name} at {bdf}", vm.id);
        vm_alloc.insert_device(name, bdf);
    }

    for (index, region) in scenario.hv.ivshmem_regions.iter().enumerate() {
        let Some(peer) = region.peers.iter().find(|peer| peer.vm_id == vm.id) else {
            continue;
        };
        let name = format!("{IVSHMEM_PREFIX}_{index}");
        if vm_alloc.devices.contains_key(&name) {
            continue;
        }
        let bdf = match peer.vbdf {
            Some(vbdf) => bus.request(&name, vbdf)?,
            None => bus.allocate(&name, AllocOptions::default())?,
        };
        log::debug!("VM {}: {name} ({}) at {bdf}", vm.id, region.name);
        vm_alloc.insert_device(name, bdf);
    }

    let (hardcoded, others): (Vec<_>, Vec<_>) = vm
        .pci_devs
        .iter()
        .partition(|dev| HARDCODED_BDFS.contains(&dev.bdf));
    for dev in hardcoded {
        let name = dev.bdf.to_string();
        if vm_alloc.devices.contains_key(&name) {
            continue;
        }
        bus.request(&name, dev.bdf)?;
        log::debug!("VM {}: {name} kept at its native address", vm.id);
        vm_alloc.insert_device(name, dev.bdf);
    }
    for dev in others {
        let name = dev.bdf.to_string();
        if vm_alloc.devices.contains_key(&name) {
            continue;
        }
        let igd = dev.igd || board.pci_device(dev.bdf).is_some_and(|native| native.is_igd());
        let bdf = bus.allocate(&name, AllocOptions { igd })?;
        log::debug!("VM {}: {name} at {bdf}", vm.id);
        vm_alloc.insert_device(name, bdf);
        if igd {
            let lpc = bus.claim(IGD_LPC_NAME, PciBdf::new(0, 0, IGD_LPC_DEVICE, 0))?;
            vm_alloc.insert_device(IGD_LPC_NAME, lpc);
        }
    }

    Ok(())
}

/// Assigns virtual addresses to the devices of every VM and records the native IGD address.
pub fn allocate(
    board: &Board,
    scenario: &Scenario,
    allocation: &mut Allocation,
) -> Result<(), BdfError> {
    for vm in &scenario.vms {
        allocate_vm(board, scenario, vm, allocation)?;
    }
    allocation.hv.igd_sbdf = Some(
        board
            .igd()
            .map_or(IgdSbdf::Absent, |igd| IgdSbdf::Present(igd.bdf)),
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::PciDevice;
    use crate::scenario::{
        IvshmemPeer, IvshmemRegion, LoadOrder, PassthroughDevice, Vuart, VuartKind,
    };
    use crate::test_utils::{board_device, vm_config};

    fn bdf(s: &str) -> PciBdf {
        s.parse().unwrap()
    }

    fn passthrough(s: &str) -> PassthroughDevice {
        PassthroughDevice {
            bdf: bdf(s),
            interrupts: vec![],
            igd: false,
        }
    }

    fn pci_vuart(id: u32) -> Vuart {
        Vuart {
            id,
            kind: VuartKind::Pci,
            port: None,
            target_vm: None,
        }
    }

    #[test]
    fn test_lowest_free_slot() {
        let mut bus = VirtualPciBus::new(0, [bdf("00:03.0"), bdf("00:05.0")]).unwrap();
        assert_eq!(
            bus.allocate("a", AllocOptions::default()).unwrap(),
            bdf("00:04.0")
        );
        assert_eq!(
            bus.allocate("b", AllocOptions::default()).unwrap(),
            bdf("00:06.0")
        );
        assert!(bus.is_used(0x5));
    }

    #[test]
    fn test_igd_slot() {
        let mut bus = VirtualPciBus::new(0, []).unwrap();
        assert_eq!(
            bus.allocate("gpu", AllocOptions { igd: true }).unwrap(),
            bdf("00:02.0")
        );
        assert_eq!(
            bus.allocate("nic", AllocOptions::default()).unwrap(),
            bdf("00:03.0")
        );
        // A second graphics device cannot take the IGD slot again.
        let err = bus.allocate("gpu2", AllocOptions { igd: true }).unwrap_err();
        assert!(matches!(err, BdfError::Duplicated { ref device, .. } if device == "gpu2"));
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut bus = VirtualPciBus::new(4, [bdf("00:1d.0")]).unwrap();
        for slot in FIRST_FREE_DEVICE..LAST_FREE_DEVICE {
            assert_eq!(
                bus.allocate("dev", AllocOptions::default()).unwrap().device(),
                slot
            );
        }
        let err = bus.allocate("late", AllocOptions::default()).unwrap_err();
        assert!(matches!(err, BdfError::Exhausted { vm_id: 4, .. }));
        let msg = err.to_string();
        assert!(msg.contains("VM 4") && msg.contains("late"), "{msg}");
        assert!(msg.contains("0x1d"), "{msg}");
    }

    #[test]
    fn test_vm_sequencing() {
        let board = Board::default();
        let mut scenario = Scenario::default();
        let mut vm = vm_config(0, "VM0", LoadOrder::PreLaunched);
        vm.console_vuart = Some(pci_vuart(0));
        vm.communication_vuarts = vec![
            pci_vuart(1),
            Vuart {
                kind: VuartKind::Legacy,
                ..pci_vuart(2)
            },
        ];
        vm.pci_devs = vec![passthrough("00:14.0"), passthrough("00:0e.0")];
        scenario.vms.push(vm);
        scenario.hv.ivshmem_regions.push(IvshmemRegion {
            name: "shm".to_string(),
            size_mib: 2,
            peers: vec![IvshmemPeer {
                vm_id: 0,
                vbdf: None,
            }],
        });

        let mut allocation = Allocation::default();
        allocate(&board, &scenario, &mut allocation).unwrap();
        let devices = &allocation.vm(0).unwrap().devices;
        assert_eq!(devices["VUART_0"], bdf("00:03.0"));
        assert_eq!(devices["VUART_1"], bdf("00:04.0"));
        assert!(!devices.contains_key("VUART_2"));
        assert_eq!(devices["IVSHMEM_0"], bdf("00:05.0"));
        assert_eq!(devices["00:0e.0"], bdf("00:0e.0"));
        assert_eq!(devices["00:14.0"], bdf("00:06.0"));
        assert_eq!(allocation.hv.igd_sbdf, Some(IgdSbdf::Absent));
    }

    #[test]
    fn test_ivshmem_requested_address() {
        let board = Board::default();
        let mut scenario = Scenario::default();
        let mut vm = vm_config(0, "VM0", LoadOrder::PreLaunched);
        vm.console_vuart = Some(pci_vuart(0));
        scenario.vms.push(vm);
        scenario.hv.ivshmem_regions.push(IvshmemRegion {
            name: "shm".to_string(),
            size_mib: 2,
            peers: vec![IvshmemPeer {
                vm_id: 0,
                vbdf: Some(bdf("00:03.0")),
            }],
        });

        let mut allocation = Allocation::default();
        let err = allocate(&board, &scenario, &mut allocation).unwrap_err();
        assert!(matches!(err, BdfError::Duplicated { vm_id: 0, .. }));

        scenario.hv.ivshmem_regions[0].peers[0].vbdf = Some(bdf("00:08.0"));
        let mut allocation = Allocation::default();
        allocate(&board, &scenario, &mut allocation).unwrap();
        assert_eq!(allocation.vm(0).unwrap().devices["IVSHMEM_0"], bdf("00:08.0"));
    }

    #[test]
    fn test_requested_address_on_fixed_slot() {
        let board = Board::default();
        for slot in ["00:00.0", "00:01.0", "00:02.0", "00:1f.0"] {
            let mut scenario = Scenario::default();
            scenario.vms.push(vm_config(0, "VM0", LoadOrder::PreLaunched));
            scenario.hv.ivshmem_regions.push(IvshmemRegion {
                name: "shm".to_string(),
                size_mib: 2,
                peers: vec![IvshmemPeer {
                    vm_id: 0,
                    vbdf: Some(bdf(slot)),
                }],
            });

            let mut allocation = Allocation::default();
            let err = allocate(&board, &scenario, &mut allocation).unwrap_err();
            assert!(
                matches!(&err, BdfError::Reserved { vm_id: 0, device, bdf: at }
                    if device == "IVSHMEM_0" && *at == bdf(slot)),
                "{err}"
            );
        }
    }

    #[test]
    fn test_hardcoded_address_collision() {
        let board = Board::default();
        let mut scenario = Scenario::default();
        let mut vm = vm_config(0, "VM0", LoadOrder::PreLaunched);
        vm.pci_devs = vec![passthrough("00:0e.0")];
        scenario.vms.push(vm);
        scenario.hv.ivshmem_regions.push(IvshmemRegion {
            name: "shm".to_string(),
            size_mib: 2,
            peers: vec![IvshmemPeer {
                vm_id: 0,
                vbdf: Some(bdf("00:0e.0")),
            }],
        });

        let mut allocation = Allocation::default();
        let err = allocate(&board, &scenario, &mut allocation).unwrap_err();
        assert_eq!(
            err.to_string(),
            "VM 0: virtual PCI address 00:0e.0 requested by 00:0e.0 is already in use"
        );
    }

    #[test]
    fn test_igd_passthrough() {
        let mut board = Board::default();
        let mut gpu: PciDevice = board_device("00:02.0");
        gpu.class_code = crate::pci::PCI_CLASS_VGA;
        board.pci_devices.push(gpu);

        let mut scenario = Scenario::default();
        let mut vm = vm_config(0, "VM0", LoadOrder::PreLaunched);
        vm.pci_devs = vec![passthrough("00:02.0")];
        scenario.vms.push(vm);

        let mut allocation = Allocation::default();
        allocate(&board, &scenario, &mut allocation).unwrap();
        let devices = &allocation.vm(0).unwrap().devices;
        assert_eq!(devices["00:02.0"], bdf("00:02.0"));
        assert_eq!(devices[IGD_LPC_NAME], bdf("00:1f.0"));
        assert_eq!(
            allocation.hv.igd_sbdf,
            Some(IgdSbdf::Present(bdf("00:02.0")))
        );
    }

    #[test]
    fn test_service_vm_avoids_native_slots() {
        let mut board = Board {
            name: "tgl-rvp".to_string(),
            ..Default::default()
        };
        for native in ["00:03.0", "00:04.0", "00:05.0", "01:00.0"] {
            board.pci_devices.push(board_device(native));
        }

        let mut scenario = Scenario::default();
        let mut pre = vm_config(0, "VM0", LoadOrder::PreLaunched);
        pre.pci_devs = vec![passthrough("00:04.0")];
        let mut service = vm_config(1, "SOS", LoadOrder::Service);
        service.communication_vuarts = vec![pci_vuart(1), pci_vuart(2)];
        scenario.vms = vec![pre, service];

        let mut allocation = Allocation::default();
        allocate(&board, &scenario, &mut allocation).unwrap();
        let devices = &allocation.vm(1).unwrap().devices;
        // 00:04.0 went to the pre-launched VM, so its slot is free again.
        assert_eq!(devices["VUART_1"], bdf("00:04.0"));
        assert_eq!(devices["VUART_2"], bdf("00:06.0"));
    }

    #[test]
    fn test_existing_addresses_are_kept() {
        let board = Board::default();
        let mut scenario = Scenario::default();
        let mut vm = vm_config(2, "UOS", LoadOrder::PostLaunched);
        vm.console_vuart = Some(pci_vuart(0));
        vm.communication_vuarts = vec![pci_vuart(1)];
        scenario.vms.push(vm);

        let mut allocation = Allocation::default();
        allocation
            .vm_mut(2)
            .insert_device("VUART_0", bdf("00:03.0"));
        allocate(&board, &scenario, &mut allocation).unwrap();
        let devices = &allocation.vm(2).unwrap().devices;
        assert_eq!(devices["VUART_0"], bdf("00:03.0"));
        assert_eq!(devices["VUART_1"], bdf("00:04.0"));
    }

    /// BEGIN PROPERTY BASED TESTING
    use proptest::prelude::*;

    use crate::verify::verify_bdfs;

    const NATIVE_DEVICES: [&str; 5] = ["00:0e.0", "00:14.0", "00:17.0", "01:00.0", "02:00.0"];

    // Requested addresses include the fixed slots and the native address of 00:0e.0.
    fn random_vbdf() -> impl Strategy<Value = Option<u8>> {
        prop::option::of(prop::sample::select(vec![0x0u8, 0x1, 0x2, 0x5, 0x8, 0xe, 0x1f]))
    }

    fn random_scenario() -> impl Strategy<Value = Scenario> {
        (
            0..4u32,
            prop::collection::vec(random_vbdf(), 0..4),
            prop::sample::subsequence(NATIVE_DEVICES.to_vec(), 0..=NATIVE_DEVICES.len()),
        )
            .prop_map(|(vuarts, ivshmem, pci_devs)| {
                let mut vm = vm_config(0, "VM0", LoadOrder::PreLaunched);
                vm.communication_vuarts = (0..vuarts).map(pci_vuart).collect();
                vm.pci_devs = pci_devs.into_iter().map(passthrough).collect();
                let mut scenario = Scenario::default();
                scenario.vms.push(vm);
                scenario.hv.ivshmem_regions = ivshmem
                    .into_iter()
                    .enumerate()
                    .map(|(index, slot)| IvshmemRegion {
                        name: format!("shm{index}"),
                        size_mib: 2,
                        peers: vec![IvshmemPeer {
                            vm_id: 0,
                            vbdf: slot.map(|slot| PciBdf::new(0, 0, slot, 0)),
                        }],
                    })
                    .collect();
                scenario
            })
    }

    // Either every device gets a distinct address in the free range, or a requested address is
    // rejected with an error naming it.
    #[test]
    fn test_addresses_unique_and_in_range() {
        let cfg = ProptestConfig::with_cases(500);
        proptest!(cfg, |(scenario in random_scenario())| {
            let mut allocation = Allocation::default();
            match allocate(&Board::default(), &scenario, &mut allocation) {
                Ok(()) => {
                    prop_assert!(verify_bdfs(&allocation).is_ok());
                    let vm = allocation.vm(0).unwrap();
                    let expected = scenario.vms[0].communication_vuarts.len()
                        + scenario.hv.ivshmem_regions.len()
                        + scenario.vms[0].pci_devs.len();
                    prop_assert_eq!(vm.devices.len(), expected);
                    for bdf in vm.devices.values() {
                        prop_assert!(
                            (FIRST_FREE_DEVICE..=LAST_FREE_DEVICE).contains(&bdf.device()),
                            "{} out of range", bdf
                        );
                    }
                }
                Err(BdfError::Reserved { bdf, .. }) => {
                    prop_assert!(RESERVED_DEVICES.contains(&bdf.device()));
                }
                Err(BdfError::Duplicated { bdf, .. }) => {
                    let requested: Vec<_> = scenario
                        .hv
                        .ivshmem_regions
                        .iter()
                        .filter_map(|region| region.peers[0].vbdf)
                        .collect();
                    prop_assert!(requested.contains(&bdf) || bdf == PciBdf::new(0, 0, 0xe, 0));
                }
                Err(err) => prop_assert!(false, "unexpected error: {}", err),
            }
        });
    }
}
