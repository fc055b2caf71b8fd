// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Physical INTx lines of passthrough devices.
//!
//! The hypervisor cannot share a physical interrupt line between VMs, so every line used by a
//! pre-launched VM must be used by nobody else. Devices left to the service VM count as claims
//! of the service VM for this check.

use std::collections::{BTreeMap, BTreeSet};

use crate::allocation::Allocation;
use crate::board::{Board, PciDevice, RoutingSource};
use crate::pci::{PciBdf, PciInterruptPin};
use crate::scenario::{InterruptMapping, Scenario, VmConfig, VmId};

/// Bridges crossed at most while resolving an interrupt pin.
const MAX_BRIDGE_DEPTH: usize = 8;

/// Errors associated with INTx allocation.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum IntxError {
    /// VM {vm_id} uses LAPIC passthrough but its devices [{devices}] need interrupt lines {irqs:?}
    LapicPassthrough {
        vm_id: VmId,
        devices: String,
        irqs: Vec<u32>,
    },
    /// Interrupt lines {irqs:?} are shared by VM {vm_a} [{devices_a}] and VM {vm_b} [{devices_b}]
    SharedIrq {
        vm_a: VmId,
        devices_a: String,
        vm_b: VmId,
        devices_b: String,
        irqs: Vec<u32>,
    },
}

/// Interrupt lines claimed by one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub vm_id: VmId,
    pub devices: Vec<PciBdf>,
    pub irqs: BTreeSet<u32>,
}

impl Claim {
    fn device_list(&self) -> String {
        self.devices
            .iter()
            .map(PciBdf::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn route(board: &Board, device: &PciDevice, pin: PciInterruptPin) -> BTreeSet<u32> {
    let (mut bdf, mut parent, mut pin) = (device.bdf, device.parent_bridge, pin);
    for _ in 0..=MAX_BRIDGE_DEPTH {
        let source = board
            .routing_table(bdf.bus())
            .and_then(|table| table.lookup(bdf.device(), pin));
        match source {
            Some(RoutingSource::Gsi(gsi)) => return BTreeSet::from([*gsi]),
            Some(RoutingSource::Link(link)) => {
                return board
                    .interrupt_links
                    .get(link)
                    .map(|irqs| irqs.iter().copied().collect())
                    .unwrap_or_default();
            }
            None => {
                let Some(bridge) = parent else {
                    break;
                };
                pin = pin.swizzle(bdf.device());
                bdf = bridge;
                parent = board.pci_device(bridge).and_then(|dev| dev.parent_bridge);
            }
        }
    }
    BTreeSet::new()
}

/// Interrupt lines a device can raise through its INTx pin.
pub fn resolve_lines(board: &Board, device: &PciDevice) -> BTreeSet<u32> {
    if !device.irqs.is_empty() {
        return device.irqs.iter().copied().collect();
    }
    let Some(pin) = device.interrupt_pin else {
        return BTreeSet::new();
    };
    let lines = route(board, device, pin);
    if lines.is_empty() {
        log::debug!("No interrupt route for {} {pin}", device.bdf);
    }
    lines
}

/// Whether INTx of `device` is irrelevant for allocation.
fn is_excluded(scenario: &Scenario, device: &PciDevice) -> bool {
    device.has_msi() || scenario.hv.console_bdf == Some(device.bdf)
}

fn device_lines(board: &Board, scenario: &Scenario, bdf: PciBdf) -> BTreeSet<u32> {
    board
        .pci_device(bdf)
        .filter(|dev| !is_excluded(scenario, dev))
        .map(|dev| resolve_lines(board, dev))
        .unwrap_or_default()
}

fn pre_launched_claim(board: &Board, scenario: &Scenario, vm: &VmConfig) -> Claim {
    let mut irqs = BTreeSet::new();
    for dev in &vm.pci_devs {
        irqs.extend(dev.interrupts.iter().map(|mapping| mapping.physical));
        irqs.extend(device_lines(board, scenario, dev.bdf));
    }
    Claim {
        vm_id: vm.id,
        devices: vm.pci_devs.iter().map(|dev| dev.bdf).collect(),
        irqs,
    }
}

fn service_vm_claim(board: &Board, scenario: &Scenario, vm: &VmConfig) -> Claim {
    let passthrough: BTreeSet<PciBdf> = scenario
        .pre_launched_vms()
        .flat_map(|vm| vm.pci_devs.iter().map(|dev| dev.bdf))
        .collect();
    let mut claim = Claim {
        vm_id: vm.id,
        devices: Vec::new(),
        irqs: BTreeSet::new(),
    };
    for dev in &board.pci_devices {
        if passthrough.contains(&dev.bdf) || is_excluded(scenario, dev) {
            continue;
        }
        let lines = resolve_lines(board, dev);
        if !lines.is_empty() {
            claim.devices.push(dev.bdf);
            claim.irqs.extend(lines);
        }
    }
    claim
}

/// Interrupt lines claimed by every pre-launched VM, followed by the service VM.
pub fn claims(board: &Board, scenario: &Scenario) -> Vec<Claim> {
    scenario
        .pre_launched_vms()
        .map(|vm| pre_launched_claim(board, scenario, vm))
        .chain(
            scenario
                .service_vm()
                .map(|vm| service_vm_claim(board, scenario, vm)),
        )
        .collect()
}

/// Checks that pre-launched VMs with LAPIC passthrough use no INTx line.
pub fn check_lapic_passthrough(scenario: &Scenario, claims: &[Claim]) -> Result<(), IntxError> {
    let offending = claims.iter().find(|claim| {
        !claim.irqs.is_empty()
            && scenario
                .vm(claim.vm_id)
                .is_some_and(|vm| vm.is_pre_launched() && vm.lapic_passthrough)
    });
    match offending {
        Some(claim) => Err(IntxError::LapicPassthrough {
            vm_id: claim.vm_id,
            devices: claim.device_list(),
            irqs: claim.irqs.iter().copied().collect(),
        }),
        None => Ok(()),
    }
}

/// Checks that no two claims share a line.
pub fn check_conflicts(claims: &[Claim]) -> Result<(), IntxError> {
    for (i, a) in claims.iter().enumerate() {
        for b in &claims[i + 1..] {
            let shared: Vec<u32> = a.irqs.intersection(&b.irqs).copied().collect();
            if !shared.is_empty() {
                return Err(IntxError::SharedIrq {
                    vm_a: a.vm_id,
                    devices_a: a.device_list(),
                    vm_b: b.vm_id,
                    devices_b: b.device_list(),
                    irqs: shared,
                });
            }
        }
    }
    Ok(())
}

/// Checks interrupt line ownership and records the INTx mapping of every pre-launched VM.
pub fn allocate(
    board: &Board,
    scenario: &Scenario,
    allocation: &mut Allocation,
) -> Result<(), IntxError> {
    let claims = claims(board, scenario);
    check_lapic_passthrough(scenario, &claims)?;
    check_conflicts(&claims)?;

    for vm in scenario.pre_launched_vms() {
        let pt_intx = &mut allocation.vm_mut(vm.id).pt_intx;
        for dev in &vm.pci_devs {
            let name = dev.bdf.to_string();
            if pt_intx.contains_key(&name) {
                continue;
            }
            let mut mappings: BTreeMap<u32, u32> = device_lines(board, scenario, dev.bdf)
                .into_iter()
                .map(|irq| (irq, irq))
                .collect();
            mappings.extend(
                dev.interrupts
                    .iter()
                    .map(|mapping| (mapping.physical, mapping.virtual_line)),
            );
            if mappings.is_empty() {
                continue;
            }
            log::debug!("VM {}: {name} INTx {mappings:?}", vm.id);
            pt_intx.insert(
                name,
                mappings
                    .into_iter()
                    .map(|(physical, virtual_line)| InterruptMapping {
                        physical,
                        virtual_line,
                    })
                    .collect(),
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{PciCapability, RoutingEntry, RoutingTable};
    use crate::scenario::{LoadOrder, PassthroughDevice};
    use crate::test_utils::{board_device, vm_config};

    fn bdf(s: &str) -> PciBdf {
        s.parse().unwrap()
    }

    fn pin_device(s: &str, pin: PciInterruptPin) -> PciDevice {
        PciDevice {
            interrupt_pin: Some(pin),
            ..board_device(s)
        }
    }

    fn passthrough(s: &str) -> PassthroughDevice {
        PassthroughDevice {
            bdf: bdf(s),
            interrupts: vec![],
            igd: false,
        }
    }

    fn entry(device: u8, pin: PciInterruptPin, source: RoutingSource) -> RoutingEntry {
        RoutingEntry {
            device,
            pin,
            source,
        }
    }

    /// Bus 0 routes 00:14 and 00:1c (a bridge to bus 1); 00:15 and 00:16 share one line.
    fn board() -> Board {
        let mut bridged = pin_device("01:00.0", PciInterruptPin::IntA);
        bridged.parent_bridge = Some(bdf("00:1c.0"));
        let mut msi = pin_device("00:17.0", PciInterruptPin::IntA);
        msi.capabilities = vec![PciCapability::Msi];
        Board {
            pci_devices: vec![
                pin_device("00:14.0", PciInterruptPin::IntA),
                pin_device("00:15.0", PciInterruptPin::IntA),
                pin_device("00:16.0", PciInterruptPin::IntA),
                msi,
                board_device("00:1c.0"),
                bridged,
            ],
            interrupt_routing: vec![RoutingTable {
                bus: 0,
                entries: vec![
                    entry(0x14, PciInterruptPin::IntA, RoutingSource::Gsi(16)),
                    entry(0x15, PciInterruptPin::IntA, RoutingSource::Gsi(17)),
                    entry(0x16, PciInterruptPin::IntA, RoutingSource::Gsi(17)),
                    entry(0x17, PciInterruptPin::IntA, RoutingSource::Gsi(18)),
                    entry(0x1c, PciInterruptPin::IntA, RoutingSource::Gsi(19)),
                    entry(
                        0x1c,
                        PciInterruptPin::IntB,
                        RoutingSource::Link("LNKB".to_string()),
                    ),
                ],
            }],
            interrupt_links: BTreeMap::from([("LNKB".to_string(), vec![10, 11])]),
            ..Default::default()
        }
    }

    #[test]
    fn test_resolve_lines() {
        let board = board();
        let lines = |s| resolve_lines(&board, board.pci_device(bdf(s)).unwrap());
        assert_eq!(lines("00:14.0"), BTreeSet::from([16]));
        // Bus 1 has no table, INTA of device 0 stays INTA at the bridge.
        assert_eq!(lines("01:00.0"), BTreeSet::from([19]));
        assert_eq!(lines("00:1c.0"), BTreeSet::new());

        let mut link = pin_device("01:01.0", PciInterruptPin::IntA);
        link.parent_bridge = Some(bdf("00:1c.0"));
        assert_eq!(resolve_lines(&board, &link), BTreeSet::from([10, 11]));

        let mut explicit = board_device("00:1f.0");
        explicit.irqs = vec![9];
        assert_eq!(resolve_lines(&board, &explicit), BTreeSet::from([9]));
    }

    #[test]
    fn test_shared_pin_conflict() {
        let board = board();
        let mut vm0 = vm_config(0, "VM0", LoadOrder::PreLaunched);
        vm0.pci_devs = vec![passthrough("00:15.0")];
        let mut vm1 = vm_config(1, "VM1", LoadOrder::PreLaunched);
        vm1.pci_devs = vec![passthrough("00:16.0")];
        let scenario = Scenario {
            vms: vec![vm0, vm1],
            ..Default::default()
        };

        let err = allocate(&board, &scenario, &mut Allocation::default()).unwrap_err();
        assert_eq!(
            err,
            IntxError::SharedIrq {
                vm_a: 0,
                devices_a: "00:15.0".to_string(),
                vm_b: 1,
                devices_b: "00:16.0".to_string(),
                irqs: vec![17],
            }
        );
        assert_eq!(
            err.to_string(),
            "Interrupt lines [17] are shared by VM 0 [00:15.0] and VM 1 [00:16.0]"
        );
    }

    #[test]
    fn test_service_vm_owns_unclaimed_devices() {
        let board = board();
        let mut vm0 = vm_config(0, "VM0", LoadOrder::PreLaunched);
        vm0.pci_devs = vec![passthrough("00:15.0")];
        let scenario = Scenario {
            vms: vec![vm0, vm_config(1, "SOS", LoadOrder::Service)],
            ..Default::default()
        };

        let claims = claims(&board, &scenario);
        assert_eq!(claims.len(), 2);
        assert_eq!(claims[1].vm_id, 1);
        // The MSI device is not counted.
        assert_eq!(claims[1].irqs, BTreeSet::from([16, 17, 19]));
        assert!(matches!(
            allocate(&board, &scenario, &mut Allocation::default()),
            Err(IntxError::SharedIrq {
                vm_a: 0,
                vm_b: 1,
                ..
            })
        ));
    }

    #[test]
    fn test_lapic_passthrough_needs_empty_claim() {
        let board = board();
        let mut vm0 = vm_config(0, "RTVM", LoadOrder::PreLaunched);
        vm0.lapic_passthrough = true;
        vm0.pci_devs = vec![passthrough("00:17.0")];
        let mut scenario = Scenario {
            vms: vec![vm0],
            ..Default::default()
        };
        allocate(&board, &scenario, &mut Allocation::default()).unwrap();

        scenario.vms[0].pci_devs.push(passthrough("00:14.0"));
        assert_eq!(
            allocate(&board, &scenario, &mut Allocation::default()).unwrap_err(),
            IntxError::LapicPassthrough {
                vm_id: 0,
                devices: "00:17.0, 00:14.0".to_string(),
                irqs: vec![16],
            }
        );
    }

    #[test]
    fn test_mappings() {
        let board = board();
        let mut vm0 = vm_config(0, "VM0", LoadOrder::PreLaunched);
        let mut remapped = passthrough("00:14.0");
        remapped.interrupts = vec![InterruptMapping {
            physical: 16,
            virtual_line: 5,
        }];
        vm0.pci_devs = vec![remapped, passthrough("01:00.0"), passthrough("00:17.0")];
        let mut scenario = Scenario {
            vms: vec![vm0],
            ..Default::default()
        };
        scenario.hv.console_bdf = Some(bdf("01:00.0"));

        let mut allocation = Allocation::default();
        allocate(&board, &scenario, &mut allocation).unwrap();
        let pt_intx = &allocation.vm(0).unwrap().pt_intx;
        assert_eq!(
            pt_intx["00:14.0"],
            vec![InterruptMapping {
                physical: 16,
                virtual_line: 5
            }]
        );
        // The console UART and the MSI device have no INTx mapping.
        assert_eq!(pt_intx.len(), 1);
    }
}
