// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Consistency checks of a complete allocation document.

use std::collections::BTreeMap;

use crate::allocation::{Allocation, HpaRegion};
use crate::board::Board;
use crate::intx::{self, IntxError};
use crate::memory;
use crate::pci::PciBdf;
use crate::rdt::DEFAULT_CLOS_MASK;
use crate::scenario::{CacheType, Scenario, VmId};

/// Invariant violations found in an allocation document.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum VerifyError {
    /// VM {vm_id}: {first} and {second} share virtual PCI address {bdf}
    DuplicateBdf {
        vm_id: VmId,
        bdf: PciBdf,
        first: String,
        second: String,
    },
    /// VM {vm_id}: virtual PCI address {bdf} of {device} is not on bus 0
    InvalidBdf {
        vm_id: VmId,
        device: String,
        bdf: PciBdf,
    },
    /// {0}
    Intx(#[from] IntxError),
    /// Memory {first} of VM {first_vm} overlaps memory {second} of VM {second_vm}
    MemoryOverlap {
        first_vm: VmId,
        first: HpaRegion,
        second_vm: VmId,
        second: HpaRegion,
    },
    /// VM {vm_id}: memory {region} is not free RAM
    MemoryOutOfRange { vm_id: VmId, region: HpaRegion },
    /// VM {vm_id}: BAR {first_bar} of {first} overlaps BAR {second_bar} of {second} at {address:#x}
    BarOverlap {
        vm_id: VmId,
        first: String,
        first_bar: u8,
        second: String,
        second_bar: u8,
        address: u64,
    },
    /// VM {vm_id}: vCPU {vcpu} uses CLOS {clos} but L{level} cache {cache_id:#x} has {count} entries
    ClosOutOfRange {
        vm_id: VmId,
        vcpu: u32,
        clos: u32,
        level: u8,
        cache_id: u32,
        count: usize,
    },
    /// VM {vm_id}: vCPU {vcpu} asked for mask {expected:#x} on L{level} cache {cache_id:#x} but got {found:#x}
    ClosMaskMismatch {
        vm_id: VmId,
        vcpu: u32,
        level: u8,
        cache_id: u32,
        expected: u64,
        found: u64,
    },
}

pub(crate) fn verify_bdfs(allocation: &Allocation) -> Result<(), VerifyError> {
    for (vm_id, vm) in &allocation.vms {
        let mut seen: BTreeMap<PciBdf, &str> = BTreeMap::new();
        for (name, bdf) in &vm.devices {
            if bdf.segment() != 0 || bdf.bus() != 0 {
                return Err(VerifyError::InvalidBdf {
                    vm_id: *vm_id,
                    device: name.clone(),
                    bdf: *bdf,
                });
            }
            if let Some(first) = seen.insert(*bdf, name) {
                return Err(VerifyError::DuplicateBdf {
                    vm_id: *vm_id,
                    bdf: *bdf,
                    first: first.to_string(),
                    second: name.clone(),
                });
            }
        }
    }
    Ok(())
}

fn verify_bars(allocation: &Allocation) -> Result<(), VerifyError> {
    for (vm_id, vm) in &allocation.vms {
        let mut bars: Vec<(u64, u64, &str, u8)> = vm
            .vbars
            .iter()
            .flat_map(|(device, bars)| {
                bars.iter()
                    .map(move |(index, bar)| (bar.address(), bar.end(), device.as_str(), *index))
            })
            .collect();
        bars.sort_unstable();
        for pair in bars.windows(2) {
            let ((_, first_end, first, first_bar), (address, _, second, second_bar)) =
                (pair[0], pair[1]);
            if address < first_end {
                return Err(VerifyError::BarOverlap {
                    vm_id: *vm_id,
                    first: first.to_string(),
                    first_bar,
                    second: second.to_string(),
                    second_bar,
                    address,
                });
            }
        }
    }
    Ok(())
}

fn verify_memory(
    board: &Board,
    scenario: &Scenario,
    allocation: &Allocation,
) -> Result<(), VerifyError> {
    let free = memory::free_ranges(board, scenario);
    let mut regions: Vec<(HpaRegion, VmId)> = scenario
        .pre_launched_vms()
        .filter_map(|vm| allocation.vm(vm.id).map(|alloc| (vm.id, alloc)))
        .flat_map(|(vm_id, alloc)| alloc.hpa_regions.iter().map(move |r| (*r, vm_id)))
        .collect();
    regions.sort();

    for (region, vm_id) in &regions {
        let contained = free
            .iter()
            .any(|range| range.start <= region.start && region.end() <= range.end());
        if !contained {
            return Err(VerifyError::MemoryOutOfRange {
                vm_id: *vm_id,
                region: *region,
            });
        }
    }
    for pair in regions.windows(2) {
        let ((first, first_vm), (second, second_vm)) = (pair[0], pair[1]);
        if second.start < first.end() {
            return Err(VerifyError::MemoryOverlap {
                first_vm,
                first,
                second_vm,
                second,
            });
        }
    }
    Ok(())
}

fn verify_clos(scenario: &Scenario, allocation: &Allocation) -> Result<(), VerifyError> {
    let tables = &allocation.hv.clos_masks;
    for (vm_id, vm) in &allocation.vms {
        for (vcpu, clos) in &vm.vcpu_clos {
            for table in tables {
                let rows = if scenario.hv.rdt.cdp_enabled { 2 } else { 1 };
                let needed = (*clos as usize + 1) * rows;
                if needed > table.masks.len() {
                    return Err(VerifyError::ClosOutOfRange {
                        vm_id: *vm_id,
                        vcpu: *vcpu,
                        clos: *clos,
                        level: table.level,
                        cache_id: table.cache_id,
                        count: table.masks.len(),
                    });
                }
            }
        }
    }

    let cdp = scenario.hv.rdt.cdp_enabled;
    for cache in &scenario.hv.rdt.cache_allocations {
        let Some(table) = allocation.hv.clos_mask_table(cache.level, cache.cache_id) else {
            continue;
        };
        for policy in &cache.policies {
            let (Some(expected), Some(vm)) = (policy.clos_mask, scenario.vm_by_name(&policy.vm))
            else {
                continue;
            };
            let Some(clos) = allocation
                .vm(vm.id)
                .and_then(|alloc| alloc.vcpu_clos.get(&policy.vcpu))
            else {
                continue;
            };
            let clos = *clos as usize;
            let rows = match (cdp, policy.cache_type) {
                (false, _) => vec![clos],
                (true, CacheType::Data) => vec![2 * clos],
                (true, CacheType::Code) => vec![2 * clos + 1],
                (true, CacheType::Unified) => vec![2 * clos, 2 * clos + 1],
            };
            for row in rows {
                let found = table
                    .masks
                    .get(row)
                    .map_or(DEFAULT_CLOS_MASK, |mask| mask.0);
                if found != expected {
                    return Err(VerifyError::ClosMaskMismatch {
                        vm_id: vm.id,
                        vcpu: policy.vcpu,
                        level: cache.level,
                        cache_id: cache.cache_id,
                        expected,
                        found,
                    });
                }
            }
        }
    }
    Ok(())
}

/// Checks the end-of-run invariants of `allocation`.
///
/// Virtual PCI addresses are unique per VM and so are the ranges of its virtual BARs. No
/// interrupt line is shared between VMs, pre-launched VM memory is disjoint
/// free RAM and every CLOS id in use has a row with the requested masks.
pub fn verify(
    board: &Board,
    scenario: &Scenario,
    allocation: &Allocation,
) -> Result<(), VerifyError> {
    verify_bdfs(allocation)?;
    verify_bars(allocation)?;

    let claims = intx::claims(board, scenario);
    intx::check_lapic_passthrough(scenario, &claims)?;
    intx::check_conflicts(&claims)?;

    verify_memory(board, scenario, allocation)?;
    verify_clos(scenario, allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::{ClosMask, ClosMaskTable, VirtualBar};
    use crate::board::{MemoryKind, MemoryRange};
    use crate::scenario::{CacheAllocation, CachePolicy, LoadOrder};
    use crate::test_utils::vm_config;
    use crate::utils::{FOUR_GIB, GIB};

    fn bdf(s: &str) -> PciBdf {
        s.parse().unwrap()
    }

    #[test]
    fn test_duplicate_bdf() {
        let mut allocation = Allocation::default();
        let vm = allocation.vm_mut(0);
        vm.insert_device("VUART_0", bdf("00:03.0"));
        vm.insert_device("VUART_1", bdf("00:04.0"));
        verify_bdfs(&allocation).unwrap();

        allocation.vm_mut(0).insert_device("IVSHMEM_0", bdf("00:03.0"));
        assert_eq!(
            verify_bdfs(&allocation).unwrap_err(),
            VerifyError::DuplicateBdf {
                vm_id: 0,
                bdf: bdf("00:03.0"),
                first: "IVSHMEM_0".to_string(),
                second: "VUART_0".to_string(),
            }
        );

        let mut allocation = Allocation::default();
        allocation.vm_mut(1).insert_device("VUART_0", bdf("01:03.0"));
        assert!(matches!(
            verify_bdfs(&allocation),
            Err(VerifyError::InvalidBdf { vm_id: 1, .. })
        ));
    }

    #[test]
    fn test_memory() {
        let board = Board {
            memory: vec![MemoryRange {
                start: FOUR_GIB,
                size: 4 * GIB,
                kind: MemoryKind::Usable,
            }],
            ..Default::default()
        };
        let scenario = Scenario {
            vms: vec![
                vm_config(0, "VM0", LoadOrder::PreLaunched),
                vm_config(1, "VM1", LoadOrder::PreLaunched),
            ],
            ..Default::default()
        };
        let region = |start, size| HpaRegion { start, size };

        let mut allocation = Allocation::default();
        allocation.vm_mut(0).hpa_regions = vec![region(FOUR_GIB, GIB)];
        allocation.vm_mut(1).hpa_regions = vec![region(FOUR_GIB + GIB, GIB)];
        verify_memory(&board, &scenario, &allocation).unwrap();

        allocation.vm_mut(1).hpa_regions = vec![region(FOUR_GIB + GIB / 2, GIB)];
        assert_eq!(
            verify_memory(&board, &scenario, &allocation).unwrap_err(),
            VerifyError::MemoryOverlap {
                first_vm: 0,
                first: region(FOUR_GIB, GIB),
                second_vm: 1,
                second: region(FOUR_GIB + GIB / 2, GIB),
            }
        );

        allocation.vm_mut(1).hpa_regions = vec![region(8 * GIB, GIB)];
        assert!(matches!(
            verify_memory(&board, &scenario, &allocation),
            Err(VerifyError::MemoryOutOfRange { vm_id: 1, .. })
        ));
    }

    #[test]
    fn test_clos() {
        let mut scenario = Scenario {
            vms: vec![vm_config(0, "VM0", LoadOrder::PreLaunched)],
            ..Default::default()
        };
        scenario.hv.rdt.enabled = true;
        scenario.hv.rdt.cache_allocations = vec![CacheAllocation {
            cache_id: 0,
            level: 3,
            policies: vec![CachePolicy {
                vm: "VM0".to_string(),
                vcpu: 0,
                cache_type: CacheType::Unified,
                clos_mask: Some(0xf0),
            }],
        }];

        let mut allocation = Allocation::default();
        allocation.hv.clos_masks = vec![ClosMaskTable {
            level: 3,
            cache_id: 0,
            masks: vec![ClosMask(0xff), ClosMask(0xf0)],
        }];
        allocation.vm_mut(0).vcpu_clos.insert(0, 1);
        verify_clos(&scenario, &allocation).unwrap();

        allocation.vm_mut(0).vcpu_clos.insert(0, 0);
        assert!(matches!(
            verify_clos(&scenario, &allocation),
            Err(VerifyError::ClosMaskMismatch {
                expected: 0xf0,
                found: 0xff,
                ..
            })
        ));

        allocation.vm_mut(0).vcpu_clos.insert(0, 2);
        assert!(matches!(
            verify_clos(&scenario, &allocation),
            Err(VerifyError::ClosOutOfRange {
                clos: 2,
                count: 2,
                ..
            })
        ));
    }

    #[test]
    fn test_bar_overlap() {
        let mut allocation = Allocation::default();
        let vbars = &mut allocation.vm_mut(1).vbars;
        vbars.entry("VUART_0".to_string()).or_default().extend([
            (0, VirtualBar { value: 0x8000_0000, size: 0x1000 }),
            (1, VirtualBar { value: 0x8000_1000, size: 0x1000 }),
        ]);
        // Type bits are not part of the address.
        vbars.entry("IVSHMEM_0".to_string()).or_default().insert(
            2,
            VirtualBar {
                value: 0x8020_000c,
                size: 0x20_0000,
            },
        );
        verify_bars(&allocation).unwrap();

        allocation
            .vm_mut(1)
            .vbars
            .entry("01:00.0".to_string())
            .or_default()
            .insert(0, VirtualBar { value: 0x8010_0000, size: 0x20_0000 });
        assert_eq!(
            verify_bars(&allocation).unwrap_err().to_string(),
            "VM 1: BAR 0 of 01:00.0 overlaps BAR 2 of IVSHMEM_0 at 0x80200000"
        );
    }
}
