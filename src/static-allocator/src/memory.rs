// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Host-physical memory of pre-launched VMs and the service VM hugepage budget.
//!
//! Pre-launched VMs are carved out of RAM above 4 GiB: first the explicitly placed regions,
//! then size-only requests from the lowest free address up. Whatever is left (and all memory
//! below 4 GiB) belongs to the service VM, which reserves hugepages for post-launched VMs.

use crate::allocation::{Allocation, HpaRegion, Hugepages};
use crate::board::{Board, MemoryKind};
use crate::config::AllocatorConfig;
use crate::report::Warning;
use crate::scenario::Scenario;
use crate::utils::{FOUR_GIB, bytes_to_mib, mib_to_bytes};

/// MiB per 1 GiB hugepage.
const HUGEPAGE_1G_MIB: i64 = 1024;
/// MiB per 2 MiB hugepage.
const HUGEPAGE_2M_MIB: i64 = 2;

/// Removes `[start, end)` from every range of `ranges`.
pub fn subtract(ranges: &[HpaRegion], start: u64, end: u64) -> Vec<HpaRegion> {
    let mut result = Vec::with_capacity(ranges.len() + 1);
    for range in ranges {
        if range.end() <= start || end <= range.start {
            result.push(*range);
            continue;
        }
        if range.start < start {
            result.push(HpaRegion {
                start: range.start,
                size: start - range.start,
            });
        }
        if end < range.end() {
            result.push(HpaRegion {
                start: end,
                size: range.end() - end,
            });
        }
    }
    result
}

/// Usable RAM not reserved for the hypervisor, in ascending order.
///
/// Overlapping board ranges are merged first.
pub fn free_ranges(board: &Board, scenario: &Scenario) -> Vec<HpaRegion> {
    let mut ram: Vec<HpaRegion> = board
        .memory
        .iter()
        .filter(|range| range.kind == MemoryKind::Usable && range.size > 0)
        .map(|range| HpaRegion {
            start: range.start,
            size: range.size,
        })
        .collect();
    ram.sort();
    let ram = ram.into_iter().fold(Vec::<HpaRegion>::new(), |mut merged, range| {
        match merged.last_mut() {
            Some(last) if range.start < last.end() => {
                last.size = last.size.max(range.end() - last.start);
            }
            _ => merged.push(range),
        }
        merged
    });
    let hv = &scenario.hv.memory;
    if hv.size == 0 {
        return ram;
    }
    subtract(&ram, hv.start, hv.end())
}

/// Free memory available to pre-launched VMs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryPool {
    ranges: Vec<HpaRegion>,
}

impl MemoryPool {
    /// Builds the pool out of the parts of `free` at or above 4 GiB.
    pub fn new(free: &[HpaRegion]) -> Self {
        let ranges = free
            .iter()
            .filter(|range| range.end() > FOUR_GIB)
            .map(|range| {
                let start = range.start.max(FOUR_GIB);
                HpaRegion {
                    start,
                    size: range.end() - start,
                }
            })
            .collect();
        MemoryPool { ranges }
    }

    pub fn ranges(&self) -> &[HpaRegion] {
        &self.ranges
    }

    /// Removes `region` from the pool. Returns false, leaving the pool untouched, unless a
    /// single free range contains all of it.
    pub fn claim(&mut self, region: HpaRegion) -> bool {
        let contained = self
            .ranges
            .iter()
            .any(|range| range.start <= region.start && region.end() <= range.end());
        if !contained || region.size == 0 {
            return false;
        }
        self.ranges = subtract(&self.ranges, region.start, region.end());
        true
    }

    /// Takes up to `size` bytes, lowest addresses first.
    ///
    /// Returns the regions taken and the number of bytes that could not be found.
    pub fn take(&mut self, size: u64) -> (Vec<HpaRegion>, u64) {
        let mut remaining = size;
        let mut taken = Vec::new();
        while remaining > 0 && !self.ranges.is_empty() {
            let range = &mut self.ranges[0];
            if range.size <= remaining {
                remaining -= range.size;
                taken.push(self.ranges.remove(0));
            } else {
                taken.push(HpaRegion {
                    start: range.start,
                    size: remaining,
                });
                range.start += remaining;
                range.size -= remaining;
                remaining = 0;
            }
        }
        (taken, remaining)
    }
}

/// Places the memory of every pre-launched VM.
pub fn allocate_regions(
    board: &Board,
    scenario: &Scenario,
    allocation: &mut Allocation,
) -> Vec<Warning> {
    let mut pool = MemoryPool::new(&free_ranges(board, scenario));
    let mut warnings = Vec::new();

    // Regions recorded by an earlier run are kept.
    let placed: Vec<_> = scenario
        .pre_launched_vms()
        .filter(|vm| allocation.vm(vm.id).is_some_and(|a| !a.hpa_regions.is_empty()))
        .map(|vm| vm.id)
        .collect();
    for vm_id in &placed {
        if let Some(vm_alloc) = allocation.vm(*vm_id) {
            for region in &vm_alloc.hpa_regions {
                pool.claim(*region);
            }
        }
    }

    let pending: Vec<_> = scenario
        .pre_launched_vms()
        .filter(|vm| !placed.contains(&vm.id))
        .collect();

    for vm in &pending {
        for request in &vm.memory.hpa_regions {
            let region = HpaRegion {
                start: request.start,
                size: mib_to_bytes(request.size_mib),
            };
            if pool.claim(region) {
                log::debug!("VM {}: memory {region}", vm.id);
                allocation.vm_mut(vm.id).hpa_regions.push(region);
            } else {
                warnings.push(Warning::RegionOutOfRange {
                    vm_id: vm.id,
                    start: region.start,
                    size: region.size,
                });
            }
        }
    }

    for vm in &pending {
        // Explicit regions come on top of the requested size.
        let Some(size_mib) = vm.memory.size_mib else {
            continue;
        };
        let requested = mib_to_bytes(size_mib);
        let (regions, missing) = pool.take(requested);
        for region in &regions {
            log::debug!("VM {}: memory {region}", vm.id);
        }
        allocation.vm_mut(vm.id).hpa_regions.extend(regions);
        if missing > 0 {
            warnings.push(Warning::SizeUnsatisfied {
                vm_id: vm.id,
                requested,
                missing,
            });
        }
    }

    for vm in &pending {
        if let Some(vm_alloc) = allocation.vms.get_mut(&vm.id) {
            vm_alloc.hpa_regions.sort();
        }
    }
    warnings
}

/// Hugepages the service VM reserves for post-launched VMs.
///
/// Returns the page counts and the warning raised when post-launched VMs ask for more memory
/// than the service VM can spare.
pub fn hugepages(
    board: &Board,
    scenario: &Scenario,
    config: &AllocatorConfig,
    allocation: &Allocation,
) -> (Hugepages, Option<Warning>) {
    let mib = |bytes: u64| i64::try_from(bytes_to_mib(bytes)).unwrap_or(i64::MAX);

    let high_ram: i64 = board
        .memory
        .iter()
        .filter(|range| range.kind == MemoryKind::Usable && range.start >= FOUR_GIB)
        .map(|range| mib(range.size))
        .sum();
    let pre_launched: i64 = scenario
        .pre_launched_vms()
        .filter_map(|vm| allocation.vm(vm.id))
        .flat_map(|vm| vm.hpa_regions.iter())
        .map(|region| mib(region.size))
        .sum();
    let gpus: i64 = scenario.vms.iter().map(|vm| i64::from(vm.virtio_gpu)).sum();
    let overhead = i64::try_from(config.runtime_overhead_mib).unwrap_or(i64::MAX);
    let gpu_reservation = i64::try_from(config.gpu_reservation_mib).unwrap_or(i64::MAX);
    let budget = high_ram - pre_launched - overhead - gpu_reservation.saturating_mul(gpus);

    let mut gb: i64 = 0;
    let mut mb: i64 = 0;
    let mut requested: u64 = 0;
    for size in scenario
        .post_launched_vms()
        .filter_map(|vm| vm.memory.size_mib)
    {
        let size_mib = i64::try_from(size).unwrap_or(i64::MAX);
        gb += size_mib / HUGEPAGE_1G_MIB;
        mb += ceil_half(size_mib % HUGEPAGE_1G_MIB);
        requested = requested.saturating_add(size);
    }

    let correction = budget - i64::try_from(requested).unwrap_or(i64::MAX);
    let warning = (correction < 0).then_some(Warning::HugepageBudgetExceeded {
        requested_mib: requested,
        budget_mib: budget,
    });
    // The leftover budget goes to the service VM, split like a VM of that size.
    gb += correction / HUGEPAGE_1G_MIB;
    mb += ceil_half(correction % HUGEPAGE_1G_MIB);

    let pages = Hugepages {
        gb: u64::try_from(gb.max(0)).unwrap_or_default(),
        mb: u64::try_from(mb.max(0)).unwrap_or_default(),
    };
    (pages, warning)
}

/// `mib / 2` rounded up, for a value that may be negative.
fn ceil_half(mib: i64) -> i64 {
    if mib > 0 {
        (mib + HUGEPAGE_2M_MIB - 1) / HUGEPAGE_2M_MIB
    } else {
        mib / HUGEPAGE_2M_MIB
    }
}

/// Places pre-launched VM memory and computes the service VM hugepages.
pub fn allocate(
    board: &Board,
    scenario: &Scenario,
    config: &AllocatorConfig,
    allocation: &mut Allocation,
) -> Vec<Warning> {
    let mut warnings = allocate_regions(board, scenario, allocation);

    let (pages, warning) = hugepages(board, scenario, config, allocation);
    warnings.extend(warning);
    if let Some(service_vm) = scenario.service_vm() {
        log::info!(
            "VM {}: reserving {} 1G and {} 2M hugepages",
            service_vm.id,
            pages.gb,
            pages.mb
        );
        allocation.vm_mut(service_vm.id).hugepages = Some(pages);
    }
    warnings
}
