// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest-physical placement of virtual PCI BARs.
//!
//! Pre-launched VMs get fixed MMIO windows, one below 4 GiB and one above 256 GiB. The service
//! VM places its virtual BARs in the native PCI hole, around the BARs of the native devices it
//! keeps. Post-launched VMs are laid out by the device model at run time.
//!
//! 32-bit BARs are placed before 64-bit ones, largest first, each at the lowest free address
//! aligned to its size. 32-bit BARs only go to windows below 4 GiB; 64-bit BARs try those first
//! and then the high ones.

use vm_allocator::{AddressAllocator, AllocPolicy};

use crate::allocation::{Allocation, PciHole, VirtualBar};
use crate::bdf::{IVSHMEM_PREFIX, VUART_PREFIX};
use crate::board::{Board, MmioRange, PciDevice};
use crate::scenario::{LoadOrder, Scenario, VmConfig, VmId};
use crate::utils::{FOUR_GIB, GIB, mib_to_bytes};

/// Smallest alignment of a virtual BAR.
pub const VBAR_ALIGNMENT: u64 = 0x1000;
/// Native BARs below this address are kept out of the PCI hole.
pub const PCI_HOLE_THRESHOLD: u64 = 0x10_0000;

/// Low MMIO window of every pre-launched VM.
pub const PRE_LAUNCHED_LOW_WINDOW: MmioRange = MmioRange {
    start: 2 * GIB,
    size: 3 * GIB / 2,
};
/// High MMIO window of every pre-launched VM.
pub const PRE_LAUNCHED_HIGH_WINDOW: MmioRange = MmioRange {
    start: 256 * GIB,
    size: 256 * GIB,
};

/// Size of each of the two register BARs of a PCI vUART.
const VUART_BAR_SIZE: u64 = 0x1000;
/// Size of the register and MSI-X BARs of an ivshmem device.
const IVSHMEM_REG_BAR_SIZE: u64 = 0x1000;
/// BAR of an ivshmem device that maps the shared memory.
const IVSHMEM_SHMEM_BAR: u8 = 2;
/// Size of the BAR emulating an MSI-X table.
const VMSIX_BAR_SIZE: u64 = 0x1000;
/// Number of BAR registers of a type 0 header.
const BAR_COUNT: u8 = 6;

/// Type bits of a prefetchable 64-bit memory BAR.
pub const PREFETCHABLE_64BIT: u64 = 0x8 | 0x4;

/// Vendor and device ids of devices whose MSI-X table the hypervisor emulates.
const VMSIX_DEVICES: [(u16, u16); 14] = [
    (0x8086, 0x4b30),
    (0x8086, 0x4b31),
    (0x8086, 0x4b32),
    (0x8086, 0x4ba0),
    (0x8086, 0x4ba1),
    (0x8086, 0x4ba2),
    (0x8086, 0x4bb0),
    (0x8086, 0x4bb1),
    (0x8086, 0x4bb2),
    (0x8086, 0xa0ac),
    (0x8086, 0x43ac),
    (0x8086, 0x43a2),
    (0x8086, 0x4b88),
    (0x8086, 0x4b89),
];

/// Errors associated with virtual BAR placement.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum GpaError {
    /// VM {vm_id}: no room for BAR {bar} of {device} ({size:#x} bytes) in the MMIO windows
    Exhausted {
        vm_id: VmId,
        device: String,
        bar: u8,
        size: u64,
    },
    /// VM {vm_id}: {device} has no free BAR register left for its virtual MSI-X table
    NoFreeBar { vm_id: VmId, device: String },
    /// Cannot create the MMIO window [{start:#x}, {end:#x}): {source}
    Window {
        start: u64,
        end: u64,
        source: vm_allocator::Error,
    },
}

/// A virtual BAR waiting for an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarRequest {
    pub device: String,
    pub index: u8,
    pub size: u64,
    pub is_64bit: bool,
}

impl BarRequest {
    fn new(device: &str, index: u8, size: u64, is_64bit: bool) -> Self {
        BarRequest {
            device: device.to_string(),
            index,
            size,
            is_64bit,
        }
    }
}

/// The native PCI hole, split at 4 GiB.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NativeHole {
    pub low: Vec<MmioRange>,
    pub high: Vec<MmioRange>,
}

impl NativeHole {
    /// Host bridge windows of `board` above [`PCI_HOLE_THRESHOLD`], in address order.
    pub fn from_board(board: &Board) -> Self {
        let mut windows: Vec<MmioRange> = board
            .pci_windows
            .iter()
            .filter(|window| window.start >= PCI_HOLE_THRESHOLD && window.size > 0)
            .copied()
            .collect();
        windows.sort_by_key(|window| window.start);
        let (low, high) = windows
            .into_iter()
            .partition(|window| window.end() <= FOUR_GIB);
        NativeHole { low, high }
    }

    /// The first window on either side of 4 GiB, as written for the hypervisor.
    pub fn bounds(&self) -> Option<PciHole> {
        let low = self.low.first()?;
        let high = self.high.first();
        Some(PciHole {
            mmio32_start: low.start,
            mmio32_end: low.end(),
            mmio64_start: high.map(|high| high.start),
            mmio64_end: high.map(MmioRange::end),
        })
    }

    fn contains(&self, start: u64, end: u64) -> bool {
        self.low
            .iter()
            .chain(&self.high)
            .any(|window| window.start <= start && end <= window.end())
    }
}

/// First-fit address pools over a set of MMIO windows.
#[derive(Debug)]
struct MmioPool {
    low: Vec<AddressAllocator>,
    high: Vec<AddressAllocator>,
}

impl MmioPool {
    fn new(low: &[MmioRange], high: &[MmioRange]) -> Result<Self, GpaError> {
        let build = |windows: &[MmioRange]| {
            windows
                .iter()
                .map(|window| {
                    AddressAllocator::new(window.start, window.size).map_err(|source| {
                        GpaError::Window {
                            start: window.start,
                            end: window.end(),
                            source,
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()
        };
        Ok(MmioPool {
            low: build(low)?,
            high: build(high)?,
        })
    }

    /// Takes `[start, start + size)` out of whichever window holds it.
    fn reserve(&mut self, start: u64, size: u64) {
        for pool in self.low.iter_mut().chain(self.high.iter_mut()) {
            if pool.allocate(size, 1, AllocPolicy::ExactMatch(start)).is_ok() {
                return;
            }
        }
        log::debug!("MMIO range at {start:#x} of {size:#x} bytes is outside every window");
    }

    fn allocate(&mut self, size: u64, is_64bit: bool) -> Option<u64> {
        let alignment = size.checked_next_power_of_two()?.max(VBAR_ALIGNMENT);
        let high = if is_64bit { self.high.len() } else { 0 };
        self.low
            .iter_mut()
            .chain(self.high.iter_mut().take(high))
            .find_map(|pool| pool.allocate(size, alignment, AllocPolicy::FirstMatch).ok())
            .map(|range| range.start())
    }
}

/// The BAR emulating the MSI-X table of `device`, in its lowest unused BAR register.
fn vmsix_request(vm_id: VmId, name: &str, device: &PciDevice) -> Result<BarRequest, GpaError> {
    let used: Vec<u8> = device
        .bars
        .iter()
        .flat_map(|bar| {
            let upper = bar.is_64bit.then_some(bar.index.saturating_add(1));
            std::iter::once(bar.index).chain(upper)
        })
        .collect();
    let index = (0..BAR_COUNT)
        .find(|index| !used.contains(index))
        .ok_or_else(|| GpaError::NoFreeBar {
            vm_id,
            device: name.to_string(),
        })?;
    Ok(BarRequest::new(name, index, VMSIX_BAR_SIZE, false))
}

/// Every virtual BAR of `vm`: PCI vUARTs, ivshmem devices, then passthrough devices.
pub fn bar_requests(
    board: &Board,
    scenario: &Scenario,
    vm: &VmConfig,
) -> Result<Vec<BarRequest>, GpaError> {
    let mut requests = Vec::new();

    let vuarts = vm
        .console_vuart
        .iter()
        .chain(vm.communication_vuarts.iter())
        .filter(|vuart| vuart.is_pci());
    for vuart in vuarts {
        let name = format!("{VUART_PREFIX}_{}", vuart.id);
        requests.push(BarRequest::new(&name, 0, VUART_BAR_SIZE, false));
        requests.push(BarRequest::new(&name, 1, VUART_BAR_SIZE, false));
    }

    for (index, region) in scenario.hv.ivshmem_regions.iter().enumerate() {
        if region.size_mib == 0 || !region.peers.iter().any(|peer| peer.vm_id == vm.id) {
            continue;
        }
        let name = format!("{IVSHMEM_PREFIX}_{index}");
        requests.push(BarRequest::new(&name, 0, IVSHMEM_REG_BAR_SIZE, false));
        requests.push(BarRequest::new(&name, 1, IVSHMEM_REG_BAR_SIZE, false));
        requests.push(BarRequest::new(
            &name,
            IVSHMEM_SHMEM_BAR,
            mib_to_bytes(region.size_mib),
            true,
        ));
    }

    for dev in &vm.pci_devs {
        let Some(native) = board.pci_device(dev.bdf) else {
            continue;
        };
        let name = dev.bdf.to_string();
        let ids = native.vendor_id.zip(native.device_id);
        if ids.is_some_and(|ids| VMSIX_DEVICES.contains(&ids)) {
            requests.push(vmsix_request(vm.id, &name, native)?);
        }
        requests.extend(
            native
                .bars
                .iter()
                .filter(|bar| bar.size > 0 && bar.base >= PCI_HOLE_THRESHOLD)
                .map(|bar| BarRequest::new(&name, bar.index, bar.size, bar.is_64bit)),
        );
    }

    Ok(requests)
}

/// Native BARs inside the PCI hole that stay with the service VM.
fn service_vm_used(board: &Board, scenario: &Scenario, hole: &NativeHole) -> Vec<(u64, u64)> {
    let passthrough: Vec<_> = scenario
        .pre_launched_vms()
        .flat_map(|vm| vm.pci_devs.iter().map(|dev| dev.bdf))
        .collect();
    board
        .pci_devices
        .iter()
        .filter(|dev| !passthrough.contains(&dev.bdf))
        .flat_map(|dev| dev.bars.iter())
        .filter(|bar| bar.size > 0 && hole.contains(bar.base, bar.base.saturating_add(bar.size)))
        .map(|bar| (bar.base, bar.size))
        .collect()
}

/// Places the virtual BARs of `vm` that have no address yet.
pub fn allocate_vm(
    board: &Board,
    scenario: &Scenario,
    vm: &VmConfig,
    hole: &NativeHole,
    allocation: &mut Allocation,
) -> Result<(), GpaError> {
    let (mut pool, used) = match vm.load_order {
        LoadOrder::PreLaunched => (
            MmioPool::new(&[PRE_LAUNCHED_LOW_WINDOW], &[PRE_LAUNCHED_HIGH_WINDOW])?,
            Vec::new(),
        ),
        LoadOrder::Service => (
            MmioPool::new(&hole.low, &hole.high)?,
            service_vm_used(board, scenario, hole),
        ),
        LoadOrder::PostLaunched => return Ok(()),
    };
    for (start, size) in used {
        pool.reserve(start, size);
    }

    let vm_alloc = allocation.vm_mut(vm.id);
    // BARs placed by an earlier run are kept.
    for bar in vm_alloc.vbars.values().flat_map(|bars| bars.values()) {
        pool.reserve(bar.address(), bar.size);
    }

    let mut requests: Vec<BarRequest> = bar_requests(board, scenario, vm)?
        .into_iter()
        .filter(|request| {
            !vm_alloc
                .vbars
                .get(&request.device)
                .is_some_and(|bars| bars.contains_key(&request.index))
        })
        .collect();
    // Stable, so equal sizes keep their request order.
    requests.sort_by(|a, b| b.size.cmp(&a.size));
    requests.sort_by_key(|request| request.is_64bit);

    for request in requests {
        let address = pool
            .allocate(request.size, request.is_64bit)
            .ok_or_else(|| GpaError::Exhausted {
                vm_id: vm.id,
                device: request.device.clone(),
                bar: request.index,
                size: request.size,
            })?;
        let value = if request.device.starts_with(IVSHMEM_PREFIX)
            && request.index == IVSHMEM_SHMEM_BAR
        {
            address | PREFETCHABLE_64BIT
        } else {
            address
        };
        log::debug!(
            "VM {}: BAR {} of {} at {address:#x}",
            vm.id,
            request.index,
            request.device
        );
        vm_alloc.vbars.entry(request.device).or_default().insert(
            request.index,
            VirtualBar {
                value,
                size: request.size,
            },
        );
    }
    Ok(())
}

/// Places the virtual BARs of every pre-launched VM and of the service VM, and records the
/// native PCI hole.
pub fn allocate(
    board: &Board,
    scenario: &Scenario,
    allocation: &mut Allocation,
) -> Result<(), GpaError> {
    let hole = NativeHole::from_board(board);
    allocation.hv.pci_hole = hole.bounds();
    for vm in &scenario.vms {
        allocate_vm(board, scenario, vm, &hole, allocation)?;
    }
    Ok(())
}
