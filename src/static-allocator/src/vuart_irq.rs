// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! IRQ lines of port I/O virtual UARTs.

use std::collections::VecDeque;

use crate::allocation::Allocation;
use crate::board::Board;
use crate::config::AllocatorConfig;
use crate::scenario::{Scenario, VmConfig, VmId, VuartKind};

/// IRQ of the first legacy serial port.
pub const COM1_IRQ: u32 = 4;
/// IRQ of the second legacy serial port, shared by the S5 vUARTs of non-service VMs.
pub const COM2_IRQ: u32 = 3;
/// Lines at or above this value are not legacy ISA IRQs.
pub const LEGACY_IRQ_LIMIT: u32 = 16;

/// Errors associated with vUART IRQ allocation.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum VuartIrqError {
    /// VM {vm_id}: no free IRQ left for legacy vUART {vuart_id}
    Exhausted { vm_id: VmId, vuart_id: u32 },
}

/// Free IRQ lines of one VM, handed out in order.
#[derive(Debug)]
pub struct IrqPool {
    vm_id: VmId,
    irqs: VecDeque<u32>,
}

impl IrqPool {
    pub fn new(vm_id: VmId, irqs: impl IntoIterator<Item = u32>) -> Self {
        IrqPool {
            vm_id,
            irqs: irqs.into_iter().collect(),
        }
    }

    /// Removes `irq` from the pool. Returns false if it was not there.
    pub fn take(&mut self, irq: u32) -> bool {
        match self.irqs.iter().position(|free| *free == irq) {
            Some(pos) => self.irqs.remove(pos).is_some(),
            None => false,
        }
    }

    /// Hands out the next free line to `vuart_id`.
    pub fn next(&mut self, vuart_id: u32) -> Result<u32, VuartIrqError> {
        self.irqs.pop_front().ok_or(VuartIrqError::Exhausted {
            vm_id: self.vm_id,
            vuart_id,
        })
    }

    pub fn len(&self) -> usize {
        self.irqs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.irqs.is_empty()
    }
}

fn initial_pool(
    board: &Board,
    scenario: &Scenario,
    config: &AllocatorConfig,
    vm: &VmConfig,
) -> IrqPool {
    if !vm.is_service() {
        return IrqPool::new(vm.id, config.vuart_irq_pool.to_vec());
    }
    let console_irq = scenario
        .hv
        .debug_console
        .as_deref()
        .and_then(|name| board.serial_ports.iter().find(|port| port.name == name))
        .map(|port| port.irq);
    IrqPool::new(
        vm.id,
        board
            .free_irqs
            .iter()
            .copied()
            .filter(|irq| *irq != COM1_IRQ && *irq != COM2_IRQ && Some(*irq) != console_irq),
    )
}

/// Legacy vUARTs of `vm` with an I/O port, as `(id, port)`.
fn legacy_ports(vm: &VmConfig) -> Vec<(u32, u16)> {
    let connections = vm
        .console_vuart
        .iter()
        .chain(vm.communication_vuarts.iter())
        .filter(|vuart| vuart.kind == VuartKind::Legacy)
        .filter_map(|vuart| vuart.port.map(|port| (vuart.id, port)));
    let mut ports: Vec<(u32, u16)> = Vec::new();
    for (id, port) in vm
        .legacy_vuarts
        .iter()
        .filter_map(|vuart| vuart.port.map(|port| (vuart.id, port)))
        .chain(connections)
    {
        if !ports.iter().any(|(known, _)| *known == id) {
            ports.push((id, port));
        }
    }
    ports
}

/// Assigns an IRQ to every legacy vUART and to the S5 shutdown vUARTs.
pub fn allocate(
    board: &Board,
    scenario: &Scenario,
    config: &AllocatorConfig,
    allocation: &mut Allocation,
) -> Result<(), VuartIrqError> {
    for vm in &scenario.vms {
        let mut pool = initial_pool(board, scenario, config, vm);
        let irqs = &mut allocation.vm_mut(vm.id).legacy_vuart_irqs;
        // IRQs recorded by an earlier run are kept.
        for irq in irqs.values() {
            pool.take(*irq);
        }

        let ports = legacy_ports(vm);
        for (id, port) in &ports {
            if irqs.contains_key(id) {
                continue;
            }
            let native = board
                .serial_ports
                .iter()
                .find(|serial| serial.port == *port && serial.irq < LEGACY_IRQ_LIMIT);
            let irq = match native {
                Some(serial) => {
                    pool.take(serial.irq);
                    serial.irq
                }
                None => pool.next(*id)?,
            };
            log::debug!("VM {}: legacy vUART {id} at {port:#x} uses IRQ {irq}", vm.id);
            irqs.insert(*id, irq);
        }

        let mut next_id = ports.iter().map(|(id, _)| *id).max().map_or(1, |id| id + 1);
        if vm.is_service() {
            for post in scenario.post_launched_vms() {
                if !irqs.contains_key(&next_id) {
                    let irq = pool.next(next_id)?;
                    log::debug!(
                        "VM {}: S5 vUART {next_id} for VM {} uses IRQ {irq}",
                        vm.id,
                        post.id
                    );
                    irqs.insert(next_id, irq);
                }
                next_id += 1;
            }
        } else if !irqs.contains_key(&next_id) {
            log::debug!("VM {}: S5 vUART {next_id} uses IRQ {COM2_IRQ}", vm.id);
            irqs.insert(next_id, COM2_IRQ);
        }
    }
    Ok(())
}
