// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Configuration-time allocation of the static resources of a partitioned hypervisor.
//!
//! Given a description of the physical board and a scenario listing the VMs and their
//! requests, [`allocate`] assigns virtual PCI addresses, cache allocation classes, CPU frequency
//! limits, interrupt lines and host memory so that no two VMs collide. The result is an
//! [`Allocation`](allocation::Allocation) document which later build stages consume.

/// Virtual PCI address assignment.
pub mod bdf;
/// Physical board description.
pub mod board;
/// Allocator tunables.
pub mod config;
/// CPU frequency limits.
pub mod cpu_freq;
/// Guest-physical placement of virtual BARs.
pub mod gpa;
/// Interrupt line mapping of passthrough devices.
pub mod intx;
/// Host memory and hugepage allocation.
pub mod memory;
/// PCI addressing.
pub mod pci;
/// Cache allocation class merging.
pub mod rdt;
/// Warnings raised while allocating.
pub mod report;
/// VM scenario description.
pub mod scenario;
/// Post-allocation consistency checks.
pub mod verify;
/// IRQ lines of legacy virtual UARTs.
pub mod vuart_irq;

/// Allocation output document.
pub mod allocation;
/// Helpers shared by unit and integration tests.
pub mod test_utils;
/// Miscellaneous helpers.
pub mod utils;

use crate::allocation::Allocation;
use crate::bdf::BdfError;
use crate::board::Board;
use crate::config::AllocatorConfig;
use crate::gpa::GpaError;
use crate::intx::IntxError;
use crate::rdt::RdtError;
use crate::report::{Report, Warning};
use crate::scenario::Scenario;
use crate::verify::VerifyError;
use crate::vuart_irq::VuartIrqError;

/// Errors that abort an allocation run.
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum AllocationError {
    /// Virtual PCI address allocation failed: {0}
    Bdf(#[from] BdfError),
    /// Guest physical address allocation failed: {0}
    Gpa(#[from] GpaError),
    /// Cache allocation failed: {0}
    Rdt(#[from] RdtError),
    /// Interrupt line allocation failed: {0}
    Intx(#[from] IntxError),
    /// vUART IRQ allocation failed: {0}
    VuartIrq(#[from] VuartIrqError),
    /// Allocation is inconsistent: {0}
    Verify(#[from] VerifyError),
    /// {0}
    Strict(Warning),
}

/// Coarse classification of an [`AllocationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A resource pool ran dry.
    ResourceExhausted,
    /// Two requests cannot both be honored.
    ConflictDetected,
    /// The inputs reference something that does not exist.
    InvalidInput,
    /// A warning was raised in strict mode.
    Strict,
}

impl AllocationError {
    /// Returns the kind of failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            AllocationError::Bdf(BdfError::Exhausted { .. })
            | AllocationError::Bdf(BdfError::Allocator(_))
            | AllocationError::Gpa(_)
            | AllocationError::VuartIrq(VuartIrqError::Exhausted { .. }) => {
                ErrorKind::ResourceExhausted
            }
            AllocationError::Bdf(BdfError::Duplicated { .. })
            | AllocationError::Intx(_)
            | AllocationError::Verify(_) => ErrorKind::ConflictDetected,
            AllocationError::Bdf(BdfError::Reserved { .. })
            | AllocationError::Rdt(RdtError::UnknownVm { .. }) => ErrorKind::InvalidInput,
            AllocationError::Strict(_) => ErrorKind::Strict,
        }
    }
}

fn report_all(report: &mut Report, warnings: Vec<Warning>) -> Result<(), AllocationError> {
    for warning in warnings {
        report.warn(warning)?;
    }
    Ok(())
}

/// Runs every allocator over `allocation` and checks the result.
///
/// Entries already present in `allocation` are kept and their resources are not handed out
/// again, so running twice over the same inputs yields the same document. On error the
/// document may hold a partial result and must be discarded.
pub fn allocate(
    board: &Board,
    scenario: &Scenario,
    allocation: &mut Allocation,
    config: &AllocatorConfig,
) -> Result<Report, AllocationError> {
    let mut report = Report::new(config.strict);

    log::info!("Allocating virtual PCI addresses");
    bdf::allocate(board, scenario, allocation)?;

    log::info!("Allocating virtual BARs");
    gpa::allocate(board, scenario, allocation)?;

    log::info!("Allocating cache allocation classes");
    let warnings = rdt::allocate(board, scenario, allocation)?;
    report_all(&mut report, warnings)?;

    log::info!("Allocating CPU frequency limits");
    cpu_freq::allocate(board, scenario, allocation);

    log::info!("Allocating passthrough interrupt lines");
    intx::allocate(board, scenario, allocation)?;

    log::info!("Allocating legacy vUART IRQs");
    vuart_irq::allocate(board, scenario, config, allocation)?;

    log::info!("Allocating host memory");
    let warnings = memory::allocate(board, scenario, config, allocation);
    report_all(&mut report, warnings)?;

    verify::verify(board, scenario, allocation)?;
    log::info!(
        "Allocation finished with {} warning(s)",
        report.warnings().len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let err = AllocationError::from(VuartIrqError::Exhausted {
            vm_id: 0,
            vuart_id: 1,
        });
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(
            err.to_string(),
            "vUART IRQ allocation failed: VM 0: no free IRQ left for legacy vUART 1"
        );

        let err = AllocationError::Strict(Warning::HugepageBudgetExceeded {
            requested_mib: 1024,
            budget_mib: -12,
        });
        assert_eq!(err.kind(), ErrorKind::Strict);
        assert_eq!(
            err.to_string(),
            "Post-launched VMs need 1024 MiB of hugepages but only -12 MiB are available"
        );

        let err = AllocationError::from(RdtError::UnknownVm {
            vm: "VM9".to_string(),
            vcpu: 0,
        });
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let err = AllocationError::from(GpaError::NoFreeBar {
            vm_id: 2,
            device: "00:1e.4".to_string(),
        });
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(
            err.to_string(),
            "Guest physical address allocation failed: VM 2: 00:1e.4 has no free BAR register \
             left for its virtual MSI-X table"
        );
    }

    #[test]
    fn test_strict_report() {
        let warning = Warning::SizeUnsatisfied {
            vm_id: 0,
            requested: 0x1000,
            missing: 0x800,
        };

        let mut report = Report::new(false);
        report_all(&mut report, vec![warning.clone()]).unwrap();
        assert_eq!(report.warnings(), [warning.clone()]);

        let mut report = Report::new(true);
        let err = report_all(&mut report, vec![warning]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Strict);
    }
}
