// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Non-fatal findings of an allocation run.

use crate::AllocationError;
use crate::scenario::VmId;

/// A request the allocators could not fully honor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum Warning {
    /// VM {vm_id}: memory region at {start:#x} of {size:#x} bytes is outside every free memory range
    RegionOutOfRange { vm_id: VmId, start: u64, size: u64 },
    /// VM {vm_id}: {missing:#x} of the {requested:#x} requested bytes of memory could not be allocated
    SizeUnsatisfied {
        vm_id: VmId,
        requested: u64,
        missing: u64,
    },
    /// Post-launched VMs need {requested_mib} MiB of hugepages but only {budget_mib} MiB are available
    HugepageBudgetExceeded { requested_mib: u64, budget_mib: i64 },
    /// L{level} cache {cache_id:#x}: {needed} CLOS ids are needed but the hardware supports {supported}
    ClosExhausted {
        level: u8,
        cache_id: u32,
        needed: usize,
        supported: u32,
    },
}

/// Outcome of a successful allocation run.
#[derive(Debug, Default)]
pub struct Report {
    strict: bool,
    warnings: Vec<Warning>,
}

impl Report {
    /// Creates an empty report. In strict mode the first warning aborts the run.
    pub fn new(strict: bool) -> Self {
        Report {
            strict,
            warnings: Vec::new(),
        }
    }

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// Records `warning`, or turns it into an error in strict mode.
    pub fn warn(&mut self, warning: Warning) -> Result<(), AllocationError> {
        log::warn!("{warning}");
        if self.strict {
            return Err(AllocationError::Strict(warning));
        }
        self.warnings.push(warning);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_warning_display() {
        let warning = Warning::RegionOutOfRange {
            vm_id: 1,
            start: 0x1000,
            size: 0x2000,
        };
        assert_eq!(
            warning.to_string(),
            "VM 1: memory region at 0x1000 of 0x2000 bytes is outside every free memory range"
        );
    }

    #[test]
    fn test_lenient_report_collects() {
        let mut report = Report::new(false);
        assert!(report.is_clean());
        report
            .warn(Warning::HugepageBudgetExceeded {
                requested_mib: 4096,
                budget_mib: -12,
            })
            .unwrap();
        assert_eq!(report.warnings().len(), 1);
        assert!(!report.is_clean());
    }

    #[test]
    fn test_strict_report_fails() {
        let mut report = Report::new(true);
        let warning = Warning::SizeUnsatisfied {
            vm_id: 0,
            requested: 0x4000_0000,
            missing: 0x1000,
        };
        match report.warn(warning.clone()) {
            Err(AllocationError::Strict(err)) => assert_eq!(err, warning),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(report.is_clean());
    }
}
