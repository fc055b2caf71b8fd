// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-CPU frequency limits.
//!
//! Limits come in two flavours: HWP performance levels (as used in `IA32_HWP_REQUEST`) and
//! ACPI P-state indices, where P0 is the fastest state. CPUs that share a clock run at the
//! frequency of the fastest one, so every CPU's window is narrowed to fit the windows of the
//! CPUs it depends on. This is what keeps the frequency of a real-time CPU fixed.

use std::collections::{BTreeMap, BTreeSet};

use crate::allocation::{Allocation, CpuFreqLimits};
use crate::board::{Board, CoreType, PState};
use crate::scenario::Scenario;

/// HWP levels used when the platform has no HWP support.
const NO_HWP_GUARANTEED_LVL: u8 = 0xff;
const NO_HWP_HIGHEST_LVL: u8 = 0xff;
const NO_HWP_LOWEST_LVL: u8 = 0x1;

/// The CPUs whose frequency is tied to `cpu_id`, including `cpu_id` itself, sorted.
///
/// A CPU depends on the CPUs of its ACPI frequency domain, on its hyperthread siblings and, on
/// hybrid platforms, on the Atom cores of its cluster (inferred from a shared L2 cache).
pub fn dependencies(board: &Board, cpu_id: u32) -> Vec<u32> {
    let mut deps = BTreeSet::from([cpu_id]);
    let Some(cpu) = board.thread(cpu_id) else {
        return deps.into_iter().collect();
    };
    if let Some(domain) = &cpu.freqdomain_cpus {
        deps.extend(domain.iter().copied());
    }

    let hybrid = board.processors.capabilities.hybrid;
    for other in &board.processors.threads {
        if other.cpu_id == cpu_id {
            continue;
        }
        if cpu.apic_id & !1 == other.apic_id & !1 {
            deps.insert(other.cpu_id);
        }
        if hybrid
            && cpu.core_type == CoreType::Atom
            && other.core_type == CoreType::Atom
            && board.caches.iter().any(|cache| {
                cache.level == 2
                    && cache.processors.contains(&cpu.apic_id)
                    && cache.processors.contains(&other.apic_id)
            })
        {
            deps.insert(other.cpu_id);
        }
    }
    deps.into_iter().collect()
}

/// Index of the fastest P-state whose ratio does not exceed `ratio`.
///
/// Falls back to the slowest state when every state is faster.
pub fn p_state_index(p_states: &[PState], ratio: u32) -> u32 {
    let index = p_states
        .iter()
        .position(|state| state.ratio() <= ratio)
        .unwrap_or_else(|| p_states.len().saturating_sub(1));
    u32::try_from(index).unwrap_or(u32::MAX)
}

/// Limits of `cpu_id` derived from the hardware alone, before dependencies are applied.
///
/// `rt` pins the CPU to its guaranteed level and to the nominal P-state.
pub fn base_limits(board: &Board, cpu_id: u32, rt: bool) -> CpuFreqLimits {
    let processors = &board.processors;
    let caps = processors.capabilities;
    let mut limits = CpuFreqLimits::default();

    let hwp = board
        .thread(cpu_id)
        .and_then(|cpu| cpu.hwp)
        .filter(|_| caps.hwp);
    match hwp {
        Some(levels) => {
            limits.limit_guaranteed_lvl = levels.guaranteed;
            limits.limit_highest_lvl = if caps.turbo && !rt {
                levels.highest
            } else {
                levels.guaranteed
            };
            limits.limit_lowest_lvl = if rt { levels.guaranteed } else { levels.lowest };
        }
        None => {
            limits.limit_guaranteed_lvl = NO_HWP_GUARANTEED_LVL;
            limits.limit_highest_lvl = NO_HWP_HIGHEST_LVL;
            limits.limit_lowest_lvl = NO_HWP_LOWEST_LVL;
        }
    }

    if caps.eist && !processors.p_states.is_empty() {
        let count = u32::try_from(processors.p_states.len()).unwrap_or(u32::MAX);
        let nominal = match (caps.turbo, processors.max_none_turbo_ratio) {
            (true, Some(ratio)) => p_state_index(&processors.p_states, ratio),
            _ => 0,
        };
        limits.limit_nominal_pstate = nominal;
        if rt {
            limits.limit_highest_pstate = nominal;
            limits.limit_lowest_pstate = nominal;
        } else {
            limits.limit_highest_pstate = 0;
            limits.limit_lowest_pstate = count - 1;
        }
    }

    limits
}

/// Narrows `limits` to fit within `dep`.
///
/// Higher HWP levels are faster while lower P-state indices are faster, hence the mirrored
/// comparisons.
fn constrain(limits: &mut CpuFreqLimits, dep: &CpuFreqLimits) {
    limits.limit_highest_lvl = limits.limit_highest_lvl.min(dep.limit_highest_lvl);
    limits.limit_lowest_lvl = limits.limit_lowest_lvl.max(dep.limit_lowest_lvl);
    limits.limit_highest_pstate = limits.limit_highest_pstate.max(dep.limit_highest_pstate);
    limits.limit_lowest_pstate = limits.limit_lowest_pstate.min(dep.limit_lowest_pstate);
}

/// Physical CPUs used by real-time VMs.
fn rt_cpus(scenario: &Scenario) -> BTreeSet<u32> {
    scenario
        .vms
        .iter()
        .filter(|vm| vm.rtvm)
        .flat_map(|vm| vm.cpu_affinity.iter().copied())
        .collect()
}

/// Computes the frequency limits of every CPU of the board.
pub fn allocate(board: &Board, scenario: &Scenario, allocation: &mut Allocation) {
    let rt = rt_cpus(scenario);
    let base: BTreeMap<u32, CpuFreqLimits> = board
        .processors
        .threads
        .iter()
        .map(|cpu| {
            (
                cpu.cpu_id,
                base_limits(board, cpu.cpu_id, rt.contains(&cpu.cpu_id)),
            )
        })
        .collect();

    // Single pass against the hardware windows, so the result does not depend on CPU order.
    for (cpu_id, cpu_base) in &base {
        let mut limits = *cpu_base;
        for dep in dependencies(board, *cpu_id) {
            if let Some(dep_base) = base.get(&dep) {
                constrain(&mut limits, dep_base);
            }
        }
        log::debug!("CPU {cpu_id}: frequency limits {limits:?}");
        allocation.hv.cpufreq.insert(*cpu_id, limits);
    }
    log::info!("Computed frequency limits of {} CPUs", base.len());
}
