// Copyright 2026 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cache allocation: merging per-vCPU cache policies into classes of service.
//!
//! Every vCPU with a cache policy asks for one capacity bitmask per cache instance. Requests
//! that agree on every concrete mask share a class of service (CLOS); the bucket index of the
//! merged list is the CLOS id.

use std::collections::BTreeSet;

use crate::allocation::{Allocation, ClosMask, ClosMaskTable};
use crate::board::{Board, RdtCapability};
use crate::report::Warning;
use crate::scenario::{CacheType, Scenario};

/// Mask used for caches whose capacity bitmask length is unknown.
pub const DEFAULT_CLOS_MASK: u64 = 0xffff;

/// Errors associated with cache policy merging.
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum RdtError {
    /// Cache policy of vCPU {vcpu} refers to unknown VM {vm:?}
    UnknownVm { vm: String, vcpu: u32 },
}

/// Capacity bitmask requested for one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mask {
    /// Any mask is acceptable.
    Wildcard,
    Fixed(u64),
}

impl Mask {
    /// Whether both masks can be satisfied by a single CLOS.
    pub fn matches(&self, other: &Mask) -> bool {
        match (self, other) {
            (Mask::Fixed(a), Mask::Fixed(b)) => a == b,
            _ => true,
        }
    }

    fn fill(&mut self, other: &Mask) {
        if *self == Mask::Wildcard {
            *self = *other;
        }
    }

    /// The concrete mask, `default` for a wildcard.
    pub fn resolve(&self, default: u64) -> u64 {
        match self {
            Mask::Wildcard => default,
            Mask::Fixed(mask) => *mask,
        }
    }
}

impl From<Option<u64>> for Mask {
    fn from(mask: Option<u64>) -> Self {
        mask.map_or(Mask::Wildcard, Mask::Fixed)
    }
}

/// Position of every L2 cache instance inside an [`L2Policy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L2CacheIndex {
    ids: Vec<u32>,
}

impl L2CacheIndex {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        let ids: BTreeSet<u32> = ids.into_iter().collect();
        L2CacheIndex {
            ids: ids.into_iter().collect(),
        }
    }

    /// Index of the L2 caches the scenario has policies for.
    pub fn from_scenario(scenario: &Scenario) -> Self {
        Self::new(
            scenario
                .hv
                .rdt
                .cache_allocations
                .iter()
                .filter(|alloc| alloc.level == 2)
                .map(|alloc| alloc.cache_id),
        )
    }

    pub fn position(&self, cache_id: u32) -> Option<usize> {
        self.ids.binary_search(&cache_id).ok()
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A mask requested for one cache instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Policy {
    pub cache_id: u32,
    pub mask: Mask,
}

/// Masks requested for every L2 cache instance, in [`L2CacheIndex`] order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Policy {
    masks: Vec<Mask>,
}

impl L2Policy {
    pub fn new(index: &L2CacheIndex) -> Self {
        L2Policy {
            masks: vec![Mask::Wildcard; index.len()],
        }
    }

    /// Requests `policy`. Returns false if the cache is not part of `index`.
    pub fn set(&mut self, index: &L2CacheIndex, policy: Policy) -> bool {
        match index.position(policy.cache_id) {
            Some(pos) => {
                self.masks[pos] = policy.mask;
                true
            }
            None => false,
        }
    }

    pub fn mask(&self, position: usize) -> Mask {
        self.masks.get(position).copied().unwrap_or(Mask::Wildcard)
    }

    pub fn matches(&self, other: &L2Policy) -> bool {
        self.masks
            .iter()
            .zip(other.masks.iter())
            .all(|(a, b)| a.matches(b))
    }

    fn fill(&mut self, other: &L2Policy) {
        self.masks
            .iter_mut()
            .zip(other.masks.iter())
            .for_each(|(a, b)| a.fill(b));
    }
}

/// Mask requested for the L3 cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L3Policy {
    pub policy: Option<Policy>,
}

impl L3Policy {
    pub fn mask(&self) -> Mask {
        self.policy.map_or(Mask::Wildcard, |policy| policy.mask)
    }

    pub fn matches(&self, other: &L3Policy) -> bool {
        self.mask().matches(&other.mask())
    }

    fn fill(&mut self, other: &L3Policy) {
        match (&mut self.policy, other.policy) {
            (Some(policy), Some(theirs)) => policy.mask.fill(&theirs.mask),
            (None, theirs) => self.policy = theirs,
            (Some(_), None) => (),
        }
    }
}

/// A vCPU whose cache request is part of a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub vm: String,
    pub vcpu: u32,
    pub cache_type: CacheType,
}

/// Cache masks shared by a set of owners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdtPolicy {
    pub l2: L2Policy,
    pub l3: L3Policy,
    pub owners: Vec<Owner>,
}

impl RdtPolicy {
    pub fn new(index: &L2CacheIndex, owner: Owner) -> Self {
        RdtPolicy {
            l2: L2Policy::new(index),
            l3: L3Policy { policy: None },
            owners: vec![owner],
        }
    }

    fn set(&mut self, index: &L2CacheIndex, level: u8, policy: Policy) {
        match level {
            2 => {
                self.l2.set(index, policy);
            }
            3 => self.l3.policy = Some(policy),
            level => log::debug!("Ignoring cache policy for unsupported cache level {level}"),
        }
    }

    pub fn matches(&self, other: &RdtPolicy) -> bool {
        self.l2.matches(&other.l2) && self.l3.matches(&other.l3)
    }

    /// Absorbs `other` if compatible: wildcards take `other`'s masks, owners are appended.
    pub fn merge(&mut self, other: &RdtPolicy) -> bool {
        if !self.matches(other) {
            return false;
        }
        self.l2.fill(&other.l2);
        self.l3.fill(&other.l3);
        self.owners.extend(other.owners.iter().cloned());
        true
    }
}

/// A request for one class of service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClosRequest {
    /// Plain request, merged with any compatible one.
    Shared(RdtPolicy),
    /// Request of a VM with virtual CAT, which always needs a CLOS of its own.
    Vcat(RdtPolicy),
    /// Code and data halves under code and data prioritization.
    Cdp { data: RdtPolicy, code: RdtPolicy },
}

impl ClosRequest {
    pub fn matches(&self, other: &ClosRequest) -> bool {
        match (self, other) {
            (
                ClosRequest::Shared(a) | ClosRequest::Vcat(a),
                ClosRequest::Shared(b) | ClosRequest::Vcat(b),
            ) => a.matches(b),
            (
                ClosRequest::Cdp { data, code },
                ClosRequest::Cdp {
                    data: other_data,
                    code: other_code,
                },
            ) => data.matches(other_data) && code.matches(other_code),
            _ => false,
        }
    }

    /// Absorbs `other` into this request. Returns false, leaving both untouched, if the two
    /// cannot share a CLOS.
    pub fn merge(&mut self, other: &ClosRequest) -> bool {
        match (self, other) {
            (ClosRequest::Shared(a), ClosRequest::Shared(b)) => a.merge(b),
            (
                ClosRequest::Cdp { data, code },
                ClosRequest::Cdp {
                    data: other_data,
                    code: other_code,
                },
            ) => {
                if !(data.matches(other_data) && code.matches(other_code)) {
                    return false;
                }
                data.merge(other_data) && code.merge(other_code)
            }
            _ => false,
        }
    }

    /// The hardware CLOS entries of this request, data before code.
    pub fn flatten(&self) -> Vec<&RdtPolicy> {
        match self {
            ClosRequest::Shared(policy) | ClosRequest::Vcat(policy) => vec![policy],
            ClosRequest::Cdp { data, code } => vec![data, code],
        }
    }
}

/// Folds `requests` into buckets, each request joining the first bucket it merges with.
pub fn merge_policy_list(requests: impl IntoIterator<Item = ClosRequest>) -> Vec<ClosRequest> {
    let mut buckets: Vec<ClosRequest> = Vec::new();
    for request in requests {
        if !buckets.iter_mut().any(|bucket| bucket.merge(&request)) {
            buckets.push(request);
        }
    }
    buckets
}

#[derive(Debug)]
struct VcpuRequest {
    vm: String,
    vcpu: u32,
    unified: Option<RdtPolicy>,
    data: Option<RdtPolicy>,
    code: Option<RdtPolicy>,
}

impl VcpuRequest {
    fn half(&mut self, index: &L2CacheIndex, cache_type: CacheType) -> &mut RdtPolicy {
        let slot = match cache_type {
            CacheType::Unified => &mut self.unified,
            CacheType::Data => &mut self.data,
            CacheType::Code => &mut self.code,
        };
        let owner = Owner {
            vm: self.vm.clone(),
            vcpu: self.vcpu,
            cache_type,
        };
        slot.get_or_insert_with(|| RdtPolicy::new(index, owner))
    }
}

/// Builds the CLOS requests of every vCPU, in order of first appearance.
pub fn collect_requests(scenario: &Scenario, index: &L2CacheIndex) -> Vec<ClosRequest> {
    let rdt = &scenario.hv.rdt;
    let mut vcpus: Vec<VcpuRequest> = Vec::new();

    for cache in &rdt.cache_allocations {
        for entry in &cache.policies {
            let pos = match vcpus
                .iter()
                .position(|req| req.vm == entry.vm && req.vcpu == entry.vcpu)
            {
                Some(pos) => pos,
                None => {
                    vcpus.push(VcpuRequest {
                        vm: entry.vm.clone(),
                        vcpu: entry.vcpu,
                        unified: None,
                        data: None,
                        code: None,
                    });
                    vcpus.len() - 1
                }
            };
            let policy = Policy {
                cache_id: cache.cache_id,
                mask: Mask::from(entry.clos_mask),
            };
            let request = &mut vcpus[pos];
            match (rdt.cdp_enabled, entry.cache_type) {
                (false, _) => request
                    .half(index, CacheType::Unified)
                    .set(index, cache.level, policy),
                (true, CacheType::Unified) => {
                    request
                        .half(index, CacheType::Data)
                        .set(index, cache.level, policy);
                    request
                        .half(index, CacheType::Code)
                        .set(index, cache.level, policy);
                }
                (true, cache_type) => request
                    .half(index, cache_type)
                    .set(index, cache.level, policy),
            }
        }
    }

    vcpus
        .into_iter()
        .map(|mut request| {
            if rdt.cdp_enabled {
                let data = request.half(index, CacheType::Data).clone();
                let code = request.half(index, CacheType::Code).clone();
                return ClosRequest::Cdp { data, code };
            }
            let vcat = rdt.vcat_enabled
                && scenario
                    .vm_by_name(&request.vm)
                    .is_some_and(|vm| vm.virtual_cat_support);
            let policy = request.half(index, CacheType::Unified).clone();
            if vcat {
                ClosRequest::Vcat(policy)
            } else {
                ClosRequest::Shared(policy)
            }
        })
        .collect()
}

/// Computes the CLOS mask tables and the CLOS id of every vCPU with a cache policy.
pub fn allocate(
    board: &Board,
    scenario: &Scenario,
    allocation: &mut Allocation,
) -> Result<Vec<Warning>, RdtError> {
    let rdt = &scenario.hv.rdt;
    if !rdt.enabled || rdt.cache_allocations.is_empty() {
        return Ok(Vec::new());
    }

    let index = L2CacheIndex::from_scenario(scenario);
    let buckets = merge_policy_list(collect_requests(scenario, &index));
    let flat: Vec<&RdtPolicy> = buckets.iter().flat_map(ClosRequest::flatten).collect();
    log::info!(
        "Merged cache policies into {} classes of service",
        flat.len()
    );

    let l3_ids: BTreeSet<u32> = rdt
        .cache_allocations
        .iter()
        .filter(|alloc| alloc.level == 3)
        .map(|alloc| alloc.cache_id)
        .collect();
    let instances = l3_ids
        .into_iter()
        .map(|id| (3u8, id, None))
        .chain(
            index
                .ids()
                .iter()
                .enumerate()
                .map(|(pos, id)| (2u8, *id, Some(pos))),
        );

    let mut warnings = Vec::new();
    let mut tables = Vec::new();
    for (level, cache_id, l2_position) in instances {
        let capability = board.cache(level, cache_id).and_then(|c| c.rdt.as_ref());
        let default = capability
            .and_then(RdtCapability::full_mask)
            .unwrap_or(DEFAULT_CLOS_MASK);
        if let Some(cap) = capability {
            if flat.len() > cap.clos_number as usize {
                warnings.push(Warning::ClosExhausted {
                    level,
                    cache_id,
                    needed: flat.len(),
                    supported: cap.clos_number,
                });
            }
        }
        let masks = flat
            .iter()
            .map(|policy| {
                let mask = match l2_position {
                    Some(pos) => policy.l2.mask(pos),
                    None => policy.l3.mask(),
                };
                ClosMask(mask.resolve(default))
            })
            .collect();
        tables.push(ClosMaskTable {
            level,
            cache_id,
            masks,
        });
    }
    allocation.hv.clos_masks = tables;

    for (clos, policy) in flat.iter().enumerate() {
        for owner in &policy.owners {
            let clos = match (rdt.cdp_enabled, owner.cache_type) {
                (false, CacheType::Unified) => clos,
                (true, CacheType::Data) => clos / 2,
                _ => continue,
            };
            let vm = scenario
                .vm_by_name(&owner.vm)
                .ok_or_else(|| RdtError::UnknownVm {
                    vm: owner.vm.clone(),
                    vcpu: owner.vcpu,
                })?;
            let clos = u32::try_from(clos).unwrap_or(u32::MAX);
            log::debug!("VM {}: vCPU {} uses CLOS {clos}", vm.id, owner.vcpu);
            allocation.vm_mut(vm.id).vcpu_clos.insert(owner.vcpu, clos);
        }
    }

    Ok(warnings)
}
