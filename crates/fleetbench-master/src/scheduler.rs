// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Scheduler (spec §4.H): assigns execution segments to slaves, redistributes
//! on failure, and resolves a workflow's slave selector.

use crate::error::{MasterError, Result};
use crate::slave_registry::{SlaveFilter, SlaveInfo, SlaveRegistry, SlaveState};
use fleetbench_core::SlaveSelector;

/// A half-open fractional slice `[start, end)` of the total workload assigned
/// to one slave; the final segment's `end` is exactly `1.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionSegment {
    pub slave_id: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone)]
pub struct SchedulePlan {
    pub segments: Vec<ExecutionSegment>,
}

impl SchedulePlan {
    pub fn slave_ids(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.slave_id.clone()).collect()
    }
}

/// Assigns each slave an equal-width `[i/N, (i+1)/N)` segment; the last
/// endpoint is forced to exactly `1.0`.
pub fn schedule(slaves: &[SlaveInfo]) -> Result<SchedulePlan> {
    if slaves.is_empty() {
        return Err(MasterError::SchedulingError("no slaves to schedule".to_string()));
    }
    let n = slaves.len();
    let segments = slaves
        .iter()
        .enumerate()
        .map(|(i, slave)| ExecutionSegment {
            slave_id: slave.id.clone(),
            start: i as f64 / n as f64,
            end: if i + 1 == n { 1.0 } else { (i + 1) as f64 / n as f64 },
        })
        .collect();
    Ok(SchedulePlan { segments })
}

/// Removes `failed_id`'s segment and redistributes its span uniformly among
/// survivors by extending each survivor's `end`; the last survivor's `end` is
/// forced back to `1.0`.
pub fn reschedule(failed_id: &str, plan: &SchedulePlan) -> Result<SchedulePlan> {
    let failed = plan
        .segments
        .iter()
        .find(|s| s.slave_id == failed_id)
        .ok_or_else(|| MasterError::UnknownSlave(failed_id.to_string()))?
        .clone();

    let survivors: Vec<ExecutionSegment> = plan
        .segments
        .iter()
        .filter(|s| s.slave_id != failed_id)
        .cloned()
        .collect();

    if survivors.is_empty() {
        return Err(MasterError::SchedulingError(
            "no surviving slaves to redistribute to".to_string(),
        ));
    }

    let extra_per_survivor = (failed.end - failed.start) / survivors.len() as f64;
    let n = survivors.len();
    let mut segments = Vec::with_capacity(n);
    let mut cursor = 0.0;

    for (i, survivor) in survivors.into_iter().enumerate() {
        let width = (survivor.end - survivor.start) + extra_per_survivor;
        let end = if i + 1 == n { 1.0 } else { cursor + width };
        segments.push(ExecutionSegment {
            slave_id: survivor.slave_id,
            start: cursor,
            end,
        });
        cursor = end;
    }

    Ok(SchedulePlan { segments })
}

/// Resolves a workflow's slave selector against the registry.
pub fn select_slaves(selector: &SlaveSelector, registry: &SlaveRegistry) -> Result<Vec<SlaveInfo>> {
    match selector {
        SlaveSelector::Manual { ids } => {
            let mut slaves = Vec::with_capacity(ids.len());
            for id in ids {
                let slave = registry
                    .get(id)
                    .ok_or_else(|| MasterError::UnknownSlave(id.clone()))?;
                if slave.state != SlaveState::Online {
                    return Err(MasterError::SchedulingError(format!(
                        "slave {id} is not online"
                    )));
                }
                slaves.push(slave);
            }
            Ok(slaves)
        }
        SlaveSelector::Label { labels } => {
            let found = registry.list_slaves(&SlaveFilter {
                labels: labels.clone(),
                states: vec![SlaveState::Online],
                ..Default::default()
            });
            if found.is_empty() {
                return Err(MasterError::NoSuitableSlaves);
            }
            Ok(found)
        }
        SlaveSelector::Capability { capabilities } => {
            let found = registry.list_slaves(&SlaveFilter {
                capabilities: capabilities.clone(),
                states: vec![SlaveState::Online],
                ..Default::default()
            });
            if found.is_empty() {
                return Err(MasterError::NoSuitableSlaves);
            }
            Ok(found)
        }
        SlaveSelector::Auto { min_slaves, max_slaves } => {
            let mut online = registry.get_online_slaves();
            if online.len() < *min_slaves {
                return Err(MasterError::NoSuitableSlaves);
            }
            online.sort_by(|a, b| a.current_load().partial_cmp(&b.current_load()).unwrap());
            let take = (*max_slaves).min(online.len());
            online.truncate(take);
            Ok(online)
        }
    }
}

/// Returns a length-`n` sequence summing to `total`, the remainder
/// distributed across the first `total mod n` slots.
pub fn calculate_vus_per_slave(total: u32, n: usize) -> Vec<u32> {
    distribute(total as u64, n).into_iter().map(|v| v as u32).collect()
}

pub fn calculate_iterations_per_slave(total: u64, n: usize) -> Vec<u64> {
    distribute(total, n)
}

fn distribute(total: u64, n: usize) -> Vec<u64> {
    if n == 0 {
        return Vec::new();
    }
    let base = total / n as u64;
    let remainder = (total % n as u64) as usize;
    (0..n)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}
