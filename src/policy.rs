//! Replica deletion policies.
//!
//! A policy is a named pure predicate over a dataset replica and the
//! demand information collected for its dataset. A stack of policies
//! makes the collective keep/delete decision; nothing in here mutates
//! the catalog.

use std::collections::HashMap;

use anyhow::Error;

use crate::catalog::{Block, DatasetReplica, Inventory};
use crate::registry::Registry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Keep,
    Delete,
    /// Keep, and no other policy may override it.
    KeepOverride,
}

/// Demand attributes produced for one dataset.
#[derive(Clone, Debug, Default)]
pub struct DatasetDemand {
    pub request_weight: f64,
    pub global_usage_rank: f64,
    attrs: HashMap<String, bool>,
}

impl DatasetDemand {

    pub fn flag(&self, name: &str) -> bool {
        self.attrs.get(name).copied().unwrap_or(false)
    }

    pub fn set_flag(&mut self, name: &str, value: bool) {
        self.attrs.insert(name.to_string(), value);
    }
}

pub type PolicyCondition = Box<dyn Fn(&DatasetReplica, &DatasetDemand) -> bool + Send + Sync>;

/// A single deletion policy: returns its decision when the condition
/// holds, KEEP otherwise.
pub struct DeletionPolicy {
    pub name: String,
    decision: Decision,
    condition: PolicyCondition,
}

impl DeletionPolicy {

    pub fn new(name: &str, decision: Decision, condition: PolicyCondition) -> Self {
        Self { name: name.to_string(), decision, condition }
    }

    pub fn eval(&self, replica: &DatasetReplica, demand: &DatasetDemand) -> Decision {
        if (self.condition)(replica, demand) {
            self.decision
        } else {
            Decision::Keep
        }
    }
}

/// A stack of deletion policies making a collective decision.
#[derive(Default)]
pub struct PolicyStack {
    policies: Vec<DeletionPolicy>,
}

impl PolicyStack {

    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, policy: DeletionPolicy) {
        self.policies.push(policy);
    }

    pub fn extend<I: IntoIterator<Item = DeletionPolicy>>(&mut self, policies: I) {
        self.policies.extend(policies);
    }

    /// Evaluate the stack in declared order.
    ///
    /// Any KEEP_OVERRIDE forces the final decision to KEEP and stops
    /// the evaluation. Otherwise one DELETE is enough to delete.
    pub fn decision(&self, replica: &DatasetReplica, demand: &DatasetDemand) -> Decision {
        let mut result = Decision::Keep;

        for policy in &self.policies {
            match policy.eval(replica, demand) {
                Decision::Delete => result = Decision::Delete,
                Decision::KeepOverride => return Decision::Keep,
                Decision::Keep => (),
            }
        }

        result
    }
}

/// Demand producer: flags datasets with copy requests that were
/// submitted to the transfer machinery but not picked up yet.
pub struct UnhandledCopyExists {
    registry: Registry,
}

impl UnhandledCopyExists {

    pub const ATTR: &'static str = "unhandled_copy_exists";

    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn load(
        &self,
        inventory: &Inventory,
        demands: &mut HashMap<String, DatasetDemand>,
    ) -> Result<(), Error> {
        for item in self.registry.pending_copy_items()? {
            // items name either a dataset or a single block
            let (dataset_name, block_name) = match Block::from_full_name(&item) {
                Ok((dataset, block)) => (dataset, Some(block)),
                Err(_) => (item.clone(), None),
            };

            let dataset = match inventory.datasets.get(&dataset_name) {
                Some(dataset) => dataset,
                None => continue,
            };

            if let Some(block_name) = block_name {
                if dataset.find_block(&block_name).is_none() {
                    continue;
                }
            }

            demands
                .entry(dataset_name)
                .or_insert_with(DatasetDemand::default)
                .set_flag(Self::ATTR, true);
        }

        Ok(())
    }
}
