//! # Exclusivity Grouper
//!
//! Partitions the items leased in one acquisition cycle into [`LeaseBatch`]es.
//!
//! Exclusive items sharing an exclusivity key land in one batch that executes strictly
//! sequentially, so two branches of the same process (or process hierarchy, depending on
//! [`ExclusivityScope`]) are never observed running concurrently. Every other item gets a
//! singleton batch and runs in parallel with everything else.
//!
//! Output is deterministic: batches appear in the order their first item appears in the
//! input, and items inside a keyed batch are ordered by due date, then id.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::WorkItem;

/// How far the exclusivity guarantee reaches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExclusivityScope {
    /// Items of one process instance never run concurrently
    #[default]
    ProcessInstance,
    /// Items anywhere below one root process instance never run concurrently
    ProcessHierarchy,
}

/// Ordered items that must execute one after the other
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseBatch {
    /// Shared key for exclusive batches; `None` for singletons
    pub exclusivity_key: Option<String>,
    pub items: Vec<WorkItem>,
}

impl LeaseBatch {
    pub fn singleton(item: WorkItem) -> Self {
        Self {
            exclusivity_key: None,
            items: vec![item],
        }
    }

    pub fn ids(&self) -> Vec<&str> {
        self.items.iter().map(|item| item.id.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

enum Slot {
    Single(WorkItem),
    Keyed(String),
}

/// Group leased items into batches under `scope`
pub fn group_into_batches(items: Vec<WorkItem>, scope: ExclusivityScope) -> Vec<LeaseBatch> {
    let mut slots: Vec<Slot> = Vec::with_capacity(items.len());
    let mut buckets: HashMap<String, Vec<WorkItem>> = HashMap::new();

    for item in items {
        match item.exclusivity_key(scope).map(str::to_owned) {
            Some(key) => {
                let bucket = buckets.entry(key.clone()).or_default();
                if bucket.is_empty() {
                    slots.push(Slot::Keyed(key));
                }
                bucket.push(item);
            }
            None => slots.push(Slot::Single(item)),
        }
    }

    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Single(item) => Some(LeaseBatch::singleton(item)),
            Slot::Keyed(key) => {
                let mut items = buckets.remove(&key)?;
                items.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
                Some(LeaseBatch {
                    exclusivity_key: Some(key),
                    items,
                })
            }
        })
        .collect()
}
