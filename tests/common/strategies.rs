use chrono::Duration;
use lease_core::models::WorkItem;
use proptest::prelude::*;

use super::builders::t0;

/// Job ids that are unique within one generated set
pub fn job_strategy(index: usize) -> impl Strategy<Value = WorkItem> {
    (
        prop::option::of(0u8..4),
        any::<bool>(),
        0i64..600,
        -5i64..5,
    )
        .prop_map(move |(instance, exclusive, due_offset, priority)| {
            let mut item = WorkItem::job(format!("job-{index:03}"), t0() + Duration::seconds(due_offset))
                .with_exclusive(exclusive)
                .with_priority(priority);
            if let Some(instance) = instance {
                item = item.in_process_instance(format!("pi-{instance}"), Some(format!("root-{}", instance % 2)));
            }
            item
        })
}

pub fn job_set_strategy() -> impl Strategy<Value = Vec<WorkItem>> {
    (0usize..24).prop_flat_map(|len| (0..len).map(job_strategy).collect::<Vec<_>>())
}
