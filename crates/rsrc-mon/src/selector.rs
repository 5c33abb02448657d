use std::collections::HashMap;

use api_types::ModuleId;
use api_types::ReportRow;

use crate::device::DeviceDescriptor;
use crate::device::LoadSnapshot;

/// A module that answered its query in this poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueriedDevice {
    pub descriptor: DeviceDescriptor,
    pub snapshot: LoadSnapshot,
}

/// Orders one class for display and marks the best candidate.
///
/// The best candidate is the head of `raw_order`, the pool's lowest-load
/// module, and only if it answered. Rows come out sorted by identifier;
/// identifiers without a reading are left out.
pub fn select(raw_order: &[ModuleId], queried: &HashMap<ModuleId, QueriedDevice>) -> Vec<ReportRow> {
    let best = raw_order
        .first()
        .copied()
        .filter(|id| queried.contains_key(id));

    let mut display: Vec<ModuleId> = raw_order
        .iter()
        .copied()
        .filter(|id| queried.contains_key(id))
        .collect();
    display.sort_unstable();
    display.dedup();

    display
        .into_iter()
        .filter_map(|id| queried.get(&id).map(|device| (id, device)))
        .map(|(id, device)| ReportRow {
            best: Some(id) == best,
            identifier: id,
            current_load: device.snapshot.current_load,
            model_load: device.snapshot.model_load,
            memory_usage: device.snapshot.memory_usage,
            instance_count: device.snapshot.instance_count,
            device_path: device.descriptor.dev_name.clone(),
            namespace_path: device.descriptor.blk_name.clone(),
        })
        .collect()
}
