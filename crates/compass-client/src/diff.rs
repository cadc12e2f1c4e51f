use std::collections::BTreeMap;

use compass_core::InstanceDescriptor;

/// Three-way change set between two instance maps keyed by instance id.
///
/// Every id present in either input lands in exactly one of the four lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceDiff {
    pub added: Vec<InstanceDescriptor>,
    pub updated: Vec<InstanceDescriptor>,
    pub deleted: Vec<InstanceDescriptor>,
    pub unchanged: Vec<String>,
}

impl InstanceDiff {
    pub fn between(
        old: &BTreeMap<String, InstanceDescriptor>,
        new: &BTreeMap<String, InstanceDescriptor>,
    ) -> Self {
        let mut diff = InstanceDiff::default();
        for (id, instance) in new {
            match old.get(id) {
                None => diff.added.push(instance.clone()),
                Some(previous) if previous != instance => diff.updated.push(instance.clone()),
                Some(_) => diff.unchanged.push(id.clone()),
            }
        }
        diff.deleted = old
            .iter()
            .filter(|(id, _)| !new.contains_key(*id))
            .map(|(_, instance)| instance.clone())
            .collect();
        diff
    }

    /// True when nothing was added, updated or deleted.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }
}
