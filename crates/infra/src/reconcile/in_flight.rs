use std::collections::HashSet;
use std::sync::Mutex;

use tagtrail_core::TagId;

/// Units whose records are currently being submitted.
///
/// At most one claim per unit exists at a time, which keeps one submission
/// per unit (and therefore per record) in flight.
#[derive(Debug, Default)]
pub struct InFlightUnits {
    units: Mutex<HashSet<TagId>>,
}

impl InFlightUnits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `tag_id`, or `None` if another task holds it.
    pub fn try_claim(&self, tag_id: &TagId) -> Option<UnitClaim<'_>> {
        let mut units = self.units.lock().unwrap_or_else(|e| e.into_inner());
        if !units.insert(tag_id.clone()) {
            return None;
        }
        Some(UnitClaim {
            owner: self,
            tag_id: tag_id.clone(),
        })
    }

    pub fn is_claimed(&self, tag_id: &TagId) -> bool {
        self.units
            .lock()
            .map(|u| u.contains(tag_id))
            .unwrap_or(false)
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct UnitClaim<'a> {
    owner: &'a InFlightUnits,
    tag_id: TagId,
}

impl Drop for UnitClaim<'_> {
    fn drop(&mut self) {
        let mut units = self.owner.units.lock().unwrap_or_else(|e| e.into_inner());
        units.remove(&self.tag_id);
    }
}
