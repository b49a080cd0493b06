use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::LocationId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationType {
    ProductionLine,
    Warehouse,
    TemporaryStorage,
    RepairArea,
    DisposalArea,
    LoadingZone,
    UnloadingZone,
    WaitingZone,
    Station,
}

/// Physical place holding up to `max_capacity` pallets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub code: String,
    pub name: String,
    pub location_type: LocationType,
    pub parent_location_id: Option<LocationId>,
    pub max_capacity: u32,
    pub current_count: u32,
    pub is_active: bool,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Location {
    pub fn new(
        id: LocationId,
        code: impl Into<String>,
        location_type: LocationType,
        max_capacity: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let code = code.into();
        Self {
            id,
            name: code.clone(),
            code,
            location_type,
            parent_location_id: None,
            max_capacity,
            current_count: 0,
            is_active: true,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent: LocationId) -> Self {
        self.parent_location_id = Some(parent);
        self
    }

    pub fn has_capacity(&self) -> bool {
        self.current_count < self.max_capacity
    }

    pub fn available_capacity(&self) -> u32 {
        self.max_capacity.saturating_sub(self.current_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity() {
        let mut location = Location::new(1, "WZ-A", LocationType::WaitingZone, 1, Utc::now());
        assert!(location.has_capacity());
        location.current_count = 1;
        assert!(!location.has_capacity());
    }
}
