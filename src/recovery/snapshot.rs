//! Pre-action configuration snapshots and the bounded store rollback reads from

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::Result;
use crate::resource::{ResourceConfig, ResourceControl};

/// Snapshots kept per resource
pub const SNAPSHOTS_PER_RESOURCE: usize = 5;

/// Immutable copy of a resource's configuration at a point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySnapshot {
    /// Snapshot id
    pub snapshot_id: Uuid,
    /// Resource the configuration belongs to
    pub resource_id: String,
    /// Classification being recovered when captured
    pub classification: String,
    /// Capture time
    pub captured_at: DateTime<Utc>,
    /// Captured configuration
    pub config: ResourceConfig,
}

impl RecoverySnapshot {
    /// Read the current configuration of `resource_id`
    pub async fn capture(
        control: &dyn ResourceControl,
        resource_id: &str,
        classification: &str,
    ) -> Result<Self> {
        let config = control.get_resource_config(resource_id).await?;
        Ok(Self::from_config(resource_id, classification, config))
    }

    /// Wrap an already-read configuration
    #[must_use]
    pub fn from_config(resource_id: &str, classification: &str, config: ResourceConfig) -> Self {
        Self {
            snapshot_id: Uuid::new_v4(),
            resource_id: resource_id.to_string(),
            classification: classification.to_string(),
            captured_at: Utc::now(),
            config,
        }
    }
}

/// Most recent snapshots per resource, oldest dropped first.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    by_resource: DashMap<String, VecDeque<RecoverySnapshot>>,
}

impl SnapshotStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `snapshot`, evicting the oldest beyond [`SNAPSHOTS_PER_RESOURCE`]
    pub fn insert(&self, snapshot: RecoverySnapshot) {
        let mut history = self
            .by_resource
            .entry(snapshot.resource_id.clone())
            .or_default();
        history.push_back(snapshot);
        while history.len() > SNAPSHOTS_PER_RESOURCE {
            if let Some(dropped) = history.pop_front() {
                debug!(resource_id = %dropped.resource_id, snapshot_id = %dropped.snapshot_id, "Dropped old snapshot");
            }
        }
    }

    /// Newest snapshot for `resource_id`
    #[must_use]
    pub fn latest(&self, resource_id: &str) -> Option<RecoverySnapshot> {
        self.by_resource
            .get(resource_id)
            .and_then(|h| h.back().cloned())
    }

    /// Snapshots for `resource_id`, newest first
    #[must_use]
    pub fn history(&self, resource_id: &str) -> Vec<RecoverySnapshot> {
        self.by_resource
            .get(resource_id)
            .map(|h| h.iter().rev().cloned().collect())
            .unwrap_or_default()
    }
}
