use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;

use crate::model::{Business, BusinessId};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("cannot read business config: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed business config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("duplicate business id: {0}")]
    Duplicate(BusinessId),
}

/// Read-mostly business configuration, owned outside the booking engine.
#[async_trait]
pub trait BusinessDirectory: Send + Sync {
    async fn business(&self, id: &BusinessId) -> Option<Arc<Business>>;
}

#[derive(Default)]
pub struct InMemoryDirectory {
    businesses: DashMap<BusinessId, Arc<Business>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a business. Conversations pick up the new config on
    /// their next message; bookings already made keep their snapshots.
    pub fn upsert(&self, business: Business) {
        if let Err(e) = business.validate() {
            warn!(business = %business.id, "loaded with invalid hours: {e}");
        }
        self.businesses
            .insert(business.id.clone(), Arc::new(business));
    }

    pub fn len(&self) -> usize {
        self.businesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.businesses.is_empty()
    }

    /// Parse a JSON array of businesses.
    pub fn from_json_str(json: &str) -> Result<Self, DirectoryError> {
        let businesses: Vec<Business> = serde_json::from_str(json)?;
        let directory = Self::new();
        for business in businesses {
            if directory.businesses.contains_key(&business.id) {
                return Err(DirectoryError::Duplicate(business.id));
            }
            directory.upsert(business);
        }
        Ok(directory)
    }

    pub fn load_json(path: &Path) -> Result<Self, DirectoryError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

#[async_trait]
impl BusinessDirectory for InMemoryDirectory {
    async fn business(&self, id: &BusinessId) -> Option<Arc<Business>> {
        self.businesses.get(id).map(|e| e.value().clone())
    }
}
