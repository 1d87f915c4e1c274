use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::compactor;
use crate::conversation::ConversationState;
use crate::limits::*;
use crate::model::*;
use crate::store::{BookingStore, ConversationStateStore, Store, StoreError};
use crate::time::TimeOfDay;

/// Manages per-business stores. Each business gets its own Store + WAL +
/// compactor, opened on first use.
pub struct TenantManager {
    stores: DashMap<BusinessId, Arc<Store>>,
    data_dir: PathBuf,
    compact_threshold: u64,
}

impl TenantManager {
    pub fn new(data_dir: PathBuf, compact_threshold: u64) -> Self {
        Self {
            stores: DashMap::new(),
            data_dir,
            compact_threshold,
        }
    }

    /// Get or lazily open the store for a business.
    pub fn get_or_create(&self, business_id: &BusinessId) -> Result<Arc<Store>, StoreError> {
        if let Some(store) = self.stores.get(business_id) {
            return Ok(store.value().clone());
        }
        let name = business_id.as_str();
        if name.len() > MAX_TENANT_NAME_LEN {
            return Err(StoreError::Tenant("tenant name too long".into()));
        }
        // The id becomes a file name, so only ids that need no escaping are
        // accepted. Distinct ids can then never share a WAL.
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StoreError::Tenant(format!("invalid tenant name: {name:?}")));
        }

        if self.stores.len() >= MAX_TENANTS {
            return Err(StoreError::Tenant("too many tenants".into()));
        }

        // Holding the vacant entry keeps a concurrent caller from opening the
        // same WAL twice. No other map access may happen while it is held.
        match self.stores.entry(business_id.clone()) {
            Entry::Occupied(e) => Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{name}.wal"));
                let store = Arc::new(
                    Store::open(business_id.clone(), wal_path)
                        .map_err(|e| StoreError::Wal(e.to_string()))?,
                );

                tokio::spawn(compactor::run_compactor(
                    Arc::downgrade(&store),
                    self.compact_threshold,
                    compactor::CHECK_INTERVAL,
                ));

                drop(slot.insert(store.clone()));
                metrics::gauge!(crate::observability::TENANTS_ACTIVE)
                    .set(self.stores.len() as f64);
                tracing::info!(business = %business_id, "store opened");
                Ok(store)
            }
        }
    }
}

#[async_trait]
impl BookingStore for TenantManager {
    async fn find(
        &self,
        business_id: &BusinessId,
        date: NaiveDate,
        statuses: &[BookingStatus],
    ) -> Result<Vec<Booking>, StoreError> {
        let store = self.get_or_create(business_id)?;
        Ok(store.bookings_on(date, statuses).await)
    }

    async fn find_for_customer(
        &self,
        business_id: &BusinessId,
        phone: &str,
        from: NaiveDate,
    ) -> Result<Vec<Booking>, StoreError> {
        let store = self.get_or_create(business_id)?;
        Ok(store.bookings_for_customer(phone, from).await)
    }

    async fn booking(
        &self,
        business_id: &BusinessId,
        id: BookingId,
    ) -> Result<Option<Booking>, StoreError> {
        let store = self.get_or_create(business_id)?;
        Ok(store.booking(id).await)
    }

    async fn insert(&self, booking: Booking) -> Result<Booking, StoreError> {
        let store = self.get_or_create(&booking.business_id)?;
        store.insert_booking(booking).await
    }

    async fn reschedule(
        &self,
        business_id: &BusinessId,
        id: BookingId,
        date: NaiveDate,
        time: TimeOfDay,
    ) -> Result<Booking, StoreError> {
        let store = self.get_or_create(business_id)?;
        store.move_booking(id, date, time).await
    }

    async fn set_status(
        &self,
        business_id: &BusinessId,
        id: BookingId,
        status: BookingStatus,
    ) -> Result<Booking, StoreError> {
        let store = self.get_or_create(business_id)?;
        store.set_booking_status(id, status).await
    }
}

#[async_trait]
impl ConversationStateStore for TenantManager {
    async fn load(
        &self,
        business_id: &BusinessId,
        phone: &str,
    ) -> Result<Option<ConversationState>, StoreError> {
        let store = self.get_or_create(business_id)?;
        Ok(store.conversation(phone).await)
    }

    async fn upsert(&self, state: ConversationState) -> Result<ConversationState, StoreError> {
        let store = self.get_or_create(&state.business_id)?;
        store.save_conversation(state).await
    }
}
