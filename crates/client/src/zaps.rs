//! Zap client.
//!
//! Builds and signs zap requests, fetches zap receipts, and aggregates
//! amounts per referenced event. Aggregation only counts distinct receipt
//! ids, so duplicates delivered by multiple relays never inflate a total
//! (the pool dedups in flight, the store dedups at rest, and the fold here
//! guards once more).

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chateau_core::{Event, ZAP_RECEIPT_KIND, ZapReceipt, ZapRequest, ZapTarget};
use tracing::debug;

use crate::error::Result;
use crate::filter::Filter;
use crate::pool::{RelayPool, SubscriptionHandle};
use crate::session::Session;
use crate::store::EventStore;

/// Millisat totals keyed by zapped event id.
pub type ZapTotals = BTreeMap<String, u64>;

/// Zap operations over the shared pool, store, and session.
#[derive(Clone)]
pub struct Zaps {
    pool: RelayPool,
    store: EventStore,
    session: Session,
    fetch_timeout: Duration,
}

impl Zaps {
    pub fn new(pool: RelayPool, store: EventStore, session: Session) -> Self {
        Self {
            pool,
            store,
            session,
            fetch_timeout: Duration::from_secs(8),
        }
    }

    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Build and sign a zap request for `target`. The result goes to the
    /// recipient's payment endpoint, not to relays.
    pub async fn create_zap_request(
        &self,
        target: &ZapTarget,
        amount_msats: u64,
        comment: &str,
        relays: &[String],
        created_at: u64,
    ) -> Result<Event> {
        let template = ZapRequest::build(target, amount_msats, comment, relays, created_at);
        Ok(self.session.sign(&template).await?)
    }

    /// Fetch zap receipts referencing `event_ids` from `relays`, cache the
    /// valid ones, and return the per-event totals over everything cached.
    pub async fn fetch_zaps_by_event_ids(
        &self,
        event_ids: &[String],
        relays: &[String],
    ) -> Result<ZapTotals> {
        let filter = Filter::new()
            .kinds([ZAP_RECEIPT_KIND])
            .event_refs(event_ids.iter().cloned());

        let fetched = self
            .pool
            .fetch(vec![filter.clone()], relays, self.fetch_timeout)
            .await?;
        let valid: Vec<Event> = fetched
            .events
            .into_iter()
            .filter(|e| e.verify())
            .collect();
        self.store.upsert(&valid)?;

        let cached = self.store.query(&filter)?;
        Ok(aggregate_receipts(&cached))
    }

    /// Fetch zap receipts addressed to `pubkeys` (profile zaps included).
    pub async fn fetch_zap_receipts_by_pubkeys(
        &self,
        pubkeys: &[String],
        relays: &[String],
    ) -> Result<Vec<ZapReceipt>> {
        let filter = Filter::new()
            .kinds([ZAP_RECEIPT_KIND])
            .pubkey_refs(pubkeys.iter().cloned());

        let fetched = self
            .pool
            .fetch(vec![filter.clone()], relays, self.fetch_timeout)
            .await?;
        let valid: Vec<Event> = fetched
            .events
            .into_iter()
            .filter(|e| e.verify())
            .collect();
        self.store.upsert(&valid)?;

        let mut receipts = Vec::new();
        for event in self.store.query(&filter)? {
            match ZapReceipt::from_event(&event) {
                Ok(receipt) => receipts.push(receipt),
                Err(e) => debug!("receipt {} not countable: {e}", event.id),
            }
        }
        Ok(receipts)
    }

    /// Watch for a receipt referencing `event_id` to show up on `relays`
    /// (e.g. right after an invoice was paid).
    pub async fn subscribe_zap_receipts(
        &self,
        event_id: &str,
        relays: &[String],
    ) -> Result<SubscriptionHandle> {
        let filter = Filter::new()
            .kinds([ZAP_RECEIPT_KIND])
            .event_refs([event_id.to_string()]);
        self.pool.subscribe(vec![filter], relays).await
    }
}

/// Sum receipt amounts per zapped event over distinct receipt ids. Receipts
/// that fail their own parse (missing invoice, forged embedded request) are
/// skipped, not counted.
pub fn aggregate_receipts(events: &[Event]) -> ZapTotals {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut totals = ZapTotals::new();

    for event in events {
        if !seen.insert(event.id.as_str()) {
            continue;
        }
        let receipt = match ZapReceipt::from_event(event) {
            Ok(receipt) => receipt,
            Err(e) => {
                debug!("receipt {} not countable: {e}", event.id);
                continue;
            }
        };
        let (Some(target), Some(amount)) = (receipt.zapped_event, receipt.amount_msats) else {
            continue;
        };
        *totals.entry(target).or_insert(0) += amount;
    }

    totals
}
