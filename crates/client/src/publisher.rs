//! Publishing pipeline.
//!
//! Sign via the active session identity, upsert optimistically so the UI
//! reflects the action immediately, broadcast through the pool, then
//! reconcile the per-relay outcomes. A totally failed publish surfaces
//! [`crate::error::ClientError::PublishFailed`] but leaves the optimistic
//! local copy in the store with a failed marker — the user can see it and
//! retry, it is never silently retracted.

use std::collections::BTreeMap;
use std::time::Duration;

use chateau_core::{Event, EventTemplate};
use tracing::{debug, info};

use crate::error::{ClientError, Result};
use crate::pool::{RelayOutcome, RelayPool};
use crate::session::Session;
use crate::store::{EventStore, PublishStatus};

/// A fully reconciled publish: the signed event and one outcome per target.
#[derive(Debug)]
pub struct PublishResult {
    pub event: Event,
    pub outcomes: BTreeMap<String, RelayOutcome>,
}

impl PublishResult {
    /// True when at least one relay stored the event.
    pub fn accepted_anywhere(&self) -> bool {
        self.outcomes
            .values()
            .any(|o| *o == RelayOutcome::Accepted)
    }
}

/// A signed event that is already visible locally (status pending) but not
/// yet acknowledged by any relay.
pub struct PendingPublish {
    event: Event,
    targets: Vec<String>,
    pool: RelayPool,
    store: EventStore,
    ack_timeout: Duration,
}

impl PendingPublish {
    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Wait for per-relay outcomes and reconcile the local status.
    pub async fn confirm(self) -> Result<PublishResult> {
        let outcomes = self
            .pool
            .publish(&self.event, &self.targets, self.ack_timeout)
            .await;

        let accepted = outcomes.values().any(|o| *o == RelayOutcome::Accepted);
        self.store.set_status(
            &self.event.id,
            if accepted {
                PublishStatus::Confirmed
            } else {
                PublishStatus::Failed
            },
        )?;

        if !accepted {
            info!(
                "publish of {} failed on all {} targets",
                self.event.id,
                outcomes.len()
            );
            return Err(ClientError::PublishFailed { outcomes });
        }

        debug!(
            "published {} ({} accepted of {})",
            self.event.id,
            outcomes
                .values()
                .filter(|o| **o == RelayOutcome::Accepted)
                .count(),
            outcomes.len()
        );
        Ok(PublishResult {
            event: self.event,
            outcomes,
        })
    }
}

/// Signs, stores, and broadcasts events.
#[derive(Clone)]
pub struct Publisher {
    pool: RelayPool,
    store: EventStore,
    session: Session,
    ack_timeout: Duration,
}

impl Publisher {
    pub fn new(pool: RelayPool, store: EventStore, session: Session) -> Self {
        Self {
            pool,
            store,
            session,
            ack_timeout: Duration::from_secs(10),
        }
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Sign and optimistically store, without waiting for any relay. The
    /// returned handle carries the broadcast.
    pub async fn submit(
        &self,
        template: EventTemplate,
        targets: &[String],
    ) -> Result<PendingPublish> {
        let event = self.session.sign(&template).await?;

        self.store.upsert(std::slice::from_ref(&event))?;
        self.store.set_status(&event.id, PublishStatus::Pending)?;

        Ok(PendingPublish {
            event,
            targets: targets.to_vec(),
            pool: self.pool.clone(),
            store: self.store.clone(),
            ack_timeout: self.ack_timeout,
        })
    }

    /// Sign, store optimistically, broadcast, and reconcile in one call.
    pub async fn publish(
        &self,
        template: EventTemplate,
        targets: &[String],
    ) -> Result<PublishResult> {
        self.submit(template, targets).await?.confirm().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn publisher() -> (Publisher, EventStore, Session) {
        let pool = RelayPool::new();
        let store = EventStore::open_in_memory().unwrap();
        let session = Session::new(Settings::in_memory());
        let publisher = Publisher::new(pool, store.clone(), session.clone())
            .ack_timeout(Duration::from_millis(200));
        (publisher, store, session)
    }

    #[tokio::test]
    async fn submit_requires_sign_in() {
        let (publisher, _, _) = publisher();
        let template = EventTemplate::new(1, vec![], "hi", 1700000000);
        assert!(matches!(
            publisher.submit(template, &[]).await,
            Err(ClientError::Signer(_))
        ));
    }

    fn fresh_secret() -> String {
        hex::encode(chateau_core::generate_secret_key())
    }

    #[tokio::test]
    async fn submit_stores_pending_before_any_outcome() {
        let (publisher, store, session) = publisher();
        session.connect_with_secret(&fresh_secret()).unwrap();

        let template = EventTemplate::new(1, vec![], "optimistic", 1700000000);
        let pending = publisher.submit(template, &[]).await.unwrap();

        // Visible locally, marked unconfirmed, before confirm() ran.
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(
            store.status(&pending.event().id).unwrap(),
            Some(PublishStatus::Pending)
        );
    }

    #[tokio::test]
    async fn all_targets_unreachable_fails_but_keeps_local_copy() {
        let (publisher, store, session) = publisher();
        session.connect_with_secret(&fresh_secret()).unwrap();

        let template = EventTemplate::new(1, vec![], "doomed", 1700000000);
        let targets = vec!["ws://192.0.2.1:1/".to_string()];
        let err = publisher.publish(template, &targets).await.unwrap_err();

        let ClientError::PublishFailed { outcomes } = err else {
            panic!("expected PublishFailed");
        };
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes["ws://192.0.2.1:1/"], RelayOutcome::Unreachable);

        // The optimistic copy stays, marked failed.
        assert_eq!(store.len().unwrap(), 1);
        let events = store.query(&crate::filter::Filter::new()).unwrap();
        assert_eq!(
            store.status(&events[0].id).unwrap(),
            Some(PublishStatus::Failed)
        );
    }
}
