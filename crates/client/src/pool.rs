//! Relay pool.
//!
//! Manages concurrent connections to many relays and exposes the three
//! transport primitives the rest of the client builds on:
//!
//! - one-shot [`RelayPool::fetch`], complete when every reachable relay has
//!   signalled end-of-stored-events or the caller's timeout elapses
//! - long-lived [`RelayPool::subscribe`], delivering each event id at most
//!   once across all relays
//! - [`RelayPool::publish`] with an explicit per-relay outcome
//!
//! Unreachable relays are skipped, never fatal: operations degrade to
//! whichever relays respond. A dropped connection still used by an active
//! subscription is retried with bounded backoff; events missed during the
//! outage are not replayed — callers re-issue a fetch for the gap window.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chateau_core::{Event, sort_events};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::filter::Filter;
use crate::message::{ClientMessage, RelayMessage};
use crate::relay::{Backoff, RelayConnection, RelayEvent, RelayEventKind};

/// Outcome of handing one event to one relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The relay acknowledged and stored the event
    Accepted,
    /// The relay refused, with its stated reason
    Rejected(String),
    /// The relay could not be reached (or never answered in time)
    Unreachable,
}

/// What a subscription delivers.
#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    /// A (deduplicated) event, with the relay that delivered it first
    Event { relay: String, event: Event },
    /// One relay finished replaying stored events
    Eose { relay: String },
    /// Every reachable relay has finished replaying stored events
    EndOfStored,
}

/// Result of a one-shot fetch.
#[derive(Debug)]
pub struct FetchResult {
    /// Deduplicated events, newest first
    pub events: Vec<Event>,
    /// Relays that finished replaying stored events in time
    pub eosed: BTreeSet<String>,
    /// Targeted relays that could not be reached
    pub unreachable: BTreeSet<String>,
}

impl FetchResult {
    /// True when at least one relay answered completely and none matched:
    /// "confirmed empty", as opposed to "no data yet".
    pub fn confirmed_empty(&self) -> bool {
        self.events.is_empty() && !self.eosed.is_empty()
    }
}

/// Handle for a long-lived subscription. Dropping it stops delivery;
/// [`SubscriptionHandle::close`] also tells the relays.
pub struct SubscriptionHandle {
    pub id: String,
    receiver: mpsc::UnboundedReceiver<SubscriptionMessage>,
    alive: Arc<AtomicBool>,
    pool: RelayPool,
}

impl SubscriptionHandle {
    /// Receive the next message, or `None` once the subscription is closed
    /// and drained.
    pub async fn recv(&mut self) -> Option<SubscriptionMessage> {
        self.receiver.recv().await
    }

    /// Cancel the subscription and release its resources. In-flight relay
    /// messages that arrive after this are dropped, not delivered.
    pub async fn close(self) {
        self.alive.store(false, Ordering::SeqCst);
        let pool = self.pool.clone();
        let id = self.id.clone();
        pool.unsubscribe(&id).await;
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        // Liveness gate checked by the dispatcher before every delivery.
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct SubState {
    filters: Vec<Filter>,
    relays: BTreeSet<String>,
    pending_eose: BTreeSet<String>,
    seen: HashSet<String>,
    sender: mpsc::UnboundedSender<SubscriptionMessage>,
    alive: Arc<AtomicBool>,
    end_of_stored_sent: bool,
}

struct RelayState {
    conn: Arc<RelayConnection>,
    backoff: Backoff,
}

struct PoolState {
    relays: HashMap<String, RelayState>,
    subs: HashMap<String, SubState>,
    pending_oks: HashMap<(String, String), oneshot::Sender<RelayOutcome>>,
}

/// A pool of relay connections. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct RelayPool {
    state: Arc<Mutex<PoolState>>,
    events_tx: mpsc::UnboundedSender<RelayEvent>,
}

/// Standardize a relay url (trailing slashes and the like) so pool keys
/// always agree with what the connection reports back.
fn canonical_url(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(parsed) => parsed.to_string(),
        Err(_) => url.to_string(),
    }
}

impl RelayPool {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(PoolState {
            relays: HashMap::new(),
            subs: HashMap::new(),
            pending_oks: HashMap::new(),
        }));

        tokio::spawn(dispatch(Arc::downgrade(&state), events_rx));
        Self { state, events_tx }
    }

    /// Add a relay without connecting. No-op if already present.
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        let url = canonical_url(url);
        let mut st = self.state.lock().await;
        if st.relays.contains_key(&url) {
            return Ok(());
        }
        let conn = RelayConnection::new(&url, self.events_tx.clone())?;
        st.relays.insert(
            url,
            RelayState {
                conn: Arc::new(conn),
                backoff: Backoff::default(),
            },
        );
        Ok(())
    }

    /// Make sure `url` is in the pool and connected, waiting at most until
    /// `deadline`. The connection attempt runs as a detached task, so an
    /// abandoned caller never leaves a socket half-opened and a late
    /// success still benefits the next operation.
    async fn ensure_one(&self, url: &str, deadline: Option<Instant>) -> bool {
        if self.add_relay(url).await.is_err() {
            return false;
        }
        let conn = {
            let st = self.state.lock().await;
            st.relays
                .get(&canonical_url(url))
                .map(|r| Arc::clone(&r.conn))
        };
        let Some(conn) = conn else {
            return false;
        };

        let handle = tokio::spawn(async move {
            if !conn.is_connected().await {
                let _ = conn.connect().await;
            }
            conn.is_connected().await
        });

        let joined = match deadline {
            Some(at) => match timeout_at(at, handle).await {
                Ok(res) => res,
                Err(_) => return false,
            },
            None => handle.await,
        };
        joined.unwrap_or(false)
    }

    /// Connect every url concurrently; a slow relay only burns its own
    /// lane, never the others' budget. Returns the subset connected in
    /// time.
    async fn ensure_relays(&self, urls: &[String], deadline: Option<Instant>) -> BTreeSet<String> {
        let lanes = urls.iter().map(|url| async move {
            if self.ensure_one(url, deadline).await {
                Some(url.clone())
            } else {
                None
            }
        });
        futures::future::join_all(lanes)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub async fn relay_urls(&self) -> Vec<String> {
        self.state.lock().await.relays.keys().cloned().collect()
    }

    pub async fn is_connected(&self, url: &str) -> bool {
        let conn = {
            let st = self.state.lock().await;
            st.relays
                .get(&canonical_url(url))
                .map(|r| Arc::clone(&r.conn))
        };
        match conn {
            Some(conn) => conn.is_connected().await,
            None => false,
        }
    }

    /// One-shot query against `relays`. Completes when every reachable
    /// relay has sent EOSE or `timeout` elapses, whichever comes first:
    /// slow relays are simply excluded from the result, not retried.
    pub async fn fetch(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
        timeout: Duration,
    ) -> Result<FetchResult> {
        let relays: Vec<String> = relays.iter().map(|u| canonical_url(u)).collect();
        let deadline = Instant::now() + timeout;
        // Half the budget for connecting, the rest for streaming; a relay
        // that cannot connect in time is unreachable for this fetch.
        let connect_deadline = Instant::now() + timeout / 2;
        let connected = self.ensure_relays(&relays, Some(connect_deadline)).await;
        let unreachable: BTreeSet<String> = relays
            .iter()
            .filter(|u| !connected.contains(*u))
            .cloned()
            .collect();

        if connected.is_empty() {
            return Ok(FetchResult {
                events: Vec::new(),
                eosed: BTreeSet::new(),
                unreachable,
            });
        }

        let (id, mut receiver, _alive) = self
            .register_subscription(filters.clone(), connected.clone())
            .await;
        self.send_req(&id, &filters, &connected).await;

        let mut events = Vec::new();
        let mut eosed = BTreeSet::new();
        loop {
            match timeout_at(deadline, receiver.recv()).await {
                Ok(Some(SubscriptionMessage::Event { event, .. })) => events.push(event),
                Ok(Some(SubscriptionMessage::Eose { relay })) => {
                    eosed.insert(relay);
                }
                Ok(Some(SubscriptionMessage::EndOfStored)) => break,
                Ok(None) => break,
                Err(_) => {
                    debug!("fetch {id} hit its deadline");
                    break;
                }
            }
        }

        self.unsubscribe(&id).await;
        sort_events(&mut events);
        Ok(FetchResult {
            events,
            eosed,
            unreachable,
        })
    }

    /// Long-lived subscription against `relays`. Each newly seen event id is
    /// delivered at most once even when several relays carry it.
    pub async fn subscribe(
        &self,
        filters: Vec<Filter>,
        relays: &[String],
    ) -> Result<SubscriptionHandle> {
        let relays: Vec<String> = relays.iter().map(|u| canonical_url(u)).collect();
        let connected = self.ensure_relays(&relays, None).await;
        let (id, receiver, alive) = self
            .register_subscription(filters.clone(), connected.clone())
            .await;
        self.send_req(&id, &filters, &connected).await;

        Ok(SubscriptionHandle {
            id,
            receiver,
            alive,
            pool: self.clone(),
        })
    }

    async fn register_subscription(
        &self,
        filters: Vec<Filter>,
        relays: BTreeSet<String>,
    ) -> (
        String,
        mpsc::UnboundedReceiver<SubscriptionMessage>,
        Arc<AtomicBool>,
    ) {
        let id = Uuid::new_v4().to_string()[..8].to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let mut st = self.state.lock().await;
        st.subs.insert(
            id.clone(),
            SubState {
                filters,
                pending_eose: relays.clone(),
                relays,
                seen: HashSet::new(),
                sender: tx,
                alive: Arc::clone(&alive),
                end_of_stored_sent: false,
            },
        );
        (id, rx, alive)
    }

    async fn send_req(&self, id: &str, filters: &[Filter], relays: &BTreeSet<String>) {
        let msg = ClientMessage::Req {
            subscription_id: id.to_string(),
            filters: filters.to_vec(),
        };
        for url in relays {
            let conn = {
                let st = self.state.lock().await;
                st.relays.get(url).map(|r| Arc::clone(&r.conn))
            };
            if let Some(conn) = conn {
                if let Err(e) = conn.send(&msg).await {
                    warn!("failed to subscribe {id} on {url}: {e}");
                }
            }
        }
    }

    /// Cancel a subscription: CLOSE on every relay that had it, then drop
    /// the tracking state.
    pub async fn unsubscribe(&self, id: &str) {
        let (relays, conns) = {
            let mut st = self.state.lock().await;
            let Some(sub) = st.subs.remove(id) else {
                return;
            };
            sub.alive.store(false, Ordering::SeqCst);
            let conns: Vec<Option<Arc<RelayConnection>>> = sub
                .relays
                .iter()
                .map(|u| st.relays.get(u).map(|r| Arc::clone(&r.conn)))
                .collect();
            (sub.relays, conns)
        };

        let msg = ClientMessage::Close {
            subscription_id: id.to_string(),
        };
        for (url, conn) in relays.iter().zip(conns) {
            if let Some(conn) = conn {
                if conn.send(&msg).await.is_err() {
                    debug!("could not CLOSE {id} on {url}");
                }
            }
        }
    }

    /// Broadcast an event to `relays`, reporting one outcome per target.
    /// Each relay gets its own lane — connect, send, await OK — bounded by
    /// one shared deadline, so a dead relay never starves a healthy one.
    pub async fn publish(
        &self,
        event: &Event,
        relays: &[String],
        timeout: Duration,
    ) -> BTreeMap<String, RelayOutcome> {
        let deadline = Instant::now() + timeout;
        let relays: Vec<String> = relays.iter().map(|u| canonical_url(u)).collect();
        let lanes = relays.iter().map(|url| async move {
            (url.clone(), self.publish_one(event, url, deadline).await)
        });
        futures::future::join_all(lanes).await.into_iter().collect()
    }

    async fn publish_one(&self, event: &Event, url: &str, deadline: Instant) -> RelayOutcome {
        if !self.ensure_one(url, Some(deadline)).await {
            return RelayOutcome::Unreachable;
        }
        let conn = {
            let st = self.state.lock().await;
            st.relays.get(url).map(|r| Arc::clone(&r.conn))
        };
        let Some(conn) = conn else {
            return RelayOutcome::Unreachable;
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut st = self.state.lock().await;
            st.pending_oks
                .insert((url.to_string(), event.id.clone()), tx);
        }

        if conn.send(&ClientMessage::Event(event.clone())).await.is_err() {
            let mut st = self.state.lock().await;
            st.pending_oks.remove(&(url.to_string(), event.id.clone()));
            return RelayOutcome::Unreachable;
        }

        match timeout_at(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            _ => {
                let mut st = self.state.lock().await;
                st.pending_oks.remove(&(url.to_string(), event.id.clone()));
                RelayOutcome::Unreachable
            }
        }
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Pool dispatcher: a single task consuming every relay's events in arrival
/// order. Serializing here keeps subscription bookkeeping free of partial
/// interleavings, and the per-subscription liveness check happens right
/// before delivery.
async fn dispatch(state: Weak<Mutex<PoolState>>, mut events_rx: mpsc::UnboundedReceiver<RelayEvent>) {
    while let Some(RelayEvent { relay, event }) = events_rx.recv().await {
        let Some(state_arc) = state.upgrade() else {
            break;
        };
        let mut st = state_arc.lock().await;

        match event {
            RelayEventKind::Opened => {
                if let Some(relay_state) = st.relays.get_mut(&relay) {
                    relay_state.backoff.reset();
                }
                // Re-issue every live subscription that targets this relay.
                let reqs: Vec<(String, Vec<Filter>)> = st
                    .subs
                    .iter()
                    .filter(|(_, sub)| {
                        sub.alive.load(Ordering::SeqCst) && sub.relays.contains(&relay)
                    })
                    .map(|(id, sub)| (id.clone(), sub.filters.clone()))
                    .collect();
                if let Some(conn) = st.relays.get(&relay).map(|r| Arc::clone(&r.conn)) {
                    for (subscription_id, filters) in reqs {
                        let msg = ClientMessage::Req {
                            subscription_id,
                            filters,
                        };
                        let _ = conn.send(&msg).await;
                    }
                }
            }

            RelayEventKind::Closed => {
                // Anything still waiting for an OK from this relay is not
                // going to get one.
                let stale: Vec<(String, String)> = st
                    .pending_oks
                    .keys()
                    .filter(|(u, _)| *u == relay)
                    .cloned()
                    .collect();
                for key in stale {
                    if let Some(tx) = st.pending_oks.remove(&key) {
                        let _ = tx.send(RelayOutcome::Unreachable);
                    }
                }

                // The relay can no longer EOSE; one-shot fetches should not
                // keep waiting for it.
                let mut dead = Vec::new();
                for (id, sub) in st.subs.iter_mut() {
                    if sub.pending_eose.remove(&relay)
                        && sub.pending_eose.is_empty()
                        && !sub.end_of_stored_sent
                    {
                        sub.end_of_stored_sent = true;
                        if sub.sender.send(SubscriptionMessage::EndOfStored).is_err() {
                            dead.push(id.clone());
                        }
                    }
                }
                for id in dead {
                    st.subs.remove(&id);
                }

                // Reconnect with bounded backoff while any live subscription
                // still wants this relay. Each Closed schedules exactly one
                // retry; a failed attempt emits Closed again.
                let wanted = st
                    .subs
                    .values()
                    .any(|sub| sub.alive.load(Ordering::SeqCst) && sub.relays.contains(&relay));
                if wanted {
                    if let Some(relay_state) = st.relays.get_mut(&relay) {
                        let delay = relay_state.backoff.next_delay();
                        let conn = Arc::clone(&relay_state.conn);
                        info!("relay {relay} dropped; reconnecting in {delay:?}");
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            conn.disconnect().await;
                            let _ = conn.connect().await;
                        });
                    }
                }
            }

            RelayEventKind::Message(RelayMessage::Event {
                subscription_id,
                event,
            }) => {
                let mut drop_sub = false;
                if let Some(sub) = st.subs.get_mut(&subscription_id) {
                    if !sub.alive.load(Ordering::SeqCst) {
                        drop_sub = true;
                    } else if sub.seen.insert(event.id.clone())
                        && sub
                            .sender
                            .send(SubscriptionMessage::Event { relay, event })
                            .is_err()
                    {
                        drop_sub = true;
                    }
                }
                if drop_sub {
                    st.subs.remove(&subscription_id);
                }
            }

            RelayEventKind::Message(RelayMessage::Eose { subscription_id }) => {
                let mut drop_sub = false;
                if let Some(sub) = st.subs.get_mut(&subscription_id) {
                    if !sub.alive.load(Ordering::SeqCst) {
                        drop_sub = true;
                    } else {
                        sub.pending_eose.remove(&relay);
                        let _ = sub.sender.send(SubscriptionMessage::Eose {
                            relay: relay.clone(),
                        });
                        if sub.pending_eose.is_empty() && !sub.end_of_stored_sent {
                            sub.end_of_stored_sent = true;
                            if sub.sender.send(SubscriptionMessage::EndOfStored).is_err() {
                                drop_sub = true;
                            }
                        }
                    }
                }
                if drop_sub {
                    st.subs.remove(&subscription_id);
                }
            }

            RelayEventKind::Message(RelayMessage::Ok {
                event_id,
                accepted,
                message,
            }) => {
                if let Some(tx) = st.pending_oks.remove(&(relay.clone(), event_id.clone())) {
                    let outcome = if accepted {
                        RelayOutcome::Accepted
                    } else {
                        RelayOutcome::Rejected(message)
                    };
                    let _ = tx.send(outcome);
                } else {
                    debug!("unsolicited OK for {event_id} from {relay}");
                }
            }

            RelayEventKind::Message(RelayMessage::Closed {
                subscription_id,
                message,
            }) => {
                warn!("subscription {subscription_id} closed by {relay}: {message}");
                if let Some(sub) = st.subs.get_mut(&subscription_id) {
                    sub.pending_eose.remove(&relay);
                    if sub.pending_eose.is_empty() && !sub.end_of_stored_sent {
                        sub.end_of_stored_sent = true;
                        let _ = sub.sender.send(SubscriptionMessage::EndOfStored);
                    }
                }
            }

            RelayEventKind::Message(RelayMessage::Notice { message }) => {
                debug!("notice from {relay}: {message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_relay_is_idempotent() {
        let pool = RelayPool::new();
        pool.add_relay("wss://relay.example.com").await.unwrap();
        pool.add_relay("wss://relay.example.com").await.unwrap();
        assert_eq!(pool.relay_urls().await.len(), 1);
    }

    #[tokio::test]
    async fn fetch_with_no_reachable_relays_is_empty_not_fatal() {
        let pool = RelayPool::new();
        // Reserved TEST-NET address: nothing listens there.
        let targets = vec!["ws://192.0.2.1:1/".to_string()];
        let result = pool
            .fetch(vec![Filter::new()], &targets, Duration::from_millis(200))
            .await
            .unwrap();

        assert!(result.events.is_empty());
        assert!(!result.confirmed_empty());
        assert_eq!(result.unreachable.len(), 1);
    }

    #[tokio::test]
    async fn publish_to_unreachable_relay_reports_it() {
        let pool = RelayPool::new();
        let event = Event {
            id: "id".to_string(),
            pubkey: "pk".to_string(),
            created_at: 0,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: "sig".to_string(),
        };
        let targets = vec!["ws://192.0.2.1:1/".to_string()];
        let outcomes = pool
            .publish(&event, &targets, Duration::from_millis(200))
            .await;

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes["ws://192.0.2.1:1/"], RelayOutcome::Unreachable);
    }
}
