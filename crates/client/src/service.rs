//! High-level data services.
//!
//! The surface UI code talks to. Each fetch helper follows one flow: ask
//! the relay pool with a filter, verify everything that came back (forged
//! events are discarded, never cached, never surfaced), upsert the valid
//! raw events, then answer from the store with the same filter — so the
//! result merges cache and network in one deterministic order. The
//! subscribe variants return pool handles whose events the caller feeds
//! back through [`Chateau::ingest`].

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chateau_core::{
    APP_KIND, COMMENT_KIND, COMMUNITY_KIND, Event, EventTemplate, FORM_TEMPLATE_KIND,
    FORM_RESPONSE_KIND, FORUM_POST_KIND, PROFILE_KIND, RELEASE_KIND, AppMetadata, AppRelease,
    Community, Comment, FormTemplate, ForumPost, Profile, ZapTarget,
};
use tracing::{debug, info};

use crate::error::Result;
use crate::filter::Filter;
use crate::pool::{RelayPool, SubscriptionHandle};
use crate::publisher::{PublishResult, Publisher};
use crate::session::Session;
use crate::settings::Settings;
use crate::signer::EncryptionScheme;
use crate::store::{EventStore, LiveQuery};
use crate::zaps::Zaps;

/// Seconds since epoch, for freshly built events.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Configuration for a [`Chateau`] client.
#[derive(Debug, Clone)]
pub struct ChateauConfig {
    /// Event database path; `None` keeps the cache in memory
    pub db_path: Option<PathBuf>,
    /// Settings file path; `None` keeps settings in memory
    pub settings_path: Option<PathBuf>,
    /// Relays used when a call does not name its own
    pub relays: Vec<String>,
    /// Wall-clock bound for one-shot fetches
    pub fetch_timeout: Duration,
}

impl Default for ChateauConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            settings_path: None,
            relays: Vec::new(),
            fetch_timeout: Duration::from_secs(8),
        }
    }
}

/// The assembled client: pool, store, session, publisher, and zaps behind
/// one handle. Cheap to clone.
#[derive(Clone)]
pub struct Chateau {
    pool: RelayPool,
    store: EventStore,
    session: Session,
    publisher: Publisher,
    zaps: Zaps,
    relays: Vec<String>,
    fetch_timeout: Duration,
}

impl Chateau {
    pub fn new(config: ChateauConfig) -> Result<Self> {
        let store = match &config.db_path {
            Some(path) => EventStore::open(path)?,
            None => EventStore::open_in_memory()?,
        };
        let settings = match &config.settings_path {
            Some(path) => Settings::open(path)?,
            None => Settings::in_memory(),
        };
        let session = Session::new(settings);
        let pool = RelayPool::new();
        let publisher = Publisher::new(pool.clone(), store.clone(), session.clone());
        let zaps = Zaps::new(pool.clone(), store.clone(), session.clone())
            .fetch_timeout(config.fetch_timeout);

        Ok(Self {
            pool,
            store,
            session,
            publisher,
            zaps,
            relays: config.relays,
            fetch_timeout: config.fetch_timeout,
        })
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn zaps(&self) -> &Zaps {
        &self.zaps
    }

    fn target_relays<'a>(&'a self, relays: &'a [String]) -> &'a [String] {
        if relays.is_empty() { &self.relays } else { relays }
    }

    /// Fetch matching events from relays, verify, cache, and answer from
    /// the store. This is the shared backbone of every fetch helper.
    pub async fn fetch_and_store(&self, filter: Filter, relays: &[String]) -> Result<Vec<Event>> {
        let relays = self.target_relays(relays);
        let result = self
            .pool
            .fetch(vec![filter.clone()], relays, self.fetch_timeout)
            .await?;

        let total = result.events.len();
        let valid: Vec<Event> = result.events.into_iter().filter(|e| e.verify()).collect();
        if valid.len() < total {
            debug!("discarded {} events that failed verification", total - valid.len());
        }
        self.store.upsert(&valid)?;

        self.store.query(&filter)
    }

    /// Validate and cache externally supplied events (the page-load seed
    /// set for first paint). Returns how many were accepted.
    pub fn ingest(&self, events: Vec<Event>) -> Result<usize> {
        let total = events.len();
        let valid: Vec<Event> = events.into_iter().filter(|e| e.verify()).collect();
        if valid.len() < total {
            info!("rejected {} seed events failing verification", total - valid.len());
        }
        self.store.upsert(&valid)?;
        Ok(valid.len())
    }

    /// Reactive view over the local cache.
    pub fn live(&self, filter: Filter) -> Result<LiveQuery> {
        self.store.live_query(filter)
    }

    // ----- profiles ------------------------------------------------------

    pub async fn fetch_profile(&self, pubkey: &str, relays: &[String]) -> Result<Option<Profile>> {
        let pubkeys = [pubkey.to_string()];
        let profiles = self.fetch_profiles_batch(&pubkeys, relays).await?;
        Ok(profiles.into_iter().next())
    }

    /// One round trip for many profiles; relays answer with the latest
    /// kind-0 per author and the store keeps only the newest.
    pub async fn fetch_profiles_batch(
        &self,
        pubkeys: &[String],
        relays: &[String],
    ) -> Result<Vec<Profile>> {
        let filter = Filter::new()
            .kinds([PROFILE_KIND])
            .authors(pubkeys.iter().cloned());
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, Profile::from_event))
    }

    // ----- communities and forums ----------------------------------------

    pub async fn fetch_communities(&self, relays: &[String]) -> Result<Vec<Community>> {
        let filter = Filter::new().kinds([COMMUNITY_KIND]);
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, Community::from_event))
    }

    pub async fn subscribe_communities(&self, relays: &[String]) -> Result<SubscriptionHandle> {
        let filter = Filter::new().kinds([COMMUNITY_KIND]);
        self.pool
            .subscribe(vec![filter], self.target_relays(relays))
            .await
    }

    pub async fn fetch_community_forum_posts(
        &self,
        community_id: &str,
        relays: &[String],
    ) -> Result<Vec<ForumPost>> {
        let filter = Filter::new()
            .kinds([FORUM_POST_KIND])
            .tag("h", [community_id.to_string()]);
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, ForumPost::from_event))
    }

    pub async fn subscribe_community_forum_posts(
        &self,
        community_id: &str,
        relays: &[String],
    ) -> Result<SubscriptionHandle> {
        let filter = Filter::new()
            .kinds([FORUM_POST_KIND])
            .tag("h", [community_id.to_string()]);
        self.pool
            .subscribe(vec![filter], self.target_relays(relays))
            .await
    }

    pub async fn fetch_forum_post_comments(
        &self,
        post_id: &str,
        relays: &[String],
    ) -> Result<Vec<Comment>> {
        let filter = Filter::new()
            .kinds([COMMENT_KIND])
            .event_refs([post_id.to_string()]);
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, Comment::from_event))
    }

    pub async fn subscribe_forum_post_comments(
        &self,
        post_id: &str,
        relays: &[String],
    ) -> Result<SubscriptionHandle> {
        let filter = Filter::new()
            .kinds([COMMENT_KIND])
            .event_refs([post_id.to_string()]);
        self.pool
            .subscribe(vec![filter], self.target_relays(relays))
            .await
    }

    pub async fn publish_forum_post(
        &self,
        community_id: &str,
        title: Option<&str>,
        content: &str,
        relays: &[String],
    ) -> Result<PublishResult> {
        let mut tags = vec![vec!["h".to_string(), community_id.to_string()]];
        if let Some(title) = title {
            tags.push(vec!["title".to_string(), title.to_string()]);
        }
        let template = EventTemplate::new(FORUM_POST_KIND, tags, content, unix_now());
        self.publisher
            .publish(template, self.target_relays(relays))
            .await
    }

    pub async fn publish_comment(
        &self,
        parent_id: &str,
        root_id: Option<&str>,
        community_id: Option<&str>,
        content: &str,
        relays: &[String],
    ) -> Result<PublishResult> {
        let mut tags = vec![vec!["e".to_string(), parent_id.to_string()]];
        if let Some(root) = root_id {
            tags.push(vec!["E".to_string(), root.to_string()]);
        }
        if let Some(community) = community_id {
            tags.push(vec!["h".to_string(), community.to_string()]);
        }
        let template = EventTemplate::new(COMMENT_KIND, tags, content, unix_now());
        self.publisher
            .publish(template, self.target_relays(relays))
            .await
    }

    // ----- forms ----------------------------------------------------------

    pub async fn fetch_form_template(
        &self,
        owner: &str,
        identifier: &str,
        relays: &[String],
    ) -> Result<Option<FormTemplate>> {
        let filter = Filter::new()
            .kinds([FORM_TEMPLATE_KIND])
            .authors([owner.to_string()])
            .tag("d", [identifier.to_string()]);
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, FormTemplate::from_event).into_iter().next())
    }

    /// Answer a form. The response body is encrypted to the template owner
    /// with the versioned scheme before signing, so only the owner can read
    /// it; relays and other members see ciphertext.
    pub async fn publish_form_response(
        &self,
        template: &FormTemplate,
        answers: &serde_json::Value,
        relays: &[String],
    ) -> Result<PublishResult> {
        let plaintext = serde_json::to_string(answers)?;
        let ciphertext = self
            .session
            .encrypt(EncryptionScheme::Versioned, &template.owner, &plaintext)
            .await?;

        let address = format!(
            "{}:{}:{}",
            FORM_TEMPLATE_KIND, template.owner, template.identifier
        );
        let event_template = EventTemplate::new(
            FORM_RESPONSE_KIND,
            vec![
                vec!["a".to_string(), address],
                vec!["d".to_string(), template.identifier.clone()],
                vec!["p".to_string(), template.owner.clone()],
            ],
            ciphertext,
            unix_now(),
        );
        self.publisher
            .publish(event_template, self.target_relays(relays))
            .await
    }

    /// Decrypt a form response addressed to the active identity (the form
    /// owner reading submissions).
    pub async fn decrypt_form_response(
        &self,
        response_author: &str,
        ciphertext: &str,
    ) -> Result<serde_json::Value> {
        let plaintext = self
            .session
            .decrypt(EncryptionScheme::Versioned, response_author, ciphertext)
            .await?;
        Ok(serde_json::from_str(&plaintext)?)
    }

    // ----- apps and releases ----------------------------------------------

    pub async fn fetch_apps_by_author(
        &self,
        author: &str,
        relays: &[String],
    ) -> Result<Vec<AppMetadata>> {
        let filter = Filter::new()
            .kinds([APP_KIND])
            .authors([author.to_string()]);
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, AppMetadata::from_event))
    }

    pub async fn fetch_app(
        &self,
        author: &str,
        app_id: &str,
        relays: &[String],
    ) -> Result<Option<AppMetadata>> {
        let filter = Filter::new()
            .kinds([APP_KIND])
            .authors([author.to_string()])
            .tag("d", [app_id.to_string()]);
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, AppMetadata::from_event).into_iter().next())
    }

    /// Case-insensitive substring search over the locally cached apps. No
    /// relay round trip: search is a view over the cache.
    pub fn search_apps(&self, query: &str) -> Result<Vec<AppMetadata>> {
        let needle = query.to_lowercase();
        let events = self.store.query(&Filter::new().kinds([APP_KIND]))?;
        Ok(project(&events, AppMetadata::from_event)
            .into_iter()
            .filter(|app| {
                app.name.to_lowercase().contains(&needle)
                    || app.description.to_lowercase().contains(&needle)
                    || app.app_id.to_lowercase().contains(&needle)
            })
            .collect())
    }

    pub async fn fetch_releases(
        &self,
        author: &str,
        app_id: &str,
        relays: &[String],
    ) -> Result<Vec<AppRelease>> {
        let filter = Filter::new()
            .kinds([RELEASE_KIND])
            .authors([author.to_string()]);
        let events = self.fetch_and_store(filter, relays).await?;
        Ok(project(&events, AppRelease::from_event)
            .into_iter()
            .filter(|release| release.app_id == app_id)
            .collect())
    }

    // ----- zaps -----------------------------------------------------------

    pub async fn fetch_zaps_by_event_ids(
        &self,
        event_ids: &[String],
        relays: &[String],
    ) -> Result<crate::zaps::ZapTotals> {
        self.zaps
            .fetch_zaps_by_event_ids(event_ids, self.target_relays(relays))
            .await
    }

    pub async fn create_zap_request(
        &self,
        target: &ZapTarget,
        amount_msats: u64,
        comment: &str,
    ) -> Result<Event> {
        self.zaps
            .create_zap_request(target, amount_msats, comment, &self.relays, unix_now())
            .await
    }
}

/// Project events through a decoder, keeping the ones that parse. A failed
/// projection is non-fatal: the raw event stays cached, only this view
/// omits it.
fn project<T, E: std::fmt::Display>(
    events: &[Event],
    decode: impl Fn(&Event) -> std::result::Result<T, E>,
) -> Vec<T> {
    let mut records = Vec::with_capacity(events.len());
    for event in events {
        match decode(event) {
            Ok(record) => records.push(record),
            Err(e) => debug!("event {} excluded from projection: {e}", event.id),
        }
    }
    records
}
