//! Semantic projections over validated events.
//!
//! Each record type is a pure view: given an already-verified event of the
//! right kind, extract structured fields from tags and content. Projection
//! failure names the missing field so callers can keep the raw event and
//! render a degraded view instead of dropping data.
//!
//! Dispatch is closed: [`decode_record`] maps kind to decoder and fails with
//! [`ModelError::UnknownKind`] for everything else, rather than partially
//! decoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::nip01::Event;
use crate::nip57::{Nip57Error, ZAP_RECEIPT_KIND, ZapReceipt};

/// User profile metadata (replaceable).
pub const PROFILE_KIND: u16 = 0;
/// Community forum post.
pub const FORUM_POST_KIND: u16 = 11;
/// File metadata for a release artifact.
pub const FILE_METADATA_KIND: u16 = 1063;
/// Threaded comment on another event.
pub const COMMENT_KIND: u16 = 1111;
/// Community descriptor (replaceable; the community id is its owner pubkey).
pub const COMMUNITY_KIND: u16 = 10222;
/// Curated list of member pubkeys.
pub const PROFILE_LIST_KIND: u16 = 30000;
/// App release, identified by `appid@version`.
pub const RELEASE_KIND: u16 = 30063;
/// Community form template.
pub const FORM_TEMPLATE_KIND: u16 = 30168;
/// Form response, content encrypted to the template owner.
pub const FORM_RESPONSE_KIND: u16 = 30169;
/// Curated stack of apps.
pub const APP_STACK_KIND: u16 = 30267;
/// App metadata, identified by reverse-domain app id.
pub const APP_KIND: u16 = 32267;

/// Errors raised by semantic projection. These are non-fatal to caching:
/// the raw event stays cache-eligible, only the projection is withheld.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("unknown kind: {0}")]
    UnknownKind(u16),

    #[error("wrong kind: expected {expected}, got {got}")]
    WrongKind { expected: u16, got: u16 },

    #[error("missing required tag: {0}")]
    MissingTag(&'static str),

    #[error("malformed content: {0}")]
    MalformedContent(String),

    #[error(transparent)]
    Zap(#[from] Nip57Error),
}

fn expect_kind(event: &Event, expected: u16) -> Result<(), ModelError> {
    if event.kind != expected {
        return Err(ModelError::WrongKind {
            expected,
            got: event.kind,
        });
    }
    Ok(())
}

fn require_tag(event: &Event, name: &'static str) -> Result<String, ModelError> {
    event
        .tag_value(name)
        .map(|s| s.to_string())
        .ok_or(ModelError::MissingTag(name))
}

/// A user profile (kind 0). Fields live in the content as a JSON object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub pubkey: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub nip05: Option<String>,
    /// Lightning address used to resolve the zap endpoint
    pub lud16: Option<String>,
    pub created_at: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ProfileContent {
    name: Option<String>,
    display_name: Option<String>,
    about: Option<String>,
    picture: Option<String>,
    nip05: Option<String>,
    lud16: Option<String>,
}

impl Profile {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, PROFILE_KIND)?;
        let content: ProfileContent = if event.content.is_empty() {
            ProfileContent::default()
        } else {
            serde_json::from_str(&event.content)
                .map_err(|e| ModelError::MalformedContent(e.to_string()))?
        };
        Ok(Self {
            pubkey: event.pubkey.clone(),
            name: content.name,
            display_name: content.display_name,
            about: content.about,
            picture: content.picture,
            nip05: content.nip05,
            lud16: content.lud16,
            created_at: event.created_at,
        })
    }

    /// Best display string: display_name, then name, then a pubkey prefix.
    pub fn display(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.name.clone())
            .unwrap_or_else(|| self.pubkey.chars().take(8).collect())
    }
}

/// A community descriptor (kind 10222). Replaceable: the community is
/// identified by its owner pubkey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Community {
    /// Owner pubkey, doubling as the community id
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub image: Option<String>,
    /// Relays the community's content lives on (`r` tags)
    pub relays: Vec<String>,
    pub created_at: u64,
}

impl Community {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, COMMUNITY_KIND)?;
        Ok(Self {
            id: event.pubkey.clone(),
            name: require_tag(event, "name")?,
            description: event
                .tag_value("description")
                .map(|s| s.to_string())
                .or_else(|| (!event.content.is_empty()).then(|| event.content.clone())),
            image: event.tag_value("image").map(|s| s.to_string()),
            relays: event.tag_values("r").map(|s| s.to_string()).collect(),
            created_at: event.created_at,
        })
    }
}

/// A forum post inside a community (kind 11). The `h` tag carries the
/// community it belongs to; without it the post is not addressable to any
/// forum and the projection fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumPost {
    pub id: String,
    pub author: String,
    pub community_id: String,
    pub title: Option<String>,
    pub content: String,
    pub created_at: u64,
}

impl ForumPost {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, FORUM_POST_KIND)?;
        Ok(Self {
            id: event.id.clone(),
            author: event.pubkey.clone(),
            community_id: require_tag(event, "h")?,
            title: event.tag_value("title").map(|s| s.to_string()),
            content: event.content.clone(),
            created_at: event.created_at,
        })
    }
}

/// A threaded comment (kind 1111). `e` names the direct parent; `E` the
/// thread root when the comment is nested deeper than one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: String,
    pub parent_id: String,
    pub root_id: Option<String>,
    pub community_id: Option<String>,
    pub content: String,
    pub created_at: u64,
}

impl Comment {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, COMMENT_KIND)?;
        Ok(Self {
            id: event.id.clone(),
            author: event.pubkey.clone(),
            parent_id: require_tag(event, "e")?,
            root_id: event.tag_value("E").map(|s| s.to_string()),
            community_id: event.tag_value("h").map(|s| s.to_string()),
            content: event.content.clone(),
            created_at: event.created_at,
        })
    }
}

/// One field of a form template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormField {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// A community form template (kind 30168, addressable by `d` tag). The
/// content holds the field definitions as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormTemplate {
    pub identifier: String,
    pub owner: String,
    pub name: Option<String>,
    pub fields: Vec<FormField>,
    pub created_at: u64,
}

impl FormTemplate {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, FORM_TEMPLATE_KIND)?;
        let fields: Vec<FormField> = if event.content.is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&event.content)
                .map_err(|e| ModelError::MalformedContent(e.to_string()))?
        };
        Ok(Self {
            identifier: require_tag(event, "d")?,
            owner: event.pubkey.clone(),
            name: event.tag_value("name").map(|s| s.to_string()),
            fields,
            created_at: event.created_at,
        })
    }
}

/// A form response (kind 30169). The content stays ciphertext here: it is
/// addressed to the template owner and decrypting is the client's job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormResponse {
    pub id: String,
    pub author: String,
    /// Address of the template this answers (`a` tag, `kind:owner:d`)
    pub template_address: String,
    pub ciphertext: String,
    pub created_at: u64,
}

impl FormResponse {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, FORM_RESPONSE_KIND)?;
        Ok(Self {
            id: event.id.clone(),
            author: event.pubkey.clone(),
            template_address: require_tag(event, "a")?,
            ciphertext: event.content.clone(),
            created_at: event.created_at,
        })
    }
}

/// App metadata (kind 32267, addressable by reverse-domain app id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMetadata {
    /// Reverse-domain app id (`d` tag)
    pub app_id: String,
    pub author: String,
    pub name: String,
    pub description: String,
    pub repository: Option<String>,
    pub icon: Option<String>,
    pub url: Option<String>,
    pub created_at: u64,
}

impl AppMetadata {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, APP_KIND)?;
        Ok(Self {
            app_id: require_tag(event, "d")?,
            author: event.pubkey.clone(),
            name: require_tag(event, "name")?,
            description: event.content.clone(),
            repository: event.tag_value("repository").map(|s| s.to_string()),
            icon: event.tag_value("icon").map(|s| s.to_string()),
            url: event.tag_value("url").map(|s| s.to_string()),
            created_at: event.created_at,
        })
    }
}

/// An app release (kind 30063). Identified by `appid@version`; the `e` tags
/// reference file-metadata events for the artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRelease {
    pub app_id: String,
    pub version: String,
    pub notes: String,
    pub file_refs: Vec<String>,
    pub created_at: u64,
}

impl AppRelease {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, RELEASE_KIND)?;
        let identifier = require_tag(event, "d")?;
        let (app_id, version) = identifier.split_once('@').ok_or_else(|| {
            ModelError::MalformedContent(format!("release identifier '{identifier}' lacks '@'"))
        })?;
        Ok(Self {
            app_id: app_id.to_string(),
            version: version.to_string(),
            notes: event.content.clone(),
            file_refs: event.tag_values("e").map(|s| s.to_string()).collect(),
            created_at: event.created_at,
        })
    }
}

/// File metadata for a release artifact (kind 1063).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub id: String,
    pub url: String,
    pub mime_type: Option<String>,
    pub sha256: Option<String>,
    pub size: Option<u64>,
    pub created_at: u64,
}

impl FileMetadata {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, FILE_METADATA_KIND)?;
        Ok(Self {
            id: event.id.clone(),
            url: require_tag(event, "url")?,
            mime_type: event.tag_value("m").map(|s| s.to_string()),
            sha256: event.tag_value("x").map(|s| s.to_string()),
            size: event.tag_value("size").and_then(|s| s.parse().ok()),
            created_at: event.created_at,
        })
    }
}

/// A curated stack of apps (kind 30267): `a` tags address app metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppStack {
    pub identifier: String,
    pub author: String,
    pub name: Option<String>,
    pub app_addresses: Vec<String>,
    pub created_at: u64,
}

impl AppStack {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, APP_STACK_KIND)?;
        Ok(Self {
            identifier: require_tag(event, "d")?,
            author: event.pubkey.clone(),
            name: event.tag_value("name").map(|s| s.to_string()),
            app_addresses: event.tag_values("a").map(|s| s.to_string()).collect(),
            created_at: event.created_at,
        })
    }
}

/// A curated list of member pubkeys (kind 30000).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileList {
    pub identifier: String,
    pub author: String,
    pub members: Vec<String>,
    pub created_at: u64,
}

impl ProfileList {
    pub fn from_event(event: &Event) -> Result<Self, ModelError> {
        expect_kind(event, PROFILE_LIST_KIND)?;
        Ok(Self {
            identifier: require_tag(event, "d")?,
            author: event.pubkey.clone(),
            members: event.tag_values("p").map(|s| s.to_string()).collect(),
            created_at: event.created_at,
        })
    }
}

/// The closed union of semantic records this application understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Profile(Profile),
    Community(Community),
    ForumPost(ForumPost),
    Comment(Comment),
    FormTemplate(FormTemplate),
    FormResponse(FormResponse),
    App(AppMetadata),
    Release(AppRelease),
    FileMetadata(FileMetadata),
    AppStack(AppStack),
    ProfileList(ProfileList),
    ZapReceipt(ZapReceipt),
}

/// Decode an event into its semantic record. The event must already have
/// passed [`Event::verify`]; decoding a forged event is never attempted by
/// callers that follow the validate-then-decode rule.
pub fn decode_record(event: &Event) -> Result<Record, ModelError> {
    match event.kind {
        PROFILE_KIND => Profile::from_event(event).map(Record::Profile),
        COMMUNITY_KIND => Community::from_event(event).map(Record::Community),
        FORUM_POST_KIND => ForumPost::from_event(event).map(Record::ForumPost),
        COMMENT_KIND => Comment::from_event(event).map(Record::Comment),
        FORM_TEMPLATE_KIND => FormTemplate::from_event(event).map(Record::FormTemplate),
        FORM_RESPONSE_KIND => FormResponse::from_event(event).map(Record::FormResponse),
        APP_KIND => AppMetadata::from_event(event).map(Record::App),
        RELEASE_KIND => AppRelease::from_event(event).map(Record::Release),
        FILE_METADATA_KIND => FileMetadata::from_event(event).map(Record::FileMetadata),
        APP_STACK_KIND => AppStack::from_event(event).map(Record::AppStack),
        PROFILE_LIST_KIND => ProfileList::from_event(event).map(Record::ProfileList),
        ZAP_RECEIPT_KIND => Ok(Record::ZapReceipt(ZapReceipt::from_event(event)?)),
        other => Err(ModelError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip01::{EventTemplate, generate_secret_key};

    fn signed(kind: u16, tags: Vec<Vec<String>>, content: &str) -> Event {
        EventTemplate::new(kind, tags, content, 1700000000)
            .sign(&generate_secret_key())
            .unwrap()
    }

    fn tag(name: &str, value: &str) -> Vec<String> {
        vec![name.to_string(), value.to_string()]
    }

    #[test]
    fn profile_decodes_json_content() {
        let event = signed(
            PROFILE_KIND,
            vec![],
            r#"{"name":"fiatjaf","about":"buy my book","lud16":"pay@example.com"}"#,
        );
        let profile = Profile::from_event(&event).unwrap();
        assert_eq!(profile.name.as_deref(), Some("fiatjaf"));
        assert_eq!(profile.lud16.as_deref(), Some("pay@example.com"));
        assert_eq!(profile.display(), "fiatjaf");
    }

    #[test]
    fn profile_malformed_content_fails_but_event_stays_valid() {
        let event = signed(PROFILE_KIND, vec![], "not json");
        assert!(event.verify());
        assert!(matches!(
            Profile::from_event(&event),
            Err(ModelError::MalformedContent(_))
        ));
    }

    #[test]
    fn community_requires_name() {
        let good = signed(
            COMMUNITY_KIND,
            vec![tag("name", "rustaceans"), tag("r", "wss://relay.example.com")],
            "a place for crab people",
        );
        let community = Community::from_event(&good).unwrap();
        assert_eq!(community.name, "rustaceans");
        assert_eq!(community.id, good.pubkey);
        assert_eq!(community.relays, vec!["wss://relay.example.com"]);
        assert_eq!(community.description.as_deref(), Some("a place for crab people"));

        let bad = signed(COMMUNITY_KIND, vec![], "");
        assert!(matches!(
            Community::from_event(&bad),
            Err(ModelError::MissingTag("name"))
        ));
    }

    #[test]
    fn forum_post_extracts_community_reference() {
        let event = signed(
            FORUM_POST_KIND,
            vec![tag("h", "communityX"), tag("title", "hello")],
            "first post",
        );
        let post = ForumPost::from_event(&event).unwrap();
        assert_eq!(post.community_id, "communityX");
        assert_eq!(post.title.as_deref(), Some("hello"));
    }

    #[test]
    fn forum_post_without_community_tag_is_field_specific_error() {
        // The event is authentic; only the projection is withheld.
        let event = signed(FORUM_POST_KIND, vec![tag("title", "hello")], "first post");
        assert!(event.verify());
        assert!(matches!(
            ForumPost::from_event(&event),
            Err(ModelError::MissingTag("h"))
        ));
    }

    #[test]
    fn comment_requires_parent() {
        let good = signed(
            COMMENT_KIND,
            vec![tag("e", "parent-id"), tag("E", "root-id")],
            "nice",
        );
        let comment = Comment::from_event(&good).unwrap();
        assert_eq!(comment.parent_id, "parent-id");
        assert_eq!(comment.root_id.as_deref(), Some("root-id"));

        let bad = signed(COMMENT_KIND, vec![], "orphan");
        assert!(matches!(
            Comment::from_event(&bad),
            Err(ModelError::MissingTag("e"))
        ));
    }

    #[test]
    fn form_template_parses_fields() {
        let event = signed(
            FORM_TEMPLATE_KIND,
            vec![tag("d", "join-request"), tag("name", "Join us")],
            r#"[{"name":"email","label":"Email","required":true},{"name":"why"}]"#,
        );
        let template = FormTemplate::from_event(&event).unwrap();
        assert_eq!(template.identifier, "join-request");
        assert_eq!(template.fields.len(), 2);
        assert!(template.fields[0].required);
        assert!(!template.fields[1].required);
    }

    #[test]
    fn form_response_keeps_ciphertext_opaque() {
        let event = signed(
            FORM_RESPONSE_KIND,
            vec![tag("a", "30168:owner:join-request")],
            "AnMGzz...ciphertext",
        );
        let response = FormResponse::from_event(&event).unwrap();
        assert_eq!(response.template_address, "30168:owner:join-request");
        assert_eq!(response.ciphertext, "AnMGzz...ciphertext");
    }

    #[test]
    fn app_and_release_projections() {
        let app = signed(
            APP_KIND,
            vec![
                tag("d", "com.example.app"),
                tag("name", "Example"),
                tag("repository", "https://github.com/example/app"),
            ],
            "An example application",
        );
        let meta = AppMetadata::from_event(&app).unwrap();
        assert_eq!(meta.app_id, "com.example.app");
        assert_eq!(meta.name, "Example");

        let release = signed(
            RELEASE_KIND,
            vec![tag("d", "com.example.app@1.2.0"), tag("e", "file-ev-id")],
            "bug fixes",
        );
        let rel = AppRelease::from_event(&release).unwrap();
        assert_eq!(rel.app_id, "com.example.app");
        assert_eq!(rel.version, "1.2.0");
        assert_eq!(rel.file_refs, vec!["file-ev-id"]);

        let bad = signed(RELEASE_KIND, vec![tag("d", "no-version")], "");
        assert!(matches!(
            AppRelease::from_event(&bad),
            Err(ModelError::MalformedContent(_))
        ));
    }

    #[test]
    fn file_metadata_requires_url() {
        let good = signed(
            FILE_METADATA_KIND,
            vec![
                tag("url", "https://cdn.example.com/app.apk"),
                tag("m", "application/vnd.android.package-archive"),
                tag("x", "deadbeef"),
                tag("size", "123456"),
            ],
            "",
        );
        let file = FileMetadata::from_event(&good).unwrap();
        assert_eq!(file.size, Some(123456));

        let bad = signed(FILE_METADATA_KIND, vec![], "");
        assert!(matches!(
            FileMetadata::from_event(&bad),
            Err(ModelError::MissingTag("url"))
        ));
    }

    #[test]
    fn profile_list_collects_members() {
        let event = signed(
            PROFILE_LIST_KIND,
            vec![tag("d", "moderators"), tag("p", "alice"), tag("p", "bob")],
            "",
        );
        let list = ProfileList::from_event(&event).unwrap();
        assert_eq!(list.members, vec!["alice", "bob"]);
    }

    #[test]
    fn dispatch_is_closed() {
        let event = signed(4242, vec![], "mystery");
        assert!(matches!(
            decode_record(&event),
            Err(ModelError::UnknownKind(4242))
        ));

        let post = signed(FORUM_POST_KIND, vec![tag("h", "c1")], "hi");
        assert!(matches!(
            decode_record(&post),
            Ok(Record::ForumPost(p)) if p.community_id == "c1"
        ));
    }
}
