//! Per-item reaction votes.
//!
//! The vote logic is a pure reducer over [`ReactionRecord`]; the
//! [`ReactionStore`] only loads, reduces and writes back whole records.
//! Each voter holds at most one reaction per media item.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{ReactionError, StoreError};
use crate::media::MediaId;
use crate::store::{KeyValueStore, VOTER_ID_KEY};

/// Reactions offered on every card.
pub const DEFAULT_REACTION_KINDS: [&str; 5] = ["fire", "heart", "laugh", "wow", "down"];

const MAX_KIND_LEN: usize = 32;

/// Validated on every construction path, including decoding stored records.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReactionKind(String);

impl TryFrom<String> for ReactionKind {
    type Error = ReactionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ReactionKind> for String {
    fn from(kind: ReactionKind) -> Self {
        kind.0
    }
}

impl ReactionKind {
    pub fn parse(value: &str) -> Result<Self, ReactionError> {
        let value = value.trim();
        let valid = !value.is_empty()
            && value.len() <= MAX_KIND_LEN
            && value
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(Self(value.to_string()))
        } else {
            Err(ReactionError::InvalidKind(value.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Durable per-device pseudo-identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(String);

impl VoterId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(format!("voter_{}", URL_SAFE_NO_PAD.encode(bytes)))
    }

    /// Returns the persisted identity, creating and storing one on first use.
    /// Never rotates an existing id. If the store is unusable the generated id
    /// still serves the current session.
    pub async fn load_or_create(store: &dyn KeyValueStore) -> Self {
        match store.get(VOTER_ID_KEY).await {
            Ok(Some(existing)) if !existing.trim().is_empty() => {
                return Self(existing.trim().to_string());
            }
            Ok(_) => {}
            Err(err) => {
                // The stored identity may still exist; never overwrite it.
                warn!(%err, "voter identity unreadable, using a session identity");
                return Self::generate();
            }
        }

        let voter = Self::generate();
        if let Err(err) = store.set(VOTER_ID_KEY, voter.as_str()).await {
            warn!(%err, "could not persist voter identity");
        } else {
            debug!(voter = voter.as_str(), "created voter identity");
        }
        voter
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Vote count and voters for one reaction kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub count: usize,
    pub users: BTreeSet<String>,
}

impl<'de> Deserialize<'de> for Tally {
    /// Stored counts are not trusted: the count is rebuilt from the
    /// deduplicated voter list.
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Stored {
            #[serde(default)]
            users: Vec<String>,
        }
        let stored = Stored::deserialize(deserializer)?;
        let users: BTreeSet<String> = stored.users.into_iter().collect();
        Ok(Self {
            count: users.len(),
            users,
        })
    }
}

/// Persisted reaction state of one media item,
/// `{reactions: {kind: {count, users}}, userChoice}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionRecord {
    #[serde(default)]
    pub reactions: BTreeMap<ReactionKind, Tally>,
    /// Advisory: the choice of whoever clicked last, cleared by any
    /// retraction. A voter's own choice is always derived from the voter sets.
    #[serde(default)]
    pub user_choice: Option<ReactionKind>,
}

impl ReactionRecord {
    /// The reaction `voter` currently holds, derived from voter membership.
    pub fn vote_of(&self, voter: &VoterId) -> VoteState {
        self.reactions
            .iter()
            .find(|(_, tally)| tally.users.contains(voter.as_str()))
            .map(|(kind, _)| VoteState::Voted(kind.clone()))
            .unwrap_or(VoteState::NoVote)
    }

    pub fn count(&self, kind: &ReactionKind) -> usize {
        self.reactions.get(kind).map(|tally| tally.count).unwrap_or(0)
    }

    fn add_vote(&mut self, kind: &ReactionKind, voter: &VoterId) {
        let tally = self.reactions.entry(kind.clone()).or_default();
        if tally.users.insert(voter.as_str().to_string()) {
            tally.count = tally.users.len();
        }
    }

    fn remove_vote(&mut self, kind: &ReactionKind, voter: &VoterId) {
        if let Some(tally) = self.reactions.get_mut(kind) {
            tally.users.remove(voter.as_str());
            tally.count = tally.users.len();
            if tally.count == 0 {
                self.reactions.remove(kind);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteState {
    NoVote,
    Voted(ReactionKind),
}

/// Which edge of the vote state machine a click took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Cast(ReactionKind),
    Retracted(ReactionKind),
    Switched { from: ReactionKind, to: ReactionKind },
}

/// Applies one click on `kind` by `voter` and returns the new record.
///
/// Every membership the voter holds is cleared in the same step, so the
/// result satisfies the one-vote rule even if the input record did not.
pub fn reduce(
    record: &ReactionRecord,
    voter: &VoterId,
    kind: &ReactionKind,
) -> (ReactionRecord, Transition) {
    let transition = match record.vote_of(voter) {
        VoteState::Voted(current) if &current == kind => Transition::Retracted(current),
        VoteState::Voted(current) => Transition::Switched {
            from: current,
            to: kind.clone(),
        },
        VoteState::NoVote => Transition::Cast(kind.clone()),
    };

    let mut next = record.clone();
    let held: Vec<ReactionKind> = record
        .reactions
        .iter()
        .filter(|(_, tally)| tally.users.contains(voter.as_str()))
        .map(|(held, _)| held.clone())
        .collect();
    for held in &held {
        next.remove_vote(held, voter);
    }

    if matches!(transition, Transition::Retracted(_)) {
        next.user_choice = None;
    } else {
        next.add_vote(kind, voter);
        next.user_choice = Some(kind.clone());
    }

    (next, transition)
}

/// Counts plus the viewer's own highlighted choice, as shown on a card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionView {
    pub counts: BTreeMap<ReactionKind, usize>,
    pub mine: Option<ReactionKind>,
}

impl ReactionView {
    pub fn of(record: &ReactionRecord, voter: &VoterId) -> Self {
        Self {
            counts: record
                .reactions
                .iter()
                .map(|(kind, tally)| (kind.clone(), tally.count))
                .collect(),
            mine: match record.vote_of(voter) {
                VoteState::Voted(kind) => Some(kind),
                VoteState::NoVote => None,
            },
        }
    }
}

pub fn record_key(media: &MediaId) -> String {
    format!("reactions:{media}")
}

/// Loads, reduces and persists reaction records.
#[derive(Clone)]
pub struct ReactionStore {
    store: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl ReactionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn read(&self, media: &MediaId) -> Result<ReactionRecord, StoreError> {
        let key = record_key(media);
        let Some(raw) = self.store.get(&key).await? else {
            return Ok(ReactionRecord::default());
        };
        serde_json::from_str(&raw).map_err(|err| StoreError::Corrupt {
            key,
            reason: err.to_string(),
        })
    }

    /// Record for `media`. Unreadable or corrupt records load as empty.
    pub async fn load(&self, media: &MediaId) -> ReactionRecord {
        match self.read(media).await {
            Ok(record) => record,
            Err(err) => {
                warn!(media = %media, %err, "reaction record unreadable, showing empty counts");
                ReactionRecord::default()
            }
        }
    }

    pub async fn view(&self, media: &MediaId, voter: &VoterId) -> ReactionView {
        ReactionView::of(&self.load(media).await, voter)
    }

    /// Applies one click and writes the full updated record. On a failed write
    /// nothing is changed and the caller keeps showing its previous state.
    pub async fn click(
        &self,
        media: &MediaId,
        voter: &VoterId,
        kind: &ReactionKind,
    ) -> Result<ReactionRecord, ReactionError> {
        let _guard = self.write_lock.lock().await;
        let current = match self.read(media).await {
            Ok(record) => record,
            Err(StoreError::Corrupt { key, reason }) => {
                warn!(%key, %reason, "replacing corrupt reaction record");
                ReactionRecord::default()
            }
            Err(err) => return Err(err.into()),
        };

        let (next, transition) = reduce(&current, voter, kind);
        let payload = serde_json::to_string(&next).map_err(|err| StoreError::Corrupt {
            key: record_key(media),
            reason: err.to_string(),
        })?;
        if let Err(err) = self.store.set(&record_key(media), &payload).await {
            warn!(media = %media, %err, "reaction not saved");
            return Err(err.into());
        }
        debug!(media = %media, ?transition, "reaction recorded");
        Ok(next)
    }
}
