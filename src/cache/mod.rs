//! The two-tier answer cache.
//!
//! Tier one is a small LRU of complete answers served recently: the
//! head is the eviction candidate, the tail the most recently used
//! entry.  Tier two is the authoritative map, an ordered map from a
//! hash of the owner name to the bundles stored under it; it holds
//! both answers learned from the upstream resolver and the permanent
//! hosts-table records.
//!
//! Expiry is lazy: expired bundles are dropped when a lookup walks
//! past them, and a map bucket emptied that way is removed outright.
//! Hosts-table bundles carry `Expiry::Never` and so are never dropped.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::hosts::{HostEntry, HostTarget};
use crate::protocol::wire_types::*;

/// How many answers the LRU tier holds.
pub const CACHE_SIZE: usize = 300;

/// How many bundles a single map bucket may hold (hash collisions
/// plus multiple query types for one name).  The oldest entry is
/// dropped past this, so the authoritative map cannot grow without
/// bound under learned traffic.
const BUCKET_MAX_LEN: usize = 8;

/// TTL served for records that never expire, as a 32-bit value.
pub const NEVER_TTL: u32 = u32::MAX;

/// When a cached bundle stops being served.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Expiry {
    /// Hosts-table entries: never dropped.
    Never,
    At(Instant),
}

impl Expiry {
    pub fn is_expired(&self, now: Instant) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(when) => *when <= now,
        }
    }
}

/// Which questions a bundle answers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum BundleKind {
    /// A pollution shield: matches every query type, and the match is
    /// answered with `NXDOMAIN` rather than with records.
    Shield,
    /// An ordinary answer for one query type.
    Typed(QueryType),
}

/// One complete answer payload for a given question: every record of
/// the reply it was built from, section by section.  The serialised
/// counts are derived from the section lengths, so they cannot drift
/// from the records actually held.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RecordBundle {
    /// The owner name of the first record (the name the bundle is
    /// filed under).
    pub name: DomainName,
    pub kind: BundleKind,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
    pub expires: Expiry,
}

impl RecordBundle {
    pub fn is_shield(&self) -> bool {
        self.kind == BundleKind::Shield
    }

    fn matches(&self, question: &Question) -> bool {
        self.name == question.name
            && match self.kind {
                BundleKind::Shield => true,
                BundleKind::Typed(qtype) => qtype == question.qtype,
            }
    }
}

impl From<&HostEntry> for RecordBundle {
    fn from(entry: &HostEntry) -> Self {
        let (kind, answers) = match &entry.target {
            HostTarget::Shield => (BundleKind::Shield, Vec::new()),
            HostTarget::V4(address) => (
                BundleKind::Typed(QueryType::Record(RecordType::A)),
                vec![ResourceRecord {
                    name: entry.name.clone(),
                    rtype_with_data: RecordTypeWithData::A { address: *address },
                    rclass: RecordClass::IN,
                    ttl: NEVER_TTL,
                }],
            ),
            HostTarget::V6(address) => (
                BundleKind::Typed(QueryType::Record(RecordType::AAAA)),
                vec![ResourceRecord {
                    name: entry.name.clone(),
                    rtype_with_data: RecordTypeWithData::AAAA { address: *address },
                    rclass: RecordClass::IN,
                    ttl: NEVER_TTL,
                }],
            ),
        };

        Self {
            name: entry.name.clone(),
            kind,
            answers,
            authority: Vec::new(),
            additional: Vec::new(),
            expires: Expiry::Never,
        }
    }
}

/// The cache itself.
#[derive(Debug, Clone)]
pub struct Cache {
    /// LRU of recently served answers: head evicts first, tail is the
    /// most recently used.
    recent: VecDeque<RecordBundle>,

    /// The authoritative map, keyed by `bkdr_hash` of the owner name.
    authoritative: BTreeMap<u32, Vec<RecordBundle>>,

    /// Bound on `recent.len()`.
    capacity: usize,
}

impl Cache {
    pub fn new(hosts: impl IntoIterator<Item = HostEntry>) -> Self {
        Self::with_capacity(CACHE_SIZE, hosts)
    }

    pub fn with_capacity(capacity: usize, hosts: impl IntoIterator<Item = HostEntry>) -> Self {
        let mut authoritative: BTreeMap<u32, Vec<RecordBundle>> = BTreeMap::new();
        for entry in hosts {
            authoritative
                .entry(bkdr_hash(&entry.name))
                .or_default()
                .push(RecordBundle::from(&entry));
        }

        Self {
            recent: VecDeque::with_capacity(capacity),
            authoritative,
            capacity,
        }
    }

    /// Store a reply in both tiers.  The bundle expires when the
    /// shortest-lived record in the reply does.
    ///
    /// Replies without a question or without any records are not
    /// cacheable and are ignored.
    pub fn insert(&mut self, message: &Message) {
        let Some(question) = message.questions.first() else {
            return;
        };
        let Some(first_rr) = message
            .answers
            .first()
            .or_else(|| message.authority.first())
            .or_else(|| message.additional.first())
        else {
            return;
        };

        let ttl = min_ttl(message);
        let bundle = RecordBundle {
            name: first_rr.name.clone(),
            kind: BundleKind::Typed(question.qtype),
            answers: message.answers.clone(),
            authority: message.authority.clone(),
            additional: message.additional.clone(),
            expires: Expiry::At(Instant::now() + Duration::from_secs(ttl.into())),
        };

        self.push_recent(bundle.clone());

        let bucket = self.authoritative.entry(bkdr_hash(&bundle.name)).or_default();
        bucket.push(bundle);
        if bucket.len() > BUCKET_MAX_LEN {
            bucket.remove(0);
        }
    }

    /// Look a question up, LRU tier first.  An LRU hit moves the
    /// bundle to the tail; a map hit installs a copy at the tail.
    /// Expired bundles encountered on the way are dropped.
    ///
    /// The returned bundle is a copy: mutating it does not affect the
    /// cache.
    pub fn query(&mut self, question: &Question) -> Option<RecordBundle> {
        let now = Instant::now();

        self.recent.retain(|bundle| !bundle.expires.is_expired(now));
        if let Some(i) = self
            .recent
            .iter()
            .position(|bundle| bundle.matches(question))
        {
            let bundle = self.recent.remove(i)?;
            let copy = bundle.clone();
            self.recent.push_back(bundle);
            tracing::debug!(%question, "cache HIT (recent)");
            return Some(copy);
        }

        let key = bkdr_hash(&question.name);
        if let Some(bucket) = self.authoritative.get_mut(&key) {
            bucket.retain(|bundle| !bundle.expires.is_expired(now));
            let found = bucket.iter().find(|bundle| bundle.matches(question)).cloned();
            if bucket.is_empty() {
                self.authoritative.remove(&key);
            }
            if let Some(bundle) = found {
                tracing::debug!(%question, "cache HIT (authoritative)");
                self.push_recent(bundle.clone());
                return Some(bundle);
            }
        }

        tracing::debug!(%question, "cache MISS");
        None
    }

    /// Append at the LRU tail, evicting the head if the tier is full.
    fn push_recent(&mut self, bundle: RecordBundle) {
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(bundle);
    }
}

/// BKDR hash of a domain name, over its dotted representation.
fn bkdr_hash(name: &DomainName) -> u32 {
    let mut hash: u32 = 0;
    for label in &name.labels {
        for octet in label {
            hash = hash.wrapping_mul(131).wrapping_add(u32::from(*octet));
        }
        if !label.is_empty() {
            hash = hash.wrapping_mul(131).wrapping_add(u32::from(b'.'));
        }
    }
    hash & 0x7FFF_FFFF
}

/// The minimum TTL across every record of the message.
fn min_ttl(message: &Message) -> u32 {
    message
        .answers
        .iter()
        .chain(message.authority.iter())
        .chain(message.additional.iter())
        .map(|rr| rr.ttl)
        .min()
        .unwrap_or(0)
}
