//! The iterative lookup engine: one transaction per chain, stepping
//! through progressively XOR-closer peers.
use std::collections::HashSet;

use flume::Sender;
use tracing::debug;

use crate::common::messages::{FindIntro, FindRouter, GotIntro, GotRouter, IntroTarget, Message};
use crate::common::{IntroSet, Key, LookupTarget, PathId, RouterContact, RouterId, ServiceAddress, Tag};

use super::holder::TxOwner;
use super::Env;

/// Where a transaction's terminal reply goes.
///
/// The original asker is either a remote peer (the reply travels as a DHT
/// message), one of our own onion paths, or an in-process consumer.
pub(crate) enum Reply<V> {
    /// Send a DHT message back to `whoasked`.
    Remote,
    /// Deliver on a local path, keyed by `whoasked.txid`.
    Path(PathId),
    /// Hand the values to an in-process receiver. `None` means the caller
    /// only wants the side effects of the lookup.
    Local(Option<Sender<Vec<V>>>),
}

/// The capability set of one lookup kind: how to validate a value, build
/// the wire request, choose the next peer, and deliver the terminal reply.
pub(crate) trait LookupKind {
    type Target: LookupTarget;
    type Value: Clone;

    fn validate(&self, env: &Env, target: &Self::Target, value: &Self::Value) -> bool;

    fn request(&self, target: &Self::Target, txid: u64) -> Message;

    fn next_peer(&self, env: &Env, target: &Self::Target, exclude: &HashSet<Key>) -> Option<Key>;

    fn reply(&mut self, env: &mut Env, whoasked: &TxOwner, target: &Self::Target, values: &[Self::Value]);
}

/// An in-flight lookup.
pub(crate) struct Tx<L: LookupKind> {
    pub target: L::Target,
    pub whoasked: TxOwner,
    pub peers_asked: HashSet<Key>,
    pub values_found: Vec<L::Value>,
    pub kind: L,
}

impl<L: LookupKind> Tx<L> {
    pub fn new(target: L::Target, whoasked: TxOwner, kind: L) -> Self {
        Self {
            target,
            whoasked,
            peers_asked: HashSet::new(),
            values_found: Vec::new(),
            kind,
        }
    }

    /// A transaction pre-seeded with locally known values, so the terminal
    /// reply includes them alongside whatever the network returns.
    pub fn with_values(target: L::Target, whoasked: TxOwner, kind: L, values: Vec<L::Value>) -> Self {
        Self {
            values_found: values,
            ..Self::new(target, whoasked, kind)
        }
    }

    /// Record a reply value from `asked_peer`, keeping it only if it
    /// validates for this lookup.
    pub fn on_found(&mut self, env: &Env, asked_peer: Key, value: &L::Value) {
        self.peers_asked.insert(asked_peer);
        if self.kind.validate(env, &self.target, value) {
            self.values_found.push(value.clone());
        } else {
            debug!(lookup = ?self.target, "discarding reply value that failed validation");
        }
    }

    /// Choose the peer for the next hop: the explicit hint if one was
    /// given, otherwise the closest unasked table entry. Returns `None`
    /// when the chain must terminate, either exhausted or because the
    /// candidate is no closer to the target than the peer that just
    /// answered.
    pub fn ask_next_peer(&mut self, env: &Env, prev_peer: Key, next: Option<Key>) -> Option<Key> {
        self.peers_asked.insert(prev_peer);

        let peer = match next {
            Some(peer) => peer,
            None => match self.kind.next_peer(env, &self.target, &self.peers_asked) {
                Some(peer) => peer,
                None => {
                    debug!(lookup = ?self.target, "no more peers for lookup");
                    return None;
                }
            },
        };

        let target_key = self.target.dht_key();
        if (prev_peer ^ target_key) < (peer ^ target_key) {
            debug!(lookup = ?self.target, ?peer, ?prev_peer, "next peer is not closer to target");
            return None;
        }

        self.peers_asked.insert(peer);
        Some(peer)
    }

    /// Deliver the terminal reply. Called exactly once per transaction.
    pub fn send_reply(&mut self, env: &mut Env) {
        let values = std::mem::take(&mut self.values_found);
        self.kind.reply(env, &self.whoasked, &self.target, &values);
    }
}

// === Router lookups ===

/// Resolve a [RouterContact] by identity key.
pub(crate) struct RouterLookup {
    pub reply: Reply<RouterContact>,
}

impl LookupKind for RouterLookup {
    type Target = RouterId;
    type Value = RouterContact;

    fn validate(&self, env: &Env, target: &RouterId, value: &RouterContact) -> bool {
        value.id == *target && !value.is_expired(env.now)
    }

    fn request(&self, target: &RouterId, txid: u64) -> Message {
        Message::FindRouter(FindRouter {
            txid,
            target: *target,
            iterative: false,
            exploratory: false,
        })
    }

    fn next_peer(&self, env: &Env, target: &RouterId, exclude: &HashSet<Key>) -> Option<Key> {
        env.nodes.find_many(target.dht_key(), 1, exclude).first().copied()
    }

    fn reply(&mut self, env: &mut Env, whoasked: &TxOwner, _target: &RouterId, values: &[RouterContact]) {
        // at most one contact goes back to the asker
        let contacts: Vec<RouterContact> = values.iter().take(1).cloned().collect();

        match &self.reply {
            Reply::Remote => {
                let msg = Message::GotRouter(GotRouter {
                    txid: whoasked.txid,
                    contacts,
                    near: Vec::new(),
                    closer: None,
                });
                env.send(whoasked.peer, msg, false);
            }
            Reply::Path(path) => {
                let msg = Message::GotRouter(GotRouter {
                    txid: whoasked.txid,
                    contacts,
                    near: Vec::new(),
                    closer: None,
                });
                env.deliver(*path, msg);
            }
            Reply::Local(sender) => {
                if let Some(sender) = sender {
                    let _ = sender.send(contacts);
                }
            }
        }
    }
}

// === IntroSet lookups ===

/// Resolve the [IntroSet] stored at a service address.
pub(crate) struct IntroSetLookup {
    pub reply: Reply<IntroSet>,
    /// Recursion budget embedded in every request of this chain.
    pub recursion: u64,
}

impl LookupKind for IntroSetLookup {
    type Target = ServiceAddress;
    type Value = IntroSet;

    fn validate(&self, env: &Env, target: &ServiceAddress, value: &IntroSet) -> bool {
        value.address == *target && !value.is_expired(env.now)
    }

    fn request(&self, target: &ServiceAddress, txid: u64) -> Message {
        Message::FindIntro(FindIntro {
            txid,
            target: IntroTarget::Address(*target),
            recursion: self.recursion,
        })
    }

    fn next_peer(&self, env: &Env, target: &ServiceAddress, exclude: &HashSet<Key>) -> Option<Key> {
        env.nodes.find_many(target.dht_key(), 1, exclude).first().copied()
    }

    fn reply(&mut self, env: &mut Env, whoasked: &TxOwner, _target: &ServiceAddress, values: &[IntroSet]) {
        let introsets = dedup_introsets(values, usize::MAX);

        deliver_introsets(env, &self.reply, whoasked, introsets);
    }
}

// === Tag lookups ===

/// Resolve introduction sets advertising a topic tag.
pub(crate) struct TagLookup {
    pub reply: Reply<IntroSet>,
    /// Recursion budget embedded in every request of this chain.
    pub recursion: u64,
    /// Upper bound on the introduction sets one reply carries.
    pub result_limit: usize,
}

impl LookupKind for TagLookup {
    type Target = Tag;
    type Value = IntroSet;

    fn validate(&self, env: &Env, target: &Tag, value: &IntroSet) -> bool {
        value.advertises(target) && !value.is_expired(env.now)
    }

    fn request(&self, target: &Tag, txid: u64) -> Message {
        Message::FindIntro(FindIntro {
            txid,
            target: IntroTarget::Tag(*target),
            recursion: self.recursion,
        })
    }

    fn next_peer(&self, env: &Env, target: &Tag, exclude: &HashSet<Key>) -> Option<Key> {
        env.nodes.find_many(target.dht_key(), 1, exclude).first().copied()
    }

    fn reply(&mut self, env: &mut Env, whoasked: &TxOwner, _target: &Tag, values: &[IntroSet]) {
        let introsets = dedup_introsets(values, self.result_limit);

        deliver_introsets(env, &self.reply, whoasked, introsets);
    }
}

/// Dedup by (address, timestamp) keeping first occurrence, bounded by `limit`.
fn dedup_introsets(values: &[IntroSet], limit: usize) -> Vec<IntroSet> {
    let mut seen = HashSet::new();

    values
        .iter()
        .filter(|introset| seen.insert((introset.address, introset.timestamp_ms)))
        .take(limit)
        .cloned()
        .collect()
}

fn deliver_introsets(env: &mut Env, reply: &Reply<IntroSet>, whoasked: &TxOwner, introsets: Vec<IntroSet>) {
    match reply {
        Reply::Remote => {
            let msg = Message::GotIntro(GotIntro {
                txid: whoasked.txid,
                introsets,
                closer: None,
            });
            env.send(whoasked.peer, msg, false);
        }
        Reply::Path(path) => {
            let msg = Message::GotIntro(GotIntro {
                txid: whoasked.txid,
                introsets,
                closer: None,
            });
            env.deliver(*path, msg);
        }
        Reply::Local(sender) => {
            if let Some(sender) = sender {
                let _ = sender.send(introsets);
            }
        }
    }
}

// === Exploration ===

/// Discover identities near a random target. The values are not delivered
/// anywhere; unknown ones are queued for follow-up router lookups.
pub(crate) struct ExploreLookup;

impl LookupKind for ExploreLookup {
    type Target = RouterId;
    type Value = RouterId;

    fn validate(&self, env: &Env, _target: &RouterId, value: &RouterId) -> bool {
        *value != env.our_key
    }

    fn request(&self, target: &RouterId, txid: u64) -> Message {
        Message::FindRouter(FindRouter {
            txid,
            target: *target,
            iterative: false,
            exploratory: true,
        })
    }

    fn next_peer(&self, env: &Env, target: &RouterId, exclude: &HashSet<Key>) -> Option<Key> {
        env.nodes.find_many(target.dht_key(), 1, exclude).first().copied()
    }

    fn reply(&mut self, env: &mut Env, _whoasked: &TxOwner, _target: &RouterId, values: &[RouterId]) {
        for id in values {
            env.followups.push(*id);
        }
    }
}
