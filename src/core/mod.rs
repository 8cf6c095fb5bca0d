//! The DHT context: message dispatch, iterative lookups, relaying, and
//! exploration, all driven from a single event loop.
mod config;
mod holder;
mod lookup;
mod transport;

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::seq::SliceRandom;
use tracing::{debug, warn};

use crate::common::messages::{
    FindIntro, FindRouter, GotIntro, GotRouter, IntroTarget, Message, PutIntro,
};
use crate::common::{
    IntroSet, IsNode, Key, LookupTarget, PathId, RcNode, RouterContact, RouterId, RoutingTable,
    ServiceAddress, Tag,
};

use holder::{TxHolder, TxOwner};
use lookup::{ExploreLookup, IntroSetLookup, Reply, RouterLookup, TagLookup, Tx};

pub use config::{Config, DEFAULT_CLEANUP_INTERVAL, DEFAULT_REQUEST_TIMEOUT};
pub use transport::{Clock, MonotonicClock, PathSink, Transport};

/// Receives the result of an iterative router lookup.
pub type RouterLookupHandler = flume::Sender<Vec<RouterContact>>;
/// Receives the result of an iterative introset or tag lookup.
pub type IntroSetLookupHandler = flume::Sender<Vec<IntroSet>>;

/// Resolved introduction sets worth remembering between lookups.
const MAX_CACHED_INTROSETS: usize = 256;
/// Propagation budget given to locally published introduction sets.
const PUBLISH_PROPAGATE_BUDGET: u64 = 3;
/// How many closer peers a stored introduction set is forwarded to.
const PROPAGATE_FANOUT: usize = 2;

/// The mutable surroundings a transaction acts on: identity, routing
/// tables, the wire, local paths, and the txid allocator. Holders borrow it
/// disjointly from their own maps.
pub(crate) struct Env {
    pub our_key: Key,
    pub our_contact: Option<RouterContact>,
    /// The current turn's time, set at every entry point.
    pub now: u64,
    ids: u64,
    pub nodes: RoutingTable<RcNode>,
    pub services: RoutingTable<IsNode>,
    pub introset_cache: LruCache<ServiceAddress, IntroSet>,
    transport: Box<dyn Transport>,
    paths: Box<dyn PathSink>,
    /// Identities discovered by exploration, pending follow-up lookups.
    pub followups: Vec<RouterId>,
}

impl Env {
    fn new(our_key: Key, transport: Box<dyn Transport>, paths: Box<dyn PathSink>) -> Self {
        Self {
            our_key,
            our_contact: None,
            now: 0,
            ids: 0,
            nodes: RoutingTable::new(our_key),
            services: RoutingTable::new(our_key),
            introset_cache: LruCache::new(NonZeroUsize::new(MAX_CACHED_INTROSETS).unwrap()),
            transport,
            paths,
            followups: Vec::new(),
        }
    }

    pub fn next_id(&mut self) -> u64 {
        self.ids += 1;
        self.ids
    }

    pub fn send(&mut self, peer: Key, msg: Message, keepalive: bool) {
        self.transport.send(peer, msg, keepalive);
    }

    pub fn deliver(&mut self, path: PathId, msg: Message) {
        self.paths.deliver(path, msg);
    }
}

/// The DHT context.
///
/// Single-threaded and tick-driven: inbound messages, timer callbacks and
/// locally initiated lookups all run as non-overlapping turns against the
/// same state. Every entry point takes the turn's monotonic time in
/// milliseconds.
pub struct Context {
    env: Env,
    pending_introset_lookups: TxHolder<IntroSetLookup>,
    pending_tag_lookups: TxHolder<TagLookup>,
    pending_router_lookups: TxHolder<RouterLookup>,
    pending_explore_lookups: TxHolder<ExploreLookup>,
    config: Config,
    last_cleanup: u64,
    last_explore: u64,
}

impl Context {
    pub fn new(
        our_key: Key,
        transport: Box<dyn Transport>,
        paths: Box<dyn PathSink>,
        config: Config,
    ) -> Self {
        let timeout = config.request_timeout;

        Self {
            env: Env::new(our_key, transport, paths),
            pending_introset_lookups: TxHolder::new(timeout),
            pending_tag_lookups: TxHolder::new(timeout),
            pending_router_lookups: TxHolder::new(timeout),
            pending_explore_lookups: TxHolder::new(timeout),
            config,
            last_cleanup: 0,
            last_explore: 0,
        }
    }

    // === Getters ===

    pub fn our_key(&self) -> Key {
        self.env.our_key
    }

    pub fn router_table_size(&self) -> usize {
        self.env.nodes.size()
    }

    pub fn service_table_size(&self) -> usize {
        self.env.services.size()
    }

    pub fn has_router_lookup(&self, target: &RouterId) -> bool {
        self.pending_router_lookups.has_lookup_for(target)
    }

    // === Collaborator surface ===

    /// Install the descriptor answered when someone resolves us.
    pub fn set_our_contact(&mut self, contact: RouterContact) {
        self.env.our_contact = Some(contact);
    }

    /// Seed or refresh the router table. The router source vouches for the
    /// contact; no signature check happens here.
    pub fn put_router_contact(&mut self, now: u64, contact: RouterContact) -> bool {
        self.env.now = now;
        self.env.nodes.put(RcNode::new(contact), now)
    }

    // === Lookup surface ===

    /// Resolve a router, answering `handler` with at most one contact.
    /// Returns false iff the router table is empty.
    pub fn lookup_router(
        &mut self,
        now: u64,
        target: RouterId,
        handler: Option<RouterLookupHandler>,
    ) -> bool {
        self.env.now = now;
        let our_key = self.env.our_key;

        let Some(askpeer) = self.env.nodes.find_closest(target.dht_key()) else {
            return false;
        };
        self.lookup_router_recursive(now, target, our_key, 0, askpeer, handler);

        true
    }

    /// On behalf of `whoasked`, resolve a router via `askpeer`.
    pub fn lookup_router_recursive(
        &mut self,
        now: u64,
        target: RouterId,
        whoasked: Key,
        whoasked_tx: u64,
        askpeer: Key,
        handler: Option<RouterLookupHandler>,
    ) {
        self.env.now = now;

        let reply = if whoasked == self.env.our_key {
            Reply::Local(handler)
        } else {
            Reply::Remote
        };

        let owner = TxOwner::new(askpeer, self.env.next_id());
        let asker = TxOwner::new(whoasked, whoasked_tx);
        let tx = Tx::new(target, asker, RouterLookup { reply });

        self.pending_router_lookups.new_tx(&mut self.env, owner, tx);
    }

    /// Resolve a router via `askpeer`, delivering the reply on `path`.
    pub fn lookup_router_for_path(
        &mut self,
        now: u64,
        target: RouterId,
        txid: u64,
        path: PathId,
        askpeer: Key,
    ) {
        self.env.now = now;

        let owner = TxOwner::new(askpeer, self.env.next_id());
        let asker = TxOwner::new(self.env.our_key, txid);
        let tx = Tx::new(
            target,
            asker,
            RouterLookup {
                reply: Reply::Path(path),
            },
        );

        self.pending_router_lookups.new_tx(&mut self.env, owner, tx);
    }

    /// Resolve an introset, answering `handler` with the deduplicated
    /// results. Returns false iff the router table is empty.
    pub fn lookup_intro_set(
        &mut self,
        now: u64,
        target: ServiceAddress,
        handler: Option<IntroSetLookupHandler>,
    ) -> bool {
        self.env.now = now;
        let our_key = self.env.our_key;

        let Some(askpeer) = self.env.nodes.find_closest(target.dht_key()) else {
            return false;
        };
        self.lookup_intro_set_iterative(now, target, our_key, 0, askpeer, handler);

        true
    }

    /// On behalf of `whoasked`, resolve an introset via `askpeer` with
    /// recursion budget `recursion`.
    #[allow(clippy::too_many_arguments)]
    pub fn lookup_intro_set_recursive(
        &mut self,
        now: u64,
        target: ServiceAddress,
        whoasked: Key,
        whoasked_tx: u64,
        askpeer: Key,
        recursion: u64,
        handler: Option<IntroSetLookupHandler>,
    ) {
        self.new_intro_set_tx(now, target, whoasked, whoasked_tx, askpeer, recursion, handler);
    }

    /// As [Self::lookup_intro_set_recursive], but relays must answer from
    /// their own tables instead of recursing further.
    pub fn lookup_intro_set_iterative(
        &mut self,
        now: u64,
        target: ServiceAddress,
        whoasked: Key,
        whoasked_tx: u64,
        askpeer: Key,
        handler: Option<IntroSetLookupHandler>,
    ) {
        self.new_intro_set_tx(now, target, whoasked, whoasked_tx, askpeer, 0, handler);
    }

    /// Resolve an introset via `askpeer`, delivering the reply on `path`.
    pub fn lookup_intro_set_for_path(
        &mut self,
        now: u64,
        target: ServiceAddress,
        txid: u64,
        path: PathId,
        askpeer: Key,
    ) {
        self.env.now = now;

        let owner = TxOwner::new(askpeer, self.env.next_id());
        let asker = TxOwner::new(self.env.our_key, txid);
        let tx = Tx::new(
            target,
            asker,
            IntroSetLookup {
                reply: Reply::Path(path),
                recursion: self.config.recursion_limit,
            },
        );

        self.pending_introset_lookups.new_tx(&mut self.env, owner, tx);
    }

    #[allow(clippy::too_many_arguments)]
    fn new_intro_set_tx(
        &mut self,
        now: u64,
        target: ServiceAddress,
        whoasked: Key,
        whoasked_tx: u64,
        askpeer: Key,
        recursion: u64,
        handler: Option<IntroSetLookupHandler>,
    ) {
        self.env.now = now;

        let reply = if whoasked == self.env.our_key {
            Reply::Local(handler)
        } else {
            Reply::Remote
        };

        let owner = TxOwner::new(askpeer, self.env.next_id());
        let asker = TxOwner::new(whoasked, whoasked_tx);
        let tx = Tx::new(target, asker, IntroSetLookup { reply, recursion });

        self.pending_introset_lookups.new_tx(&mut self.env, owner, tx);
    }

    /// Resolve introsets advertising `tag`, answering `handler`. Returns
    /// false iff the router table is empty.
    pub fn lookup_tag(
        &mut self,
        now: u64,
        tag: Tag,
        handler: Option<IntroSetLookupHandler>,
    ) -> bool {
        self.env.now = now;
        let our_key = self.env.our_key;

        let Some(askpeer) = self.env.nodes.find_closest(tag.dht_key()) else {
            return false;
        };
        self.new_tag_tx(now, tag, our_key, 0, askpeer, 0, handler);

        true
    }

    /// On behalf of `whoasked`, resolve `tag` via `askpeer` with recursion
    /// budget `recursion`.
    pub fn lookup_tag_recursive(
        &mut self,
        now: u64,
        tag: Tag,
        whoasked: Key,
        whoasked_tx: u64,
        askpeer: Key,
        recursion: u64,
    ) {
        self.new_tag_tx(now, tag, whoasked, whoasked_tx, askpeer, recursion, None);
    }

    /// Resolve `tag` via `askpeer`, delivering the reply on `path`.
    pub fn lookup_tag_for_path(&mut self, now: u64, tag: Tag, txid: u64, path: PathId, askpeer: Key) {
        self.env.now = now;

        let seed = self.find_random_intro_sets_with_tag_excluding(&tag, 2, &HashSet::new());
        let owner = TxOwner::new(askpeer, self.env.next_id());
        let asker = TxOwner::new(self.env.our_key, txid);
        let tx = Tx::with_values(
            tag,
            asker,
            TagLookup {
                reply: Reply::Path(path),
                recursion: self.config.recursion_limit,
                result_limit: self.config.tag_result_limit,
            },
            seed,
        );

        self.pending_tag_lookups.new_tx(&mut self.env, owner, tx);
    }

    #[allow(clippy::too_many_arguments)]
    fn new_tag_tx(
        &mut self,
        now: u64,
        tag: Tag,
        whoasked: Key,
        whoasked_tx: u64,
        askpeer: Key,
        recursion: u64,
        handler: Option<IntroSetLookupHandler>,
    ) {
        self.env.now = now;

        let reply = if whoasked == self.env.our_key {
            Reply::Local(handler)
        } else {
            Reply::Remote
        };

        // the reply includes what we already hold for the tag
        let seed = self.find_random_intro_sets_with_tag_excluding(&tag, 2, &HashSet::new());
        let owner = TxOwner::new(askpeer, self.env.next_id());
        let asker = TxOwner::new(whoasked, whoasked_tx);
        let tx = Tx::with_values(
            tag,
            asker,
            TagLookup {
                reply,
                recursion,
                result_limit: self.config.tag_result_limit,
            },
            seed,
        );

        self.pending_tag_lookups.new_tx(&mut self.env, owner, tx);
    }

    // === Local record access ===

    /// A locally stored or recently resolved introset for `addr`.
    pub fn get_intro_set_by_service_address(&mut self, addr: &ServiceAddress) -> Option<IntroSet> {
        if let Some(node) = self.env.services.get(&addr.dht_key()) {
            return Some(node.introset.clone());
        }

        self.env.introset_cache.get(addr).cloned()
    }

    /// A randomized sample of locally stored introsets advertising `tag`.
    pub fn find_random_intro_sets_with_tag_excluding(
        &self,
        tag: &Tag,
        max: usize,
        excludes: &HashSet<ServiceAddress>,
    ) -> Vec<IntroSet> {
        let mut rng = rand::thread_rng();

        let matches: Vec<&IsNode> = self
            .env
            .services
            .iter()
            .filter(|node| {
                node.introset.advertises(tag) && !excludes.contains(&node.introset.address)
            })
            .collect();

        matches
            .choose_multiple(&mut rng, max)
            .map(|node| node.introset.clone())
            .collect()
    }

    /// Store `introset` locally and push it toward the closest peers with a
    /// propagation budget. Returns false when the descriptor is invalid or
    /// nobody could be told.
    pub fn publish_intro_set(&mut self, now: u64, introset: IntroSet) -> bool {
        self.env.now = now;

        if !introset.verify() || introset.is_expired(now) {
            warn!(address = ?introset.address, "refusing to publish invalid introset");
            return false;
        }

        let addr_key = introset.address.dht_key();
        self.env.services.put(IsNode::new(introset.clone()), now);

        let our_key = self.env.our_key;
        let exclude = HashSet::from([our_key]);
        let peers = self.env.nodes.find_many(addr_key, PROPAGATE_FANOUT, &exclude);

        let mut told: Vec<Key> = peers.clone();
        told.push(our_key);

        let source_tx = self.env.next_id();
        for peer in &peers {
            self.propagate_intro_set_to(
                now,
                our_key,
                source_tx,
                introset.clone(),
                *peer,
                PUBLISH_PROPAGATE_BUDGET,
                told.clone(),
            );
        }

        !peers.is_empty()
    }

    /// Send `introset` to `peer` for storage, carrying the remaining
    /// propagation budget and the peers that already hold it.
    #[allow(clippy::too_many_arguments)]
    pub fn propagate_intro_set_to(
        &mut self,
        now: u64,
        source: Key,
        source_tx: u64,
        introset: IntroSet,
        peer: Key,
        propagate: u64,
        exclude: Vec<Key>,
    ) {
        self.env.now = now;

        debug!(address = ?introset.address, ?peer, ?source, source_tx, propagate, "propagating introset");

        let txid = self.env.next_id();
        let msg = Message::PutIntro(PutIntro {
            txid,
            introset,
            propagate,
            exclude,
        });
        self.env.send(peer, msg, true);
    }

    // === Relay handlers ===

    /// Answer a router lookup relayed to us by `requester`.
    pub fn lookup_router_relayed(
        &mut self,
        now: u64,
        requester: Key,
        txid: u64,
        target: RouterId,
        recursive: bool,
        replies: &mut Vec<Message>,
    ) {
        self.env.now = now;
        let our_key = self.env.our_key;

        if target == our_key {
            let contacts = self.env.our_contact.iter().cloned().collect();
            replies.push(got_router(txid, contacts, None));
            return;
        }

        if let Some(node) = self.env.nodes.get(&target) {
            replies.push(got_router(txid, vec![node.contact.clone()], None));
            return;
        }

        let exclude = HashSet::from([requester, our_key]);
        let Some(peer) = self
            .env
            .nodes
            .find_many(target.dht_key(), 1, &exclude)
            .first()
            .copied()
        else {
            replies.push(got_router(txid, Vec::new(), None));
            return;
        };

        // only forward when the candidate actually makes progress
        if (peer ^ target) < (our_key ^ target) {
            if recursive {
                self.lookup_router_recursive(now, target, requester, txid, peer, None);
            } else {
                replies.push(got_router(txid, Vec::new(), Some(peer)));
            }
        } else {
            replies.push(got_router(txid, Vec::new(), None));
        }
    }

    /// Answer an exploratory lookup: identities near `target`, excluding
    /// the requester and ourselves.
    pub fn handle_exploratory_router_lookup(
        &mut self,
        now: u64,
        requester: Key,
        txid: u64,
        target: RouterId,
        replies: &mut Vec<Message>,
    ) {
        self.env.now = now;

        let exclude = HashSet::from([requester, self.env.our_key]);
        let near = self.env.nodes.find_many(
            target.dht_key(),
            self.config.exploratory_reply_count,
            &exclude,
        );

        replies.push(Message::GotRouter(GotRouter {
            txid,
            contacts: Vec::new(),
            near,
            closer: None,
        }));
    }

    /// Relay a DHT request originated by one of our own paths. The reply
    /// is delivered back on the same path. Returns false for message kinds
    /// a path may not originate.
    pub fn relay_request_for_path(&mut self, now: u64, path: PathId, msg: &Message) -> bool {
        self.env.now = now;
        let our_key = self.env.our_key;

        match msg {
            Message::FindRouter(find) if !find.exploratory => {
                if let Some(node) = self.env.nodes.get(&find.target) {
                    let reply = got_router(find.txid, vec![node.contact.clone()], None);
                    self.env.deliver(path, reply);
                    return true;
                }

                let exclude = HashSet::from([our_key]);
                match self
                    .env
                    .nodes
                    .find_many(find.target.dht_key(), 1, &exclude)
                    .first()
                    .copied()
                {
                    Some(peer) => {
                        self.lookup_router_for_path(now, find.target, find.txid, path, peer)
                    }
                    None => {
                        let reply = got_router(find.txid, Vec::new(), None);
                        self.env.deliver(path, reply);
                    }
                }
                true
            }
            Message::FindIntro(find) => match &find.target {
                IntroTarget::Address(addr) => {
                    if let Some(introset) = self.get_intro_set_by_service_address(addr) {
                        let reply = got_intro(find.txid, vec![introset], None);
                        self.env.deliver(path, reply);
                        return true;
                    }

                    let exclude = HashSet::from([our_key]);
                    match self
                        .env
                        .nodes
                        .find_many(addr.dht_key(), 1, &exclude)
                        .first()
                        .copied()
                    {
                        Some(peer) => {
                            self.lookup_intro_set_for_path(now, *addr, find.txid, path, peer)
                        }
                        None => {
                            let reply = got_intro(find.txid, Vec::new(), None);
                            self.env.deliver(path, reply);
                        }
                    }
                    true
                }
                IntroTarget::Tag(tag) => {
                    let exclude = HashSet::from([our_key]);
                    match self
                        .env
                        .nodes
                        .find_many(tag.dht_key(), 1, &exclude)
                        .first()
                        .copied()
                    {
                        Some(peer) => self.lookup_tag_for_path(now, *tag, find.txid, path, peer),
                        None => {
                            let local = self.find_random_intro_sets_with_tag_excluding(
                                tag,
                                self.config.tag_result_limit,
                                &HashSet::new(),
                            );
                            let reply = got_intro(find.txid, local, None);
                            self.env.deliver(path, reply);
                        }
                    }
                    true
                }
            },
            _ => {
                debug!(?path, "dropping message kind a path may not originate");
                false
            }
        }
    }

    // === Dispatch ===

    /// Route one inbound DHT message from the network.
    pub fn handle_message(&mut self, now: u64, from: Key, msg: Message) {
        self.env.now = now;

        match msg {
            Message::FindRouter(find) => self.handle_find_router(now, from, find),
            Message::GotRouter(got) => self.handle_got_router(from, got),
            Message::FindIntro(find) => self.handle_find_intro(now, from, find),
            Message::GotIntro(got) => self.handle_got_intro(from, got),
            Message::PutIntro(put) => self.handle_put_intro(now, from, put),
        }

        self.run_followups(now);
    }

    fn handle_find_router(&mut self, now: u64, from: Key, find: FindRouter) {
        let mut replies = Vec::new();

        if find.exploratory {
            self.handle_exploratory_router_lookup(now, from, find.txid, find.target, &mut replies);
        } else {
            self.lookup_router_relayed(
                now,
                from,
                find.txid,
                find.target,
                !find.iterative,
                &mut replies,
            );
        }

        for reply in replies {
            self.env.send(from, reply, false);
        }
    }

    fn handle_got_router(&mut self, from: Key, got: GotRouter) {
        let owner = TxOwner::new(from, got.txid);

        // contacts that check out always refresh the router table
        let mut valid = Vec::new();
        for contact in got.contacts {
            if contact.verify() && !contact.is_expired(self.env.now) {
                self.env
                    .nodes
                    .put(RcNode::new(contact.clone()), self.env.now);
                valid.push(contact);
            } else {
                debug!(id = ?contact.id, "dropping router contact that failed verification");
            }
        }

        if self.pending_explore_lookups.has_pending_from(&owner) {
            let mut ids = got.near;
            ids.extend(valid.iter().map(|contact| contact.id));

            if ids.is_empty() {
                self.pending_explore_lookups
                    .not_found(&mut self.env, &owner, got.closer);
            } else if let Some(key) = self.pending_explore_lookups.target_of(&owner) {
                self.pending_explore_lookups
                    .found(&mut self.env, &owner, &key, &ids);
            }
        } else if self.pending_router_lookups.has_pending_from(&owner) {
            if valid.is_empty() {
                self.pending_router_lookups
                    .not_found(&mut self.env, &owner, got.closer);
            } else if let Some(key) = self.pending_router_lookups.target_of(&owner) {
                self.pending_router_lookups
                    .found(&mut self.env, &owner, &key, &valid);
            }
        } else {
            debug!(?owner, "stale router reply");
        }
    }

    fn handle_find_intro(&mut self, now: u64, from: Key, find: FindIntro) {
        let our_key = self.env.our_key;
        let recursion = find.recursion.min(self.config.recursion_limit);

        match find.target {
            IntroTarget::Address(addr) => {
                if let Some(introset) = self.get_intro_set_by_service_address(&addr) {
                    let reply = got_intro(find.txid, vec![introset], None);
                    self.env.send(from, reply, false);
                    return;
                }

                let exclude = HashSet::from([our_key, from]);
                let next = self
                    .env
                    .nodes
                    .find_many(addr.dht_key(), 1, &exclude)
                    .first()
                    .copied();

                match next {
                    Some(peer) if recursion > 0 => self.lookup_intro_set_recursive(
                        now,
                        addr,
                        from,
                        find.txid,
                        peer,
                        recursion - 1,
                        None,
                    ),
                    other => {
                        let reply = got_intro(find.txid, Vec::new(), other);
                        self.env.send(from, reply, false);
                    }
                }
            }
            IntroTarget::Tag(tag) => {
                let exclude = HashSet::from([our_key, from]);
                let next = self
                    .env
                    .nodes
                    .find_many(tag.dht_key(), 1, &exclude)
                    .first()
                    .copied();

                match next {
                    Some(peer) if recursion > 0 => {
                        self.lookup_tag_recursive(now, tag, from, find.txid, peer, recursion - 1)
                    }
                    other => {
                        let local = self.find_random_intro_sets_with_tag_excluding(
                            &tag,
                            self.config.tag_result_limit,
                            &HashSet::new(),
                        );
                        let reply = got_intro(find.txid, local, other);
                        self.env.send(from, reply, false);
                    }
                }
            }
        }
    }

    fn handle_got_intro(&mut self, from: Key, got: GotIntro) {
        let owner = TxOwner::new(from, got.txid);

        let mut valid = Vec::new();
        for introset in got.introsets {
            if introset.verify() && !introset.is_expired(self.env.now) {
                self.env.introset_cache.put(introset.address, introset.clone());
                valid.push(introset);
            } else {
                debug!(address = ?introset.address, "dropping introset that failed verification");
            }
        }

        if self.pending_introset_lookups.has_pending_from(&owner) {
            if valid.is_empty() {
                self.pending_introset_lookups
                    .not_found(&mut self.env, &owner, got.closer);
            } else if let Some(key) = self.pending_introset_lookups.target_of(&owner) {
                self.pending_introset_lookups
                    .found(&mut self.env, &owner, &key, &valid);
            }
        } else if self.pending_tag_lookups.has_pending_from(&owner) {
            if valid.is_empty() {
                self.pending_tag_lookups
                    .not_found(&mut self.env, &owner, got.closer);
            } else if let Some(key) = self.pending_tag_lookups.target_of(&owner) {
                self.pending_tag_lookups
                    .found(&mut self.env, &owner, &key, &valid);
            }
        } else {
            debug!(?owner, "stale introset reply");
        }
    }

    fn handle_put_intro(&mut self, now: u64, from: Key, put: PutIntro) {
        if !put.introset.verify() || put.introset.is_expired(now) {
            warn!(address = ?put.introset.address, ?from, "rejecting invalid introset store");
            return;
        }

        let addr_key = put.introset.address.dht_key();
        self.env.services.put(IsNode::new(put.introset.clone()), now);

        if put.propagate == 0 {
            return;
        }

        let mut exclude: HashSet<Key> = put.exclude.iter().copied().collect();
        exclude.insert(self.env.our_key);
        exclude.insert(from);

        let peers = self.env.nodes.find_many(addr_key, PROPAGATE_FANOUT, &exclude);

        let mut told = put.exclude;
        told.extend(peers.iter().copied());
        told.push(self.env.our_key);

        for peer in peers {
            self.propagate_intro_set_to(
                now,
                from,
                put.txid,
                put.introset.clone(),
                peer,
                put.propagate - 1,
                told.clone(),
            );
        }
    }

    // === Exploration & maintenance ===

    /// Drive periodic work: expire stalled lookups and explore for new
    /// routers.
    pub fn tick(&mut self, now: u64) {
        self.env.now = now;

        if now.saturating_sub(self.last_cleanup) >= self.config.cleanup_interval.as_millis() as u64
        {
            self.last_cleanup = now;

            self.pending_introset_lookups.expire(&mut self.env, now);
            self.pending_tag_lookups.expire(&mut self.env, now);
            self.pending_router_lookups.expire(&mut self.env, now);
            self.pending_explore_lookups.expire(&mut self.env, now);
        }

        let explore_ms = self.config.explore_interval.as_millis() as u64;
        if explore_ms > 0 && now.saturating_sub(self.last_explore) >= explore_ms {
            self.last_explore = now;
            self.explore(now, self.config.explore_candidates);
        }

        self.run_followups(now);
    }

    /// Query up to `n` peers from underfilled buckets for identities near
    /// them. Peers with a pending explore chain are skipped.
    pub fn explore(&mut self, now: u64, n: usize) {
        self.env.now = now;

        for peer in self.env.nodes.sample_underfilled(n) {
            if self.pending_explore_lookups.has_pending_to_peer(&peer) {
                continue;
            }
            self.explore_network_via(now, peer);
        }
    }

    /// Ask `peer` for routers near a random key in its neighborhood.
    pub fn explore_network_via(&mut self, now: u64, peer: Key) {
        self.env.now = now;

        let target = Key::random_near(&peer);
        let txid = self.env.next_id();
        let owner = TxOwner::new(peer, txid);
        let asker = TxOwner::new(self.env.our_key, txid);
        let tx = Tx::new(target, asker, ExploreLookup);

        self.pending_explore_lookups.new_tx(&mut self.env, owner, tx);
    }

    /// Start router lookups for identities exploration discovered and we
    /// do not hold yet.
    fn run_followups(&mut self, now: u64) {
        let ids = std::mem::take(&mut self.env.followups);

        for id in ids {
            if self.env.nodes.get(&id).is_none() && !self.pending_router_lookups.has_lookup_for(&id)
            {
                self.lookup_router(now, id, None);
            }
        }
    }

    /// Teardown: every live transaction across all holders is answered
    /// with an empty reply before its storage is released.
    pub fn drain(&mut self, now: u64) {
        self.env.now = now;

        self.pending_introset_lookups.drain(&mut self.env);
        self.pending_tag_lookups.drain(&mut self.env);
        self.pending_router_lookups.drain(&mut self.env);
        self.pending_explore_lookups.drain(&mut self.env);
    }
}

fn got_router(txid: u64, contacts: Vec<RouterContact>, closer: Option<RouterId>) -> Message {
    Message::GotRouter(GotRouter {
        txid,
        contacts,
        near: Vec::new(),
        closer,
    })
}

fn got_intro(txid: u64, introsets: Vec<IntroSet>, closer: Option<Key>) -> Message {
    Message::GotIntro(GotIntro {
        txid,
        introsets,
        closer,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every outbound send for assertions.
    #[derive(Default, Clone)]
    pub struct RecordingTransport {
        pub sent: Arc<Mutex<Vec<(Key, Message, bool)>>>,
    }

    impl Transport for RecordingTransport {
        fn send(&mut self, peer: Key, msg: Message, keepalive: bool) {
            self.sent.lock().unwrap().push((peer, msg, keepalive));
        }
    }

    impl RecordingTransport {
        pub fn take(&self) -> Vec<(Key, Message, bool)> {
            std::mem::take(&mut self.sent.lock().unwrap())
        }
    }

    /// Records every path delivery for assertions.
    #[derive(Default, Clone)]
    pub struct RecordingPathSink {
        pub delivered: Arc<Mutex<Vec<(PathId, Message)>>>,
    }

    impl PathSink for RecordingPathSink {
        fn deliver(&mut self, path: PathId, msg: Message) {
            self.delivered.lock().unwrap().push((path, msg));
        }
    }

    impl RecordingPathSink {
        pub fn take(&self) -> Vec<(PathId, Message)> {
            std::mem::take(&mut self.delivered.lock().unwrap())
        }
    }

    pub fn env(our_key: Key) -> (Env, RecordingTransport, RecordingPathSink) {
        let transport = RecordingTransport::default();
        let paths = RecordingPathSink::default();

        let env = Env::new(our_key, Box::new(transport.clone()), Box::new(paths.clone()));

        (env, transport, paths)
    }
}
