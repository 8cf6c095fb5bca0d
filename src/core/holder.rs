//! Per-lookup-kind transaction tables.
//!
//! A holder tracks every outstanding lookup of one kind: which `(peer,
//! txid)` owners are live, which waiters share a target key, and when the
//! first request for a key runs out of time. Concurrent lookups for the
//! same key coalesce onto a single network chain and every waiter is fanned
//! the terminal reply exactly once.
use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::hash::{Hash, Hasher};
use std::time::Duration;

use tracing::{debug, warn};

use crate::common::Key;

use super::lookup::{LookupKind, Tx};
use super::Env;

#[derive(Clone, Copy, PartialEq, Eq, Default)]
/// One outstanding request as perceived by a remote peer.
pub(crate) struct TxOwner {
    pub peer: Key,
    pub txid: u64,
}

impl TxOwner {
    pub fn new(peer: Key, txid: u64) -> Self {
        Self { peer, txid }
    }
}

impl Hash for TxOwner {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // fold the txid with a prefix of the peer key
        let mut prefix = [0; 8];
        prefix.copy_from_slice(&self.peer.as_bytes()[..8]);

        state.write_u64(self.txid ^ (u64::from_be_bytes(prefix) << 1));
    }
}

impl Debug for TxOwner {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "TxOwner({:?}, {})", self.peer, self.txid)
    }
}

/// Outstanding transactions of one lookup kind.
pub(crate) struct TxHolder<L: LookupKind> {
    /// Owners waiting on values for each key; several may share a key.
    waiting: HashMap<L::Target, Vec<TxOwner>>,
    /// Deadline of the first outstanding request per key.
    timeouts: HashMap<L::Target, u64>,
    /// Live transactions by the owner their next reply will carry.
    tx: HashMap<TxOwner, Tx<L>>,
    timeout_ms: u64,
}

impl<L: LookupKind> TxHolder<L> {
    pub fn new(timeout: Duration) -> Self {
        Self {
            waiting: HashMap::new(),
            timeouts: HashMap::new(),
            tx: HashMap::new(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    // === Getters ===

    pub fn get(&self, owner: &TxOwner) -> Option<&Tx<L>> {
        self.tx.get(owner)
    }

    pub fn has_pending_from(&self, owner: &TxOwner) -> bool {
        self.get(owner).is_some()
    }

    /// True while any chain for `target` is live.
    pub fn has_lookup_for(&self, target: &L::Target) -> bool {
        self.timeouts.contains_key(target)
    }

    /// True if some chain currently has a request outstanding at `peer`.
    pub fn has_pending_to_peer(&self, peer: &Key) -> bool {
        self.tx.keys().any(|owner| owner.peer == *peer)
    }

    pub fn target_of(&self, owner: &TxOwner) -> Option<L::Target> {
        self.tx.get(owner).map(|tx| tx.target.clone())
    }

    // === Public Methods ===

    /// Register a fresh transaction. The first waiter for a key starts the
    /// network chain; later waiters piggyback on it and only subscribe to
    /// the reply.
    pub fn new_tx(&mut self, env: &mut Env, askpeer: TxOwner, tx: Tx<L>) {
        if self.tx.contains_key(&askpeer) {
            // the caller must allocate a fresh txid per transaction
            warn!(?askpeer, "duplicate transaction owner, lookup dropped");
            return;
        }

        let target = tx.target.clone();
        let waiters = self.waiting.entry(target.clone()).or_default();
        let first = waiters.is_empty();
        waiters.push(askpeer);

        self.timeouts
            .entry(target)
            .or_insert(env.now + self.timeout_ms);

        if first {
            let msg = tx.kind.request(&tx.target, askpeer.txid);
            env.send(askpeer.peer, msg, true);
        }
        self.tx.insert(askpeer, tx);
    }

    /// A queried peer answered without values, possibly hinting at a closer
    /// peer. Step the chain forward; once no closer peer remains, terminate
    /// and fan the empty reply out.
    pub fn not_found(&mut self, env: &mut Env, from: &TxOwner, next: Option<Key>) {
        let Some(mut tx) = self.tx.remove(from) else {
            debug!(owner = ?from, "reply for unknown transaction owner");
            return;
        };

        match tx.ask_next_peer(env, from.peer, next) {
            Some(peer) => {
                // the chain continues under the next request's owner
                let owner = TxOwner::new(peer, env.next_id());
                let msg = tx.kind.request(&tx.target, owner.txid);
                env.send(peer, msg, true);

                if let Some(waiters) = self.waiting.get_mut(&tx.target) {
                    for waiter in waiters.iter_mut() {
                        if waiter == from {
                            *waiter = owner;
                        }
                    }
                }
                self.tx.insert(owner, tx);
            }
            None => {
                let target = tx.target.clone();
                self.tx.insert(*from, tx);
                self.inform(env, from, &target, &[], true, true);
            }
        }
    }

    /// A queried peer answered with validated values.
    pub fn found(&mut self, env: &mut Env, from: &TxOwner, key: &L::Target, values: &[L::Value]) {
        if !self.tx.contains_key(from) {
            debug!(owner = ?from, "reply for unknown transaction owner");
            return;
        }

        self.inform(env, from, key, values, true, true);
    }

    /// Fan values out to every waiter of `key`, sending each waiter its
    /// terminal reply when `send_reply` is set.
    pub fn inform(
        &mut self,
        env: &mut Env,
        from: &TxOwner,
        key: &L::Target,
        values: &[L::Value],
        send_reply: bool,
        remove_timeouts: bool,
    ) {
        if let Some(waiters) = self.waiting.get(key) {
            for owner in waiters.clone() {
                if let Some(tx) = self.tx.get_mut(&owner) {
                    for value in values {
                        tx.on_found(env, from.peer, value);
                    }
                    if send_reply {
                        if let Some(mut tx) = self.tx.remove(&owner) {
                            tx.send_reply(env);
                        }
                    }
                }
            }
        }

        if send_reply {
            self.waiting.remove(key);
        }
        if remove_timeouts {
            self.timeouts.remove(key);
        }
    }

    /// Collect every key whose deadline has passed, firing one empty reply
    /// to each of its waiters.
    pub fn expire(&mut self, env: &mut Env, now: u64) {
        let expired: Vec<L::Target> = self
            .timeouts
            .iter()
            .filter(|(_, deadline)| now >= **deadline)
            .map(|(key, _)| key.clone())
            .collect();

        for key in expired {
            debug!(lookup = ?key, "lookup timed out");
            self.inform(env, &TxOwner::default(), &key, &[], true, false);
            self.timeouts.remove(&key);
        }
    }

    /// Teardown: answer every live transaction with an empty reply and
    /// release it.
    pub fn drain(&mut self, env: &mut Env) {
        let keys: Vec<L::Target> = self.waiting.keys().cloned().collect();

        for key in keys {
            self.inform(env, &TxOwner::default(), &key, &[], true, true);
        }
    }

    #[cfg(test)]
    pub fn live_transactions(&self) -> usize {
        self.tx.len()
    }

    #[cfg(test)]
    pub fn waiting_keys(&self) -> usize {
        self.waiting.len()
    }

    #[cfg(test)]
    pub fn consistent(&self) -> bool {
        // every waiter owns a live transaction for a key that still has a
        // deadline, and vice versa
        let waiters_ok = self.waiting.iter().all(|(key, owners)| {
            self.timeouts.contains_key(key)
                && owners.iter().all(|owner| {
                    self.tx
                        .get(owner)
                        .is_some_and(|tx| tx.target == *key)
                })
        });

        let tx_ok = self.tx.iter().all(|(owner, tx)| {
            self.waiting
                .get(&tx.target)
                .is_some_and(|owners| owners.contains(owner))
        });

        waiters_ok && tx_ok
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::common::{Key, RcNode, RouterContact, RouterId};
    use crate::core::lookup::{Reply, RouterLookup, Tx};
    use crate::core::testing::{self, RecordingTransport};
    use crate::core::Env;

    const NOW: u64 = 50_000;
    const TIMEOUT: Duration = Duration::from_millis(5000);

    fn key(prefix: u8) -> Key {
        let mut bytes = [0; 32];
        bytes[0] = prefix;
        Key(bytes)
    }

    fn contact(id: Key) -> RouterContact {
        RouterContact {
            id,
            address_info: Bytes::new(),
            timestamp_ms: NOW,
            signature: [0; 64],
        }
    }

    fn setup(peers: &[Key]) -> (Env, RecordingTransport, TxHolder<RouterLookup>) {
        let (mut env, transport, _) = testing::env(key(0xaa));
        env.now = NOW;
        for peer in peers {
            env.nodes.put(RcNode::new(contact(*peer)), NOW);
        }

        (env, transport, TxHolder::new(TIMEOUT))
    }

    fn local_tx(target: RouterId, asker: TxOwner) -> Tx<RouterLookup> {
        Tx::new(
            target,
            asker,
            RouterLookup {
                reply: Reply::Local(None),
            },
        )
    }

    fn handled_tx(
        target: RouterId,
        asker: TxOwner,
    ) -> (Tx<RouterLookup>, flume::Receiver<Vec<RouterContact>>) {
        let (sender, receiver) = flume::unbounded();
        let tx = Tx::new(
            target,
            asker,
            RouterLookup {
                reply: Reply::Local(Some(sender)),
            },
        );

        (tx, receiver)
    }

    #[test]
    fn first_waiter_starts_the_chain_once() {
        let peer = key(0x01);
        let (mut env, transport, mut holder) = setup(&[peer]);

        let target = key(0x30);
        let asker = TxOwner::new(key(0xaa), 0);

        holder.new_tx(&mut env, TxOwner::new(peer, 1), local_tx(target, asker));
        assert_eq!(transport.take().len(), 1);
        assert!(holder.has_lookup_for(&target));
        assert!(holder.consistent());

        // a second waiter piggybacks without a new request
        holder.new_tx(&mut env, TxOwner::new(peer, 2), local_tx(target, asker));
        assert!(transport.take().is_empty());
        assert_eq!(holder.live_transactions(), 2);
        assert!(holder.consistent());
    }

    #[test]
    fn duplicate_owner_is_rejected() {
        let peer = key(0x01);
        let (mut env, transport, mut holder) = setup(&[peer]);

        let owner = TxOwner::new(peer, 1);
        let asker = TxOwner::new(key(0xaa), 0);

        holder.new_tx(&mut env, owner, local_tx(key(0x30), asker));
        holder.new_tx(&mut env, owner, local_tx(key(0x40), asker));

        assert_eq!(holder.live_transactions(), 1);
        assert_eq!(transport.take().len(), 1);
        assert!(holder.consistent());
    }

    #[test]
    fn replies_from_unknown_owners_are_dropped() {
        let peer = key(0x01);
        let (mut env, _transport, mut holder) = setup(&[peer]);

        let stranger = TxOwner::new(key(0x77), 9);
        holder.found(&mut env, &stranger, &key(0x30), &[contact(key(0x30))]);
        holder.not_found(&mut env, &stranger, None);

        assert_eq!(holder.live_transactions(), 0);
        assert!(holder.consistent());
    }

    #[test]
    fn found_fans_out_to_every_waiter_exactly_once() {
        let peer = key(0x01);
        let (mut env, _transport, mut holder) = setup(&[peer]);

        let target = key(0x30);
        let (tx_a, results_a) = handled_tx(target, TxOwner::new(key(0xaa), 0));
        let (tx_b, results_b) = handled_tx(target, TxOwner::new(key(0xaa), 0));

        let owner_a = TxOwner::new(peer, 1);
        holder.new_tx(&mut env, owner_a, tx_a);
        holder.new_tx(&mut env, TxOwner::new(peer, 2), tx_b);

        let value = contact(target);
        holder.found(&mut env, &owner_a, &target, &[value.clone()]);

        assert_eq!(results_a.try_recv().unwrap(), vec![value.clone()]);
        assert_eq!(results_b.try_recv().unwrap(), vec![value]);
        assert!(results_a.try_recv().is_err());
        assert!(results_b.try_recv().is_err());

        assert_eq!(holder.live_transactions(), 0);
        assert_eq!(holder.waiting_keys(), 0);
        assert!(!holder.has_lookup_for(&target));
        assert!(holder.consistent());
    }

    #[test]
    fn chain_steps_rekey_the_transaction() {
        let far = key(0xf0);
        let near = key(0x31);
        let (mut env, transport, mut holder) = setup(&[far, near]);

        let target = key(0x30);
        let (tx, results) = handled_tx(target, TxOwner::new(key(0xaa), 0));

        // start the chain at the far peer so there is progress to make
        let owner = TxOwner::new(far, env.next_id());
        holder.new_tx(&mut env, owner, tx);
        transport.take();

        holder.not_found(&mut env, &owner, None);
        assert!(holder.consistent());

        // the old owner no longer routes, the next request is outstanding
        assert!(!holder.has_pending_from(&owner));
        assert!(holder.has_pending_to_peer(&near));
        assert!(holder.has_lookup_for(&target));
        assert!(results.try_recv().is_err(), "no reply while the chain runs");

        let sent = transport.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, near);
        let stepped_txid = match &sent[0].1 {
            crate::common::Message::FindRouter(find) => find.txid,
            other => panic!("expected FindRouter, got {other:?}"),
        };

        // the closer peer has nothing either; the chain is exhausted
        let stepped = TxOwner::new(near, stepped_txid);
        holder.not_found(&mut env, &stepped, None);

        assert_eq!(results.try_recv().unwrap(), Vec::new());
        assert_eq!(holder.live_transactions(), 0);
        assert!(holder.consistent());
    }

    #[test]
    fn expiry_fires_once_at_the_deadline() {
        let peer = key(0x01);
        let (mut env, _transport, mut holder) = setup(&[peer]);

        let target = key(0x30);
        let (tx, results) = handled_tx(target, TxOwner::new(key(0xaa), 0));
        holder.new_tx(&mut env, TxOwner::new(peer, 1), tx);

        holder.expire(&mut env, NOW + 4_999);
        assert!(results.try_recv().is_err());

        holder.expire(&mut env, NOW + 5_000);
        assert_eq!(results.try_recv().unwrap(), Vec::new());

        holder.expire(&mut env, NOW + 10_000);
        assert!(results.try_recv().is_err(), "an expired key fires once");

        assert_eq!(holder.live_transactions(), 0);
        assert_eq!(holder.waiting_keys(), 0);
        assert!(holder.consistent());
    }

    #[test]
    fn drain_answers_all_live_transactions() {
        let peer = key(0x01);
        let (mut env, _transport, mut holder) = setup(&[peer]);

        let (tx_a, results_a) = handled_tx(key(0x30), TxOwner::new(key(0xaa), 0));
        let (tx_b, results_b) = handled_tx(key(0x40), TxOwner::new(key(0xaa), 0));
        holder.new_tx(&mut env, TxOwner::new(peer, 1), tx_a);
        holder.new_tx(&mut env, TxOwner::new(peer, 2), tx_b);

        holder.drain(&mut env);

        assert_eq!(results_a.try_recv().unwrap(), Vec::new());
        assert_eq!(results_b.try_recv().unwrap(), Vec::new());
        assert_eq!(holder.live_transactions(), 0);
        assert!(!holder.has_lookup_for(&key(0x30)));
        assert!(holder.consistent());
    }

    #[test]
    fn holder_stays_consistent_across_mixed_operations() {
        let peers = [key(0x01), key(0x02), key(0x03)];
        let (mut env, _transport, mut holder) = setup(&peers);

        for (i, target) in [key(0x30), key(0x40), key(0x50)].iter().enumerate() {
            let owner = TxOwner::new(peers[i], env.next_id());
            let asker = TxOwner::new(key(0xaa), 0);
            holder.new_tx(&mut env, owner, local_tx(*target, asker));
            assert!(holder.consistent());
        }

        holder.found(
            &mut env,
            &TxOwner::new(peers[0], 1),
            &key(0x30),
            &[contact(key(0x30))],
        );
        assert!(holder.consistent());

        holder.not_found(&mut env, &TxOwner::new(peers[1], 2), None);
        assert!(holder.consistent());

        holder.expire(&mut env, NOW + 60_000);
        assert!(holder.consistent());
        assert_eq!(holder.live_transactions(), 0);
        assert_eq!(holder.waiting_keys(), 0);
    }
}
