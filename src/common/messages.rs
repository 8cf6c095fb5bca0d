//! Typed DHT messages routed by the dispatcher.
//!
//! Wire encoding is owned by the transport layer; the core only requires
//! that every message carries the `txid` identifying its transaction owner
//! together with the sending peer.
use crate::common::{IntroSet, Key, RouterContact, RouterId, ServiceAddress, Tag};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    FindRouter(FindRouter),
    GotRouter(GotRouter),
    FindIntro(FindIntro),
    GotIntro(GotIntro),
    PutIntro(PutIntro),
}

#[derive(Debug, Clone, PartialEq)]
/// Resolve a router contact by identity.
pub struct FindRouter {
    pub txid: u64,
    pub target: RouterId,
    /// The receiver must not recurse; reply locally with a closer-peer hint.
    pub iterative: bool,
    /// Ask for near neighbors of `target` instead of an exact resolve.
    pub exploratory: bool,
}

#[derive(Debug, Clone, PartialEq)]
/// Reply to [FindRouter].
pub struct GotRouter {
    pub txid: u64,
    /// The resolved contact, when found. At most one entry.
    pub contacts: Vec<RouterContact>,
    /// Identities near the asked target; only filled on exploratory replies.
    pub near: Vec<RouterId>,
    /// On an empty iterative reply, a peer closer to the target than the
    /// responder.
    pub closer: Option<RouterId>,
}

#[derive(Debug, Clone, PartialEq)]
/// What a [FindIntro] resolves.
pub enum IntroTarget {
    Address(ServiceAddress),
    Tag(Tag),
}

#[derive(Debug, Clone, PartialEq)]
/// Resolve introduction sets by service address or by tag.
pub struct FindIntro {
    pub txid: u64,
    pub target: IntroTarget,
    /// Recursion budget: each relay decrements it, at zero the receiver
    /// answers locally or returns empty.
    pub recursion: u64,
}

#[derive(Debug, Clone, PartialEq)]
/// Reply to [FindIntro].
pub struct GotIntro {
    pub txid: u64,
    pub introsets: Vec<IntroSet>,
    /// On an empty reply, a peer closer to the target than the responder.
    pub closer: Option<Key>,
}

#[derive(Debug, Clone, PartialEq)]
/// Store an introduction set, propagating it toward the closest peers while
/// the budget lasts.
pub struct PutIntro {
    pub txid: u64,
    pub introset: IntroSet,
    /// Propagation budget, decremented per hop.
    pub propagate: u64,
    /// Peers that already hold this descriptor.
    pub exclude: Vec<Key>,
}
