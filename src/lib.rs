#![doc = include_str!("../README.md")]

// Public modules
mod common;
mod error;

pub mod core;
pub mod dht;

pub use crate::common::{
    messages, FindIntro, FindRouter, GotIntro, GotRouter, IntroSet, IntroTarget, Introduction,
    IsNode, Key, LookupTarget, Message, PathId, PutIntro, RcNode, RouterContact, RouterId,
    RoutingTable, ServiceAddress, TableEntry, Tag, KEY_SIZE, MAX_BUCKET_SIZE,
};
pub use crate::core::{
    Clock, Config, Context, IntroSetLookupHandler, MonotonicClock, PathSink, RouterLookupHandler,
    Transport,
};
pub use dht::Dht;
pub use error::Error;

// Alias Result to be the crate Result.
pub type Result<T, E = error::Error> = std::result::Result<T, E>;
