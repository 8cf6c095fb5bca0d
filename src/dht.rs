//! Threaded front-end driving the DHT context event loop.
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::common::{IntroSet, Key, Message, PathId, RouterContact, RouterId, ServiceAddress, Tag};
use crate::core::{Clock, Config, Context, MonotonicClock, PathSink, Transport};

/// How long the event loop parks waiting for mail before running a tick.
const MAILBOX_POLL: Duration = Duration::from_millis(50);

/// Owning handle to a DHT node.
///
/// All context state lives on a single thread; this handle only posts
/// messages into its mailbox. Clones share the same node.
#[derive(Debug)]
pub struct Dht {
    handle: Option<JoinHandle<()>>,
    sender: Sender<ActorMessage>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht {
            handle: None,
            sender: self.sender.clone(),
        }
    }
}

impl Dht {
    /// Spawn the event loop for a node identified by `our_key`.
    pub fn new(
        our_key: Key,
        transport: Box<dyn Transport>,
        paths: Box<dyn PathSink>,
        config: Config,
    ) -> Self {
        let (sender, receiver) = flume::unbounded();

        let handle = thread::spawn(move || {
            let ctx = Context::new(our_key, transport, paths, config);
            run(ctx, receiver);
        });

        Dht {
            sender,
            handle: Some(handle),
        }
    }

    // === Public Methods ===

    pub fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }

    /// Shut the node down and wait for the event loop to finish.
    pub fn block_until_shutdown(mut self) {
        self.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Resolve a router contact. The receiver yields one result set: at
    /// most one contact, empty on failure or timeout.
    pub fn lookup_router(&self, target: RouterId) -> Receiver<Vec<RouterContact>> {
        let (sender, receiver) = flume::bounded(1);
        let _ = self.sender.send(ActorMessage::LookupRouter(target, sender));

        receiver
    }

    /// Resolve the introduction set of a hidden service.
    pub fn lookup_intro_set(&self, target: ServiceAddress) -> Receiver<Vec<IntroSet>> {
        let (sender, receiver) = flume::bounded(1);
        let _ = self
            .sender
            .send(ActorMessage::LookupIntroSet(target, sender));

        receiver
    }

    /// Resolve introduction sets advertising `tag`.
    pub fn lookup_tag(&self, tag: Tag) -> Receiver<Vec<IntroSet>> {
        let (sender, receiver) = flume::bounded(1);
        let _ = self.sender.send(ActorMessage::LookupTag(tag, sender));

        receiver
    }

    /// Seed or refresh the router table.
    pub fn put_router_contact(&self, contact: RouterContact) {
        let _ = self.sender.send(ActorMessage::PutRouterContact(contact));
    }

    /// Install the descriptor answered when someone resolves us.
    pub fn set_our_contact(&self, contact: RouterContact) {
        let _ = self.sender.send(ActorMessage::SetOurContact(contact));
    }

    /// Store an introduction set locally and propagate it to the peers
    /// closest to its address.
    pub fn publish_intro_set(&self, introset: IntroSet) {
        let _ = self.sender.send(ActorMessage::PublishIntroSet(introset));
    }

    /// Feed a DHT message parsed off the wire into the event loop.
    pub fn handle_inbound(&self, from: Key, msg: Message) {
        let _ = self.sender.send(ActorMessage::Inbound(from, msg));
    }

    /// Relay a DHT request originated by one of our own paths.
    pub fn relay_for_path(&self, path: PathId, msg: Message) {
        let _ = self.sender.send(ActorMessage::PathRequest(path, msg));
    }
}

enum ActorMessage {
    Shutdown,
    LookupRouter(RouterId, Sender<Vec<RouterContact>>),
    LookupIntroSet(ServiceAddress, Sender<Vec<IntroSet>>),
    LookupTag(Tag, Sender<Vec<IntroSet>>),
    PutRouterContact(RouterContact),
    SetOurContact(RouterContact),
    PublishIntroSet(IntroSet),
    Inbound(Key, Message),
    PathRequest(PathId, Message),
}

fn run(mut ctx: Context, receiver: Receiver<ActorMessage>) {
    let clock = MonotonicClock::default();

    loop {
        match receiver.recv_timeout(MAILBOX_POLL) {
            Ok(ActorMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(message) => handle_actor_message(&mut ctx, clock.now_ms(), message),
            Err(RecvTimeoutError::Timeout) => {}
        }

        ctx.tick(clock.now_ms());
    }

    // answer every outstanding waiter before the state goes away
    ctx.drain(clock.now_ms());
}

fn handle_actor_message(ctx: &mut Context, now: u64, message: ActorMessage) {
    match message {
        // handled by the loop
        ActorMessage::Shutdown => {}
        ActorMessage::LookupRouter(target, sender) => {
            if !ctx.lookup_router(now, target, Some(sender.clone())) {
                let _ = sender.send(Vec::new());
            }
        }
        ActorMessage::LookupIntroSet(target, sender) => {
            if !ctx.lookup_intro_set(now, target, Some(sender.clone())) {
                let _ = sender.send(Vec::new());
            }
        }
        ActorMessage::LookupTag(tag, sender) => {
            if !ctx.lookup_tag(now, tag, Some(sender.clone())) {
                let _ = sender.send(Vec::new());
            }
        }
        ActorMessage::PutRouterContact(contact) => {
            ctx.put_router_contact(now, contact);
        }
        ActorMessage::SetOurContact(contact) => ctx.set_our_contact(contact),
        ActorMessage::PublishIntroSet(introset) => {
            if !ctx.publish_intro_set(now, introset) {
                debug!("introset published locally only");
            }
        }
        ActorMessage::Inbound(from, msg) => ctx.handle_message(now, from, msg),
        ActorMessage::PathRequest(path, msg) => {
            ctx.relay_request_for_path(now, path, &msg);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::testing::{RecordingPathSink, RecordingTransport};

    fn dht() -> Dht {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        Dht::new(
            Key::random(),
            Box::new(RecordingTransport::default()),
            Box::new(RecordingPathSink::default()),
            Config::default(),
        )
    }

    #[test]
    fn shutdown() {
        let dht = dht();

        let clone = dht.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.shutdown();
        });

        dht.block_until_shutdown();
    }

    #[test]
    fn lookups_on_an_empty_table_answer_immediately() {
        let dht = dht();

        let contacts = dht.lookup_router(Key::random()).recv().unwrap();
        assert!(contacts.is_empty());

        let introsets = dht
            .lookup_intro_set(ServiceAddress(Key::random().0))
            .recv()
            .unwrap();
        assert!(introsets.is_empty());

        dht.block_until_shutdown();
    }
}
