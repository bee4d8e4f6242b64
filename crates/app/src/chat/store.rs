use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::watch;

use super::message::{ChatMessage, MessageId};

pub type Snapshot = Arc<Vec<ChatMessage>>;

/// Ordered conversation published as immutable snapshots.
///
/// Every mutation swaps in a new `Vec` with read-copy-update, so readers never see a
/// half-applied change and concurrent writers never lose one. Subscribers are woken
/// through a revision counter.
pub struct MessageStore {
    messages: ArcSwap<Vec<ChatMessage>>,
    revision: watch::Sender<u64>,
}

impl MessageStore {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            messages: ArcSwap::from_pointee(messages),
            revision,
        }
    }

    pub fn all(&self) -> Snapshot {
        self.messages.load_full()
    }

    pub fn get(&self, id: MessageId) -> Option<ChatMessage> {
        self.messages
            .load()
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.messages.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.load().is_empty()
    }

    /// The message currently receiving a reply, if any.
    pub fn in_flight(&self) -> Option<MessageId> {
        self.messages
            .load()
            .iter()
            .find(|message| message.is_loading)
            .map(|message| message.id)
    }

    pub fn append(&self, messages: Vec<ChatMessage>) {
        if messages.is_empty() {
            return;
        }

        self.messages.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + messages.len());
            next.extend(current.iter().cloned());
            next.extend(messages.iter().cloned());
            next
        });
        self.bump();
    }

    /// Appends only when no message is loading; the check and the append are one swap.
    pub fn append_if_idle(&self, messages: Vec<ChatMessage>) -> bool {
        let mut appended = false;
        self.messages.rcu(|current| {
            if current.iter().any(|message| message.is_loading) {
                appended = false;
                return Arc::clone(current);
            }

            appended = true;
            let mut next = Vec::with_capacity(current.len() + messages.len());
            next.extend(current.iter().cloned());
            next.extend(messages.iter().cloned());
            Arc::new(next)
        });

        if appended {
            self.bump();
        }
        appended
    }

    /// Applies `patch` to the message with `id`. Returns false when no such message exists.
    ///
    /// The patch may run more than once under contention and must only depend on its input.
    pub fn update_by_id<F>(&self, id: MessageId, mut patch: F) -> bool
    where
        F: FnMut(&mut ChatMessage),
    {
        let mut found = false;
        self.messages.rcu(|current| {
            let Some(index) = current.iter().position(|message| message.id == id) else {
                found = false;
                return Arc::clone(current);
            };

            found = true;
            let mut next = Vec::clone(current);
            patch(&mut next[index]);
            Arc::new(next)
        });

        if found {
            self.bump();
        }
        found
    }

    /// Like [`Self::update_by_id`], but refuses while any message is loading.
    pub fn update_if_idle<F>(&self, id: MessageId, mut patch: F) -> bool
    where
        F: FnMut(&mut ChatMessage),
    {
        let mut updated = false;
        self.messages.rcu(|current| {
            let index = current.iter().position(|message| message.id == id);
            let busy = current.iter().any(|message| message.is_loading);
            let Some(index) = index.filter(|_| !busy) else {
                updated = false;
                return Arc::clone(current);
            };

            updated = true;
            let mut next = Vec::clone(current);
            patch(&mut next[index]);
            Arc::new(next)
        });

        if updated {
            self.bump();
        }
        updated
    }

    pub fn replace_all(&self, messages: Vec<ChatMessage>) {
        self.messages.store(Arc::new(messages));
        self.bump();
    }

    /// Receives the revision number after each change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    fn bump(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }
}

/// Mutation capability scoped to a single message.
#[derive(Clone)]
pub struct MessageHandle {
    store: Arc<MessageStore>,
    id: MessageId,
}

impl MessageHandle {
    pub fn new(store: Arc<MessageStore>, id: MessageId) -> Self {
        Self { store, id }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    pub fn update<F>(&self, patch: F) -> bool
    where
        F: FnMut(&mut ChatMessage),
    {
        self.store.update_by_id(self.id, patch)
    }

    pub fn current(&self) -> Option<ChatMessage> {
        self.store.get(self.id)
    }
}
