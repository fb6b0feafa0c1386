//! Topic → subscriber index with deferred fan-out.
//!
//! ```text
//!   topics: "room1" ──► {S1, S2}        palette: [m0, m1, m2, ...]
//!           "room2" ──► {S2}                       ▲   ▲
//!                                                  │   │
//!   S1.pending = [0, 2]   ─────────────────────────┘   │
//!   S2.pending = [0, 1, 2] ────────────────────────────┘
//!
//!   drain list: S1 ⇄ S2   (exactly the subscribers with pending > 0)
//! ```
//!
//! `publish` stores a message once and records its palette index for every
//! interested subscriber. Nothing is sent until the subscriber is drained,
//! either explicitly, when its 32-entry queue fills up, or when the palette
//! reaches 65 535 entries.

use std::collections::{BTreeSet, HashMap};

use log::trace;

/// Pending palette indices a subscriber can hold before it is drained.
pub const MAX_PENDING: usize = 32;

/// Palette entries allowed before every subscriber is force drained.
pub const MAX_PALETTE: usize = u16::MAX as usize;

/// Handle to a subscriber slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(usize);

impl SubscriberId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Position of a delivery within one subscriber's drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IteratorFlags {
    pub first: bool,
    pub last: bool,
}

impl IteratorFlags {
    pub const NONE: Self = Self {
        first: false,
        last: false,
    };
    pub const FIRST: Self = Self {
        first: true,
        last: false,
    };
    pub const LAST: Self = Self {
        first: false,
        last: true,
    };
    pub const FIRST_AND_LAST: Self = Self {
        first: true,
        last: true,
    };
}

/// A named channel and its members.
#[derive(Debug)]
pub struct Topic {
    name: String,
    subscribers: BTreeSet<SubscriberId>,
}

impl Topic {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.contains(&id)
    }
}

/// One endpoint registered with the tree.
#[derive(Debug)]
pub struct Subscriber<U> {
    user: U,
    topics: BTreeSet<String>,
    pending: [u16; MAX_PENDING],
    pending_len: usize,
    prev: Option<SubscriberId>,
    next: Option<SubscriberId>,
    iterating: bool,
}

impl<U> Subscriber<U> {
    fn new(user: U) -> Self {
        Self {
            user,
            topics: BTreeSet::new(),
            pending: [0; MAX_PENDING],
            pending_len: 0,
            prev: None,
            next: None,
            iterating: false,
        }
    }

    pub fn user(&self) -> &U {
        &self.user
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.topics.iter().map(String::as_str)
    }

    pub fn pending(&self) -> usize {
        self.pending_len
    }
}

/// Result of [`TopicTree::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubscribeResult {
    /// The subscriber was a member of the topic.
    pub removed: bool,
    /// The subscriber has no topics left.
    pub was_last: bool,
    /// Members left in the topic.
    pub remaining: usize,
}

/// The pub/sub index.
///
/// `U` is the opaque user key of each subscriber, `M` the queued message type.
#[derive(Debug)]
pub struct TopicTree<U, M> {
    topics: HashMap<String, Topic>,
    subscribers: Vec<Option<Subscriber<U>>>,
    free_slots: Vec<usize>,
    drain_head: Option<SubscriberId>,
    drain_tail: Option<SubscriberId>,
    messages: Vec<M>,
    recipients: Vec<SubscriberId>,
}

impl<U, M> Default for TopicTree<U, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U, M> TopicTree<U, M> {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
            subscribers: Vec::new(),
            free_slots: Vec::new(),
            drain_head: None,
            drain_tail: None,
            messages: Vec::new(),
            recipients: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Subscribers
    // ------------------------------------------------------------------

    pub fn create_subscriber(&mut self, user: U) -> SubscriberId {
        let subscriber = Some(Subscriber::new(user));
        match self.free_slots.pop() {
            Some(slot) => {
                self.subscribers[slot] = subscriber;
                SubscriberId(slot)
            }
            None => {
                self.subscribers.push(subscriber);
                SubscriberId(self.subscribers.len() - 1)
            }
        }
    }

    /// Unlink from every topic and from the drain list, then release.
    ///
    /// Queued messages for this subscriber are discarded.
    pub fn free_subscriber(&mut self, id: SubscriberId) -> Option<U> {
        let subscriber = self.subscribers.get(id.0)?.as_ref()?;
        let names: Vec<String> = subscriber.topics.iter().cloned().collect();

        for name in names {
            if let Some(topic) = self.topics.get_mut(&name) {
                topic.subscribers.remove(&id);
                if topic.subscribers.is_empty() {
                    self.topics.remove(&name);
                }
            }
        }

        if self.slot(id).is_some_and(|s| s.pending_len > 0) {
            self.unlink(id);
        }

        let subscriber = self.subscribers[id.0].take()?;
        self.free_slots.push(id.0);
        Some(subscriber.user)
    }

    pub fn subscriber(&self, id: SubscriberId) -> Option<&Subscriber<U>> {
        self.slot(id)
    }

    pub fn user(&self, id: SubscriberId) -> Option<&U> {
        self.slot(id).map(|s| &s.user)
    }

    pub fn num_subscribers(&self) -> usize {
        self.subscribers.len() - self.free_slots.len()
    }

    fn slot(&self, id: SubscriberId) -> Option<&Subscriber<U>> {
        self.subscribers.get(id.0).and_then(Option::as_ref)
    }

    fn slot_mut(&mut self, id: SubscriberId) -> Option<&mut Subscriber<U>> {
        self.subscribers.get_mut(id.0).and_then(Option::as_mut)
    }

    // ------------------------------------------------------------------
    // Topics
    // ------------------------------------------------------------------

    /// Add `id` to `topic`, creating the topic if needed.
    ///
    /// Returns the topic's new member count, or `None` when already
    /// subscribed or `id` is unknown.
    ///
    /// # Panics
    ///
    /// If the subscriber's topics are being iterated.
    pub fn subscribe(&mut self, id: SubscriberId, topic: &str) -> Option<usize> {
        let subscriber = self.slot_mut(id)?;
        if subscriber.iterating {
            panic!("cannot subscribe to '{topic}' while iterating the subscriber's topics");
        }
        if subscriber.topics.contains(topic) {
            return None;
        }
        subscriber.topics.insert(topic.to_string());

        let entry = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic::new(topic));
        entry.subscribers.insert(id);
        Some(entry.subscribers.len())
    }

    /// Remove `id` from `topic`, deleting the topic once empty.
    ///
    /// # Panics
    ///
    /// If the subscriber's topics are being iterated.
    pub fn unsubscribe(&mut self, id: SubscriberId, topic: &str) -> UnsubscribeResult {
        let not_member = UnsubscribeResult {
            removed: false,
            was_last: false,
            remaining: self.topics.get(topic).map_or(0, Topic::len),
        };

        let Some(subscriber) = self.slot_mut(id) else {
            return not_member;
        };
        if subscriber.iterating {
            panic!("cannot unsubscribe from '{topic}' while iterating the subscriber's topics");
        }
        if !subscriber.topics.remove(topic) {
            return not_member;
        }
        let was_last = subscriber.topics.is_empty();

        let mut remaining = 0;
        if let Some(entry) = self.topics.get_mut(topic) {
            entry.subscribers.remove(&id);
            remaining = entry.subscribers.len();
            if remaining == 0 {
                self.topics.remove(topic);
            }
        }

        UnsubscribeResult {
            removed: true,
            was_last,
            remaining,
        }
    }

    pub fn is_subscribed(&self, id: SubscriberId, topic: &str) -> bool {
        self.slot(id).is_some_and(|s| s.topics.contains(topic))
    }

    pub fn topic(&self, name: &str) -> Option<&Topic> {
        self.topics.get(name)
    }

    pub fn num_topics(&self) -> usize {
        self.topics.len()
    }

    /// Call `f` with each topic `id` belongs to.
    ///
    /// `f` gets the tree back, but subscribing or unsubscribing `id` itself
    /// from inside `f` panics.
    pub fn iterate_topics<F>(&mut self, id: SubscriberId, mut f: F)
    where
        F: FnMut(&mut Self, &str),
    {
        let names: Vec<String> = match self.slot_mut(id) {
            Some(subscriber) => {
                subscriber.iterating = true;
                subscriber.topics.iter().cloned().collect()
            }
            None => return,
        };

        for name in &names {
            f(self, name);
        }

        if let Some(subscriber) = self.slot_mut(id) {
            subscriber.iterating = false;
        }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Queue `message` for every member of `topic` except `sender`.
    ///
    /// The message is stored only if someone will receive it. Subscribers
    /// whose queue is full are drained through `callback` first. Returns
    /// whether anyone was addressed.
    pub fn publish<F>(&mut self, sender: Option<SubscriberId>, topic: &str, message: M, callback: &mut F) -> bool
    where
        F: FnMut(&U, &M, IteratorFlags) -> bool,
    {
        let mut recipients = std::mem::take(&mut self.recipients);
        recipients.clear();
        if let Some(entry) = self.topics.get(topic) {
            recipients.extend(entry.subscribers.iter().copied().filter(|&s| Some(s) != sender));
        }

        if recipients.is_empty() {
            self.recipients = recipients;
            return false;
        }

        if self.messages.len() >= MAX_PALETTE {
            trace!("palette full, draining every subscriber");
            self.drain(callback);
        }

        let index = self.messages.len() as u16;
        for &id in &recipients {
            if self.slot(id).is_some_and(|s| s.pending_len == MAX_PENDING) {
                self.drain_subscriber(id, callback);
            }
            self.enqueue(id, index);
        }
        self.messages.push(message);

        self.recipients = recipients;
        true
    }

    /// Deliver `message` right away to every member of `topic` except
    /// `sender`, bypassing the palette.
    pub fn publish_big<B, D>(&self, sender: Option<SubscriberId>, topic: &str, message: &B, mut deliver: D) -> bool
    where
        D: FnMut(&U, &B),
    {
        let Some(entry) = self.topics.get(topic) else {
            return false;
        };

        let mut delivered = false;
        for &id in &entry.subscribers {
            if Some(id) == sender {
                continue;
            }
            if let Some(subscriber) = self.slot(id) {
                deliver(&subscriber.user, message);
                delivered = true;
            }
        }
        delivered
    }

    /// Members of `topic` other than `sender`, in delivery order.
    pub fn recipients(&self, sender: Option<SubscriberId>, topic: &str) -> Vec<SubscriberId> {
        self.topics
            .get(topic)
            .map(|entry| {
                entry
                    .subscribers
                    .iter()
                    .copied()
                    .filter(|&s| Some(s) != sender)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn enqueue(&mut self, id: SubscriberId, index: u16) {
        let Some(subscriber) = self.slot_mut(id) else {
            return;
        };
        subscriber.pending[subscriber.pending_len] = index;
        subscriber.pending_len += 1;
        if subscriber.pending_len == 1 {
            self.link(id);
        }
    }

    // ------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------

    /// Deliver everything queued for `id`, oldest first.
    ///
    /// The queue is emptied before the first callback. A callback returning
    /// `true` ends this subscriber's drain; the rest of its queue is dropped.
    pub fn drain_subscriber<F>(&mut self, id: SubscriberId, callback: &mut F)
    where
        F: FnMut(&U, &M, IteratorFlags) -> bool,
    {
        let (indices, count) = match self.slot_mut(id) {
            Some(subscriber) if subscriber.pending_len > 0 => {
                let count = std::mem::replace(&mut subscriber.pending_len, 0);
                (subscriber.pending, count)
            }
            _ => return,
        };
        self.unlink(id);

        let Some(subscriber) = self.slot(id) else {
            return;
        };
        for (i, &index) in indices[..count].iter().enumerate() {
            let flags = IteratorFlags {
                first: i == 0,
                last: i + 1 == count,
            };
            let Some(message) = self.messages.get(index as usize) else {
                continue;
            };
            if callback(&subscriber.user, message, flags) {
                break;
            }
        }
    }

    /// Drain every subscriber with pending messages, then clear the palette.
    pub fn drain<F>(&mut self, callback: &mut F)
    where
        F: FnMut(&U, &M, IteratorFlags) -> bool,
    {
        while let Some(id) = self.drain_head {
            self.drain_subscriber(id, callback);
        }
        self.messages.clear();
    }

    /// Messages currently held in the palette.
    pub fn pending_messages(&self) -> usize {
        self.messages.len()
    }

    pub fn has_pending(&self, id: SubscriberId) -> bool {
        self.slot(id).is_some_and(|s| s.pending_len > 0)
    }

    fn link(&mut self, id: SubscriberId) {
        let tail = self.drain_tail;
        if let Some(subscriber) = self.slot_mut(id) {
            subscriber.prev = tail;
            subscriber.next = None;
        }
        match tail.and_then(|t| self.slot_mut(t)) {
            Some(previous) => previous.next = Some(id),
            None => self.drain_head = Some(id),
        }
        self.drain_tail = Some(id);
    }

    fn unlink(&mut self, id: SubscriberId) {
        let (prev, next) = match self.slot_mut(id) {
            Some(subscriber) => (subscriber.prev.take(), subscriber.next.take()),
            None => return,
        };

        match prev.and_then(|p| self.slot_mut(p)) {
            Some(previous) => previous.next = next,
            None => self.drain_head = next,
        }
        match next.and_then(|n| self.slot_mut(n)) {
            Some(following) => following.prev = prev,
            None => self.drain_tail = prev,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Tree = TopicTree<&'static str, String>;

    fn collect(tree: &mut Tree) -> Vec<(&'static str, String, IteratorFlags)> {
        let mut out = Vec::new();
        tree.drain(&mut |user: &&'static str, msg: &String, flags| {
            out.push((*user, msg.clone(), flags));
            false
        });
        out
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut tree = Tree::new();
        let s = tree.create_subscriber("s");
        assert_eq!(tree.subscribe(s, "t"), Some(1));
        assert_eq!(tree.subscribe(s, "t"), None);
        assert_eq!(tree.topic("t").map(Topic::len), Some(1));
    }

    #[test]
    fn test_unsubscribe_deletes_empty_topic() {
        let mut tree = Tree::new();
        let a = tree.create_subscriber("a");
        let b = tree.create_subscriber("b");
        tree.subscribe(a, "t");
        tree.subscribe(a, "u");
        tree.subscribe(b, "t");

        let r = tree.unsubscribe(a, "t");
        assert_eq!(
            r,
            UnsubscribeResult {
                removed: true,
                was_last: false,
                remaining: 1
            }
        );

        let r = tree.unsubscribe(b, "t");
        assert!(r.removed && r.was_last);
        assert_eq!(r.remaining, 0);
        assert!(tree.topic("t").is_none());

        assert!(!tree.unsubscribe(b, "t").removed);
    }

    #[test]
    fn test_no_self_delivery() {
        let mut tree = Tree::new();
        let s = tree.create_subscriber("s");
        tree.subscribe(s, "t");

        let mut noop = |_: &&str, _: &String, _| false;
        assert!(!tree.publish(Some(s), "t", "x".into(), &mut noop));
        assert_eq!(tree.pending_messages(), 0);
        assert!(collect(&mut tree).is_empty());
    }

    #[test]
    fn test_publish_to_unknown_topic() {
        let mut tree = Tree::new();
        let mut noop = |_: &&str, _: &String, _| false;
        assert!(!tree.publish(None, "nobody", "x".into(), &mut noop));
    }

    #[test]
    fn test_fifo_with_flags() {
        let mut tree = Tree::new();
        let s = tree.create_subscriber("s");
        for t in ["a", "b", "c"] {
            tree.subscribe(s, t);
        }
        let mut noop = |_: &&str, _: &String, _| false;
        for t in ["a", "b", "c"] {
            assert!(tree.publish(None, t, format!("to {t}"), &mut noop));
        }

        let got = collect(&mut tree);
        assert_eq!(
            got,
            vec![
                ("s", "to a".to_string(), IteratorFlags::FIRST),
                ("s", "to b".to_string(), IteratorFlags::NONE),
                ("s", "to c".to_string(), IteratorFlags::LAST),
            ]
        );
    }

    #[test]
    fn test_single_message_is_first_and_last() {
        let mut tree = Tree::new();
        let s = tree.create_subscriber("s");
        tree.subscribe(s, "t");
        let mut noop = |_: &&str, _: &String, _| false;
        tree.publish(None, "t", "only".into(), &mut noop);
        assert_eq!(collect(&mut tree)[0].2, IteratorFlags::FIRST_AND_LAST);
    }

    #[test]
    fn test_full_queue_drains_immediately() {
        let mut tree = Tree::new();
        let s = tree.create_subscriber("s");
        tree.subscribe(s, "t");

        let mut delivered = Vec::new();
        let mut record = |_: &&str, m: &String, _| {
            delivered.push(m.clone());
            false
        };
        for i in 0..=MAX_PENDING {
            tree.publish(None, "t", i.to_string(), &mut record);
        }

        // The 33rd publish flushed the first 32
        assert_eq!(delivered.len(), MAX_PENDING);
        assert_eq!(delivered[0], "0");
        assert_eq!(tree.subscriber(s).map(Subscriber::pending), Some(1));
    }

    #[test]
    fn test_palette_overflow_forces_full_drain() {
        let mut tree: TopicTree<u32, u32> = TopicTree::new();
        // Spread across subscribers so no single queue fills up
        for i in 0..4096u32 {
            let s = tree.create_subscriber(i);
            tree.subscribe(s, &format!("t{i}"));
        }

        let count = std::cell::Cell::new(0usize);
        let mut cb = |_: &u32, _: &u32, _| {
            count.set(count.get() + 1);
            false
        };
        for n in 0..MAX_PALETTE as u32 {
            tree.publish(None, &format!("t{}", n % 4096), n, &mut cb);
        }
        assert_eq!(count.get(), 0);
        assert_eq!(tree.pending_messages(), MAX_PALETTE);

        tree.publish(None, "t1", 0, &mut cb);
        assert_eq!(count.get(), MAX_PALETTE);
        assert_eq!(tree.pending_messages(), 1);
    }

    #[test]
    fn test_free_subscriber_unlinks_everything() {
        let mut tree = Tree::new();
        let a = tree.create_subscriber("a");
        let b = tree.create_subscriber("b");
        tree.subscribe(a, "t");
        tree.subscribe(b, "t");
        let mut noop = |_: &&str, _: &String, _| false;
        tree.publish(None, "t", "m".into(), &mut noop);

        assert_eq!(tree.free_subscriber(a), Some("a"));
        assert_eq!(tree.topic("t").map(Topic::len), Some(1));

        let got = collect(&mut tree);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, "b");

        assert_eq!(tree.free_subscriber(b), Some("b"));
        assert_eq!(tree.num_topics(), 0);
        assert_eq!(tree.num_subscribers(), 0);
        assert_eq!(tree.free_subscriber(b), None);
    }

    #[test]
    fn test_callback_stop_ends_drain_of_that_subscriber() {
        let mut tree = Tree::new();
        let s = tree.create_subscriber("s");
        tree.subscribe(s, "t");
        let mut noop = |_: &&str, _: &String, _| false;
        for m in ["1", "2", "3"] {
            tree.publish(None, "t", m.into(), &mut noop);
        }

        let mut seen = 0;
        tree.drain_subscriber(s, &mut |_: &&str, _: &String, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 1);
        assert!(!tree.has_pending(s));
    }

    #[test]
    fn test_publish_big_skips_sender() {
        let mut tree = Tree::new();
        let a = tree.create_subscriber("a");
        let b = tree.create_subscriber("b");
        tree.subscribe(a, "t");
        tree.subscribe(b, "t");

        let mut got = Vec::new();
        assert!(tree.publish_big(Some(a), "t", &vec![0u8; 20_000], |u: &&str, m: &Vec<u8>| {
            got.push((*u, m.len()))
        }));
        assert_eq!(got, vec![("b", 20_000)]);
        assert_eq!(tree.pending_messages(), 0);
    }

    #[test]
    fn test_iterate_topics_allows_other_subscribers() {
        let mut tree = Tree::new();
        let a = tree.create_subscriber("a");
        let b = tree.create_subscriber("b");
        tree.subscribe(a, "x");
        tree.subscribe(a, "y");

        let mut seen = Vec::new();
        tree.iterate_topics(a, |tree, topic| {
            seen.push(topic.to_string());
            tree.subscribe(b, topic);
        });
        assert_eq!(seen, vec!["x", "y"]);
        assert!(tree.is_subscribed(b, "y"));

        // Guard is lifted afterwards
        assert_eq!(tree.subscribe(a, "z"), Some(1));
    }

    #[test]
    #[should_panic(expected = "while iterating")]
    fn test_mutating_iterated_subscriber_panics() {
        let mut tree = Tree::new();
        let a = tree.create_subscriber("a");
        tree.subscribe(a, "x");
        tree.iterate_topics(a, |tree, topic| {
            tree.unsubscribe(a, topic);
        });
    }

    #[test]
    fn test_small_broadcast() {
        let mut tree = Tree::new();
        let s1 = tree.create_subscriber("s1");
        let s2 = tree.create_subscriber("s2");
        tree.subscribe(s1, "room1");
        tree.subscribe(s2, "room1");

        let mut noop = |_: &&str, _: &String, _| false;
        assert!(tree.publish(None, "room1", "hi".into(), &mut noop));

        let mut got: Vec<_> = collect(&mut tree).into_iter().map(|(u, m, _)| (u, m)).collect();
        got.sort();
        assert_eq!(got, vec![("s1", "hi".to_string()), ("s2", "hi".to_string())]);
        assert!(collect(&mut tree).is_empty());
    }
}
