//! Topic-based publish/subscribe.
//!
//! - [`topic_tree`] — subscriber slab, topic index, message palette, drain list

pub mod topic_tree;

pub use topic_tree::{
    IteratorFlags, Subscriber, SubscriberId, Topic, TopicTree, UnsubscribeResult, MAX_PALETTE, MAX_PENDING,
};
