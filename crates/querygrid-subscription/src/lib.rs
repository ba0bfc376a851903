//! querygrid-subscription — shares one transport subscription per topic
//! across any number of local subscribers.
//!
//! ## Lifecycle
//!
//! ```text
//! Connecting ──▶ Active ──▶ Reconnecting ──▶ Active ...
//!      │            │             │
//!      └────────────┴─────────────┴──▶ Closed
//! ```
//!
//! The first `subscribe` for a topic spawns a task that owns the transport
//! stream. Dropped streams are reopened with jittered exponential backoff.
//! Subscribers only ever see data events and at most one terminal
//! `Closed` notification. The task stops when the last subscriber leaves.

pub mod manager;

pub use manager::{
    CloseReason, EventCallback, Subscription, SubscriptionConfig, SubscriptionEvent,
    SubscriptionManager, SubscriptionState,
};
