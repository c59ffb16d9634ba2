//! Domain events for the server lifecycle saga.
//!
//! Every cross-service interaction happens through one of these events.
//! The envelope is a tagged union so consumers dispatch on the variant at
//! compile time, and each event derives a stable delivery fingerprint used
//! for consumer-side deduplication.

pub mod event;
pub mod topic;

pub use event::Event;
pub use topic::Topic;
