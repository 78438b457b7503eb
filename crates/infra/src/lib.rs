//! Infrastructure layer: the PDP outbox worker and its storage adapters.

pub mod outbox;
