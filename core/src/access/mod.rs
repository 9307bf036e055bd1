// Access control — per-subscriber payment state and its persistence

mod controller;
mod store;

pub use controller::{
    AuditReason, PaymentAudit, RecipientSplit, SubscriberAccessController, SubscriberRecord,
    MAX_AUDIT_ENTRIES,
};
pub use store::{MemorySubscriptionStore, SledSubscriptionStore, StoreError, SubscriptionStore};
