//! Per-channel handler polymorphism (spec.md §9 redesign note): a single
//! capability-set trait with WhatsApp and Discord implementations, rather
//! than duck-typed handler classes.

pub mod discord;
pub mod whatsapp;

use crate::error::Result;
use crate::storage::instances::Instance;
use crate::InboundMessage;

/// The capability set spec.md §9 names: `parse`, `resolve_user` (handled by
/// `crate::storage::users::UserStore` once `parse` yields the canonical
/// external id), and `dispatch` (handled by `crate::dispatch`). This trait
/// covers the channel-specific half: turning a raw provider payload into a
/// canonical `InboundMessage`.
pub trait ChannelHandler: Send + Sync {
    fn channel(&self) -> crate::ChannelKind;

    /// Parses a raw provider payload for `instance` into zero or more
    /// canonical inbound events (a single WhatsApp webhook call may carry
    /// several messages; a Discord socket push carries exactly one).
    fn parse(&self, instance: &Instance, raw: &serde_json::Value) -> Result<Vec<InboundMessage>>;
}
