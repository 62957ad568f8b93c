//! Shared domain types + core interfaces (traits) used across the codebase.
//!
//! Kept as a thin re-export layer so `crate::traits::*` stays stable for call
//! sites while the provider/gateway areas can evolve independently.

mod gateway;
mod provider;

pub use gateway::{
    plain_text, BotEvent, BotGateway, FetchedMessage, GroupInfo, GroupRole, MemberInfo,
    MessageEvent, PokeEvent, Segment, Sender,
};
pub use provider::{ChatOptions, LlmClient, ProviderResponse, ToolCall};
