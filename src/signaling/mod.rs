/// Per-peer protocol handler and its sequential runner.
pub mod channel;
/// Wire messages.
pub mod message;
