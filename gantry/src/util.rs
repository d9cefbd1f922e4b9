//! Small convenience constructors for common types.

use gchat::TurnRequest;
use gcommon::TurnId;
use gprovider::{Message, ProviderKind, Role};

pub fn system_message(content: impl Into<String>) -> Message {
    Message::new(Role::System, content)
}

pub fn user_message(content: impl Into<String>) -> Message {
    Message::new(Role::User, content)
}

pub fn assistant_message(content: impl Into<String>) -> Message {
    Message::new(Role::Assistant, content)
}

pub fn turn(turn_id: impl Into<TurnId>, user_input: impl Into<String>) -> TurnRequest {
    TurnRequest::new(turn_id, user_input)
}

pub fn parse_provider_kind(value: &str) -> Option<ProviderKind> {
    ProviderKind::parse(value)
}
