//! Outbound notification record.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    InApp,
    Email,
    Webhook,
    Push,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Channel::InApp => "in_app",
            Channel::Email => "email",
            Channel::Webhook => "webhook",
            Channel::Push => "push",
        };
        f.write_str(s)
    }
}

/// A notification to deliver over one or more channels.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Notification {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,
    #[builder(default, setter(strip_option))]
    pub user_id: Option<String>,
    pub title: String,
    pub body: String,
    pub channels: Vec<Channel>,
    /// Channel-specific detail, e.g. `webhook_url`, `email`, `push_token`.
    #[builder(default = serde_json::Value::Null)]
    pub metadata: serde_json::Value,
}
