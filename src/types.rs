//! Typed representations of the Discord objects this crate touches.
//!
//! Only the interaction-facing subset of the API is modelled: gateway
//! envelopes, interactions and their options, members, embeds, the
//! canonical interaction response, and command registration bodies.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

// ---------------------------------------------------------------------------
// Primitives
// ---------------------------------------------------------------------------

/// Discord IDs are snowflakes, normally transmitted as strings in JSON.
pub type Snowflake = String;

/// Snowflakes arrive as strings from Discord but as bare numbers from some
/// test fixtures and proxies; accept both.
mod snowflake {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    impl From<Raw> for String {
        fn from(raw: Raw) -> Self {
            match raw {
                Raw::Text(s) => s,
                Raw::Number(n) => n.to_string(),
            }
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Raw::deserialize(d).map(String::from)
    }

    pub fn deserialize_option<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<String>, D::Error> {
        Ok(Option::<Raw>::deserialize(d)?.map(String::from))
    }
}

// ---------------------------------------------------------------------------
// Gateway payload (the envelope that wraps every WS message)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// Response body of `GET /gateway/bot`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayBotInfo {
    pub url: String,
    pub shards: u32,
    pub session_start_limit: SessionStartLimit,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionStartLimit {
    pub total: u32,
    pub remaining: u32,
    pub reset_after: u64,
    #[serde(default)]
    pub max_concurrency: u32,
}

// ---------------------------------------------------------------------------
// User / Member
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct User {
    #[serde(deserialize_with = "snowflake::deserialize")]
    pub id: Snowflake,
    #[serde(default)]
    pub username: String,
    pub discriminator: Option<String>,
    pub avatar: Option<String>,
    #[serde(default)]
    pub bot: bool,
    pub global_name: Option<String>,
}

impl User {
    /// A user known only by id, e.g. before a lookup has filled it in.
    pub fn from_id(id: impl Into<Snowflake>) -> Self {
        Self {
            id: id.into(),
            username: String::new(),
            discriminator: None,
            avatar: None,
            bot: false,
            global_name: None,
        }
    }

    /// `Username#Discriminator` or just `Username` for the new username system.
    pub fn tag(&self) -> String {
        match self.discriminator.as_deref() {
            Some("0") | None => self.username.clone(),
            Some(disc) => format!("{}#{}", self.username, disc),
        }
    }
}

/// A guild member, or a bare user wrapped as one when resolved outside a guild.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Member {
    pub user: Option<User>,
    pub nick: Option<String>,
    #[serde(default)]
    pub roles: Vec<Snowflake>,
    pub joined_at: Option<String>,
}

impl Member {
    pub fn from_user(user: User) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.id.as_str())
    }

    /// Mention string (`<@id>`), empty when the member carries no user.
    pub fn mention(&self) -> String {
        self.id().map(|id| format!("<@{}>", id)).unwrap_or_default()
    }

    /// Nickname, then global display name, then username.
    pub fn display_name(&self) -> &str {
        if let Some(nick) = self.nick.as_deref() {
            return nick;
        }
        match &self.user {
            Some(user) => user.global_name.as_deref().unwrap_or(&user.username),
            None => "",
        }
    }
}

// ---------------------------------------------------------------------------
// Embed
// ---------------------------------------------------------------------------

/// A rich-content block attached to a response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(rename = "type", default = "rich")]
    kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

fn rich() -> String {
    "rich".to_string()
}

impl Embed {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: rich(),
            description: String::new(),
            color: 0,
            url: None,
            footer: None,
            fields: Vec::new(),
            timestamp: None,
        }
    }

    pub fn description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn color(mut self, color: u32) -> Self {
        self.color = color;
        self
    }

    pub fn color_rgb(self, r: u8, g: u8, b: u8) -> Self {
        self.color((u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b))
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn field(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
        inline: bool,
    ) -> Self {
        self.fields.push(EmbedField {
            name: name.into(),
            value: value.into(),
            inline,
        });
        self
    }

    pub fn footer(mut self, text: impl Into<String>) -> Self {
        self.footer = Some(EmbedFooter { text: text.into() });
        self
    }

    pub fn timestamp(mut self, ts: impl Into<String>) -> Self {
        self.timestamp = Some(ts.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

// ---------------------------------------------------------------------------
// Interactions
// ---------------------------------------------------------------------------

/// One remote-triggered invocation, received via webhook or INTERACTION_CREATE.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Interaction {
    #[serde(deserialize_with = "snowflake::deserialize")]
    pub id: Snowflake,
    #[serde(default, deserialize_with = "snowflake::deserialize_option")]
    pub application_id: Option<Snowflake>,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub data: Option<InteractionData>,
    #[serde(default, deserialize_with = "snowflake::deserialize_option")]
    pub guild_id: Option<Snowflake>,
    #[serde(default, deserialize_with = "snowflake::deserialize_option")]
    pub channel_id: Option<Snowflake>,
    pub member: Option<Member>,
    pub user: Option<User>,
    pub token: String,
}

impl Interaction {
    /// Name of the invoked command, if this interaction carries one.
    pub fn command_name(&self) -> Option<&str> {
        if self.kind == InteractionType::Ping {
            return None;
        }
        self.data.as_ref().and_then(|d| d.name.as_deref())
    }

    /// The user who triggered the interaction (member in guilds, user in DMs).
    pub fn author(&self) -> Option<&User> {
        self.member
            .as_ref()
            .and_then(|m| m.user.as_ref())
            .or(self.user.as_ref())
    }

    pub fn options(&self) -> &[CommandOption] {
        match (&self.kind, &self.data) {
            (InteractionType::Ping, _) | (_, None) => &[],
            (_, Some(data)) => &data.options,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum InteractionType {
    Ping = 1,
    ApplicationCommand = 2,
    MessageComponent = 3,
    ApplicationCommandAutocomplete = 4,
    ModalSubmit = 5,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct InteractionData {
    #[serde(default, deserialize_with = "snowflake::deserialize_option")]
    pub id: Option<Snowflake>,
    pub name: Option<String>,
    /// For components: the developer-defined `custom_id`.
    pub custom_id: Option<String>,
    #[serde(default)]
    pub options: Vec<CommandOption>,
    pub resolved: Option<ResolvedData>,
}

/// Users and members referenced by the options, pre-resolved by Discord.
///
/// Resolved members omit their `user`; it lives in `users` under the same id.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ResolvedData {
    #[serde(default)]
    pub users: HashMap<Snowflake, User>,
    #[serde(default)]
    pub members: HashMap<Snowflake, Member>,
}

impl ResolvedData {
    /// Combine the resolved member and user entries for `id`.
    pub fn member(&self, id: &str) -> Option<Member> {
        let user = self.users.get(id).cloned();
        match self.members.get(id) {
            Some(member) => {
                let mut member = member.clone();
                if member.user.is_none() {
                    member.user = user;
                }
                Some(member)
            }
            None => user.map(Member::from_user),
        }
    }
}

/// A named argument as sent on the wire. The type tag stays raw until
/// coercion so an unrecognised tag surfaces as a decode error there.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommandOption {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<CommandOption>,
    #[serde(default)]
    pub focused: bool,
}

/// The closed set of argument types a handler may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize_repr, Serialize_repr)]
#[repr(u8)]
pub enum OptionType {
    String = 3,
    Integer = 4,
    Boolean = 5,
    User = 6,
}

/// Raised when a wire type tag is outside [`OptionType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported option type tag {0}")]
pub struct UnknownOptionType(pub u8);

impl TryFrom<u8> for OptionType {
    type Error = UnknownOptionType;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            3 => Ok(Self::String),
            4 => Ok(Self::Integer),
            5 => Ok(Self::Boolean),
            6 => Ok(Self::User),
            other => Err(UnknownOptionType(other)),
        }
    }
}

impl fmt::Display for OptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::User => "user",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// Interaction responses (what we send back)
// ---------------------------------------------------------------------------

/// Text plus rich blocks; the value a dispatch produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Response {
    pub content: String,
    pub embeds: Vec<Embed>,
}

impl Response {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            embeds: Vec::new(),
        }
    }

    pub fn embed(embed: Embed) -> Self {
        Self {
            content: String::new(),
            embeds: vec![embed],
        }
    }

    pub fn with_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    /// Wrap as a channel-message callback body (`type: 4`).
    pub fn into_callback(self) -> InteractionResponse {
        InteractionResponse {
            kind: InteractionCallbackType::ChannelMessageWithSource,
            data: Some(InteractionCallbackData {
                tts: false,
                content: self.content,
                embeds: self.embeds,
                allowed_mentions: AllowedMentions::none(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionResponse {
    #[serde(rename = "type")]
    pub kind: InteractionCallbackType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<InteractionCallbackData>,
}

impl InteractionResponse {
    /// Bare acknowledgement of a liveness check.
    pub fn pong() -> Self {
        Self {
            kind: InteractionCallbackType::Pong,
            data: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum InteractionCallbackType {
    Pong = 1,
    ChannelMessageWithSource = 4,
    DeferredChannelMessageWithSource = 5,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionCallbackData {
    pub tts: bool,
    pub content: String,
    pub embeds: Vec<Embed>,
    pub allowed_mentions: AllowedMentions,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllowedMentions {
    pub parse: Vec<String>,
}

impl AllowedMentions {
    pub fn none() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Slash command registration payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationCommand {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub options: Vec<ApplicationCommandOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationCommandOption {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: OptionType,
    #[serde(default)]
    pub required: bool,
}

// ---------------------------------------------------------------------------
// Rate-limit info parsed from response headers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitInfo {
    /// Calls left in the current window; `None` when the header is absent.
    pub remaining: Option<u32>,
    /// Epoch seconds at which the window resets.
    pub reset_at: Option<f64>,
    pub reset_after: Option<f64>,
    pub bucket: Option<String>,
    pub is_global: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
