//! Turns a decoded [`Interaction`] into a [`Response`].
//!
//! The dispatcher looks up the handler by command name, coerces the option
//! list into typed [`Arguments`], runs the handler, and normalises its
//! [`Reply`](crate::router::Reply). A command with no handler is answered by
//! the fallback instead of failing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::http::{DiscordHttpClient, HttpError};
use crate::router::{Handler, Router};
use crate::types::*;

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// One coerced argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Member(Member),
}

/// Option name → coerced value, as handed to a handler body. Optional
/// arguments the invoker left out are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    values: HashMap<String, ArgValue>,
}

impl Arguments {
    pub fn insert(&mut self, name: impl Into<String>, value: ArgValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn str(&self, name: &str) -> Option<&str> {
        match self.get(name)? {
            ArgValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name)? {
            ArgValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn boolean(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ArgValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn member(&self, name: &str) -> Option<&Member> {
        match self.get(name)? {
            ArgValue::Member(m) => Some(m),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Member lookup
// ---------------------------------------------------------------------------

/// Resolves a user-reference option that Discord did not pre-resolve.
#[async_trait]
pub trait MemberLookup: Send + Sync {
    async fn lookup_member(&self, guild_id: Option<&str>, user_id: &str) -> Result<Member, HttpError>;
}

#[async_trait]
impl MemberLookup for DiscordHttpClient {
    async fn lookup_member(&self, guild_id: Option<&str>, user_id: &str) -> Result<Member, HttpError> {
        match guild_id {
            Some(guild_id) => self.get_guild_member(guild_id, user_id).await,
            None => self.get_user(user_id).await.map(Member::from_user),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors & outcome
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("option {option:?} has unknown type tag {tag}")]
    UnknownOptionType { option: String, tag: u8 },
    #[error("option {option:?} is not a valid {expected}: {value}")]
    InvalidOptionValue {
        option: String,
        expected: OptionType,
        value: String,
    },
    #[error("command {command:?} is missing required argument {arg:?}")]
    MissingArgument { command: String, arg: String },
    #[error("failed to resolve member for option {option:?}")]
    MemberLookup {
        option: String,
        #[source]
        source: HttpError,
    },
}

/// Result of a dispatch that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// A registered handler produced the response.
    Handled(Response),
    /// No handler matched; the response comes from the fallback.
    Unhandled(Response),
}

impl DispatchOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, Self::Handled(_))
    }

    pub fn response(&self) -> &Response {
        match self {
            Self::Handled(r) | Self::Unhandled(r) => r,
        }
    }

    pub fn into_response(self) -> Response {
        match self {
            Self::Handled(r) | Self::Unhandled(r) => r,
        }
    }
}

type Fallback = dyn Fn(&Interaction) -> Response + Send + Sync;

fn not_supported(interaction: &Interaction) -> Response {
    let name = interaction.command_name().unwrap_or("unknown");
    Response::text(format!("> Command {} is not supported", name))
}

/// What the invoker sees when dispatch fails after authentication.
pub fn failure_response(command: &str) -> Response {
    Response::text(format!("> Command {} failed", command))
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Dispatcher {
    router: Arc<Router>,
    members: Option<Arc<dyn MemberLookup>>,
    fallback: Arc<Fallback>,
}

impl Dispatcher {
    /// A dispatcher without member lookup: unresolved user-reference
    /// options become members known only by id.
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            members: None,
            fallback: Arc::new(not_supported),
        }
    }

    pub fn with_member_lookup(mut self, members: Arc<dyn MemberLookup>) -> Self {
        self.members = Some(members);
        self
    }

    /// Replace the "command not supported" response.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&Interaction) -> Response + Send + Sync + 'static,
    {
        self.fallback = Arc::new(fallback);
        self
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub async fn dispatch(&self, interaction: Interaction) -> Result<DispatchOutcome, DispatchError> {
        let handler = match interaction.command_name() {
            Some(name) => self.router.get(name),
            None => None,
        };
        let Some(handler) = handler else {
            info!(
                command = interaction.command_name().unwrap_or(""),
                interaction_id = %interaction.id,
                "no handler registered"
            );
            return Ok(DispatchOutcome::Unhandled((self.fallback)(&interaction)));
        };

        debug!(command = handler.name(), interaction_id = %interaction.id, "dispatching");
        let args = self.coerce(handler, &interaction).await?;
        let reply = handler.invoke(interaction, args).await;
        Ok(DispatchOutcome::Handled(reply.into_response()))
    }

    /// Build the handler's arguments from the interaction's options.
    async fn coerce(&self, handler: &Handler, interaction: &Interaction) -> Result<Arguments, DispatchError> {
        let mut args = Arguments::default();
        let mut member_cache: HashMap<String, Member> = HashMap::new();

        for option in interaction.options() {
            let kind = OptionType::try_from(option.kind).map_err(|e| DispatchError::UnknownOptionType {
                option: option.name.clone(),
                tag: e.0,
            })?;
            let value = match kind {
                OptionType::String => ArgValue::String(text_value(option, kind)?),
                OptionType::Integer => ArgValue::Integer(integer_value(option)?),
                OptionType::Boolean => ArgValue::Boolean(boolean_value(option)?),
                OptionType::User => {
                    let user_id = text_value(option, kind)?;
                    let member = self
                        .resolve_member(interaction, &option.name, &user_id, &mut member_cache)
                        .await?;
                    ArgValue::Member(member)
                }
            };
            args.insert(option.name.clone(), value);
        }

        if let Some(missing) = handler
            .args()
            .iter()
            .find(|arg| arg.required && !args.contains(&arg.name))
        {
            return Err(DispatchError::MissingArgument {
                command: handler.name().to_string(),
                arg: missing.name.clone(),
            });
        }
        Ok(args)
    }

    async fn resolve_member(
        &self,
        interaction: &Interaction,
        option: &str,
        user_id: &str,
        cache: &mut HashMap<String, Member>,
    ) -> Result<Member, DispatchError> {
        if let Some(member) = cache.get(user_id) {
            return Ok(member.clone());
        }

        let resolved = interaction
            .data
            .as_ref()
            .and_then(|d| d.resolved.as_ref())
            .and_then(|r| r.member(user_id));

        let member = match (resolved, &self.members) {
            (Some(member), _) => member,
            (None, Some(lookup)) => lookup
                .lookup_member(interaction.guild_id.as_deref(), user_id)
                .await
                .map_err(|source| DispatchError::MemberLookup {
                    option: option.to_string(),
                    source,
                })?,
            (None, None) => Member::from_user(User::from_id(user_id)),
        };
        cache.insert(user_id.to_string(), member.clone());
        Ok(member)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("router", &self.router)
            .field("member_lookup", &self.members.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Coercion helpers
// ---------------------------------------------------------------------------

fn raw_value(option: &CommandOption, expected: OptionType) -> Result<&Value, DispatchError> {
    option
        .value
        .as_ref()
        .ok_or_else(|| DispatchError::InvalidOptionValue {
            option: option.name.clone(),
            expected,
            value: "null".to_string(),
        })
}

fn invalid(option: &CommandOption, expected: OptionType, value: &Value) -> DispatchError {
    DispatchError::InvalidOptionValue {
        option: option.name.clone(),
        expected,
        value: value.to_string(),
    }
}

/// Strings pass through; any other JSON value uses its text form.
fn text_value(option: &CommandOption, kind: OptionType) -> Result<String, DispatchError> {
    Ok(match raw_value(option, kind)? {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

fn integer_value(option: &CommandOption) -> Result<i64, DispatchError> {
    let value = raw_value(option, OptionType::Integer)?;
    let parsed = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| is_integral_i64(*f)).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(option, OptionType::Integer, value))
}

/// Whole and within `i64`, so the cast below is exact.
fn is_integral_i64(f: f64) -> bool {
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f)
}

fn boolean_value(option: &CommandOption) -> Result<bool, DispatchError> {
    let value = raw_value(option, OptionType::Boolean)?;
    let parsed = match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| invalid(option, OptionType::Boolean, value))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
