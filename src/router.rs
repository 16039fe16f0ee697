//! Command registry: maps command names to handlers.
//!
//! A handler is declared with a [`HandlerDef`] listing its arguments
//! explicitly (name, wire type, required flag, description) and a body that
//! receives the [`Interaction`] plus the coerced [`Arguments`]. The body's
//! return type must convert into a [`Reply`], so an unsendable return value
//! is rejected when the handler is registered rather than when it runs.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use tracing::debug;

use crate::dispatch::Arguments;
use crate::types::*;

/// Discord's upper bound on command and option names.
const MAX_NAME_LEN: usize = 32;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistrationError {
    #[error("invalid command name {0:?}")]
    InvalidName(String),
    #[error("argument {arg:?} of {command:?} has unsupported type tag {tag}")]
    UnsupportedArgumentType {
        command: String,
        arg: String,
        tag: u8,
    },
    #[error("argument {arg:?} declared twice on {command:?}")]
    DuplicateArgument { command: String, arg: String },
    #[error("required argument {arg:?} of {command:?} follows an optional one")]
    RequiredAfterOptional { command: String, arg: String },
}

// ---------------------------------------------------------------------------
// Handler return values
// ---------------------------------------------------------------------------

/// Everything a handler body may return.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Text(String),
    Embed(Embed),
    Response(Response),
}

impl Reply {
    pub fn into_response(self) -> Response {
        match self {
            Self::Text(text) => Response::text(text),
            Self::Embed(embed) => Response::embed(embed),
            Self::Response(response) => response,
        }
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<Embed> for Reply {
    fn from(embed: Embed) -> Self {
        Self::Embed(embed)
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self::Response(response)
    }
}

macro_rules! reply_from_display {
    ($($ty:ty),*) => {
        $(impl From<$ty> for Reply {
            fn from(value: $ty) -> Self {
                Self::Text(value.to_string())
            }
        })*
    };
}

reply_from_display!(i32, i64, u32, u64, f64, bool);

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// One declared argument, before validation.
#[derive(Debug, Clone)]
pub struct ArgSpec {
    name: String,
    description: Option<String>,
    wire_type: u8,
    required: bool,
}

impl ArgSpec {
    /// An argument with a raw wire type tag. Tags outside [`OptionType`]
    /// fail registration with [`RegistrationError::UnsupportedArgumentType`].
    pub fn of_type(name: impl Into<String>, wire_type: u8) -> Self {
        Self {
            name: name.into(),
            description: None,
            wire_type,
            required: true,
        }
    }

    pub fn new(name: impl Into<String>, kind: OptionType) -> Self {
        Self::of_type(name, kind as u8)
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, OptionType::String)
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, OptionType::Integer)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, OptionType::Boolean)
    }

    pub fn user(name: impl Into<String>) -> Self {
        Self::new(name, OptionType::User)
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// The argument may be absent from an invocation.
    pub fn optional(self) -> Self {
        self.required(false)
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// A validated argument of a registered handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerArg {
    pub name: String,
    pub description: String,
    pub kind: OptionType,
    pub required: bool,
}

/// Name, description, arguments, and registration scope of a handler.
#[derive(Debug, Clone)]
pub struct HandlerDef {
    name: String,
    description: String,
    args: Vec<ArgSpec>,
    global: bool,
    guilds: Vec<Snowflake>,
}

impl HandlerDef {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            args: Vec::new(),
            global: true,
            guilds: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: ArgSpec) -> Self {
        self.args.push(arg);
        self
    }

    /// Whether the command is registered application-wide.
    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    /// Also register the command in `guild_id`.
    pub fn guild(mut self, guild_id: impl Into<Snowflake>) -> Self {
        self.guilds.push(guild_id.into());
        self
    }

    fn into_handler(self, body: Arc<HandlerFn>) -> Result<Handler, RegistrationError> {
        let name = self.name.trim().to_lowercase();
        if !valid_name(&name) {
            return Err(RegistrationError::InvalidName(self.name));
        }

        let mut seen = HashSet::new();
        let mut optional_seen = false;
        let mut args = Vec::with_capacity(self.args.len());
        for spec in self.args {
            let kind = OptionType::try_from(spec.wire_type).map_err(|_| {
                RegistrationError::UnsupportedArgumentType {
                    command: name.clone(),
                    arg: spec.name.clone(),
                    tag: spec.wire_type,
                }
            })?;
            if !valid_name(&spec.name) {
                return Err(RegistrationError::InvalidName(spec.name));
            }
            if !seen.insert(spec.name.clone()) {
                return Err(RegistrationError::DuplicateArgument {
                    command: name,
                    arg: spec.name,
                });
            }
            if spec.required && optional_seen {
                return Err(RegistrationError::RequiredAfterOptional {
                    command: name,
                    arg: spec.name,
                });
            }
            optional_seen |= !spec.required;
            args.push(HandlerArg {
                name: spec.name,
                description: spec.description.unwrap_or_default(),
                kind,
                required: spec.required,
            });
        }

        Ok(Handler {
            name,
            description: self.description,
            args,
            global: self.global,
            guilds: self.guilds,
            body,
        })
    }
}

fn valid_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=MAX_NAME_LEN).contains(&len) && !name.chars().any(char::is_whitespace)
}

/// Discord rejects empty descriptions; a single space stands in.
fn non_empty(description: &str) -> String {
    if description.is_empty() {
        " ".to_string()
    } else {
        description.to_string()
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

type HandlerFn = dyn Fn(Interaction, Arguments) -> BoxFuture<'static, Reply> + Send + Sync;

/// A registered command.
#[derive(Clone)]
pub struct Handler {
    name: String,
    description: String,
    args: Vec<HandlerArg>,
    global: bool,
    guilds: Vec<Snowflake>,
    body: Arc<HandlerFn>,
}

impl Handler {
    /// Lower-cased lookup name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn args(&self) -> &[HandlerArg] {
        &self.args
    }

    pub fn is_global(&self) -> bool {
        self.global
    }

    pub fn guilds(&self) -> &[Snowflake] {
        &self.guilds
    }

    /// Run the body with already-coerced arguments.
    pub async fn invoke(&self, interaction: Interaction, args: Arguments) -> Reply {
        (self.body)(interaction, args).await
    }

    /// The registration body sent to Discord.
    pub fn to_command(&self) -> ApplicationCommand {
        ApplicationCommand {
            name: self.name.clone(),
            description: non_empty(&self.description),
            options: self
                .args
                .iter()
                .map(|arg| ApplicationCommandOption {
                    name: arg.name.clone(),
                    description: non_empty(&arg.description),
                    kind: arg.kind,
                    required: arg.required,
                })
                .collect(),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("args", &self.args)
            .field("global", &self.global)
            .field("guilds", &self.guilds)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Command name → handler. Built before a client starts and read-only while
/// it dispatches.
#[derive(Debug, Clone, Default)]
pub struct Router {
    handlers: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `body` under `def`'s name. A handler already registered
    /// under the same (case-insensitive) name is replaced.
    pub fn register<F, Fut, R>(&mut self, def: HandlerDef, body: F) -> Result<&Handler, RegistrationError>
    where
        F: Fn(Interaction, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Into<Reply> + 'static,
    {
        let body: Arc<HandlerFn> =
            Arc::new(move |interaction, args| body(interaction, args).map(Into::<Reply>::into).boxed());
        let handler = def.into_handler(body)?;
        let name = handler.name.clone();
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(command = %name, "replaced existing handler");
        } else {
            debug!(command = %name, "registered handler");
        }
        Ok(&self.handlers[&name])
    }

    /// Case-insensitive lookup.
    pub fn get(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(&name.to_lowercase())
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Handler> {
        self.handlers.values()
    }

    /// Move every handler of `other` into this router (later wins).
    pub fn merge(&mut self, other: Router) {
        self.handlers.extend(other.handlers);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ArgValue;
    use crate::testing::interaction;
    use serde_json::json;

    #[test]
    fn names_are_normalised_and_lookup_is_case_insensitive() {
        let mut router = Router::new();
        let handler = router
            .register(HandlerDef::new("GuessTheNumber", "Guess"), |_, _| async { "ok" })
            .unwrap();
        assert_eq!(handler.name(), "guessthenumber");
        assert_eq!(handler.description(), "Guess");
        assert!(router.get("GUESSTHENUMBER").is_some());
    }

    #[tokio::test]
    async fn re_registering_replaces_the_handler() {
        let mut router = Router::new();
        router
            .register(HandlerDef::new("echo", "first"), |_, _| async { "first" })
            .unwrap();
        router
            .register(HandlerDef::new("Echo", "second"), |_, _| async { "second" })
            .unwrap();

        assert_eq!(router.len(), 1);
        let handler = router.get("echo").unwrap();
        assert_eq!(handler.description(), "second");
        let reply = handler
            .invoke(interaction("echo", json!([])), Arguments::default())
            .await;
        assert_eq!(reply, Reply::Text("second".into()));
    }

    #[test]
    fn unsupported_argument_type_fails_only_that_registration() {
        let mut router = Router::new();
        let err = router
            .register(
                HandlerDef::new("bad", "x").arg(ArgSpec::of_type("channel", 7)),
                |_, _| async { "never" },
            )
            .unwrap_err();
        assert_eq!(
            err,
            RegistrationError::UnsupportedArgumentType {
                command: "bad".into(),
                arg: "channel".into(),
                tag: 7,
            }
        );
        router
            .register(HandlerDef::new("good", "x").arg(ArgSpec::string("text")), |_, _| async { "ok" })
            .unwrap();
        assert!(router.get("bad").is_none());
        assert!(router.get("good").is_some());
    }

    #[test]
    fn rejects_bad_declarations() {
        let mut router = Router::new();
        let noop = |_: Interaction, _: Arguments| async { "" };

        assert!(matches!(
            router.register(HandlerDef::new("", "x"), noop),
            Err(RegistrationError::InvalidName(_))
        ));
        assert!(matches!(
            router.register(HandlerDef::new("two words", "x"), noop),
            Err(RegistrationError::InvalidName(_))
        ));
        assert!(matches!(
            router.register(
                HandlerDef::new("dup", "x").arg(ArgSpec::string("a")).arg(ArgSpec::integer("a")),
                noop
            ),
            Err(RegistrationError::DuplicateArgument { .. })
        ));
        assert!(matches!(
            router.register(
                HandlerDef::new("order", "x")
                    .arg(ArgSpec::string("a").optional())
                    .arg(ArgSpec::integer("b")),
                noop
            ),
            Err(RegistrationError::RequiredAfterOptional { .. })
        ));
        assert!(router.is_empty());
    }

    #[test]
    fn registration_body_matches_wire_shape() {
        let mut router = Router::new();
        let handler = router
            .register(
                HandlerDef::new("embed", "Embed your message.")
                    .arg(ArgSpec::string("title").describe("Title for the embed"))
                    .arg(ArgSpec::string("description").optional())
                    .arg(ArgSpec::user("target").optional())
                    .global(false)
                    .guild("566407576686952480"),
                |_, _| async { Embed::new("t") },
            )
            .unwrap();

        assert!(!handler.is_global());
        assert_eq!(handler.guilds(), ["566407576686952480".to_string()]);
        assert_eq!(
            serde_json::to_value(handler.to_command()).unwrap(),
            json!({
                "name": "embed",
                "description": "Embed your message.",
                "options": [
                    {"name": "title", "description": "Title for the embed", "type": 3, "required": true},
                    {"name": "description", "description": " ", "type": 3, "required": false},
                    {"name": "target", "description": " ", "type": 6, "required": false}
                ]
            })
        );
    }

    #[test]
    fn reply_normalisation() {
        assert_eq!(Reply::from(10_i64).into_response(), Response::text("10"));
        assert_eq!(Reply::from(true).into_response(), Response::text("true"));
        assert_eq!(Reply::from("> hi").into_response(), Response::text("> hi"));
        let embed = Embed::new("t");
        assert_eq!(Reply::from(embed.clone()).into_response(), Response::embed(embed));
        let prebuilt = Response::text("x").with_embed(Embed::new("y"));
        assert_eq!(Reply::from(prebuilt.clone()).into_response(), prebuilt);
    }

    #[tokio::test]
    async fn handler_reply_can_own_data_built_from_arguments() {
        let mut router = Router::new();
        router
            .register(
                HandlerDef::new("shout", "x").arg(ArgSpec::string("text")),
                |_, args: Arguments| async move { args.str("text").unwrap_or_default().to_uppercase() },
            )
            .unwrap();
        let mut args = Arguments::default();
        args.insert("text", ArgValue::String("hey".into()));
        let reply = router
            .get("shout")
            .unwrap()
            .invoke(interaction("shout", json!([])), args)
            .await;
        assert_eq!(reply, Reply::Text("HEY".into()));
    }

    #[test]
    fn merge_combines_routers() {
        let mut a = Router::new();
        a.register(HandlerDef::new("one", ""), |_, _| async { 1_i64 }).unwrap();
        let mut b = Router::new();
        b.register(HandlerDef::new("two", ""), |_, _| async { 2_i64 }).unwrap();
        a.merge(b);
        assert_eq!(a.len(), 2);
    }
}
