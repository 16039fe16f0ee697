//! Discord interactions client.
//!
//! Commands are declared on a [`Router`] and answered either over the
//! gateway ([`GatewayClient`]) or through signed webhooks
//! ([`WebhookClient`]). Both funnel outbound traffic through the
//! bucket-locked REST pipeline in [`http`].

pub mod bucket;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod events;
pub mod gateway;
pub mod http;
pub mod router;
pub mod types;
pub mod webhook;

#[cfg(test)]
mod testing;

pub use bucket::{ApiRoute, BucketKey, BucketRegistry};
pub use client::{register_commands, GatewayClient, RegistrationReport, ShutdownHandle};
pub use config::{ClientConfig, ConfigError, Intents};
pub use dispatch::{ArgValue, Arguments, DispatchError, DispatchOutcome, Dispatcher, MemberLookup};
pub use gateway::{GatewayError, SessionState};
pub use http::{DiscordHttpClient, HttpError, TransportError};
pub use router::{ArgSpec, Handler, HandlerDef, RegistrationError, Reply, Router};
pub use types::{Embed, Interaction, Member, OptionType, Response, User};
pub use webhook::{Ed25519Verifier, SignatureVerifier, WebhookClient, WebhookError};
