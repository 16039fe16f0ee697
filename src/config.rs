//! Client configuration, loadable from the environment.

use std::env;

use bitflags::bitflags;

use crate::http::DEFAULT_API_BASE;

bitflags! {
    /// Gateway intents sent with IDENTIFY.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Intents: u32 {
        const GUILDS = 1;
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const MESSAGE_CONTENT = 1 << 15;
    }
}

impl Default for Intents {
    /// GUILDS | GUILD_MESSAGES (513). Interactions need no privileged intents.
    fn default() -> Self {
        Self::GUILDS | Self::GUILD_MESSAGES
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable not set")]
    Missing(&'static str),
    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
    #[error("interaction endpoint must begin with '/': {0}")]
    InvalidEndpoint(String),
}

/// Everything a client needs to talk to Discord.
#[derive(Clone)]
pub struct ClientConfig {
    pub token: String,
    pub application_id: String,
    /// Hex-encoded Ed25519 public key, required only by the webhook client.
    pub public_key: Option<String>,
    pub api_base: String,
    pub intents: Intents,
    pub interaction_endpoint: String,
    pub port: u16,
}

impl ClientConfig {
    pub fn new(token: impl Into<String>, application_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            application_id: application_id.into(),
            public_key: None,
            api_base: DEFAULT_API_BASE.to_string(),
            intents: Intents::default(),
            interaction_endpoint: "/interactions".to_string(),
            port: 80,
        }
    }

    pub fn public_key(mut self, key: impl Into<String>) -> Self {
        self.public_key = Some(key.into());
        self
    }

    pub fn intents(mut self, intents: Intents) -> Self {
        self.intents = intents;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn interaction_endpoint(mut self, endpoint: impl Into<String>) -> Result<Self, ConfigError> {
        let endpoint = endpoint.into();
        if !endpoint.starts_with('/') {
            return Err(ConfigError::InvalidEndpoint(endpoint));
        }
        self.interaction_endpoint = endpoint;
        Ok(self)
    }

    /// Load from the process environment, reading a `.env` file first if
    /// one exists.
    ///
    /// | Variable | Required | Default |
    /// |---|---|---|
    /// | `DISCORD_TOKEN` | yes | |
    /// | `DISCORD_APPLICATION_ID` | yes | |
    /// | `DISCORD_PUBLIC_KEY` | webhook only | |
    /// | `DISCORD_API_BASE` | no | `https://discord.com/api/v10` |
    /// | `INTERACTIONS_ENDPOINT` | no | `/interactions` |
    /// | `INTERACTIONS_PORT` | no | `80` |
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let token = lookup("DISCORD_TOKEN").ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;
        let application_id = lookup("DISCORD_APPLICATION_ID")
            .ok_or(ConfigError::Missing("DISCORD_APPLICATION_ID"))?;

        let mut config = Self::new(token, application_id);
        config.public_key = lookup("DISCORD_PUBLIC_KEY");
        if let Some(base) = lookup("DISCORD_API_BASE") {
            config.api_base = base;
        }
        if let Some(endpoint) = lookup("INTERACTIONS_ENDPOINT") {
            config = config.interaction_endpoint(endpoint)?;
        }
        if let Some(port) = lookup("INTERACTIONS_PORT") {
            config.port = port.parse().map_err(|_| ConfigError::Invalid {
                name: "INTERACTIONS_PORT",
                value: port,
            })?;
        }
        Ok(config)
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("token", &"<redacted>")
            .field("application_id", &self.application_id)
            .field("public_key", &self.public_key)
            .field("api_base", &self.api_base)
            .field("intents", &self.intents)
            .field("interaction_endpoint", &self.interaction_endpoint)
            .field("port", &self.port)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a HashMap<&str, &str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| vars.get(name).map(|v| v.to_string())
    }

    #[test]
    fn default_intents_match_identify_mask() {
        assert_eq!(Intents::default().bits(), 513);
    }

    #[test]
    fn loads_required_and_optional_values() {
        let vars = HashMap::from([
            ("DISCORD_TOKEN", "tok"),
            ("DISCORD_APPLICATION_ID", "app"),
            ("INTERACTIONS_PORT", "8080"),
            ("INTERACTIONS_ENDPOINT", "/hooks"),
        ]);
        let config = ClientConfig::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(config.token, "tok");
        assert_eq!(config.application_id, "app");
        assert_eq!(config.port, 8080);
        assert_eq!(config.interaction_endpoint, "/hooks");
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert!(config.public_key.is_none());
    }

    #[test]
    fn missing_token_is_an_error() {
        let vars = HashMap::from([("DISCORD_APPLICATION_ID", "app")]);
        let err = ClientConfig::from_lookup(lookup(&vars)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DISCORD_TOKEN")));
    }

    #[test]
    fn rejects_relative_endpoint_and_bad_port() {
        let vars = HashMap::from([
            ("DISCORD_TOKEN", "tok"),
            ("DISCORD_APPLICATION_ID", "app"),
            ("INTERACTIONS_ENDPOINT", "hooks"),
        ]);
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::InvalidEndpoint(_))
        ));

        let vars = HashMap::from([
            ("DISCORD_TOKEN", "tok"),
            ("DISCORD_APPLICATION_ID", "app"),
            ("INTERACTIONS_PORT", "eighty"),
        ]);
        assert!(matches!(
            ClientConfig::from_lookup(lookup(&vars)),
            Err(ConfigError::Invalid { name: "INTERACTIONS_PORT", .. })
        ));
    }

    #[test]
    fn debug_redacts_token() {
        let config = ClientConfig::new("super-secret", "app");
        assert!(!format!("{config:?}").contains("super-secret"));
    }
}
