//! Error taxonomy for the bot.
//!
//! Transport-level failures ([`HttpError`], [`GatewayError`]) stay close to
//! the module that produces them; [`BotError`] is what `Client::start` and
//! the lifecycle callbacks return.

use thiserror::Error;

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum HttpError {
    /// Non-success status from Discord.
    #[error("Discord API error {status} on {route}: {body}")]
    Api {
        status: u16,
        body: String,
        route: String,
    },
    /// Transport / network error.
    #[error("HTTP transport error: {0}")]
    Transport(String),
    /// Serialisation error.
    #[error("Serialisation error: {0}")]
    Serde(String),
    /// The shared session was closed before the request was made.
    #[error("HTTP session is closed")]
    SessionClosed,
}

impl HttpError {
    /// `true` when Discord rejected the bot token.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, HttpError::Api { status: 401, .. })
    }
}

impl From<reqwest::Error> for HttpError {
    fn from(e: reqwest::Error) -> Self {
        HttpError::Transport(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("failed to connect to gateway: {0}")]
    Connect(String),
    #[error("gateway handshake failed: {0}")]
    Handshake(String),
    /// Close code 4004.
    #[error("gateway rejected the token (close 4004)")]
    Authentication,
    /// Close codes that must not be retried (4010-4014).
    #[error("fatal gateway close {code}: {reason}")]
    Fatal { code: u16, reason: &'static str },
    #[error("exceeded {0} reconnect attempts")]
    ReconnectExhausted(u32),
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("interaction carried no command data")]
    MissingData,
    #[error("missing required option `{0}`")]
    MissingOption(String),
    #[error("unknown command `/{0}`")]
    UnknownCommand(String),
    #[error("command `/{0}` is already registered")]
    Duplicate(String),
    #[error(transparent)]
    Http(#[from] HttpError),
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum BotError {
    /// Missing, blank or rejected token. Fatal.
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// The platform rejected a command sync.
    #[error("failed to publish commands: {0}")]
    Publish(#[source] HttpError),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Gateway(GatewayError),
    #[error("session error: {0}")]
    Session(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

impl From<GatewayError> for BotError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Authentication => BotError::Authentication(e.to_string()),
            other => BotError::Gateway(other),
        }
    }
}
