//! The shared outbound HTTP session.
//!
//! One [`Session`] is opened at process start and shared (by cheap clone)
//! between the REST client and any command handler that needs to make
//! outbound calls. The owner holds a [`SessionScope`]; when that scope is
//! dropped, on return, error, panic or cancellation, the session is closed
//! and any further request through it fails with
//! [`HttpError::SessionClosed`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{BotError, HttpError};

pub const USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/masterminds/masterminds-bot, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    http: reqwest::Client,
    closed: AtomicBool,
}

impl Session {
    /// Open a session with the bot's user agent.
    pub fn open() -> Result<Self, BotError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BotError::Session(e.to_string()))?;
        Ok(Self::from_client(http))
    }

    /// Wrap an existing client.
    pub fn from_client(http: reqwest::Client) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                http,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The underlying client, or an error once the session is closed.
    pub fn http(&self) -> Result<&reqwest::Client, HttpError> {
        if self.is_closed() {
            return Err(HttpError::SessionClosed);
        }
        Ok(&self.inner.http)
    }

    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("http session closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Guard that closes the session when dropped.
    pub fn scope(&self) -> SessionScope {
        SessionScope {
            session: self.clone(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Closes its session on drop.
#[must_use = "the session closes as soon as the scope is dropped"]
pub struct SessionScope {
    session: Session,
}

impl Drop for SessionScope {
    fn drop(&mut self) {
        self.session.close();
    }
}
