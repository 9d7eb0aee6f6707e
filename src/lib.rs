//! Discord bot for the Masterminds community.
//!
//! Transport lives in `gateway` (WebSocket) and `http` (REST); the event
//! loop and lifecycle callbacks live in `client`; what the bot actually does
//! on startup, ready and guild join lives in `bot`; slash commands live in
//! `commands`.

pub mod bot;
pub mod client;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod http;
pub mod session;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod testing;

use tracing::info;

use crate::bot::MastermindsBot;
use crate::client::Client;
use crate::commands::builtin_commands;
use crate::config::BotConfig;
use crate::error::BotError;
use crate::session::Session;

/// Build the client for `config` over a freshly opened session.
pub fn build_client(config: &BotConfig) -> Result<Client<MastermindsBot>, BotError> {
    let session = Session::open()?;
    let tree = builtin_commands(&config.commands);
    info!(commands = ?tree, "registered commands");

    Ok(
        Client::new(session, Some(config.intents.clone()), MastermindsBot)
            .with_api_base(&config.api_base)
            .with_gateway_url(&config.gateway_url)
            .with_tree(tree),
    )
}

/// Run the bot until the gateway connection ends.
///
/// The HTTP session is closed when this returns or when the future is
/// dropped.
pub async fn run(config: BotConfig) -> Result<(), BotError> {
    let client = build_client(&config)?;
    client.run(&config.token).await
}
