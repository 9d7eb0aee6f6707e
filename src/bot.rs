//! The Masterminds bot's lifecycle behaviour.
//!
//! Commands are published globally once at startup, and again scoped to a
//! guild whenever the bot joins one so they show up there without waiting
//! for global propagation.

use async_trait::async_trait;
use tracing::info;

use crate::client::{Context, EventHandler};
use crate::commands::SyncScope;
use crate::error::BotError;
use crate::types::{Guild, ReadyEvent};

#[derive(Debug, Default, Clone, Copy)]
pub struct MastermindsBot;

#[async_trait]
impl EventHandler for MastermindsBot {
    async fn setup_hook(&self, ctx: &Context) -> Result<(), BotError> {
        ctx.tree.sync(ctx, SyncScope::Global).await?;
        Ok(())
    }

    async fn on_ready(&self, _ctx: &Context, ready: &ReadyEvent) -> Result<(), BotError> {
        info!(
            guilds = ready.guilds.len(),
            "Logged in as {} (ID: {})",
            ready.user.tag(),
            ready.user.id
        );
        Ok(())
    }

    async fn on_guild_join(&self, ctx: &Context, guild: &Guild) -> Result<(), BotError> {
        ctx.tree.sync(ctx, SyncScope::Guild(guild.id.clone())).await?;
        Ok(())
    }
}
