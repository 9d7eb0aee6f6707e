//! Slash commands: the registry ([`CommandTree`]) and the built-in handlers.
//!
//! The tree is filled before the client starts and is not changed after the
//! first sync. Publishing is a single bulk overwrite per scope, so an
//! unchanged tree can be synced any number of times with the same result.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::client::Context;
use crate::config::CommandSettings;
use crate::error::{BotError, CommandError};
use crate::types::{ApplicationCommand, Interaction, InteractionResponse, Snowflake};

pub mod apply;
pub mod weekly_goals;

pub use apply::Apply;
pub use weekly_goals::WeeklyGoals;

/// A remote-invocable command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Schema published to Discord.
    fn definition(&self) -> ApplicationCommand;

    /// Handle one invocation and produce the reply.
    async fn run(
        &self,
        ctx: &Context,
        interaction: &Interaction,
    ) -> Result<InteractionResponse, CommandError>;
}

/// Where a sync publishes the command set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncScope {
    Global,
    Guild(Snowflake),
}

impl std::fmt::Display for SyncScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncScope::Global => f.write_str("global"),
            SyncScope::Guild(id) => write!(f, "guild {}", id),
        }
    }
}

/// Registry of commands, keyed by name, in registration order.
#[derive(Clone, Default)]
pub struct CommandTree {
    commands: Vec<Arc<dyn CommandHandler>>,
}

impl CommandTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&mut self, handler: impl CommandHandler + 'static) -> Result<(), CommandError> {
        self.add_shared(Arc::new(handler))
    }

    fn add_shared(&mut self, handler: Arc<dyn CommandHandler>) -> Result<(), CommandError> {
        let name = handler.definition().name;
        if self.get(&name).is_some() {
            return Err(CommandError::Duplicate(name));
        }
        self.commands.push(handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn CommandHandler>> {
        self.commands
            .iter()
            .find(|c| c.definition().name == name)
    }

    /// Definitions for every registered command.
    pub fn commands(&self) -> Vec<ApplicationCommand> {
        self.commands.iter().map(|c| c.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Publish the full command set for `scope`, returning what Discord
    /// echoed back.
    pub async fn sync(
        &self,
        ctx: &Context,
        scope: SyncScope,
    ) -> Result<Vec<ApplicationCommand>, BotError> {
        let commands = self.commands();
        let published = match &scope {
            SyncScope::Global => {
                ctx.api
                    .bulk_overwrite_global_commands(&ctx.application_id, &commands)
                    .await
            }
            SyncScope::Guild(guild_id) => {
                ctx.api
                    .bulk_overwrite_guild_commands(&ctx.application_id, guild_id, &commands)
                    .await
            }
        }
        .map_err(BotError::Publish)?;

        info!(scope = %scope, count = published.len(), "synced commands");
        Ok(published)
    }

    /// Route an interaction to its handler.
    pub async fn dispatch(
        &self,
        ctx: &Context,
        interaction: &Interaction,
    ) -> Result<InteractionResponse, CommandError> {
        let name = interaction.command_name().ok_or(CommandError::MissingData)?;
        let handler = self
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        handler.run(ctx, interaction).await
    }
}

impl std::fmt::Debug for CommandTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.commands.iter().map(|c| c.definition().name))
            .finish()
    }
}

/// Build the tree from configuration.
///
/// With no explicit list every built-in command is registered; unknown
/// names in the list are skipped with a warning.
pub fn builtin_commands(settings: &CommandSettings) -> CommandTree {
    let available: Vec<Arc<dyn CommandHandler>> = vec![
        Arc::new(Apply::new(settings.applications_channel_id.clone())),
        Arc::new(WeeklyGoals::new(settings.goals_channel_id.clone())),
    ];

    let mut tree = CommandTree::new();
    match &settings.enabled {
        None => {
            for handler in available {
                // Built-in names are distinct.
                let _ = tree.add_shared(handler);
            }
        }
        Some(names) => {
            for name in names {
                match available.iter().find(|h| &h.definition().name == name) {
                    Some(handler) => {
                        if let Err(e) = tree.add_shared(Arc::clone(handler)) {
                            warn!(error = %e, "skipping command");
                        }
                    }
                    None => warn!(command = %name, "unknown command in configuration, skipping"),
                }
            }
        }
    }
    tree
}
