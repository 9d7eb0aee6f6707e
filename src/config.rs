//! Process configuration, read once from the environment at start.
//!
//! Nothing here is mutated after [`BotConfig::from_env`] returns; components
//! receive clones of the pieces they need.

use std::path::PathBuf;

use bitflags::bitflags;
use tracing::warn;

use crate::types::Snowflake;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg/?v=10&encoding=json";

// ---------------------------------------------------------------------------
// Gateway intents
// ---------------------------------------------------------------------------

bitflags! {
    /// Wire representation of the gateway intents bitmask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GatewayIntents: u64 {
        const GUILDS = 1 << 0;
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_MODERATION = 1 << 2;
        const GUILD_EXPRESSIONS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
        const MESSAGE_CONTENT = 1 << 15;
        const GUILD_SCHEDULED_EVENTS = 1 << 16;
        const AUTO_MODERATION_CONFIGURATION = 1 << 20;
        const AUTO_MODERATION_EXECUTION = 1 << 21;
        const GUILD_MESSAGE_POLLS = 1 << 24;
        const DIRECT_MESSAGE_POLLS = 1 << 25;
    }
}

/// Which event categories the bot asks the gateway for.
///
/// The default enables every intent except the three privileged ones
/// (`guild_members`, `guild_presences`, `message_content`), which must also
/// be switched on in the developer portal before Discord will accept them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentsConfig {
    pub guilds: bool,
    /// Privileged. Member list visibility.
    pub guild_members: bool,
    pub guild_moderation: bool,
    pub guild_expressions: bool,
    pub guild_integrations: bool,
    pub guild_webhooks: bool,
    pub guild_invites: bool,
    pub guild_voice_states: bool,
    /// Privileged.
    pub guild_presences: bool,
    pub guild_messages: bool,
    pub guild_message_reactions: bool,
    pub guild_message_typing: bool,
    pub direct_messages: bool,
    pub direct_message_reactions: bool,
    pub direct_message_typing: bool,
    /// Privileged.
    pub message_content: bool,
    pub guild_scheduled_events: bool,
    pub auto_moderation_configuration: bool,
    pub auto_moderation_execution: bool,
    pub guild_message_polls: bool,
    pub direct_message_polls: bool,
}

impl Default for IntentsConfig {
    fn default() -> Self {
        Self {
            guilds: true,
            guild_members: false,
            guild_moderation: true,
            guild_expressions: true,
            guild_integrations: true,
            guild_webhooks: true,
            guild_invites: true,
            guild_voice_states: true,
            guild_presences: false,
            guild_messages: true,
            guild_message_reactions: true,
            guild_message_typing: true,
            direct_messages: true,
            direct_message_reactions: true,
            direct_message_typing: true,
            message_content: false,
            guild_scheduled_events: true,
            auto_moderation_configuration: true,
            auto_moderation_execution: true,
            guild_message_polls: true,
            direct_message_polls: true,
        }
    }
}

impl IntentsConfig {
    /// Fold the named flags into the bitmask sent in IDENTIFY.
    pub fn bits(&self) -> GatewayIntents {
        let table = [
            (self.guilds, GatewayIntents::GUILDS),
            (self.guild_members, GatewayIntents::GUILD_MEMBERS),
            (self.guild_moderation, GatewayIntents::GUILD_MODERATION),
            (self.guild_expressions, GatewayIntents::GUILD_EXPRESSIONS),
            (self.guild_integrations, GatewayIntents::GUILD_INTEGRATIONS),
            (self.guild_webhooks, GatewayIntents::GUILD_WEBHOOKS),
            (self.guild_invites, GatewayIntents::GUILD_INVITES),
            (self.guild_voice_states, GatewayIntents::GUILD_VOICE_STATES),
            (self.guild_presences, GatewayIntents::GUILD_PRESENCES),
            (self.guild_messages, GatewayIntents::GUILD_MESSAGES),
            (self.guild_message_reactions, GatewayIntents::GUILD_MESSAGE_REACTIONS),
            (self.guild_message_typing, GatewayIntents::GUILD_MESSAGE_TYPING),
            (self.direct_messages, GatewayIntents::DIRECT_MESSAGES),
            (self.direct_message_reactions, GatewayIntents::DIRECT_MESSAGE_REACTIONS),
            (self.direct_message_typing, GatewayIntents::DIRECT_MESSAGE_TYPING),
            (self.message_content, GatewayIntents::MESSAGE_CONTENT),
            (self.guild_scheduled_events, GatewayIntents::GUILD_SCHEDULED_EVENTS),
            (
                self.auto_moderation_configuration,
                GatewayIntents::AUTO_MODERATION_CONFIGURATION,
            ),
            (
                self.auto_moderation_execution,
                GatewayIntents::AUTO_MODERATION_EXECUTION,
            ),
            (self.guild_message_polls, GatewayIntents::GUILD_MESSAGE_POLLS),
            (self.direct_message_polls, GatewayIntents::DIRECT_MESSAGE_POLLS),
        ];

        table
            .into_iter()
            .filter(|(on, _)| *on)
            .fold(GatewayIntents::empty(), |acc, (_, flag)| acc | flag)
    }
}

// ---------------------------------------------------------------------------
// Handler / logging settings
// ---------------------------------------------------------------------------

/// Settings consumed by the slash-command handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSettings {
    /// Command names to register. `None` registers every built-in command.
    pub enabled: Option<Vec<String>>,
    /// Where `/apply` submissions are forwarded.
    pub applications_channel_id: Option<Snowflake>,
    /// Where `/weekly_goals` posts are mirrored.
    pub goals_channel_id: Option<Snowflake>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info,masterminds_bot=debug`.
    pub filter: String,
    /// When set, logs are also written to a daily-rolling file here.
    pub dir: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Bot token. Empty when `DISCORD_TOKEN` is unset; `start` rejects it.
    pub token: String,
    pub api_base: String,
    pub gateway_url: String,
    pub intents: IntentsConfig,
    pub commands: CommandSettings,
    pub log: LogConfig,
}

impl BotConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let enabled = non_empty("MASTERMINDS_COMMANDS").map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        });

        let log = LogConfig {
            filter: non_empty("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            dir: non_empty("MASTERMINDS_LOG_DIR").map(PathBuf::from),
        };

        Self {
            token: lookup("DISCORD_TOKEN").unwrap_or_default(),
            api_base: non_empty("DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            gateway_url: non_empty("DISCORD_GATEWAY_URL")
                .unwrap_or_else(|| DEFAULT_GATEWAY_URL.to_string()),
            intents: IntentsConfig::default(),
            commands: CommandSettings {
                enabled,
                applications_channel_id: snowflake(non_empty(
                    "MASTERMINDS_APPLICATIONS_CHANNEL_ID",
                )),
                goals_channel_id: snowflake(non_empty("MASTERMINDS_GOALS_CHANNEL_ID")),
            },
            log,
        }
    }
}

/// Discord ids are numeric; anything else is a configuration mistake.
fn snowflake(raw: Option<String>) -> Option<Snowflake> {
    let raw = raw?;
    let trimmed = raw.trim();
    if trimmed.parse::<u64>().is_ok() {
        Some(trimmed.to_string())
    } else {
        warn!(value = %raw, "ignoring non-numeric channel id");
        None
    }
}
