//! `/apply`: ask to join a mastermind group.
//!
//! The applicant gets an ephemeral confirmation. When an applications
//! channel is configured the answers are forwarded there as an embed so
//! organisers can review them.

use async_trait::async_trait;
use tracing::info;

use crate::client::Context;
use crate::commands::CommandHandler;
use crate::error::CommandError;
use crate::types::*;

const ABOUT: &str = "about";
const EXPERIENCE: &str = "experience";
const MAX_ANSWER_LEN: u16 = 1000;
const EMBED_COLOR: u32 = 0x2E86DE;

#[derive(Debug, Clone, Default)]
pub struct Apply {
    channel_id: Option<Snowflake>,
}

impl Apply {
    pub fn new(channel_id: Option<Snowflake>) -> Self {
        Self { channel_id }
    }

    fn review_embed(applicant: &User, about: &str, experience: Option<&str>) -> Embed {
        let mut embed = Embed::new()
            .title("New mastermind application")
            .author(applicant)
            .color(EMBED_COLOR)
            .field("About", about, false)
            .footer(format!("User ID: {}", applicant.id))
            .timestamp(chrono::Utc::now().to_rfc3339());
        if let Some(experience) = experience {
            embed = embed.field("Experience", experience, false);
        }
        embed
    }
}

#[async_trait]
impl CommandHandler for Apply {
    fn definition(&self) -> ApplicationCommand {
        ApplicationCommand::chat_input("apply", "Apply to join a mastermind group")
            .string_option(
                ABOUT,
                "Tell us about yourself and what you're working on",
                true,
                Some(MAX_ANSWER_LEN),
            )
            .string_option(
                EXPERIENCE,
                "Any previous mastermind or accountability group experience",
                false,
                Some(MAX_ANSWER_LEN),
            )
    }

    async fn run(
        &self,
        ctx: &Context,
        interaction: &Interaction,
    ) -> Result<InteractionResponse, CommandError> {
        let applicant = interaction.author().ok_or(CommandError::MissingData)?;
        let about = interaction
            .option_str(ABOUT)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CommandError::MissingOption(ABOUT.to_string()))?;
        let experience = interaction
            .option_str(EXPERIENCE)
            .map(str::trim)
            .filter(|s| !s.is_empty());

        if let Some(channel_id) = &self.channel_id {
            let message = CreateMessage::new().embed(Self::review_embed(applicant, about, experience));
            ctx.api.create_message(channel_id, &message).await?;
            info!(applicant = %applicant.id, channel = %channel_id, "forwarded application");
        }

        Ok(InteractionResponse::ephemeral(format!(
            "Thanks {}! Your application has been received and an organiser will reach out soon.",
            applicant.display_name()
        )))
    }
}
