//! `/weekly_goals`: post this week's goals as a numbered list.

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use tracing::{info, warn};

use crate::client::Context;
use crate::commands::CommandHandler;
use crate::error::CommandError;
use crate::types::*;

const GOALS: &str = "goals";
const MAX_GOALS_LEN: u16 = 2000;
const MAX_GOALS: usize = 10;
const EMBED_COLOR: u32 = 0x27AE60;

#[derive(Debug, Clone, Default)]
pub struct WeeklyGoals {
    channel_id: Option<Snowflake>,
}

impl WeeklyGoals {
    pub fn new(channel_id: Option<Snowflake>) -> Self {
        Self { channel_id }
    }
}

/// Split on `;` or new lines, dropping blanks.
pub fn parse_goals(raw: &str) -> Vec<&str> {
    raw.split(|c: char| c == ';' || c == '\n')
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .collect()
}

/// ISO week label, eg `Week 2 of 2025`.
pub fn week_label(date: NaiveDate) -> String {
    let week = date.iso_week();
    format!("Week {} of {}", week.week(), week.year())
}

fn goals_embed(author: &User, goals: &[&str], today: NaiveDate) -> Embed {
    let list = goals
        .iter()
        .enumerate()
        .map(|(i, goal)| format!("{}. {}", i + 1, goal))
        .collect::<Vec<_>>()
        .join("\n");
    Embed::new()
        .title(format!("{}'s goals", author.display_name()))
        .author(author)
        .description(list)
        .color(EMBED_COLOR)
        .footer(week_label(today))
}

#[async_trait]
impl CommandHandler for WeeklyGoals {
    fn definition(&self) -> ApplicationCommand {
        ApplicationCommand::chat_input("weekly_goals", "Share your goals for this week")
            .string_option(
                GOALS,
                "Your goals, separated by ';' or new lines",
                true,
                Some(MAX_GOALS_LEN),
            )
    }

    async fn run(
        &self,
        ctx: &Context,
        interaction: &Interaction,
    ) -> Result<InteractionResponse, CommandError> {
        let author = interaction.author().ok_or(CommandError::MissingData)?;
        let raw = interaction
            .option_str(GOALS)
            .ok_or_else(|| CommandError::MissingOption(GOALS.to_string()))?;

        let goals = parse_goals(raw);
        if goals.is_empty() {
            return Ok(InteractionResponse::ephemeral(
                "Please list at least one goal, separated by ';'.",
            ));
        }
        if goals.len() > MAX_GOALS {
            return Ok(InteractionResponse::ephemeral(format!(
                "That's {} goals. Pick your top {} for this week.",
                goals.len(),
                MAX_GOALS
            )));
        }

        let embed = goals_embed(author, &goals, Utc::now().date_naive());

        match &self.channel_id {
            Some(channel_id) if interaction.channel_id.as_ref() != Some(channel_id) => {
                let message = CreateMessage::new().embed(embed.clone());
                match ctx.api.create_message(channel_id, &message).await {
                    Ok(_) => info!(author = %author.id, channel = %channel_id, "mirrored weekly goals"),
                    // The reply below still shows the goals.
                    Err(e) => warn!(error = %e, channel = %channel_id, "could not mirror weekly goals"),
                }
            }
            _ => {}
        }

        Ok(InteractionResponse::message(format!(
            "{} set {} goal{} for the week. Good luck!",
            author.display_name(),
            goals.len(),
            if goals.len() == 1 { "" } else { "s" }
        ))
        .with_embed(embed))
    }
}
