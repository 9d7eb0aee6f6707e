//! The gateway client: login, lifecycle callbacks and the event loop.
//!
//! [`Client::start`] logs in over REST, runs [`EventHandler::setup_hook`]
//! to completion, then connects the gateway and consumes its events on the
//! calling task. Lifecycle callbacks are awaited inline, so they never run
//! concurrently with each other; interactions are spawned so a slow command
//! cannot stall heartbeats or other events.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::commands::CommandTree;
use crate::config::{IntentsConfig, DEFAULT_API_BASE, DEFAULT_GATEWAY_URL};
use crate::error::{BotError, CommandError, GatewayError, HttpError};
use crate::events::GatewayEvent;
use crate::gateway::{Connector, GatewayConfig, GatewayHandle, WebSocketConnector};
use crate::http::{DiscordApi, DiscordHttpClient};
use crate::session::Session;
use crate::types::*;

/// How long a closing event loop waits for in-flight commands.
const INTERACTION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a callback or command needs to act on Discord.
///
/// Cheap to clone; all fields are shared.
#[derive(Clone)]
pub struct Context {
    pub api: Arc<dyn DiscordApi>,
    pub session: Session,
    pub tree: Arc<CommandTree>,
    pub application_id: Snowflake,
    /// The bot's own account, as returned at login.
    pub user: User,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("application_id", &self.application_id)
            .field("user", &self.user.tag())
            .field("tree", &self.tree)
            .finish_non_exhaustive()
    }
}

/// Lifecycle callbacks. Every method defaults to a no-op.
///
/// An error from `setup_hook` aborts startup. Errors from the other
/// callbacks are logged and the connection carries on.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Runs once after login and before the gateway connects.
    async fn setup_hook(&self, _ctx: &Context) -> Result<(), BotError> {
        Ok(())
    }

    /// Runs once per gateway session, after READY.
    async fn on_ready(&self, _ctx: &Context, _ready: &ReadyEvent) -> Result<(), BotError> {
        Ok(())
    }

    /// The bot was added to `guild`.
    async fn on_guild_join(&self, _ctx: &Context, _guild: &Guild) -> Result<(), BotError> {
        Ok(())
    }
}

pub struct Client<H> {
    session: Session,
    intents: IntentsConfig,
    handler: H,
    tree: Arc<CommandTree>,
    connector: Arc<dyn Connector>,
    api: Option<Arc<dyn DiscordApi>>,
    api_base: String,
    gateway_url: String,
}

impl<H: EventHandler> Client<H> {
    /// Build a client over `session`.
    ///
    /// `None` intents means [`IntentsConfig::default`]. Member events are
    /// always requested on top of whatever is passed.
    pub fn new(session: Session, intents: Option<IntentsConfig>, handler: H) -> Self {
        let mut intents = intents.unwrap_or_default();
        intents.guild_members = true;
        Self {
            session,
            intents,
            handler,
            tree: Arc::new(CommandTree::new()),
            connector: Arc::new(WebSocketConnector),
            api: None,
            api_base: DEFAULT_API_BASE.to_string(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
        }
    }

    pub fn with_connector(mut self, connector: impl Connector + 'static) -> Self {
        self.connector = Arc::new(connector);
        self
    }

    /// Use `api` instead of a REST client built from the token.
    pub fn with_api(mut self, api: Arc<dyn DiscordApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    pub fn with_tree(mut self, tree: CommandTree) -> Self {
        self.tree = Arc::new(tree);
        self
    }

    pub fn intents(&self) -> &IntentsConfig {
        &self.intents
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn tree(&self) -> &CommandTree {
        &self.tree
    }

    /// Register commands before the client starts.
    pub fn tree_mut(&mut self) -> &mut CommandTree {
        Arc::make_mut(&mut self.tree)
    }

    /// Log in, run the setup hook, and process gateway events until the
    /// connection ends for good.
    pub async fn start(&self, token: &str) -> Result<(), BotError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(BotError::Authentication("no token provided".to_string()));
        }

        let api: Arc<dyn DiscordApi> = match &self.api {
            Some(api) => Arc::clone(api),
            None => Arc::new(DiscordHttpClient::with_base_url(
                self.session.clone(),
                token,
                &self.api_base,
            )),
        };

        let user = api.current_user().await.map_err(login_error)?;
        let application = api.current_application().await.map_err(login_error)?;
        info!(user = %user.tag(), application = %application.id, "logged in");

        let ctx = Context {
            api,
            session: self.session.clone(),
            tree: Arc::clone(&self.tree),
            application_id: application.id,
            user,
        };

        self.handler
            .setup_hook(&ctx)
            .instrument(info_span!("setup_hook"))
            .await?;

        let mut config = GatewayConfig::new(token, self.intents.bits());
        config.url = self.gateway_url.clone();
        let gateway = self.connector.connect(config).await?;
        info!("gateway connected, entering event loop");

        self.event_loop(&ctx, gateway).await
    }

    /// [`start`](Self::start), closing the session on every exit path,
    /// including when the returned future is dropped.
    pub async fn run(self, token: &str) -> Result<(), BotError> {
        let _scope = self.session.scope();
        self.start(token).await
    }

    async fn event_loop(&self, ctx: &Context, mut gateway: GatewayHandle) -> Result<(), BotError> {
        let mut state = LoopState::default();
        let mut in_flight = JoinSet::new();

        while let Some(event) = gateway.events.recv().await {
            // Reap finished commands.
            while in_flight.try_join_next().is_some() {}

            match event {
                GatewayEvent::Ready(ready) => self.on_ready(ctx, &mut state, ready).await,

                GatewayEvent::Resumed => debug!("gateway session resumed"),

                GatewayEvent::GuildCreate(guild) => {
                    self.on_guild_create(ctx, &mut state, guild).await
                }

                GatewayEvent::GuildDelete(guild) => {
                    if guild.unavailable {
                        warn!(guild = %guild.id, "guild became unavailable");
                    } else if state.known_guilds.remove(&guild.id) {
                        info!(guild = %guild.id, "removed from guild");
                    }
                }

                GatewayEvent::InteractionCreate(interaction) => match interaction.kind {
                    InteractionType::ApplicationCommand => {
                        in_flight.spawn(handle_interaction(ctx.clone(), interaction));
                    }
                    other => debug!(kind = ?other, "ignoring interaction"),
                },

                // Handled by the gateway driver.
                GatewayEvent::HeartbeatAck
                | GatewayEvent::HeartbeatRequest
                | GatewayEvent::Reconnect
                | GatewayEvent::InvalidSession(_) => {}

                GatewayEvent::Unknown { event_name, op, .. } => {
                    trace!(event = ?event_name, op, "unhandled gateway event");
                }
            }
        }

        drain_interactions(&mut in_flight).await;

        match gateway.driver.await {
            Ok(Ok(())) => {
                warn!("event stream ended, bot shutting down");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "gateway stopped");
                Err(e.into())
            }
            Err(e) => Err(BotError::Gateway(GatewayError::Connect(format!(
                "gateway driver task failed: {e}"
            )))),
        }
    }

    async fn on_ready(&self, ctx: &Context, state: &mut LoopState, ready: ReadyEvent) {
        if state.session_id.as_deref() == Some(ready.session_id.as_str()) {
            debug!(session = %ready.session_id, "duplicate READY ignored");
            return;
        }
        state.session_id = Some(ready.session_id.clone());
        // A fresh session lists every guild the bot is in.
        state.known_guilds = ready.guilds.iter().map(|g| g.id.clone()).collect();

        if let Err(e) = self
            .handler
            .on_ready(ctx, &ready)
            .instrument(info_span!("on_ready", session = %ready.session_id))
            .await
        {
            error!(error = %e, "on_ready failed");
        }
    }

    async fn on_guild_create(&self, ctx: &Context, state: &mut LoopState, guild: Guild) {
        if guild.unavailable {
            return;
        }
        let is_new = state.known_guilds.insert(guild.id.clone());
        if !is_new || state.session_id.is_none() {
            trace!(guild = %guild.id, "guild available");
            return;
        }

        info!(guild = %guild.id, name = %guild.name, "joined guild");
        if let Err(e) = self
            .handler
            .on_guild_join(ctx, &guild)
            .instrument(info_span!("on_guild_join", guild = %guild.id))
            .await
        {
            error!(error = %e, guild = %guild.id, "on_guild_join failed");
        }
    }
}

impl<H> std::fmt::Debug for Client<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("session", &self.session)
            .field("intents", &self.intents.bits())
            .field("tree", &self.tree)
            .field("gateway_url", &self.gateway_url)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct LoopState {
    /// Gateway session that has already had its `on_ready`.
    session_id: Option<String>,
    known_guilds: HashSet<Snowflake>,
}

fn login_error(e: HttpError) -> BotError {
    if e.is_unauthorized() {
        BotError::Authentication(e.to_string())
    } else {
        BotError::Http(e)
    }
}

/// Let running commands send their replies before the session closes.
async fn drain_interactions(in_flight: &mut JoinSet<()>) {
    if in_flight.is_empty() {
        return;
    }
    debug!(pending = in_flight.len(), "waiting for in-flight commands");
    let drained = tokio::time::timeout(INTERACTION_DRAIN_TIMEOUT, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(pending = in_flight.len(), "abandoning unfinished commands");
        in_flight.abort_all();
    }
}

async fn handle_interaction(ctx: Context, interaction: Box<Interaction>) {
    let command = interaction.command_name().unwrap_or_default().to_string();
    let span = info_span!("command", name = %command, interaction = %interaction.id);

    async move {
        let response = match ctx.tree.dispatch(&ctx, &interaction).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, "command failed");
                failure_reply(&e)
            }
        };
        if let Err(e) = ctx
            .api
            .create_interaction_response(&interaction.id, &interaction.token, &response)
            .await
        {
            error!(error = %e, "failed to send interaction response");
        }
    }
    .instrument(span)
    .await
}

fn failure_reply(e: &CommandError) -> InteractionResponse {
    match e {
        CommandError::UnknownCommand(name) => {
            InteractionResponse::ephemeral(format!("`/{name}` is not available right now."))
        }
        CommandError::MissingOption(option) => {
            InteractionResponse::ephemeral(format!("Missing required option `{option}`."))
        }
        _ => InteractionResponse::ephemeral("Something went wrong running that command."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::MastermindsBot;
    use crate::testing::*;
    use pretty_assertions::assert_eq;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Context: Send, Sync, Clone);

    fn client<H: EventHandler>(api: &MockApi, handler: H, script: Script) -> Client<H> {
        Client::new(Session::open().expect("session"), None, handler)
            .with_api(api.shared())
            .with_connector(ScriptedConnector::new(script))
    }

    #[test]
    fn member_intent_is_always_on() {
        let c = Client::new(Session::open().expect("session"), None, Recorder::default());
        assert!(c.intents().guild_members);
        assert!(!c.intents().message_content);

        let c = Client::new(
            Session::open().expect("session"),
            Some(IntentsConfig {
                guild_members: false,
                message_content: true,
                ..Default::default()
            }),
            Recorder::default(),
        );
        assert!(c.intents().guild_members);
        assert!(c.intents().message_content);
    }

    #[tokio::test]
    async fn blank_token_fails_before_anything_runs() {
        for token in ["", "   "] {
            let api = MockApi::new();
            let connector = ScriptedConnector::new(Script::new());
            let connects = connector.connects();
            let c = Client::new(Session::open().expect("session"), None, Recorder::default())
                .with_api(api.shared())
                .with_connector(connector);

            let err = c.start(token).await.unwrap_err();
            assert!(matches!(err, BotError::Authentication(_)));
            assert!(c.handler().log().is_empty());
            assert!(api.calls().is_empty());
            assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn rejected_token_is_authentication_error() {
        let api = MockApi::new().unauthorized();
        let c = client(&api, Recorder::default(), Script::new());
        let err = c.start("bad").await.unwrap_err();
        assert!(matches!(err, BotError::Authentication(_)));
        assert!(c.handler().log().is_empty());
    }

    #[tokio::test]
    async fn ready_fires_once_per_session() {
        let api = MockApi::new();
        let script = Script::new()
            .event(ready("s1", &[]))
            .event(ready("s1", &[]))
            .event(ready("s2", &[]));
        let c = client(&api, Recorder::default(), script);
        c.start("token").await.expect("clean exit");
        assert_eq!(
            c.handler().log(),
            vec!["setup:start", "setup:end", "ready:s1", "ready:s2"]
        );
    }

    #[tokio::test]
    async fn setup_completes_before_ready() {
        let api = MockApi::new();
        let script = Script::new().event(ready("s1", &[]));
        let c = client(&api, Recorder::default(), script);
        c.start("token").await.expect("clean exit");

        let log = c.handler().log();
        let end = log.iter().position(|e| e == "setup:end").expect("setup ran");
        let ready = log.iter().position(|e| e == "ready:s1").expect("ready ran");
        assert!(end < ready);
    }

    #[tokio::test]
    async fn guild_join_syncs_only_that_guild() {
        let api = MockApi::new();
        let script = Script::new()
            .event(ready("s1", &["100"]))
            .event(guild_create("100"))
            .event(guild_create("200"))
            .event(guild_create("200"));
        let c = client(&api, MastermindsBot, script);
        c.start("token").await.expect("clean exit");

        assert_eq!(api.global_syncs().len(), 1);
        assert_eq!(
            api.guild_syncs(),
            vec![("200".to_string(), Vec::<String>::new())]
        );
    }

    #[tokio::test]
    async fn guild_rejoin_after_removal_is_a_join() {
        let api = MockApi::new();
        let script = Script::new()
            .event(ready("s1", &["100"]))
            .event(guild_delete("100", true))
            .event(guild_create("100"))
            .event(guild_delete("100", false))
            .event(guild_create("100"));
        let c = client(&api, Recorder::default(), script);
        c.start("token").await.expect("clean exit");
        assert_eq!(
            c.handler().log(),
            vec!["setup:start", "setup:end", "ready:s1", "join:100"]
        );
    }

    #[tokio::test]
    async fn empty_registry_publishes_empty_global_set() {
        let api = MockApi::new();
        let c = client(&api, MastermindsBot, Script::new());
        assert!(c.tree().is_empty());
        c.start("token").await.expect("clean exit");
        assert_eq!(api.global_syncs(), vec![Vec::<String>::new()]);
    }

    #[tokio::test]
    async fn setup_failure_is_fatal_and_skips_gateway() {
        let api = MockApi::new().failing_syncs();
        let connector = ScriptedConnector::new(Script::new().event(ready("s1", &[])));
        let connects = connector.connects();
        let c = Client::new(Session::open().expect("session"), None, MastermindsBot)
            .with_api(api.shared())
            .with_connector(connector);

        let err = c.start("token").await.unwrap_err();
        assert!(matches!(err, BotError::Publish(_)));
        assert_eq!(connects.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_errors_do_not_stop_the_loop() {
        let api = MockApi::new();
        let script = Script::new()
            .event(ready("s1", &[]))
            .event(guild_create("300"))
            .event(ready("s2", &[]));
        let c = client(&api, Recorder::failing(), script);
        c.start("token").await.expect("loop survives callback errors");
        assert_eq!(
            c.handler().log(),
            vec!["setup:start", "setup:end", "ready:s1", "join:300", "ready:s2"]
        );
    }

    #[tokio::test]
    async fn gateway_auth_failure_surfaces_as_authentication() {
        let api = MockApi::new();
        let script = Script::new().outcome(Err(GatewayError::Authentication));
        let c = client(&api, Recorder::default(), script);
        let err = c.start("token").await.unwrap_err();
        assert!(matches!(err, BotError::Authentication(_)));
    }

    #[tokio::test]
    async fn session_closed_after_fatal_error() {
        let api = MockApi::new();
        let script = Script::new()
            .event(ready("s1", &[]))
            .outcome(Err(GatewayError::Fatal {
                code: 4014,
                reason: "disallowed intents",
            }));
        let c = client(&api, Recorder::default(), script);
        let session = c.session().clone();

        let err = c.run("token").await.unwrap_err();
        assert!(matches!(err, BotError::Gateway(GatewayError::Fatal { code: 4014, .. })));
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn session_closed_after_clean_exit() {
        let api = MockApi::new();
        let c = client(&api, Recorder::default(), Script::new());
        let session = c.session().clone();
        c.run("token").await.expect("clean exit");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn session_closed_when_run_is_cancelled() {
        let api = MockApi::new();
        let script = Script::new().event(ready("s1", &[])).hold_open();
        let c = client(&api, Recorder::default(), script);
        let session = c.session().clone();

        let result = tokio::time::timeout(Duration::from_millis(50), c.run("token")).await;
        assert!(result.is_err(), "run should still be going");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn interactions_are_answered() {
        let api = MockApi::new();
        let script = Script::new()
            .event(ready("s1", &[]))
            .event(GatewayEvent::InteractionCreate(Box::new(interaction(
                "weekly_goals",
                &[("goals", "ship it")],
            ))))
            .event(GatewayEvent::InteractionCreate(Box::new(interaction("nope", &[]))))
            .hold_open();
        let tree = crate::commands::builtin_commands(&Default::default());
        let c = client(&api, MastermindsBot, script).with_tree(tree);

        let _ = tokio::time::timeout(Duration::from_millis(100), c.start("token")).await;

        let responses = api.responses();
        assert_eq!(responses.len(), 2);
        let flags: Vec<Option<u32>> = responses
            .iter()
            .map(|r| r.data.as_ref().and_then(|d| d.flags))
            .collect();
        assert!(flags.contains(&None));
        assert!(flags.contains(&Some(EPHEMERAL)));
    }
    struct SlowReply;

    #[async_trait]
    impl crate::commands::CommandHandler for SlowReply {
        fn definition(&self) -> ApplicationCommand {
            ApplicationCommand::chat_input("slow", "Takes a moment")
        }

        async fn run(
            &self,
            ctx: &Context,
            _interaction: &Interaction,
        ) -> Result<InteractionResponse, CommandError> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let state = if ctx.session.is_closed() { "closed" } else { "open" };
            Ok(InteractionResponse::message(state))
        }
    }

    #[tokio::test]
    async fn in_flight_commands_reply_before_session_closes() {
        let api = MockApi::new();
        let script = Script::new()
            .event(ready("s1", &[]))
            .event(GatewayEvent::InteractionCreate(Box::new(interaction("slow", &[]))));
        let mut tree = CommandTree::new();
        tree.add_command(SlowReply).unwrap();
        let c = client(&api, Recorder::default(), script).with_tree(tree);
        let session = c.session().clone();

        c.run("token").await.expect("clean exit");

        assert!(session.is_closed());
        let replies: Vec<Option<String>> = api
            .responses()
            .into_iter()
            .map(|r| r.data.and_then(|d| d.content))
            .collect();
        assert_eq!(replies, vec![Some("open".to_string())]);
    }
}
