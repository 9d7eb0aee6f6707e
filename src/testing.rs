//! Test doubles: a recording [`DiscordApi`], a scripted [`Connector`], a
//! recording [`EventHandler`] and payload builders.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::client::{Context, EventHandler};
use crate::commands::CommandTree;
use crate::error::{BotError, GatewayError, HttpError};
use crate::events::GatewayEvent;
use crate::gateway::{Connector, GatewayConfig, GatewayHandle};
use crate::http::DiscordApi;
use crate::session::Session;
use crate::types::*;

pub const APP_ID: &str = "42";

#[derive(Debug, Clone)]
pub enum ApiCall {
    CurrentUser,
    CurrentApplication,
    GlobalSync(Vec<String>),
    GuildSync(String, Vec<String>),
    Respond(InteractionResponse),
    Message(String, CreateMessage),
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<ApiCall>>,
    unauthorized: bool,
    failing_syncs: bool,
}

/// Records every call; succeeds unless configured otherwise.
#[derive(Clone, Default)]
pub struct MockApi {
    state: Arc<MockState>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Login calls answer 401.
    pub fn unauthorized(self) -> Self {
        self.configure(|s| s.unauthorized = true)
    }

    /// Command syncs answer 400.
    pub fn failing_syncs(self) -> Self {
        self.configure(|s| s.failing_syncs = true)
    }

    fn configure(self, f: impl FnOnce(&mut MockState)) -> Self {
        let mut state = MockState {
            calls: Mutex::new(Vec::new()),
            unauthorized: self.state.unauthorized,
            failing_syncs: self.state.failing_syncs,
        };
        f(&mut state);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn shared(&self) -> Arc<dyn DiscordApi> {
        Arc::new(self.clone())
    }

    pub fn context(&self, tree: CommandTree) -> Context {
        Context {
            api: self.shared(),
            session: Session::from_client(reqwest::Client::new()),
            tree: Arc::new(tree),
            application_id: APP_ID.to_string(),
            user: user("1", "masterminds"),
        }
    }

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn global_syncs(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::GlobalSync(names) => Some(names),
                _ => None,
            })
            .collect()
    }

    pub fn guild_syncs(&self) -> Vec<(String, Vec<String>)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::GuildSync(guild, names) => Some((guild, names)),
                _ => None,
            })
            .collect()
    }

    pub fn responses(&self) -> Vec<InteractionResponse> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::Respond(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn messages(&self) -> Vec<(String, CreateMessage)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ApiCall::Message(channel, m) => Some((channel, m)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: ApiCall) {
        self.state.calls.lock().unwrap().push(call);
    }

    fn rejected(status: u16, route: &str) -> HttpError {
        HttpError::Api {
            status,
            body: format!("{status}: rejected"),
            route: route.to_string(),
        }
    }

    fn echo(commands: &[ApplicationCommand]) -> Vec<ApplicationCommand> {
        commands
            .iter()
            .enumerate()
            .map(|(i, c)| ApplicationCommand {
                id: Some(format!("{}", 1000 + i)),
                ..c.clone()
            })
            .collect()
    }
}

fn names(commands: &[ApplicationCommand]) -> Vec<String> {
    commands.iter().map(|c| c.name.clone()).collect()
}

#[async_trait]
impl DiscordApi for MockApi {
    async fn current_user(&self) -> Result<User, HttpError> {
        self.record(ApiCall::CurrentUser);
        if self.state.unauthorized {
            return Err(Self::rejected(401, "GET /users/@me"));
        }
        Ok(user("1", "masterminds"))
    }

    async fn current_application(&self) -> Result<Application, HttpError> {
        self.record(ApiCall::CurrentApplication);
        if self.state.unauthorized {
            return Err(Self::rejected(401, "GET /oauth2/applications/@me"));
        }
        Ok(Application {
            id: APP_ID.to_string(),
            name: "Masterminds".to_string(),
        })
    }

    async fn bulk_overwrite_global_commands(
        &self,
        _application_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError> {
        self.record(ApiCall::GlobalSync(names(commands)));
        if self.state.failing_syncs {
            return Err(Self::rejected(400, "PUT /applications/{id}/commands"));
        }
        Ok(Self::echo(commands))
    }

    async fn bulk_overwrite_guild_commands(
        &self,
        _application_id: &str,
        guild_id: &str,
        commands: &[ApplicationCommand],
    ) -> Result<Vec<ApplicationCommand>, HttpError> {
        self.record(ApiCall::GuildSync(guild_id.to_string(), names(commands)));
        if self.state.failing_syncs {
            return Err(Self::rejected(
                400,
                "PUT /applications/{id}/guilds/{id}/commands",
            ));
        }
        Ok(Self::echo(commands))
    }

    async fn create_interaction_response(
        &self,
        _interaction_id: &str,
        _interaction_token: &str,
        response: &InteractionResponse,
    ) -> Result<(), HttpError> {
        self.record(ApiCall::Respond(response.clone()));
        Ok(())
    }

    async fn create_message(
        &self,
        channel_id: &str,
        message: &CreateMessage,
    ) -> Result<Message, HttpError> {
        self.record(ApiCall::Message(channel_id.to_string(), message.clone()));
        Ok(Message {
            id: "9000".to_string(),
            channel_id: channel_id.to_string(),
            content: message.content.clone().unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// What a [`ScriptedConnector`] plays back.
pub struct Script {
    events: Vec<GatewayEvent>,
    outcome: Result<(), GatewayError>,
    hold_open: bool,
}

impl Script {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            outcome: Ok(()),
            hold_open: false,
        }
    }

    pub fn event(mut self, event: GatewayEvent) -> Self {
        self.events.push(event);
        self
    }

    /// What the driver returns once the events run out.
    pub fn outcome(mut self, outcome: Result<(), GatewayError>) -> Self {
        self.outcome = outcome;
        self
    }

    /// Never end the event stream.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }
}

/// Delivers a fixed event sequence; a second connect fails.
pub struct ScriptedConnector {
    script: Mutex<Option<Script>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    pub fn new(script: Script) -> Self {
        Self {
            script: Mutex::new(Some(script)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn connects(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.connects)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _config: GatewayConfig) -> Result<GatewayHandle, GatewayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let script = self
            .script
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| GatewayError::Connect("script already used".into()))?;

        let (tx, events) = mpsc::channel(script.events.len() + 1);
        for event in script.events {
            tx.try_send(event).expect("channel sized for the script");
        }
        let hold_open = script.hold_open;
        let outcome = script.outcome;
        let driver = tokio::spawn(async move {
            if hold_open {
                let _tx = tx;
                std::future::pending::<()>().await;
            }
            outcome
        });
        Ok(GatewayHandle { events, driver })
    }
}

// ---------------------------------------------------------------------------
// Handler
// ---------------------------------------------------------------------------

/// Logs every callback as `setup:start`, `setup:end`, `ready:<session>`
/// and `join:<guild>`.
#[derive(Default)]
pub struct Recorder {
    log: Mutex<Vec<String>>,
    fail_callbacks: bool,
}

impl Recorder {
    /// `on_ready` and `on_guild_join` return errors after logging.
    pub fn failing() -> Self {
        Self {
            log: Mutex::new(Vec::new()),
            fail_callbacks: true,
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn push(&self, entry: String) -> Result<(), BotError> {
        self.log.lock().unwrap().push(entry);
        if self.fail_callbacks {
            Err(BotError::Session("callback failed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EventHandler for Recorder {
    async fn setup_hook(&self, _ctx: &Context) -> Result<(), BotError> {
        self.log.lock().unwrap().push("setup:start".into());
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        self.log.lock().unwrap().push("setup:end".into());
        Ok(())
    }

    async fn on_ready(&self, _ctx: &Context, ready: &ReadyEvent) -> Result<(), BotError> {
        self.push(format!("ready:{}", ready.session_id))
    }

    async fn on_guild_join(&self, _ctx: &Context, guild: &Guild) -> Result<(), BotError> {
        self.push(format!("join:{}", guild.id))
    }
}

// ---------------------------------------------------------------------------
// Payload builders
// ---------------------------------------------------------------------------

pub fn user(id: &str, name: &str) -> User {
    User {
        id: id.to_string(),
        username: name.to_string(),
        discriminator: Some("0".to_string()),
        avatar: None,
        bot: false,
        global_name: None,
    }
}

pub fn ready(session_id: &str, guild_ids: &[&str]) -> GatewayEvent {
    let guilds: Vec<serde_json::Value> = guild_ids
        .iter()
        .map(|id| serde_json::json!({ "id": id, "unavailable": true }))
        .collect();
    let ready = serde_json::from_value(serde_json::json!({
        "v": 10,
        "user": { "id": "1", "username": "masterminds", "discriminator": "0", "bot": true },
        "session_id": session_id,
        "resume_gateway_url": "wss://resume.example",
        "guilds": guilds,
        "application": { "id": APP_ID },
    }))
    .expect("valid READY");
    GatewayEvent::Ready(ready)
}

pub fn guild_create(id: &str) -> GatewayEvent {
    let guild = serde_json::from_value(serde_json::json!({
        "id": id,
        "name": format!("guild {id}"),
    }))
    .expect("valid guild");
    GatewayEvent::GuildCreate(guild)
}

pub fn guild_delete(id: &str, unavailable: bool) -> GatewayEvent {
    GatewayEvent::GuildDelete(UnavailableGuild {
        id: id.to_string(),
        unavailable,
    })
}

/// A slash command interaction from a guild member with string options.
pub fn interaction(name: &str, options: &[(&str, &str)]) -> Interaction {
    let options: Vec<serde_json::Value> = options
        .iter()
        .map(|(k, v)| serde_json::json!({ "name": k, "type": 3, "value": v }))
        .collect();
    serde_json::from_value(serde_json::json!({
        "id": "5000",
        "application_id": APP_ID,
        "type": 2,
        "token": "interaction-token",
        "guild_id": "100",
        "channel_id": "600",
        "member": {
            "user": { "id": "7", "username": "ada", "discriminator": "0", "global_name": "Ada" },
            "roles": [],
        },
        "data": { "id": "77", "name": name, "options": options },
    }))
    .expect("valid interaction")
}
