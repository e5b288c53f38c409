//! Interactive terminal loop.
//!
//! Chat output goes to stdout; logs go to stderr.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use parley_core::{
    ApiClient, ChannelSessionController, ControllerError, ControllerState, HistoryLoader,
    MessageSender, SessionUpdate,
};
use parley_protocol::{Channel, Message, MessageId};
use parley_transport::WebSocketTransport;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Leave,
    Retry,
    Channels,
    Help,
    Quit,
    Send(String),
    Unknown(String),
}

/// Parse one input line. Blank lines yield `None`.
#[must_use]
pub fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    Some(match name {
        "join" | "j" if !arg.is_empty() => Command::Join(arg.to_string()),
        "leave" => Command::Leave,
        "retry" | "reconnect" => Command::Retry,
        "channels" | "list" => Command::Channels,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        _ => Command::Unknown(line.to_string()),
    })
}

/// Find a channel by id, or by name ignoring case and a leading `#`.
#[must_use]
pub fn resolve_channel<'a>(channels: &'a [Channel], query: &str) -> Option<&'a Channel> {
    let name = query.trim().trim_start_matches('#');
    channels
        .iter()
        .find(|c| c.id == query)
        .or_else(|| channels.iter().find(|c| c.name.eq_ignore_ascii_case(name)))
}

/// Render one message as a chat line.
#[must_use]
pub fn format_message(message: &Message) -> String {
    let local = message.created_at.with_timezone(&chrono::Local);
    format!(
        "[{}] {}: {}",
        local.format("%H:%M"),
        message.user_email,
        message.content
    )
}

/// Messages not yet shown, oldest first.
#[must_use]
pub fn unseen<'a>(messages: &'a [Message], shown: &HashSet<MessageId>) -> Vec<&'a Message> {
    messages
        .iter()
        .rev()
        .filter(|m| !shown.contains(&m.id))
        .collect()
}

const HELP: &str = "\
Commands:
  /join <name|id>  switch channel
  /leave           leave the current channel
  /retry           reconnect after the connection was lost
  /channels        list channels
  /quit            exit
Anything else is sent as a message.";

struct App {
    api: Arc<ApiClient>,
    controller: ChannelSessionController,
    channels: Vec<Channel>,
    shown: HashSet<MessageId>,
}

impl App {
    fn label(&self, channel_id: &str) -> String {
        self.channels
            .iter()
            .find(|c| c.id == channel_id)
            .map_or_else(|| channel_id.to_string(), |c| format!("#{}", c.name))
    }

    async fn refresh_channels(&mut self) {
        match self.api.list_channels().await {
            Ok(channels) => self.channels = channels,
            Err(e) => warn!(error = %e, "Failed to list channels"),
        }
    }

    fn print_channels(&self) {
        if self.channels.is_empty() {
            println!("* no channels");
            return;
        }
        for channel in &self.channels {
            let marker = if self.controller.active_channel() == Some(channel.id.as_str()) {
                "*"
            } else {
                " "
            };
            if channel.description.is_empty() {
                println!("{} #{}", marker, channel.name);
            } else {
                println!("{} #{} - {}", marker, channel.name, channel.description);
            }
        }
    }

    async fn join(&mut self, query: &str) {
        if resolve_channel(&self.channels, query).is_none() {
            self.refresh_channels().await;
        }
        let Some(channel_id) = resolve_channel(&self.channels, query).map(|c| c.id.clone()) else {
            println!("* no such channel: {}", query);
            return;
        };
        if let Err(e) = self.controller.select_channel(&channel_id).await {
            println!("* cannot join {}: {}", self.label(&channel_id), e);
        }
    }

    /// Returns `false` when the loop should stop.
    async fn execute(&mut self, command: Command) -> bool {
        match command {
            Command::Join(query) => self.join(&query).await,
            Command::Leave => match self.controller.active_channel().map(str::to_string) {
                Some(channel) => {
                    if let Err(e) = self.controller.deselect().await {
                        println!("* {}", e);
                    } else {
                        println!("* left {}", self.label(&channel));
                    }
                }
                None => println!("* not in a channel"),
            },
            Command::Retry => match self.controller.reconnect() {
                Ok(()) => {}
                Err(ControllerError::AlreadyConnected(state)) => println!("* already {}", state),
                Err(e) => println!("* cannot reconnect: {}", e),
            },
            Command::Channels => {
                self.refresh_channels().await;
                self.print_channels();
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return false,
            Command::Send(content) => match self.controller.send_message(&content) {
                Ok(()) => {}
                Err(ControllerError::NotConnected) => {
                    println!("* not connected; type /retry to reconnect");
                }
                Err(e) => println!("* {}", e),
            },
            Command::Unknown(line) => println!("* unknown command: {} (try /help)", line),
        }
        true
    }

    fn show(&mut self, message: &Message) {
        self.shown.insert(message.id.clone());
        println!("{}", format_message(message));
    }

    fn render(&mut self, update: SessionUpdate) {
        match update {
            SessionUpdate::StateChanged(state) => {
                debug!(%state, "Controller state");
                if state == ControllerState::Idle {
                    self.shown.clear();
                }
            }
            SessionUpdate::Connecting { channel_id } => {
                println!("* connecting to {}...", self.label(&channel_id));
            }
            SessionUpdate::Live { channel_id } => {
                println!("* connected to {}", self.label(&channel_id));
            }
            SessionUpdate::Disconnected { channel_id, error } => {
                if self.controller.active_channel() != Some(channel_id.as_str()) {
                    return;
                }
                match error {
                    Some(e) => println!("* disconnected: {} (type /retry to reconnect)", e),
                    None => println!("* connection closed (type /retry to reconnect)"),
                }
            }
            SessionUpdate::RetryScheduled { attempt, delay, .. } => {
                println!("* connect failed, retry {} in {:?}", attempt, delay);
            }
            SessionUpdate::HistoryLoaded { channel_id, .. } => {
                let pending: Vec<Message> = unseen(self.controller.messages(), &self.shown)
                    .into_iter()
                    .cloned()
                    .collect();
                println!("--- {} ({} messages) ---", self.label(&channel_id), pending.len());
                for message in &pending {
                    self.show(message);
                }
            }
            SessionUpdate::HistoryFailed { error, .. } => {
                println!("* could not load history: {}", error);
            }
            SessionUpdate::MessageInserted(message) => self.show(&message),
            SessionUpdate::MessageUpdated(message) => {
                println!("{} (edited)", format_message(&message));
            }
            SessionUpdate::MessageDeleted { id, .. } => println!("* message {} was deleted", id),
            SessionUpdate::SendFailed { error, .. } => println!("! message not sent: {}", error),
        }
    }
}

/// Run the interactive client until `/quit`, end of input, or Ctrl-C.
///
/// # Errors
///
/// Returns an error if the client cannot be set up.
pub async fn run(config: Config, initial_channel: Option<String>) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let api = Arc::new(
        ApiClient::new(&config.server_url, config.user_email.clone())
            .context("Failed to create API client")?,
    );
    let transport = Arc::new(
        WebSocketTransport::new(config.websocket()?).context("Failed to create transport")?,
    );

    let (controller, mut updates) = ChannelSessionController::new(
        transport,
        Arc::clone(&api) as Arc<dyn HistoryLoader>,
        Arc::clone(&api) as Arc<dyn MessageSender>,
        config.controller(),
    );

    let mut app = App {
        api,
        controller,
        channels: Vec::new(),
        shown: HashSet::new(),
    };

    info!(server = %config.server_url, user = %config.user_email, "Starting Parley client");
    app.refresh_channels().await;

    match initial_channel {
        Some(query) => app.join(&query).await,
        None => match app.channels.first().map(|c| c.name.clone()) {
            Some(name) => app.join(&name).await,
            None => println!("* no channels available; use /channels to refresh"),
        },
    }

    let result = event_loop(&mut app, &mut updates).await;
    app.controller.shutdown().await;
    result
}

async fn event_loop(app: &mut App, updates: &mut mpsc::UnboundedReceiver<SessionUpdate>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            biased;

            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted, shutting down");
                return Ok(());
            }

            Some(update) = updates.recv() => app.render(update),

            Some(event) = app.controller.next_event() => app.controller.handle(event),

            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    debug!("Input closed");
                    return Ok(());
                };
                if let Some(command) = parse_command(&line) {
                    if !app.execute(command).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn channel(id: &str, name: &str) -> Channel {
        Channel {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            created_by: "bob@example.com".to_string(),
            created_at: Utc.timestamp_opt(0, 0).unwrap(),
            updated_at: None,
        }
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("   "), None);
        assert_eq!(
            parse_command("  hello world "),
            Some(Command::Send("hello world".to_string()))
        );
        assert_eq!(
            parse_command("/join  general"),
            Some(Command::Join("general".to_string()))
        );
        assert_eq!(parse_command("/leave"), Some(Command::Leave));
        assert_eq!(parse_command("/retry"), Some(Command::Retry));
        assert_eq!(parse_command("/channels"), Some(Command::Channels));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(
            parse_command("/join"),
            Some(Command::Unknown("/join".to_string()))
        );
        assert_eq!(
            parse_command("/dance now"),
            Some(Command::Unknown("/dance now".to_string()))
        );
    }

    #[test]
    fn test_resolve_channel() {
        let channels = vec![channel("c-1", "General"), channel("c-2", "random")];

        assert_eq!(resolve_channel(&channels, "c-2").unwrap().name, "random");
        assert_eq!(resolve_channel(&channels, "general").unwrap().id, "c-1");
        assert_eq!(resolve_channel(&channels, "#Random").unwrap().id, "c-2");
        assert!(resolve_channel(&channels, "missing").is_none());
    }

    #[test]
    fn test_unseen_skips_shown_messages() {
        let at = |t| Utc.timestamp_opt(t, 0).unwrap();
        let messages = vec![
            Message::new("3", "c-1", "bob@example.com", "live", at(30)),
            Message::new("2", "c-1", "bob@example.com", "second", at(20)),
            Message::new("1", "c-1", "bob@example.com", "first", at(10)),
        ];
        let shown: HashSet<MessageId> = ["3".to_string()].into_iter().collect();

        let ids: Vec<&str> = unseen(&messages, &shown)
            .into_iter()
            .map(|m| m.id.as_str())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_format_message() {
        let message = Message::new(
            "1",
            "c-1",
            "ada@example.com",
            "hi",
            Utc.timestamp_opt(0, 0).unwrap(),
        );
        let line = format_message(&message);
        assert!(line.ends_with("] ada@example.com: hi"));
        assert!(line.starts_with('['));
    }
}
