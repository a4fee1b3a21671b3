//! Per-chat conversation state machine.
//!
//! `Idle --/start--> AwaitingUrl --valid URL--> (pipeline) --> Idle`
//!
//! The controller knows nothing about the chat platform: it reads an
//! [`Inbound`] message and answers through an [`Outbox`].

use crate::builder::{Artifact, PipelineError};
use crate::request::{TargetUrl, UserId};
use crate::status::Diagnostics;
use async_trait::async_trait;
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

pub type ChatKey = i64;

pub const HELP_TEXT: &str = "🤖 APK Generator Bot\n\n\
Commands:\n\
/start - Start the APK creation process\n\
/cancel - Cancel current operation\n\
/status - Show bot readiness\n\
/help - Show this help message\n\n\
This bot creates a custom APK with your user ID and chosen URL.";

pub const PROCESSING_TEXT: &str = "⚙️ Processing your APK... This may take 1-2 minutes.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    AwaitingUrl { user: UserId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Cancel,
    Help,
    Status,
}

impl BotCommand {
    /// `Ok(None)` for plain text, `Err(name)` for an unknown command.
    pub fn parse(text: &str) -> Result<Option<Self>, String> {
        let Some(rest) = text.trim().strip_prefix('/') else {
            return Ok(None);
        };
        let word = rest.split_whitespace().next().unwrap_or_default();
        let name = word.split('@').next().unwrap_or_default().to_ascii_lowercase();

        match name.as_str() {
            "start" => Ok(Some(BotCommand::Start)),
            "cancel" => Ok(Some(BotCommand::Cancel)),
            "help" => Ok(Some(BotCommand::Help)),
            "status" => Ok(Some(BotCommand::Status)),
            _ => Err(name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inbound<'a> {
    pub chat: ChatKey,
    pub user: UserId,
    pub text: &'a str,
}

#[async_trait]
pub trait Outbox: Send + Sync {
    async fn send_text(&self, chat: ChatKey, text: &str) -> anyhow::Result<()>;

    async fn send_document(
        &self,
        chat: ChatKey,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Personalizer: Send + Sync {
    async fn personalize(&self, user: UserId, url: &TargetUrl) -> Result<Artifact, PipelineError>;
}

pub fn welcome_text(user: UserId) -> String {
    format!(
        "✨ Welcome! Your user ID is: {user}\n\n\
         Please send me the website URL you want to embed in the app:"
    )
}

pub fn caption_text(user: UserId, url: &TargetUrl) -> String {
    format!(
        "✅ Your custom APK is ready!\n\n\
         👤 User ID: {user}\n\
         🔗 URL: {url}\n\n\
         📱 You can now install this on your Android device.\n\
         ⚠️ Make sure to enable 'Install from Unknown Sources' in your settings."
    )
}

pub fn failure_text(err: &PipelineError) -> String {
    format!("❌ Error creating APK: {err}\n\nPlease try again with /start or contact support.")
}

pub struct Controller<P> {
    personalizer: P,
    diagnostics: Diagnostics,
    states: Mutex<HashMap<ChatKey, ConversationState>>,
}

impl<P: Personalizer> Controller<P> {
    pub fn new(personalizer: P, diagnostics: Diagnostics) -> Self {
        Self {
            personalizer,
            diagnostics,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, chat: ChatKey) -> ConversationState {
        self.lock_states()
            .get(&chat)
            .copied()
            .unwrap_or(ConversationState::Idle)
    }

    fn set_state(&self, chat: ChatKey, state: ConversationState) {
        let mut states = self.lock_states();
        match state {
            ConversationState::Idle => {
                states.remove(&chat);
            }
            other => {
                states.insert(chat, other);
            }
        }
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<ChatKey, ConversationState>> {
        // The map holds plain values, so a poisoned lock is still usable.
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handles one inbound message. Never fails: every problem is turned
    /// into a reply and the conversation is reset where appropriate.
    pub async fn handle(&self, outbox: &dyn Outbox, msg: Inbound<'_>) {
        match BotCommand::parse(msg.text) {
            Ok(Some(command)) => self.handle_command(outbox, &msg, command).await,
            Ok(None) => self.handle_text(outbox, &msg).await,
            Err(name) => {
                reply(outbox, msg.chat, &format!("Unknown command /{name}. Send /help for usage.")).await
            }
        }
    }

    async fn handle_command(&self, outbox: &dyn Outbox, msg: &Inbound<'_>, command: BotCommand) {
        match command {
            BotCommand::Start => {
                self.set_state(msg.chat, ConversationState::AwaitingUrl { user: msg.user });
                info!("Chat {} started a request for user {}", msg.chat, msg.user);
                reply(outbox, msg.chat, &welcome_text(msg.user)).await;
            }
            BotCommand::Cancel => {
                let text = match self.state(msg.chat) {
                    ConversationState::AwaitingUrl { .. } => {
                        self.set_state(msg.chat, ConversationState::Idle);
                        "❌ Operation cancelled."
                    }
                    ConversationState::Idle => "Nothing to cancel. Send /start to begin.",
                };
                reply(outbox, msg.chat, text).await;
            }
            BotCommand::Help => reply(outbox, msg.chat, HELP_TEXT).await,
            BotCommand::Status => {
                let report = self.diagnostics.report().await;
                reply(outbox, msg.chat, &report.to_string()).await;
            }
        }
    }

    async fn handle_text(&self, outbox: &dyn Outbox, msg: &Inbound<'_>) {
        let user = match self.state(msg.chat) {
            ConversationState::AwaitingUrl { user } => user,
            ConversationState::Idle => {
                reply(outbox, msg.chat, "Send /start to create your APK.").await;
                return;
            }
        };

        let url = match TargetUrl::parse(msg.text) {
            Ok(url) => url,
            Err(rejected) => {
                reply(
                    outbox,
                    msg.chat,
                    &format!("⚠️ {rejected}. Please send a URL like https://example.com"),
                )
                .await;
                return;
            }
        };

        // Reset first; /cancel does not interrupt a running pipeline.
        self.set_state(msg.chat, ConversationState::Idle);
        reply(outbox, msg.chat, PROCESSING_TEXT).await;

        match self.personalizer.personalize(user, &url).await {
            Ok(artifact) => {
                let caption = caption_text(user, &url);
                match outbox
                    .send_document(msg.chat, artifact.path(), artifact.file_name(), &caption)
                    .await
                {
                    Ok(()) => info!("APK delivered to chat {} for user {user}", msg.chat),
                    Err(e) => {
                        error!("Failed to deliver APK to chat {}: {e:#}", msg.chat);
                        reply(outbox, msg.chat, "❌ Failed to send your APK. Please try again with /start.")
                            .await;
                    }
                }
                artifact.discard();
            }
            Err(e) => {
                error!("Error creating APK: {e}");
                reply(outbox, msg.chat, &failure_text(&e)).await;
            }
        }
    }
}

async fn reply(outbox: &dyn Outbox, chat: ChatKey, text: &str) {
    if let Err(e) = outbox.send_text(chat, text).await {
        warn!("Failed to send message to chat {chat}: {e:#}");
    }
}
