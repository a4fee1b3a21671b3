use crate::builder::Builder;
use crate::conversation::{ChatKey, Controller, Inbound, Outbox};
use crate::request::UserId;
use anyhow::Result;
use async_trait::async_trait;
use log::info;
use std::path::Path;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::dptree;
use teloxide::types::InputFile;

const MAX_MESSAGE_CHARS: usize = 4000;

pub struct TelegramOutbox {
    bot: Bot,
}

#[async_trait]
impl Outbox for TelegramOutbox {
    async fn send_text(&self, chat: ChatKey, text: &str) -> Result<()> {
        self.bot
            .send_message(ChatId(chat), truncate(text, MAX_MESSAGE_CHARS))
            .await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat: ChatKey,
        path: &Path,
        file_name: &str,
        caption: &str,
    ) -> Result<()> {
        let document = InputFile::file(path.to_path_buf()).file_name(file_name.to_string());
        self.bot
            .send_document(ChatId(chat), document)
            .caption(truncate(caption, MAX_MESSAGE_CHARS))
            .await?;
        Ok(())
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...\n\n[Message truncated]")
}

/// Polls for updates until Ctrl-C. Chats are dispatched concurrently; messages
/// within one chat are handled in order.
pub async fn run_bot(token: &str, controller: Arc<Controller<Builder>>) {
    let bot = Bot::new(token);
    let handler = Update::filter_message().endpoint(handle_message);

    info!("Bot started successfully!");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![controller])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_message(
    bot: Bot,
    msg: Message,
    controller: Arc<Controller<Builder>>,
) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let user = msg
        .from
        .as_ref()
        .map(|user| UserId(user.id.0))
        .unwrap_or(UserId(msg.chat.id.0.unsigned_abs()));

    let outbox = TelegramOutbox { bot };
    controller
        .handle(
            &outbox,
            Inbound {
                chat: msg.chat.id.0,
                user,
                text,
            },
        )
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_text_is_truncated_on_char_boundary() {
        let text = "é".repeat(10);
        let out = truncate(&text, 4);
        assert!(out.starts_with("éééé..."));
        assert!(out.ends_with("[Message truncated]"));
        assert_eq!(truncate("short", 4000), "short");
    }
}
