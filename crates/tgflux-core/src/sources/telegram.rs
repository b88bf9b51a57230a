//! MTProto source backed by grammers. Requires a session that was authorised
//! with `tgflux-admin telegram-login`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use grammers_client::types::{Chat, PackedChat};
use grammers_client::{Client, Config, SignInError};
use grammers_session::Session;
use tgflux_parser::ChannelName;
use tokio::sync::Mutex;
use tracing::info;

use super::{MessageSource, SourceMessage};
use crate::config::TelegramCredentials;

pub struct TelegramSource {
    client: Client,
    chats: Mutex<HashMap<String, PackedChat>>,
}

async fn open_client(credentials: &TelegramCredentials) -> Result<Client> {
    let session_file = credentials.session_file();
    let session = Session::load_file_or_create(&session_file)
        .with_context(|| format!("failed to open session {}", session_file.display()))?;
    Client::connect(Config {
        session,
        api_id: credentials.api_id,
        api_hash: credentials.api_hash.clone(),
        params: Default::default(),
    })
    .await
    .with_context(|| "failed to connect to Telegram")
}

impl TelegramSource {
    pub async fn connect(credentials: &TelegramCredentials) -> Result<Self> {
        let client = open_client(credentials).await?;
        if !client.is_authorized().await? {
            bail!(
                "Telegram session {} is not authorised; run `tgflux-admin telegram-login` first",
                credentials.session_file().display()
            );
        }
        Ok(Self {
            client,
            chats: Mutex::new(HashMap::new()),
        })
    }

    async fn resolve(&self, channel: &ChannelName) -> Result<PackedChat> {
        let mut chats = self.chats.lock().await;
        if let Some(chat) = chats.get(channel.as_str()) {
            return Ok(*chat);
        }
        let chat = self
            .client
            .resolve_username(channel.as_str())
            .await?
            .ok_or_else(|| anyhow!("channel {channel} not found"))?
            .pack();
        chats.insert(channel.as_str().to_string(), chat);
        Ok(chat)
    }
}

#[async_trait]
impl MessageSource for TelegramSource {
    fn name(&self) -> &'static str {
        "telegram"
    }

    async fn recent_messages(
        &self,
        channel: &ChannelName,
        limit: usize,
    ) -> Result<Vec<SourceMessage>> {
        let chat = self.resolve(channel).await?;
        let mut iter = self.client.iter_messages(chat).limit(limit);
        let mut messages = Vec::with_capacity(limit);
        while let Some(message) = iter.next().await? {
            let text = message.text();
            messages.push(SourceMessage {
                id: i64::from(message.id()),
                text: (!text.is_empty()).then(|| text.to_string()),
                date: message.date(),
                sender_id: message.sender().map(|sender: Chat| sender.id()),
                has_photo: message.photo().is_some(),
            });
        }
        Ok(messages)
    }

    async fn download_photo(
        &self,
        channel: &ChannelName,
        message_id: i64,
        destination: &Path,
    ) -> Result<()> {
        let chat = self.resolve(channel).await?;
        let id = i32::try_from(message_id)
            .with_context(|| format!("message id {message_id} out of range"))?;
        let message = self
            .client
            .get_messages_by_id(chat, &[id])
            .await?
            .into_iter()
            .flatten()
            .next()
            .ok_or_else(|| anyhow!("message {message_id} in {channel} no longer exists"))?;
        if !message.download_media(destination).await? {
            bail!("message {message_id} in {channel} has no downloadable media");
        }
        Ok(())
    }
}

/// Interactive login. `prompt` is asked for the login code and, when the
/// account has two-step verification enabled, the password.
pub async fn login(
    credentials: &TelegramCredentials,
    phone: &str,
    prompt: impl Fn(&str) -> Result<String>,
) -> Result<()> {
    let client = open_client(credentials).await?;
    if client.is_authorized().await? {
        info!(session = %credentials.session_file().display(), "Telegram session already authorised");
        return Ok(());
    }

    let token = client.request_login_code(phone).await?;
    let code = prompt("Enter the code Telegram sent you: ")?;
    match client.sign_in(&token, code.trim()).await {
        Ok(_) => {}
        Err(SignInError::PasswordRequired(password_token)) => {
            let password = prompt("Enter your two-step verification password: ")?;
            client
                .check_password(password_token, password.trim())
                .await
                .with_context(|| "two-step verification failed")?;
        }
        Err(err) => return Err(err).with_context(|| "Telegram sign-in failed"),
    }

    let session_file = credentials.session_file();
    client
        .session()
        .save_to_file(&session_file)
        .with_context(|| format!("failed to save session {}", session_file.display()))?;
    info!(session = %session_file.display(), "Telegram session saved");
    Ok(())
}
