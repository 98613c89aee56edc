//! Telegram handlers: deep-link delivery, channel auto-posting, and the
//! admin surface.
//!
//! The registry owns every invariant; handlers only sequence the checks
//! (rate limit, then membership, then fetch) and talk to Telegram.

use crate::config::Settings;
use crate::registry::{MediaKind, MediaRecord, Registry};
use anyhow::Result;
use chrono::DateTime;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, FileId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, UserId,
};
use url::Url;
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

/// Delay before a delivered file message is deleted from the chat.
const DELETE_DELAY: Duration = Duration::from_secs(3600);

/// Supported bot commands
#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    /// Deep-link entry point; the payload is a short file key
    #[command(description = "Fetch a file by its short key.")]
    Start(String),
    /// Registry statistics (admin only)
    #[command(description = "Show bot statistics.")]
    Stats,
    /// Manual expiry sweep (admin only)
    #[command(description = "Remove expired links now.")]
    Cleanup,
    /// Liveness probe
    #[command(description = "Check that the bot is alive.")]
    Healthcheck,
}

/// Telegram user id of the sender, or 0 when absent.
#[must_use]
pub fn user_id_of(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// `/start` handler. Without a payload it greets the user; with a key it
/// runs the delivery flow: rate limit, membership gate, registry fetch,
/// typed media send, deferred deletion of the delivered message.
pub async fn start(
    bot: Bot,
    msg: Message,
    key: String,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
) -> Result<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };
    let user_id = user.id.0.cast_signed();

    let key = key.trim();
    if key.is_empty() {
        bot.send_message(
            msg.chat.id,
            "🤖 Welcome to the file sharing bot!\n\n\
             Use the download links from the main channel to fetch files.",
        )
        .await?;
        return Ok(());
    }

    if !registry.check_and_record_request(user_id) {
        bot.send_message(
            msg.chat.id,
            "⚠️ Too many requests. Please try again in an hour.",
        )
        .await?;
        return Ok(());
    }

    if !is_channel_member(&bot, settings.public_channel_id, user.id).await {
        bot.send_message(
            msg.chat.id,
            "❌ You must join the main channel before downloading files.\n\
             Try again after joining.",
        )
        .await?;
        return Ok(());
    }

    let Some(record) = registry.fetch(key) else {
        bot.send_message(
            msg.chat.id,
            format!(
                "❌ This download link has expired or the file is missing.\n\
                 ⏰ Files stay available for {} hours.",
                settings.file_ttl_hours
            ),
        )
        .await?;
        return Ok(());
    };

    let caption = build_caption(&record, settings.file_ttl_hours);
    match send_media(&bot, msg.chat.id, &record, &caption).await {
        Ok(sent) => {
            schedule_delete(bot, sent.chat.id, sent.id);
        }
        Err(e) => {
            error!("failed to send file {key} to {user_id}: {e}");
            bot.send_message(msg.chat.id, "❌ Failed to deliver the file.")
                .await?;
        }
    }

    Ok(())
}

/// Channel-post handler for the private source channel. Registers the
/// media and publishes a deep-link button post to the public channel.
pub async fn auto_post(
    bot: Bot,
    msg: Message,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
) -> Result<()> {
    let Some((file_id, kind)) = extract_media(&msg) else {
        return Ok(());
    };

    // Key-space exhaustion is a configuration fault, not a user error.
    let key = registry.insert(file_id, kind)?;

    let url = Url::parse(&format!(
        "https://t.me/{}?start={key}",
        settings.bot_username
    ))?;
    let markup = InlineKeyboardMarkup::new([[InlineKeyboardButton::url("⬇️ Download", url)]]);

    match bot
        .send_message(
            ChatId(settings.public_channel_id),
            "👇 Tap the button below to download 👇",
        )
        .reply_markup(markup)
        .await
    {
        Ok(_) => {
            info!(%key, ?kind, "published download link");
            bot.send_message(msg.chat.id, format!("✅ Post created - key: {key}"))
                .await?;
        }
        Err(e) => {
            error!("auto-post failed: {e}");
            bot.send_message(msg.chat.id, "❌ Failed to create the post.")
                .await?;
        }
    }

    Ok(())
}

/// `/stats` handler (admin only, gated by the dispatcher).
pub async fn stats(
    bot: Bot,
    msg: Message,
    registry: Arc<Registry>,
    settings: Arc<Settings>,
) -> Result<()> {
    let stats = registry.stats();
    bot.send_message(
        msg.chat.id,
        format!(
            "📊 Bot statistics\n\n\
             📁 Files: {}\n\
             📈 Downloads: {}\n\
             👥 Active users: {}\n\
             ⏰ Retention: {} hours",
            stats.record_count, stats.total_accesses, stats.active_user_count, settings.file_ttl_hours
        ),
    )
    .await?;
    Ok(())
}

/// `/cleanup` handler (admin only, gated by the dispatcher).
pub async fn cleanup(bot: Bot, msg: Message, registry: Arc<Registry>) -> Result<()> {
    let removed = registry.prune_expired();
    info!(removed, "manual cleanup");
    bot.send_message(msg.chat.id, format!("🧹 Removed {removed} expired links."))
        .await?;
    Ok(())
}

/// `/healthcheck` handler.
pub async fn healthcheck(bot: Bot, msg: Message) -> Result<()> {
    bot.send_message(msg.chat.id, "OK").await?;
    Ok(())
}

/// Membership gate. Any lookup failure (network, permissions) counts as
/// "not a member" - fail closed.
async fn is_channel_member(bot: &Bot, channel_id: i64, user_id: UserId) -> bool {
    match bot.get_chat_member(ChatId(channel_id), user_id).await {
        Ok(member) => member.is_present(),
        Err(e) => {
            warn!("membership check failed for {user_id}: {e}");
            false
        }
    }
}

fn extract_media(msg: &Message) -> Option<(String, MediaKind)> {
    if let Some(doc) = msg.document() {
        return Some((doc.file.id.0.clone(), MediaKind::Document));
    }
    if let Some(video) = msg.video() {
        return Some((video.file.id.0.clone(), MediaKind::Video));
    }
    if let Some(photo) = msg.photo().and_then(<[_]>::last) {
        return Some((photo.file.id.0.clone(), MediaKind::Photo));
    }
    if let Some(audio) = msg.audio() {
        return Some((audio.file.id.0.clone(), MediaKind::Audio));
    }
    None
}

async fn send_media(
    bot: &Bot,
    chat_id: ChatId,
    record: &MediaRecord,
    caption: &str,
) -> Result<Message, teloxide::RequestError> {
    let input = InputFile::file_id(FileId(record.file_id.clone()));
    match record.kind {
        MediaKind::Document => {
            bot.send_document(chat_id, input)
                .caption(caption.to_string())
                .await
        }
        MediaKind::Video => {
            bot.send_video(chat_id, input)
                .caption(caption.to_string())
                .await
        }
        MediaKind::Photo => {
            bot.send_photo(chat_id, input)
                .caption(caption.to_string())
                .await
        }
        MediaKind::Audio => {
            bot.send_audio(chat_id, input)
                .caption(caption.to_string())
                .await
        }
    }
}

fn build_caption(record: &MediaRecord, ttl_hours: u64) -> String {
    let ttl_secs = i64::try_from(ttl_hours).unwrap_or(0) * 3600;
    let expires = DateTime::from_timestamp(record.created_at.saturating_add(ttl_secs), 0).map_or_else(
        || "unknown".to_string(),
        |t| t.format("%m-%d %H:%M UTC").to_string(),
    );
    format!(
        "📁 Your file is ready\n\n⏰ Expires: {expires}\n📊 Downloads: {}",
        record.access_count
    )
}

fn schedule_delete(bot: Bot, chat_id: ChatId, message_id: MessageId) {
    tokio::spawn(async move {
        tokio::time::sleep(DELETE_DELAY).await;
        // The message may already be gone; deletion failures are swallowed.
        let _ = bot.delete_message(chat_id, message_id).await;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_shows_expiry_and_downloads() {
        let record = MediaRecord {
            file_id: "file".to_string(),
            kind: MediaKind::Video,
            // 2023-11-14 22:13:20 UTC
            created_at: 1_700_000_000,
            access_count: 3,
        };
        let caption = build_caption(&record, 48);
        assert!(caption.contains("11-16 22:13 UTC"));
        assert!(caption.contains("Downloads: 3"));
    }

    #[test]
    fn caption_survives_out_of_range_expiry() {
        let record = MediaRecord {
            file_id: "file".to_string(),
            kind: MediaKind::Photo,
            created_at: i64::MAX - 1,
            access_count: 0,
        };
        let caption = build_caption(&record, 48);
        assert!(caption.contains("unknown"));
    }
}
