//! Change notification rendering + delivery.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Offset, Utc};
use pricewatch_core::{CatalogRecord, ChangeSet, Classification};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "pricewatch-notify";

const SEPARATOR: &str = "-----------------------------------";
const CAPTION_LIMIT: usize = 1024;
const DISPLAY_OFFSET_SECS: i32 = 3 * 3600;

/// Rendered notification body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text { body: String },
    Photo { image_url: String, caption: String },
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("change {id} is {classification:?}; only changed records are rendered")]
    NotNotifiable {
        id: String,
        classification: Classification,
    },
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("bot api rejected message (status {status}): {description}")]
    Rejected { status: u16, description: String },
}

pub trait Renderer: Send + Sync {
    fn render(&self, change: &ChangeSet) -> Result<Payload, RenderError>;
}

/// Delivery channel to a single configured destination.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, payload: &Payload) -> bool;
}

/// Telegram-HTML price change message.
#[derive(Debug, Clone, Default)]
pub struct HtmlTextRenderer {
    pub photo_when_image: bool,
}

impl HtmlTextRenderer {
    pub fn new(photo_when_image: bool) -> Self {
        Self { photo_when_image }
    }

    pub fn render_at(
        &self,
        change: &ChangeSet,
        now: DateTime<Utc>,
    ) -> Result<Payload, RenderError> {
        if change.classification() != Classification::Changed {
            return Err(RenderError::NotNotifiable {
                id: change.id().to_string(),
                classification: change.classification(),
            });
        }
        let body = message_body(change.candidate(), change.previous_price(), now);

        match change.candidate().image_url.as_deref().map(str::trim) {
            Some(image_url)
                if self.photo_when_image
                    && !image_url.is_empty()
                    && body.chars().count() <= CAPTION_LIMIT =>
            {
                Ok(Payload::Photo {
                    image_url: image_url.to_string(),
                    caption: body,
                })
            }
            _ => Ok(Payload::Text { body }),
        }
    }
}

impl Renderer for HtmlTextRenderer {
    fn render(&self, change: &ChangeSet) -> Result<Payload, RenderError> {
        self.render_at(change, Utc::now())
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn price_text(price: Option<Decimal>) -> String {
    price
        .map(|p| p.normalize().to_string())
        .unwrap_or_else(|| "N/A".to_string())
}

/// Direction arrow, colour marker and signed percentage against a positive old price.
fn price_movement(
    new: Option<Decimal>,
    old: Option<Decimal>,
) -> (&'static str, &'static str, String) {
    let (Some(new), Some(old)) = (new, old) else {
        return ("", "", "N/A".to_string());
    };
    if old <= Decimal::ZERO {
        return ("", "", "N/A".to_string());
    }
    let (arrow, marker) = if new > old {
        ("⬆️", "🟢")
    } else if new < old {
        ("⬇️", "🔴")
    } else {
        ("", "")
    };
    let percent = match (new - old)
        .checked_div(old)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
    {
        Some(mut p) => {
            p = p.round_dp(2);
            p.rescale(2);
            let sign = if p.is_sign_negative() { "" } else { "+" };
            format!("{sign}{p}%")
        }
        None => "N/A".to_string(),
    };
    (arrow, marker, percent)
}

fn message_body(
    current: &CatalogRecord,
    previous_price: Option<Decimal>,
    now: DateTime<Utc>,
) -> String {
    let name_ar = non_blank(&current.name_ar)
        .map(escape_html)
        .unwrap_or_else(|| "غير متوفر".to_string());
    let name_en = non_blank(&current.name_en)
        .map(escape_html)
        .unwrap_or_else(|| "N/A".to_string());
    let (arrow, marker, percent) = price_movement(current.price, previous_price);

    let mut lines = vec![format!("<b>{name_ar}</b> 💊"), format!("<i>{name_en}</i>")];
    if let Some(active) = non_blank(&current.active_ingredients) {
        lines.push(format!("<b>المادة الفعالة:</b> {}", escape_html(active)));
    }
    if let Some(manufacturer) = non_blank(&current.manufacturer) {
        lines.push(format!("<b>الشركة المصنعة:</b> {}", escape_html(manufacturer)));
    }
    lines.push(SEPARATOR.to_string());
    lines.push(format!("<b>السعر الجديد: {} ج.م</b> {arrow}", price_text(current.price)));
    lines.push(format!("السعر السابق: {} ج.م", price_text(previous_price)));
    lines.push(format!("نسبة التغيير: {percent} {marker}"));
    lines.push(SEPARATOR.to_string());
    if let Some(barcode) = non_blank(&current.barcode).filter(|b| *b != "0") {
        lines.push(format!("<b>الباركود:</b> <code>{}</code>", escape_html(barcode)));
    }
    let offset = FixedOffset::east_opt(DISPLAY_OFFSET_SECS).unwrap_or_else(|| Utc.fix());
    let stamp = now.with_timezone(&offset).format("%Y-%m-%d — %I:%M %p");
    lines.push(format!("آخر تحديث: {stamp}"));
    lines.join("\n")
}

#[derive(Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    pub timeout: Duration,
}

impl fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("api_base", &self.api_base)
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct BotReply {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Bot API delivery; a message counts as delivered only on 2xx with `ok: true`.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
    bot_token: String,
    chat_id: JsonValue,
}

impl fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("api_base", &self.api_base)
            .field("bot_token", &"<redacted>")
            .field("chat_id", &self.chat_id)
            .finish()
    }
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building telegram client")?;
        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token,
            chat_id: chat_id_value(&config.chat_id),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.bot_token, method)
    }

    /// A photo the Bot API refuses (dead or invalid image URL) is resent once as
    /// a text message carrying the caption.
    pub async fn send(&self, payload: &Payload) -> Result<(), NotifyError> {
        match payload {
            Payload::Text { body } => self.send_message(body).await,
            Payload::Photo { image_url, caption } => {
                match self.send_photo(image_url, caption).await {
                    Err(NotifyError::Rejected {
                        status,
                        description,
                    }) => {
                        warn!(status, %description, "photo rejected; resending as text");
                        self.send_message(caption).await
                    }
                    other => other,
                }
            }
        }
    }

    async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        self.call(
            "sendMessage",
            json!({ "chat_id": self.chat_id, "text": text, "parse_mode": "HTML" }),
        )
        .await
    }

    async fn send_photo(&self, image_url: &str, caption: &str) -> Result<(), NotifyError> {
        self.call(
            "sendPhoto",
            json!({
                "chat_id": self.chat_id,
                "photo": image_url,
                "caption": caption,
                "parse_mode": "HTML"
            }),
        )
        .await
    }

    async fn call(&self, method: &str, body: JsonValue) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let reply: Option<BotReply> = serde_json::from_slice(&bytes).ok();

        match reply {
            Some(BotReply { ok: true, .. }) if status.is_success() => Ok(()),
            Some(reply) => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: reply
                    .description
                    .unwrap_or_else(|| "no description".to_string()),
            }),
            None => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: "unparseable bot api reply".to_string(),
            }),
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, payload: &Payload) -> bool {
        match self.send(payload).await {
            Ok(()) => {
                info!(chat_id = %self.chat_id, "notification delivered");
                true
            }
            Err(err) => {
                error!(chat_id = %self.chat_id, error = %err, "notification delivery failed");
                false
            }
        }
    }
}

/// Numeric chat ids (including negative channel ids) go out as integers.
fn chat_id_value(raw: &str) -> JsonValue {
    let raw = raw.trim();
    match raw.parse::<i64>() {
        Ok(id) => JsonValue::from(id),
        Err(_) => JsonValue::from(raw),
    }
}
