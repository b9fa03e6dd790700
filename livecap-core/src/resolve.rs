//! Room resolution — operator-supplied reference → playable media.
//!
//! [`RoomResolver`] is a capability seam. [`HttpRoomResolver`] implements it
//! for Douyin-style live pages: it fetches the room page with a browser
//! user-agent, captures the gateway cookies handed back on that response,
//! and extracts the room id, anchor name and pull URL from the embedded
//! render payload. The signature/cookie derivation is opaque to the rest of
//! the pipeline: whatever this resolver returns is what the chat client
//! presents.

use async_trait::async_trait;
use regex::Regex;
use reqwest::header;
use tracing::debug;

use crate::error::{LivecapError, Result};

const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36";

/// Everything needed to attach to a room.
#[derive(Debug, Clone)]
pub struct ResolvedRoom {
    pub room_id: String,
    pub media_url: String,
    pub anchor_name: String,
    /// Chat gateway endpoint; `None` when the page exposes no chat channel.
    pub ws_url: Option<String>,
    /// Opaque signature cookie for the chat connection.
    pub cookie: Option<String>,
    pub user_agent: String,
}

/// Capability that resolves a room reference (URL or short id).
#[async_trait]
pub trait RoomResolver: Send + Sync {
    /// # Errors
    /// `LivecapError::ResolveFailed` when the room cannot be resolved — the
    /// page is unreachable, the room is offline, or the payload shape moved.
    async fn resolve(&self, room_ref: &str) -> Result<ResolvedRoom>;
}

/// Live-page scraping resolver.
pub struct HttpRoomResolver {
    client: reqwest::Client,
    room_id_re: Regex,
    stream_url_re: Regex,
    anchor_re: Regex,
}

impl HttpRoomResolver {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_UA)
            .build()
            .map_err(|e| LivecapError::ResolveFailed(e.to_string()))?;
        Ok(Self {
            client,
            // Render payload fields, in the order the page usually carries them.
            room_id_re: Regex::new(r#""roomId\\?":\\?"(\d+)"#).map_err(anyhow::Error::from)?,
            stream_url_re: Regex::new(r#""(?:hls_pull_url|rtmp_pull_url)\\?":\\?"([^"\\]+)"#)
                .map_err(anyhow::Error::from)?,
            anchor_re: Regex::new(r#""nickname\\?":\\?"([^"\\]+)"#).map_err(anyhow::Error::from)?,
        })
    }

    /// Accepts a full live URL or a bare room id.
    fn page_url(room_ref: &str) -> String {
        if room_ref.starts_with("http://") || room_ref.starts_with("https://") {
            room_ref.to_string()
        } else {
            format!("https://live.douyin.com/{room_ref}")
        }
    }

    fn chat_ws_url(room_id: &str) -> String {
        format!(
            "wss://webcast5-ws-web-lf.douyin.com/webcast/im/push/v2/?app_name=douyin_web\
             &version_code=180800&webcast_sdk_version=1.0.14&compress=gzip&room_id={room_id}"
        )
    }
}

#[async_trait]
impl RoomResolver for HttpRoomResolver {
    async fn resolve(&self, room_ref: &str) -> Result<ResolvedRoom> {
        let url = Self::page_url(room_ref);
        debug!(%url, "resolving room");
        let response = self
            .client
            .get(&url)
            .header(header::REFERER, "https://live.douyin.com/")
            .send()
            .await
            .map_err(|e| LivecapError::ResolveFailed(e.to_string()))?;

        let cookie = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter_map(|v| v.split(';').next())
            .collect::<Vec<_>>()
            .join("; ");

        let body = response
            .text()
            .await
            .map_err(|e| LivecapError::ResolveFailed(e.to_string()))?;

        let room_id = self
            .room_id_re
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| LivecapError::ResolveFailed("room id not found in page".into()))?;

        let media_url = self
            .stream_url_re
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| unescape_payload_url(m.as_str()))
            .ok_or_else(|| {
                LivecapError::ResolveFailed("no pull URL in page — room may be offline".into())
            })?;

        let anchor_name = self
            .anchor_re
            .captures(&body)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        Ok(ResolvedRoom {
            ws_url: Some(Self::chat_ws_url(&room_id)),
            cookie: (!cookie.is_empty()).then_some(cookie),
            room_id,
            media_url,
            anchor_name,
            user_agent: BROWSER_UA.to_string(),
        })
    }
}

fn unescape_payload_url(raw: &str) -> String {
    raw.replace("\\u0026", "&").replace("\\/", "/")
}

/// Fixed-answer resolver for tests and offline development.
pub struct StaticResolver {
    room: ResolvedRoom,
}

impl StaticResolver {
    pub fn new(room: ResolvedRoom) -> Self {
        Self { room }
    }
}

#[async_trait]
impl RoomResolver for StaticResolver {
    async fn resolve(&self, _room_ref: &str) -> Result<ResolvedRoom> {
        Ok(self.room.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_room_id_becomes_live_url() {
        assert_eq!(
            HttpRoomResolver::page_url("12345"),
            "https://live.douyin.com/12345"
        );
        assert_eq!(
            HttpRoomResolver::page_url("https://live.douyin.com/98765"),
            "https://live.douyin.com/98765"
        );
    }

    #[test]
    fn payload_regexes_match_render_payload() {
        let resolver = HttpRoomResolver::new().expect("resolver");
        let body = r#"{"roomId":"7421334","room":{"title":"night stream",
            "stream_url":{"hls_pull_url":"http://pull.example.com/live/x.m3u8?a=1&b=2"},
            "owner":{"nickname":"anchor-01"}}}"#;

        let room_id = resolver
            .room_id_re
            .captures(body)
            .and_then(|c| c.get(1))
            .expect("room id")
            .as_str();
        assert_eq!(room_id, "7421334");

        let url = resolver
            .stream_url_re
            .captures(body)
            .and_then(|c| c.get(1))
            .expect("stream url")
            .as_str();
        assert_eq!(
            unescape_payload_url(url),
            "http://pull.example.com/live/x.m3u8?a=1&b=2"
        );

        let anchor = resolver
            .anchor_re
            .captures(body)
            .and_then(|c| c.get(1))
            .expect("anchor")
            .as_str();
        assert_eq!(anchor, "anchor-01");
    }

    #[test]
    fn escaped_payload_variant_also_matches() {
        let resolver = HttpRoomResolver::new().expect("resolver");
        let body = r#"\"roomId\":\"555\",\"hls_pull_url\":\"http://p/live.m3u8\""#;
        assert!(resolver.room_id_re.captures(body).is_some());
        assert!(resolver.stream_url_re.captures(body).is_some());
    }
}
