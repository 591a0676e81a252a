use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::reconcile::{ListingItem, ListingPage, ListingSource};

pub const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";

/// Lists a channel's uploads playlist through the YouTube Data API.
#[derive(Debug, Clone)]
pub struct YoutubeListingSource {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    playlist_id: String,
}

impl YoutubeListingSource {
    pub fn new(
        base_url: Option<&str>,
        api_key: impl Into<String>,
        playlist_id: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let api_key = api_key.into();
        let playlist_id = playlist_id.into();
        if api_key.trim().is_empty() {
            anyhow::bail!("youtube api key is empty");
        }
        if playlist_id.trim().is_empty() {
            anyhow::bail!("youtube playlist id is empty");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;
        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_owned(),
            api_key,
            playlist_id,
        })
    }

    fn page_url(&self, page_token: Option<&str>) -> anyhow::Result<Url> {
        let endpoint = format!("{}/playlistItems", self.base_url);
        let mut params = vec![
            ("part", "snippet"),
            ("maxResults", "50"),
            ("playlistId", self.playlist_id.as_str()),
            ("key", self.api_key.as_str()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }
        Url::parse_with_params(&endpoint, &params)
            .with_context(|| format!("build listing url: {endpoint}"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsResponse {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PlaylistItem {
    snippet: Option<Snippet>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    title: String,
    resource_id: Option<ResourceId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceId {
    video_id: Option<String>,
}

#[async_trait]
impl ListingSource for YoutubeListingSource {
    async fn fetch_page(&self, page_token: Option<&str>) -> anyhow::Result<ListingPage> {
        let url = self.page_url(page_token)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("GET playlistItems")?;

        let status = response.status();
        let raw = response.text().await.context("read listing response body")?;
        if !status.is_success() {
            let message = parse_error_message(&raw).unwrap_or(raw);
            anyhow::bail!("YouTube API error ({status}): {message}");
        }

        let parsed: PlaylistItemsResponse =
            serde_json::from_str(&raw).context("parse playlistItems response")?;
        let items = parsed
            .items
            .into_iter()
            .filter_map(|item| {
                let snippet = item.snippet?;
                let video_id = snippet.resource_id?.video_id?;
                Some(ListingItem {
                    title: snippet.title,
                    artifact_id: video_id,
                })
            })
            .collect();

        Ok(ListingPage {
            items,
            next_page_token: parsed.next_page_token,
        })
    }
}

fn parse_error_message(raw_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw_json).ok()?;
    let message = value.get("error")?.get("message")?.as_str()?.to_owned();
    Some(message)
}
