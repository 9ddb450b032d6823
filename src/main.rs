use std::{io::ErrorKind, path::PathBuf, sync::LazyLock};

use axum::{
    Json, Router,
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{net::TcpListener, time::Duration};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_API_BASE: &str = "https://api.twitter.com";
const BIND_HOST: &str = "0.0.0.0";
const MAX_PORT_ATTEMPTS: u16 = 10;
const UPSTREAM_TIMEOUT_SECONDS: u64 = 10;
const MP4_CONTENT_TYPE: &str = "video/mp4";

static TWEET_ID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:twitter|x)\.com/[^/]+/status/(\d+)").expect("tweet id pattern compiles")
});

#[derive(Clone)]
struct AppState {
    credentials: Option<ApiCredentials>,
    http_client: reqwest::Client,
    api_base: String,
}

#[derive(Debug, Clone)]
struct ApiCredentials {
    key: String,
    secret: String,
}

#[derive(Debug, Clone)]
struct Config {
    port: u16,
    api_base: String,
    credentials: Option<ApiCredentials>,
}

impl Config {
    fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|value| value.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let api_base = std::env::var("TWITTER_API_BASE")
            .ok()
            .and_then(|value| non_empty(&value).map(ToString::to_string))
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let credentials = match (read_secret_env("API_KEY"), read_secret_env("API_SECRET")) {
            (Some(key), Some(secret)) => Some(ApiCredentials { key, secret }),
            _ => None,
        };

        Self {
            port,
            api_base,
            credentials,
        }
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("API_KEY and API_SECRET must be set in .env file")]
    MissingCredentials,
    #[error("Failed to get bearer token: {0}")]
    Token(String),
    #[error("Failed to get tweet data: {0}")]
    TweetData(String),
}

#[derive(Debug, Error)]
enum StartupError {
    #[error("no free port found after {attempts} attempts starting at {base_port}")]
    PortsExhausted { base_port: u16, attempts: u16 },
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    #[serde(default)]
    url: String,
}

#[derive(Debug, Serialize)]
struct DownloadBody {
    #[serde(rename = "videoUrl")]
    video_url: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct TweetResponse {
    includes: Option<MediaIncludes>,
}

#[derive(Debug, Deserialize)]
struct MediaIncludes {
    #[serde(default)]
    media: Vec<MediaItem>,
}

#[derive(Debug, Deserialize)]
struct MediaItem {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    variants: Vec<MediaVariant>,
}

#[derive(Debug, Deserialize)]
struct MediaVariant {
    bitrate: Option<u64>,
    content_type: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    #[serde(default)]
    errors: Vec<UpstreamErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorDetail {
    message: Option<String>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "tweetdl=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env();
    if config.credentials.is_none() {
        warn!(
            "API_KEY and API_SECRET are not set; /download requests will fail until both are configured"
        );
    }

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECONDS))
        .build()?;

    let state = AppState {
        credentials: config.credentials,
        http_client,
        api_base: config.api_base,
    };

    let public_dir = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("public");
    let app = Router::new()
        .route("/download", get(download))
        .fallback_service(ServeDir::new(public_dir))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = bind_with_fallback(BIND_HOST, config.port, MAX_PORT_ATTEMPTS).await?;
    let addr = listener.local_addr()?;
    info!("Server running on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn download(State(state): State<AppState>, Query(query): Query<DownloadQuery>) -> Response {
    let Some(tweet_id) = extract_tweet_id(&query.url) else {
        warn!("rejected download request with invalid tweet URL {:?}", query.url);
        return error_response("Invalid tweet URL");
    };

    match resolve_video_url(&state, tweet_id).await {
        Ok(Some(video_url)) => Json(DownloadBody { video_url }).into_response(),
        Ok(None) => {
            warn!("tweet {tweet_id} has no downloadable video");
            error_response("No video found in the tweet")
        }
        Err(error) => {
            warn!("download failed for tweet {tweet_id}: {error}");
            error_response(&format!("Error fetching video: {error}"))
        }
    }
}

fn error_response(message: &str) -> Response {
    Json(ErrorBody {
        error: message.to_string(),
    })
    .into_response()
}

async fn resolve_video_url(state: &AppState, tweet_id: &str) -> Result<Option<String>, FetchError> {
    let bearer_token = fetch_bearer_token(state).await?;
    let tweet_data = fetch_tweet_data(state, tweet_id, &bearer_token).await?;
    Ok(extract_video_url(&tweet_data).map(ToString::to_string))
}

fn extract_tweet_id(url: &str) -> Option<&str> {
    TWEET_ID_PATTERN
        .captures(url)
        .and_then(|captures| captures.get(1))
        .map(|id| id.as_str())
}

async fn fetch_bearer_token(state: &AppState) -> Result<String, FetchError> {
    let credentials = state
        .credentials
        .as_ref()
        .ok_or(FetchError::MissingCredentials)?;

    let encoded = BASE64.encode(format!("{}:{}", credentials.key, credentials.secret));
    let response = state
        .http_client
        .post(format!("{}/2/oauth2/token", state.api_base))
        .header("Authorization", format!("Basic {encoded}"))
        .form(&[("grant_type", "client_credentials")])
        .send()
        .await
        .map_err(|error| FetchError::Token(error.to_string()))?;

    if !response.status().is_success() {
        return Err(FetchError::Token(upstream_error_message(response).await));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|error| FetchError::Token(error.to_string()))?;

    Ok(token.access_token)
}

async fn fetch_tweet_data(
    state: &AppState,
    tweet_id: &str,
    bearer_token: &str,
) -> Result<TweetResponse, FetchError> {
    let response = state
        .http_client
        .get(format!("{}/2/tweets/{tweet_id}", state.api_base))
        .query(&[
            ("expansions", "attachments.media_keys"),
            ("media.fields", "url,variants"),
        ])
        .bearer_auth(bearer_token)
        .send()
        .await
        .map_err(|error| FetchError::TweetData(error.to_string()))?;

    if !response.status().is_success() {
        return Err(FetchError::TweetData(upstream_error_message(response).await));
    }

    response
        .json::<TweetResponse>()
        .await
        .map_err(|error| FetchError::TweetData(error.to_string()))
}

async fn upstream_error_message(response: reqwest::Response) -> String {
    let status = response.status();
    let fallback = format!("upstream request failed with status {status}");
    match response.json::<UpstreamErrorBody>().await {
        Ok(body) => body
            .errors
            .into_iter()
            .next()
            .and_then(|detail| detail.message)
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}

// Only the first media entry of the tweet is considered; among its mp4
// variants the highest bitrate wins, first encountered on ties.
fn extract_video_url(tweet: &TweetResponse) -> Option<&str> {
    let media = tweet.includes.as_ref()?.media.first()?;
    if media.kind != "video" {
        return None;
    }

    let mut best: Option<&MediaVariant> = None;
    for variant in &media.variants {
        if variant.content_type.as_deref() != Some(MP4_CONTENT_TYPE) || variant.url.is_none() {
            continue;
        }

        let beats_best = match best {
            Some(current) => variant.bitrate.unwrap_or(0) > current.bitrate.unwrap_or(0),
            None => true,
        };
        if beats_best {
            best = Some(variant);
        }
    }

    best.and_then(|variant| variant.url.as_deref())
}

async fn bind_with_fallback(
    host: &str,
    base_port: u16,
    max_attempts: u16,
) -> Result<TcpListener, StartupError> {
    let mut port = base_port;
    for _ in 0..max_attempts {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok(listener),
            Err(error) if error.kind() == ErrorKind::AddrInUse => {
                let Some(next) = port.checked_add(1) else {
                    break;
                };
                warn!("Port {port} is in use, trying {next}...");
                port = next;
            }
            Err(error) => return Err(StartupError::Io(error)),
        }
    }

    Err(StartupError::PortsExhausted {
        base_port,
        attempts: max_attempts,
    })
}

fn read_secret_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .and_then(|value| non_empty(&value).map(ToString::to_string))
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
