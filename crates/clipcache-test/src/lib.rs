//! Helpers for testing the clip cache.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test that asserts on behavior involving background work, call [`setup`]. This
//!    sets up the logger so that all console output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. The store keeps its database open, and deleting the directory
//!    underneath it makes later writes fail in confusing ways. Assign it to a variable in the
//!    test function (e.g. `let dir = clipcache_test::tempdir()`).
//!
//!  - When using [`SpeechServer`], hold on to it until the last request has been made. It stops
//!    serving when dropped, and requests to it fail with connection errors after that.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the clip cache crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("clipcache_service=trace,clipcache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// Creates `len` bytes of deterministic, incompressible "audio" for `seed`.
///
/// The payload starts with an `ID3` tag like the MP3 files real synthesizers return. Different
/// seeds produce different payloads.
pub fn fake_audio(len: usize, seed: u64) -> Vec<u8> {
    const HEADER: &[u8] = b"ID3";

    let mut audio = vec![0; len];
    let header_len = HEADER.len().min(len);
    audio[..header_len].copy_from_slice(&HEADER[..header_len]);
    StdRng::seed_from_u64(seed).fill_bytes(&mut audio[header_len..]);

    audio
}

/// Creates `len` bytes of highly repetitive "audio", the kind zstd shrinks a lot.
pub fn silent_audio(len: usize) -> Vec<u8> {
    let mut audio = fake_audio(len.min(3), 0);
    audio.resize(len, 0);
    audio
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the socket address that this server listens on.
    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The key [`SpeechServer`] accepts in the `Ocp-Apim-Subscription-Key` header.
pub const SUBSCRIPTION_KEY: &str = "test-subscription-key";

/// Path of the voice list endpoint.
pub const VOICES_PATH: &str = "/cognitiveservices/voices/list";

/// Path of the synthesis endpoint.
pub const SYNTHESIS_PATH: &str = "/cognitiveservices/v1";

/// The voices [`SpeechServer`] advertises.
///
/// `en-US` and `de-DE` have a male and a female neural voice, `fr-FR` only has a standard voice
/// and `es-MX` is the only Spanish locale.
const VOICES: &str = r#"[
    {"Name": "Microsoft Server Speech Text to Speech Voice (en-US, AriaStandard)", "DisplayName": "Aria", "ShortName": "en-US-AriaStandard", "Gender": "Female", "Locale": "en-US", "VoiceType": "Standard", "Status": "GA"},
    {"Name": "Microsoft Server Speech Text to Speech Voice (en-US, GuyNeural)", "DisplayName": "Guy", "ShortName": "en-US-GuyNeural", "Gender": "Male", "Locale": "en-US", "VoiceType": "Neural", "Status": "GA"},
    {"Name": "Microsoft Server Speech Text to Speech Voice (en-US, JennyNeural)", "DisplayName": "Jenny", "ShortName": "en-US-JennyNeural", "Gender": "Female", "Locale": "en-US", "VoiceType": "Neural", "Status": "GA"},
    {"Name": "Microsoft Server Speech Text to Speech Voice (en-US, DavisNeural)", "DisplayName": "Davis", "ShortName": "en-US-DavisNeural", "Gender": "Male", "Locale": "en-US", "VoiceType": "Neural", "Status": "GA"},
    {"Name": "Microsoft Server Speech Text to Speech Voice (de-DE, ConradNeural)", "DisplayName": "Conrad", "ShortName": "de-DE-ConradNeural", "Gender": "Male", "Locale": "de-DE", "VoiceType": "Neural", "Status": "GA"},
    {"Name": "Microsoft Server Speech Text to Speech Voice (de-DE, KatjaNeural)", "DisplayName": "Katja", "ShortName": "de-DE-KatjaNeural", "Gender": "Female", "Locale": "de-DE", "VoiceType": "Neural", "Status": "GA"},
    {"Name": "Microsoft Server Speech Text to Speech Voice (fr-FR, HortenseRUS)", "DisplayName": "Hortense", "ShortName": "fr-FR-HortenseRUS", "Gender": "Female", "Locale": "fr-FR", "VoiceType": "Standard", "Status": "GA"},
    {"Name": "Microsoft Server Speech Text to Speech Voice (es-MX, DaliaNeural)", "DisplayName": "Dalia", "ShortName": "es-MX-DaliaNeural", "Gender": "Female", "Locale": "es-MX", "VoiceType": "Neural", "Status": "GA"}
]"#;

/// A synthesis request received by [`SpeechServer`].
#[derive(Clone, Debug)]
pub struct SpeechRequest {
    pub ssml: String,
    pub content_type: Option<String>,
    pub output_format: Option<String>,
}

#[derive(Debug, Default)]
struct Recorded {
    hits: BTreeMap<String, usize>,
    requests: Vec<SpeechRequest>,
}

type SharedRecorded = Arc<Mutex<Recorded>>;

/// A fake text-to-speech service speaking the Azure REST protocol.
///
/// Requests without [`SUBSCRIPTION_KEY`] are rejected with `401`. The synthesis endpoint answers
/// with `ID3` followed by the received SSML, so every distinct request yields distinct audio.
/// SSML containing `FAIL` is answered with `500`, SSML containing `SILENCE` with an empty body.
#[derive(Debug)]
pub struct SpeechServer {
    server: Server,
    recorded: SharedRecorded,
}

impl SpeechServer {
    pub fn new() -> Self {
        let recorded = SharedRecorded::default();

        let router = Router::new()
            .route(VOICES_PATH, get(list_voices))
            .route(SYNTHESIS_PATH, post(synthesize))
            .with_state(recorded.clone());

        Self {
            server: Server::with_router(router),
            recorded,
        }
    }

    /// The base URL to configure as the service endpoint, without a trailing slash.
    pub fn endpoint(&self) -> String {
        format!("http://localhost:{}", self.server.port())
    }

    /// Number of requests received on `path`.
    pub fn hits(&self, path: &str) -> usize {
        let recorded = self.recorded.lock().unwrap();
        recorded.hits.get(path).copied().unwrap_or_default()
    }

    /// All authorized synthesis requests received so far, in order.
    pub fn requests(&self) -> Vec<SpeechRequest> {
        self.recorded.lock().unwrap().requests.clone()
    }
}

impl Default for SpeechServer {
    fn default() -> Self {
        Self::new()
    }
}

fn record_hit(recorded: &SharedRecorded, path: &str) {
    *recorded
        .lock()
        .unwrap()
        .hits
        .entry(path.to_owned())
        .or_default() += 1;
}

fn is_authorized(headers: &HeaderMap) -> bool {
    headers
        .get("Ocp-Apim-Subscription-Key")
        .is_some_and(|key| key.as_bytes() == SUBSCRIPTION_KEY.as_bytes())
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}

async fn list_voices(State(recorded): State<SharedRecorded>, headers: HeaderMap) -> Response {
    record_hit(&recorded, VOICES_PATH);
    if !is_authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid subscription key").into_response();
    }

    ([(header::CONTENT_TYPE, "application/json")], VOICES).into_response()
}

async fn synthesize(
    State(recorded): State<SharedRecorded>,
    headers: HeaderMap,
    ssml: String,
) -> Response {
    record_hit(&recorded, SYNTHESIS_PATH);
    if !is_authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "invalid subscription key").into_response();
    }

    recorded.lock().unwrap().requests.push(SpeechRequest {
        ssml: ssml.clone(),
        content_type: header_string(&headers, "Content-Type"),
        output_format: header_string(&headers, "X-Microsoft-OutputFormat"),
    });

    if ssml.contains("FAIL") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "synthesis backend failed").into_response();
    }
    if ssml.contains("SILENCE") {
        return StatusCode::OK.into_response();
    }

    let mut audio = b"ID3".to_vec();
    audio.extend_from_slice(ssml.as_bytes());
    ([(header::CONTENT_TYPE, "audio/mpeg")], audio).into_response()
}
