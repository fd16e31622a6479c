//! # Live Session WebSocket Client
//!
//! Connects to the hosted live-conversation endpoint and relays audio both ways.
//!
//! ## Protocol:
//! 1. **Connection**: `wss://...BidiGenerateContent?key=<API key>`
//! 2. **Setup**: First message is a JSON `setup` with model, voice, modality and
//!    system instruction
//! 3. **Audio Streaming**: Each captured frame is sent as `realtimeInput.mediaChunks`
//! 4. **Server Content**: JSON (text or binary frames) carrying 24kHz PCM in
//!    `serverContent.modelTurn.parts[].inlineData`, plus `interrupted` and
//!    `turnComplete` flags
//! 5. **Lifecycle**: open / error / close are reported as [`SessionEvent`]s
//!
//! ## Message Format:
//! - **Client → Server**: `{"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=16000","data":"..."}]}}`
//! - **Server → Client**: `{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"..."}}]}}}`

use crate::audio::capture::AudioSender;
use crate::audio::session::{EventSender, SessionEvent};
use crate::audio::WireAudioMessage;
use crate::error::{TransportErrorKind, VoiceError, VoiceResult};

use anyhow::anyhow;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};
use url::Url;

/// The fixed roster of prebuilt voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Voice {
    Kore,
    Puck,
    Charon,
    Fenrir,
    Zephyr,
}

impl Voice {
    pub const ALL: [Voice; 5] = [Voice::Kore, Voice::Puck, Voice::Charon, Voice::Fenrir, Voice::Zephyr];
}

impl std::str::FromStr for Voice {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "kore" => Ok(Voice::Kore),
            "puck" => Ok(Voice::Puck),
            "charon" => Ok(Voice::Charon),
            "fenrir" => Ok(Voice::Fenrir),
            "zephyr" => Ok(Voice::Zephyr),
            _ => Err(anyhow!("Unknown voice: {}", s)),
        }
    }
}

impl std::fmt::Display for Voice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Voice::Kore => "Kore",
            Voice::Puck => "Puck",
            Voice::Charon => "Charon",
            Voice::Fenrir => "Fenrir",
            Voice::Zephyr => "Zephyr",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Client → server messages
// ---------------------------------------------------------------------------

/// Messages sent to the live endpoint.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// Session configuration, always the first message
    Setup(Setup),
    /// One or more captured audio frames
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

impl SpeechConfig {
    pub fn for_voice(voice: Voice) -> Self {
        Self {
            voice_config: VoiceConfig {
                prebuilt_voice_config: PrebuiltVoiceConfig {
                    voice_name: voice.to_string(),
                },
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<WireAudioMessage>,
}

impl ClientMessage {
    pub fn setup(request: &LiveSessionRequest) -> Self {
        ClientMessage::Setup(Setup {
            model: request.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig::for_voice(request.voice),
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: request.system_instruction.clone(),
                }],
            },
        })
    }

    pub fn audio(frame: WireAudioMessage) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![frame],
        })
    }
}

// ---------------------------------------------------------------------------
// Server → client messages
// ---------------------------------------------------------------------------

/// A message from the live endpoint. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

impl ServerMessage {
    /// Parse a text or binary frame body.
    pub fn parse(payload: &[u8]) -> VoiceResult<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Base64 PCM carried by the model turn, if any.
    pub fn audio_payload(&self) -> Option<&str> {
        self.server_content
            .as_ref()?
            .model_turn
            .as_ref()?
            .parts
            .iter()
            .find_map(|part| part.inline_data.as_ref())
            .map(|inline| inline.data.as_str())
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content.as_ref().map_or(false, |c| c.interrupted)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content.as_ref().map_or(false, |c| c.turn_complete)
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }
}

// ---------------------------------------------------------------------------
// Connector seam
// ---------------------------------------------------------------------------

/// Everything needed to open one live session.
#[derive(Clone)]
pub struct LiveSessionRequest {
    pub endpoint: String,
    pub model: String,
    pub voice: Voice,
    pub system_instruction: String,
    pub api_key: String,
    pub outbound_queue_frames: usize,
}

impl std::fmt::Debug for LiveSessionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveSessionRequest")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("outbound_queue_frames", &self.outbound_queue_frames)
            .finish()
    }
}

impl LiveSessionRequest {
    /// The endpoint with the API key appended as a query parameter.
    ///
    /// Keeps any query the endpoint already carries, percent-encodes the key
    /// and gives a bare `ws://host:port` endpoint its `/` path.
    fn url(&self) -> VoiceResult<String> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| VoiceError::Config(format!("Invalid live endpoint {}: {}", self.endpoint, e)))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url.into())
    }
}

/// Opens live sessions. The handshake completes asynchronously: success is
/// reported as `SessionEvent::Opened`, failure as `SessionEvent::TransportFailed`.
pub trait LiveConnector {
    fn connect(
        &mut self,
        request: LiveSessionRequest,
        events: EventSender,
    ) -> VoiceResult<Box<dyn LiveSessionHandle>>;
}

/// An open (or opening) live session.
pub trait LiveSessionHandle {
    /// Non-blocking sender for captured frames.
    fn audio_sender(&self) -> AudioSender;

    /// Close the session. Safe to call more than once; never fails.
    fn close(&mut self);
}

/// The tokio-tungstenite implementation of [`LiveConnector`].
///
/// Must be used from inside a tokio runtime.
#[derive(Debug, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl LiveConnector for WebSocketConnector {
    fn connect(
        &mut self,
        request: LiveSessionRequest,
        events: EventSender,
    ) -> VoiceResult<Box<dyn LiveSessionHandle>> {
        let url = request.url()?;
        let (sender, outbound) = AudioSender::channel(request.outbound_queue_frames);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        info!(
            generation = events.generation(),
            endpoint = %request.endpoint,
            voice = %request.voice,
            "Connecting to live endpoint"
        );
        let task = tokio::spawn(run_session(url, request, outbound, shutdown_rx, events));

        Ok(Box::new(WebSocketSession {
            sender,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }))
    }
}

/// Handle to the background task that owns the socket.
struct WebSocketSession {
    sender: AudioSender,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LiveSessionHandle for WebSocketSession {
    fn audio_sender(&self) -> AudioSender {
        self.sender.clone()
    }

    fn close(&mut self) {
        // The task sends a close frame when it sees the signal; if it already
        // exited the send fails, which is fine.
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.task.take();
    }
}

impl Drop for WebSocketSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Map a tungstenite failure onto the transport taxonomy.
pub fn classify_ws_error(err: &WsError) -> VoiceError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            VoiceError::Transport {
                kind: TransportErrorKind::from_status(status),
                detail: format!("HTTP {} during WebSocket upgrade", status),
            }
        }
        WsError::Io(e) => VoiceError::Transport {
            kind: TransportErrorKind::NetworkUnreachable,
            detail: e.to_string(),
        },
        other => VoiceError::transport(other.to_string()),
    }
}

/// Owns the socket for one session: handshake, setup, then pumps both directions
/// until the server closes, an error occurs or the handle asks to shut down.
async fn run_session(
    url: String,
    request: LiveSessionRequest,
    mut outbound: mpsc::Receiver<WireAudioMessage>,
    mut shutdown: oneshot::Receiver<()>,
    events: EventSender,
) {
    let connect = tokio_tungstenite::connect_async(url);
    let ws = tokio::select! {
        result = connect => match result {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let error = classify_ws_error(&e);
                warn!(kind = error.kind(), detail = error.detail(), "Live endpoint handshake failed");
                events.send(SessionEvent::TransportFailed(error));
                return;
            }
        },
        _ = &mut shutdown => {
            debug!("Connection attempt abandoned");
            return;
        }
    };

    let (mut write, mut read) = ws.split();

    let setup = match serde_json::to_string(&ClientMessage::setup(&request)) {
        Ok(json) => json,
        Err(e) => {
            events.send(SessionEvent::TransportFailed(e.into()));
            return;
        }
    };
    if let Err(e) = write.send(Message::Text(setup)).await {
        events.send(SessionEvent::TransportFailed(classify_ws_error(&e)));
        return;
    }

    info!(generation = events.generation(), "Live session open");
    events.send(SessionEvent::Opened);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let _ = write.send(Message::Close(None)).await;
                debug!("Live session closed by client");
                break;
            }
            Some(frame) = outbound.recv() => {
                let json = match serde_json::to_string(&ClientMessage::audio(frame)) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Failed to serialize audio frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(json)).await {
                    events.send(SessionEvent::TransportFailed(classify_ws_error(&e)));
                    break;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => relay(text.as_bytes(), &events),
                Some(Ok(Message::Binary(bytes))) => relay(&bytes, &events),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .filter(|reason| !reason.is_empty());
                    info!(reason = ?reason, "Live endpoint closed the session");
                    events.send(SessionEvent::Closed { reason });
                    break;
                }
                Some(Ok(_)) => {} // ping/pong are answered by tungstenite
                Some(Err(e)) => {
                    events.send(SessionEvent::TransportFailed(classify_ws_error(&e)));
                    break;
                }
                None => {
                    events.send(SessionEvent::Closed { reason: None });
                    break;
                }
            }
        }
    }
}

/// Parse a server frame and forward it. Malformed frames are dropped.
fn relay(payload: &[u8], events: &EventSender) {
    match ServerMessage::parse(payload) {
        Ok(message) => {
            events.send(SessionEvent::Message(message));
        }
        Err(e) => warn!(detail = e.detail(), "Dropping malformed server message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use crate::audio::session::Envelope;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::http;

    fn request(endpoint: &str) -> LiveSessionRequest {
        LiveSessionRequest {
            endpoint: endpoint.to_string(),
            model: "models/test-model".to_string(),
            voice: Voice::Puck,
            system_instruction: "Be brief.".to_string(),
            api_key: "test-key".to_string(),
            outbound_queue_frames: 4,
        }
    }

    #[test]
    fn test_voice_parsing() {
        assert_eq!("kore".parse::<Voice>().unwrap(), Voice::Kore);
        assert_eq!("Zephyr".parse::<Voice>().unwrap(), Voice::Zephyr);
        assert!("Alloy".parse::<Voice>().is_err());
        assert_eq!(Voice::Fenrir.to_string(), "Fenrir");
    }

    #[test]
    fn test_setup_message_shape() {
        let json = serde_json::to_value(ClientMessage::setup(&request("wss://x"))).unwrap();
        let setup = &json["setup"];
        assert_eq!(setup["model"], "models/test-model");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Be brief.");
    }

    #[test]
    fn test_realtime_input_shape() {
        let frame = codec::encode(&[0.0; 4]);
        let json = serde_json::to_value(ClientMessage::audio(frame)).unwrap();
        let chunk = &json["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(chunk["data"], "AAAAAAAAAAA=");
    }

    #[test]
    fn test_server_message_parsing() {
        let audio = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm;rate=24000","data":"AAA="}}]}}}"#;
        let message = ServerMessage::parse(audio).unwrap();
        assert_eq!(message.audio_payload(), Some("AAA="));
        assert!(!message.is_interrupted());

        let interrupted = br#"{"serverContent":{"interrupted":true}}"#;
        let message = ServerMessage::parse(interrupted).unwrap();
        assert!(message.is_interrupted());
        assert_eq!(message.audio_payload(), None);

        let setup = br#"{"setupComplete":{},"somethingNew":1}"#;
        assert!(ServerMessage::parse(setup).unwrap().is_setup_complete());

        assert!(ServerMessage::parse(b"not json").is_err());
    }

    #[test]
    fn test_http_error_classification() {
        let response = http::Response::builder().status(403).body(None).unwrap();
        let error = classify_ws_error(&WsError::Http(response));
        assert_eq!(error.to_string(), "Access Denied: Check API Key/Quota.");

        let response = http::Response::builder().status(503).body(None).unwrap();
        let error = classify_ws_error(&WsError::Http(response));
        assert_eq!(error.to_string(), "Service Overloaded. Try later.");

        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = classify_ws_error(&WsError::Io(io));
        assert_eq!(error.to_string(), "Network Error. Check internet.");
    }

    #[test]
    fn test_url_appends_encoded_key() {
        assert_eq!(
            request("ws://127.0.0.1:9000").url().unwrap(),
            "ws://127.0.0.1:9000/?key=test-key"
        );

        let mut with_query = request("wss://live.example.com/ws/Bidi?alt=json");
        with_query.api_key = "a+b/c=&d".to_string();
        assert_eq!(
            with_query.url().unwrap(),
            "wss://live.example.com/ws/Bidi?alt=json&key=a%2Bb%2Fc%3D%26d"
        );
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let err = request("not a url").url().unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn test_request_debug_hides_key() {
        let printed = format!("{:?}", request("wss://x"));
        assert!(!printed.contains("test-key"));
    }

    #[tokio::test]
    async fn test_session_round_trip_against_local_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (received_tx, received_rx) = oneshot::channel::<()>();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // First message must be the setup
            let setup = ws.next().await.unwrap().unwrap();
            assert!(setup.to_text().unwrap().contains("\"setup\""));

            let reply = r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAA="}}]}}}"#;
            ws.send(Message::Binary(reply.as_bytes().to_vec())).await.unwrap();

            let audio = ws.next().await.unwrap().unwrap();
            assert!(audio.to_text().unwrap().contains("realtimeInput"));
            let _ = received_tx.send(());

            // Wait for the client's close frame
            while let Some(Ok(message)) = ws.next().await {
                if message.is_close() {
                    break;
                }
            }
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let events = EventSender::new(7, tx);
        let mut connector = WebSocketConnector::new();
        let mut handle = connector
            .connect(request(&format!("ws://{}", addr)), events)
            .unwrap();

        let opened = rx.recv().await.unwrap();
        assert_eq!(opened.generation, 7);
        assert!(matches!(opened.event, SessionEvent::Opened));

        let message = rx.recv().await.unwrap();
        match message.event {
            SessionEvent::Message(msg) => assert_eq!(msg.audio_payload(), Some("AAA=")),
            other => panic!("unexpected event: {:?}", other),
        }

        assert!(handle.audio_sender().send(codec::encode(&[0.25; 16])));
        received_rx.await.unwrap();
        handle.close();
        server.await.unwrap();
    }
}
