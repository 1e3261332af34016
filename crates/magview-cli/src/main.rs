use std::env;
use std::io::{self, ErrorKind};
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use magview_contracts::chat::{
    home_view, parse_envelope, settings_modal, InboundEvent, DEMO_BUTTON_ACTION_ID,
    SETTINGS_BUTTON_ACTION_ID,
};
use magview_contracts::events::EventLog;
use magview_contracts::settings::{AppSettings, SettingsStore};
use magview_engine::{demo_image_png, ChatGateway, PipelineEngine, SlackGateway};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};
use tungstenite::client::IntoClientRequest;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

#[derive(Debug, Parser)]
#[command(name = "magview", version, about = "Reaction-triggered image accessibility bot")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Connect to the workspace in socket mode and serve reaction events.
    Serve(ServeArgs),
    /// Upload the demo image to a channel or DM.
    Demo(DemoArgs),
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value = "mag")]
    trigger: String,
    #[arg(long)]
    captioner: Option<String>,
}

#[derive(Debug, Parser)]
struct DemoArgs {
    #[arg(long)]
    channel: String,
    #[arg(long)]
    events: Option<PathBuf>,
}

const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
const SOCKET_READ_TIMEOUT_MS: u64 = 500;
const HTTP_TIMEOUT_SECONDS: u64 = 30;
const TRANSPORT_RETRY_MAX_DEFAULT: usize = 3;
const TRANSPORT_RETRY_BACKOFF_MS_DEFAULT: u64 = 750;
const DEMO_IMAGE_WIDTH: u32 = 480;
const DEMO_IMAGE_HEIGHT: u32 = 320;
const DEMO_FILE_NAME: &str = "magview-demo.png";
const DEMO_COMMENT: &str =
    "React to this image with a 🔎, and let's make this image easily readable!";

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("magview error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            run_serve(args)?;
            Ok(0)
        }
        Command::Demo(args) => {
            run_demo(args)?;
            Ok(0)
        }
    }
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("events.jsonl"));
    let events = EventLog::new(events_path);
    let settings = Arc::new(SettingsStore::new(AppSettings::default()));
    let gateway = Arc::new(SlackGateway::from_env()?);
    let mut engine = PipelineEngine::new(
        &args.out,
        events.clone(),
        Arc::clone(&settings),
        Arc::clone(&gateway) as Arc<dyn ChatGateway>,
    )?
    .with_trigger(&args.trigger);
    if let Some(captioner) = &args.captioner {
        engine = engine.with_captioner(captioner)?;
    }
    let engine = Arc::new(engine);

    let app_token = non_empty_env("SLACK_APP_TOKEN")
        .ok_or_else(|| anyhow::anyhow!("SLACK_APP_TOKEN not set"))?;
    let api_base =
        non_empty_env("SLACK_API_BASE").unwrap_or_else(|| DEFAULT_SLACK_API_BASE.to_string());
    let http = HttpClient::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
        .build()
        .context("failed to build http client")?;

    let max_retries = transport_retry_limit();
    let mut attempt: usize = 0;
    loop {
        let mut ws = match open_socket_session(&http, &api_base, &app_token) {
            Ok(ws) => {
                attempt = 0;
                let _ = events.emit(
                    "socket_connected",
                    map_object(json!({ "trigger": engine.trigger_reaction() })),
                );
                ws
            }
            Err(err) => {
                if attempt >= max_retries {
                    return Err(err.context("socket connection failed"));
                }
                attempt += 1;
                let backoff = transport_retry_backoff(attempt);
                let _ = events.emit(
                    "socket_retry",
                    map_object(json!({
                        "attempt": attempt,
                        "backoff_ms": backoff.as_millis() as u64,
                    })),
                );
                thread::sleep(backoff);
                continue;
            }
        };

        match pump_socket(&mut ws, &engine, &gateway, &events) {
            Ok(SocketExit::Disconnect { reason }) => {
                let _ = events.emit(
                    "socket_disconnected",
                    map_object(json!({ "reason": reason })),
                );
                let _ = ws.close(None);
            }
            Err(err) => {
                let _ = ws.close(None);
                if is_anyhow_transport_error(&err) && attempt < max_retries {
                    attempt += 1;
                    let backoff = transport_retry_backoff(attempt);
                    let _ = events.emit(
                        "socket_retry",
                        map_object(json!({
                            "attempt": attempt,
                            "backoff_ms": backoff.as_millis() as u64,
                        })),
                    );
                    thread::sleep(backoff);
                    continue;
                }
                return Err(err);
            }
        }
    }
}

enum SocketExit {
    Disconnect { reason: String },
}

fn pump_socket(
    ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    engine: &Arc<PipelineEngine>,
    gateway: &Arc<SlackGateway>,
    events: &EventLog,
) -> Result<SocketExit> {
    loop {
        let message = match ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
            {
                continue;
            }
            Err(err) => return Err(anyhow::Error::new(err).context("socket read failed")),
        };

        let raw = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            WsMessage::Ping(_) | WsMessage::Pong(_) => continue,
            WsMessage::Close(_) => bail!("socket closed by peer"),
            _ => continue,
        };

        let envelope = parse_envelope(&raw);
        // Ack before handling; a slow pipeline run must not delay the ack.
        if let Some(envelope_id) = &envelope.envelope_id {
            websocket_send_json(ws, &ack_payload(envelope_id))?;
        }

        match envelope.event {
            InboundEvent::Hello { num_connections } => {
                let _ = events.emit(
                    "socket_hello",
                    map_object(json!({ "num_connections": num_connections })),
                );
            }
            InboundEvent::Disconnect { reason } => {
                return Ok(SocketExit::Disconnect { reason });
            }
            InboundEvent::ReactionAdded {
                reaction,
                channel,
                message_ts,
            } => {
                let engine = Arc::clone(engine);
                thread::spawn(move || {
                    let _ = engine.handle_reaction(&channel, &message_ts, &reaction);
                });
            }
            InboundEvent::AppHomeOpened { user } => {
                let gateway = Arc::clone(gateway);
                let events = events.clone();
                thread::spawn(move || {
                    if let Err(err) = gateway.publish_home(&user, &home_view()) {
                        let _ = events.emit(
                            "home_publish_failed",
                            map_object(json!({
                                "user": user,
                                "cause": format!("{err:#}"),
                            })),
                        );
                    }
                });
            }
            InboundEvent::BlockAction {
                action_id,
                user,
                trigger_id,
                ..
            } => {
                dispatch_block_action(engine, gateway, events, action_id, user, trigger_id);
            }
            InboundEvent::ViewSubmission { update } => {
                if !update.is_empty() {
                    let _ = engine.apply_settings(&update);
                }
            }
            InboundEvent::Unknown { envelope_type } => {
                let _ = events.emit(
                    "socket_event_ignored",
                    map_object(json!({ "envelope_type": envelope_type })),
                );
            }
        }
    }
}

fn dispatch_block_action(
    engine: &Arc<PipelineEngine>,
    gateway: &Arc<SlackGateway>,
    events: &EventLog,
    action_id: String,
    user: String,
    trigger_id: Option<String>,
) {
    match action_id.as_str() {
        SETTINGS_BUTTON_ACTION_ID => {
            let Some(trigger_id) = trigger_id else {
                let _ = events.emit(
                    "modal_open_failed",
                    map_object(json!({ "cause": "block action carried no trigger_id" })),
                );
                return;
            };
            let snapshot = engine.settings().snapshot();
            let gateway = Arc::clone(gateway);
            let events = events.clone();
            thread::spawn(move || {
                if let Err(err) = gateway.open_view(&trigger_id, &settings_modal(&snapshot)) {
                    let _ = events.emit(
                        "modal_open_failed",
                        map_object(json!({ "cause": format!("{err:#}") })),
                    );
                }
            });
        }
        DEMO_BUTTON_ACTION_ID => {
            let gateway = Arc::clone(gateway);
            let events = events.clone();
            thread::spawn(move || match send_demo_image(&gateway, &user) {
                Ok(file_id) => {
                    let _ = events.emit(
                        "demo_sent",
                        map_object(json!({ "channel": user, "file_id": file_id })),
                    );
                }
                Err(err) => {
                    let _ = events.emit(
                        "demo_failed",
                        map_object(json!({
                            "channel": user,
                            "cause": format!("{err:#}"),
                        })),
                    );
                }
            });
        }
        other => {
            let _ = events.emit(
                "block_action_ignored",
                map_object(json!({ "action_id": other })),
            );
        }
    }
}

/// Uploads the deterministic demo gradient and shares it publicly up front
/// so a later reaction run can resolve its download URL.
fn send_demo_image(gateway: &SlackGateway, channel: &str) -> Result<Option<String>> {
    let bytes = demo_image_png(DEMO_IMAGE_WIDTH, DEMO_IMAGE_HEIGHT)?;
    let payload = gateway.upload_file(channel, None, DEMO_COMMENT, DEMO_FILE_NAME, bytes)?;
    let file_id = payload
        .pointer("/file/id")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(file_id) = &file_id {
        let _ = gateway.share_public_url(file_id);
    }
    Ok(file_id)
}

fn run_demo(args: DemoArgs) -> Result<()> {
    let events = EventLog::new(
        args.events
            .unwrap_or_else(|| PathBuf::from("magview-events.jsonl")),
    );
    let gateway = SlackGateway::from_env()?;
    let file_id = send_demo_image(&gateway, &args.channel)?;
    events.emit(
        "demo_sent",
        map_object(json!({ "channel": args.channel, "file_id": file_id })),
    )?;
    println!("Demo image sent to {}.", args.channel);
    Ok(())
}

fn open_socket_session(
    http: &HttpClient,
    api_base: &str,
    app_token: &str,
) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
    let url = format!("{}/apps.connections.open", api_base.trim_end_matches('/'));
    let response = http
        .post(&url)
        .bearer_auth(app_token)
        .send()
        .context("apps.connections.open request failed")?;
    if !response.status().is_success() {
        bail!(
            "apps.connections.open failed ({})",
            response.status().as_u16()
        );
    }
    let payload: Value = response
        .json()
        .context("apps.connections.open returned invalid JSON")?;
    if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        bail!(
            "apps.connections.open failed: {}",
            payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error")
        );
    }
    let ws_url = payload
        .get("url")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow::anyhow!("apps.connections.open returned no url"))?;
    connect_socket(ws_url)
}

fn connect_socket(ws_url: &str) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
    let request = ws_url
        .into_client_request()
        .context("invalid socket websocket request")?;
    let (mut ws, _) = websocket_connect(request).context("failed to connect socket websocket")?;
    set_socket_read_timeout(&mut ws, Some(Duration::from_millis(SOCKET_READ_TIMEOUT_MS)));
    Ok(ws)
}

fn set_socket_read_timeout(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

fn websocket_send_json(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>, value: &Value) -> Result<()> {
    let raw = serde_json::to_string(value).context("failed to serialize socket payload")?;
    ws.send(WsMessage::Text(raw.into()))
        .context("failed to send socket payload")
}

fn ack_payload(envelope_id: &str) -> Value {
    json!({ "envelope_id": envelope_id })
}

fn transport_retry_limit() -> usize {
    env::var("MAGVIEW_TRANSPORT_RETRIES")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .map(|value| value.min(6))
        .unwrap_or(TRANSPORT_RETRY_MAX_DEFAULT)
}

fn transport_retry_backoff(attempt: usize) -> Duration {
    let base_ms = env::var("MAGVIEW_TRANSPORT_RETRY_BACKOFF_MS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(|value| value.clamp(50, 5000))
        .unwrap_or(TRANSPORT_RETRY_BACKOFF_MS_DEFAULT);
    let multiplier = u64::try_from(attempt.max(1)).unwrap_or(u64::MAX);
    Duration::from_millis(base_ms.saturating_mul(multiplier))
}

fn is_anyhow_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<tungstenite::Error>()
            .map(is_tungstenite_transport_error)
            .unwrap_or(false)
            || cause
                .downcast_ref::<io::Error>()
                .map(|io_err| is_transport_io_error_kind(io_err.kind()))
                .unwrap_or(false)
    })
}

fn is_tungstenite_transport_error(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Io(io_err) => is_transport_io_error_kind(io_err.kind()),
        tungstenite::Error::Tls(_) => true,
        _ => false,
    }
}

fn is_transport_io_error_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::io;

    use serde_json::json;

    use super::{
        ack_payload, is_anyhow_transport_error, is_tungstenite_transport_error,
        transport_retry_backoff, DEMO_COMMENT,
    };

    #[test]
    fn ack_payload_carries_only_the_envelope_id() {
        assert_eq!(ack_payload("env-7"), json!({"envelope_id": "env-7"}));
    }

    #[test]
    fn transport_retry_backoff_grows_linearly() {
        let first = transport_retry_backoff(1);
        let third = transport_retry_backoff(3);
        assert_eq!(third.as_millis(), first.as_millis() * 3);
        assert_eq!(transport_retry_backoff(0), first);
    }

    #[test]
    fn io_resets_are_transport_errors() {
        let reset = tungstenite::Error::Io(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(is_tungstenite_transport_error(&reset));
        assert!(is_tungstenite_transport_error(
            &tungstenite::Error::ConnectionClosed
        ));

        let protocol = tungstenite::Error::Protocol(
            tungstenite::error::ProtocolError::ResetWithoutClosingHandshake,
        );
        assert!(!is_tungstenite_transport_error(&protocol));
    }

    #[test]
    fn anyhow_chains_surface_transport_causes() {
        let broken_pipe = anyhow::Error::new(tungstenite::Error::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "pipe",
        )))
        .context("socket read failed");
        assert!(is_anyhow_transport_error(&broken_pipe));

        let terminal = anyhow::anyhow!("apps.connections.open failed: invalid_auth");
        assert!(!is_anyhow_transport_error(&terminal));
    }

    #[test]
    fn demo_comment_mentions_the_trigger_emoji() {
        assert!(DEMO_COMMENT.contains("🔎"));
    }
}
