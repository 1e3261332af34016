use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use magview_contracts::chat::{AttachmentRef, ChatMessage, FileAttachment};
use magview_contracts::events::{now_utc_iso, EventLog};
use magview_contracts::runs::{
    write_summary, RunOutcome, RunStage, RunSummary, StageError, PROCESSING_REPLY,
};
use magview_contracts::settings::{
    AppSettings, ColoringMode, SettingsError, SettingsStore, SettingsUpdate,
};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use uuid::Uuid;

const HTTP_TIMEOUT_SECONDS: u64 = 30;
const DESCRIBE_LANGUAGE: &str = "en";
const DEFAULT_SLACK_API_BASE: &str = "https://slack.com/api";
const DEFAULT_TRIGGER_REACTION: &str = "mag";
const CONVERTED_FILE_NAME: &str = "converted.png";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptionResult {
    pub text: String,
    pub confidence_percent: u32,
}

pub trait CaptionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn describe(&self, image_url: &str) -> Result<DescriptionResult>;
}

#[derive(Default)]
pub struct CaptionProviderRegistry {
    providers: BTreeMap<String, Box<dyn CaptionProvider>>,
}

impl CaptionProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: CaptionProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn CaptionProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Deterministic captioner used when no vision service is configured and in
/// tests: same URL in, same caption out.
pub struct DryrunCaptionProvider;

impl CaptionProvider for DryrunCaptionProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn describe(&self, image_url: &str) -> Result<DescriptionResult> {
        let stem = image_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .split('.')
            .next()
            .unwrap_or_default()
            .replace(['_', '-'], " ");
        let text = if stem.trim().is_empty() {
            "a shared image".to_string()
        } else {
            format!("an image of {}", stem.trim())
        };
        let seed = image_url
            .bytes()
            .fold(0u32, |acc, byte| acc.wrapping_mul(31).wrapping_add(byte as u32));
        Ok(DescriptionResult {
            text,
            confidence_percent: 72 + seed % 24,
        })
    }
}

pub struct AzureVisionProvider {
    api_base: String,
    key: String,
    http: HttpClient,
}

impl AzureVisionProvider {
    pub fn new(api_base: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        Ok(Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            key: key.into(),
            http: http_client()?,
        })
    }

    /// Reads `AZURE_VISION_ENDPOINT` (or `AZURE_ACCOUNT_REGION`) plus
    /// `AZURE_ACCOUNT_KEY`; returns `None` when the service is not
    /// configured.
    pub fn from_env() -> Result<Option<Self>> {
        let Some(key) = non_empty_env("AZURE_ACCOUNT_KEY") else {
            return Ok(None);
        };
        let api_base = non_empty_env("AZURE_VISION_ENDPOINT").or_else(|| {
            non_empty_env("AZURE_ACCOUNT_REGION")
                .map(|region| format!("https://{region}.api.cognitive.microsoft.com"))
        });
        match api_base {
            Some(api_base) => Ok(Some(Self::new(api_base, key)?)),
            None => Ok(None),
        }
    }
}

impl CaptionProvider for AzureVisionProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn describe(&self, image_url: &str) -> Result<DescriptionResult> {
        let endpoint = format!("{}/vision/v3.2/describe", self.api_base);
        let response = self
            .http
            .post(&endpoint)
            .query(&[("maxCandidates", "1"), ("language", DESCRIBE_LANGUAGE)])
            .header("Ocp-Apim-Subscription-Key", &self.key)
            .json(&json!({ "url": image_url }))
            .send()
            .with_context(|| format!("describe request failed ({endpoint})"))?;
        let payload = response_json_or_error("describe", response)?;
        let caption = payload
            .pointer("/description/captions/0")
            .ok_or_else(|| anyhow::anyhow!("describe response returned no captions"))?;
        let text = caption
            .get("text")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| anyhow::anyhow!("describe response caption has no text"))?
            .to_string();
        let confidence = caption
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 1.0);
        Ok(DescriptionResult {
            text,
            confidence_percent: (confidence * 100.0).round() as u32,
        })
    }
}

pub fn default_caption_registry() -> Result<CaptionProviderRegistry> {
    let mut providers = CaptionProviderRegistry::new();
    providers.register(DryrunCaptionProvider);
    if let Some(azure) = AzureVisionProvider::from_env()? {
        providers.register(azure);
    }
    Ok(providers)
}

/// Result of sharing a file publicly; empty fields fall back to what the
/// message attachment already carried.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedFile {
    pub permalink_public: Option<String>,
    pub url_private: Option<String>,
}

/// The collaborator calls the pipeline needs from the chat platform.
pub trait ChatGateway: Send + Sync {
    fn fetch_message(&self, channel: &str, message_ts: &str) -> Result<Option<ChatMessage>>;
    fn share_public_url(&self, file_id: &str) -> Result<SharedFile>;
    fn download(&self, url: &str) -> Result<Vec<u8>>;
    fn post_message(&self, channel: &str, thread_ts: &str, text: &str) -> Result<()>;
    fn upload_image(
        &self,
        channel: &str,
        thread_ts: &str,
        comment: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<()>;
}

pub struct SlackGateway {
    api_base: String,
    bot_token: String,
    user_token: Option<String>,
    http: HttpClient,
}

impl SlackGateway {
    pub fn new(
        api_base: impl Into<String>,
        bot_token: impl Into<String>,
        user_token: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            api_base: api_base.into().trim().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            user_token,
            http: http_client()?,
        })
    }

    pub fn from_env() -> Result<Self> {
        let bot_token = non_empty_env("SLACK_BOT_TOKEN")
            .ok_or_else(|| anyhow::anyhow!("SLACK_BOT_TOKEN not set"))?;
        let api_base =
            non_empty_env("SLACK_API_BASE").unwrap_or_else(|| DEFAULT_SLACK_API_BASE.to_string());
        Self::new(api_base, bot_token, non_empty_env("SLACK_USER_TOKEN"))
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/{}", self.api_base, method)
    }

    fn call(&self, method: &str, token: &str, payload: &Value) -> Result<Value> {
        let url = self.method_url(method);
        let response = self
            .http
            .post(&url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .with_context(|| format!("{method} request failed"))?;
        slack_json_or_error(method, response)
    }

    pub fn publish_home(&self, user: &str, view: &Value) -> Result<()> {
        self.call(
            "views.publish",
            &self.bot_token,
            &json!({ "user_id": user, "view": view }),
        )?;
        Ok(())
    }

    pub fn open_view(&self, trigger_id: &str, view: &Value) -> Result<()> {
        self.call(
            "views.open",
            &self.bot_token,
            &json!({ "trigger_id": trigger_id, "view": view }),
        )?;
        Ok(())
    }

    /// Multipart upload; returns the full response payload so callers that
    /// need the created file id (the demo flow) can read it.
    pub fn upload_file(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        comment: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<Value> {
        let mut form = MultipartForm::new()
            .text("channels", channel.to_string())
            .text("initial_comment", comment.to_string())
            .text("filename", file_name.to_string());
        if let Some(thread_ts) = thread_ts {
            form = form.text("thread_ts", thread_ts.to_string());
        }
        let part = MultipartPart::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("image/png")
            .context("invalid mime for upload part")?;
        form = form.part("file", part);

        let response = self
            .http
            .post(self.method_url("files.upload"))
            .bearer_auth(&self.bot_token)
            .multipart(form)
            .send()
            .context("files.upload request failed")?;
        slack_json_or_error("files.upload", response)
    }
}

impl ChatGateway for SlackGateway {
    fn fetch_message(&self, channel: &str, message_ts: &str) -> Result<Option<ChatMessage>> {
        let response = self
            .http
            .get(self.method_url("conversations.history"))
            .bearer_auth(&self.bot_token)
            .query(&[
                ("channel", channel),
                ("latest", message_ts),
                ("inclusive", "true"),
                ("limit", "1"),
            ])
            .send()
            .context("conversations.history request failed")?;
        let payload = slack_json_or_error("conversations.history", response)?;
        Ok(payload
            .pointer("/messages/0")
            .map(ChatMessage::from_value))
    }

    fn share_public_url(&self, file_id: &str) -> Result<SharedFile> {
        let token = self
            .user_token
            .as_deref()
            .unwrap_or(self.bot_token.as_str());
        let response = self
            .http
            .post(self.method_url("files.sharedPublicURL"))
            .bearer_auth(token)
            .json(&json!({ "file": file_id }))
            .send()
            .context("files.sharedPublicURL request failed")?;
        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "files.sharedPublicURL failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        let payload: Value = response
            .json()
            .context("files.sharedPublicURL returned invalid JSON")?;
        if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            // Already shared counts as resolved; the attachment's own
            // permalink stays usable.
            if error == "already_public" {
                return Ok(SharedFile::default());
            }
            bail!("files.sharedPublicURL failed: {error}");
        }
        Ok(SharedFile {
            permalink_public: non_empty_json_str(payload.pointer("/file/permalink_public")),
            url_private: non_empty_json_str(payload.pointer("/file/url_private")),
        })
    }

    fn download(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "image download failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(response
            .bytes()
            .context("failed reading image bytes")?
            .to_vec())
    }

    fn post_message(&self, channel: &str, thread_ts: &str, text: &str) -> Result<()> {
        self.call(
            "chat.postMessage",
            &self.bot_token,
            &json!({ "channel": channel, "thread_ts": thread_ts, "text": text }),
        )?;
        Ok(())
    }

    fn upload_image(
        &self,
        channel: &str,
        thread_ts: &str,
        comment: &str,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        self.upload_file(channel, Some(thread_ts), comment, file_name, bytes)?;
        Ok(())
    }
}

/// Derives the unauthenticated download URL from a public permalink and the
/// attachment's private URL: the permalink's trailing segment is the public
/// secret the file host accepts as a query parameter.
pub fn public_download_url(permalink_public: &str, url_private: Option<&str>) -> Option<String> {
    let pub_secret = permalink_public
        .trim_end_matches('/')
        .rsplit('-')
        .next()
        .map(str::trim)
        .filter(|secret| !secret.is_empty())?;
    let url_private = url_private.map(str::trim).filter(|url| !url.is_empty())?;
    if url_private.contains('?') {
        Some(format!("{url_private}&pub_secret={pub_secret}"))
    } else {
        Some(format!("{url_private}?pub_secret={pub_secret}"))
    }
}

/// Decodes raw bytes into an RGB pixel buffer. Channel order is normalized
/// here, before any color work; a mismatch would remap the wrong hues.
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    let decoded = image::load_from_memory(bytes).context("failed to decode image bytes")?;
    Ok(decoded.to_rgb8())
}

const MIN_CONFUSABLE_SATURATION: f32 = 0.15;
const MIN_CONFUSABLE_VALUE: f32 = 0.10;
const MIN_OUTPUT_SATURATION: f32 = 0.30;

/// Pure per-pixel recoloring: hues inside the deficiency's confusion band
/// are rotated out of it, with a saturation floor so the shifted hue stays
/// visible. Same buffer + mode always yields byte-identical output.
pub fn correct_colors(image: &RgbImage, mode: ColoringMode) -> RgbImage {
    let mut out = RgbImage::new(image.width(), image.height());
    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let (h, s, v) = rgb_to_hsv(r, g, b);
        let (h, s) = remap_confusable_hue(h, s, v, mode);
        let (r, g, b) = hsv_to_rgb(h, s, v);
        out.put_pixel(x, y, Rgb([r, g, b]));
    }
    out
}

fn remap_confusable_hue(h: f32, s: f32, v: f32, mode: ColoringMode) -> (f32, f32) {
    if s < MIN_CONFUSABLE_SATURATION || v < MIN_CONFUSABLE_VALUE {
        return (h, s);
    }
    let rotated = match mode {
        // Red/green deficiencies: greens toward blue, reds toward blue via
        // magenta. Blue/yellow deficiency: blues toward red.
        ColoringMode::Deuteranopia => {
            (60.0..180.0).contains(&h).then(|| (h + 120.0) % 360.0)
        }
        ColoringMode::Protanopia => {
            (h < 60.0 || h >= 300.0).then(|| (h + 240.0) % 360.0)
        }
        ColoringMode::Tritanopia => {
            (180.0..300.0).contains(&h).then(|| (h + 150.0) % 360.0)
        }
    };
    match rotated {
        Some(h) => (h, s.max(MIN_OUTPUT_SATURATION)),
        None => (h, s),
    }
}

fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r = r as f32 / 255.0;
    let g = g as f32 / 255.0;
    let b = b as f32 / 255.0;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (((g - b) / delta).rem_euclid(6.0))
    } else if max == g {
        60.0 * ((b - r) / delta + 2.0)
    } else {
        60.0 * ((r - g) / delta + 4.0)
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let h = h.rem_euclid(360.0);
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0).rem_euclid(2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match h {
        h if h < 60.0 => (c, x, 0.0),
        h if h < 120.0 => (x, c, 0.0),
        h if h < 180.0 => (0.0, c, x),
        h if h < 240.0 => (0.0, x, c),
        h if h < 300.0 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (
        ((r + m) * 255.0).round() as u8,
        ((g + m) * 255.0).round() as u8,
        ((b + m) * 255.0).round() as u8,
    )
}

/// Scales to `round(w*scale) x round(h*scale)` with deterministic bilinear
/// interpolation. Scale 1.0 is a contractual no-op.
pub fn resize_image(image: &RgbImage, scale: f64) -> Result<RgbImage> {
    if !scale.is_finite() || scale <= 0.0 {
        bail!("invalid scale factor {scale}");
    }
    if (scale - 1.0).abs() < f64::EPSILON {
        return Ok(image.clone());
    }
    let width = (f64::from(image.width()) * scale).round() as u32;
    let height = (f64::from(image.height()) * scale).round() as u32;
    if width == 0 || height == 0 {
        bail!("scale factor {scale} produces an empty image");
    }
    Ok(image::imageops::resize(
        image,
        width,
        height,
        FilterType::Triangle,
    ))
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(image.clone())
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode png")?;
    Ok(bytes)
}

/// Deterministic red/green gradient used by the demo upload, so the sample
/// image actually exercises the recoloring.
pub fn demo_image_png(width: u32, height: u32) -> Result<Vec<u8>> {
    let width = width.max(1);
    let height = height.max(1);
    let mut canvas = RgbImage::new(width, height);
    for (x, y, pixel) in canvas.enumerate_pixels_mut() {
        let fx = x as f32 / width.max(2).saturating_sub(1) as f32;
        let fy = y as f32 / height.max(2).saturating_sub(1) as f32;
        let r = (255.0 * (1.0 - fx)).round() as u8;
        let g = (255.0 * fx).round() as u8;
        let b = (96.0 * fy).round() as u8;
        *pixel = Rgb([r, g, b]);
    }
    encode_png(&canvas)
}

fn build_caption(settings: &AppSettings, description: Option<&DescriptionResult>) -> String {
    let mut caption = format!("Here is the converted image! {}-friendly.", settings.coloring);
    if settings.alt_text_enabled {
        if let Some(description) = description {
            caption.push_str(&format!(
                "\n\nAlt Text: {} ({}% Confidence).",
                description.text, description.confidence_percent
            ));
        }
    }
    caption
}

struct RunContext {
    run_id: String,
    run_dir: PathBuf,
    channel: String,
    message_ts: String,
    settings: AppSettings,
    stages: Vec<RunStage>,
    attachment: Option<AttachmentRef>,
}

/// Drives one reaction event through the pipeline state machine:
/// `Received -> Validating -> Fetching -> {Describing, CorrectingColor} ->
/// Resizing -> Delivering -> Done`, with `Failed` reachable from every
/// non-terminal state. Each run reads one settings snapshot, works in its
/// own run directory, and produces exactly one terminal thread message
/// (the delivery-failure silent gap excepted).
pub struct PipelineEngine {
    work_dir: PathBuf,
    events: EventLog,
    settings: Arc<SettingsStore>,
    gateway: Arc<dyn ChatGateway>,
    captioners: CaptionProviderRegistry,
    captioner_name: String,
    trigger_reaction: String,
}

impl PipelineEngine {
    pub fn new(
        work_dir: impl Into<PathBuf>,
        events: EventLog,
        settings: Arc<SettingsStore>,
        gateway: Arc<dyn ChatGateway>,
    ) -> Result<Self> {
        let work_dir = work_dir.into();
        fs::create_dir_all(&work_dir)?;
        let captioners = default_caption_registry()?;
        let captioner_name = if captioners.get("azure").is_some() {
            "azure"
        } else {
            "dryrun"
        }
        .to_string();
        Ok(Self {
            work_dir,
            events,
            settings,
            gateway,
            captioners,
            captioner_name,
            trigger_reaction: DEFAULT_TRIGGER_REACTION.to_string(),
        })
    }

    pub fn with_trigger(mut self, reaction: &str) -> Self {
        self.trigger_reaction = reaction.trim().trim_matches(':').to_string();
        self
    }

    pub fn with_captioner(mut self, name: &str) -> Result<Self> {
        if self.captioners.get(name).is_none() {
            bail!(
                "caption provider '{name}' not available (have: {})",
                self.captioners.names().join(", ")
            );
        }
        self.captioner_name = name.to_string();
        Ok(self)
    }

    pub fn with_caption_provider<P: CaptionProvider + 'static>(mut self, provider: P) -> Self {
        self.captioner_name = provider.name().to_string();
        self.captioners.register(provider);
        self
    }

    pub fn trigger_reaction(&self) -> &str {
        &self.trigger_reaction
    }

    pub fn captioner_name(&self) -> &str {
        &self.captioner_name
    }

    pub fn settings(&self) -> Arc<SettingsStore> {
        Arc::clone(&self.settings)
    }

    pub fn events(&self) -> EventLog {
        self.events.clone()
    }

    /// Validated all-or-nothing settings update; both outcomes are logged.
    pub fn apply_settings(&self, update: &SettingsUpdate) -> Result<AppSettings, SettingsError> {
        match self.settings.apply(update) {
            Ok(applied) => {
                self.emit(
                    "settings_updated",
                    map_object(json!({
                        "coloring": applied.coloring.as_str(),
                        "alt_text": applied.alt_text_label(),
                        "resize_percent": applied.resize_percent,
                    })),
                );
                Ok(applied)
            }
            Err(error) => {
                self.emit(
                    "settings_rejected",
                    map_object(json!({ "reason": error.to_string() })),
                );
                Err(error)
            }
        }
    }

    /// Entry point for reaction events; returns `None` when the reaction is
    /// not the configured trigger.
    pub fn handle_reaction(
        &self,
        channel: &str,
        message_ts: &str,
        reaction: &str,
    ) -> Option<RunOutcome> {
        if reaction != self.trigger_reaction {
            return None;
        }
        Some(self.run(channel, message_ts))
    }

    fn run(&self, channel: &str, message_ts: &str) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let run_dir = self.work_dir.join("runs").join(&run_id);
        let settings = self.settings.snapshot();
        let started_at = now_utc_iso();

        let mut ctx = RunContext {
            run_id: run_id.clone(),
            run_dir,
            channel: channel.to_string(),
            message_ts: message_ts.to_string(),
            settings,
            stages: vec![RunStage::Received],
            attachment: None,
        };
        self.emit_run(
            &ctx.run_id,
            "run_started",
            map_object(json!({
                "channel": ctx.channel,
                "message_ts": ctx.message_ts,
                "coloring": ctx.settings.coloring.as_str(),
                "alt_text": ctx.settings.alt_text_label(),
                "resize_percent": ctx.settings.resize_percent,
            })),
        );

        let outcome = match self.execute(&mut ctx) {
            Ok(()) => RunOutcome::delivered(run_id.clone()),
            Err(error) => {
                ctx.stages.push(RunStage::Failed);
                self.emit_run(
                    &ctx.run_id,
                    "run_failed",
                    map_object(json!({
                        "kind": error.kind(),
                        "cause": error.cause().map(str::to_string),
                        "expected": error.is_expected(),
                    })),
                );
                if let Some(reply) = error.user_reply() {
                    match self
                        .gateway
                        .post_message(&ctx.channel, &ctx.message_ts, reply)
                    {
                        Ok(()) => self.emit_run(
                            &ctx.run_id,
                            "user_notified",
                            map_object(json!({ "kind": error.kind() })),
                        ),
                        Err(post_err) => self.emit_run(
                            &ctx.run_id,
                            "notice_failed",
                            map_object(json!({ "cause": format!("{post_err:#}") })),
                        ),
                    }
                }
                RunOutcome::failed(run_id.clone(), error)
            }
        };

        let summary = RunSummary {
            run_id: run_id.clone(),
            channel: ctx.channel.clone(),
            message_ts: ctx.message_ts.clone(),
            file_id: ctx.attachment.as_ref().map(|file| file.file_id.clone()),
            started_at,
            finished_at: now_utc_iso(),
            stages: ctx
                .stages
                .iter()
                .map(|stage| stage.as_str().to_string())
                .collect(),
            outcome: outcome.label().to_string(),
            delivered: outcome.delivered,
        };
        let mut extra = Map::new();
        if let Some(cause) = outcome.error.as_ref().and_then(StageError::cause) {
            extra.insert("cause".to_string(), Value::String(cause.to_string()));
        }
        if let Err(err) = write_summary(&ctx.run_dir.join("summary.json"), &summary, Some(&extra)) {
            self.emit_run(
                &ctx.run_id,
                "summary_write_failed",
                map_object(json!({ "cause": format!("{err:#}") })),
            );
        }
        self.emit_run(
            &ctx.run_id,
            "run_finished",
            map_object(json!({
                "outcome": outcome.label(),
                "delivered": outcome.delivered,
            })),
        );
        outcome
    }

    fn execute(&self, ctx: &mut RunContext) -> Result<(), StageError> {
        self.enter(ctx, RunStage::Validating);
        let message = self
            .gateway
            .fetch_message(&ctx.channel, &ctx.message_ts)
            .map_err(|err| StageError::Fetch {
                cause: format!("message lookup failed: {err:#}"),
            })?
            .ok_or_else(|| StageError::Fetch {
                cause: "message not found".to_string(),
            })?;
        let Some(file) = message.first_file().cloned() else {
            return Err(StageError::MissingAttachment);
        };
        if !file.is_accepted_raster() {
            return Err(StageError::InvalidAttachment {
                pretty_type: file.pretty_type,
            });
        }
        ctx.attachment = Some(AttachmentRef {
            channel: ctx.channel.clone(),
            message_ts: ctx.message_ts.clone(),
            file_id: file.id.clone(),
            pretty_type: file.pretty_type.clone(),
        });

        self.enter(ctx, RunStage::Fetching);
        let (bytes, public_url) = self.fetch_attachment(&file)?;
        self.emit_run(
            &ctx.run_id,
            "image_fetched",
            map_object(json!({ "bytes": bytes.len(), "url": public_url })),
        );
        // The processing notice is best effort; it never blocks the run.
        if let Err(err) = self
            .gateway
            .post_message(&ctx.channel, &ctx.message_ts, PROCESSING_REPLY)
        {
            self.emit_run(
                &ctx.run_id,
                "notice_failed",
                map_object(json!({ "cause": format!("{err:#}") })),
            );
        }

        let alt_text = ctx.settings.alt_text_enabled;
        if alt_text {
            self.enter(ctx, RunStage::Describing);
        } else {
            self.emit_run(&ctx.run_id, "description_skipped", Map::new());
        }
        self.enter(ctx, RunStage::CorrectingColor);

        let captioner = self.captioners.get(&self.captioner_name);
        let coloring = ctx.settings.coloring;
        let describe_url = public_url.as_str();
        let (corrected, described) = thread::scope(|scope| {
            let describe_handle = match (alt_text, captioner) {
                (true, Some(captioner)) => {
                    Some(scope.spawn(move || captioner.describe(describe_url)))
                }
                _ => None,
            };
            let corrected = decode_image(&bytes)
                .map(|decoded| correct_colors(&decoded, coloring))
                .map_err(|err| StageError::Correction {
                    cause: format!("{err:#}"),
                });
            let described = describe_handle.map(|handle| match handle.join() {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(err)) => Err(format!("{err:#}")),
                Err(_) => Err("caption provider panicked".to_string()),
            });
            (corrected, described)
        });
        let missing_captioner = alt_text && captioner.is_none();

        let corrected = corrected?;
        self.emit_run(
            &ctx.run_id,
            "color_corrected",
            map_object(json!({
                "mode": coloring.as_str(),
                "width": corrected.width(),
                "height": corrected.height(),
            })),
        );
        let description = match described {
            Some(Ok(result)) => {
                self.emit_run(
                    &ctx.run_id,
                    "description_ready",
                    map_object(json!({
                        "captioner": self.captioner_name,
                        "confidence_percent": result.confidence_percent,
                    })),
                );
                Some(result)
            }
            Some(Err(cause)) => {
                // Degrades the caption only; the run keeps going.
                let error = StageError::Description { cause };
                self.emit_run(
                    &ctx.run_id,
                    "description_failed",
                    map_object(json!({
                        "cause": error.cause().map(str::to_string),
                    })),
                );
                None
            }
            None => {
                if missing_captioner {
                    self.emit_run(
                        &ctx.run_id,
                        "description_failed",
                        map_object(json!({
                            "cause": format!(
                                "caption provider '{}' not registered",
                                self.captioner_name
                            ),
                        })),
                    );
                }
                None
            }
        };

        let final_image = if (ctx.settings.resize_percent - 100.0).abs() > f64::EPSILON {
            self.enter(ctx, RunStage::Resizing);
            let resized = resize_image(&corrected, ctx.settings.scale_factor()).map_err(|err| {
                StageError::Resize {
                    cause: format!("{err:#}"),
                }
            })?;
            self.emit_run(
                &ctx.run_id,
                "image_resized",
                map_object(json!({
                    "resize_percent": ctx.settings.resize_percent,
                    "width": resized.width(),
                    "height": resized.height(),
                })),
            );
            resized
        } else {
            self.emit_run(&ctx.run_id, "resize_skipped", Map::new());
            corrected
        };

        self.enter(ctx, RunStage::Delivering);
        let caption = build_caption(&ctx.settings, description.as_ref());
        let png = encode_png(&final_image).map_err(|err| StageError::Delivery {
            cause: format!("png encode failed: {err:#}"),
        })?;
        if let Err(err) = fs::create_dir_all(&ctx.run_dir)
            .and_then(|_| fs::write(ctx.run_dir.join(CONVERTED_FILE_NAME), &png))
        {
            self.emit_run(
                &ctx.run_id,
                "artifact_write_failed",
                map_object(json!({ "cause": format!("{err:#}") })),
            );
        }
        self.gateway
            .upload_image(
                &ctx.channel,
                &ctx.message_ts,
                &caption,
                CONVERTED_FILE_NAME,
                png,
            )
            .map_err(|err| StageError::Delivery {
                cause: format!("upload failed: {err:#}"),
            })?;
        self.emit_run(
            &ctx.run_id,
            "image_delivered",
            map_object(json!({ "caption": caption })),
        );
        self.enter(ctx, RunStage::Done);
        Ok(())
    }

    fn fetch_attachment(&self, file: &FileAttachment) -> Result<(Vec<u8>, String), StageError> {
        let shared =
            self.gateway
                .share_public_url(&file.id)
                .map_err(|err| StageError::Fetch {
                    cause: format!("public url resolution failed: {err:#}"),
                })?;
        let permalink = shared
            .permalink_public
            .clone()
            .or_else(|| file.permalink_public.clone())
            .ok_or_else(|| StageError::Fetch {
                cause: "no public permalink for attachment".to_string(),
            })?;
        let url_private = shared
            .url_private
            .clone()
            .or_else(|| file.url_private.clone());
        let download_url = public_download_url(&permalink, url_private.as_deref()).ok_or_else(
            || StageError::Fetch {
                cause: format!("no downloadable url derivable from {permalink}"),
            },
        )?;
        let bytes = self
            .gateway
            .download(&download_url)
            .map_err(|err| StageError::Fetch {
                cause: format!("image retrieval failed: {err:#}"),
            })?;
        Ok((bytes, download_url))
    }

    fn enter(&self, ctx: &mut RunContext, stage: RunStage) {
        ctx.stages.push(stage);
        self.emit_run(
            &ctx.run_id,
            "stage_entered",
            map_object(json!({ "stage": stage.as_str() })),
        );
    }

    fn emit(&self, event_type: &str, payload: Map<String, Value>) {
        let _ = self.events.emit(event_type, payload);
    }

    fn emit_run(&self, run_id: &str, event_type: &str, payload: Map<String, Value>) {
        let _ = self.events.emit_for_run(event_type, Some(run_id), payload);
    }
}

fn http_client() -> Result<HttpClient> {
    HttpClient::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
        .build()
        .context("failed to build http client")
}

fn response_json_or_error(label: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    if !status.is_success() {
        let code = status.as_u16();
        let body = response.text().unwrap_or_default();
        bail!("{label} failed ({code}): {}", truncate_text(&body, 512));
    }
    response
        .json::<Value>()
        .with_context(|| format!("{label} returned invalid JSON"))
}

fn slack_json_or_error(method: &str, response: HttpResponse) -> Result<Value> {
    let payload = response_json_or_error(method, response)?;
    if !payload.get("ok").and_then(Value::as_bool).unwrap_or(false) {
        let error = payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown_error");
        bail!("{method} failed: {error}");
    }
    Ok(payload)
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn non_empty_json_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_string)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
