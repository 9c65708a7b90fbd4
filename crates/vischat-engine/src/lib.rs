use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::{Cursor, ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::{json, Map, Value};
use vischat_contracts::conversation::{Conversation, Role, Turn, TurnId, TurnUpdate};
use vischat_contracts::events::EventWriter;
use vischat_contracts::models::{
    ModelRegistry, ModelSelector, ModelSpec, DEFAULT_OPENAI_API_BASE,
};
use vischat_contracts::transcript::Transcript;
use vischat_contracts::wire::{
    build_request_body, decode_chunk, wire_messages, LineFramer, StreamLine,
};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const ERROR_TEXT_MAX_CHARS: usize = 512;
pub const DEFAULT_ATTACHMENT_MAX_DIM: u32 = 1024;

#[derive(Debug, Clone)]
pub struct ProviderChatRequest {
    pub model: ModelSpec,
    pub body: Map<String, Value>,
}

pub type ProviderStream = Box<dyn Read + Send>;

/// Opens the streamed response body for one generation. Reading, framing and
/// decoding the body is the session's job.
pub trait ChatProvider: Send + Sync {
    fn name(&self) -> &str;
    fn open_stream(&self, request: &ProviderChatRequest) -> Result<ProviderStream>;
}

#[derive(Default)]
pub struct ChatProviderRegistry {
    providers: BTreeMap<String, Box<dyn ChatProvider>>,
}

impl ChatProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ChatProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ChatProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Offline provider: streams a canned reply echoing the last user message.
struct DryrunProvider;

impl ChatProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn open_stream(&self, request: &ProviderChatRequest) -> Result<ProviderStream> {
        let (text, has_image) = last_user_message(&request.body);
        let mut reply = if text.trim().is_empty() {
            "You sent an empty message.".to_string()
        } else {
            format!("You said: {}", text.trim())
        };
        if has_image {
            reply.push_str(" (with an image attached)");
        }

        let mut body = String::new();
        for word in reply.split_inclusive(' ') {
            let chunk = json!({"choices": [{"delta": {"content": word}}]});
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        Ok(Box::new(Cursor::new(body.into_bytes())))
    }
}

/// Any endpoint speaking the OpenAI chat-completions streaming format.
struct OpenAiChatProvider {
    http: HttpClient,
}

impl OpenAiChatProvider {
    fn new() -> Result<Self> {
        // Streams run until `[DONE]` or the connection closes.
        let http = HttpClient::builder()
            .timeout(None::<Duration>)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }

    fn api_key(model: &ModelSpec) -> Option<String> {
        model
            .configured_key()
            .map(str::to_string)
            .or_else(|| first_non_empty_env(&["OPENAI_API_KEY", "OPENAI_API_KEY_BACKUP"]))
    }
}

impl ChatProvider for OpenAiChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn open_stream(&self, request: &ProviderChatRequest) -> Result<ProviderStream> {
        let endpoint = request.model.url.as_str();
        let Some(api_key) = Self::api_key(&request.model) else {
            bail!(
                "no API key for model '{}' (set \"key\" in the model registry or OPENAI_API_KEY)",
                request.model.name
            );
        };
        let response = self
            .http
            .post(endpoint)
            .bearer_auth(api_key)
            .header(CONTENT_TYPE, "application/json")
            .json(&request.body)
            .send()
            .with_context(|| format!("chat request failed ({endpoint})"))?;
        let response = ensure_success(&request.model.name, response)?;
        Ok(Box::new(response))
    }
}

fn default_provider_registry() -> Result<ChatProviderRegistry> {
    let mut registry = ChatProviderRegistry::new();
    registry.register(DryrunProvider);
    registry.register(OpenAiChatProvider::new()?);
    Ok(registry)
}

/// Loads the model registry from `path`, `VISCHAT_MODELS`, or the built-in
/// defaults rooted at `OPENAI_API_BASE`.
pub fn load_model_registry(path: Option<&Path>) -> Result<ModelRegistry> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| first_non_empty_env(&["VISCHAT_MODELS"]).map(PathBuf::from));
    if let Some(path) = path {
        return ModelRegistry::load(&path);
    }
    Ok(ModelRegistry::with_api_base(&openai_api_base()))
}

/// Receives every change made to a turn while a reply streams in.
pub trait TurnObserver {
    fn turn_updated(&mut self, id: &TurnId, turn: &Turn);
}

impl<F> TurnObserver for F
where
    F: FnMut(&TurnId, &Turn),
{
    fn turn_updated(&mut self, id: &TurnId, turn: &Turn) {
        self(id, turn)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    /// Nothing to answer: empty prefix, or it does not end with a user turn.
    Skipped,
    Completed {
        target: TurnId,
        text: String,
        done_marker: bool,
    },
    Failed {
        target: TurnId,
        text: String,
        error: String,
    },
}

/// Owns one conversation, its cursor and everything a generation needs.
pub struct ChatSession {
    session_dir: PathBuf,
    events: EventWriter,
    conversation: Conversation,
    transcript: Transcript,
    model_selector: ModelSelector,
    model: ModelSpec,
    providers: ChatProviderRegistry,
    last_fallback_reason: Option<String>,
}

impl ChatSession {
    pub fn new(
        session_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        model: Option<String>,
        registry: ModelRegistry,
    ) -> Result<Self> {
        let session_dir = session_dir.into();
        fs::create_dir_all(&session_dir)
            .with_context(|| format!("failed to create {}", session_dir.display()))?;
        let transcript_path = session_dir.join("transcript.json");
        let transcript = if transcript_path.exists() {
            Transcript::load(&transcript_path)
        } else {
            Transcript::new(&transcript_path)
        };
        let conversation = transcript.conversation();
        let events = EventWriter::new(events_path.into(), transcript.session_id.clone());
        let model_selector = ModelSelector::new(Some(registry));
        let selection = model_selector
            .select(model.as_deref())
            .map_err(|err| anyhow!(err))?;

        events.emit(
            "session_started",
            map_object(json!({
                "out_dir": session_dir.to_string_lossy().to_string(),
                "turns": conversation.len(),
            })),
        )?;
        events.emit(
            "model_selected",
            map_object(json!({
                "model": selection.model.name,
                "provider": selection.model.provider,
                "requested": selection.requested,
                "fallback_reason": selection.fallback_reason,
            })),
        )?;

        Ok(Self {
            session_dir,
            events,
            conversation,
            transcript,
            model_selector,
            model: selection.model,
            providers: default_provider_registry()?,
            last_fallback_reason: selection.fallback_reason,
        })
    }

    pub fn register_provider<P: ChatProvider + 'static>(&mut self, provider: P) {
        self.providers.register(provider);
    }

    pub fn session_id(&self) -> &str {
        self.events.session_id()
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn model(&self) -> &ModelSpec {
        &self.model
    }

    pub fn models(&self) -> Vec<ModelSpec> {
        self.model_selector.registry.list().cloned().collect()
    }

    pub fn last_fallback_reason(&self) -> Option<&str> {
        self.last_fallback_reason.as_deref()
    }

    pub fn select_model(&mut self, requested: Option<&str>) -> Result<&ModelSpec> {
        let selection = self
            .model_selector
            .select(requested)
            .map_err(|err| anyhow!(err))?;
        self.events.emit(
            "model_selected",
            map_object(json!({
                "model": selection.model.name,
                "provider": selection.model.provider,
                "requested": selection.requested,
                "fallback_reason": selection.fallback_reason,
            })),
        )?;
        self.model = selection.model;
        self.last_fallback_reason = selection.fallback_reason;
        Ok(&self.model)
    }

    /// Replaces the text of the turn under the cursor.
    pub fn set_text(&mut self, text: &str) -> Result<TurnId> {
        let id = self
            .conversation
            .update_cursor_turn(TurnUpdate::Text(text.to_string()));
        self.save_transcript()?;
        Ok(id)
    }

    /// Attaches an image to the turn under the cursor.
    pub fn attach_image(&mut self, data_url: String) -> Result<TurnId> {
        let id = self.conversation.update_cursor_turn(TurnUpdate::Image(data_url));
        self.emit_image_attached(&id, "cursor")?;
        self.save_transcript()?;
        Ok(id)
    }

    /// Adds a new user turn holding only `data_url` and makes it the cursor.
    pub fn inject_image(&mut self, data_url: String) -> Result<TurnId> {
        let id = TurnId::random();
        self.conversation.set_cursor(id.clone());
        self.conversation
            .set_turn(&id, TurnUpdate::Image(data_url));
        self.emit_image_attached(&id, "injected")?;
        self.save_transcript()?;
        Ok(id)
    }

    pub fn begin_edit(&mut self, id: &TurnId) -> Option<String> {
        self.conversation.begin_edit(id)
    }

    pub fn delete_turn(&mut self, id: &TurnId) -> Result<bool> {
        let Some(removed) = self.conversation.delete_turn(id) else {
            return Ok(false);
        };
        self.events.emit(
            "turn_deleted",
            map_object(json!({
                "turn_id": id.as_str(),
                "role": removed.role.as_str(),
            })),
        )?;
        self.save_transcript()?;
        Ok(true)
    }

    pub fn set_system_prompt(&mut self, text: &str) -> Result<Option<TurnId>> {
        let id = self.conversation.set_system_prompt(text);
        self.save_transcript()?;
        Ok(id)
    }

    /// Sets the cursor turn's text and asks for a reply.
    pub fn send(&mut self, text: &str, observer: &mut dyn TurnObserver) -> Result<GenerationOutcome> {
        self.set_text(text)?;
        self.generate(None, false, observer)
    }

    pub fn regenerate(
        &mut self,
        id: &TurnId,
        observer: &mut dyn TurnObserver,
    ) -> Result<GenerationOutcome> {
        let Some(plan) = self.conversation.plan_regenerate(id) else {
            self.events.emit(
                "generation_skipped",
                map_object(json!({
                    "reason": "not_regenerable",
                    "turn_id": id.as_str(),
                })),
            )?;
            return Ok(GenerationOutcome::Skipped);
        };
        self.generate(Some(plan.target), plan.force, observer)
    }

    /// Streams a reply to the prefix ending at the cursor into `target`, or
    /// into a fresh turn appended at the end.
    pub fn generate(
        &mut self,
        target: Option<TurnId>,
        force: bool,
        observer: &mut dyn TurnObserver,
    ) -> Result<GenerationOutcome> {
        let prefix = self.conversation.prefix_up_to(self.conversation.cursor());
        let prefix_len = prefix.len();
        let user_terminated = prefix
            .last()
            .map(|(_, turn)| turn.role == Role::User)
            .unwrap_or(false);
        if prefix.is_empty() || (!force && !user_terminated) {
            let reason = if prefix.is_empty() {
                "empty_prefix"
            } else {
                "not_user_terminated"
            };
            self.conversation.pick_cursor();
            self.events.emit(
                "generation_skipped",
                map_object(json!({
                    "reason": reason,
                    "prefix_len": prefix_len,
                })),
            )?;
            self.save_transcript()?;
            return Ok(GenerationOutcome::Skipped);
        }

        let messages = wire_messages(prefix);
        let body = build_request_body(&messages, &self.model.config)?;
        // Replies only ever overwrite assistant turns.
        let target = target
            .filter(|id| {
                self.conversation
                    .get(id)
                    .map(|turn| turn.role == Role::Assistant)
                    .unwrap_or(true)
            })
            .unwrap_or_else(TurnId::random);
        let request = ProviderChatRequest {
            model: self.model.clone(),
            body,
        };
        self.events.emit(
            "generation_started",
            map_object(json!({
                "target": target.as_str(),
                "model": self.model.name,
                "provider": self.model.provider,
                "messages": messages.len(),
                "force": force,
            })),
        )?;

        let mut text = String::new();
        let streamed = stream_reply(
            &self.providers,
            &mut self.conversation,
            &request,
            &target,
            &mut text,
            observer,
        );

        let outcome = match streamed {
            Ok(done_marker) => {
                if text.is_empty() {
                    // Keep the returned target backed by a turn.
                    self.conversation.upsert_reply(&target, "");
                    if let Some(turn) = self.conversation.get(&target) {
                        observer.turn_updated(&target, turn);
                    }
                }
                self.conversation.pick_cursor();
                self.events.emit(
                    "generation_finished",
                    map_object(json!({
                        "target": target.as_str(),
                        "chars": text.chars().count(),
                        "done_marker": done_marker,
                    })),
                )?;
                GenerationOutcome::Completed {
                    target,
                    text,
                    done_marker,
                }
            }
            Err(err) => {
                let error = error_chain_text(&err, ERROR_TEXT_MAX_CHARS);
                let target = self.conversation.mark_failed(&target, &text, error.clone());
                if let Some(turn) = self.conversation.get(&target) {
                    observer.turn_updated(&target, turn);
                }
                self.conversation.pick_cursor();
                self.events.emit(
                    "generation_failed",
                    map_object(json!({
                        "target": target.as_str(),
                        "chars": text.chars().count(),
                        "error": error,
                    })),
                )?;
                GenerationOutcome::Failed {
                    target,
                    text,
                    error,
                }
            }
        };
        self.save_transcript()?;
        Ok(outcome)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.save_transcript()?;
        self.events.emit(
            "session_finished",
            map_object(json!({
                "turns": self.conversation.len(),
                "transcript": self.transcript.path.to_string_lossy().to_string(),
            })),
        )?;
        Ok(())
    }

    fn save_transcript(&mut self) -> Result<()> {
        self.transcript.record(&self.conversation);
        self.transcript.save()
    }

    fn emit_image_attached(&self, id: &TurnId, source: &str) -> Result<()> {
        let bytes = self
            .conversation
            .get(id)
            .and_then(Turn::image)
            .map(str::len)
            .unwrap_or(0);
        self.events.emit(
            "image_attached",
            map_object(json!({
                "turn_id": id.as_str(),
                "source": source,
                "data_url_len": bytes,
            })),
        )?;
        Ok(())
    }
}

/// Reads the provider stream into `target`. Returns whether `[DONE]` was seen.
fn stream_reply(
    providers: &ChatProviderRegistry,
    conversation: &mut Conversation,
    request: &ProviderChatRequest,
    target: &TurnId,
    text: &mut String,
    observer: &mut dyn TurnObserver,
) -> Result<bool> {
    let provider = providers
        .get(&request.model.provider)
        .with_context(|| format!("no chat provider named '{}'", request.model.provider))?;
    let mut reader = provider.open_stream(request)?;
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err).context("response stream read failed"),
        };
        for line in framer.push(&buf[..read]) {
            if apply_stream_line(conversation, target, text, line, observer)? {
                return Ok(true);
            }
        }
    }
    if let Some(line) = framer.finish() {
        return apply_stream_line(conversation, target, text, line, observer);
    }
    Ok(false)
}

fn apply_stream_line(
    conversation: &mut Conversation,
    target: &TurnId,
    text: &mut String,
    line: StreamLine,
    observer: &mut dyn TurnObserver,
) -> Result<bool> {
    let payload = match line {
        StreamLine::Done => return Ok(true),
        StreamLine::Payload(payload) => payload,
    };
    let content = decode_chunk(&payload)?;
    let Some(delta) = content.text() else {
        return Ok(false);
    };
    text.push_str(delta);
    conversation.upsert_reply(target, text);
    if let Some(turn) = conversation.get(target) {
        observer.turn_updated(target, turn);
    }
    conversation.pick_cursor();
    Ok(false)
}

/// Reads an image and returns it as a `data:` URL, downscaled to fit within
/// `max_dim` and re-encoded as JPEG. Files the decoder cannot read are passed
/// through with a mime type guessed from the extension.
pub fn image_data_url_from_path(path: &Path, max_dim: u32) -> Result<String> {
    let (bytes, mime) = prepare_attachment_image(path, max_dim)?;
    let encoded = BASE64.encode(bytes);
    Ok(format!("data:{mime};base64,{encoded}"))
}

fn prepare_attachment_image(path: &Path, max_dim: u32) -> Result<(Vec<u8>, String)> {
    let dim = max_dim.max(128);
    if let Ok(image) = image::open(path) {
        let rgba = image.to_rgba8();
        let mut flattened = RgbaImage::new(rgba.width(), rgba.height());
        for (x, y, pixel) in rgba.enumerate_pixels() {
            let alpha = u16::from(pixel[3]);
            let blend = |channel: u8| -> u8 {
                (((u16::from(channel) * alpha) + (255 * (255 - alpha))) / 255) as u8
            };
            flattened.put_pixel(
                x,
                y,
                Rgba([blend(pixel[0]), blend(pixel[1]), blend(pixel[2]), 255]),
            );
        }
        let mut flattened = DynamicImage::ImageRgba8(flattened);
        if flattened.width() > dim || flattened.height() > dim {
            flattened = flattened.resize(dim, dim, FilterType::Triangle);
        }
        let mut bytes = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut bytes, 90);
        if encoder.encode_image(&flattened.to_rgb8()).is_ok() {
            return Ok((bytes, "image/jpeg".to_string()));
        }
    }

    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok((bytes, guess_image_mime(path).to_string()))
}

fn guess_image_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|value| value.to_str())
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "heic" | "heif" => "image/heic",
        _ => "image/png",
    }
}

fn last_user_message(body: &Map<String, Value>) -> (String, bool) {
    let last = body
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| {
            messages
                .iter()
                .rev()
                .find(|message| message.get("role").and_then(Value::as_str) == Some("user"))
        });
    let Some(content) = last.and_then(|message| message.get("content")) else {
        return (String::new(), false);
    };
    if let Some(text) = content.as_str() {
        return (text.to_string(), false);
    }
    let parts = content.as_array().cloned().unwrap_or_default();
    let text = parts
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<&str>>()
        .join(" ");
    let has_image = parts
        .iter()
        .any(|part| part.get("type").and_then(Value::as_str) == Some("image_url"));
    (text, has_image)
}

fn ensure_success(model: &str, response: HttpResponse) -> Result<HttpResponse> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{model} error body read failed ({code})"))?;
    bail!(
        "{model} request failed ({code}): {}",
        truncate_text(body.trim(), ERROR_TEXT_MAX_CHARS)
    );
}

fn openai_api_base() -> String {
    first_non_empty_env(&["OPENAI_API_BASE", "OPENAI_BASE_URL"])
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string())
}

fn first_non_empty_env(keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Ok(value) = env::var(key) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
