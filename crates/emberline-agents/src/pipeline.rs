use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;
use emberline_common::message::{EntryRole, InboundMessage};
use emberline_config::{AppConfig, LimitKind, ModelRegistry};
use emberline_db::{ChatStore, GuildSettingsRow};
use emberline_security::directive::{DirectiveAttempt, GuardVerdict, evaluate_directive};
use emberline_security::postprocess::{
    TRANSPORT_LIMIT, chunk_message, detect_runaway_repetition, is_mass_mention, sanitize_response,
    truncate_sentences,
};
use emberline_security::spam::{SpamDetector, SpamVerdict};
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::backend::BackendClient;
use crate::composer::{ComposeInput, PromptComposer, condition_input};
use crate::prompts;
use crate::quota::{QuotaDecision, QuotaLedger, QuotaStatus};
use crate::thinking::{StreamSegment, ThinkingSplitter};
use crate::websearch::WebSearcher;

/// Regenerations allowed per original message.
pub const MAX_REGENERATES: u8 = 3;
/// Characters reserved up-front when checking a character-limited model; the
/// real response length is what actually gets consumed.
const CHARACTER_PRECHECK: u64 = 500;
/// Sentences kept when a runaway response gets truncated.
const RUNAWAY_KEEP_SENTENCES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("unknown model: {0}")]
    ModelNotFound(String),

    #[error("{0} is not a chat model")]
    NotAChatModel(String),

    #[error("{reason}")]
    QuotaExceeded { reason: String },

    #[error("backend unavailable, try again shortly")]
    BackendUnavailable,

    #[error("response blocked by safety filter")]
    SafetyBlocked,

    #[error("regenerate limit reached for this message")]
    RegenerateLimit,

    #[error(transparent)]
    Store(#[from] emberline_common::Error),
}

#[derive(Debug, Clone)]
pub enum ChatOutcome {
    /// A generated response, chunked to the transport limit.
    Reply {
        chunks: Vec<String>,
        /// The repetition guard truncated this response and skipped
        /// persisting the turn.
        repetition_truncated: bool,
        /// Human-readable note when a requested web search found nothing or
        /// failed.
        search_note: Option<String>,
    },
    /// Dropped without a response (spam streak, blacklist, disabled guild).
    Suppressed,
    /// Canned informational reply with no model call behind it.
    Notice(String),
}

/// Events surfaced to hosts that subscribe to the audit stream.
#[derive(Debug, Clone)]
pub enum AuditEvent {
    Directive(DirectiveAttempt),
}

/// The conversation orchestrator: guard, spam, quota, compose, dispatch,
/// post-process, persist — with per-user mutual exclusion around the whole
/// path so two near-simultaneous messages cannot both pass a quota check
/// before either consumes it.
pub struct ChatPipeline {
    registry: Arc<ModelRegistry>,
    store: Arc<Mutex<ChatStore>>,
    backend: BackendClient,
    searcher: Option<WebSearcher>,
    ledger: QuotaLedger,
    composer: PromptComposer,
    spam: Mutex<SpamDetector>,
    user_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    regen_counts: DashMap<String, u8>,
    maintenance: RwLock<Option<String>>,
    audit_tx: broadcast::Sender<AuditEvent>,
    default_model: Option<String>,
}

impl ChatPipeline {
    pub fn new(config: &AppConfig, registry: ModelRegistry, store: ChatStore) -> Self {
        let registry = Arc::new(registry);
        let store = Arc::new(Mutex::new(store));
        let (audit_tx, _) = broadcast::channel(64);

        Self {
            backend: BackendClient::new(config.backend.base_url.clone()),
            searcher: config
                .search
                .enabled
                .then(|| WebSearcher::new(config.search.clone())),
            ledger: QuotaLedger::new(
                store.clone(),
                registry.clone(),
                config.owner_user_id.clone(),
            ),
            composer: PromptComposer::new(),
            spam: Mutex::new(SpamDetector::new()),
            user_locks: DashMap::new(),
            regen_counts: DashMap::new(),
            maintenance: RwLock::new(None),
            audit_tx,
            default_model: config.default_model.clone(),
            registry,
            store,
        }
    }

    /// Subscribe to guard audit events (directive attempts).
    pub fn subscribe_audit(&self) -> broadcast::Receiver<AuditEvent> {
        self.audit_tx.subscribe()
    }

    fn emit_audit(&self, event: AuditEvent) {
        // No subscribers is fine; tracing already has the record.
        let _ = self.audit_tx.send(event);
    }

    pub async fn chat(&self, message: &InboundMessage) -> Result<ChatOutcome, ChatError> {
        self.run_chat(message, None, false).await
    }

    /// Like [`chat`], forwarding thinking-segment deltas to `thinking_tx`
    /// for transient progress display. Thinking text is never persisted.
    ///
    /// [`chat`]: ChatPipeline::chat
    pub async fn chat_with_progress(
        &self,
        message: &InboundMessage,
        thinking_tx: mpsc::UnboundedSender<String>,
    ) -> Result<ChatOutcome, ChatError> {
        self.run_chat(message, Some(thinking_tx), false).await
    }

    /// Re-run generation for a message, at most [`MAX_REGENERATES`] times.
    /// The previous turn pair is dropped first so the fresh response does
    /// not parrot the discarded one.
    pub async fn regenerate(&self, message: &InboundMessage) -> Result<ChatOutcome, ChatError> {
        {
            let mut count = self
                .regen_counts
                .entry(message.message_id.clone())
                .or_insert(0);
            if *count >= MAX_REGENERATES {
                return Err(ChatError::RegenerateLimit);
            }
            *count += 1;
        }

        let model_id = self.resolve_model_id(message)?;
        {
            let store = self.store.lock().expect("store lock poisoned");
            store.remove_last_turn(&message.guild_id, &message.author_id, &model_id)?;
        }

        // Skip the spam detector: the identical text is the point here.
        self.run_chat(message, None, true).await
    }

    async fn run_chat(
        &self,
        message: &InboundMessage,
        thinking_tx: Option<mpsc::UnboundedSender<String>>,
        skip_spam: bool,
    ) -> Result<ChatOutcome, ChatError> {
        if let Some(note) = self.maintenance.read().expect("lock poisoned").clone() {
            return Ok(ChatOutcome::Notice(note));
        }

        // Serialize the whole guard→quota→dispatch→persist path per user.
        let lock = self
            .user_locks
            .entry(message.author_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _user_guard = lock.lock().await;

        let model_id = {
            let store = self.store.lock().expect("store lock poisoned");
            if store.is_blacklisted(&message.author_id)? {
                return Ok(ChatOutcome::Suppressed);
            }
            let settings = store.guild_settings(&message.guild_id)?;
            if let Some(settings) = &settings
                && !settings.enabled
            {
                return Ok(ChatOutcome::Suppressed);
            }
            self.resolve_with_settings(&store, message, settings)?
        };

        let descriptor = self
            .registry
            .get(&model_id)
            .ok_or_else(|| ChatError::ModelNotFound(model_id.clone()))?
            .clone();

        if descriptor.vision_only {
            return Ok(ChatOutcome::Notice(format!(
                "{} only describes images - pick a chat model",
                descriptor.display_name
            )));
        }

        let content = condition_input(&message.text);

        let mut directive_rejected = false;
        match evaluate_directive(&message.author_id, message.is_privileged_sender, &content) {
            GuardVerdict::Clean => {}
            GuardVerdict::Accepted(attempt) => {
                self.emit_audit(AuditEvent::Directive(attempt));
            }
            GuardVerdict::Rejected(attempt) => {
                directive_rejected = true;
                self.emit_audit(AuditEvent::Directive(attempt));
            }
        }

        let mut repeat_flag = false;
        if !skip_spam {
            let verdict = self
                .spam
                .lock()
                .expect("lock poisoned")
                .check(&message.author_id, &content);
            match verdict {
                SpamVerdict::Clean => {}
                SpamVerdict::Flag { .. } => repeat_flag = true,
                SpamVerdict::Suppress { streak } => {
                    info!(user = %message.author_id, streak, "suppressing repeated message");
                    return Ok(ChatOutcome::Suppressed);
                }
            }
        }

        let image_description = self.describe_attachment(message, &descriptor).await?;

        // Deny before anything is spent or dispatched.
        if let QuotaDecision::Denied { reason } =
            self.ledger
                .check(&message.author_id, &descriptor.id, CHARACTER_PRECHECK)?
        {
            return Err(ChatError::QuotaExceeded { reason });
        }

        let history = {
            let store = self.store.lock().expect("store lock poisoned");
            store.load_conversation(&message.guild_id, &message.author_id, &descriptor.id)?
        };

        let mut messages = self.composer.compose(&ComposeInput {
            message,
            descriptor: &descriptor,
            content: &content,
            history: &history,
            image_description: image_description.as_deref(),
            directive_rejected,
            repeat_flag,
        });

        let mut search_note = None;
        if descriptor.has_web_search
            && let Some(searcher) = &self.searcher
            && let Some(query) = WebSearcher::extract_query(&content)
        {
            match searcher.augment(&query).await {
                Ok(Some(block)) => {
                    if let Some(last) = messages.last_mut() {
                        last.content.push_str(&block);
                    }
                }
                Ok(None) => {
                    search_note = Some(format!("no web results found for \"{query}\""));
                }
                Err(e) => {
                    warn!("web search failed: {e}");
                    search_note = Some(format!("web search failed for \"{query}\""));
                }
            }
        }

        let raw = if descriptor.shows_thinking {
            self.dispatch_streaming(&descriptor, &messages, thinking_tx)
                .await
        } else {
            self.backend.complete(&descriptor, &messages).await
        }
        .map_err(|e| {
            warn!(model = %descriptor.id, "backend call failed: {e}");
            ChatError::BackendUnavailable
        })?;

        let response = sanitize_response(&raw);
        if response.is_empty() {
            return Err(ChatError::BackendUnavailable);
        }

        if is_mass_mention(&response) {
            warn!(model = %descriptor.id, "response blocked: mass mention");
            return Err(ChatError::SafetyBlocked);
        }

        if detect_runaway_repetition(&response) {
            // A looping response must not poison future context.
            let truncated = truncate_sentences(&response, RUNAWAY_KEEP_SENTENCES);
            return Ok(ChatOutcome::Reply {
                chunks: chunk_message(&truncated, TRANSPORT_LIMIT),
                repetition_truncated: true,
                search_note,
            });
        }

        let stored_user = if image_description.is_some() {
            format!("[sent an image]\n{content}")
        } else {
            content.clone()
        };
        {
            let store = self.store.lock().expect("store lock poisoned");
            store.append_entry(
                &message.guild_id,
                &message.author_id,
                &descriptor.id,
                EntryRole::User,
                &stored_user,
                message.author_name.as_deref(),
            )?;
            store.append_entry(
                &message.guild_id,
                &message.author_id,
                &descriptor.id,
                EntryRole::Assistant,
                &response,
                None,
            )?;
        }

        if descriptor.limit_kind == LimitKind::Characters {
            self.ledger.consume(
                &message.author_id,
                &descriptor.id,
                response.chars().count() as u64,
            )?;
        }

        Ok(ChatOutcome::Reply {
            chunks: chunk_message(&response, TRANSPORT_LIMIT),
            repetition_truncated: false,
            search_note,
        })
    }

    async fn dispatch_streaming(
        &self,
        descriptor: &emberline_config::ModelDescriptor,
        messages: &[crate::backend::WireMessage],
        thinking_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> emberline_common::Result<String> {
        let mut stream = self.backend.stream_chat(descriptor, messages).await?;
        let mut splitter = ThinkingSplitter::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for segment in splitter.push(&chunk.content) {
                if let StreamSegment::Thinking(delta) = segment
                    && let Some(tx) = &thinking_tx
                {
                    let _ = tx.send(delta);
                }
            }
            if chunk.done {
                break;
            }
        }

        Ok(splitter.finish().answer)
    }

    /// Describe the first image attachment via the vision model, consuming
    /// one item of its quota. Degrades to no description on denial or
    /// failure; a bad image never sinks the whole request.
    async fn describe_attachment(
        &self,
        message: &InboundMessage,
        descriptor: &emberline_config::ModelDescriptor,
    ) -> Result<Option<String>, ChatError> {
        if !descriptor.supports_images {
            return Ok(None);
        }
        let Some(attachment) = message.attachments.iter().find(|a| a.is_image()) else {
            return Ok(None);
        };
        let Some(vision) = self.registry.vision_model() else {
            return Ok(None);
        };

        if let QuotaDecision::Denied { reason } =
            self.ledger.check(&message.author_id, &vision.id, 1)?
        {
            warn!(user = %message.author_id, "skipping image description: {reason}");
            return Ok(None);
        }

        match self
            .backend
            .describe_image(vision, prompts::full_prompt(&vision.id), &attachment.url)
            .await
        {
            Ok(description) if !description.trim().is_empty() => {
                self.ledger.consume(&message.author_id, &vision.id, 1)?;
                Ok(Some(description))
            }
            Ok(_) => Ok(None),
            Err(e) => {
                warn!("image description failed: {e}");
                Ok(None)
            }
        }
    }

    // ---- model resolution --------------------------------------------------

    fn resolve_model_id(&self, message: &InboundMessage) -> Result<String, ChatError> {
        let store = self.store.lock().expect("store lock poisoned");
        let settings = store.guild_settings(&message.guild_id)?;
        self.resolve_with_settings(&store, message, settings)
    }

    fn resolve_with_settings(
        &self,
        store: &ChatStore,
        message: &InboundMessage,
        settings: Option<GuildSettingsRow>,
    ) -> Result<String, ChatError> {
        let fallback = || {
            self.default_model
                .clone()
                .unwrap_or_else(|| self.registry.default_model().to_string())
        };
        let resolved = match settings {
            Some(settings) if settings.model_locked => settings.model,
            Some(settings) => store.user_model(&message.author_id)?.unwrap_or(settings.model),
            None => store.user_model(&message.author_id)?.unwrap_or_else(fallback),
        };
        Ok(resolved)
    }

    // ---- administrative operations (no model calls) ------------------------

    /// The model the user would chat with right now, honoring a guild lock.
    pub fn user_model(&self, message: &InboundMessage) -> Result<String, ChatError> {
        self.resolve_model_id(message)
    }

    pub fn set_user_model(&self, user_id: &str, model_id: &str) -> Result<(), ChatError> {
        let descriptor = self
            .registry
            .get(model_id)
            .ok_or_else(|| ChatError::ModelNotFound(model_id.to_string()))?;
        if descriptor.vision_only {
            return Err(ChatError::NotAChatModel(model_id.to_string()));
        }
        let store = self.store.lock().expect("store lock poisoned");
        store.set_user_model(user_id, model_id)?;
        Ok(())
    }

    /// Clear stored turns plus the in-memory state keyed to them (cadence
    /// counter, spam streak).
    pub fn clear_conversation(
        &self,
        guild_id: &str,
        user_id: &str,
        model_id: Option<&str>,
    ) -> Result<(), ChatError> {
        {
            let store = self.store.lock().expect("store lock poisoned");
            store.clear_conversation(guild_id, user_id, model_id)?;
        }
        self.composer.clear_cadence(user_id);
        self.spam.lock().expect("lock poisoned").reset(user_id);
        Ok(())
    }

    pub fn quota_status(&self, user_id: &str) -> Result<QuotaStatus, ChatError> {
        Ok(self.ledger.status(user_id)?)
    }

    /// Stored conversation log for a user and model, oldest first.
    pub fn conversation(
        &self,
        guild_id: &str,
        user_id: &str,
        model_id: &str,
    ) -> Result<Vec<emberline_db::StoredEntry>, ChatError> {
        let store = self.store.lock().expect("store lock poisoned");
        Ok(store.load_conversation(guild_id, user_id, model_id)?)
    }

    pub fn set_limit(&self, model_id: &str, daily_limit: u64) -> Result<(), ChatError> {
        if self.registry.get(model_id).is_none() {
            return Err(ChatError::ModelNotFound(model_id.to_string()));
        }
        let store = self.store.lock().expect("store lock poisoned");
        store.set_limit_override(model_id, daily_limit)?;
        Ok(())
    }

    pub fn set_bypass(&self, user_id: &str, added_by: &str) -> Result<(), ChatError> {
        let store = self.store.lock().expect("store lock poisoned");
        store.add_bypass(user_id, added_by)?;
        Ok(())
    }

    pub fn remove_bypass(&self, user_id: &str) -> Result<bool, ChatError> {
        let store = self.store.lock().expect("store lock poisoned");
        Ok(store.remove_bypass(user_id)?)
    }

    pub fn set_blacklisted(
        &self,
        user_id: &str,
        blacklisted: bool,
        reason: &str,
        added_by: &str,
    ) -> Result<(), ChatError> {
        let store = self.store.lock().expect("store lock poisoned");
        if blacklisted {
            store.add_blacklist(user_id, reason, added_by)?;
        } else {
            store.remove_blacklist(user_id)?;
        }
        Ok(())
    }

    pub fn set_guild_enabled(&self, guild_id: &str, enabled: bool) -> Result<(), ChatError> {
        self.update_guild_settings(guild_id, |settings| settings.enabled = enabled)
    }

    pub fn set_guild_model(&self, guild_id: &str, model_id: &str) -> Result<(), ChatError> {
        let descriptor = self
            .registry
            .get(model_id)
            .ok_or_else(|| ChatError::ModelNotFound(model_id.to_string()))?;
        if descriptor.vision_only {
            return Err(ChatError::NotAChatModel(model_id.to_string()));
        }
        let model_id = model_id.to_string();
        self.update_guild_settings(guild_id, move |settings| settings.model = model_id)
    }

    pub fn set_guild_model_lock(&self, guild_id: &str, locked: bool) -> Result<(), ChatError> {
        self.update_guild_settings(guild_id, |settings| settings.model_locked = locked)
    }

    /// Toggle maintenance mode. While set, every chat call returns the note
    /// as a [`ChatOutcome::Notice`] without touching the backend.
    pub fn set_maintenance(&self, note: Option<String>) {
        *self.maintenance.write().expect("lock poisoned") = note;
    }

    fn update_guild_settings(
        &self,
        guild_id: &str,
        apply: impl FnOnce(&mut GuildSettingsRow),
    ) -> Result<(), ChatError> {
        let store = self.store.lock().expect("store lock poisoned");
        let mut settings = store.guild_settings(guild_id)?.unwrap_or_else(|| {
            GuildSettingsRow {
                guild_id: guild_id.to_string(),
                enabled: true,
                model: self
                    .default_model
                    .clone()
                    .unwrap_or_else(|| self.registry.default_model().to_string()),
                model_locked: false,
            }
        });
        apply(&mut settings);
        store.upsert_guild_settings(&settings)?;
        Ok(())
    }
}
