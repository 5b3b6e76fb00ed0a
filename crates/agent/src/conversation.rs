use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use setter_core::config::ConversationConfig;
use setter_core::domain::call::CallAttemptId;
use setter_core::domain::lead::Lead;
use setter_core::domain::qualification::QualificationResult;
use setter_core::domain::transcript::{Intent, Speaker, Transcript, Turn};
use tracing::{debug, info, warn};

use crate::guardrails::{GuardrailDecision, GuardrailPolicy};
use crate::llm::LlmClient;
use crate::prompts::{FixedLine, Persona, PromptError, PromptRenderer, Stage, FALLBACK_UTTERANCE};
use crate::rubric::{RubricExtractor, RubricScore};
use crate::speech::SpeechTranscriber;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversationSettings {
    /// Lead turns before the agent wraps up.
    pub max_turns: u32,
    pub max_duration: Duration,
    pub turn_timeout: std::time::Duration,
    pub qualification_threshold: i32,
    /// Exchanges included in each model prompt.
    pub history_window: usize,
    pub persona: Persona,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_turns: 20,
            max_duration: Duration::seconds(300),
            turn_timeout: std::time::Duration::from_secs(8),
            qualification_threshold: 2,
            history_window: 6,
            persona: Persona::default(),
        }
    }
}

impl ConversationSettings {
    pub fn from_config(config: &ConversationConfig) -> Self {
        Self {
            max_turns: config.max_turns,
            max_duration: i64::try_from(config.max_call_duration_secs)
                .ok()
                .and_then(Duration::try_seconds)
                .unwrap_or(Duration::MAX),
            turn_timeout: std::time::Duration::from_secs(config.turn_timeout_secs),
            qualification_threshold: config.qualification_threshold,
            history_window: config.history_window,
            persona: Persona {
                agent_name: config.agent_name.clone(),
                company_name: config.company_name.clone(),
                contact_name: config.contact_name.clone(),
            },
        }
    }
}

/// What the caller said, as delivered by the telephony provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeadInput {
    Text(String),
    Audio(Vec<u8>),
    Silence,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnAction {
    Listen,
    HangUp,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentResponse {
    pub text: String,
    pub action: TurnAction,
}

impl AgentResponse {
    fn listen(text: String) -> Self {
        Self { text, action: TurnAction::Listen }
    }

    fn hang_up(text: String) -> Self {
        Self { text, action: TurnAction::HangUp }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndReason {
    LeadAgreed,
    LeadDeclined,
    MaxTurns,
    MaxDuration,
    /// Two anomalies in a row.
    Anomalies,
    LeadHungUp,
    Cancelled(String),
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadAgreed => "lead_agreed",
            Self::LeadDeclined => "lead_declined",
            Self::MaxTurns => "max_turns",
            Self::MaxDuration => "max_duration",
            Self::Anomalies => "repeated_anomalies",
            Self::LeadHungUp => "lead_hung_up",
            Self::Cancelled(_) => "cancelled",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Anomaly {
    EmptyInput,
    Transcription(String),
    ModelTimeout,
    Model(String),
    Guardrail(&'static str),
    Prompt(String),
}

impl Anomaly {
    fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyInput => "empty_input",
            Self::Transcription(_) => "transcription_failed",
            Self::ModelTimeout => "model_timeout",
            Self::Model(_) => "model_error",
            Self::Guardrail(_) => "reply_rejected",
            Self::Prompt(_) => "prompt_render_failed",
        }
    }
}

impl From<PromptError> for Anomaly {
    fn from(error: PromptError) -> Self {
        Self::Prompt(error.to_string())
    }
}

/// Per-call conversation state, owned by the session task.
#[derive(Clone, Debug)]
pub struct ConversationHandle {
    attempt_id: CallAttemptId,
    lead_name: String,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    transcript: Transcript,
    score: RubricScore,
    lead_turns: u32,
    consecutive_anomalies: u8,
    ended: Option<EndReason>,
}

impl ConversationHandle {
    pub fn attempt_id(&self) -> &CallAttemptId {
        &self.attempt_id
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_finished(&self) -> bool {
        self.ended.is_some()
    }

    pub fn end_reason(&self) -> Option<&EndReason> {
        self.ended.as_ref()
    }

    /// Turns are appended in order even if the caller's clock stutters.
    fn stamp(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.transcript.turns().last().map_or(now, |turn| turn.at.max(now))
    }

    fn push(&mut self, speaker: Speaker, text: String, intents: Vec<Intent>, now: DateTime<Utc>) {
        let turn = Turn { speaker, text, at: self.stamp(now), intents };
        if let Err(error) = self.transcript.append(turn) {
            warn!(
                event_name = "conversation.turn_dropped",
                attempt_id = %self.attempt_id,
                error = %error,
                "transcript rejected turn"
            );
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizedConversation {
    pub transcript: Transcript,
    pub result: QualificationResult,
    pub reason: EndReason,
}

/// Turn-based qualification conversation.
///
/// The model only phrases the agent's lines. Whether the lead qualifies is
/// decided by the keyword rubric, and every way a conversation can end
/// (agreement, decline, turn or time limit, hangup, cancel, repeated
/// anomalies) still produces a result through [`ConversationEngine::finalize`].
pub struct ConversationEngine {
    llm: Arc<dyn LlmClient>,
    speech: Option<Arc<dyn SpeechTranscriber>>,
    prompts: PromptRenderer,
    rubric: RubricExtractor,
    guardrails: GuardrailPolicy,
    settings: ConversationSettings,
}

impl ConversationEngine {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        settings: ConversationSettings,
    ) -> Result<Self, PromptError> {
        let prompts = PromptRenderer::new(settings.persona.clone(), settings.history_window)?;
        Ok(Self {
            llm,
            speech: None,
            prompts,
            rubric: RubricExtractor::new(),
            guardrails: GuardrailPolicy::default(),
            settings,
        })
    }

    pub fn with_speech(mut self, speech: Arc<dyn SpeechTranscriber>) -> Self {
        self.speech = Some(speech);
        self
    }

    pub fn with_guardrails(mut self, guardrails: GuardrailPolicy) -> Self {
        self.guardrails = guardrails;
        self
    }

    pub fn settings(&self) -> &ConversationSettings {
        &self.settings
    }

    pub async fn start_call(
        &self,
        attempt_id: CallAttemptId,
        lead: &Lead,
        now: DateTime<Utc>,
    ) -> (ConversationHandle, AgentResponse) {
        let mut handle = ConversationHandle {
            attempt_id,
            lead_name: lead.display_first_name().to_string(),
            started_at: now,
            deadline: now
                .checked_add_signed(self.settings.max_duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            transcript: Transcript::new(),
            score: RubricScore::default(),
            lead_turns: 0,
            consecutive_anomalies: 0,
            ended: None,
        };

        let greeting = match self.generate(&handle).await {
            Ok(text) => text,
            Err(anomaly) => {
                warn!(
                    event_name = "conversation.anomaly",
                    attempt_id = %handle.attempt_id,
                    anomaly = anomaly.as_str(),
                    detail = ?anomaly,
                    "greeting fell back to the fixed opening"
                );
                self.prompts.line(FixedLine::OpeningFallback, &handle.lead_name)
            }
        };
        handle.push(Speaker::Agent, greeting.clone(), Vec::new(), now);
        info!(
            event_name = "conversation.started",
            attempt_id = %handle.attempt_id,
            lead_id = %lead.id,
            "conversation started"
        );
        (handle, AgentResponse::listen(greeting))
    }

    pub async fn on_lead_utterance(
        &self,
        handle: &mut ConversationHandle,
        input: LeadInput,
        now: DateTime<Utc>,
    ) -> AgentResponse {
        if handle.is_finished() {
            return AgentResponse::hang_up(String::new());
        }
        if now >= handle.deadline {
            return self.close(handle, FixedLine::WindDown, EndReason::MaxDuration, now);
        }

        let text = match self.resolve_input(input).await {
            Ok(text) => text,
            Err(anomaly) => return self.anomaly(handle, anomaly, now),
        };

        let signals = self.rubric.extract(&text);
        handle.score.absorb(&signals);
        handle.lead_turns += 1;
        debug!(
            event_name = "conversation.lead_turn",
            attempt_id = %handle.attempt_id,
            intents = ?signals.intents,
            score = handle.score.score,
            "lead turn scored"
        );
        let declined = signals.has(Intent::ExplicitDecline);
        let agreed = signals.has(Intent::ExplicitAgreement);
        handle.push(Speaker::Lead, text, signals.intents, now);

        if declined {
            return self.close(handle, FixedLine::ClosingDeclined, EndReason::LeadDeclined, now);
        }
        if agreed {
            return self.close(handle, FixedLine::ClosingAgreed, EndReason::LeadAgreed, now);
        }
        if handle.lead_turns >= self.settings.max_turns {
            return self.close(handle, FixedLine::WindDown, EndReason::MaxTurns, now);
        }

        match self.generate(handle).await {
            Ok(reply) => {
                handle.consecutive_anomalies = 0;
                handle.push(Speaker::Agent, reply.clone(), Vec::new(), now);
                AgentResponse::listen(reply)
            }
            Err(anomaly) => self.anomaly(handle, anomaly, now),
        }
    }

    /// Cooperative cancel: speak the wind-down line and stop listening.
    pub fn cancel(
        &self,
        handle: &mut ConversationHandle,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AgentResponse {
        if handle.is_finished() {
            return AgentResponse::hang_up(String::new());
        }
        self.close(handle, FixedLine::WindDown, EndReason::Cancelled(reason.to_string()), now)
    }

    /// Produces the best-effort result. A reason recorded by the conversation
    /// itself takes precedence over the one passed in.
    pub fn finalize(&self, handle: ConversationHandle, reason: EndReason) -> FinalizedConversation {
        let reason = handle.ended.clone().unwrap_or(reason);
        let degraded = reason == EndReason::Anomalies;
        let result = handle.score.result(self.settings.qualification_threshold, degraded);
        info!(
            event_name = "conversation.finalized",
            attempt_id = %handle.attempt_id,
            reason = reason.as_str(),
            verdict = result.verdict.as_str(),
            confidence = result.confidence,
            turns = handle.transcript.len(),
            "conversation finalized"
        );
        FinalizedConversation { transcript: handle.transcript, result, reason }
    }

    async fn resolve_input(&self, input: LeadInput) -> Result<String, Anomaly> {
        let text = match input {
            LeadInput::Text(text) => text,
            LeadInput::Silence => return Err(Anomaly::EmptyInput),
            LeadInput::Audio(audio) => {
                let Some(speech) = &self.speech else {
                    return Err(Anomaly::Transcription("no transcriber configured".to_string()));
                };
                tokio::time::timeout(self.settings.turn_timeout, speech.transcribe(&audio))
                    .await
                    .map_err(|_| Anomaly::Transcription("timed out".to_string()))?
                    .map_err(|error| Anomaly::Transcription(error.to_string()))?
            }
        };

        let trimmed = text.trim();
        if trimmed.is_empty() || !trimmed.chars().any(char::is_alphanumeric) {
            return Err(Anomaly::EmptyInput);
        }
        Ok(trimmed.to_string())
    }

    async fn generate(&self, handle: &ConversationHandle) -> Result<String, Anomaly> {
        let stage = Stage::for_turn_count(handle.transcript.len());
        let prompt =
            self.prompts.render_prompt(
                stage,
                &handle.lead_name,
                &handle.transcript,
                &handle.score,
            )?;

        let reply = tokio::time::timeout(self.settings.turn_timeout, self.llm.complete(&prompt))
            .await
            .map_err(|_| Anomaly::ModelTimeout)?
            .map_err(|error| Anomaly::Model(error.to_string()))?;

        match self.guardrails.evaluate(&reply) {
            GuardrailDecision::Allow(text) => Ok(text),
            GuardrailDecision::Degrade { reason_code, text } => {
                debug!(
                    event_name = "conversation.reply_degraded",
                    attempt_id = %handle.attempt_id,
                    reason_code,
                    "model reply adjusted"
                );
                Ok(text)
            }
            GuardrailDecision::Deny { reason_code } => Err(Anomaly::Guardrail(reason_code)),
        }
    }

    fn anomaly(
        &self,
        handle: &mut ConversationHandle,
        anomaly: Anomaly,
        now: DateTime<Utc>,
    ) -> AgentResponse {
        handle.consecutive_anomalies = handle.consecutive_anomalies.saturating_add(1);
        warn!(
            event_name = "conversation.anomaly",
            attempt_id = %handle.attempt_id,
            anomaly = anomaly.as_str(),
            detail = ?anomaly,
            consecutive = handle.consecutive_anomalies,
            "conversation anomaly"
        );

        if handle.consecutive_anomalies >= 2 {
            return self.close(handle, FixedLine::WindDown, EndReason::Anomalies, now);
        }
        handle.push(Speaker::Agent, FALLBACK_UTTERANCE.to_string(), Vec::new(), now);
        AgentResponse::listen(FALLBACK_UTTERANCE.to_string())
    }

    fn close(
        &self,
        handle: &mut ConversationHandle,
        line: FixedLine,
        reason: EndReason,
        now: DateTime<Utc>,
    ) -> AgentResponse {
        let text = self.prompts.line(line, &handle.lead_name);
        handle.push(Speaker::Agent, text.clone(), Vec::new(), now);
        handle.ended = Some(reason);
        AgentResponse::hang_up(text)
    }
}
