//! Conversation engine for qualification calls.
//!
//! The engine drives a short, turn-based phone conversation:
//! - stage prompts are rendered from templates (`prompts`) and phrased by a
//!   pluggable language model (`llm`)
//! - every model reply passes the reply policy (`guardrails`) before it is spoken
//! - every lead turn is scored by a keyword rubric (`rubric`)
//!
//! The model never decides the outcome. Qualification comes from the rubric,
//! so a call that ends early, hangs up or loses the model still finalizes.

pub mod conversation;
pub mod guardrails;
pub mod llm;
pub mod prompts;
pub mod rubric;
pub mod speech;

pub use conversation::{
    AgentResponse, ConversationEngine, ConversationHandle, ConversationSettings, EndReason,
    FinalizedConversation, LeadInput, TurnAction,
};
pub use guardrails::{GuardrailDecision, GuardrailPolicy};
pub use llm::LlmClient;
pub use prompts::{Persona, PromptError, FALLBACK_UTTERANCE, GOODBYE};
pub use rubric::{RubricExtractor, RubricScore, RubricSignals};
pub use speech::SpeechTranscriber;
