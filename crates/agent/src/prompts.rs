//! Stage prompts for the language model and the fixed lines the agent speaks
//! without consulting it.

use serde::Serialize;
use setter_core::domain::transcript::{Speaker, Transcript};
use tera::{Context, Tera};
use thiserror::Error;

use crate::rubric::RubricScore;

/// Spoken when the model or the caller's input fails once.
pub const FALLBACK_UTTERANCE: &str =
    "I apologize, but I'm having trouble processing that right now. Could you please repeat?";
/// Spoken when a fixed line cannot be rendered.
pub const GOODBYE: &str = "Thank you for your time. We'll follow up with you soon.";

const GREETING_PROMPT: &str = r#"You are {{ persona.agent_name }}, calling on behalf of {{ persona.contact_name }} from {{ persona.company_name }}.
Start with a brief, warm introduction: "Hi {{ lead_name }}, this is {{ persona.agent_name }} calling on behalf of {{ persona.contact_name }} from {{ persona.company_name }}."
Then ask if they have a quick moment to discuss business financing.
Keep it short and natural, like a real person talking. One or two sentences."#;

const QUALIFICATION_PROMPT: &str = r#"You are {{ persona.agent_name }} from {{ persona.company_name }}. Keep responses short and conversational.
Ask ONE question at a time:
- What type of financing are you looking for?
- What's the purpose of the loan?
- What amount are you considering?
Listen to their answer and follow up naturally. If they ask about {{ persona.company_name }}, answer briefly.
Never promise approval, rates or terms."#;

const SCHEDULING_PROMPT: &str = r#"You are {{ persona.agent_name }} from {{ persona.company_name }}. {{ lead_name }} is interested.
Move to scheduling naturally: ask when would be a good time for {{ persona.contact_name }} to call them.
Don't ask for email; {{ persona.contact_name }} will send a calendar invite.
{% if availability %}They mentioned: "{{ availability }}". Confirm it instead of asking again.
{% endif %}Keep it simple and direct."#;

const CONVERSATION_FRAME: &str = r#"{{ instructions }}

Conversation so far:
{% for line in history %}{{ line.speaker }}: {{ line.text }}
{% endfor %}{{ persona.agent_name }}:"#;

const CLOSING_AGREED: &str = "Perfect, {{ lead_name }}. {{ persona.contact_name }} will send you a calendar invite shortly. Thank you for your time!";
const CLOSING_DECLINED: &str =
    "Understood, {{ lead_name }}. Thank you for your time, and have a great day.";
const WIND_DOWN: &str = "I don't want to keep you any longer, {{ lead_name }}. {{ persona.contact_name }} from {{ persona.company_name }} will follow up with you soon. Thank you for your time.";
const OPENING_FALLBACK: &str = "Hi {{ lead_name }}, this is {{ persona.agent_name }} calling on behalf of {{ persona.contact_name }} from {{ persona.company_name }}. Do you have a quick moment?";

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt template error: {0}")]
    Template(String),
}

impl From<tera::Error> for PromptError {
    fn from(error: tera::Error) -> Self {
        Self::Template(error.to_string())
    }
}

/// Conversation stage, chosen by how many turns have been exchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Greeting,
    Qualification,
    Scheduling,
}

impl Stage {
    pub fn for_turn_count(turns: usize) -> Self {
        match turns {
            0 => Self::Greeting,
            1..=2 => Self::Qualification,
            _ => Self::Scheduling,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Greeting => "greeting",
            Self::Qualification => "qualification",
            Self::Scheduling => "scheduling",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FixedLine {
    ClosingAgreed,
    ClosingDeclined,
    WindDown,
    OpeningFallback,
}

impl FixedLine {
    fn template_name(&self) -> &'static str {
        match self {
            Self::ClosingAgreed => "closing_agreed",
            Self::ClosingDeclined => "closing_declined",
            Self::WindDown => "wind_down",
            Self::OpeningFallback => "opening_fallback",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Persona {
    pub agent_name: String,
    pub company_name: String,
    pub contact_name: String,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            agent_name: "Maayaa".to_string(),
            company_name: "LoanCater".to_string(),
            contact_name: "Ryan".to_string(),
        }
    }
}

#[derive(Serialize)]
struct PromptLine<'a> {
    speaker: &'a str,
    text: &'a str,
}

#[derive(Clone, Debug)]
pub struct PromptRenderer {
    tera: Tera,
    persona: Persona,
    history_window: usize,
}

impl PromptRenderer {
    pub fn new(persona: Persona, history_window: usize) -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (Stage::Greeting.as_str(), GREETING_PROMPT),
            (Stage::Qualification.as_str(), QUALIFICATION_PROMPT),
            (Stage::Scheduling.as_str(), SCHEDULING_PROMPT),
            ("conversation_frame", CONVERSATION_FRAME),
            (FixedLine::ClosingAgreed.template_name(), CLOSING_AGREED),
            (FixedLine::ClosingDeclined.template_name(), CLOSING_DECLINED),
            (FixedLine::WindDown.template_name(), WIND_DOWN),
            (FixedLine::OpeningFallback.template_name(), OPENING_FALLBACK),
        ])?;
        Ok(Self { tera, persona, history_window: history_window.max(1) })
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// Full model prompt: stage instructions plus the recent transcript.
    pub fn render_prompt(
        &self,
        stage: Stage,
        lead_name: &str,
        transcript: &Transcript,
        score: &RubricScore,
    ) -> Result<String, PromptError> {
        let mut context = self.base_context(lead_name);
        context.insert("availability", &score.availability);
        let instructions = self.tera.render(stage.as_str(), &context)?;

        // Two lines per exchange.
        let history: Vec<PromptLine<'_>> = transcript
            .recent(self.history_window * 2)
            .iter()
            .map(|turn| PromptLine {
                speaker: match turn.speaker {
                    Speaker::Agent => self.persona.agent_name.as_str(),
                    Speaker::Lead => lead_name,
                },
                text: turn.text.as_str(),
            })
            .collect();
        context.insert("instructions", &instructions);
        context.insert("history", &history);
        Ok(self.tera.render("conversation_frame", &context)?)
    }

    /// Renders a fixed line, falling back to a generic goodbye.
    pub fn line(&self, line: FixedLine, lead_name: &str) -> String {
        self.tera
            .render(line.template_name(), &self.base_context(lead_name))
            .unwrap_or_else(|_| GOODBYE.to_string())
    }

    fn base_context(&self, lead_name: &str) -> Context {
        let mut context = Context::new();
        context.insert("persona", &self.persona);
        context.insert("lead_name", lead_name);
        context
    }
}
