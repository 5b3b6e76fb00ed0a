/// Checks applied to every model reply before it is spoken.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow(String),
    /// Spoken, but shortened or cleaned up.
    Degrade { reason_code: &'static str, text: String },
    /// Not spoken; the turn counts as a model anomaly.
    Deny { reason_code: &'static str },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardrailPolicy {
    pub max_reply_chars: usize,
    /// The model may never commit the company to financial terms.
    pub forbidden_phrases: Vec<String>,
}

impl Default for GuardrailPolicy {
    fn default() -> Self {
        Self {
            max_reply_chars: 400,
            forbidden_phrases: [
                "you are approved",
                "you're approved",
                "guaranteed approval",
                "guaranteed rate",
                "i guarantee",
                "pre-approved",
            ]
            .into_iter()
            .map(str::to_string)
            .collect(),
        }
    }
}

impl GuardrailPolicy {
    pub fn evaluate(&self, reply: &str) -> GuardrailDecision {
        let text = strip_speaker_prefix(reply.trim()).trim().trim_matches('"').trim();
        if text.is_empty() {
            return GuardrailDecision::Deny { reason_code: "empty_reply" };
        }

        let lowered = text.to_ascii_lowercase();
        if self.forbidden_phrases.iter().any(|phrase| lowered.contains(phrase.as_str())) {
            return GuardrailDecision::Deny { reason_code: "financial_commitment" };
        }

        if text.chars().count() > self.max_reply_chars {
            return GuardrailDecision::Degrade {
                reason_code: "reply_truncated",
                text: truncate_at_sentence(text, self.max_reply_chars),
            };
        }

        if text.len() != reply.len() {
            return GuardrailDecision::Degrade {
                reason_code: "reply_normalized",
                text: text.to_string(),
            };
        }

        GuardrailDecision::Allow(text.to_string())
    }
}

fn strip_speaker_prefix(text: &str) -> &str {
    match text.split_once(':') {
        Some((prefix, rest))
            if !prefix.is_empty() && prefix.len() <= 24 && !prefix.contains(' ') =>
        {
            rest
        }
        _ => text,
    }
}

fn truncate_at_sentence(text: &str, max_chars: usize) -> String {
    let clipped: String = text.chars().take(max_chars).collect();
    match clipped.rfind(['.', '?', '!']) {
        Some(end) if end > 0 => clipped[..=end].to_string(),
        _ => clipped,
    }
}
