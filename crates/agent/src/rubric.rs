//! Deterministic qualification rubric.
//!
//! Every lead turn is scanned for keyword signals. The score that drives the
//! verdict comes only from here; model output never feeds into it.

use std::collections::BTreeSet;

use setter_core::domain::qualification::{QualificationResult, QualificationVerdict};
use setter_core::domain::transcript::Intent;

const AGREEMENT_PHRASES: &[&str] = &[
    "lets schedule",
    "lets set it up",
    "lets do it",
    "lets book",
    "book it",
    "book me",
    "set it up",
    "sign me up",
    "schedule it",
    "schedule a call",
    "schedule the meeting",
    "sounds good",
    "that works",
    "works for me",
    "absolutely",
    "definitely",
    "of course",
];

const DECLINE_PHRASES: &[&str] = &[
    "not interested",
    "no thanks",
    "no thank you",
    "dont call",
    "do not call",
    "stop calling",
    "remove me",
    "take me off",
    "leave me alone",
];

const OBJECTION_PHRASES: &[&str] = &[
    "maybe later",
    "not now",
    "no time",
    "too busy",
    "busy",
    "later",
    "not available",
    "not sure",
    "too expensive",
    "already have",
];

const INTEREST_PHRASES: &[&str] = &[
    "interested",
    "tell me more",
    "yes",
    "yeah",
    "sure",
    "okay",
    "ok",
    "good",
    "great",
    "perfect",
    "looking for",
    "need financing",
    "need a loan",
];

/// Phrases that contain a negator but read as assent.
const AFFIRMING_PHRASES: &[&str] = &["no problem", "no worries", "why not", "not a problem"];

const NEGATORS: &[&str] = &["no", "not", "dont", "never", "cant", "wont", "doesnt", "didnt"];
/// How many tokens before a phrase a negator may sit, within one clause.
const NEGATION_WINDOW: usize = 3;
const CLAUSE_BREAK: &str = "|";

const AVAILABILITY_PHRASES: &[&str] = &[
    "today",
    "tomorrow",
    "tonight",
    "this week",
    "next week",
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
    "morning",
    "afternoon",
    "evening",
    "oclock",
    "call back",
    "follow up",
    "appointment",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RubricSignals {
    pub intents: Vec<Intent>,
    /// The lead's own words when they mention a time.
    pub availability: Option<String>,
    pub weight: i32,
}

impl RubricSignals {
    pub fn has(&self, intent: Intent) -> bool {
        self.intents.contains(&intent)
    }
}

#[derive(Clone, Debug, Default)]
pub struct RubricExtractor;

impl RubricExtractor {
    pub fn new() -> Self {
        Self
    }

    pub fn extract(&self, text: &str) -> RubricSignals {
        let tokens = tokenize(&normalize_text(text));
        let mut phrase_text = padded(&tokens);
        let mut intents = BTreeSet::new();

        // Negative phrases are removed before positive matching so that
        // "not interested" never counts as interest.
        if strip_phrases(&mut phrase_text, DECLINE_PHRASES) {
            intents.insert(Intent::ExplicitDecline);
        }
        if strip_phrases(&mut phrase_text, OBJECTION_PHRASES) {
            intents.insert(Intent::Objection);
        }
        let affirmed = strip_phrases(&mut phrase_text, AFFIRMING_PHRASES);
        // "don't book me" refuses; "I don't need a loan" pushes back.
        if strip_negated(&mut phrase_text, AGREEMENT_PHRASES) {
            intents.insert(Intent::ExplicitDecline);
        }
        if strip_negated(&mut phrase_text, INTEREST_PHRASES) {
            intents.insert(Intent::Objection);
        }
        if strip_phrases(&mut phrase_text, AGREEMENT_PHRASES) {
            intents.insert(Intent::ExplicitAgreement);
        }
        if affirmed || contains_any(&phrase_text, INTEREST_PHRASES) {
            intents.insert(Intent::ExpressedInterest);
        }
        let mentions_time =
            contains_any(&phrase_text, AVAILABILITY_PHRASES) || mentions_clock_time(&tokens);
        let availability =
            mentions_time.then(|| text.trim().to_string()).filter(|value| !value.is_empty());
        if availability.is_some() {
            intents.insert(Intent::AvailabilityMentioned);
        }
        if intents.contains(&Intent::ExplicitDecline) {
            intents.remove(&Intent::ExplicitAgreement);
        }

        let intents: Vec<Intent> = if intents.is_empty() {
            vec![Intent::Unclear]
        } else {
            intents.into_iter().collect()
        };
        let weight = intents.iter().map(|intent| intent_weight(*intent)).sum();

        RubricSignals { intents, availability, weight }
    }
}

fn intent_weight(intent: Intent) -> i32 {
    match intent {
        Intent::ExplicitAgreement => 3,
        Intent::ExpressedInterest | Intent::AvailabilityMentioned => 1,
        Intent::Objection => -1,
        Intent::ExplicitDecline => -3,
        Intent::Unclear => 0,
    }
}

/// Running tally across a conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RubricScore {
    pub score: i32,
    pub interest: u32,
    pub objections: u32,
    pub agreed: bool,
    pub declined: bool,
    pub availability: Option<String>,
    pub lead_turns: u32,
}

impl RubricScore {
    pub fn absorb(&mut self, signals: &RubricSignals) {
        self.lead_turns += 1;
        self.score += signals.weight;
        if signals.has(Intent::ExpressedInterest) {
            self.interest += 1;
        }
        if signals.has(Intent::Objection) {
            self.objections += 1;
        }
        if signals.has(Intent::ExplicitAgreement) {
            self.agreed = true;
        }
        if signals.has(Intent::ExplicitDecline) {
            self.declined = true;
        }
        if let Some(availability) = &signals.availability {
            self.availability = Some(availability.clone());
        }
    }

    pub fn verdict(&self, threshold: i32) -> QualificationVerdict {
        if self.declined {
            QualificationVerdict::Disqualified
        } else if self.agreed || (self.score >= threshold && self.interest > 0) {
            QualificationVerdict::Qualified
        } else if self.score <= -threshold {
            QualificationVerdict::Disqualified
        } else {
            QualificationVerdict::Inconclusive
        }
    }

    /// Builds the result. `degraded` caps confidence for conversations that
    /// ended on repeated anomalies.
    pub fn result(&self, threshold: i32, degraded: bool) -> QualificationResult {
        let verdict = self.verdict(threshold);
        let mut confidence: u8 = if self.agreed || self.declined {
            90
        } else if verdict == QualificationVerdict::Inconclusive {
            if self.lead_turns == 0 {
                10
            } else {
                30
            }
        } else {
            let margin = self.score.unsigned_abs().min(10) as u8;
            55 + margin * 3
        };
        if degraded {
            confidence = confidence.min(25);
        }

        let reason = if self.declined {
            "lead declined".to_string()
        } else if self.agreed {
            "lead agreed to a follow-up".to_string()
        } else {
            format!(
                "score {} after {} lead turns ({} interest, {} objections)",
                self.score, self.lead_turns, self.interest, self.objections
            )
        };

        QualificationResult {
            verdict,
            availability: self.availability.clone(),
            confidence,
            score: self.score,
            reason,
        }
    }
}

fn normalize_text(text: &str) -> String {
    text.to_ascii_lowercase()
}

/// Lowercase word tokens, with `|` standing in for clause punctuation.
fn tokenize(text: &str) -> Vec<String> {
    let mut sanitized = String::with_capacity(text.len());
    let mut characters = text.chars().peekable();
    while let Some(character) = characters.next() {
        if character.is_ascii_alphanumeric() {
            sanitized.push(character);
        } else if matches!(character, ',' | ';' | ':' | '!' | '?') {
            sanitized.push_str(" | ");
        } else if character == '.' {
            // "p.m." -> "pm", but a full stop ends the clause.
            if characters.peek().map_or(true, |next| next.is_whitespace()) {
                sanitized.push_str(" | ");
            }
        } else if matches!(character, '\'' | '\u{2019}') {
            // "don't" -> "dont"
        } else {
            sanitized.push(' ');
        }
    }
    sanitized.split_whitespace().map(|token| token.to_string()).collect()
}

fn padded(tokens: &[String]) -> String {
    format!(" {} ", tokens.join(" "))
}

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|phrase| text.contains(&format!(" {phrase} ")))
}

/// "3 pm", "10am", "4 p.m."
fn mentions_clock_time(tokens: &[String]) -> bool {
    let is_hour = |value: &str| value.parse::<u8>().is_ok_and(|hour| (1..=12).contains(&hour));
    let is_meridiem = |value: &str| value == "am" || value == "pm";

    tokens.iter().enumerate().any(|(index, token)| {
        if is_meridiem(token) {
            return index > 0 && is_hour(&tokens[index - 1]);
        }
        token
            .strip_suffix("am")
            .or_else(|| token.strip_suffix("pm"))
            .is_some_and(|hour| is_hour(hour))
    })
}

fn strip_phrases(text: &mut String, phrases: &[&str]) -> bool {
    let mut found = false;
    for phrase in phrases {
        let needle = format!(" {phrase} ");
        while text.contains(&needle) {
            *text = text.replacen(&needle, " ", 1);
            found = true;
        }
    }
    found
}

/// Removes occurrences of `phrases` preceded by a negator in the same clause.
fn strip_negated(text: &mut String, phrases: &[&str]) -> bool {
    let mut found = false;
    for phrase in phrases {
        let needle = format!(" {phrase} ");
        let mut from = 0;
        while let Some(offset) = text[from..].find(&needle) {
            let start = from + offset;
            if is_negated(&text[..start]) {
                text.replace_range(start..start + needle.len(), " ");
                found = true;
                from = start;
            } else {
                from = start + 1;
            }
        }
    }
    found
}

fn is_negated(preceding: &str) -> bool {
    preceding
        .split_whitespace()
        .rev()
        .take_while(|token| *token != CLAUSE_BREAK)
        .take(NEGATION_WINDOW)
        .any(|token| NEGATORS.contains(&token))
}

#[cfg(test)]
mod tests {
    use setter_core::domain::qualification::QualificationVerdict;
    use setter_core::domain::transcript::Intent;

    use super::{RubricExtractor, RubricScore};

    #[test]
    fn explicit_agreement_is_detected() {
        let signals = RubricExtractor::new().extract("Yes, let's schedule it for tomorrow at 3 p.m.");

        assert!(signals.has(Intent::ExplicitAgreement));
        assert!(signals.has(Intent::ExpressedInterest));
        assert!(signals.has(Intent::AvailabilityMentioned));
        assert_eq!(
            signals.availability.as_deref(),
            Some("Yes, let's schedule it for tomorrow at 3 p.m.")
        );
        assert!(signals.weight >= 5);
    }

    #[test]
    fn not_interested_never_counts_as_interest() {
        let signals = RubricExtractor::new().extract("I'm not interested, please stop calling");

        assert!(signals.has(Intent::ExplicitDecline));
        assert!(!signals.has(Intent::ExpressedInterest));
        assert!(signals.weight < 0);
    }

    #[test]
    fn noise_is_unclear() {
        let signals = RubricExtractor::new().extract("hmm what was that");
        assert_eq!(signals.intents, vec![Intent::Unclear]);
        assert_eq!(signals.weight, 0);
        assert!(signals.availability.is_none());
    }

    #[test]
    fn words_are_matched_on_boundaries() {
        let extractor = RubricExtractor::new();
        assert!(!extractor.extract("yesterday was hectic").has(Intent::ExpressedInterest));
        assert!(!extractor.extract("I'm a pmp certified manager").has(Intent::AvailabilityMentioned));
    }

    #[test]
    fn handles_common_call_phrases() {
        struct Case {
            text: &'static str,
            expect: Intent,
        }

        let cases = vec![
            Case { text: "Sure, go ahead", expect: Intent::ExpressedInterest },
            Case { text: "yeah I'm looking for working capital", expect: Intent::ExpressedInterest },
            Case { text: "tell me more about the rates", expect: Intent::ExpressedInterest },
            Case { text: "That works for me", expect: Intent::ExplicitAgreement },
            Case { text: "absolutely, book me in", expect: Intent::ExplicitAgreement },
            Case { text: "sign me up", expect: Intent::ExplicitAgreement },
            Case { text: "No thanks.", expect: Intent::ExplicitDecline },
            Case { text: "Don't call me again", expect: Intent::ExplicitDecline },
            Case { text: "take me off your list", expect: Intent::ExplicitDecline },
            Case { text: "I'm too busy right now", expect: Intent::Objection },
            Case { text: "maybe later", expect: Intent::Objection },
            Case { text: "we already have a lender", expect: Intent::Objection },
            Case { text: "Friday morning is best", expect: Intent::AvailabilityMentioned },
            Case { text: "call me at 4 pm", expect: Intent::AvailabilityMentioned },
            Case { text: "next week works", expect: Intent::AvailabilityMentioned },
            Case { text: "around ten o'clock", expect: Intent::AvailabilityMentioned },
        ];

        let extractor = RubricExtractor::new();
        for (index, case) in cases.iter().enumerate() {
            let signals = extractor.extract(case.text);
            assert!(
                signals.has(case.expect),
                "case {index} expected {:?}: {}",
                case.expect,
                case.text
            );
        }
    }

    #[test]
    fn running_score_reaches_verdicts() {
        let extractor = RubricExtractor::new();

        let mut interested = RubricScore::default();
        interested.absorb(&extractor.extract("yes I'm interested"));
        interested.absorb(&extractor.extract("tomorrow afternoon"));
        assert_eq!(interested.verdict(2), QualificationVerdict::Qualified);

        let mut declined = RubricScore::default();
        declined.absorb(&extractor.extract("sure, that sounds good"));
        declined.absorb(&extractor.extract("actually no thanks"));
        assert_eq!(declined.verdict(2), QualificationVerdict::Disqualified);

        let mut silent = RubricScore::default();
        silent.absorb(&extractor.extract("who is this"));
        assert_eq!(silent.verdict(2), QualificationVerdict::Inconclusive);
        assert_eq!(silent.result(2, false).confidence, 30);
    }

    #[test]
    fn negated_agreement_is_a_refusal() {
        let extractor = RubricExtractor::new();

        for text in ["No, don't book me for anything", "that does not work, don't schedule it"] {
            let signals = extractor.extract(text);
            assert!(!signals.has(Intent::ExplicitAgreement), "{text}: {:?}", signals.intents);
            assert!(signals.has(Intent::ExplicitDecline), "{text}: {:?}", signals.intents);

            let mut score = RubricScore::default();
            score.absorb(&signals);
            assert_eq!(score.verdict(2), QualificationVerdict::Disqualified, "{text}");
        }
    }

    #[test]
    fn negated_interest_is_an_objection() {
        let signals = RubricExtractor::new().extract("I don't need a loan");

        assert!(!signals.has(Intent::ExpressedInterest));
        assert!(signals.has(Intent::Objection));
        assert!(signals.weight < 0);
    }

    #[test]
    fn negation_stays_inside_its_clause() {
        let extractor = RubricExtractor::new();

        assert!(extractor.extract("No problem, let's book it").has(Intent::ExplicitAgreement));
        assert!(extractor.extract("I'm not busy. Book me in").has(Intent::ExplicitAgreement));
        assert!(extractor.extract("why not, sounds good").has(Intent::ExplicitAgreement));
        assert!(extractor.extract("no worries").has(Intent::ExpressedInterest));
    }

    #[test]
    fn degraded_results_are_low_confidence() {
        let mut score = RubricScore::default();
        score.absorb(&RubricExtractor::new().extract("yes let's do it"));

        let result = score.result(2, true);
        assert_eq!(result.verdict, QualificationVerdict::Qualified);
        assert!(result.confidence <= 25);
    }
}
