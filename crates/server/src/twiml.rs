//! TwiML replies for the telephony webhooks.

use setter_agent::{AgentResponse, TurnAction, GOODBYE};

const HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;
const GATHER_TIMEOUT_SECS: u32 = 5;

/// Speaks `text` and gathers the lead's reply, posting it to `action_url`.
/// Silence is posted too, so the conversation sees it as a turn.
pub fn listen(text: &str, action_url: &str) -> String {
    format!(
        "{HEADER}<Response><Gather input=\"speech\" action=\"{action}\" method=\"POST\" \
         timeout=\"{GATHER_TIMEOUT_SECS}\" speechTimeout=\"auto\" actionOnEmptyResult=\"true\">\
         <Say>{text}</Say></Gather><Say>{goodbye}</Say><Hangup/></Response>",
        action = escape(action_url),
        text = escape(text),
        goodbye = escape(GOODBYE),
    )
}

/// Speaks `text` (if any) and ends the call.
pub fn hang_up(text: &str) -> String {
    if text.trim().is_empty() {
        return format!("{HEADER}<Response><Hangup/></Response>");
    }
    format!("{HEADER}<Response><Say>{}</Say><Hangup/></Response>", escape(text))
}

pub fn respond(response: &AgentResponse, action_url: &str) -> String {
    match response.action {
        TurnAction::Listen => listen(&response.text, action_url),
        TurnAction::HangUp => hang_up(&response.text),
    }
}

fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use setter_agent::{AgentResponse, TurnAction};

    use super::{hang_up, listen, respond};

    #[test]
    fn listen_wraps_the_line_in_a_speech_gather() {
        let action = "https://dialer.test/telephony/speech?attempt_id=a&b=c";
        let xml = listen("Hi Dana, got a moment?", action);

        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<Gather input=\"speech\""));
        assert!(xml.contains("action=\"https://dialer.test/telephony/speech?attempt_id=a&amp;b=c\""));
        assert!(xml.contains("<Say>Hi Dana, got a moment?</Say></Gather>"));
    }

    #[test]
    fn text_is_escaped() {
        let xml = hang_up("Rates <today> & \"tomorrow\"");
        assert!(xml.contains("<Say>Rates &lt;today&gt; &amp; &quot;tomorrow&quot;</Say><Hangup/>"));
    }

    #[test]
    fn empty_goodbye_only_hangs_up() {
        assert!(hang_up("  ").ends_with("<Response><Hangup/></Response>"));
    }

    #[test]
    fn agent_action_picks_the_verb() {
        let closing = AgentResponse { text: "Bye now.".to_string(), action: TurnAction::HangUp };
        assert!(respond(&closing, "unused").contains("<Say>Bye now.</Say><Hangup/>"));

        let question = AgentResponse { text: "When?".to_string(), action: TurnAction::Listen };
        assert!(respond(&question, "https://x.test/s").contains("<Gather"));
    }
}
