use serde_json::Value;
use tracing::debug;

use crate::types::{
    Decision, EntryVerdict, PositionAction, PositionVerdict, RiskLevel, Trend,
};

/// Extract the first balanced `{…}` block from free-form model output.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Model output is untrusted input: extract, validate, clip, and fall back
/// to a conservative verdict on anything ambiguous.
pub fn parse_entry(text: &str) -> EntryVerdict {
    if let Some(block) = extract_json_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return entry_from_value(&value);
        }
        debug!("entry verdict JSON block failed to parse, using keyword fallback");
    }
    keyword_fallback(text)
}

pub fn parse_position(text: &str) -> PositionVerdict {
    if let Some(block) = extract_json_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(block) {
            return position_from_value(&value);
        }
        debug!("position verdict JSON block failed to parse");
    }
    PositionVerdict::hold("unparseable reasoning output")
}

fn entry_from_value(value: &Value) -> EntryVerdict {
    let decision = match value
        .get("decision")
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .as_deref()
    {
        Some("BUY") => Decision::Buy,
        Some("SELL") => Decision::Sell,
        _ => Decision::Hold,
    };

    EntryVerdict {
        decision,
        confidence: clip_confidence(value.get("confidence")),
        reasoning: string_field(value, "reasoning"),
        suggested_leverage: value
            .get("suggested_leverage")
            .and_then(Value::as_f64)
            .map(|l| (l.round() as i64).clamp(1, 50) as u32)
            .unwrap_or(5),
        risk_level: risk_level(value.get("risk_level")),
        market_sentiment: match value
            .get("market_sentiment")
            .and_then(Value::as_str)
            .map(str::to_lowercase)
            .as_deref()
        {
            Some("bullish") => Trend::Bullish,
            Some("bearish") => Trend::Bearish,
            _ => Trend::Neutral,
        },
    }
}

fn position_from_value(value: &Value) -> PositionVerdict {
    let action = match value
        .get("action")
        .and_then(Value::as_str)
        .map(str::to_uppercase)
        .as_deref()
    {
        Some("CLOSE_25") => PositionAction::Close25,
        Some("CLOSE_50") => PositionAction::Close50,
        Some("CLOSE_100") => PositionAction::Close100,
        _ => PositionAction::Hold,
    };

    PositionVerdict {
        action,
        confidence: clip_confidence(value.get("confidence")),
        reasoning: string_field(value, "reasoning"),
        risk_level: risk_level(value.get("risk_level")),
    }
}

/// Scan raw text for a directional keyword and emit a low-confidence
/// verdict; anything else is a HOLD.
fn keyword_fallback(text: &str) -> EntryVerdict {
    let upper = text.to_uppercase();
    let decision = if upper.contains("BUY") && !upper.contains("SELL") {
        Decision::Buy
    } else if upper.contains("SELL") && !upper.contains("BUY") {
        Decision::Sell
    } else {
        Decision::Hold
    };

    EntryVerdict {
        decision,
        confidence: 0.3,
        reasoning: "keyword fallback on unstructured reply".to_string(),
        suggested_leverage: 5,
        risk_level: RiskLevel::Medium,
        market_sentiment: Trend::Neutral,
    }
}

fn clip_confidence(value: Option<&Value>) -> f64 {
    value
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.5)
}

fn risk_level(value: Option<&Value>) -> RiskLevel {
    match value
        .and_then(Value::as_str)
        .map(str::to_lowercase)
        .as_deref()
    {
        Some("low") => RiskLevel::Low,
        Some("high") => RiskLevel::High,
        _ => RiskLevel::Medium,
    }
}

fn string_field(value: &Value, key: &str) -> String {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_balanced_block() {
        let text = "Sure! Here is my analysis:\n```json\n{\"decision\": \"BUY\", \"nested\": {\"a\": 1}}\n``` trailing";
        let block = extract_json_block(text).unwrap();
        assert!(block.starts_with('{') && block.ends_with('}'));
        assert!(block.contains("nested"));
    }

    #[test]
    fn test_extract_handles_braces_in_strings() {
        let text = r#"{"reasoning": "price broke {resistance}", "decision": "SELL"}"#;
        let block = extract_json_block(text).unwrap();
        assert_eq!(block, text);
    }

    #[test]
    fn test_parse_entry_valid() {
        let text = r#"{"decision":"BUY","confidence":0.82,"reasoning":"momentum","suggested_leverage":15,"risk_level":"low","market_sentiment":"bullish"}"#;
        let v = parse_entry(text);
        assert_eq!(v.decision, Decision::Buy);
        assert_eq!(v.confidence, 0.82);
        assert_eq!(v.suggested_leverage, 15);
        assert_eq!(v.market_sentiment, Trend::Bullish);
    }

    #[test]
    fn test_parse_entry_clips_out_of_range() {
        let text = r#"{"decision":"SELL","confidence":7.5,"suggested_leverage":200,"risk_level":"extreme"}"#;
        let v = parse_entry(text);
        assert_eq!(v.confidence, 1.0);
        assert_eq!(v.suggested_leverage, 50);
        assert_eq!(v.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_parse_entry_keyword_fallback() {
        let v = parse_entry("I would buy here, momentum looks strong.");
        assert_eq!(v.decision, Decision::Buy);
        assert!(v.confidence <= 0.3);
    }

    #[test]
    fn test_fallback_ambiguous_text_holds() {
        let v = parse_entry("You could buy or sell depending on the breakout.");
        assert_eq!(v.decision, Decision::Hold);
    }

    #[test]
    fn test_parse_position_valid() {
        let text = r#"{"action":"CLOSE_50","confidence":0.7,"reasoning":"stalling","risk_level":"high"}"#;
        let v = parse_position(text);
        assert_eq!(v.action, PositionAction::Close50);
        assert_eq!(v.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_parse_position_garbage_holds() {
        let v = parse_position("no json here at all");
        assert_eq!(v.action, PositionAction::Hold);
        assert!(v.confidence <= 0.1);
    }
}
