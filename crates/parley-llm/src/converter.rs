use serde_json::{json, Value};

use parley_core::context::{LlmRequest, Turn, TurnRole};
use parley_core::history::ContentPart;

/// Build the JSON body for `streamGenerateContent`.
pub fn build_request_body(request: &LlmRequest) -> Value {
    let mut body = json!({
        "contents": convert_turns(&request.turns),
    });

    if let Some(system) = request.system_instruction.as_deref().filter(|s| !s.is_empty()) {
        body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
    }

    let opts = &request.options;
    let mut config = serde_json::Map::new();
    if let Some(t) = opts.temperature {
        config.insert("temperature".into(), json!(t));
    }
    if let Some(n) = opts.max_output_tokens {
        config.insert("maxOutputTokens".into(), json!(n));
    }
    if !opts.stop_sequences.is_empty() {
        config.insert("stopSequences".into(), json!(opts.stop_sequences));
    }
    if !config.is_empty() {
        body["generationConfig"] = Value::Object(config);
    }

    body
}

/// Build the JSON body for `countTokens` over a single user turn.
pub fn build_count_body(parts: &[ContentPart]) -> Value {
    json!({
        "contents": [{ "role": "user", "parts": convert_parts(parts) }],
    })
}

/// Consecutive turns with the same role are merged; the API rejects
/// back-to-back user turns.
fn convert_turns(turns: &[Turn]) -> Vec<Value> {
    let mut out: Vec<(TurnRole, Vec<Value>)> = Vec::new();
    for turn in turns {
        let parts = convert_parts(&turn.parts);
        if parts.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some((role, existing)) if *role == turn.role => existing.extend(parts),
            _ => out.push((turn.role, parts)),
        }
    }
    out.into_iter()
        .map(|(role, parts)| {
            let role = match role {
                TurnRole::User => "user",
                TurnRole::Model => "model",
            };
            json!({ "role": role, "parts": parts })
        })
        .collect()
}

/// Media with a known mime type is sent as a file reference; without one
/// the model only sees a textual pointer.
fn convert_parts(parts: &[ContentPart]) -> Vec<Value> {
    parts
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } if text.is_empty() => None,
            ContentPart::Text { text } => Some(json!({ "text": text })),
            ContentPart::Media { url, mime: Some(mime), .. } => {
                Some(json!({ "fileData": { "mimeType": mime, "fileUri": url } }))
            }
            ContentPart::Media { kind, url, mime: None } => {
                Some(json!({ "text": format!("[{kind}: {url}]") }))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use parley_core::context::GenerationOptions;
    use parley_core::events::MediaKind;

    fn turn(role: TurnRole, text: &str) -> Turn {
        Turn {
            role,
            parts: vec![ContentPart::text(text)],
        }
    }

    #[test]
    fn turns_convert_with_roles() {
        let req = LlmRequest {
            system_instruction: None,
            turns: vec![turn(TurnRole::User, "hi"), turn(TurnRole::Model, "hello")],
            options: GenerationOptions::default(),
        };
        let body = build_request_body(&req);
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
        assert_eq!(body["contents"][1]["parts"][0]["text"], "hello");
        assert!(body.get("systemInstruction").is_none());
        assert!(body.get("generationConfig").is_none());
    }

    #[test]
    fn consecutive_user_turns_merged() {
        let req = LlmRequest {
            system_instruction: None,
            turns: vec![turn(TurnRole::User, "a"), turn(TurnRole::User, "b")],
            options: GenerationOptions::default(),
        };
        let body = build_request_body(&req);
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 1);
        assert_eq!(contents[0]["parts"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn system_and_generation_config() {
        let req = LlmRequest {
            system_instruction: Some("be brief".into()),
            turns: vec![turn(TurnRole::User, "x")],
            options: GenerationOptions {
                max_output_tokens: Some(512),
                temperature: Some(0.7),
                stop_sequences: vec!["[/tool]".into()],
            },
        };
        let body = build_request_body(&req);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(body["generationConfig"]["stopSequences"][0], "[/tool]");
    }

    #[test]
    fn media_parts() {
        let parts = vec![
            ContentPart::Media {
                kind: MediaKind::Image,
                url: "https://cdn/a.jpg".into(),
                mime: Some("image/jpeg".into()),
            },
            ContentPart::Media {
                kind: MediaKind::File,
                url: "https://cdn/b.bin".into(),
                mime: None,
            },
        ];
        let body = build_count_body(&parts);
        let out = &body["contents"][0]["parts"];
        assert_eq!(out[0]["fileData"]["mimeType"], "image/jpeg");
        assert_eq!(out[1]["text"], "[file: https://cdn/b.bin]");
    }

    #[test]
    fn empty_text_parts_dropped() {
        let req = LlmRequest {
            system_instruction: Some(String::new()),
            turns: vec![turn(TurnRole::User, "")],
            options: GenerationOptions::default(),
        };
        let body = build_request_body(&req);
        assert!(body["contents"].as_array().unwrap().is_empty());
        assert!(body.get("systemInstruction").is_none());
    }
}
