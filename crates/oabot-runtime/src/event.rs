use serde_json::Value;

/// Classification of an inbound webhook payload.
///
/// Anything that is not a recognizable text message or follow-state change
/// is `Ignored`: acknowledged to the platform and dropped, so the platform
/// never retries a payload we cannot process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEventKind {
    UserText,
    Follow,
    Unfollow,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub user_id: Option<String>,
    pub text: Option<String>,
    pub kind: InboundEventKind,
}

/// Pulls the user id and message text out of a raw webhook payload.
///
/// Payload shapes vary across platform event versions; the id may sit under
/// `sender`, `user`, or `recipient`, and the text under `message.text`,
/// `message.content.text`, or top-level `text`.
pub fn extract_inbound_event(payload: &Value) -> InboundEvent {
    let user_id = ["sender", "user", "recipient"]
        .iter()
        .find_map(|key| non_empty_str(&payload[*key]["user_id"]));

    let text = non_empty_str(&payload["message"]["text"])
        .or_else(|| non_empty_str(&payload["message"]["content"]["text"]))
        .or_else(|| non_empty_str(&payload["text"]));

    let event_name = payload["event_name"].as_str().unwrap_or_default();
    let kind = match event_name {
        "follow" => InboundEventKind::Follow,
        "unfollow" => InboundEventKind::Unfollow,
        _ => {
            if user_id.is_some() && text.is_some() {
                InboundEventKind::UserText
            } else {
                InboundEventKind::Ignored
            }
        }
    };

    InboundEvent {
        user_id,
        text,
        kind,
    }
}

fn non_empty_str(value: &Value) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}
