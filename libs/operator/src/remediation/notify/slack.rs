use crate::remediation::notify::{CompletionOutcome, Notification};

use serde_json::{json, Value};

const COLOR_STARTED: &str = "#439FE0";
const COLOR_SUCCESS: &str = "#36a64f";
const COLOR_WARNING: &str = "#daa038";
const COLOR_FAILURE: &str = "#cc0000";

/// Incoming-webhook payload with one attachment carrying blocks.
pub fn payload(policy_name: &str, channel: Option<&str>, notification: &Notification) -> Value {
    let (color, title, body) = match notification {
        Notification::Started { issue, mode } => (
            COLOR_STARTED,
            format!(":hourglass: Remediation started ({mode})"),
            issue.to_string(),
        ),
        Notification::Completed {
            issue,
            outcome,
            message,
        } => {
            let (color, title) = match outcome {
                CompletionOutcome::Executed => (COLOR_SUCCESS, ":white_check_mark: Remediation complete"),
                CompletionOutcome::ManualActionRequired => {
                    (COLOR_WARNING, ":warning: Manual action required")
                }
                CompletionOutcome::Failed => (COLOR_FAILURE, ":x: Remediation failed"),
            };
            let body = if message.is_empty() {
                issue.to_string()
            } else {
                format!("{issue}\n\n{message}")
            };
            (color, title.to_string(), body)
        }
    };

    let mut payload = json!({
        "attachments": [{
            "color": color,
            "blocks": [
                {
                    "type": "header",
                    "text": {"type": "plain_text", "text": title, "emoji": true}
                },
                {
                    "type": "section",
                    "text": {"type": "mrkdwn", "text": body}
                },
                {
                    "type": "context",
                    "elements": [{"type": "mrkdwn", "text": format!("policy: `{policy_name}`")}]
                }
            ]
        }]
    });
    if let Some(channel) = channel {
        payload["channel"] = json!(channel);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_started_payload_shape() {
        let payload = payload(
            "oom-policy",
            Some("#alerts"),
            &Notification::Started {
                issue: "Pod p1 in namespace default has a OOMKilling event",
                mode: "automatic",
            },
        );
        assert_eq!(payload["channel"], "#alerts");
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], COLOR_STARTED);
        let header = attachment["blocks"][0]["text"]["text"].as_str().unwrap();
        assert!(header.contains("Remediation started"));
    }

    #[test]
    fn test_completed_outcomes_pick_distinct_colors() {
        for (outcome, color) in [
            (CompletionOutcome::Executed, COLOR_SUCCESS),
            (CompletionOutcome::ManualActionRequired, COLOR_WARNING),
            (CompletionOutcome::Failed, COLOR_FAILURE),
        ] {
            let payload = payload(
                "p",
                None,
                &Notification::Completed {
                    issue: "issue",
                    outcome,
                    message: "details",
                },
            );
            assert_eq!(payload["attachments"][0]["color"], color);
            assert!(payload.get("channel").is_none());
        }
    }
}
