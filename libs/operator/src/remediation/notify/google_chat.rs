use crate::remediation::notify::{CompletionOutcome, Notification};

use serde_json::{json, Value};

/// Cards v2 payload for a Google Chat webhook.
pub fn payload(policy_name: &str, notification: &Notification) -> Value {
    let (title, subtitle, body) = match notification {
        Notification::Started { issue, mode } => (
            "Remediation started".to_string(),
            format!("mode: {mode}"),
            issue.to_string(),
        ),
        Notification::Completed {
            issue,
            outcome,
            message,
        } => {
            let title = match outcome {
                CompletionOutcome::Executed => "Remediation complete",
                CompletionOutcome::ManualActionRequired => "Manual action required",
                CompletionOutcome::Failed => "Remediation failed",
            };
            let body = if message.is_empty() {
                issue.to_string()
            } else {
                format!("{issue}\n\n{message}")
            };
            (title.to_string(), format!("policy: {policy_name}"), body)
        }
    };

    json!({
        "cardsV2": [{
            "cardId": format!("dot-ai-remediation-{policy_name}"),
            "card": {
                "header": {"title": title, "subtitle": subtitle},
                "sections": [{
                    "widgets": [{"textParagraph": {"text": body}}]
                }]
            }
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cards_v2_shape() {
        let payload = payload(
            "oom-policy",
            &Notification::Completed {
                issue: "Pod p1 has a OOMKilling event",
                outcome: CompletionOutcome::Executed,
                message: "restarted the pod",
            },
        );
        let card = &payload["cardsV2"][0];
        assert_eq!(card["cardId"], "dot-ai-remediation-oom-policy");
        assert_eq!(card["card"]["header"]["title"], "Remediation complete");
        let text = card["card"]["sections"][0]["widgets"][0]["textParagraph"]["text"]
            .as_str()
            .unwrap();
        assert!(text.contains("restarted the pod"));
    }
}
