//! Best-effort Slack notifications.
//!
//! A failure to notify must never affect the outcome of a backup or
//! restore run, so every error here is swallowed and reported only via a
//! `false` return and a `tracing::warn!`.

use std::time::Duration;

use serde_json::json;

const DEFAULT_TIMEOUT_SECONDS: u64 = 10;

pub async fn send_slack_notification(webhook_url: Option<&str>, message: &str) -> bool {
    let Some(webhook_url) = webhook_url.filter(|url| !url.is_empty()) else {
        return false;
    };

    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            tracing::warn!(error = %err, "failed to build Slack notification client");
            return false;
        }
    };

    let response = client.post(webhook_url).json(&json!({ "text": message })).send().await;

    match response {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            tracing::warn!(status = %response.status(), "Slack notification rejected");
            false
        }
        Err(err) => {
            tracing::warn!(error = %err, "Slack notification request failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_webhook_url_short_circuits() {
        assert!(!send_slack_notification(None, "hello").await);
    }

    #[tokio::test]
    async fn empty_webhook_url_short_circuits() {
        assert!(!send_slack_notification(Some(""), "hello").await);
    }
}
