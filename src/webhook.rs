use std::time::Duration;


const MAX_RETRIES: u32 = 5;


#[derive(Clone, Debug)]
pub struct WebhookNotifier {
    reqwest: reqwest::Client,
    retry_delay: Duration,
}

impl WebhookNotifier {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            reqwest: reqwest::Client::new(),
            retry_delay,
        }
    }

    /// Posts `payload` to `url`, retrying with a linearly growing delay.
    /// Returns whether delivery eventually succeeded.
    pub async fn notify(&self, url: &str, payload: &serde_json::Value) -> bool {
        let mut attempt = 0;
        loop {
            let result = self.reqwest
                .post(url)
                .json(payload)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(_) => return true,
                Err(err) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(
                        url,
                        attempt,
                        error = %err,
                        "Webhook delivery failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(err) => {
                    tracing::warn!(url, error = %err, "Webhook delivery failed, giving up");
                    return false;
                }
            }
        }
    }
}
