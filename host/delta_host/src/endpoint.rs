use delta_host_runtime::{Endpoint, FetchError};
use tracing::debug;

/// Fetches cached messages the client no longer holds from the backend's
/// message endpoint.
pub struct HttpEndpoint {
    client: reqwest::Client,
    server_url: String,
}

impl HttpEndpoint {
    pub fn new(server_url: impl Into<String>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            server_url: server_url.into(),
        })
    }

    fn message_request(&self, hash: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}/message", self.server_url))
            .query(&[("hash", hash)])
    }
}

#[async_trait::async_trait(?Send)]
impl Endpoint for HttpEndpoint {
    async fn fetch_cached_message(&self, hash: &str) -> Result<Vec<u8>, FetchError> {
        debug!(%hash, server_url = %self.server_url, "fetching cached forward message");

        let response = self
            .message_request(hash)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|err| FetchError::new(hash, err.to_string()))?;

        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::new(hash, err.to_string()))?;

        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_url(endpoint: &HttpEndpoint, hash: &str) -> String {
        endpoint
            .message_request(hash)
            .build()
            .expect("request builds")
            .url()
            .to_string()
    }

    #[test]
    fn message_request_carries_hash_as_query() {
        let endpoint = HttpEndpoint::new("http://127.0.0.1:8501").expect("client builds");
        assert_eq!(
            request_url(&endpoint, "abc123"),
            "http://127.0.0.1:8501/message?hash=abc123"
        );
    }

    #[test]
    fn message_request_percent_encodes_hash() {
        let endpoint = HttpEndpoint::new("http://127.0.0.1:8501").expect("client builds");
        assert_eq!(
            request_url(&endpoint, "a/b&c=d"),
            "http://127.0.0.1:8501/message?hash=a%2Fb%26c%3Dd"
        );
    }
}
