//! Client for a proxy's admin API.

use registry::BasicAuth;
use reqwest::header::CONTENT_TYPE;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use tokio::time::sleep;

const BASE_DELAY: Duration = Duration::from_millis(500);

const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
    StatusCode::TOO_MANY_REQUESTS,     // 429
    StatusCode::INTERNAL_SERVER_ERROR, // 500
    StatusCode::BAD_GATEWAY,           // 502
    StatusCode::SERVICE_UNAVAILABLE,   // 503
    StatusCode::GATEWAY_TIMEOUT,       // 504
];

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("admin request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("admin API answered {0}")]
    Status(StatusCode),

    #[error("admin API unavailable after {attempts} attempts")]
    RetriesExceeded { attempts: u32 },
}

#[derive(Clone)]
pub struct AdminClient {
    client: reqwest::Client,
    retries: u32,
    base_delay: Duration,
}

impl AdminClient {
    pub fn new(timeout: Duration, retries: u32) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(AdminClient {
            client,
            retries,
            base_delay: BASE_DELAY,
        })
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Current configuration served at `url`.
    pub async fn get_config(&self, url: &str, auth: &BasicAuth) -> Result<Vec<u8>, RemoteError> {
        let response = self.send(|| self.client.get(url), auth).await?;
        Ok(response.bytes().await?.to_vec())
    }

    /// Replaces the configuration at `url` with `body` (JSON).
    pub async fn patch_config(
        &self,
        url: &str,
        auth: &BasicAuth,
        body: Vec<u8>,
    ) -> Result<(), RemoteError> {
        self.send(
            || {
                self.client
                    .patch(url)
                    .header(CONTENT_TYPE, "application/json")
                    .body(body.clone())
            },
            auth,
        )
        .await?;
        Ok(())
    }

    /// Sends the request built by `build`, retrying with exponential backoff
    /// on throttling, server errors, timeouts and refused connections.
    async fn send<F>(&self, build: F, auth: &BasicAuth) -> Result<reqwest::Response, RemoteError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;

        loop {
            let mut request = build();
            if !auth.username.is_empty() {
                request = request.basic_auth(&auth.username, Some(&auth.password));
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if RETRIABLE_STATUS_CODES.contains(&response.status()) => {
                    tracing::debug!(status = %response.status(), retries, "admin API busy");
                    if retries >= self.retries {
                        return Err(RemoteError::RetriesExceeded {
                            attempts: retries + 1,
                        });
                    }
                }
                Ok(response) => return Err(RemoteError::Status(response.status())),
                Err(e) if e.is_timeout() || e.is_connect() => {
                    tracing::debug!(error = %e, retries, "admin API unreachable");
                    if retries >= self.retries {
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }

            sleep(self.base_delay * 2_u32.pow(retries)).await;
            retries += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> AdminClient {
        AdminClient::new(Duration::from_secs(2), 3)
            .unwrap()
            .with_base_delay(Duration::from_millis(5))
    }

    fn auth() -> BasicAuth {
        BasicAuth {
            username: "service".into(),
            password: "pw".into(),
        }
    }

    #[tokio::test]
    async fn test_get_config_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/admin/config/"))
            // base64("service:pw")
            .and(header("authorization", "Basic c2VydmljZTpwdw=="))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"apps\":{}}"))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/admin/config/", server.uri());
        let body = client().get_config(&url, &auth()).await.unwrap();
        assert_eq!(body, b"{\"apps\":{}}");
    }

    #[tokio::test]
    async fn test_retries_transient_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let body = client().get_config(&server.uri(), &auth()).await.unwrap();
        assert_eq!(body, b"{}");
    }

    #[tokio::test]
    async fn test_gives_up_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4)
            .mount(&server)
            .await;

        let err = client().get_config(&server.uri(), &auth()).await.unwrap_err();
        assert!(matches!(err, RemoteError::RetriesExceeded { attempts: 4 }));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let err = client().get_config(&server.uri(), &auth()).await.unwrap_err();
        assert!(matches!(err, RemoteError::Status(StatusCode::UNAUTHORIZED)));
    }

    #[tokio::test]
    async fn test_patch_config_sends_json() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/config/"))
            .and(header("content-type", "application/json"))
            .and(body_string("{\"a\":1}"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let url = format!("{}/config/", server.uri());
        client()
            .patch_config(&url, &auth(), b"{\"a\":1}".to_vec())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_host() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = client()
            .get_config(&format!("http://{addr}/config/"), &auth())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Request(_)));
    }
}
