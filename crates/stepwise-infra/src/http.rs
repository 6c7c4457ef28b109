//! Outbound HTTP caller backed by reqwest.
//!
//! Transport failures are discriminated into timeout vs network here so the
//! orchestration core can match them against retryable error codes without
//! knowing about reqwest.

use std::time::Duration;

use stepwise_core::repository::{HttpCallError, HttpCaller, HttpRequest, HttpResponse};
use tracing::debug;

/// reqwest-backed implementation of `HttpCaller`.
///
/// One shared client; per-request timeouts come from the step config.
#[derive(Clone)]
pub struct ReqwestHttpCaller {
    client: reqwest::Client,
}

impl ReqwestHttpCaller {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpCaller {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpCaller for ReqwestHttpCaller {
    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, HttpCallError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| HttpCallError::Network(format!("invalid method: {}", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(Duration::from_secs(request.timeout_secs));

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %request.url, "outbound http call");

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                HttpCallError::Timeout(request.timeout_secs)
            } else {
                HttpCallError::Network(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                HttpCallError::Timeout(request.timeout_secs)
            } else {
                HttpCallError::Network(e.to_string())
            }
        })?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn invalid_method_is_a_network_error() {
        let caller = ReqwestHttpCaller::new();
        let err = caller
            .call(HttpRequest {
                method: "NOT A METHOD".to_string(),
                url: "http://localhost/".to_string(),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, HttpCallError::Network(_)));
        assert_eq!(err.code(), "NETWORK_ERROR");
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let caller = ReqwestHttpCaller::new();
        // Reserved TEST-NET-1 address, nothing listens there.
        let err = caller
            .call(HttpRequest {
                method: "GET".to_string(),
                url: "http://192.0.2.1:9/".to_string(),
                headers: HashMap::new(),
                body: None,
                timeout_secs: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HttpCallError::Network(_) | HttpCallError::Timeout(_)
        ));
    }
}
