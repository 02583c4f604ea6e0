//! Subscription auth signing for private and presence channels.
//!
//! Two modes: local HMAC-SHA256 signing with the app secret, or delegation to
//! a remote auth endpoint. A configured secret always wins over an endpoint.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::types::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// A remote auth endpoint plus the headers to send with each request.
#[derive(Debug, Clone)]
pub struct AuthEndpoint {
    pub url: String,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: String,
}

/// Produces `"{app_key}:{hmac_hex}"` auth tokens for channel subscriptions.
pub struct AuthSigner {
    app_key: String,
    secret: Option<String>,
    endpoint: Option<AuthEndpoint>,
    http: reqwest::Client,
}

impl AuthSigner {
    pub fn new(app_key: String, secret: Option<String>, endpoint: Option<AuthEndpoint>) -> Self {
        AuthSigner {
            app_key,
            secret,
            endpoint,
            http: reqwest::Client::new(),
        }
    }

    /// Sign a subscription to `channel` for the connection identified by
    /// `socket_id`. `user_data` is present only for presence channels.
    pub async fn sign(
        &self,
        channel: &str,
        socket_id: &str,
        user_data: Option<&Value>,
    ) -> Result<String> {
        if let Some(secret) = &self.secret {
            self.sign_local(secret, channel, socket_id, user_data)
        } else if let Some(endpoint) = &self.endpoint {
            self.sign_remote(endpoint, channel, socket_id, user_data).await
        } else {
            Err(Error::SigningNotConfigured)
        }
    }

    fn sign_local(
        &self,
        secret: &str,
        channel: &str,
        socket_id: &str,
        user_data: Option<&Value>,
    ) -> Result<String> {
        let subject = match user_data {
            Some(data) => format!("{socket_id}:{channel}:{}", serde_json::to_string(data)?),
            None => format!("{socket_id}:{channel}"),
        };
        // HMAC-SHA256 accepts keys of any length, so this cannot fail.
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return Err(Error::SigningNotConfigured);
        };
        mac.update(subject.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());
        Ok(format!("{}:{digest}", self.app_key))
    }

    async fn sign_remote(
        &self,
        endpoint: &AuthEndpoint,
        channel: &str,
        socket_id: &str,
        user_data: Option<&Value>,
    ) -> Result<String> {
        let mut form = vec![
            ("channel_name", channel.to_string()),
            ("socket_id", socket_id.to_string()),
        ];
        if let Some(data) = user_data {
            form.push(("user_data", serde_json::to_string(data)?));
        }

        let mut req = self.http.post(&endpoint.url).form(&form);
        for (name, value) in &endpoint.headers {
            req = req.header(name, value);
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if status != 200 {
            return Err(Error::AuthEndpoint { status });
        }
        let body: AuthResponse = resp.json().await?;
        Ok(body.auth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn local_signer() -> AuthSigner {
        AuthSigner::new("key".to_string(), Some("s".to_string()), None)
    }

    #[tokio::test]
    async fn private_channel_signature() {
        let token = local_signer()
            .sign("private-foo", "123.456", None)
            .await
            .unwrap();
        // HMAC-SHA256("s", "123.456:private-foo")
        assert_eq!(
            token,
            "key:66cb118507a24355dbdbb3e8c9dab74e687912a8f6874499439874024f45b878"
        );
    }

    #[tokio::test]
    async fn presence_channel_signature_includes_user_data() {
        let token = local_signer()
            .sign("presence-foo", "123.456", Some(&json!({})))
            .await
            .unwrap();
        // HMAC-SHA256("s", "123.456:presence-foo:{}")
        assert_eq!(
            token,
            "key:2688b48b88849f21768d165822069b93dda9865b094c3e035fc38c2a76858561"
        );

        let token = local_signer()
            .sign("presence-foo", "123.456", Some(&json!({"user_id": "u1"})))
            .await
            .unwrap();
        // HMAC-SHA256("s", "123.456:presence-foo:{\"user_id\":\"u1\"}")
        assert_eq!(
            token,
            "key:06953efefc68df992b811408a1650560f7d573445f4bcd8e3e4e792eec636c01"
        );
    }

    #[tokio::test]
    async fn secret_takes_precedence_over_endpoint() {
        let signer = AuthSigner::new(
            "key".to_string(),
            Some("s".to_string()),
            Some(AuthEndpoint {
                // Nothing listens here; local signing must not touch it.
                url: "http://127.0.0.1:1/auth".to_string(),
                headers: HashMap::new(),
            }),
        );
        let token = signer.sign("private-foo", "123.456", None).await.unwrap();
        assert!(token.starts_with("key:"));
    }

    #[tokio::test]
    async fn unconfigured_signer_errors() {
        let signer = AuthSigner::new("key".to_string(), None, None);
        let err = signer.sign("private-foo", "1.1", None).await.unwrap_err();
        assert!(matches!(err, Error::SigningNotConfigured));
    }

    #[tokio::test]
    async fn remote_endpoint_posts_form_and_parses_auth() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/pusher/auth")
                .header("x-api-key", "k1")
                .body_contains("channel_name=private-foo")
                .body_contains("socket_id=9.9");
            then.status(200)
                .json_body(serde_json::json!({"auth": "key:deadbeef"}));
        });

        let mut headers = HashMap::new();
        headers.insert("x-api-key".to_string(), "k1".to_string());
        let signer = AuthSigner::new(
            "key".to_string(),
            None,
            Some(AuthEndpoint {
                url: server.url("/pusher/auth"),
                headers,
            }),
        );

        let token = signer.sign("private-foo", "9.9", None).await.unwrap();
        assert_eq!(token, "key:deadbeef");
        mock.assert();
    }

    #[tokio::test]
    async fn remote_endpoint_non_200_is_an_error() {
        use httpmock::prelude::*;

        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/pusher/auth");
            then.status(403).body("forbidden");
        });

        let signer = AuthSigner::new(
            "key".to_string(),
            None,
            Some(AuthEndpoint {
                url: server.url("/pusher/auth"),
                headers: HashMap::new(),
            }),
        );

        let err = signer.sign("private-foo", "9.9", None).await.unwrap_err();
        assert!(matches!(err, Error::AuthEndpoint { status: 403 }));
    }
}
