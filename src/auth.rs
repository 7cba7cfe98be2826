use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::metrics::GatewayMetrics;

pub const DNS_TOKEN_TYPE: &str = "dns_token";
const BEARER_PREFIX: &str = "Bearer ";
const ALLOW_HEADERS: &str = "content-type,Authorization";
const TOKEN_LIFETIME_HOURS: i64 = 2;

/// Only `type` and the time fields are load-bearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing or malformed Authorization header")]
    MalformedHeader,
    #[error("token verification failed: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("token type {0:?} is not accepted")]
    WrongType(Option<String>),
}

/// RS256 verifier bound to one public key and one accepted token type.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
    token_type: String,
}

impl JwtVerifier {
    pub fn from_pem(pem: &[u8], token_type: impl Into<String>) -> Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem).context("Invalid RSA public key")?;
        Ok(Self {
            key,
            validation: Validation::new(Algorithm::RS256),
            token_type: token_type.into(),
        })
    }

    /// Read the public key once at startup; a missing key is fatal.
    pub fn load(path: &Path, token_type: impl Into<String>) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("Unable to read JWT public key at {}", path.display()))?;
        let verifier = Self::from_pem(&pem, token_type)
            .with_context(|| format!("Unable to load JWT public key at {}", path.display()))?;
        info!(path = %path.display(), "Loaded JWT public key");
        Ok(verifier)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let claims = decode::<Claims>(token, &self.key, &self.validation)?.claims;
        if claims.token_type.as_deref() != Some(self.token_type.as_str()) {
            return Err(AuthError::WrongType(claims.token_type));
        }
        Ok(claims)
    }

    pub fn verify_headers(&self, headers: &HeaderMap) -> Result<Claims, AuthError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .ok_or(AuthError::MalformedHeader)?;
        self.verify(token.trim())
    }
}

/// State for the axum middleware guarding the DoH routes.
#[derive(Clone)]
pub struct AuthGate {
    verifier: Arc<JwtVerifier>,
    metrics: Arc<GatewayMetrics>,
}

impl AuthGate {
    pub fn new(verifier: JwtVerifier, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            verifier: Arc::new(verifier),
            metrics,
        }
    }
}

pub async fn require_token(State(gate): State<AuthGate>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::OK.into_response();
        apply_cors(response.headers_mut());
        return response;
    }

    if let Err(err) = gate.verifier.verify_headers(request.headers()) {
        gate.metrics.inc_auth_rejection();
        let request_id = Uuid::new_v4();
        warn!(request_id = %request_id, error = %err, "Rejected DoH request");
        let mut response = (
            StatusCode::UNAUTHORIZED,
            format!("Error (request id: {request_id})"),
        )
            .into_response();
        apply_cors(response.headers_mut());
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert("x-request-id", value);
        }
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors(response.headers_mut());
    response
}

fn apply_cors(headers: &mut HeaderMap) {
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
}

/// Signs short-lived `dns_token` credentials with the matching private key.
pub struct TokenIssuer {
    key: EncodingKey,
    token_type: String,
}

impl TokenIssuer {
    pub fn from_pem(pem: &[u8], token_type: impl Into<String>) -> Result<Self> {
        Ok(Self {
            key: EncodingKey::from_rsa_pem(pem).context("Invalid RSA private key")?,
            token_type: token_type.into(),
        })
    }

    pub fn load(path: &Path, token_type: impl Into<String>) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("Unable to read JWT private key at {}", path.display()))?;
        Self::from_pem(&pem, token_type)
    }

    pub fn issue(&self) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            token_type: Some(self.token_type.clone()),
            id: Some(Uuid::new_v4().to_string()),
            iat: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_LIFETIME_HOURS)).timestamp(),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::RS256), claims, &self.key).context("Failed to sign token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, middleware, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const PUBLIC_KEY: &str = include_str!("../tests/fixtures/jwt/gateway.key.pub");
    const PRIVATE_KEY: &str = include_str!("../tests/fixtures/jwt/gateway.key");
    const ROGUE_KEY: &str = include_str!("../tests/fixtures/jwt/rogue.key");

    fn verifier() -> JwtVerifier {
        JwtVerifier::from_pem(PUBLIC_KEY.as_bytes(), DNS_TOKEN_TYPE).expect("public key")
    }

    fn issuer(pem: &str) -> TokenIssuer {
        TokenIssuer::from_pem(pem.as_bytes(), DNS_TOKEN_TYPE).expect("private key")
    }

    fn app(metrics: Arc<GatewayMetrics>) -> Router {
        let gate = AuthGate::new(verifier(), metrics);
        Router::new()
            .route("/dns-query", get(|| async { "resolved" }))
            .layer(middleware::from_fn_with_state(gate, require_token))
    }

    fn get_with(token: Option<&str>) -> axum::http::Request<Body> {
        let mut builder = axum::http::Request::builder().uri("/dns-query");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, token);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn issued_tokens_verify() {
        let token = issuer(PRIVATE_KEY).issue().expect("token");
        let claims = verifier().verify(&token).expect("valid");
        assert_eq!(claims.token_type.as_deref(), Some(DNS_TOKEN_TYPE));
        assert_eq!(claims.exp - claims.iat, 2 * 3600);
        assert!(claims.id.is_some());
    }

    #[test]
    fn wrongly_signed_token_is_rejected() {
        let token = issuer(ROGUE_KEY).issue().expect("token");
        assert!(matches!(verifier().verify(&token), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn token_without_type_claim_is_rejected() {
        let now = Utc::now().timestamp();
        let token = issuer(PRIVATE_KEY)
            .sign(&Claims {
                token_type: None,
                id: None,
                iat: now,
                exp: now + 600,
            })
            .expect("token");
        assert!(matches!(verifier().verify(&token), Err(AuthError::WrongType(None))));

        let token = issuer(PRIVATE_KEY)
            .sign(&Claims {
                token_type: Some("admin_token".into()),
                id: None,
                iat: now,
                exp: now + 600,
            })
            .expect("token");
        assert!(matches!(verifier().verify(&token), Err(AuthError::WrongType(Some(_)))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let now = Utc::now().timestamp();
        let token = issuer(PRIVATE_KEY)
            .sign(&Claims {
                token_type: Some(DNS_TOKEN_TYPE.into()),
                id: None,
                iat: now - 7200,
                exp: now - 3600,
            })
            .expect("token");
        assert!(verifier().verify(&token).is_err());
    }

    #[tokio::test]
    async fn valid_bearer_passes_through_unchanged() {
        let token = issuer(PRIVATE_KEY).issue().expect("token");
        let response = app(Arc::new(GatewayMetrics::new().unwrap()))
            .oneshot(get_with(Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"resolved");
    }

    #[tokio::test]
    async fn rejections_carry_a_request_id_and_skip_the_handler() {
        let metrics = Arc::new(GatewayMetrics::new().unwrap());
        let token = issuer(PRIVATE_KEY).issue().expect("token");
        let rogue = issuer(ROGUE_KEY).issue().expect("token");

        for header_value in [None, Some(token.clone()), Some(format!("Bearer {rogue}"))] {
            let response = app(metrics.clone())
                .oneshot(get_with(header_value.as_deref()))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            let request_id = response.headers()["x-request-id"]
                .to_str()
                .unwrap()
                .to_string();
            let body = response.into_body().collect().await.unwrap().to_bytes();
            let body = String::from_utf8(body.to_vec()).unwrap();
            assert_eq!(body, format!("Error (request id: {request_id})"));
        }
    }

    #[tokio::test]
    async fn preflight_short_circuits_with_cors_headers() {
        let request = axum::http::Request::builder()
            .method(Method::OPTIONS)
            .uri("/dns-query")
            .body(Body::empty())
            .unwrap();
        let response = app(Arc::new(GatewayMetrics::new().unwrap()))
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_HEADERS],
            ALLOW_HEADERS
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }
}
