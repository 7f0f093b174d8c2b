use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

use ads_confirmations::tokens::{Base64Encoding, BlindedToken};
use ads_confirmations::transport::{
    CredentialsRequest, PaymentPayload, PaymentRequest, SignedCredentials,
};
use ads_confirmations::Issuers;

use crate::config::IssuerConfig;
use crate::error::{IssuerError, Result};
use crate::signer::IssuerSigner;
use crate::spent::{hash_preimage, SpentTokenStore};

const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct IssuerState {
    pub config: IssuerConfig,
    pub signer: IssuerSigner,
    /// Blinded tokens per submitted batch id
    batches: RwLock<HashMap<String, Vec<BlindedToken>>>,
    /// Preimage hashes accepted per payment id, so a resent payment is acknowledged
    payments: RwLock<HashMap<String, Vec<[u8; 32]>>>,
    spent: RwLock<SpentTokenStore>,
}

impl IssuerState {
    pub fn new(config: IssuerConfig) -> anyhow::Result<Self> {
        let signer = IssuerSigner::new_or_load(&config.key_path, &config.name, config.valid_days)?;
        let spent = match &config.spent_store_path {
            Some(path) => SpentTokenStore::load(path.clone())?,
            None => SpentTokenStore::in_memory(),
        };
        Ok(Self::with_parts(config, signer, spent))
    }

    pub fn with_parts(config: IssuerConfig, signer: IssuerSigner, spent: SpentTokenStore) -> Self {
        Self {
            config,
            signer,
            batches: RwLock::new(HashMap::new()),
            payments: RwLock::new(HashMap::new()),
            spent: RwLock::new(spent),
        }
    }

    pub async fn spent_count(&self) -> usize {
        self.spent.read().await.len()
    }
}

/// Issuer routes without the rate limiter, which needs the peer address.
pub fn routes(state: Arc<IssuerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(get_info))
        .route(
            "/credentials/:batch_id",
            post(submit_credentials).get(get_credentials),
        )
        .route("/payments/:payment_id", post(redeem_payment))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

pub fn app(state: Arc<IssuerState>) -> anyhow::Result<Router> {
    let governor_conf = GovernorConfigBuilder::default()
        .per_millisecond(state.config.rate_limit_replenish_ms)
        .burst_size(state.config.rate_limit_burst)
        .key_extractor(tower_governor::key_extractor::SmartIpKeyExtractor)
        .finish()
        .ok_or_else(|| anyhow::anyhow!("Invalid rate limit configuration"))?;

    Ok(routes(state)
        .layer(GovernorLayer {
            config: Arc::new(governor_conf),
        })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()))
}

pub async fn run(state: Arc<IssuerState>) -> anyhow::Result<()> {
    let app = app(state.clone())?;
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(
        "Issuer listening on {} (burst {} req per IP)",
        addr, state.config.rate_limit_burst
    );

    serve(listener, app).await
}

/// Serves with peer addresses attached, which the rate limiter keys on.
pub async fn serve(listener: tokio::net::TcpListener, app: Router) -> anyhow::Result<()> {
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn get_info(State(state): State<Arc<IssuerState>>) -> Json<Issuers> {
    Json(state.signer.catalog())
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| IssuerError::InvalidRequest(e.to_string()))
}

async fn submit_credentials(
    State(state): State<Arc<IssuerState>>,
    Path(batch_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    let request: CredentialsRequest = parse_body(&body)?;

    let mut batches = state.batches.write().await;
    match batches.get(&batch_id) {
        Some(existing) if existing != &request.blinded_tokens => {
            warn!("Batch {} resubmitted with different tokens", batch_id);
            Err(IssuerError::BatchConflict(batch_id))
        }
        Some(_) => Ok(StatusCode::CREATED),
        None => {
            info!(
                "Accepted {} confirmation {} for {} ({} tokens)",
                request.confirmation_type,
                batch_id,
                request.creative_instance_id,
                request.blinded_tokens.len()
            );
            batches.insert(batch_id, request.blinded_tokens);
            Ok(StatusCode::CREATED)
        }
    }
}

async fn get_credentials(
    State(state): State<Arc<IssuerState>>,
    Path(batch_id): Path<String>,
) -> Result<Json<SignedCredentials>> {
    let blinded = state
        .batches
        .read()
        .await
        .get(&batch_id)
        .cloned()
        .ok_or_else(|| IssuerError::UnknownBatch(batch_id.clone()))?;

    let (signed, proof) = state.signer.sign_batch(&blinded)?;
    debug!("Signed {} tokens for batch {}", signed.len(), batch_id);

    Ok(Json(SignedCredentials {
        signed_tokens: signed.iter().map(|token| token.encode_base64()).collect(),
        proof: proof.encode_base64(),
        public_key: state.signer.public_key().encode_base64(),
    }))
}

async fn redeem_payment(
    State(state): State<Arc<IssuerState>>,
    Path(payment_id): Path<String>,
    body: Bytes,
) -> Result<StatusCode> {
    let request: PaymentRequest = parse_body(&body)?;
    let payload: PaymentPayload = serde_json::from_str(&request.payload)
        .map_err(|e| IssuerError::InvalidRequest(format!("Invalid payload: {}", e)))?;
    if payload.payment_id != payment_id {
        return Err(IssuerError::InvalidRequest(
            "payload does not match payment id".into(),
        ));
    }
    if request.payment_credentials.is_empty() {
        return Err(IssuerError::InvalidRequest("no payment credentials".into()));
    }

    let mut hashes = Vec::with_capacity(request.payment_credentials.len());
    for credential in &request.payment_credentials {
        state.signer.verify_spend(
            &credential.t,
            &credential.public_key,
            &credential.signature,
            request.payload.as_bytes(),
        )?;
        hashes.push(hash_preimage(&credential.t));
    }

    // spent set and payment ledger move together
    let mut payments = state.payments.write().await;
    if payments.get(&payment_id) == Some(&hashes) {
        debug!("Payment {} resent, already accepted", payment_id);
        return Ok(StatusCode::OK);
    }

    state.spent.write().await.spend_all(&hashes)?;
    payments.insert(payment_id.clone(), hashes);
    info!(
        "Redeemed payment {} ({} tokens)",
        payment_id,
        request.payment_credentials.len()
    );
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ads_confirmations::tokens::{PublicKey, SignedToken, SigningKey, Token, UnblindedToken};
    use ads_confirmations::transport::PaymentCredential;
    use ads_confirmations::ConfirmationType;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tower::ServiceExt;

    fn state() -> Arc<IssuerState> {
        Arc::new(IssuerState::with_parts(
            IssuerConfig::default().with_spent_store_path(None),
            IssuerSigner::new(SigningKey::random(), "0.05BAT", 30),
            SpentTokenStore::in_memory(),
        ))
    }

    async fn call(
        state: &Arc<IssuerState>,
        method: Method,
        uri: &str,
        body: Option<String>,
    ) -> (StatusCode, Vec<u8>) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .unwrap();
        let response = routes(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    fn credentials_body(tokens: &[Token]) -> String {
        serde_json::to_string(&CredentialsRequest {
            blinded_tokens: tokens.iter().map(|t| t.blind().0).collect(),
            confirmation_type: ConfirmationType::Viewed,
            creative_instance_id: "creative-1".into(),
        })
        .unwrap()
    }

    /// Issues one token through the credentials flow and returns its unblinded form.
    async fn issue(state: &Arc<IssuerState>, batch_id: &str) -> UnblindedToken {
        let token = Token::random();
        let uri = format!("/credentials/{}", batch_id);
        let body = credentials_body(&[token.clone()]);
        let (status, _) = call(state, Method::POST, &uri, Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(state, Method::GET, &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        let credentials: SignedCredentials = serde_json::from_slice(&body).unwrap();
        let signed = SignedToken::decode_base64(&credentials.signed_tokens[0]).unwrap();
        token.unblind(&signed)
    }

    fn payment_body(payment_id: &str, tokens: &[UnblindedToken], public_key: PublicKey) -> String {
        let payload = serde_json::to_string(&PaymentPayload {
            payment_id: payment_id.into(),
        })
        .unwrap();
        let payment_credentials = tokens
            .iter()
            .map(|token| PaymentCredential {
                t: token.preimage().clone(),
                public_key,
                signature: token.derive_verification_key().sign(payload.as_bytes()),
            })
            .collect();
        serde_json::to_string(&PaymentRequest {
            payload,
            payment_credentials,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(&state(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8(body).unwrap().contains("\"ok\""));
    }

    #[tokio::test]
    async fn test_info_publishes_catalog() {
        let state = state();
        let (status, body) = call(&state, Method::GET, "/info", None).await;
        assert_eq!(status, StatusCode::OK);

        let issuers: Issuers = serde_json::from_slice(&body).unwrap();
        assert_eq!(issuers.estimated_redemption_value(&state.signer.public_key()), 0.05);
    }

    #[tokio::test]
    async fn test_resubmitted_batch_is_idempotent_but_conflicting_one_is_not() {
        let state = state();
        let tokens = vec![Token::random()];
        let body = credentials_body(&tokens);

        let (first, _) = call(&state, Method::POST, "/credentials/b-1", Some(body.clone())).await;
        let (again, _) = call(&state, Method::POST, "/credentials/b-1", Some(body)).await;
        let (conflict, error) = call(
            &state,
            Method::POST,
            "/credentials/b-1",
            Some(credentials_body(&[Token::random()])),
        )
        .await;

        assert_eq!(first, StatusCode::CREATED);
        assert_eq!(again, StatusCode::CREATED);
        assert_eq!(conflict, StatusCode::CONFLICT);
        assert!(String::from_utf8(error).unwrap().contains("\"success\":false"));
    }

    #[tokio::test]
    async fn test_malformed_base64_is_bad_request() {
        let body = r#"{"blindedTokens":["%%%"],"confirmationType":"view","creativeInstanceId":"c"}"#;
        let (status, _) = call(&state(), Method::POST, "/credentials/b-1", Some(body.into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_batch_is_not_found() {
        let (status, _) = call(&state(), Method::GET, "/credentials/missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_payment_spends_once() {
        let state = state();
        let token = issue(&state, "b-1").await;
        let public_key = state.signer.public_key();

        let body = payment_body("p-1", &[token.clone()], public_key);
        let (status, _) = call(&state, Method::POST, "/payments/p-1", Some(body.clone())).await;
        assert_eq!(status, StatusCode::OK);

        // same payment resent after a lost response
        let (status, _) = call(&state, Method::POST, "/payments/p-1", Some(body)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &state,
            Method::POST,
            "/payments/p-2",
            Some(payment_body("p-2", &[token], public_key)),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(state.spent_count().await, 1);
        println!("✓ Double spend rejected");
    }

    #[tokio::test]
    async fn test_payment_with_forged_token_is_unauthorized() {
        let state = state();
        let public_key = state.signer.public_key();
        // signed by some other key, so the issuer re-derives a different token
        let token = Token::random();
        let forged = token.unblind(&SigningKey::random().sign(&token.blind().0));

        let (status, _) = call(
            &state,
            Method::POST,
            "/payments/p-1",
            Some(payment_body("p-1", &[forged], public_key)),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(state.spent_count().await, 0);
    }

    #[tokio::test]
    async fn test_payment_id_must_match_payload() {
        let state = state();
        let token = issue(&state, "b-1").await;
        let body = payment_body("p-1", &[token], state.signer.public_key());

        let (status, _) = call(&state, Method::POST, "/payments/other", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
