use anyhow::{Context, Result};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Method, Request, StatusCode, header},
    response::Response,
    routing::get,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use secrecy::SecretString;
use serde_json::{Value, json};
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tower::ServiceExt;
use uuid::Uuid;
use zerogate::{
    api::{self, AppState, GatewayConfig, handlers::auth::hash_password},
    factor::{CertificateAuthority, EngineSettings, Factor, FactorEngine, hardware, ssh},
    store::{FactorRecord, MemoryStore, Store, User},
};

const APP_ID: &str = "https://gateway.test";
const PASSWORD: &str = "correct horse battery staple";

struct Gateway {
    app: Router,
    store: Arc<MemoryStore>,
}

impl Gateway {
    fn new(config: GatewayConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());
        let engine = FactorEngine::new(
            EngineSettings::new(APP_ID),
            CertificateAuthority::generate()?,
        );
        let state = AppState::new(config, store.clone(), engine);
        Ok(Self {
            app: api::router(state),
            store,
        })
    }

    fn unlimited() -> Result<Self> {
        Self::new(
            GatewayConfig::new()
                .with_cookie_secure(false)
                .with_rate_limit(0, Duration::from_secs(60)),
        )
    }

    async fn send(&self, request: Request<Body>) -> Result<Response> {
        Ok(self.app.clone().oneshot(request).await?)
    }

    async fn add_user(&self, username: &str, is_admin: bool) -> Result<User> {
        let user = User {
            id: Uuid::now_v7(),
            username: username.to_string(),
            password_hash: hash_password(&SecretString::from(PASSWORD))?,
            is_admin,
            created_at: Utc::now(),
        };
        self.store.insert_user(&user).await?;
        Ok(user)
    }

    async fn add_hardware_key(&self, user: &User, signing: &SigningKey) -> Result<FactorRecord> {
        let record = FactorRecord {
            id: Uuid::new_v4(),
            user_id: user.id,
            name: "yubikey".to_string(),
            factor: Factor::HardwareKey {
                key_handle: URL_SAFE_NO_PAD.encode(Uuid::new_v4().as_bytes()),
                public_key: URL_SAFE_NO_PAD.encode(signing.verifying_key().as_bytes()),
                counter: 0,
            },
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.store.insert_factor(&record).await?;
        Ok(record)
    }

    async fn login(&self, username: &str) -> Result<(Value, String)> {
        let response = self
            .send(json_request(
                Method::POST,
                "/auth/session",
                None,
                &json!({ "username": username, "password": PASSWORD }),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await?;
        let token = body["token"]
            .as_str()
            .context("login response without token")?
            .to_string();
        Ok((body, token))
    }

    /// Password plus hardware key; returns the session token.
    async fn full_login(
        &self,
        username: &str,
        record: &FactorRecord,
        signing: &SigningKey,
        counter: u32,
    ) -> Result<String> {
        let (_, token) = self.login(username).await?;
        let (challenge_id, answer) = self
            .hardware_answer(&token, record, signing, counter)
            .await?;
        let response = self
            .send(json_request(
                Method::POST,
                "/auth/secondary",
                Some(&token),
                &json!({ "challenge_id": challenge_id, "response": answer }),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        Ok(token)
    }

    async fn hardware_answer(
        &self,
        token: &str,
        record: &FactorRecord,
        signing: &SigningKey,
        counter: u32,
    ) -> Result<(String, Value)> {
        let response = self
            .send(empty_request(
                Method::GET,
                "/auth/secondary?factor=hardware_key",
                Some(token),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let challenge = body_json(response).await?;
        let nonce = challenge["nonce"].as_str().context("nonce missing")?;
        let challenge_id = challenge["challenge_id"]
            .as_str()
            .context("challenge_id missing")?
            .to_string();

        let Factor::HardwareKey { key_handle, .. } = &record.factor else {
            anyhow::bail!("not a hardware key");
        };
        let payload = hardware::sign_payload(APP_ID, counter, nonce);
        let answer = json!({
            "kind": "hardware_key",
            "key_handle": key_handle,
            "counter": counter,
            "signature": URL_SAFE_NO_PAD.encode(signing.sign(&payload).to_bytes()),
        });
        Ok((challenge_id, answer))
    }

    async fn csrf_token(&self, token: &str) -> Result<String> {
        let response = self
            .send(empty_request(Method::GET, "/csrf", Some(token))?)
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await?;
        Ok(body["csrf_token"]
            .as_str()
            .context("csrf_token missing")?
            .to_string())
    }
}

fn empty_request(method: Method, uri: &str, token: Option<&str>) -> Result<Request<Body>> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    Ok(builder.body(Body::empty())?)
}

fn json_request(
    method: Method,
    uri: &str,
    token: Option<&str>,
    body: &Value,
) -> Result<Request<Body>> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    Ok(builder.body(Body::from(serde_json::to_vec(body)?))?)
}

async fn body_json(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[tokio::test]
async fn password_then_hardware_key_promotes_once() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    let user = gateway.add_user("alice", false).await?;
    let signing = SigningKey::generate(&mut OsRng);
    let record = gateway.add_hardware_key(&user, &signing).await?;

    let response = gateway
        .send(json_request(
            Method::POST,
            "/auth/session",
            None,
            &json!({ "username": "Alice", "password": PASSWORD }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(cookie.starts_with("zerogate_session="));
    assert!(cookie.contains("HttpOnly"));
    let body = body_json(response).await?;
    assert_eq!(body["tier"], "primary");
    assert_eq!(body["secondary"], true);
    assert_eq!(body["factors"], json!(["hardware_key"]));
    let token = body["token"].as_str().context("token missing")?;

    // Still below fully_authenticated: the device list is out of reach.
    let response = gateway
        .send(empty_request(Method::GET, "/device", Some(token))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let (challenge_id, answer) = gateway
        .hardware_answer(token, &record, &signing, 1)
        .await?;
    let answer = json!({ "challenge_id": challenge_id, "response": answer });

    let response = gateway
        .send(json_request(
            Method::POST,
            "/auth/secondary",
            Some(token),
            &answer,
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?["tier"], "fully_authenticated");

    let response = gateway
        .send(json_request(
            Method::POST,
            "/auth/secondary",
            Some(token),
            &answer,
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await?["error"], "invalid_challenge");

    let response = gateway
        .send(empty_request(Method::GET, "/device", Some(token))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn bad_password_is_unauthorized() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    gateway.add_user("alice", false).await?;

    for (username, password) in [("alice", "wrong"), ("nobody", PASSWORD)] {
        let response = gateway
            .send(json_request(
                Method::POST,
                "/auth/session",
                None,
                &json!({ "username": username, "password": password }),
            )?)
            .await?;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

#[tokio::test]
async fn user_without_factors_is_fully_authenticated() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    gateway.add_user("bob", false).await?;

    let (body, token) = gateway.login("bob").await?;
    assert_eq!(body["tier"], "fully_authenticated");
    assert_eq!(body["secondary"], false);

    let response = gateway
        .send(empty_request(Method::GET, "/device", Some(&token))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?, json!([]));
    Ok(())
}

#[tokio::test]
async fn revoking_a_device_needs_session_and_csrf() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    let user = gateway.add_user("carol", false).await?;
    let signing = SigningKey::generate(&mut OsRng);
    let record = gateway.add_hardware_key(&user, &signing).await?;
    let uri = format!("/device/{}", record.id);

    let response = gateway
        .send(empty_request(Method::DELETE, &uri, None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = gateway.full_login("carol", &record, &signing, 1).await?;

    let response = gateway
        .send(empty_request(Method::DELETE, &uri, Some(&token))?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let csrf = gateway.csrf_token(&token).await?;
    let mut request = empty_request(Method::DELETE, &uri, Some(&token))?;
    request
        .headers_mut()
        .insert("csrf-token", "not-the-token".parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let mut request = empty_request(Method::DELETE, &uri, Some(&token))?;
    request.headers_mut().insert("csrf-token", csrf.parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?["deleted"], true);

    let response = gateway
        .send(empty_request(Method::GET, "/device", Some(&token))?)
        .await?;
    let devices = body_json(response).await?;
    let ids: Vec<&str> = devices
        .as_array()
        .map(|list| list.iter().filter_map(|d| d["id"].as_str()).collect())
        .unwrap_or_default();
    assert!(!ids.contains(&record.id.to_string().as_str()));

    // Gone for good.
    let mut request = empty_request(Method::DELETE, &uri, Some(&token))?;
    request.headers_mut().insert("x-csrf-token", csrf.parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn csrf_token_in_form_body_passes() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    let user = gateway.add_user("dave", false).await?;
    let signing = SigningKey::generate(&mut OsRng);
    let record = gateway.add_hardware_key(&user, &signing).await?;
    let spare = gateway
        .add_hardware_key(&user, &SigningKey::generate(&mut OsRng))
        .await?;

    let token = gateway.full_login("dave", &record, &signing, 1).await?;
    let csrf = gateway.csrf_token(&token).await?;

    let request = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/device/{}", spare.id))
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(format!("csrf_token={csrf}")))?;
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(gateway.store.get_factor(spare.id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn csrf_scope_rejects_anonymous_before_handler() -> Result<()> {
    let gateway = Gateway::unlimited()?;

    let response = gateway
        .send(json_request(
            Method::POST,
            "/keybase/associate",
            None,
            &json!({ "username": "someone", "public_key": "AAAA" }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = gateway
        .send(empty_request(
            Method::PUT,
            &format!("/ssh/validate/{}", Uuid::new_v4()),
            None,
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn unmatched_routes_are_not_found() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    gateway.add_user("erin", false).await?;
    let (_, token) = gateway.login("erin").await?;

    for auth in [None, Some(token.as_str())] {
        let response = gateway
            .send(empty_request(Method::GET, "/admin/secret", auth)?)
            .await?;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await?["error"], "not_found");
    }
    Ok(())
}

#[tokio::test]
async fn logout_clears_the_session() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    gateway.add_user("frank", false).await?;
    let (_, token) = gateway.login("frank").await?;

    let response = gateway
        .send(empty_request(Method::GET, "/logout", Some(&token))?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?["sessions"], 1);

    let response = gateway
        .send(empty_request(Method::GET, "/device", Some(&token))?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = gateway
        .send(empty_request(Method::GET, "/logout_all", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn ssh_certificate_after_browser_approval() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    gateway.add_user("grace", false).await?;
    let (_, session) = gateway.login("grace").await?;
    let csrf = gateway.csrf_token(&session).await?;

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    let response = gateway
        .send(json_request(
            Method::POST,
            "/ssh/challenge",
            None,
            &json!({ "public_key": key.public_key().to_openssh()? }),
        )?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let opened = body_json(response).await?;
    let ssh_token = opened["token"].as_str().context("token missing")?;
    let message = opened["message"].as_str().context("message missing")?;
    let signature = key
        .sign(ssh::SIGNATURE_NAMESPACE, HashAlg::Sha512, message.as_bytes())?
        .to_pem(LineEnding::LF)?;
    let redeem = json!({ "token": ssh_token, "signature": signature });

    let response = gateway
        .send(json_request(Method::PUT, "/ssh/challenge", None, &redeem)?)
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let mut request = empty_request(
        Method::PUT,
        &format!("/ssh/validate/{ssh_token}"),
        Some(&session),
    )?;
    request.headers_mut().insert("csrf-token", csrf.parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?["approved"], true);

    let response = gateway
        .send(json_request(Method::PUT, "/ssh/challenge", None, &redeem)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let issued = body_json(response).await?;
    assert_eq!(issued["principal"], "grace");
    assert!(
        issued["certificate"]
            .as_str()
            .is_some_and(|cert| cert.starts_with("ssh-ed25519-cert-v01@openssh.com"))
    );

    let response = gateway
        .send(json_request(Method::PUT, "/ssh/challenge", None, &redeem)?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn public_endpoints() -> Result<()> {
    let gateway = Gateway::unlimited()?;

    let response = gateway
        .send(empty_request(Method::GET, "/check", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-app"));
    assert!(response.headers().contains_key("x-request-id"));
    let health = body_json(response).await?;
    assert_eq!(health["name"], "zerogate");
    assert!(health["requests"].as_u64().is_some_and(|count| count >= 1));

    let response = gateway
        .send(empty_request(Method::GET, "/auth/state", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let state = body_json(response).await?;
    assert_eq!(state["app_id"], APP_ID);
    assert_eq!(
        state["factors"],
        json!(["hardware_key", "ssh_key", "linked_account"])
    );

    let response = gateway
        .send(empty_request(Method::GET, "/robots.txt", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let robots = to_bytes(response.into_body(), 1024).await?;
    assert!(robots.starts_with(b"User-agent: *"));

    let response = gateway
        .send(empty_request(Method::GET, "/auth/u2f/app.json", None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "application/fido.trusted-apps+json"
    );
    let facets = body_json(response).await?;
    assert_eq!(facets["trustedFacets"][0]["version"], json!({ "major": 1, "minor": 0 }));
    assert_eq!(facets["trustedFacets"][0]["ids"], json!([APP_ID]));
    Ok(())
}

#[tokio::test]
async fn ssh_approval_with_hardware_key_goes_through_secondary() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    let user = gateway.add_user("heidi", false).await?;
    let signing = SigningKey::generate(&mut OsRng);
    let record = gateway.add_hardware_key(&user, &signing).await?;
    let session = gateway.full_login("heidi", &record, &signing, 1).await?;
    let csrf = gateway.csrf_token(&session).await?;

    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    let response = gateway
        .send(json_request(
            Method::POST,
            "/ssh/challenge",
            None,
            &json!({ "public_key": key.public_key().to_openssh()? }),
        )?)
        .await?;
    let opened = body_json(response).await?;
    let ssh_token = opened["token"].as_str().context("token missing")?;
    let message = opened["message"].as_str().context("message missing")?;
    let signature = key
        .sign(ssh::SIGNATURE_NAMESPACE, HashAlg::Sha512, message.as_bytes())?
        .to_pem(LineEnding::LF)?;
    let redeem = json!({ "token": ssh_token, "signature": signature });

    let mut request = empty_request(
        Method::PUT,
        &format!("/ssh/validate/{ssh_token}"),
        Some(&session),
    )?;
    request.headers_mut().insert("csrf-token", csrf.parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::CREATED);
    let challenge = body_json(response).await?;
    let nonce = challenge["nonce"].as_str().context("nonce missing")?;

    let response = gateway
        .send(json_request(Method::PUT, "/ssh/challenge", None, &redeem)?)
        .await?;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let Factor::HardwareKey { key_handle, .. } = &record.factor else {
        anyhow::bail!("not a hardware key");
    };
    let payload = hardware::sign_payload(APP_ID, 2, nonce);
    let answer = json!({
        "challenge_id": challenge["challenge_id"],
        "key_handle": key_handle,
        "counter": 2,
        "signature": URL_SAFE_NO_PAD.encode(signing.sign(&payload).to_bytes()),
    });
    let mut request = json_request(Method::PUT, "/ssh/secondary", Some(&session), &answer)?;
    request.headers_mut().insert("csrf-token", csrf.parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let decided = body_json(response).await?;
    assert_eq!(decided["approved"], true);
    assert_eq!(decided["token"], ssh_token);

    let response = gateway
        .send(json_request(Method::PUT, "/ssh/challenge", None, &redeem)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?["principal"], "heidi");
    Ok(())
}

#[tokio::test]
async fn keybase_info_shows_pending_association() -> Result<()> {
    let gateway = Gateway::unlimited()?;
    gateway.add_user("ivan", false).await?;
    let (_, session) = gateway.login("ivan").await?;
    let csrf = gateway.csrf_token(&session).await?;
    let linked = URL_SAFE_NO_PAD.encode(SigningKey::generate(&mut OsRng).verifying_key().as_bytes());

    let mut request = json_request(
        Method::POST,
        "/keybase/associate",
        Some(&session),
        &json!({ "username": "ivan_k", "public_key": linked }),
    )?;
    request.headers_mut().insert("csrf-token", csrf.parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let grant = body_json(response).await?;
    let token = grant["token"].as_str().context("token missing")?;

    let response = gateway
        .send(empty_request(Method::GET, &format!("/keybase/info/{token}"), Some(&session))?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let mut request = empty_request(Method::GET, &format!("/keybase/info/{token}"), Some(&session))?;
    request.headers_mut().insert("csrf-token", csrf.parse()?);
    let response = gateway.send(request).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await?;
    assert_eq!(info["username"], "ivan_k");
    assert_eq!(info["public_key"], linked);

    let response = gateway
        .send(empty_request(Method::GET, &format!("/keybase/associate/{token}"), None)?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let unknown = json!({
        "challenge_id": Uuid::new_v4(),
        "key_handle": "handle",
        "counter": 1,
        "signature": "sig",
    });
    let response = gateway
        .send(json_request(Method::PUT, "/keybase/secondary", None, &unknown)?)
        .await?;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await?["error"], "invalid_challenge");
    Ok(())
}

#[tokio::test]
async fn rate_limit_applies_per_client() -> Result<()> {
    let gateway = Gateway::new(
        GatewayConfig::new()
            .with_cookie_secure(false)
            .with_rate_limit(2, Duration::from_secs(60))
            .with_trust_proxy(true),
    )?;

    let check = |client: &'static str| -> Result<Request<Body>> {
        Ok(Request::builder()
            .uri("/check")
            .header("x-forwarded-for", client)
            .body(Body::empty())?)
    };

    for _ in 0..2 {
        let response = gateway.send(check("198.51.100.1")?).await?;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = gateway.send(check("198.51.100.1")?).await?;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body_json(response).await?["error"], "rate_limited");

    let response = gateway.send(check("198.51.100.2")?).await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn rotating_forwarded_header_does_not_escape_the_limit() -> Result<()> {
    let gateway = Gateway::new(
        GatewayConfig::new()
            .with_cookie_secure(false)
            .with_rate_limit(2, Duration::from_secs(60)),
    )?;
    let peer = SocketAddr::from(([198, 51, 100, 7], 4000));

    let mut statuses = Vec::new();
    for n in 0..3 {
        let request = Request::builder()
            .uri("/check")
            .header("x-forwarded-for", format!("203.0.113.{n}"))
            .extension(ConnectInfo(peer))
            .body(Body::empty())?;
        statuses.push(gateway.send(request).await?.status());
    }
    assert_eq!(
        statuses,
        [StatusCode::OK, StatusCode::OK, StatusCode::TOO_MANY_REQUESTS]
    );
    Ok(())
}

#[tokio::test]
async fn panicking_handler_is_a_500_and_serving_continues() -> Result<()> {
    let state = AppState::new(
        GatewayConfig::new().with_rate_limit(0, Duration::from_secs(60)),
        Arc::new(MemoryStore::new()),
        FactorEngine::new(
            EngineSettings::new(APP_ID),
            CertificateAuthority::generate()?,
        ),
    );
    let routes = Router::new()
        .route("/boom", get(|| async { panic!("boom") as () }))
        .route("/fine", get(|| async { "fine" }));
    let app = api::with_gateway_layers(routes, state.clone());

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/boom").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().contains_key("x-request-id"));
    assert_eq!(body_json(response).await?["error"], "internal_error");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/fine").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/missing").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(state.counter().total(), 3);
    Ok(())
}
