mod accounts;
mod auth;
mod cleanup;
mod config;
mod error;
mod guard;
#[cfg(feature = "metrics")]
mod metrics;
mod ops;
mod security;
mod session;
mod telemetry;

const REQUEST_ID_HEADER: &str = "x-request-id";
const CONTENT_SECURITY_POLICY: &str =
    "default-src 'none'; frame-ancestors 'none'; base-uri 'none'; form-action 'self'";
const REFERRER_POLICY: &str = "no-referrer";
const X_CONTENT_TYPE_OPTIONS: &str = "nosniff";
const X_FRAME_OPTIONS: &str = "DENY";

use anyhow::{anyhow, Context, Result};
use axum::{
    http::{header::HeaderName, HeaderValue},
    routing::{delete, get, post},
    Router,
};
use clap::{Args, Parser, Subcommand};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::{net::TcpListener, signal};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    propagate_header::PropagateHeaderLayer,
    request_id::{MakeRequestUuid, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
};
use tracing::{error, info, warn};

use quillhub_crypto::{generate_secret, hash_password, TokenIssuer, TokenSettings};
use quillhub_storage::{connect, migrate, CreateUserError, NewUser, StoragePool, UserRepository};

use crate::{
    accounts::{AccountService, AccountStore, LogMailer, PostgresAccountStore},
    cleanup::CleanupScheduler,
    config::{AuthConfig, CliOverrides, LogFormat, ServerConfig},
    session::{
        CredentialVerifier, DatabaseCredentialVerifier, InMemorySessionStore, PostgresSessionStore,
        SessionService, SessionStore,
    },
};
#[cfg(feature = "metrics")]
use crate::metrics::MetricsContext;

#[derive(Parser, Debug, Default)]
#[command(
    name = "quillhub-server",
    version,
    about = "Quillhub account and device session gateway"
)]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,
    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Args, Debug, Default, Clone)]
struct ConfigArgs {
    #[arg(long)]
    bind_addr: Option<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    log_format: Option<LogFormat>,
    #[arg(long)]
    metrics_enabled: Option<bool>,
    #[arg(long)]
    metrics_bind_addr: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    access_token_secret: Option<String>,
    #[arg(long)]
    refresh_token_secret: Option<String>,
    #[arg(long)]
    cleanup_retention_days: Option<u32>,
}

impl ConfigArgs {
    fn into_overrides(self) -> CliOverrides {
        CliOverrides {
            bind_addr: self.bind_addr,
            host: self.host,
            port: self.port,
            log_format: self.log_format,
            metrics_enabled: self.metrics_enabled,
            metrics_bind_addr: self.metrics_bind_addr,
            database_url: self.database_url,
            access_token_secret: self.access_token_secret,
            refresh_token_secret: self.refresh_token_secret,
            cleanup_retention_days: self.cleanup_retention_days,
        }
    }
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// Seed a confirmed user account into the configured database.
    SeedUser(SeedUserCommand),
    /// Run one retention pass over soft-deleted sessions and exit.
    CleanupSessions,
}

#[derive(Args, Debug)]
struct SeedUserCommand {
    /// Login for the seeded account.
    #[arg(long)]
    login: String,
    /// E-mail address for the seeded account.
    #[arg(long)]
    email: String,
    /// Plaintext password for the seeded account.
    #[arg(long)]
    password: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let overrides = cli.config.clone().into_overrides();
    let mut config = ServerConfig::load()?;
    config.apply_overrides(&overrides)?;

    if let Some(command) = cli.command {
        return run_command(&config, command).await;
    }

    run(Arc::new(config), CancellationToken::new()).await
}

async fn run_command(config: &ServerConfig, command: CliCommand) -> Result<()> {
    match command {
        CliCommand::SeedUser(cmd) => seed_user(config, cmd).await,
        CliCommand::CleanupSessions => cleanup_sessions(config).await,
    }
}

async fn connect_configured(config: &ServerConfig, purpose: &str) -> Result<StoragePool> {
    let database_url = config
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow!("database_url must be configured to {purpose}"))?;
    let pool = connect(database_url).await?;
    migrate(&pool).await?;
    Ok(pool)
}

async fn seed_user(config: &ServerConfig, cmd: SeedUserCommand) -> Result<()> {
    let login = cmd.login.trim();
    let email = cmd.email.trim();
    if login.is_empty() || email.is_empty() {
        anyhow::bail!("login and email must be provided");
    }

    let pool = connect_configured(config, "seed users").await?;
    let password_hash = hash_password(cmd.password.trim())
        .map_err(|err| anyhow!("failed to hash password: {err}"))?;
    let new_user = NewUser {
        login: login.to_string(),
        email: email.to_string(),
        password_hash,
        confirmation: None,
    };

    match UserRepository::create_user(pool.pool(), &new_user).await {
        Ok(user_id) => {
            println!("Seeded user '{}' with id {}", login, user_id);
            Ok(())
        }
        Err(CreateUserError::LoginTaken) => {
            println!("User '{}' already exists; skipping", login);
            Ok(())
        }
        Err(CreateUserError::EmailTaken) => {
            println!("E-mail '{}' is already registered; skipping", email);
            Ok(())
        }
        Err(CreateUserError::Other(err)) => Err(err),
    }
}

async fn cleanup_sessions(config: &ServerConfig) -> Result<()> {
    let pool = connect_configured(config, "clean up sessions").await?;
    let retention = config.cleanup.retention()?;
    let deleted = PostgresSessionStore::new(pool)
        .hard_delete_older_than(retention)
        .await?;
    println!(
        "Removed {} session(s) soft-deleted more than {} day(s) ago",
        deleted, config.cleanup.retention_days
    );
    Ok(())
}

/// Build the token issuer, generating secrets that were not configured.
fn token_issuer(auth: &AuthConfig) -> Result<TokenIssuer> {
    let access_secret = auth.access_token_secret.clone().unwrap_or_else(|| {
        warn!("no access token secret configured; generated ephemeral secret");
        generate_secret()
    });
    let refresh_secret = auth.refresh_token_secret.clone().unwrap_or_else(|| {
        warn!("no refresh token secret configured; generated ephemeral secret");
        generate_secret()
    });
    let settings = TokenSettings {
        access_secret,
        access_ttl: auth.access_ttl()?,
        refresh_secret,
        refresh_ttl: auth.refresh_ttl()?,
    };
    TokenIssuer::new(&settings).context("invalid token settings")
}

/// Serves until Ctrl+C or until `shutdown` is cancelled. Background tasks
/// share the token and are joined before returning.
async fn run(config: Arc<ServerConfig>, shutdown: CancellationToken) -> Result<()> {
    telemetry::init(config.log_format());

    let env_override_keys = ServerConfig::environment_override_keys();
    if env_override_keys.is_empty() {
        info!("no QUILLHUB_SERVER environment overrides detected");
    } else {
        info!(keys = ?env_override_keys, "detected QUILLHUB_SERVER environment overrides");
    }

    info!(
        bind_addr = ?config.bind_addr,
        host = %config.host,
        port = config.port,
        log_format = ?config.log_format,
        metrics_enabled = config.metrics.enabled,
        metrics_bind_addr = ?config.metrics.bind_addr,
        database_url_configured = config.database_url.is_some(),
        access_token_ttl_secs = config.auth.access_token_ttl_secs,
        refresh_token_ttl_secs = config.auth.refresh_token_ttl_secs,
        cookie_name = %config.cookie.name,
        cookie_secure = config.cookie.secure,
        cookie_same_site = config.cookie.same_site.as_str(),
        cleanup_enabled = config.cleanup.enabled,
        cleanup_retention_days = config.cleanup.retention_days,
        cleanup_run_at = %config.cleanup.run_at,
        "resolved server configuration"
    );

    let backend = ops::Backend::open(config.database_url.as_deref()).await;

    let issuer = token_issuer(&config.auth)?;
    let (credentials, sessions, account_store): (
        Arc<dyn CredentialVerifier>,
        Arc<dyn SessionStore>,
        Arc<dyn AccountStore>,
    ) = match backend.pool() {
        Some(pool) => (
            Arc::new(DatabaseCredentialVerifier::new(pool.clone())),
            Arc::new(PostgresSessionStore::new(pool.clone())),
            Arc::new(PostgresAccountStore::new(pool)),
        ),
        None => {
            warn!("no database available; sessions and accounts are kept in memory");
            let store = Arc::new(InMemorySessionStore::new());
            (store.clone(), store.clone(), store)
        }
    };
    let session_service = Arc::new(SessionService::new(issuer, credentials, sessions));
    let account_service = Arc::new(AccountService::new(
        account_store,
        Arc::new(LogMailer),
        &config.accounts,
    )?);

    #[cfg(feature = "metrics")]
    let metrics_ctx = if config.metrics.enabled {
        Some(MetricsContext::init()?)
    } else {
        None
    };

    let cleanup_task = if config.cleanup.enabled {
        let scheduler = CleanupScheduler::new(session_service.clone(), &config.cleanup)?;
        #[cfg(feature = "metrics")]
        let scheduler = scheduler.with_metrics(metrics_ctx.clone());
        Some(scheduler.spawn(shutdown.clone()))
    } else {
        info!("scheduled session cleanup disabled");
        None
    };

    #[cfg(feature = "metrics")]
    let state = AppState::new(
        config.clone(),
        backend.clone(),
        session_service.clone(),
        account_service.clone(),
    )
    .with_metrics(metrics_ctx.clone());

    #[cfg(not(feature = "metrics"))]
    let state = AppState::new(
        config.clone(),
        backend.clone(),
        session_service.clone(),
        account_service.clone(),
    );

    #[cfg(feature = "metrics")]
    let metrics_task = match config.metrics.bind_addr.as_deref() {
        Some(bind_addr) if config.metrics.enabled => {
            let addr: SocketAddr = bind_addr
                .parse()
                .context("failed to parse metrics bind addr")?;
            let (state, shutdown) = (state.clone(), shutdown.clone());
            Some(tokio::spawn(async move {
                if let Err(err) = metrics::serve(addr, state, shutdown).await {
                    error!(?err, "metrics listener stopped unexpectedly");
                }
            }))
        }
        _ => None,
    };

    let app = build_app(state);

    let addr: SocketAddr = config.listener_addr()?;
    let listener = TcpListener::bind(addr).await?;
    info!("listening on {addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await?;

    shutdown.cancel();
    if let Some(task) = cleanup_task {
        if let Err(err) = task.await {
            error!(?err, "session cleanup task ended abnormally");
        }
    }
    #[cfg(feature = "metrics")]
    if let Some(task) = metrics_task {
        if let Err(err) = task.await {
            error!(?err, "metrics listener task ended abnormally");
        }
    }

    Ok(())
}

#[derive(Clone)]
struct AppState {
    started_at: Instant,
    config: Arc<ServerConfig>,
    backend: ops::Backend,
    session: Arc<SessionService>,
    accounts: Arc<AccountService>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<MetricsContext>>,
}

impl AppState {
    fn new(
        config: Arc<ServerConfig>,
        backend: ops::Backend,
        session: Arc<SessionService>,
        accounts: Arc<AccountService>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            config,
            backend,
            session,
            accounts,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    #[cfg(test)]
    fn with_start_time(mut self, started_at: Instant) -> Self {
        self.started_at = started_at;
        self
    }

    #[cfg(feature = "metrics")]
    fn with_metrics(mut self, metrics: Option<Arc<MetricsContext>>) -> Self {
        self.metrics = metrics;
        self
    }

    fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn backend(&self) -> &ops::Backend {
        &self.backend
    }

    fn session(&self) -> &SessionService {
        &self.session
    }

    fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    #[cfg(feature = "metrics")]
    fn metrics_enabled(&self) -> bool {
        self.config.metrics.enabled
    }

    #[cfg(feature = "metrics")]
    fn metrics(&self) -> Option<Arc<MetricsContext>> {
        self.metrics.clone()
    }

    fn record_auth_event(&self, event: &str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.increment_auth_event(event);
        }
        #[cfg(not(feature = "metrics"))]
        {
            let _ = (self, event);
        }
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        res = signal::ctrl_c() => match res {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(err) => {
                error!(?err, "failed to listen for ctrl-c; waiting for cancellation");
                shutdown.cancelled().await;
            }
        },
        () = shutdown.cancelled() => info!("shutdown requested"),
    }
}

fn build_app(state: AppState) -> Router {
    #[cfg(feature = "metrics")]
    let expose_metrics_here =
        state.metrics_enabled() && state.config.metrics.bind_addr.is_none();
    #[cfg(feature = "metrics")]
    let metrics_ctx = state.metrics();

    #[cfg_attr(not(feature = "metrics"), allow(unused_mut))]
    let mut router = Router::new()
        .route("/health", get(ops::health))
        .route("/ready", get(ops::readiness))
        .route("/version", get(ops::version))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh-token", post(auth::refresh_token))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/auth/registration", post(accounts::registration))
        .route(
            "/auth/registration-confirmation",
            post(accounts::registration_confirmation),
        )
        .route(
            "/auth/registration-email-resending",
            post(accounts::registration_email_resending),
        )
        .route("/auth/password-recovery", post(accounts::password_recovery))
        .route("/auth/new-password", post(accounts::new_password))
        .route(
            "/security/devices",
            get(security::list_devices).delete(security::delete_other_devices),
        )
        .route(
            "/security/devices/{device_id}",
            delete(security::delete_device),
        );

    #[cfg(feature = "metrics")]
    {
        if expose_metrics_here {
            router = router.route("/metrics", get(metrics::handler));
        }
    }

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);

    // The id is assigned before the trace span opens so both logs and the
    // response carry it.
    let layers = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            request_id_header.clone(),
            MakeRequestUuid,
        ))
        .layer(PropagateHeaderLayer::new(request_id_header))
        .layer(telemetry::http_layer())
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("content-security-policy"),
            HeaderValue::from_static(CONTENT_SECURITY_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static(REFERRER_POLICY),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static(X_CONTENT_TYPE_OPTIONS),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static(X_FRAME_OPTIONS),
        ));

    #[cfg(feature = "metrics")]
    if let Some(ctx) = metrics_ctx {
        router = router.layer(axum::middleware::from_fn_with_state(
            ctx,
            metrics::track_http,
        ));
    }

    router.layer(layers).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::tests::{account_service, RecordingMailer};
    use crate::session::tests::{
        SessionTestHarness, TEST_EMAIL, TEST_LOGIN, TEST_PASSWORD, TEST_USER_ID,
    };
    use crate::telemetry::tests::CaptureWriter;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use quillhub_crypto::{decode_claims, RefreshClaims};
    use quillhub_storage::PgPool;
    use serde_json::Value;
    use std::io::ErrorKind;
    use std::str;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tower::ServiceExt; // for `oneshot`
    use tracing_subscriber::EnvFilter;

    const CHROME_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const FIREFOX_LINUX: &str =
        "Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Gecko/20100101 Firefox/121.0";
    const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1";
    const EDGE_MAC: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.2210.91";

    fn test_config() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::default())
    }

    fn app_state(harness: &SessionTestHarness, backend: ops::Backend) -> AppState {
        app_state_with_config(harness, test_config(), backend)
    }

    fn app_state_with_config(
        harness: &SessionTestHarness,
        config: Arc<ServerConfig>,
        backend: ops::Backend,
    ) -> AppState {
        let accounts = Arc::new(account_service(
            harness.store.clone(),
            Arc::new(RecordingMailer::default()),
        ));
        AppState::new(config, backend, harness.service.clone(), accounts)
    }

    fn default_state() -> AppState {
        app_state(&SessionTestHarness::new(), ops::Backend::Memory)
    }

    /// App deployed behind a proxy that sets `x-forwarded-for`.
    async fn app_with_user() -> (Router, SessionTestHarness) {
        let harness = SessionTestHarness::with_user().await;
        let config = ServerConfig {
            trust_forwarded_for: true,
            ..ServerConfig::default()
        };
        let app = build_app(app_state_with_config(
            &harness,
            Arc::new(config),
            ops::Backend::Memory,
        ));
        (app, harness)
    }

    async fn bind_test_listener() -> Option<TcpListener> {
        match TcpListener::bind("127.0.0.1:0").await {
            Ok(listener) => Some(listener),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                eprintln!("skipping listener test due to permission error: {err}");
                None
            }
            Err(err) => panic!("failed to bind test listener: {err}"),
        }
    }

    fn login_request(login_or_email: &str, password: &str, user_agent: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/auth/login")
            .header("content-type", "application/json")
            .header("user-agent", user_agent)
            .header("x-forwarded-for", "198.51.100.4, 10.0.0.1")
            .body(Body::from(format!(
                r#"{{"loginOrEmail":"{login_or_email}","password":"{password}"}}"#
            )))
            .unwrap()
    }

    fn with_cookie(method: &str, uri: &str, refresh_token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("cookie", format!("refreshToken={refresh_token}"))
            .body(Body::empty())
            .unwrap()
    }

    /// Refresh token carried by the response's `Set-Cookie` header.
    fn refresh_cookie_of(response: &axum::response::Response) -> String {
        let header = response
            .headers()
            .get("set-cookie")
            .and_then(|value| value.to_str().ok())
            .expect("set-cookie header");
        header
            .split(';')
            .next()
            .and_then(|pair| pair.strip_prefix("refreshToken="))
            .expect("refresh token cookie")
            .to_string()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn login(app: &Router, user_agent: &str) -> (String, String) {
        let response = app
            .clone()
            .oneshot(login_request(TEST_LOGIN, TEST_PASSWORD, user_agent))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let refresh = refresh_cookie_of(&response);
        let payload = body_json(response).await;
        let access = payload["accessToken"].as_str().unwrap().to_string();
        (access, refresh)
    }

    #[tokio::test]
    async fn health_route_returns_ok() {
        let response = build_app(default_state())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn security_headers_cover_success_and_rejection() {
        let app = build_app(default_state());
        let expected = [
            ("content-security-policy", CONTENT_SECURITY_POLICY),
            ("referrer-policy", REFERRER_POLICY),
            ("x-content-type-options", X_CONTENT_TYPE_OPTIONS),
            ("x-frame-options", X_FRAME_OPTIONS),
        ];

        for (uri, status) in [("/health", StatusCode::OK), ("/auth/me", StatusCode::UNAUTHORIZED)] {
            let response = app
                .clone()
                .oneshot(Request::get(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), status);

            let headers = response.headers();
            for (name, value) in expected {
                assert_eq!(headers.get(name).unwrap(), value, "{name} on {uri}");
            }
            assert!(headers.contains_key(REQUEST_ID_HEADER), "request id on {uri}");
        }
    }

    #[tokio::test]
    async fn request_id_is_echoed_and_tags_request_logs() {
        let writer = CaptureWriter::default();
        let subscriber =
            telemetry::subscriber_to(LogFormat::Compact, EnvFilter::new("debug"), writer.clone());
        let _guard = tracing::subscriber::set_default(subscriber);

        let app = build_app(default_state());
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "test-observability")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get("x-request-id")
                .and_then(|value| value.to_str().ok()),
            Some("test-observability")
        );
        assert!(writer
            .contents()
            .contains("[request_id=test-observability] "));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/version")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let generated = response
            .headers()
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .expect("generated request id")
            .to_owned();
        assert!(writer
            .contents()
            .contains(&format!("[request_id={generated}] ")));
    }

    #[tokio::test]
    async fn version_route_reports_package_version() {
        let app = build_app(default_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/version")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(
            payload["version"].as_str().unwrap(),
            env!("CARGO_PKG_VERSION")
        );
    }

    async fn ready_payload(state: AppState) -> Value {
        let response = build_app(state)
            .oneshot(
                Request::builder()
                    .uri("/ready")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        body_json(response).await
    }

    #[tokio::test]
    async fn readiness_is_degraded_while_sessions_live_in_memory() {
        let payload = ready_payload(default_state()).await;

        assert_eq!(payload["status"], "degraded");
        assert!(payload["uptime_seconds"].as_u64().unwrap() <= 1);

        let components = payload["components"].as_array().unwrap();
        let names: Vec<_> = components.iter().map(|c| c["name"].clone()).collect();
        assert_eq!(names, ["database", "session_store", "session_cleanup"]);
        assert_eq!(components[0]["status"], "disabled");
        assert_eq!(components[0]["details"], "database_url not configured");
        assert_eq!(components[1]["status"], "memory");
        assert_eq!(components[2]["status"], "scheduled");
        assert_eq!(components[2]["details"], "daily at 03:00 UTC");
    }

    #[tokio::test]
    async fn readiness_reports_failed_database_and_disabled_cleanup() {
        let mut config = ServerConfig::default();
        config.cleanup.enabled = false;
        let state = app_state_with_config(
            &SessionTestHarness::new(),
            Arc::new(config),
            ops::Backend::Unavailable("connection refused".into()),
        );
        let payload = ready_payload(state).await;

        assert_eq!(payload["status"], "degraded");
        let components = payload["components"].as_array().unwrap();
        assert_eq!(components[0]["status"], "down");
        assert_eq!(components[0]["details"], "connection refused");
        assert_eq!(components[1]["status"], "memory");
        assert_eq!(components[2]["status"], "disabled");
        assert!(components[2].get("details").is_none());
    }

    #[tokio::test]
    async fn readiness_reports_elapsed_uptime() {
        let past = Instant::now() - Duration::from_secs(2);
        let payload = ready_payload(default_state().with_start_time(past)).await;
        assert!(payload["uptime_seconds"].as_u64().unwrap() >= 2);
    }

    #[tokio::test]
    async fn readiness_is_ready_with_postgres_sessions() {
        let pool = PgPool::connect_lazy("postgres://quillhub@localhost/quillhub").unwrap();
        let state = app_state(
            &SessionTestHarness::new(),
            ops::Backend::Postgres(StoragePool::new(pool)),
        );
        let payload = ready_payload(state).await;

        assert_eq!(payload["status"], "ready");
        let components = payload["components"].as_array().unwrap();
        assert_eq!(components[0]["status"], "up");
        assert!(components[0].get("details").is_none());
        assert_eq!(components[1]["status"], "postgres");
    }

    #[test]
    fn app_state_reports_uptime_in_seconds() {
        assert_eq!(default_state().uptime_seconds(), 0);
    }

    #[tokio::test]
    async fn login_route_rejects_blank_inputs() {
        let app = build_app(default_state());
        let response = app
            .oneshot(login_request(" ", "", CHROME_WINDOWS))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "validation_error");
        let details = payload["details"].as_array().unwrap();
        assert_eq!(details.len(), 2);
    }

    #[tokio::test]
    async fn login_route_returns_unauthorized_on_invalid_credentials() {
        let (app, _harness) = app_with_user().await;
        let response = app
            .oneshot(login_request(TEST_LOGIN, "wrong-password", CHROME_WINDOWS))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get("set-cookie").is_none());
        let payload = body_json(response).await;
        assert_eq!(payload["error"], "unauthorized");
    }

    #[tokio::test]
    async fn login_sets_cookie_and_records_matching_session() {
        let (app, harness) = app_with_user().await;
        let response = app
            .clone()
            .oneshot(login_request(TEST_EMAIL, TEST_PASSWORD, CHROME_WINDOWS))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response
            .headers()
            .get("set-cookie")
            .and_then(|value| value.to_str().ok())
            .unwrap()
            .to_string();
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("Path=/"));
        assert!(set_cookie.contains("Max-Age=1209600"));

        let refresh = refresh_cookie_of(&response);
        let payload = body_json(response).await;
        assert!(payload["accessToken"].as_str().is_some_and(|t| !t.is_empty()));
        assert!(payload.get("refreshToken").is_none());

        let claims: RefreshClaims = decode_claims(&refresh).unwrap();
        assert_eq!(claims.user_id, TEST_USER_ID);
        let sessions = harness.store.all_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].device_id, claims.device_id);
        assert_eq!(sessions[0].issued_at.timestamp(), claims.iat);
        assert_eq!(sessions[0].ip.as_deref(), Some("198.51.100.4"));
    }

    #[tokio::test]
    async fn forwarded_for_is_ignored_unless_trusted() {
        let harness = SessionTestHarness::with_user().await;
        let app = build_app(app_state(&harness, ops::Backend::Memory));

        let response = app
            .clone()
            .oneshot(login_request(TEST_LOGIN, TEST_PASSWORD, CHROME_WINDOWS))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut request = login_request(TEST_LOGIN, TEST_PASSWORD, FIREFOX_LINUX);
        let peer: SocketAddr = "192.0.2.10:52100".parse().unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(peer));
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sessions = harness.store.all_sessions().await;
        assert_eq!(sessions.len(), 2);
        assert!(sessions
            .iter()
            .all(|session| session.ip.as_deref() != Some("198.51.100.4")));
        assert!(sessions
            .iter()
            .any(|session| session.ip.as_deref() == Some("192.0.2.10")));
        assert!(sessions.iter().any(|session| session.ip.is_none()));
    }

    #[tokio::test]
    async fn refresh_rotates_and_rejects_replay() {
        let (app, _harness) = app_with_user().await;
        let (_, first) = login(&app, CHROME_WINDOWS).await;

        let response = app
            .clone()
            .oneshot(with_cookie("POST", "/auth/refresh-token", &first))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let second = refresh_cookie_of(&response);
        assert_ne!(first, second);
        let payload = body_json(response).await;
        assert!(payload["accessToken"].is_string());

        let replay = app
            .clone()
            .oneshot(with_cookie("POST", "/auth/refresh-token", &first))
            .await
            .unwrap();
        assert_eq!(replay.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(replay).await["error"], "unauthorized");

        let response = app
            .clone()
            .oneshot(with_cookie("POST", "/auth/refresh-token", &second))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn logout_ends_session_once() {
        let (app, _harness) = app_with_user().await;
        let (_, refresh) = login(&app, CHROME_WINDOWS).await;

        let response = app
            .clone()
            .oneshot(with_cookie("POST", "/auth/logout", &refresh))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let cleared = response
            .headers()
            .get("set-cookie")
            .and_then(|value| value.to_str().ok())
            .unwrap();
        assert!(cleared.starts_with("refreshToken=;"));
        assert!(cleared.contains("Max-Age=0"));

        for uri in ["/auth/logout", "/auth/refresh-token"] {
            let response = app
                .clone()
                .oneshot(with_cookie("POST", uri, &refresh))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn refresh_guarded_routes_require_cookie() {
        let app = build_app(default_state());
        for (method, uri) in [
            ("POST", "/auth/refresh-token"),
            ("POST", "/auth/logout"),
            ("GET", "/security/devices"),
            ("DELETE", "/security/devices"),
            ("DELETE", "/security/devices/3f1c3c1e-4b8e-4c62-9d1a-3f0e5e1b2a77"),
        ] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .method(method)
                        .uri(uri)
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn devices_list_each_login_and_bulk_logout_keeps_current() {
        let (app, _harness) = app_with_user().await;
        let mut cookies = Vec::new();
        for user_agent in [CHROME_WINDOWS, FIREFOX_LINUX, SAFARI_IPHONE, EDGE_MAC] {
            cookies.push(login(&app, user_agent).await.1);
        }

        let response = app
            .clone()
            .oneshot(with_cookie("GET", "/security/devices", &cookies[0]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let devices = body_json(response).await;
        let devices = devices.as_array().unwrap();
        assert_eq!(devices.len(), 4);
        let mut titles: Vec<&str> = devices
            .iter()
            .map(|device| device["title"].as_str().unwrap())
            .collect();
        titles.sort();
        assert_eq!(
            titles,
            vec![
                "Chrome 120.0.0.0 on Windows",
                "Edge 120.0.2210.91 on Mac OS",
                "Firefox 121.0 on Linux",
                "Safari 17.2 on iOS",
            ]
        );
        for device in devices {
            assert_eq!(device["ip"], "198.51.100.4");
            assert!(device["lastActiveDate"].is_string());
            assert!(device["deviceId"].is_string());
        }

        let response = app
            .clone()
            .oneshot(with_cookie("DELETE", "/security/devices", &cookies[0]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(with_cookie("GET", "/security/devices", &cookies[0]))
            .await
            .unwrap();
        let devices = body_json(response).await;
        let devices = devices.as_array().unwrap();
        assert_eq!(devices.len(), 1);
        let current: RefreshClaims = decode_claims(&cookies[0]).unwrap();
        assert_eq!(devices[0]["deviceId"], current.device_id.to_string());

        let response = app
            .clone()
            .oneshot(with_cookie("POST", "/auth/refresh-token", &cookies[1]))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn deleting_devices_checks_existence_and_ownership() {
        let (app, harness) = app_with_user().await;
        harness
            .store
            .register_user("user2", "user2@example.org", "asdfgh", 2)
            .await
            .unwrap();

        let (_, mine) = login(&app, CHROME_WINDOWS).await;
        let (_, my_other) = login(&app, FIREFOX_LINUX).await;
        let response = app
            .clone()
            .oneshot(login_request("user2", "asdfgh", SAFARI_IPHONE))
            .await
            .unwrap();
        let theirs = refresh_cookie_of(&response);
        let their_device: RefreshClaims = decode_claims(&theirs).unwrap();
        let my_other_device: RefreshClaims = decode_claims(&my_other).unwrap();

        let forbidden = app
            .clone()
            .oneshot(with_cookie(
                "DELETE",
                &format!("/security/devices/{}", their_device.device_id),
                &mine,
            ))
            .await
            .unwrap();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        for missing in ["not-a-uuid", "3f1c3c1e-4b8e-4c62-9d1a-3f0e5e1b2a77"] {
            let response = app
                .clone()
                .oneshot(with_cookie(
                    "DELETE",
                    &format!("/security/devices/{missing}"),
                    &mine,
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{missing}");
        }

        let deleted = app
            .clone()
            .oneshot(with_cookie(
                "DELETE",
                &format!("/security/devices/{}", my_other_device.device_id),
                &mine,
            ))
            .await
            .unwrap();
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(with_cookie("POST", "/auth/refresh-token", &theirs))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = app
            .clone()
            .oneshot(with_cookie("POST", "/auth/refresh-token", &my_other))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn me_requires_access_token() {
        let (app, _harness) = app_with_user().await;
        let (access, refresh) = login(&app, CHROME_WINDOWS).await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/auth/me")
                    .header("authorization", format!("Bearer {access}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let payload = body_json(response).await;
        assert_eq!(payload["userId"], TEST_USER_ID);
        assert_eq!(payload["login"], TEST_LOGIN);
        assert_eq!(payload["email"], TEST_EMAIL);

        for authorization in [None, Some(format!("Bearer {refresh}"))] {
            let mut builder = Request::builder().uri("/auth/me");
            if let Some(value) = &authorization {
                builder = builder.header("authorization", value);
            }
            let response = app
                .clone()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[tokio::test]
    async fn registration_routes_validate_and_accept() {
        let app = build_app(default_state());
        let post_json = |uri: &'static str, body: &'static str| {
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/registration",
                r#"{"login":"writer","password":"qwerty","email":"writer@example.org"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/registration",
                r#"{"login":"writer","password":"qwerty","email":"writer@example.org"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let payload = body_json(response).await;
        let fields: Vec<&str> = payload["details"]
            .as_array()
            .unwrap()
            .iter()
            .map(|detail| detail["field"].as_str().unwrap())
            .collect();
        assert_eq!(fields, vec!["login", "email"]);

        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/registration-confirmation",
                r#"{"code":"not-a-real-code"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/password-recovery",
                r#"{"email":"nobody@example.org"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .clone()
            .oneshot(post_json(
                "/auth/new-password",
                r#"{"newPassword":"long-enough","recoveryCode":"bogus"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["details"][0]["field"],
            "recoveryCode"
        );
    }

    #[tokio::test]
    async fn server_shuts_down_when_cancelled() {
        if bind_test_listener().await.is_none() {
            return;
        }
        let shutdown = CancellationToken::new();
        let mut config = ServerConfig::default();
        config.bind_addr = Some("127.0.0.1:0".into());
        let config = Arc::new(config);

        let handle = tokio::spawn(run(config, shutdown.clone()));

        sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let join = timeout(Duration::from_secs(2), handle)
            .await
            .expect("server did not shut down in time");
        join.expect("server task panicked")
            .expect("server returned error");
    }

    #[test]
    fn token_issuer_fills_missing_secrets_and_rejects_shared_ones() {
        let issuer = token_issuer(&AuthConfig::default());
        assert!(issuer.is_ok());

        let shared = AuthConfig {
            access_token_secret: Some("same".into()),
            refresh_token_secret: Some("same".into()),
            ..AuthConfig::default()
        };
        assert!(token_issuer(&shared).is_err());
    }

    #[test]
    fn cli_overrides_convert_and_apply() {
        let cli = Cli::parse_from([
            "quillhub-server",
            "--bind-addr",
            "127.0.0.1:9000",
            "--log-format",
            "json",
            "--access-token-secret",
            "access-from-cli",
            "--refresh-token-secret",
            "refresh-from-cli",
            "--cleanup-retention-days",
            "7",
        ]);
        assert!(cli.command.is_none());

        let overrides = cli.config.into_overrides();
        let mut config = ServerConfig::default();
        config.apply_overrides(&overrides).unwrap();
        assert_eq!(config.bind_addr.as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(
            config.auth.access_token_secret.as_deref(),
            Some("access-from-cli")
        );
        assert_eq!(config.cleanup.retention_days, 7);
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from([
            "quillhub-server",
            "seed-user",
            "--login",
            "user1",
            "--email",
            "user1@example.org",
            "--password",
            "qwerty",
        ]);
        match cli.command {
            Some(CliCommand::SeedUser(cmd)) => {
                assert_eq!(cmd.login, "user1");
                assert_eq!(cmd.email, "user1@example.org");
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = Cli::parse_from(["quillhub-server", "cleanup-sessions"]);
        assert!(matches!(cli.command, Some(CliCommand::CleanupSessions)));
    }

    #[cfg(feature = "metrics")]
    fn metrics_state(config: ServerConfig) -> (AppState, Arc<MetricsContext>) {
        let metrics_ctx = MetricsContext::init().expect("metrics init");
        let harness = SessionTestHarness::new();
        let state = app_state_with_config(&harness, Arc::new(config), ops::Backend::Memory)
            .with_metrics(Some(metrics_ctx.clone()));
        (state, metrics_ctx)
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_route_exposed_when_enabled() {
        let mut config = ServerConfig::default();
        config.metrics.enabled = true;
        let (state, _) = metrics_state(config);

        let app = build_app(state);
        app.clone()
            .oneshot(login_request("ghost", "nope-nope", CHROME_WINDOWS))
            .await
            .unwrap();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = str::from_utf8(&body).unwrap();
        assert!(text.contains(
            "quillhub_http_requests_total{route=\"/auth/login\",status=\"401\"} 1"
        ));
        assert!(text.contains("quillhub_auth_events_total{event=\"login_rejected\"} 1"));
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_route_absent_when_disabled() {
        let app = build_app(default_state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[cfg(feature = "metrics")]
    #[tokio::test]
    async fn metrics_route_served_on_dedicated_listener_when_configured() {
        let mut config = ServerConfig::default();
        config.metrics.enabled = true;
        config.metrics.bind_addr = Some("127.0.0.1:0".into());
        let (state, _) = metrics_state(config);

        let main_app = build_app(state.clone());
        let response = main_app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let metrics_app = metrics::router(state);
        let response = metrics_app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
