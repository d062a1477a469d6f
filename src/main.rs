use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::post;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use esimgate::activation::Orchestrator;
use esimgate::clients::billing::{BillingLedger, HttpBillingLedger};
use esimgate::clients::notify::MailNotifier;
use esimgate::clients::provisioner::HttpProvisioner;
use esimgate::config::{self, AdmissionBackend, Config};
use esimgate::limiter::{memory::SlidingWindow, redis::SharedWindow, AdmissionControl};
use esimgate::metering::MeteringReporter;
use esimgate::store::postgres::{NewApiKey, PgStore};
use esimgate::store::ActivationStore;
use esimgate::{api, keys, mcp, middleware, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "esimgate=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => run_server(cfg, port).await,
        Some(cli::Commands::Key { command }) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            handle_key_command(&db, &cfg, command).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    let limiter: Arc<dyn AdmissionControl> = match cfg.admission_backend {
        AdmissionBackend::Memory => {
            tracing::info!(
                limit = cfg.admission_limit,
                window_secs = cfg.admission_window_secs,
                "using in-process admission limiter"
            );
            Arc::new(SlidingWindow::new(
                cfg.admission_limit,
                cfg.admission_window_secs,
            ))
        }
        AdmissionBackend::Redis => {
            let url = cfg
                .redis_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("redis admission backend requires REDIS_URL"))?;
            tracing::info!("Connecting to Redis for shared admission window...");
            let client = redis::Client::open(url)?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            Arc::new(SharedWindow::new(
                conn,
                cfg.admission_limit,
                cfg.admission_window_secs,
            ))
        }
    };

    let store: Arc<dyn ActivationStore> = Arc::new(db.clone());
    let provisioner = Arc::new(HttpProvisioner::new(
        cfg.provisioner_url.clone(),
        cfg.provisioner_api_key.clone(),
    ));
    let ledger: Arc<dyn BillingLedger> = Arc::new(HttpBillingLedger::new(
        cfg.billing_url.clone(),
        cfg.billing_api_key.clone(),
    ));
    let notifier = Arc::new(MailNotifier::new(
        cfg.mailer_url.clone(),
        cfg.mailer_api_key.clone(),
    ));

    let orchestrator = Orchestrator::new(
        store.clone(),
        provisioner,
        ledger.clone(),
        notifier,
        limiter,
        cfg.product_id.clone(),
    );
    let reporter = MeteringReporter::new(store, ledger, cfg.metering_units_per_call);

    let state = Arc::new(AppState {
        db,
        config: cfg,
        orchestrator,
        reporter,
    });

    let app = axum::Router::new()
        // Health endpoints (no auth)
        .route("/healthz", axum::routing::get(|| async { "ok" }))
        .route("/readyz", axum::routing::get(readiness_check))
        // Tool endpoint — behind per-key auth + quota
        .route(
            "/mcp",
            post(mcp::handler::rpc_handler).layer(axum::middleware::from_fn_with_state(
                state.clone(),
                middleware::auth::require_api_key,
            )),
        )
        // Management API, nested under /api/v1
        .nest("/api/v1", api::api_router(state.clone()))
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("esimgate listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

async fn readiness_check() -> &'static str {
    "ok"
}

/// Middleware: injects a unique X-Request-Id into every response.
/// This allows clients to correlate errors with gateway logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn handle_key_command(
    db: &PgStore,
    cfg: &Config,
    cmd: cli::KeyCommands,
) -> anyhow::Result<()> {
    match cmd {
        cli::KeyCommands::Create {
            label,
            quota,
            owner,
        } => {
            let owner_identity = owner
                .map(|o| {
                    o.parse::<uuid::Uuid>()
                        .map_err(|_| anyhow::anyhow!("invalid owner identity id: {}", o))
                })
                .transpose()?;

            let (secret, key_hash) = keys::mint_secret();
            let key = db
                .insert_api_key(&NewApiKey {
                    key_hash,
                    label: label.clone(),
                    hourly_quota: quota.unwrap_or(cfg.default_key_quota),
                    owner_identity,
                    allowed_origins: None,
                })
                .await?;

            println!(
                "Key created:\n  ID:     {}\n  Label:  {}\n  Quota:  {}/hour\n  Secret: {}\n\n\
                 Store the secret now — it cannot be retrieved again.\n  Use:    Authorization: Bearer {}",
                key.id, key.label, key.hourly_quota, secret, secret
            );
        }
        cli::KeyCommands::List => {
            let keys = db.list_api_keys().await?;
            if keys.is_empty() {
                println!("No keys found.");
            } else {
                println!(
                    "{:<38} {:<20} {:<10} {:<8} CALLS",
                    "ID", "LABEL", "QUOTA/H", "ACTIVE"
                );
                for k in keys {
                    println!(
                        "{:<38} {:<20} {:<10} {:<8} {}",
                        k.id, k.label, k.hourly_quota, k.is_active, k.total_calls
                    );
                }
            }
        }
        cli::KeyCommands::Revoke { id } => {
            let key_id = id
                .parse::<uuid::Uuid>()
                .map_err(|_| anyhow::anyhow!("invalid key id: {}", id))?;
            if db.revoke_api_key(key_id).await? {
                println!("Key revoked.");
            } else {
                println!("Key not found.");
            }
        }
    }
    Ok(())
}
