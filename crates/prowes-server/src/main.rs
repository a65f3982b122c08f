use clap::Parser;
use prowes_backend::connect_backend;
use prowes_contract::storage::RunStore;
use prowes_server::config::GatewayConfig;
use prowes_server::dispatcher::Dispatcher;
use prowes_server::http;
use prowes_server::reconciler::Reconciler;
use prowes_server::service::AppState;
use prowes_server::service_info::ServiceInfoRegistry;
use prowes_store_adapters::FileStore;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "prowes-server")]
struct Args {
    #[arg(long, env = "PROWES_HTTP_ADDR", default_value = "127.0.0.1:8080")]
    http_addr: String,

    #[arg(long, env = "PROWES_STORAGE_DIR", default_value = "./runs")]
    storage_dir: PathBuf,

    /// JSON gateway configuration. Built-in defaults apply when omitted.
    #[arg(long, env = "PROWES_CONFIG")]
    config: Option<PathBuf>,

    /// Downstream service URL; overrides `backend.url` from the config file.
    #[arg(long, env = "PROWES_BACKEND_URL")]
    backend_url: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_filter).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut cfg = match &args.config {
        Some(path) => match GatewayConfig::from_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(2);
            }
        },
        None => GatewayConfig::default(),
    };
    if let Some(url) = args.backend_url {
        cfg.backend.url = url;
    }

    let backend = match connect_backend(&cfg.backend) {
        Ok(backend) => backend,
        Err(e) => {
            eprintln!("invalid backend configuration: {e}");
            std::process::exit(2);
        }
    };
    let store: Arc<dyn RunStore> = Arc::new(FileStore::new(args.storage_dir));
    let shutdown = CancellationToken::new();

    let (dispatcher, mut workers) = Dispatcher::start(
        store.clone(),
        backend.clone(),
        cfg.dispatch.clone(),
        shutdown.clone(),
    );
    if let Err(e) = dispatcher.recover().await {
        tracing::error!(error = %e, "failed to re-enqueue queued runs");
    }
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        backend.clone(),
        cfg.reconcile.clone(),
    ));
    workers.push(reconciler.spawn(shutdown.clone()));

    let app = http::router(AppState {
        store,
        backend: backend.clone(),
        dispatcher,
        service_info: ServiceInfoRegistry::new(cfg.service_info),
        post_runs: cfg.post_runs,
        list_runs: cfg.list_runs,
    });

    let listener = match tokio::net::TcpListener::bind(&args.http_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind {}: {e}", args.http_addr);
            std::process::exit(2);
        }
    };
    tracing::info!(
        addr = %args.http_addr,
        backend = %backend.kind(),
        backend_url = %cfg.backend.url,
        "proWES gateway listening"
    );

    let signal = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            signal.cancel();
        })
        .await;
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    if let Err(e) = served {
        eprintln!("http server crashed: {e}");
        std::process::exit(1);
    }
}
