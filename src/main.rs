use std::{process, sync::Arc};

use stowaway::{
    cache::{
        CacheStore, ControlPlane, ControlReply, ControlRequest, DiskStore, Fetcher,
        LifecycleController, MemoryStore, StrategyEngine,
    },
    config::{self, ControlArgs, Settings, StoreBackend},
    error::AppError,
    infra::{
        control_client::ControlClient,
        error::InfraError,
        fetch::HttpFetcher,
        http::{self, ProxyState},
        manifest, telemetry,
    },
};
use tokio::{sync::oneshot, time::timeout};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const CONTROL_QUEUE_CAPACITY: usize = 64;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Status(args) => {
            let request = ControlRequest::GetStatus {
                namespace: args.namespace,
            };
            run_control(&settings, &args.control, request).await
        }
        config::Command::Clear(args) => {
            let request = ControlRequest::ClearCache {
                namespace: args.namespace,
            };
            run_control(&settings, &args.control, request).await
        }
        config::Command::Activate(args) => {
            run_control(&settings, &args, ControlRequest::ForceActivate).await
        }
    }
}

async fn open_store(settings: &Settings) -> Result<Arc<dyn CacheStore>, AppError> {
    match settings.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Disk => {
            let store = DiskStore::open(settings.store.directory.clone())
                .await
                .map_err(stowaway::cache::CacheError::from)?;
            info!(root = %store.root().display(), "Opened disk cache store");
            Ok(Arc::new(store))
        }
    }
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let store = open_store(&settings).await?;
    let origin = settings
        .cache
        .origin
        .clone()
        .unwrap_or_else(|| settings.server.upstream.clone());
    let fetcher: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(origin.origin())?);

    let precache = manifest::load(&settings.cache).await?;
    let precache_namespace = settings.cache.precache_namespace();
    let routes = settings
        .routes
        .clone()
        .with_precache_route(precache_namespace.clone(), precache.urls());
    let mut current = routes.namespaces();
    current.extend(
        precache
            .entries
            .iter()
            .filter_map(|entry| entry.namespace.clone()),
    );

    let engine = StrategyEngine::new(store.clone(), fetcher.clone(), routes)
        .with_network_timeout(settings.cache.network_timeout());

    let lifecycle = Arc::new(
        LifecycleController::new(store.clone(), fetcher.clone(), precache_namespace, current)
            .with_cacheable(settings.cache.cacheable.clone())
            .with_preserved_prefixes(settings.cache.preserved_prefixes.iter().cloned())
            .with_skip_waiting(settings.cache.skip_waiting),
    );

    match lifecycle.on_install(&precache).await {
        Ok(report) => {
            info!(
                fetched = report.fetched,
                reused = report.reused,
                "Precache installed"
            );
            if lifecycle.ready_to_activate() {
                let pruned = lifecycle.activate().await?;
                info!(pruned = pruned.len(), "Activated cache version");
            } else {
                info!("Install waiting for an explicit activate");
            }
        }
        Err(err) => {
            warn!(error = %err, "Install failed, serving without a fresh precache");
        }
    }

    let plane = Arc::new(
        ControlPlane::new(store.clone(), lifecycle.clone())
            .with_default_namespace(settings.cache.default_namespace()),
    );
    let (control, control_task) = plane.spawn(CONTROL_QUEUE_CAPACITY);

    let router = http::build_router(ProxyState {
        engine,
        fetcher,
        control,
        upstream: settings.server.upstream.clone(),
    });

    let listener = tokio::net::TcpListener::bind(settings.server.listen_addr)
        .await
        .map_err(InfraError::from)?;
    info!(
        addr = %settings.server.listen_addr,
        upstream = %settings.server.upstream,
        version = %settings.cache.version,
        "Serving cache proxy"
    );

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });

    let served = tokio::select! {
        result = &mut server => result,
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "Failed to listen for shutdown signal");
            }
            let grace = settings.server.graceful_shutdown;
            info!(grace_seconds = grace.as_secs(), "Shutdown requested, draining connections");
            let _ = shutdown_tx.send(());
            match timeout(grace, &mut server).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Graceful shutdown timed out, aborting open connections");
                    server.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    served
        .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    control_task.abort();
    let _ = control_task.await;
    Ok(())
}

async fn run_control(
    settings: &Settings,
    args: &ControlArgs,
    request: ControlRequest,
) -> Result<(), AppError> {
    let endpoint = args
        .endpoint
        .clone()
        .unwrap_or_else(|| settings.server.control_url());
    let client = ControlClient::new(&endpoint)?;
    let reply = client.send(&request).await?;

    let rendered = serde_json::to_string_pretty(&reply)
        .map_err(|err| AppError::unexpected(format!("failed to render reply: {err}")))?;
    println!("{rendered}");

    match reply {
        ControlReply::Error { error, .. } => Err(AppError::unexpected(error)),
        _ => Ok(()),
    }
}
