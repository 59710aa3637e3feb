use std::{net::SocketAddr, process, sync::Arc};

use latex_compiler::{
    application::{
        compile::{CompilationService, HealthStatus},
        error::AppError,
    },
    config::{self, Settings},
    infra::{
        error::InfraError,
        http::{self, HttpState, RateLimiter},
        telemetry,
    },
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{Dispatch, Level, debug, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(code) => process::exit(code),
        Err(error) => {
            report_application_error(&error);
            process::exit(1);
        }
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

async fn run() -> Result<i32, AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::from(InfraError::configuration(err.to_string())))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    let _telemetry = telemetry::init(&settings.logging).map_err(AppError::from)?;

    let service = CompilationService::from_settings(&settings.compiler)
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    match command {
        config::Command::Serve(_) => {
            run_serve(settings, service).await?;
            Ok(0)
        }
        config::Command::Check(_) => Ok(run_check(&service).await),
    }
}

async fn run_check(service: &CompilationService) -> i32 {
    let status = service.check_toolchain().await;
    info!(
        target = "latex_compiler::check",
        status = status.as_str(),
        "Toolchain self-check finished"
    );
    match status {
        HealthStatus::Ok => 0,
        HealthStatus::Error => 1,
    }
}

async fn run_serve(settings: Settings, service: CompilationService) -> Result<(), AppError> {
    let rate_limiter = Arc::new(
        RateLimiter::new(
            std::time::Duration::from_secs(u64::from(settings.rate_limit.window_seconds.get())),
            settings.rate_limit.max_requests.get(),
        )
        .trust_forwarded_for(settings.rate_limit.trust_forwarded_for),
    );
    let prune_handle = spawn_rate_limit_pruner(rate_limiter.clone());

    let state = HttpState {
        service: Arc::new(service),
        rate_limiter,
        environment: settings.environment,
    };
    let body_limit = usize::try_from(settings.uploads.max_request_bytes.get())
        .map_err(|_| AppError::unexpected("uploads.max_request_bytes exceeds usize"))?;
    let router = http::build_router(state, body_limit, &settings.cors);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "latex_compiler::serve",
        addr = %settings.server.addr,
        environment = %settings.environment,
        program = %settings.compiler.program.display(),
        "Listening"
    );

    let (signal_tx, mut signal_rx) = watch::channel(false);
    let server = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });
    let mut server_handle = tokio::spawn(async move { server.await });

    let finished = tokio::select! {
        joined = &mut server_handle => Some(joined),
        _ = signal_rx.wait_for(|received| *received) => None,
    };

    let result = match finished {
        Some(joined) => joined,
        None => {
            info!(
                target = "latex_compiler::serve",
                grace_seconds = settings.server.graceful_shutdown.as_secs(),
                "Shutdown requested, draining in-flight requests"
            );
            match tokio::time::timeout(settings.server.graceful_shutdown, &mut server_handle).await
            {
                Ok(joined) => joined,
                Err(_) => {
                    warn!(
                        target = "latex_compiler::serve",
                        "Graceful shutdown window elapsed, aborting remaining requests"
                    );
                    server_handle.abort();
                    Ok(Ok(()))
                }
            }
        }
    };

    prune_handle.abort();
    let _ = prune_handle.await;

    result
        .map_err(|err| AppError::unexpected(format!("server task failed: {err}")))?
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

fn spawn_rate_limit_pruner(limiter: Arc<RateLimiter>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(limiter.window());
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let pruned = limiter.prune();
            if pruned > 0 {
                debug!(
                    target = "latex_compiler::http::rate_limit",
                    pruned,
                    "Pruned idle rate-limit buckets"
                );
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "latex_compiler::serve", error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "latex_compiler::serve", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
