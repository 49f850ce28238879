//! Pod executor
//!
//! Launched by the control-plane agent, one process per task group. Runs
//! the group as a pod of containers and reports task state back.
//!
//! ## Architecture
//!
//! - **Driver**: Subscribes to the agent, dispatches events, tracks acks
//! - **Executor**: Translates tasks and sequences pod launch and kill
//! - **Pod**: Starts members on a shared network identity and watches them
//! - **Runtime**: Docker Engine API over the local unix socket

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use podex_executor::config::{Config, LogFormat};
use podex_executor::driver::{DriverError, DriverStatus, HttpTransport};
use podex_executor::metrics::TracingMetrics;
use podex_executor::runtime::DockerRuntime;
use podex_executor::{DriverHandle, Executor, ExecutorDriver, ExecutorHandler, ExecutorState};
use podex_networking::{CniBackend, CnmBackend, NetworkManager, MODE_CNI};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let (json, text) = match config.log_format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer())),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(json)
        .with(text)
        .init();

    info!("Starting pod executor");
    info!(
        agent = %config.agent_endpoint,
        framework_id = %config.framework_id,
        executor_id = %config.executor_id,
        directory = %config.directory.display(),
        network_mode = %config.network_mode,
        network_name = %config.network_name,
        "Configuration loaded"
    );

    let runtime = DockerRuntime::new(&config.docker_socket);
    if !runtime.socket_exists() {
        warn!(
            socket = %config.docker_socket.display(),
            "Docker socket not found; container operations will fail"
        );
    }

    // Only the configured mode is initialized; CNI needs plugins on disk.
    let network = if config.network_mode == MODE_CNI {
        NetworkManager::new().with_backend(Arc::new(CniBackend::new(config.cni_config())))
    } else {
        NetworkManager::new().with_backend(Arc::new(CnmBackend::new()))
    };
    network
        .init()
        .await
        .context("failed to initialize network backends")?;

    let metrics = Arc::new(TracingMetrics);
    let executor = Arc::new(Executor::new(
        config.executor_config(),
        Arc::new(runtime),
        network,
        metrics.clone(),
    ));

    let transport = HttpTransport::new(&config.agent_endpoint, Duration::from_secs(10))
        .context("failed to build agent client")?;
    let driver = DriverHandle::new(
        config.driver_config(),
        Arc::new(transport),
        executor.clone(),
        metrics,
    );

    let session = tokio::spawn({
        let driver = driver.clone();
        async move { driver.run().await }
    });
    tokio::pin!(session);

    let outcome = tokio::select! {
        result = &mut session => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
            // Same path as an agent SHUTDOWN: kill the pod, then stop.
            executor.shutdown(Arc::new(driver.clone())).await;
            let bound = config.stop_grace + config.ack_wait + Duration::from_secs(5);
            match tokio::time::timeout(bound, &mut session).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Pod teardown did not finish in time");
                    driver.stop().await;
                    session.await
                }
            }
        }
    };

    match outcome {
        Ok(Ok(DriverStatus::Stopped)) => {
            info!("Pod executor shutdown complete");
            Ok(())
        }
        Ok(Ok(status)) => {
            warn!(status = ?status, "Driver exited");
            Ok(())
        }
        Ok(Err(DriverError::Aborted)) => {
            error!("Driver aborted, tearing down pod");
            executor.shutdown(Arc::new(driver.clone())).await;
            wait_for_teardown(&executor, config.stop_grace + Duration::from_secs(5)).await;
            std::process::exit(1);
        }
        Ok(Err(e)) => Err(e.into()),
        Err(e) => {
            error!(error = %e, "Driver task panicked");
            std::process::exit(1);
        }
    }
}

/// Polls until the executor has released its pod or `bound` passes.
async fn wait_for_teardown(executor: &Executor, bound: Duration) {
    let deadline = tokio::time::Instant::now() + bound;
    while executor.state() != ExecutorState::Shutdown {
        if tokio::time::Instant::now() >= deadline {
            warn!(state = ?executor.state(), "Pod teardown did not finish in time");
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
