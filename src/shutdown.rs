use crate::store::ReservationStore;
use crate::{Result, ReservationError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::time::Duration;
use tracing::{error, info, warn};

/// Graceful shutdown coordinator
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_tx: Arc<watch::Sender<bool>>,
    components: Arc<Mutex<Vec<Arc<dyn ShutdownComponent>>>>,
    shutdown_timeout: Duration,
}

/// Trait for components that need graceful shutdown
#[async_trait::async_trait]
pub trait ShutdownComponent: Send + Sync {
    async fn shutdown(&self) -> Result<()>;
    fn name(&self) -> &str;
}

impl ShutdownCoordinator {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            shutdown_tx: Arc::new(shutdown_tx),
            components: Arc::new(Mutex::new(Vec::new())),
            shutdown_timeout,
        }
    }

    /// Register a component; components shut down in registration order.
    pub async fn register_component(&self, component: Arc<dyn ShutdownComponent>) {
        let mut components = self.components.lock().await;
        info!("Registering component '{}' for graceful shutdown", component.name());
        components.push(component);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Trigger graceful shutdown. Only the first call does any work.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }
        info!("Initiating graceful shutdown...");

        let components: Vec<Arc<dyn ShutdownComponent>> = self.components.lock().await.clone();

        let shutdown_all = async {
            let mut failures = 0;
            for component in &components {
                info!("Shutting down component '{}'", component.name());
                match component.shutdown().await {
                    Ok(()) => info!("Component '{}' shutdown successfully", component.name()),
                    Err(e) => {
                        error!("Component '{}' shutdown failed: {}", component.name(), e);
                        failures += 1;
                    }
                }
            }
            failures
        };

        match tokio::time::timeout(self.shutdown_timeout, shutdown_all).await {
            Ok(0) => {
                info!("All components shutdown successfully");
                Ok(())
            }
            Ok(failures) => Err(ReservationError::InvalidArgument(format!(
                "{} component(s) failed to shut down",
                failures
            ))),
            Err(_) => {
                error!("Shutdown timeout exceeded, forcing exit");
                Err(ReservationError::InvalidArgument(
                    "Shutdown timeout exceeded".to_string(),
                ))
            }
        }
    }

    /// Resolves once `shutdown` has been called.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|down| *down).await;
    }
}

/// Flushes the reservation store on shutdown.
pub struct StoreShutdown {
    store: Arc<dyn ReservationStore>,
}

impl StoreShutdown {
    pub fn new(store: Arc<dyn ReservationStore>) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for StoreShutdown {
    async fn shutdown(&self) -> Result<()> {
        info!("Flushing reservation store...");
        self.store.flush().await?;
        info!("Reservation store flushed successfully");
        Ok(())
    }

    fn name(&self) -> &str {
        "reservation-store"
    }
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C elsewhere).
pub async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, initiating graceful shutdown");
    }

    Ok(())
}

/// Run `service` until it finishes or `shutdown_signal` resolves, then shut
/// every registered component down.
pub async fn run_until_shutdown<S, F>(
    service_name: &str,
    service: S,
    shutdown_signal: F,
    coordinator: ShutdownCoordinator,
) -> Result<()>
where
    S: Future<Output = Result<()>>,
    F: Future<Output = Result<()>>,
{
    info!("Starting service '{}'", service_name);

    let service_result = tokio::select! {
        result = service => {
            info!("Service '{}' completed", service_name);
            result
        }
        signal = shutdown_signal => {
            if let Err(e) = signal {
                warn!("Signal handling failed for '{}': {}", service_name, e);
            }
            info!("Service '{}' received shutdown signal", service_name);
            Ok(())
        }
        _ = coordinator.wait_for_shutdown() => {
            info!("Service '{}' shutdown requested", service_name);
            Ok(())
        }
    };

    if let Err(e) = coordinator.shutdown().await {
        error!("Failed to shutdown service '{}': {}", service_name, e);
        return Err(e);
    }

    service_result
}
