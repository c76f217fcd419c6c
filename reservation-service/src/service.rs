use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde::Serialize;
use space_reservation::shutdown::{run_until_shutdown, wait_for_signal, ShutdownCoordinator, StoreShutdown};
use space_reservation::{ConsumerSupervisor, Metrics, ReservationContext, ReservationError, Result, ServiceConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub struct ReservationService {
    context: ReservationContext,
    coordinator: ShutdownCoordinator,
    ops_addr: SocketAddr,
}

#[derive(Clone)]
struct OpsState {
    metrics: Metrics,
    supervisor: Arc<ConsumerSupervisor>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    consumers_running: bool,
}

impl ReservationService {
    pub fn new(config: ServiceConfig, ops_port: u16) -> Result<Self> {
        let coordinator = ShutdownCoordinator::new(config.shutdown_timeout());
        let context = ReservationContext::connect(config, Metrics::new()?)?;

        Ok(Self {
            context,
            coordinator,
            ops_addr: SocketAddr::from(([0, 0, 0, 0], ops_port)),
        })
    }

    pub async fn run(self) -> Result<()> {
        let supervisor = self.context.start_consumers().await?;

        // consumers stop before the store is flushed
        self.coordinator.register_component(supervisor.clone()).await;
        self.coordinator
            .register_component(Arc::new(StoreShutdown::new(Arc::clone(&self.context.store))))
            .await;

        let app = Router::new()
            .route("/health", get(health_check))
            .route("/metrics", get(export_metrics))
            .layer(TraceLayer::new_for_http())
            .with_state(OpsState {
                metrics: self.context.metrics.clone(),
                supervisor,
            });

        let listener = tokio::net::TcpListener::bind(self.ops_addr).await?;
        info!("Reservation Service listening on {}", self.ops_addr);

        let coordinator = self.coordinator.clone();
        let server = async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { coordinator.wait_for_shutdown().await })
                .await
                .map_err(ReservationError::from)
        };

        run_until_shutdown("reservation-service", server, wait_for_signal(), self.coordinator).await
    }
}

async fn health_check(State(state): State<OpsState>) -> (StatusCode, Json<HealthResponse>) {
    if state.supervisor.is_running().await {
        (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                consumers_running: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "degraded",
                consumers_running: false,
            }),
        )
    }
}

async fn export_metrics(State(state): State<OpsState>) -> std::result::Result<String, StatusCode> {
    state.metrics.export().map_err(|e| {
        error!("Error exporting metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
