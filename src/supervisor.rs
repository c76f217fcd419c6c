use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::kafka::MessageBrokerClient;
use crate::shutdown::ShutdownComponent;
use crate::{Result, ReservationError};

/// Runs the broker client's dispatch loop as a background task for the
/// lifetime of the process.
pub struct ConsumerSupervisor {
    client: Arc<MessageBrokerClient>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ConsumerSupervisor {
    pub fn new(client: Arc<MessageBrokerClient>) -> Self {
        Self {
            client,
            task: Mutex::new(None),
        }
    }

    /// Spawn the dispatch loop. Subscriptions must be complete by now.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(ReservationError::RegistryClosed(
                "consumer supervisor already started".to_string(),
            ));
        }

        let client = Arc::clone(&self.client);
        *task = Some(tokio::spawn(async move { client.run().await }));
        info!("Consumer supervisor started for {:?}", self.client.topics());
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        match self.task.lock().await.as_ref() {
            Some(task) => !task.is_finished(),
            None => false,
        }
    }

    /// Request a stop, wait for the loop within the client's shutdown bound
    /// (aborting it past that), then release the client's resources.
    pub async fn stop(&self) {
        self.client.request_stop();

        let task = self.task.lock().await.take();
        if let Some(mut task) = task {
            let bound = self.client.shutdown_bound();
            match tokio::time::timeout(bound, &mut task).await {
                Ok(Ok(Ok(()))) => info!("Dispatch loop exited"),
                Ok(Ok(Err(e))) => error!("Dispatch loop ended with error: {}", e),
                Ok(Err(e)) => error!("Dispatch task failed: {}", e),
                Err(_) => {
                    warn!("Dispatch loop did not exit within {:?}, aborting", bound);
                    task.abort();
                    let _ = task.await;
                }
            }
        }

        self.client.stop().await;
    }
}

#[async_trait::async_trait]
impl ShutdownComponent for ConsumerSupervisor {
    async fn shutdown(&self) -> Result<()> {
        self.stop().await;
        Ok(())
    }

    fn name(&self) -> &str {
        "consumer-supervisor"
    }
}
