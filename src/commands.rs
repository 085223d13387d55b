//! Delivery of backend commands onto device topics.

use crate::models::Command;
use crate::mqtt_service::{MqttError, Publisher};
use crate::topic::{CreateError, TopicResolver};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use http::StatusCode;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unable to create topic: {0}")]
    Topic(#[from] CreateError),
    #[error("unable to publish command: {0}")]
    Publish(#[from] MqttError),
    #[error("command queue is closed")]
    QueueClosed,
}

pub struct CommandDispatcher {
    resolver: Arc<TopicResolver>,
    publisher: Arc<dyn Publisher>,
    default_qos: u8,
}

impl CommandDispatcher {
    pub fn new(resolver: Arc<TopicResolver>, publisher: Arc<dyn Publisher>, default_qos: u8) -> Self {
        Self {
            resolver,
            publisher,
            default_qos,
        }
    }

    pub async fn handle(&self, command: &Command) -> Result<(), DispatchError> {
        let topic = self
            .resolver
            .create(&command.device_id, &command.service_local_id)?;
        let qos = command.qos.unwrap_or(self.default_qos);
        debug!(
            device = %command.device_id,
            service = %command.service_id,
            topic = %topic,
            qos,
            "dispatching command"
        );
        self.publisher
            .publish(&topic, command.payload.as_bytes(), qos)
            .await?;
        Ok(())
    }
}

/// Bounded queue in front of a [`CommandDispatcher`], drained by a fixed set
/// of workers. `enqueue` waits for capacity instead of dropping commands.
pub struct QueuedCommandDispatcher {
    sender: Mutex<Option<mpsc::Sender<Command>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl QueuedCommandDispatcher {
    pub fn start(dispatcher: Arc<CommandDispatcher>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (sender, receiver) = mpsc::channel::<Command>(worker_count);
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..worker_count)
            .map(|worker| {
                let dispatcher = dispatcher.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(command) = next else {
                            break;
                        };
                        if let Err(e) = dispatcher.handle(&command).await {
                            error!(
                                worker,
                                device = %command.device_id,
                                service = %command.service_id,
                                error = %e,
                                "unable to dispatch command"
                            );
                        }
                    }
                    debug!(worker, "command worker stopped");
                })
            })
            .collect();
        info!(worker_count, "command workers started");

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    pub async fn enqueue(&self, command: Command) -> Result<(), DispatchError> {
        let sender = self
            .sender
            .lock()
            .await
            .clone()
            .ok_or(DispatchError::QueueClosed)?;
        sender
            .send(command)
            .await
            .map_err(|_| DispatchError::QueueClosed)
    }

    /// Stops accepting commands. Already queued commands are still delivered.
    pub async fn close(&self) {
        self.sender.lock().await.take();
    }

    /// Closes the queue and waits for the workers to drain it.
    pub async fn shutdown(&self) {
        self.close().await;
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                error!(error = %e, "command worker failed");
            }
        }
    }
}

pub fn router(queue: Arc<QueuedCommandDispatcher>) -> Router {
    Router::new()
        .route("/commands", post(receive_command))
        .layer(TraceLayer::new_for_http())
        .with_state(queue)
}

async fn receive_command(
    State(queue): State<Arc<QueuedCommandDispatcher>>,
    payload: Result<Json<Command>, JsonRejection>,
) -> StatusCode {
    let Json(command) = match payload {
        Ok(command) => command,
        Err(rejection) => {
            warn!(error = %rejection, "malformed command");
            return StatusCode::BAD_REQUEST;
        }
    };
    match queue.enqueue(command).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            warn!(error = %e, "command rejected");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
