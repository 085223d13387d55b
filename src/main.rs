use mqtt_device_bridge::auth::OpenIdAuth;
use mqtt_device_bridge::bus::RestProducer;
use mqtt_device_bridge::commands::{self, CommandDispatcher, QueuedCommandDispatcher};
use mqtt_device_bridge::config::Config;
use mqtt_device_bridge::connection_log::{ConnectionLog, SqlConnectionLog, VoidConnectionLog};
use mqtt_device_bridge::db::DatabaseService;
use mqtt_device_bridge::mqtt_service::{MqttConfig, MqttService};
use mqtt_device_bridge::notify::{HttpNotifier, Notifier};
use mqtt_device_bridge::registry::HttpRegistry;
use mqtt_device_bridge::service_utils::{handle_shutdown, serve, shutdown_channel, start_mqtt_service};
use mqtt_device_bridge::topic::TopicResolver;
use mqtt_device_bridge::webhook::{self, WebhookState};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

type BoxError = Box<dyn Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    // Initialize logging
    let level = match &config {
        Ok(cfg) if cfg.debug => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Load configuration
    let config = match config {
        Ok(cfg) => Arc::new(cfg),
        Err(e) => {
            error!("Error loading configuration: {}", e);
            return;
        }
    };

    if let Err(e) = run(config).await {
        error!("Bridge stopped with error: {}", e);
        std::process::exit(1);
    }
    info!("All services shut down successfully.");
}

fn connection_log(config: &Config, producer: Arc<RestProducer>) -> Result<Arc<dyn ConnectionLog>, BoxError> {
    let Some(path) = &config.subscription_db_path else {
        info!("subscription tracking disabled");
        return Ok(Arc::new(VoidConnectionLog));
    };
    let db_service = DatabaseService::open(path)?;
    db_service.initialize_db()?;
    info!(path = %path, "Database initialized successfully.");
    Ok(Arc::new(SqlConnectionLog::new(
        Arc::new(db_service),
        producer,
        config.device_log_topic.clone(),
    )))
}

async fn run(config: Arc<Config>) -> Result<(), BoxError> {
    let registry = Arc::new(HttpRegistry::new(&config.device_repo_url)?);
    let auth = Arc::new(OpenIdAuth::new(
        &config.auth_endpoint,
        &config.auth_client_id,
        &config.auth_client_secret,
        Duration::from_secs(config.auth_expiration_time_buffer_s),
    )?);
    let producer = Arc::new(RestProducer::new(&config.bus_url)?);
    let notifier: Option<Arc<dyn Notifier>> = match &config.notification_url {
        Some(url) => Some(Arc::new(HttpNotifier::new(
            url,
            config.notifications_ignore_duplicates_within_s,
        )?)),
        None => None,
    };
    let connection_log = connection_log(&config, producer.clone())?;
    let resolver = Arc::new(TopicResolver::new(
        registry,
        config.actuator_topic_pattern.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = shutdown_channel();

    let mqtt_service = MqttService::new(MqttConfig {
        mqtt_host: config.mqtt_host.clone(),
        mqtt_port: config.mqtt_port,
        mqtt_username: config.auth_client_id.clone(),
        mqtt_password: config.auth_client_secret.clone(),
        mqtt_client_id: format!("{}_{}", config.auth_client_id, Uuid::new_v4()),
        mqtt_max_retries: config.mqtt_max_retries,
        mqtt_retry_interval_ms: config.mqtt_retry_interval_ms,
    });
    let mqtt_task = start_mqtt_service(mqtt_service.clone(), shutdown_rx.clone());

    let dispatcher = Arc::new(CommandDispatcher::new(
        resolver.clone(),
        mqtt_service,
        config.mqtt_qos,
    ));
    let queue = Arc::new(QueuedCommandDispatcher::start(
        dispatcher,
        config.command_worker_count,
    ));

    let webhook_state = Arc::new(WebhookState {
        auth_client_id: config.auth_client_id.clone(),
        auth_method: config.mqtt_auth_method,
        auth,
        resolver,
        connection_log,
        producer,
        notifier,
    });

    let webhook_listener = TcpListener::bind(("0.0.0.0", config.webhook_port)).await?;
    let command_listener = TcpListener::bind(("0.0.0.0", config.command_port)).await?;
    let webhook_task = serve(
        "webhook",
        webhook_listener,
        webhook::router(webhook_state),
        shutdown_rx.clone(),
    );
    let command_task = serve(
        "commands",
        command_listener,
        commands::router(queue.clone()),
        shutdown_rx,
    );

    handle_shutdown(shutdown_tx).await;

    // Wait for tasks to complete
    let _ = tokio::join!(webhook_task, command_task);
    queue.shutdown().await;
    let _ = mqtt_task.await;
    Ok(())
}
