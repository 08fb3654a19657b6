//! presenced - Subscribe to camera frames over MQTT and run region presence.
//!
//! Frames arrive on `{topic_prefix}/{camera}` as raw JPEG payloads. The
//! capture time is read from the `timestamp` MQTT v5 user property (unix
//! seconds, fractions ignored) and falls back to the receive time.
//!
//! Each frame is handed to its camera's worker, which runs detection, region
//! presence and enrichment. Presence start/end messages go to the configured
//! webhook, or to the log when none is set.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rumqttc::v5::mqttbytes::v5::Publish;
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use presence_kernel::config::PresenceConfig;
use presence_kernel::ingest::{camera_from_topic, parse_broker, parse_timestamp, DEFAULT_QUEUE_DEPTH};
use presence_kernel::services::{
    FsObjectStore, HttpEmbeddingService, HttpFaceService, HttpVisionService, LogSink,
    NotificationSink, SqliteVectorStore, WebhookSink,
};
use presence_kernel::{
    now_s, Collaborators, FrameMessage, NotificationDispatcher, PersonPipeline, TimerScheduler,
    WorkerPool,
};

const DAEMON_NAME: &str = "presenced";
const TIMESTAMP_PROPERTY: &str = "timestamp";
const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(
    name = DAEMON_NAME,
    about = "Region presence daemon: MQTT camera frames in, presence notifications out"
)]
struct Args {
    /// Config file (JSON, or TOML by extension).
    #[arg(long, env = "PRESENCE_CONFIG")]
    config: Option<PathBuf>,

    /// Frames buffered per camera before new ones are dropped.
    #[arg(long, env = "PRESENCE_QUEUE_DEPTH", default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,
}

type SharedClient = Arc<Mutex<Option<Client>>>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = PresenceConfig::load_from(args.config.as_deref()).context("load configuration")?;
    if cfg.cameras.is_empty() {
        return Err(anyhow!("no cameras configured"));
    }
    let (host, port) = parse_broker(&cfg.mqtt.broker)?;

    let dispatcher = NotificationDispatcher::spawn(build_sink(&cfg), cfg.notifications.queue_capacity)
        .context("spawn notification thread")?;
    let collaborators = build_collaborators(&cfg, dispatcher.clone())?;
    let scheduler = TimerScheduler::spawn("presence-timers").context("spawn timer thread")?;
    let pipeline = Arc::new(
        PersonPipeline::new(
            Arc::new(cfg.catalog()),
            collaborators,
            cfg.pipeline_settings(),
            scheduler.clone(),
        )
        .context("prepare vector collections")?,
    );
    let pool = Arc::new(WorkerPool::spawn(pipeline.clone(), args.queue_depth)?);

    let running = Arc::new(AtomicBool::new(true));
    let current: SharedClient = Arc::new(Mutex::new(None));
    {
        let running = running.clone();
        let current = current.clone();
        ctrlc::set_handler(move || {
            log::info!("shutdown requested");
            running.store(false, Ordering::SeqCst);
            let client = current.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(client) = client.as_ref() {
                if let Err(e) = client.disconnect() {
                    log::debug!("disconnect during shutdown: {}", e);
                }
            }
        })
        .context("install ctrl-c handler")?;
    }

    run_mqtt(&cfg, &host, port, &pool, &running, &current);

    let active = pipeline.presence().active_regions();
    if !active.is_empty() {
        log::info!("{} region(s) still active at shutdown", active.len());
    }
    drop(pipeline);
    match Arc::try_unwrap(pool) {
        Ok(pool) => {
            log::info!(
                "draining workers ({} processed, {} dropped)",
                pool.processed(),
                pool.dropped()
            );
            pool.shutdown();
        }
        Err(_) => log::warn!("worker pool still shared; skipping drain"),
    }
    scheduler.shutdown();
    dispatcher.shutdown();
    log::info!("{} stopped", DAEMON_NAME);
    Ok(())
}

fn build_sink(cfg: &PresenceConfig) -> Arc<dyn NotificationSink> {
    match &cfg.notifications.webhook_url {
        Some(url) => Arc::new(WebhookSink::new(url.clone(), cfg.services.timeout)),
        None => {
            log::warn!("no webhook configured; presence notifications go to the log");
            Arc::new(LogSink)
        }
    }
}

fn build_collaborators(
    cfg: &PresenceConfig,
    notifier: Arc<NotificationDispatcher>,
) -> Result<Collaborators> {
    let services = &cfg.services;
    let objects = FsObjectStore::open(&cfg.storage.object_dir).with_context(|| {
        format!("open object store {}", cfg.storage.object_dir.display())
    })?;
    let vectors = SqliteVectorStore::open(&cfg.storage.vector_db)
        .with_context(|| format!("open vector store {}", cfg.storage.vector_db.display()))?;
    Ok(Collaborators {
        detector: Arc::new(HttpVisionService::new(
            services.vision_url.clone(),
            services.caption_model.clone(),
            services.timeout,
        )),
        faces: Arc::new(HttpFaceService::new(
            services.face_url.clone(),
            services.face_model.clone(),
            services.face_detector.clone(),
            services.timeout,
        )),
        embedder: Arc::new(HttpEmbeddingService::new(
            services.embedding_url.clone(),
            services.embedding_model.clone(),
            services.timeout,
        )),
        vectors: Arc::new(vectors),
        objects: Arc::new(objects),
        notifier,
    })
}

fn run_mqtt(
    cfg: &PresenceConfig,
    host: &str,
    port: u16,
    pool: &WorkerPool,
    running: &AtomicBool,
    current: &SharedClient,
) {
    let filter = format!("{}/+", cfg.mqtt.topic_prefix);
    while running.load(Ordering::SeqCst) {
        let (client, mut connection) = connect_mqtt(cfg, host, port);
        if let Err(e) = client.subscribe(filter.as_str(), QoS::AtMostOnce) {
            log::error!("subscribe to {} failed: {}", filter, e);
        } else {
            log::info!("Subscribed to {}", filter);
        }
        *current.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);

        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    if let Err(e) = handle_publish(cfg, pool, &publish) {
                        log::warn!("Skipping frame: {}", e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if running.load(Ordering::SeqCst) {
                        log::error!("MQTT connection error: {}. Reconnecting...", e);
                    }
                    break;
                }
            }
        }
        current.lock().unwrap_or_else(PoisonError::into_inner).take();

        if running.load(Ordering::SeqCst) {
            wait_for_reconnect(running);
        }
    }
}

fn wait_for_reconnect(running: &AtomicBool) {
    let step = Duration::from_millis(250);
    let mut waited = Duration::ZERO;
    while waited < RECONNECT_DELAY && running.load(Ordering::SeqCst) {
        std::thread::sleep(step);
        waited += step;
    }
}

fn handle_publish(cfg: &PresenceConfig, pool: &WorkerPool, publish: &Publish) -> Result<()> {
    let topic = std::str::from_utf8(&publish.topic).context("invalid topic")?;
    let camera = camera_from_topic(&cfg.mqtt.topic_prefix, topic)
        .ok_or_else(|| anyhow!("unexpected topic {}", topic))?;
    let timestamp = publish
        .properties
        .as_ref()
        .and_then(|props| {
            props
                .user_properties
                .iter()
                .find(|(key, _)| key == TIMESTAMP_PROPERTY)
        })
        .and_then(|(_, value)| parse_timestamp(value))
        .unwrap_or_else(now_s);
    if publish.payload.is_empty() {
        return Err(anyhow!("[{}] empty frame payload", camera));
    }
    pool.submit(FrameMessage {
        timestamp,
        camera: camera.to_string(),
        payload: publish.payload.to_vec(),
    })
}

fn connect_mqtt(cfg: &PresenceConfig, host: &str, port: u16) -> (Client, Connection) {
    let mut options = MqttOptions::new(cfg.mqtt.client_id.as_str(), host, port);
    options.set_keep_alive(Duration::from_secs(60));
    options.set_clean_start(true);
    options.set_max_packet_size(Some(MAX_FRAME_BYTES));
    if let Some(user) = cfg.mqtt.username.as_deref() {
        options.set_credentials(user, cfg.mqtt.password.as_deref().unwrap_or_default());
    }

    let (client, connection) = Client::new(options, 10);
    log::info!(
        "Connecting to MQTT broker {}:{} (auth: {})",
        host,
        port,
        cfg.mqtt.username.is_some()
    );
    (client, connection)
}
