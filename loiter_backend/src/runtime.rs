use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{anyhow, Context, Result};
use flume::{Receiver, Sender};
use tokio::sync::RwLock;

use crate::config::PresenceConfig;
use crate::database::EngineDatabase;
use crate::llm_client::LlmClient;
use crate::presence::{ControlCommand, PresenceEngine, PresenceEvent, PresenceStatus};
use crate::services::memory::ArchiveMemory;
use crate::services::sentiment::LexiconSentiment;
use crate::services::vision::LlmVision;
use crate::services::{
    GenerationService, MemoryRetriever, NullMemory, NullVision, Services, VisionService,
};
use crate::transport::telegram::TelegramTransport;
use crate::transport::InboundEvent;

pub struct BackendRuntime {
    pub config: PresenceConfig,
    pub engine: Arc<PresenceEngine>,
    pub database: Option<Arc<EngineDatabase>>,
    pub status: Arc<RwLock<PresenceStatus>>,
    pub control_tx: Sender<ControlCommand>,
    telegram: Arc<TelegramTransport>,
    inbound: (Sender<InboundEvent>, Receiver<InboundEvent>),
    control_rx: Receiver<ControlCommand>,
}

impl BackendRuntime {
    pub fn bootstrap(config: PresenceConfig, event_tx: Sender<PresenceEvent>) -> Result<Self> {
        if config.channel_id == 0 {
            return Err(anyhow!(
                "No channel configured (set channel_id in loiter_config.toml or LOITER_CHANNEL_ID)"
            ));
        }

        let telegram = Arc::new(
            TelegramTransport::from_env()
                .ok_or_else(|| anyhow!("TELEGRAM_BOT_TOKEN is not set"))?,
        );

        let database = match EngineDatabase::new(&config.database_path) {
            Ok(db) => Some(Arc::new(db)),
            Err(e) => {
                tracing::warn!("Failed to open engine database: {}", e);
                None
            }
        };

        let enabled = match database.as_deref() {
            Some(db) => db
                .presence_enabled()
                .context("Failed to read persisted presence toggle")?,
            None => false,
        };

        let services = build_services(&config, database.clone());
        let engine = PresenceEngine::new(
            config.clone(),
            services,
            telegram.clone(),
            database.clone(),
            enabled,
            event_tx,
        )
        .context("Failed to build presence engine")?;
        let engine = Arc::new(engine);

        let (control_tx, control_rx) = flume::unbounded();
        tracing::info!(
            "Presence runtime ready for channel {} (enabled: {})",
            config.channel_id,
            enabled
        );

        Ok(Self {
            status: engine.status_handle(),
            config,
            engine,
            database,
            control_tx,
            telegram,
            inbound: flume::unbounded(),
            control_rx,
        })
    }

    /// Run Telegram polling and the presence loop on a dedicated runtime thread.
    pub fn spawn_presence_loop(&self) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let telegram = self.telegram.clone();
        let (inbound_tx, inbound_rx) = self.inbound.clone();
        let control_rx = self.control_rx.clone();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to start presence runtime: {}", e);
                    return;
                }
            };
            rt.block_on(async {
                telegram.spawn_polling(inbound_tx);
                if let Err(e) = engine.run_loop(inbound_rx, control_rx).await {
                    tracing::error!("Presence loop error: {}", e);
                }
            });
        })
    }
}

fn build_services(config: &PresenceConfig, database: Option<Arc<EngineDatabase>>) -> Services {
    let api_key = config.llm_api_key.clone().unwrap_or_default();

    let generation: Arc<dyn GenerationService> = Arc::new(
        LlmClient::new(
            config.llm_api_url.clone(),
            api_key.clone(),
            config.llm_model.clone(),
        )
        .with_triage_model(config.triage_model.clone()),
    );

    let vision: Arc<dyn VisionService> = match &config.vision_model {
        Some(model) => {
            tracing::info!("Image analysis enabled with model {}", model);
            Arc::new(LlmVision::new(
                config.llm_api_url.clone(),
                api_key,
                model.clone(),
            ))
        }
        None => {
            tracing::info!("No vision model configured; image analysis disabled");
            Arc::new(NullVision)
        }
    };

    let memory: Arc<dyn MemoryRetriever> = match database {
        Some(db) => Arc::new(ArchiveMemory::new(db)),
        None => Arc::new(NullMemory),
    };

    Services {
        generation,
        vision,
        sentiment: Arc::new(LexiconSentiment::default()),
        memory,
    }
}
