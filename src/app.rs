// Shared service construction for the `serve`, `api` and `dispatch` modes.

use std::sync::Arc;

use anyhow::{Context, Result};
use genserve_config::{AppConfig, LoraCatalog};
use genserve_db::{Database, SessionStore, SharedDatabase, SqliteQueue, SqliteTaskStore, TaskManager};
use genserve_web::AppState;
use genserve_worker::{ModelScheduler, ProcessManager, SchedulerOptions};
use log::info;

use crate::dispatcher::TaskDispatcher;

/// Everything opened from one config.
pub struct Services {
    pub config: Arc<AppConfig>,
    pub db: SharedDatabase,
    pub queue: Arc<SqliteQueue>,
    pub tasks: Arc<TaskManager>,
    pub catalog: Arc<LoraCatalog>,
}

impl Services {
    pub fn open(config: AppConfig) -> Result<Self> {
        let db: SharedDatabase = Arc::new(
            Database::new(&config.db_path)
                .with_context(|| format!("cannot open database {}", config.db_path))?,
        );
        info!("[DB] database opened: {}", config.db_path);

        let queue = Arc::new(SqliteQueue::new(db.clone()));
        let tasks = Arc::new(TaskManager::new(
            Arc::new(SqliteTaskStore::new(db.clone())),
            queue.clone(),
            config.queue.name.clone(),
        ));
        let catalog = Arc::new(
            LoraCatalog::load(&config.config_dir, &config.lora_dir)
                .context("cannot load LoRA catalog")?,
        );

        Ok(Self {
            config: Arc::new(config),
            db,
            queue,
            tasks,
            catalog,
        })
    }

    pub fn scheduler(&self) -> Result<Arc<ModelScheduler>> {
        let launcher = ProcessManager::from_config(&self.config.worker)
            .context("cannot locate the worker program")?;
        Ok(Arc::new(ModelScheduler::new(
            launcher,
            SchedulerOptions::from(&self.config.scheduler),
        )))
    }

    /// Dispatcher over this config's queue. Deliveries left unacknowledged
    /// by a previous run are made ready again first.
    pub fn dispatcher(&self, scheduler: Arc<ModelScheduler>) -> Result<Arc<TaskDispatcher>> {
        let recovered = self.queue.recover().context("cannot recover queue")?;
        if recovered > 0 {
            info!("[QUEUE] returned {recovered} unacknowledged message(s) to the queue");
        }
        Ok(Arc::new(TaskDispatcher::new(
            self.tasks.clone(),
            scheduler,
            self.catalog.clone(),
            self.config.clone(),
        )))
    }

    pub fn api_state(&self, scheduler: Option<Arc<ModelScheduler>>) -> Arc<AppState> {
        Arc::new(AppState {
            config: self.config.clone(),
            tasks: self.tasks.clone(),
            catalog: self.catalog.clone(),
            sessions: SessionStore::new(self.db.clone()),
            scheduler,
        })
    }
}
