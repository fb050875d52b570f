//! Shared application state.

use crate::config::Config;
use saga_core::{
    Broadcaster, FsSessionDetailBuilder, FsStoryLoader, LogStreamManager, PollerConfig,
    SessionDetailBuilder, SessionLister, SessionPoller, StoryWatcher, TmuxSessionLister,
};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct AppState {
    pub config: Config,
    pub poller: Arc<SessionPoller>,
    pub broadcaster: Arc<Broadcaster>,
    pub log_streams: Arc<LogStreamManager>,
}

impl AppState {
    /// State backed by tmux and the output directory on disk.
    pub fn new(config: Config) -> Self {
        let lister = Arc::new(TmuxSessionLister::new(config.output_dir.clone()));
        Self::with_collaborators(config, lister, Arc::new(FsSessionDetailBuilder))
    }

    pub fn with_collaborators(
        config: Config,
        lister: Arc<dyn SessionLister>,
        builder: Arc<dyn SessionDetailBuilder>,
    ) -> Self {
        let poller_config = PollerConfig {
            interval: config.poll_interval(),
            ..PollerConfig::default()
        };
        let poller = Arc::new(SessionPoller::new(lister, builder, poller_config));
        let broadcaster = Arc::new(Broadcaster::new());
        let log_streams = Arc::new(LogStreamManager::new(
            broadcaster.clone(),
            config.output_dir.clone(),
        ));

        Self {
            config,
            poller,
            broadcaster,
            log_streams,
        }
    }

    /// Wire the poller to the broadcaster and log streams, start polling and
    /// watch stories.
    pub fn start_background(&self) -> BackgroundTasks {
        let forwarder = self.broadcaster.spawn_forwarder(self.poller.subscribe());
        let completions = self
            .log_streams
            .spawn_completion_listener(self.poller.subscribe());
        self.poller.start();

        let loader = Arc::new(FsStoryLoader::new(&self.config.saga_root));
        let story_watcher =
            match StoryWatcher::start(&self.config.saga_root, loader, self.broadcaster.clone()) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(target: "saga::startup", "Story watching disabled: {}", e);
                    None
                }
            };

        BackgroundTasks {
            poller: self.poller.clone(),
            log_streams: self.log_streams.clone(),
            tasks: vec![forwarder, completions],
            _story_watcher: story_watcher,
        }
    }
}

/// Running background work; [`BackgroundTasks::shutdown`] stops all of it.
pub struct BackgroundTasks {
    poller: Arc<SessionPoller>,
    log_streams: Arc<LogStreamManager>,
    tasks: Vec<JoinHandle<()>>,
    _story_watcher: Option<StoryWatcher>,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        self.poller.stop();
        for task in &self.tasks {
            task.abort();
        }
        self.log_streams.dispose().await;
        info!(target: "saga::startup", "Background tasks stopped");
    }
}
