//! Story change notifications for `subscribe:story` observers.

use crate::{validate_slug, Broadcaster, Result};
use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use saga_types::StoryDetail;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Loads the current record of one story.
#[async_trait]
pub trait StoryLoader: Send + Sync {
    /// `Ok(None)` when the story does not exist (anymore).
    async fn load(&self, story_id: &str) -> Result<Option<StoryDetail>>;
}

/// Reads `<saga_root>/.saga/stories/<id>/story.json`.
pub struct FsStoryLoader {
    stories_dir: PathBuf,
}

impl FsStoryLoader {
    pub fn new(saga_root: &Path) -> Self {
        Self {
            stories_dir: stories_dir(saga_root),
        }
    }
}

#[async_trait]
impl StoryLoader for FsStoryLoader {
    async fn load(&self, story_id: &str) -> Result<Option<StoryDetail>> {
        let path = self.stories_dir.join(story_id).join("story.json");
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut fields: Map<String, Value> = serde_json::from_str(&content)?;
        fields.remove("id");
        Ok(Some(StoryDetail {
            id: story_id.to_string(),
            fields,
        }))
    }
}

fn stories_dir(saga_root: &Path) -> PathBuf {
    saga_root.join(".saga").join("stories")
}

/// Story id owning `path`, i.e. the first directory below the stories dir.
pub fn story_id_from_path(stories_dir: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(stories_dir).ok()?;
    match relative.components().next()? {
        Component::Normal(id) => {
            let id = id.to_str()?;
            validate_slug(id).then(|| id.to_string())
        }
        _ => None,
    }
}

/// Watches the stories directory and pushes changed stories to subscribers.
pub struct StoryWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl StoryWatcher {
    pub fn start(
        saga_root: &Path,
        loader: Arc<dyn StoryLoader>,
        broadcaster: Arc<Broadcaster>,
    ) -> Result<Self> {
        let dir = stories_dir(saga_root);
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<Event>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = notify_tx.send(event);
            }
        })?;
        watcher.watch(&dir, RecursiveMode::Recursive)?;
        info!(target: "saga::stories", "Watching {}", dir.display());

        let task = tokio::spawn(async move {
            while let Some(event) = notify_rx.recv().await {
                // Our own reads raise access events on the same paths.
                if !is_content_change(&event.kind) {
                    continue;
                }
                let story_ids: BTreeSet<String> = event
                    .paths
                    .iter()
                    .filter_map(|path| story_id_from_path(&dir, path))
                    .collect();

                for story_id in story_ids {
                    if !broadcaster.has_story_subscribers(&story_id) {
                        continue;
                    }
                    match loader.load(&story_id).await {
                        Ok(Some(story)) => {
                            let delivered = broadcaster.publish_story(story);
                            debug!(target: "saga::stories", "Story {} pushed to {} observers", story_id, delivered);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(target: "saga::stories", "Failed to load story {}: {}", story_id, e);
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    kind.is_create() || kind.is_modify() || kind.is_remove()
}

impl Drop for StoryWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_story_id_from_path() {
        let dir = Path::new("/repo/.saga/stories");
        assert_eq!(
            story_id_from_path(dir, Path::new("/repo/.saga/stories/auth-flow/story.md")),
            Some("auth-flow".to_string())
        );
        assert_eq!(
            story_id_from_path(dir, Path::new("/repo/.saga/stories/auth-flow")),
            Some("auth-flow".to_string())
        );
        assert_eq!(story_id_from_path(dir, Path::new("/repo/.saga/epics/x/epic.md")), None);
        assert_eq!(story_id_from_path(dir, Path::new("/repo/.saga/stories")), None);
        assert_eq!(
            story_id_from_path(dir, Path::new("/repo/.saga/stories/.DS_Store")),
            None
        );
    }

    #[tokio::test]
    async fn test_fs_loader_reads_story_json() {
        let root = TempDir::new().unwrap();
        let story_dir = root.path().join(".saga/stories/auth-flow");
        std::fs::create_dir_all(&story_dir).unwrap();
        std::fs::write(
            story_dir.join("story.json"),
            r#"{"id":"ignored","title":"Auth flow","status":"in_progress"}"#,
        )
        .unwrap();

        let loader = FsStoryLoader::new(root.path());
        let story = loader.load("auth-flow").await.unwrap().unwrap();
        assert_eq!(story.id, "auth-flow");
        assert_eq!(story.fields["title"], "Auth flow");
        assert!(!story.fields.contains_key("id"));

        assert!(loader.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_watcher_requires_stories_dir() {
        let root = TempDir::new().unwrap();
        let result = StoryWatcher::start(
            root.path(),
            Arc::new(FsStoryLoader::new(root.path())),
            Arc::new(Broadcaster::new()),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_access_events_are_not_content_changes() {
        use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind};

        assert!(!is_content_change(&EventKind::Access(AccessKind::Open(
            AccessMode::Read
        ))));
        assert!(!is_content_change(&EventKind::Access(AccessKind::Close(
            AccessMode::Read
        ))));
        assert!(is_content_change(&EventKind::Create(CreateKind::File)));
        assert!(is_content_change(&EventKind::Modify(ModifyKind::Any)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_one_write_produces_bounded_pushes() {
        let root = TempDir::new().unwrap();
        let story_dir = root.path().join(".saga/stories/auth-flow");
        std::fs::create_dir_all(&story_dir).unwrap();

        let broadcaster = Arc::new(Broadcaster::new());
        let (observer, mut rx) = broadcaster.register();
        broadcaster.subscribe_story(observer, "auth-flow");
        let _watcher = StoryWatcher::start(
            root.path(),
            Arc::new(FsStoryLoader::new(root.path())),
            broadcaster.clone(),
        )
        .unwrap();

        std::fs::write(story_dir.join("story.json"), r#"{"title":"Auth flow"}"#).unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(first, saga_types::WsServerMessage::StoryUpdated(_)));

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let mut burst = 0;
        while rx.try_recv().is_ok() {
            burst += 1;
        }
        assert!(burst < 5, "{} extra pushes after one write", burst);

        // Quiet once the write has been delivered.
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
