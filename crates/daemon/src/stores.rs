//! Metadata collaborators: recording store, video file store and path
//! resolution.
//!
//! The manager only consumes these as trait objects; production deployments
//! back them with the recording database, while tests and the CLI driver use
//! the in-memory implementations below.

use async_trait::async_trait;
use recode_daemon_config::Config;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::job::{RecordedId, VideoFileId};

/// Metadata of one recording, as exposed to encoder commands through the
/// process environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recorded {
    pub id: RecordedId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub extended: Option<String>,
    #[serde(default)]
    pub video_type: Option<String>,
    #[serde(default)]
    pub video_resolution: Option<String>,
    #[serde(default)]
    pub video_stream_content: Option<i64>,
    #[serde(default)]
    pub video_component_type: Option<i64>,
    #[serde(default)]
    pub audio_sampling_rate: Option<i64>,
    #[serde(default)]
    pub audio_component_type: Option<i64>,
    #[serde(default)]
    pub channel_id: Option<i64>,
    #[serde(default)]
    pub genre1: Option<i64>,
    #[serde(default)]
    pub genre2: Option<i64>,
    #[serde(default)]
    pub genre3: Option<i64>,
    #[serde(default)]
    pub sub_genre1: Option<i64>,
    #[serde(default)]
    pub sub_genre2: Option<i64>,
    #[serde(default)]
    pub sub_genre3: Option<i64>,
    /// Source duration in seconds; multiplied by the profile rate to form
    /// the per-job deadline
    pub duration: f64,
}

/// One stored video file, located relative to a named storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoFile {
    pub id: VideoFileId,
    /// Name of the storage root the file lives under
    pub parent_dir_name: String,
    /// Path relative to the storage root
    pub file_path: String,
}

/// Lookup of recording metadata by identifier.
#[async_trait]
pub trait RecordedStore: Send + Sync {
    async fn find_id(&self, id: RecordedId) -> Option<Recorded>;
}

/// Lookup of video file records by identifier.
#[async_trait]
pub trait VideoFileStore: Send + Sync {
    async fn find_id(&self, id: VideoFileId) -> Option<VideoFile>;
}

/// Path resolution for video files and storage roots.
#[async_trait]
pub trait VideoUtil: Send + Sync {
    /// Absolute path of a stored video file, if resolvable.
    async fn full_file_path(&self, id: VideoFileId) -> Option<PathBuf>;
    /// Absolute path of a named storage root.
    fn parent_dir_path(&self, name: &str) -> Option<PathBuf>;
}

/// In-memory [`RecordedStore`].
pub struct MemoryRecordedStore {
    items: HashMap<RecordedId, Recorded>,
}

impl MemoryRecordedStore {
    pub fn new(items: impl IntoIterator<Item = Recorded>) -> Self {
        Self {
            items: items.into_iter().map(|r| (r.id, r)).collect(),
        }
    }
}

#[async_trait]
impl RecordedStore for MemoryRecordedStore {
    async fn find_id(&self, id: RecordedId) -> Option<Recorded> {
        self.items.get(&id).cloned()
    }
}

/// In-memory [`VideoFileStore`].
pub struct MemoryVideoFileStore {
    items: HashMap<VideoFileId, VideoFile>,
}

impl MemoryVideoFileStore {
    pub fn new(items: impl IntoIterator<Item = VideoFile>) -> Self {
        Self {
            items: items.into_iter().map(|v| (v.id, v)).collect(),
        }
    }
}

#[async_trait]
impl VideoFileStore for MemoryVideoFileStore {
    async fn find_id(&self, id: VideoFileId) -> Option<VideoFile> {
        self.items.get(&id).cloned()
    }
}

/// [`VideoUtil`] that resolves paths through the configured storage roots.
pub struct StandardVideoUtil {
    config: Arc<Config>,
    videos: Arc<dyn VideoFileStore>,
}

impl StandardVideoUtil {
    pub fn new(config: Arc<Config>, videos: Arc<dyn VideoFileStore>) -> Self {
        Self { config, videos }
    }
}

#[async_trait]
impl VideoUtil for StandardVideoUtil {
    async fn full_file_path(&self, id: VideoFileId) -> Option<PathBuf> {
        let video = self.videos.find_id(id).await?;
        let parent = self.parent_dir_path(&video.parent_dir_name)?;
        Some(parent.join(&video.file_path))
    }

    fn parent_dir_path(&self, name: &str) -> Option<PathBuf> {
        self.config.parent_dir(name).map(|d| d.path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recode_daemon_config::ParentDir;

    fn make_recorded(id: RecordedId) -> Recorded {
        Recorded {
            id,
            name: format!("recording {id}"),
            description: None,
            extended: None,
            video_type: None,
            video_resolution: None,
            video_stream_content: None,
            video_component_type: None,
            audio_sampling_rate: None,
            audio_component_type: None,
            channel_id: None,
            genre1: None,
            genre2: None,
            genre3: None,
            sub_genre1: None,
            sub_genre2: None,
            sub_genre3: None,
            duration: 1800.0,
        }
    }

    fn make_config() -> Arc<Config> {
        let mut config = Config::default();
        config.recorded = vec![ParentDir {
            name: "recorded".to_string(),
            path: PathBuf::from("/mnt/recorded"),
        }];
        Arc::new(config)
    }

    #[tokio::test]
    async fn test_memory_recorded_store_lookup() {
        let store = MemoryRecordedStore::new([make_recorded(1), make_recorded(2)]);

        assert_eq!(store.find_id(2).await.map(|r| r.id), Some(2));
        assert!(store.find_id(3).await.is_none());
    }

    #[tokio::test]
    async fn test_video_util_resolves_full_path() {
        let videos = Arc::new(MemoryVideoFileStore::new([VideoFile {
            id: 7,
            parent_dir_name: "recorded".to_string(),
            file_path: "2026/news.ts".to_string(),
        }]));
        let util = StandardVideoUtil::new(make_config(), videos);

        assert_eq!(
            util.full_file_path(7).await,
            Some(PathBuf::from("/mnt/recorded/2026/news.ts"))
        );
        assert!(util.full_file_path(8).await.is_none());
    }

    #[tokio::test]
    async fn test_video_util_unknown_parent_dir() {
        let videos = Arc::new(MemoryVideoFileStore::new([VideoFile {
            id: 7,
            parent_dir_name: "elsewhere".to_string(),
            file_path: "news.ts".to_string(),
        }]));
        let util = StandardVideoUtil::new(make_config(), videos);

        assert!(util.parent_dir_path("elsewhere").is_none());
        assert!(util.full_file_path(7).await.is_none());
    }
}
