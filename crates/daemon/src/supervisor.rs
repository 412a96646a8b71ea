//! Process supervision: promotion of queued jobs, per-job deadlines and exit
//! handling.
//!
//! Promotion runs while the scheduler holds its gate ticket, so the resolve
//! and spawn steps cannot interleave with other queue mutations. Once the
//! running entry is recorded, a detached supervisor task owns the child
//! process and reports its outcome; mutations it performs afterwards go back
//! through `finalize`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::EncodeError;
use crate::job::{EncodeRequest, FinishedEncode, JobId, RunningEntry, VideoFileId, WaitEntry};
use crate::manager::EncodeManager;
use crate::process::{EncodeProcess, SpawnRequest, ENCODE_PROCESS_PRIORITY};
use crate::stores::Recorded;

/// Deadline multiplier applied when the profile does not set one.
const DEFAULT_DEADLINE_RATE: f64 = 4.0;
/// Retry budget for the output filename collision loop.
const OUTPUT_NAME_ATTEMPTS: usize = 1000;
/// Grace period before a partial output is unlinked, so the encoder can
/// release its file handle on platforms that hold it past the kill.
const CLEANUP_DELAY: Duration = Duration::from_secs(1);

impl EncodeManager {
    /// Start the encoder process for a job popped off the wait queue and
    /// record it in the running set.
    ///
    /// Called by the scheduler with its gate ticket held; any error is
    /// surfaced there, converted into an error event and the job is
    /// finalized.
    pub(crate) async fn promote(self: &Arc<Self>, entry: WaitEntry) -> Result<(), EncodeError> {
        let request = &entry.request;

        if self
            .deps
            .videos
            .find_id(request.source_video_file_id)
            .await
            .is_none()
        {
            return Err(EncodeError::VideoFileIdIsNotFound(
                request.source_video_file_id,
            ));
        }
        let recorded = self
            .deps
            .recorded
            .find_id(request.recorded_id)
            .await
            .ok_or(EncodeError::RecordedIsNotFound(request.recorded_id))?;
        let input = self
            .deps
            .video_util
            .full_file_path(request.source_video_file_id)
            .await
            .ok_or(EncodeError::VideoPathIsNotFound(
                request.source_video_file_id,
            ))?;
        self.deps.fs.stat(&input).await?;

        let profile = self
            .config
            .encode
            .profile(&request.mode)
            .ok_or_else(|| EncodeError::EncodeCommandIsNotFound(request.mode.clone()))?
            .clone();

        let output = match &profile.suffix {
            Some(suffix) => Some(self.resolve_output_path(request, &input, suffix).await?),
            None => None,
        };

        let env = encode_env(
            &recorded,
            &input,
            output.as_deref(),
            request.directory.as_deref(),
            &self.config.encode.ffmpeg,
        );

        let mut child = self
            .deps
            .processes
            .create(SpawnRequest {
                input: input.clone(),
                output: output.clone(),
                cmd: profile.cmd.clone(),
                priority: ENCODE_PROCESS_PRIORITY,
                env,
            })
            .await?;
        info!(
            job_id = entry.id,
            mode = %request.mode,
            input = %input.display(),
            "encoder process started"
        );

        drain_stderr(entry.id, child.take_stderr());

        let rate = profile.rate.unwrap_or(DEFAULT_DEADLINE_RATE);
        let deadline_after = Duration::from_secs_f64((recorded.duration * rate).max(0.0));
        let kill = CancellationToken::new();

        let running = RunningEntry {
            job: entry.clone(),
            cancelled: false,
            kill: kill.clone(),
            deadline: self.spawn_deadline(entry.id, deadline_after),
        };
        // The entry must be visible before the supervisor can observe an
        // exit, otherwise an instantly-dying child would race the insert.
        {
            let mut state = self.state.write().await;
            state.running.push(running);
        }
        self.spawn_exit_watcher(entry, output, kill, child);
        Ok(())
    }

    /// Arm the per-job deadline. Expiry goes through `cancel`, inheriting
    /// its kill-and-stay-silent semantics.
    fn spawn_deadline(self: &Arc<Self>, job_id: JobId, after: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            warn!(
                job_id,
                deadline_secs = after.as_secs_f64(),
                "encode deadline expired, cancelling job"
            );
            if let Err(e) = manager.cancel(job_id).await {
                warn!(job_id, error = %e, "deadline cancellation failed");
            }
        })
    }

    /// Own the child process until it exits, then report the outcome and
    /// finalize the job.
    fn spawn_exit_watcher(
        self: &Arc<Self>,
        job: WaitEntry,
        output: Option<PathBuf>,
        kill: CancellationToken,
        mut child: Box<dyn EncodeProcess>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.id;
            let exit = tokio::select! {
                exit = child.wait() => Some(exit),
                _ = kill.cancelled() => None,
            };
            // A pending kill means the wait above was interrupted; deliver
            // the signal and reap the child for real.
            let exit = match exit {
                Some(exit) => exit,
                None => {
                    if let Err(e) = child.start_kill() {
                        warn!(job_id, error = %e, "failed to kill encoder process");
                    }
                    child.wait().await
                }
            };
            let exit = match exit {
                Ok(exit) => exit,
                Err(e) => {
                    error!(job_id, error = %e, "failed to reap encoder process");
                    crate::process::ProcessExit {
                        code: None,
                        signal: None,
                    }
                }
            };

            let cancelled = {
                let state = manager.state.read().await;
                match state.running.iter().find(|e| e.job.id == job_id) {
                    Some(entry) => entry.cancelled,
                    None => {
                        error!(
                            job_id,
                            "running entry vanished before process exit; queue state is inconsistent"
                        );
                        manager.cleanup_output(job_id, output.as_deref()).await;
                        return;
                    }
                }
            };

            if cancelled {
                info!(
                    job_id,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "encode job cancelled"
                );
                manager.cleanup_output(job_id, output.as_deref()).await;
            } else if !exit.success() {
                error!(
                    job_id,
                    code = ?exit.code,
                    signal = ?exit.signal,
                    "encoder process failed"
                );
                manager.cleanup_output(job_id, output.as_deref()).await;
                manager.deps.events.emit_error_encode();
            } else {
                let finished = manager.build_finished(&job, output.as_deref()).await;
                info!(job_id, "encode job finished");
                manager.deps.events.emit_finish_encode(finished);
            }

            manager.finalize(job_id).await;
        });
    }

    /// Assemble the finish-event payload, applying the duplicate-source
    /// interlock: removal of the source is suppressed while any other queued
    /// or running job still references the same video file.
    async fn build_finished(&self, job: &WaitEntry, output: Option<&Path>) -> FinishedEncode {
        let file_name = output
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned());
        let file_path = file_name.map(|name| match &job.request.directory {
            Some(dir) => format!("{dir}/{name}"),
            None => name,
        });

        let remove_original = job.request.remove_original
            && !self
                .source_still_referenced(job.id, job.request.source_video_file_id)
                .await;
        if job.request.remove_original && !remove_original {
            info!(
                job_id = job.id,
                video_file_id = job.request.source_video_file_id,
                "another job still references the source, keeping the original"
            );
        }

        FinishedEncode {
            recorded_id: job.request.recorded_id,
            video_file_id: job.request.source_video_file_id,
            parent_dir_name: job.request.parent_dir.clone(),
            file_path,
            full_output_path: output.map(Path::to_path_buf),
            mode: job.request.mode.clone(),
            remove_original,
        }
    }

    async fn source_still_referenced(&self, job_id: JobId, source: VideoFileId) -> bool {
        let state = self.state.read().await;
        state
            .running
            .iter()
            .any(|e| e.job.id != job_id && e.job.request.source_video_file_id == source)
            || state
                .wait
                .iter()
                .any(|e| e.id != job_id && e.request.source_video_file_id == source)
    }

    /// Remove a partial output after failure or cancellation. Deletion
    /// errors are logged, never propagated.
    async fn cleanup_output(&self, job_id: JobId, output: Option<&Path>) {
        let Some(output) = output else { return };
        tokio::time::sleep(CLEANUP_DELAY).await;
        match self.deps.fs.unlink(output).await {
            Ok(()) => debug!(job_id, path = %output.display(), "removed partial encode output"),
            Err(e) => {
                debug!(job_id, path = %output.display(), error = %e, "could not remove encode output")
            }
        }
    }

    /// Pick the output path: storage root, optional sub-directory (created
    /// on demand), input stem plus the profile suffix, with `(n)` inserted
    /// on collision. The probe-then-spawn window is racy by design.
    async fn resolve_output_path(
        &self,
        request: &EncodeRequest,
        input: &Path,
        suffix: &str,
    ) -> Result<PathBuf, EncodeError> {
        let parent = self
            .deps
            .video_util
            .parent_dir_path(&request.parent_dir)
            .ok_or_else(|| EncodeError::ParentDirIsNotFound(request.parent_dir.clone()))?;
        let dir = match &request.directory {
            Some(sub) => parent.join(sub),
            None => parent,
        };
        if self.deps.fs.stat(&dir).await.is_err() {
            self.deps.fs.mkdir_all(&dir).await?;
        }

        let stem = input.file_stem().unwrap_or_default().to_string_lossy();
        for attempt in 0..OUTPUT_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{stem}{suffix}")
            } else {
                format!("{stem}({attempt}){suffix}")
            };
            let candidate = dir.join(name);
            if self.deps.fs.stat(&candidate).await.is_err() {
                return Ok(candidate);
            }
        }
        Err(EncodeError::GetFilePath)
    }
}

/// Build the environment handed to the encoder command.
///
/// This is the one byte-exact contract with external tools: numeric fields
/// are rendered base-10 and every absent optional becomes an empty string.
pub(crate) fn encode_env(
    recorded: &Recorded,
    input: &Path,
    output: Option<&Path>,
    directory: Option<&str>,
    ffmpeg: &Path,
) -> HashMap<String, String> {
    fn num(value: Option<i64>) -> String {
        value.map(|n| n.to_string()).unwrap_or_default()
    }
    fn text(value: &Option<String>) -> String {
        value.clone().unwrap_or_default()
    }

    let mut env = HashMap::new();
    env.insert(
        "PATH".to_string(),
        std::env::var("PATH").unwrap_or_default(),
    );
    env.insert("RECORDEDID".to_string(), recorded.id.to_string());
    env.insert("INPUT".to_string(), input.to_string_lossy().into_owned());
    env.insert(
        "OUTPUT".to_string(),
        output
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );
    env.insert("DIR".to_string(), directory.unwrap_or_default().to_string());
    env.insert("FFMPEG".to_string(), ffmpeg.to_string_lossy().into_owned());
    env.insert("NAME".to_string(), recorded.name.clone());
    env.insert("DESCRIPTION".to_string(), text(&recorded.description));
    env.insert("EXTENDED".to_string(), text(&recorded.extended));
    env.insert("VIDEOTYPE".to_string(), text(&recorded.video_type));
    env.insert(
        "VIDEORESOLUTION".to_string(),
        text(&recorded.video_resolution),
    );
    env.insert(
        "VIDEOSTREAMCONTENT".to_string(),
        num(recorded.video_stream_content),
    );
    env.insert(
        "VIDEOCOMPONENTTYPE".to_string(),
        num(recorded.video_component_type),
    );
    env.insert(
        "AUDIOSAMPLINGRATE".to_string(),
        num(recorded.audio_sampling_rate),
    );
    env.insert(
        "AUDIOCOMPONENTTYPE".to_string(),
        num(recorded.audio_component_type),
    );
    env.insert("CHANNELID".to_string(), num(recorded.channel_id));
    env.insert("GENRE1".to_string(), num(recorded.genre1));
    env.insert("GENRE2".to_string(), num(recorded.genre2));
    env.insert("GENRE3".to_string(), num(recorded.genre3));
    env.insert("SUBGENRE1".to_string(), num(recorded.sub_genre1));
    env.insert("SUBGENRE2".to_string(), num(recorded.sub_genre2));
    env.insert("SUBGENRE3".to_string(), num(recorded.sub_genre3));
    env
}

/// Forward encoder stderr to the log at debug level; stdout stays unread.
fn drain_stderr(job_id: JobId, stderr: Option<Box<dyn AsyncRead + Send + Unpin>>) {
    let Some(stderr) = stderr else { return };
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(job_id, "encoder: {line}");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_recorded() -> Recorded {
        Recorded {
            id: 42,
            name: "midnight movie".to_string(),
            description: Some("a film".to_string()),
            extended: Some("extended text".to_string()),
            video_type: Some("tv".to_string()),
            video_resolution: Some("1080p".to_string()),
            video_stream_content: Some(1),
            video_component_type: Some(179),
            audio_sampling_rate: Some(48000),
            audio_component_type: Some(3),
            channel_id: Some(32736),
            genre1: Some(7),
            genre2: Some(6),
            genre3: Some(5),
            sub_genre1: Some(4),
            sub_genre2: Some(3),
            sub_genre3: Some(2),
            duration: 5400.0,
        }
    }

    fn bare_recorded() -> Recorded {
        Recorded {
            id: 1,
            name: "untitled".to_string(),
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
            duration: 0.0,
        }
    }

    const EXPECTED_KEYS: [&str; 22] = [
        "PATH",
        "RECORDEDID",
        "INPUT",
        "OUTPUT",
        "DIR",
        "FFMPEG",
        "NAME",
        "DESCRIPTION",
        "EXTENDED",
        "VIDEOTYPE",
        "VIDEORESOLUTION",
        "VIDEOSTREAMCONTENT",
        "VIDEOCOMPONENTTYPE",
        "AUDIOSAMPLINGRATE",
        "AUDIOCOMPONENTTYPE",
        "CHANNELID",
        "GENRE1",
        "GENRE2",
        "GENRE3",
        "SUBGENRE1",
        "SUBGENRE2",
        "SUBGENRE3",
    ];

    #[test]
    fn test_encode_env_carries_the_full_contract() {
        let env = encode_env(
            &full_recorded(),
            Path::new("/mnt/recorded/movie.ts"),
            Some(Path::new("/mnt/recorded/movie.mp4")),
            Some("encoded"),
            Path::new("/usr/bin/ffmpeg"),
        );

        for key in EXPECTED_KEYS {
            assert!(env.contains_key(key), "missing env key {key}");
        }
        assert_eq!(env.len(), EXPECTED_KEYS.len());

        assert_eq!(env["RECORDEDID"], "42");
        assert_eq!(env["INPUT"], "/mnt/recorded/movie.ts");
        assert_eq!(env["OUTPUT"], "/mnt/recorded/movie.mp4");
        assert_eq!(env["DIR"], "encoded");
        assert_eq!(env["FFMPEG"], "/usr/bin/ffmpeg");
        assert_eq!(env["NAME"], "midnight movie");
        assert_eq!(env["VIDEOCOMPONENTTYPE"], "179");
        assert_eq!(env["AUDIOSAMPLINGRATE"], "48000");
        assert_eq!(env["CHANNELID"], "32736");
        assert_eq!(env["GENRE3"], "5");
        assert_eq!(env["SUBGENRE3"], "2");
    }

    #[test]
    fn test_encode_env_absent_optionals_become_empty_strings() {
        let env = encode_env(
            &bare_recorded(),
            Path::new("/mnt/recorded/a.ts"),
            None,
            None,
            Path::new("/usr/bin/ffmpeg"),
        );

        assert_eq!(env["OUTPUT"], "");
        assert_eq!(env["DIR"], "");
        assert_eq!(env["DESCRIPTION"], "");
        assert_eq!(env["EXTENDED"], "");
        assert_eq!(env["VIDEOTYPE"], "");
        assert_eq!(env["VIDEORESOLUTION"], "");
        assert_eq!(env["VIDEOSTREAMCONTENT"], "");
        assert_eq!(env["VIDEOCOMPONENTTYPE"], "");
        assert_eq!(env["AUDIOSAMPLINGRATE"], "");
        assert_eq!(env["AUDIOCOMPONENTTYPE"], "");
        assert_eq!(env["CHANNELID"], "");
        for genre in ["GENRE1", "GENRE2", "GENRE3", "SUBGENRE1", "SUBGENRE2", "SUBGENRE3"] {
            assert_eq!(env[genre], "", "{genre} should be empty");
        }
    }
}
