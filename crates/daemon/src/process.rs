//! Encoder process spawning.
//!
//! The supervisor drives child processes through the [`ProcessManager`] and
//! [`EncodeProcess`] traits so tests can script process behavior without
//! forking. [`FfmpegProcessManager`] is the production implementation: it
//! renders the profile's command template and spawns the result with
//! `tokio::process`.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};
use tracing::debug;

/// Scheduling priority (niceness) requested for encoder child processes.
pub const ENCODE_PROCESS_PRIORITY: i32 = 10;

/// Everything needed to start one encoder process.
///
/// `env` is the complete environment of the child; it is snapshotted by the
/// supervisor at promotion time and applied verbatim.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub input: PathBuf,
    pub output: Option<PathBuf>,
    /// Command template; `%FFMPEG%`, `%INPUT%` and `%OUTPUT%` are substituted
    pub cmd: String,
    /// Niceness applied to the child on unix
    pub priority: i32,
    pub env: HashMap<String, String>,
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Handle to one spawned encoder process.
#[async_trait]
pub trait EncodeProcess: Send {
    /// Wait for the process to exit.
    async fn wait(&mut self) -> io::Result<ProcessExit>;
    /// Begin forceful termination without waiting for it to complete.
    fn start_kill(&mut self) -> io::Result<()>;
    /// Take the stderr stream, if it is piped and not yet taken.
    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>>;
}

/// Spawns encoder processes.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn create(&self, request: SpawnRequest) -> io::Result<Box<dyn EncodeProcess>>;
}

/// Production process manager for ffmpeg-style encoder commands.
pub struct FfmpegProcessManager {
    ffmpeg: PathBuf,
}

impl FfmpegProcessManager {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }

    /// Render the command template and build the child command.
    ///
    /// The rendered template is split on whitespace, so substituted paths
    /// must not contain spaces. On unix a positive priority is applied by
    /// prefixing the command with `nice -n <priority>`.
    pub fn build_command(&self, request: &SpawnRequest) -> io::Result<Command> {
        let rendered = render_template(
            &request.cmd,
            &self.ffmpeg,
            &request.input,
            request.output.as_deref(),
        );
        let mut argv: Vec<String> = rendered.split_whitespace().map(str::to_string).collect();
        if argv.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "encode command template rendered to an empty command line",
            ));
        }

        #[cfg(unix)]
        if request.priority > 0 {
            let mut prefixed = vec![
                "nice".to_string(),
                "-n".to_string(),
                request.priority.to_string(),
            ];
            prefixed.append(&mut argv);
            argv = prefixed;
        }

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .env_clear()
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

#[async_trait]
impl ProcessManager for FfmpegProcessManager {
    async fn create(&self, request: SpawnRequest) -> io::Result<Box<dyn EncodeProcess>> {
        let mut cmd = self.build_command(&request)?;
        debug!(cmd = %request.cmd, input = %request.input.display(), "spawning encoder process");
        let child = cmd.spawn()?;
        Ok(Box::new(SpawnedEncodeProcess { child }))
    }
}

/// Substitute the template placeholders. An absent output becomes an empty
/// string, mirroring the environment-variable convention.
fn render_template(template: &str, ffmpeg: &Path, input: &Path, output: Option<&Path>) -> String {
    template
        .replace("%FFMPEG%", &ffmpeg.to_string_lossy())
        .replace("%INPUT%", &input.to_string_lossy())
        .replace(
            "%OUTPUT%",
            &output.map(|p| p.to_string_lossy().into_owned()).unwrap_or_default(),
        )
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    };
    #[cfg(not(unix))]
    let signal = None;

    ProcessExit {
        code: status.code(),
        signal,
    }
}

struct SpawnedEncodeProcess {
    child: Child,
}

#[async_trait]
impl EncodeProcess for SpawnedEncodeProcess {
    async fn wait(&mut self) -> io::Result<ProcessExit> {
        let status = self.child.wait().await?;
        Ok(exit_from_status(status))
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }

    fn take_stderr(&mut self) -> Option<Box<dyn AsyncRead + Send + Unpin>> {
        self.child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as Box<dyn AsyncRead + Send + Unpin>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn make_request(cmd: &str, output: Option<&str>, priority: i32) -> SpawnRequest {
        let mut env = HashMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("RECORDEDID".to_string(), "1".to_string());
        SpawnRequest {
            input: PathBuf::from("/videos/input.ts"),
            output: output.map(PathBuf::from),
            cmd: cmd.to_string(),
            priority,
            env,
        }
    }

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    #[test]
    fn test_template_substitution() {
        let rendered = render_template(
            "%FFMPEG% -i %INPUT% -c:v libx264 %OUTPUT%",
            Path::new("/opt/ffmpeg"),
            Path::new("/videos/input.ts"),
            Some(Path::new("/videos/output.mp4")),
        );
        assert_eq!(
            rendered,
            "/opt/ffmpeg -i /videos/input.ts -c:v libx264 /videos/output.mp4"
        );
    }

    #[test]
    fn test_template_absent_output_becomes_empty() {
        let rendered = render_template(
            "/usr/local/bin/checksum %INPUT% %OUTPUT%",
            Path::new("/opt/ffmpeg"),
            Path::new("/videos/input.ts"),
            None,
        );
        // The placeholder disappears; whitespace splitting drops the hole
        assert_eq!(rendered, "/usr/local/bin/checksum /videos/input.ts ");
    }

    #[test]
    fn test_build_command_argv_and_env() {
        let manager = FfmpegProcessManager::new(PathBuf::from("/opt/ffmpeg"));
        let request = make_request("%FFMPEG% -i %INPUT% -y %OUTPUT%", Some("/videos/out.mp4"), 0);

        let cmd = manager.build_command(&request).unwrap();
        assert_eq!(cmd.as_std().get_program(), OsStr::new("/opt/ffmpeg"));
        assert_eq!(
            get_command_args(&cmd),
            vec!["-i", "/videos/input.ts", "-y", "/videos/out.mp4"]
        );

        let envs: HashMap<_, _> = cmd
            .as_std()
            .get_envs()
            .filter_map(|(k, v)| Some((k.to_str()?.to_string(), v?.to_str()?.to_string())))
            .collect();
        assert_eq!(envs.get("RECORDEDID").map(String::as_str), Some("1"));
        assert_eq!(envs.get("PATH").map(String::as_str), Some("/usr/bin"));
    }

    #[cfg(unix)]
    #[test]
    fn test_build_command_applies_niceness() {
        let manager = FfmpegProcessManager::new(PathBuf::from("/opt/ffmpeg"));
        let request = make_request(
            "%FFMPEG% -i %INPUT% %OUTPUT%",
            Some("/videos/out.mp4"),
            ENCODE_PROCESS_PRIORITY,
        );

        let cmd = manager.build_command(&request).unwrap();
        assert_eq!(cmd.as_std().get_program(), OsStr::new("nice"));
        let args = get_command_args(&cmd);
        assert_eq!(&args[..3], &["-n", "10", "/opt/ffmpeg"]);
    }

    #[test]
    fn test_build_command_rejects_empty_template() {
        let manager = FfmpegProcessManager::new(PathBuf::from("/opt/ffmpeg"));
        let request = make_request("%OUTPUT%", None, 0);

        let err = manager.build_command(&request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_reports_exit_code() {
        if std::fs::metadata("/usr/bin/env").is_err() {
            return;
        }
        let manager = FfmpegProcessManager::new(PathBuf::from("/usr/bin/env"));

        let mut ok = manager
            .create(make_request("%FFMPEG% true", None, 0))
            .await
            .unwrap();
        assert_eq!(ok.wait().await.unwrap().code, Some(0));

        let mut failed = manager
            .create(make_request("%FFMPEG% false", None, 0))
            .await
            .unwrap();
        let exit = failed.wait().await.unwrap();
        assert!(!exit.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_kill_terminates_child() {
        if std::fs::metadata("/usr/bin/env").is_err() {
            return;
        }
        let manager = FfmpegProcessManager::new(PathBuf::from("/usr/bin/env"));

        let mut child = manager
            .create(make_request("%FFMPEG% sleep 30", None, 0))
            .await
            .unwrap();
        child.start_kill().unwrap();
        let exit = child.wait().await.unwrap();
        assert!(exit.code.is_none());
        assert!(exit.signal.is_some());
    }
}
