use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Engine, EngineError, EngineRequest};
use crate::job::Transcript;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs an external transcriber per job.
///
/// The program is invoked as
/// `<program> [args..] --beam-size N --vad-filter BOOL --vad-min-silence-ms N
/// [--language L] [--initial-prompt P] <artifact>` and must print a JSON
/// transcript (`text`, `segments`, `language`, `language_probability`,
/// `duration_seconds`) on stdout. The child is killed if the job is
/// interrupted.
pub struct CommandEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command(&self, request: &EngineRequest) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--beam-size")
            .arg(request.beam_size.to_string())
            .arg("--vad-filter")
            .arg(request.vad_filter.to_string())
            .arg("--vad-min-silence-ms")
            .arg(request.vad_min_silence_ms.to_string());
        if let Some(language) = &request.language {
            cmd.arg("--language").arg(language);
        }
        if let Some(prompt) = &request.initial_prompt {
            cmd.arg("--initial-prompt").arg(prompt);
        }
        cmd.arg(&request.artifact)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

// Drain a pipe on its own thread so a chatty child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

fn stop(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!(error = %e, "failed to kill transcriber process");
    }
    let _ = child.wait();
}

impl Engine for CommandEngine {
    fn name(&self) -> &str {
        "command"
    }

    fn warm_up(&self) -> Result<(), EngineError> {
        match resolve_program(&self.program) {
            Some(path) => {
                debug!(program = %path.display(), "transcriber found");
                Ok(())
            }
            None => Err(EngineError::Unavailable(format!(
                "transcriber `{}` not found",
                self.program.display()
            ))),
        }
    }

    fn transcribe(
        &self,
        request: &EngineRequest,
        interrupt: &CancellationToken,
    ) -> Result<Transcript, EngineError> {
        let mut child = self.command(request).spawn()?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if interrupt.is_cancelled() {
                stop(&mut child);
                return Err(EngineError::Interrupted);
            }
            match child.try_wait()? {
                Some(status) => break status,
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let detail = stderr.trim();
            return Err(EngineError::Failed(if detail.is_empty() {
                format!("transcriber exited with {status}")
            } else {
                format!("transcriber exited with {status}: {detail}")
            }));
        }

        serde_json::from_str(stdout.trim()).map_err(|e| EngineError::Parse(e.to_string()))
    }
}
