use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{AudioOutput, BackendError, Synthesizer, Transcriber};
use crate::capture::AudioClip;

/// An external program invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Kill the program if it runs longer than this
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs: default_timeout_secs(),
        }
    }

    /// Feed `input` on stdin and collect stdout; non-zero exit is an error
    async fn run(&self, input: &[u8]) -> Result<Vec<u8>, String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("failed to start `{}`: {}", self.program, e))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| format!("`{}` has no stdin", self.program))?;

        let write = async move {
            // The program may exit without reading all of its input
            if let Err(e) = stdin.write_all(input).await {
                debug!("Writing to child stdin failed: {}", e);
            }
        };

        let timeout = Duration::from_secs(self.timeout_secs.max(1));
        let (_, output) = tokio::time::timeout(timeout, async {
            tokio::join!(write, child.wait_with_output())
        })
        .await
        .map_err(|_| format!("`{}` timed out after {:?}", self.program, timeout))?;

        let output = output.map_err(|e| format!("`{}` failed: {}", self.program, e))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!(
                "`{}` exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            ));
        }

        Ok(output.stdout)
    }
}

/// Text-to-speech through a program that reads text on stdin and writes WAV
/// on stdout (`espeak --stdout`)
#[derive(Debug, Clone)]
pub struct CommandSynthesizer {
    command: CommandSpec,
}

impl CommandSynthesizer {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl Default for CommandSynthesizer {
    fn default() -> Self {
        Self::new(CommandSpec::new("espeak", &["--stdout"]))
    }
}

#[async_trait]
impl Synthesizer for CommandSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Bytes, BackendError> {
        let audio = self
            .command
            .run(text.as_bytes())
            .await
            .map_err(BackendError::Synthesis)?;

        if audio.is_empty() {
            return Err(BackendError::Synthesis(format!(
                "`{}` produced no audio",
                self.command.program
            )));
        }
        Ok(Bytes::from(audio))
    }
}

/// Plays audio through a program that reads WAV on stdin (`aplay -q -`)
#[derive(Debug, Clone)]
pub struct CommandPlayer {
    command: CommandSpec,
}

impl CommandPlayer {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

impl Default for CommandPlayer {
    fn default() -> Self {
        Self::new(CommandSpec::new("aplay", &["-q", "-"]))
    }
}

#[async_trait]
impl AudioOutput for CommandPlayer {
    async fn play(&self, audio: Bytes) -> Result<(), BackendError> {
        self.command
            .run(&audio)
            .await
            .map(|_| ())
            .map_err(BackendError::Output)
    }
}

/// Speech-to-text through a program that reads WAV on stdin and prints the
/// transcript on stdout
#[derive(Debug, Clone)]
pub struct CommandTranscriber {
    command: CommandSpec,
}

impl CommandTranscriber {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(&self, clip: &AudioClip) -> Result<String, BackendError> {
        if clip.is_empty() {
            return Err(BackendError::Recognition("clip contains no audio".to_string()));
        }

        let wav = clip
            .to_wav()
            .map_err(|e| BackendError::Recognition(e.to_string()))?;
        let output = self
            .command
            .run(&wav)
            .await
            .map_err(BackendError::Recognition)?;

        let text = String::from_utf8_lossy(&output).trim().to_string();
        if text.is_empty() {
            return Err(BackendError::Recognition("no speech recognized".to_string()));
        }
        Ok(text)
    }
}
