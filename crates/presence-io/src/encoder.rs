//! Face encoder backed by an external program.
//!
//! For every image the command is spawned once with packed RGB8 pixels on
//! stdin and these variables set:
//!
//! - `PRESENCE_IMAGE_WIDTH`, `PRESENCE_IMAGE_HEIGHT`: pixel dimensions
//! - `PRESENCE_IMAGE_SOURCE`: where the image came from
//!
//! It must print a JSON array of numbers (the embedding) or `null` when the
//! image holds no face, and exit 0.

use presence_core::{Embedding, Encoder, EncoderError, Encoding, FaceImage};
use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};

pub struct CommandEncoder {
    program: String,
    args: Vec<String>,
    model_version: Option<String>,
}

impl CommandEncoder {
    /// Parse a shell-style command line, e.g. `python3 encode.py --model r34`.
    pub fn new(command: &str) -> Result<Self, EncoderError> {
        let mut parts = shlex::split(command)
            .ok_or_else(|| EncoderError::Failed(format!("malformed encoder command: {command}")))?;
        if parts.is_empty() {
            return Err(EncoderError::Failed("empty encoder command".into()));
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
            model_version: None,
        })
    }

    /// Tag produced embeddings with the model that made them.
    pub fn with_model_version(mut self, version: impl Into<String>) -> Self {
        self.model_version = Some(version.into());
        self
    }

    fn parse_output(&self, stdout: &[u8]) -> Result<Encoding, EncoderError> {
        let parsed: Option<Vec<f32>> = serde_json::from_slice(stdout).map_err(|e| {
            EncoderError::Failed(format!("{}: unparseable output: {e}", self.program))
        })?;
        match parsed {
            None => Ok(Encoding::NoFace),
            Some(values) if values.is_empty() => Err(EncoderError::Failed(format!(
                "{}: returned an empty embedding",
                self.program
            ))),
            Some(values) => Ok(Encoding::Face(Embedding {
                values,
                model_version: self.model_version.clone(),
            })),
        }
    }
}

impl Encoder for CommandEncoder {
    fn encode(&mut self, image: &FaceImage) -> Result<Encoding, EncoderError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("PRESENCE_IMAGE_WIDTH", image.width.to_string())
            .env("PRESENCE_IMAGE_HEIGHT", image.height.to_string())
            .env("PRESENCE_IMAGE_SOURCE", &image.source)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Failed(format!("{}: no stdin", self.program)))?;

        // Feed pixels from a separate thread so a chatty child cannot
        // deadlock on a full stdout pipe.
        let output = std::thread::scope(|scope| {
            let writer = scope.spawn(move || stdin.write_all(&image.rgb));
            let output = child.wait_with_output();
            (writer.join(), output)
        });
        let (written, output) = output;
        let output = output?;

        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.kind() == ErrorKind::BrokenPipe => {}
            Ok(Err(e)) => return Err(EncoderError::Io(e)),
            Err(_) => return Err(EncoderError::Failed("stdin writer panicked".into())),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EncoderError::Failed(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let encoding = self.parse_output(&output.stdout)?;
        tracing::trace!(
            source = %image.source,
            face = matches!(encoding, Encoding::Face(_)),
            "encoded image"
        );
        Ok(encoding)
    }
}
