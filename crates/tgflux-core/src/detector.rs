use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    #[serde(alias = "class_name", alias = "name")]
    pub class: String,
    pub confidence: f64,
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector command is empty")]
    NoCommand,

    #[error("failed to start detector `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("detector worker exited unexpectedly")]
    WorkerExited,

    #[error("detector worker i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("detector worker sent an unreadable response: {0}")]
    Protocol(String),

    #[error("detection failed for {path}: {reason}")]
    Image { path: String, reason: String },
}

impl DetectorError {
    /// Fatal errors mean the detector cannot serve further images.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DetectorError::NoCommand
                | DetectorError::Spawn { .. }
                | DetectorError::WorkerExited
                | DetectorError::Io(_)
        )
    }
}

#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectorError>;
}

#[derive(Debug, Serialize)]
struct DetectRequest<'a> {
    image: &'a str,
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<Detection>,
    #[serde(default)]
    error: Option<String>,
}

struct Worker {
    _child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    /// Set while a request is unanswered. A worker found in this state had its
    /// caller cancelled, and its next reply belongs to that earlier request.
    awaiting_reply: bool,
}

impl Worker {
    async fn exchange(&mut self, request: &str) -> Result<String, DetectorError> {
        let written = async {
            self.stdin.write_all(request.as_bytes()).await?;
            self.stdin.flush().await
        };
        if let Err(err) = written.await {
            return Err(match err.kind() {
                std::io::ErrorKind::BrokenPipe => DetectorError::WorkerExited,
                _ => DetectorError::Io(err),
            });
        }

        loop {
            match self.stdout.next_line().await? {
                // Libraries print banners to stdout; only JSON lines are responses.
                Some(line) if line.trim_start().starts_with('{') => return Ok(line),
                Some(line) => debug!(line = %line, "Ignoring detector output"),
                None => return Err(DetectorError::WorkerExited),
            }
        }
    }
}

/// Talks to a long-lived inference process over JSON lines on stdin/stdout.
/// The process is started on first use and killed when the detector drops.
pub struct WorkerDetector {
    command: Vec<String>,
    worker: Mutex<Option<Worker>>,
}

impl WorkerDetector {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            worker: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<Worker, DetectorError> {
        let (program, args) = self.command.split_first().ok_or(DetectorError::NoCommand)?;
        let command_line = self.command.join(" ");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DetectorError::Spawn {
                command: command_line.clone(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or(DetectorError::WorkerExited)?;
        let stdout = child.stdout.take().ok_or(DetectorError::WorkerExited)?;
        info!(command = %command_line, "Started detector worker");
        Ok(Worker {
            _child: child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            awaiting_reply: false,
        })
    }
}

#[async_trait]
impl Detector for WorkerDetector {
    async fn detect(&self, image: &Path) -> Result<Vec<Detection>, DetectorError> {
        let mut guard = self.worker.lock().await;
        if guard.as_ref().is_some_and(|worker| worker.awaiting_reply) {
            warn!("Detector worker has an unread reply from a cancelled request, restarting it");
            *guard = None;
        }
        if guard.is_none() {
            *guard = Some(self.spawn()?);
        }
        let Some(worker) = guard.as_mut() else {
            return Err(DetectorError::WorkerExited);
        };

        let image_path = image.to_string_lossy();
        let mut request = serde_json::to_string(&DetectRequest { image: &image_path })
            .map_err(|err| DetectorError::Protocol(err.to_string()))?;
        request.push('\n');

        worker.awaiting_reply = true;
        let line = match worker.exchange(&request).await {
            Ok(line) => {
                worker.awaiting_reply = false;
                line
            }
            Err(err) => {
                if err.is_fatal() {
                    *guard = None;
                }
                return Err(err);
            }
        };

        let response: DetectResponse = serde_json::from_str(&line)
            .map_err(|err| DetectorError::Protocol(format!("{err}: {line}")))?;
        match response.error {
            Some(reason) => Err(DetectorError::Image {
                path: image_path.into_owned(),
                reason,
            }),
            None => Ok(response.detections),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn worker(script: &str) -> WorkerDetector {
        WorkerDetector::new(vec!["sh".into(), "-c".into(), script.into()])
    }

    #[tokio::test]
    async fn worker_answers_each_request_and_banners_are_ignored() {
        let detector = worker(
            r#"echo 'model loaded'
while read line; do
  case "$line" in
    *broken*) echo '{"error": "cannot identify image file"}' ;;
    *) echo '{"detections": [{"class": "bottle", "confidence": 0.91}, {"class_name": "person", "confidence": 0.4}]}' ;;
  esac
done"#,
        );

        let detections = detector.detect(Path::new("media/c/1.jpg")).await.unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class, "bottle");
        assert_eq!(detections[1].class, "person");

        let err = detector.detect(Path::new("media/c/broken.jpg")).await.unwrap_err();
        assert!(matches!(err, DetectorError::Image { .. }));
        assert!(!err.is_fatal());

        // The same worker keeps serving after a per-image error.
        assert!(detector.detect(Path::new("media/c/2.jpg")).await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_request_does_not_leak_its_reply_into_the_next() {
        let detector = worker(
            r#"while read line; do
  sleep 0.3
  case "$line" in
    *first*) echo '{"detections": [{"class": "first", "confidence": 0.9}]}' ;;
    *) echo '{"detections": [{"class": "second", "confidence": 0.9}]}' ;;
  esac
done"#,
        );

        let cancelled = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            detector.detect(Path::new("media/c/first.jpg")),
        )
        .await;
        assert!(cancelled.is_err());

        let detections = detector.detect(Path::new("media/c/second.jpg")).await.unwrap();
        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].class, "second");
    }

    #[tokio::test]
    async fn exited_worker_is_fatal() {
        let detector = worker("read line; exit 0");
        let err = detector.detect(Path::new("media/c/1.jpg")).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn missing_program_is_fatal() {
        let detector = WorkerDetector::new(vec!["tgflux-no-such-detector".into()]);
        let err = detector.detect(Path::new("a.jpg")).await.unwrap_err();
        assert!(matches!(err, DetectorError::Spawn { .. }));

        let empty = WorkerDetector::new(Vec::new());
        assert!(matches!(
            empty.detect(Path::new("a.jpg")).await.unwrap_err(),
            DetectorError::NoCommand
        ));
    }
}
