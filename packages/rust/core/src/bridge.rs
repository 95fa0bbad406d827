//! Subprocess-backed [`Summarizer`].
//!
//! Spawns the model bridge and talks to it over a JSON-lines protocol on
//! stdin/stdout:
//!
//! ```text
//! <- {"type":"ready"}
//! -> {"type":"summarize","id":"req-1","task":{"content":"...","query":"...","model":"..."}}
//! <- {"type":"result","id":"req-1","result":{"text":"...","model":"..."}}
//! <- {"type":"error","id":"req-1","error":"..."}
//! -> {"type":"shutdown"}
//! ```
//!
//! The process is started on first use and restarted after any protocol
//! failure.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use contentpipe_shared::AnalysisConfig;

use crate::analysis::{Summarizer, SummarizerError};

// ---------------------------------------------------------------------------
// Protocol types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, serde::Serialize)]
pub struct SummarizeTask {
    pub content: String,
    pub query: String,
    pub model: String,
}

/// Request message sent to the bridge.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "type")]
enum RequestMessage {
    #[serde(rename = "summarize")]
    Summarize { id: String, task: SummarizeTask },
    #[serde(rename = "shutdown")]
    Shutdown,
}

/// Response message received from the bridge.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "type")]
enum ResponseMessage {
    #[serde(rename = "ready")]
    Ready,
    #[serde(rename = "result")]
    Result { id: String, result: BridgeResult },
    #[serde(rename = "error")]
    Error {
        #[allow(dead_code)]
        id: String,
        error: String,
    },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BridgeResult {
    pub text: String,
    #[serde(default)]
    pub model: String,
}

// ---------------------------------------------------------------------------
// Bridge config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Executable to launch (e.g. "bun").
    pub cmd: String,
    pub args: Vec<String>,
    pub working_dir: String,
    pub model: String,
}

impl From<&AnalysisConfig> for BridgeConfig {
    fn from(config: &AnalysisConfig) -> Self {
        let args = if config.bridge_script.is_empty() {
            Vec::new()
        } else {
            vec!["run".to_string(), config.bridge_script.clone()]
        };
        Self {
            cmd: config.bridge_cmd.clone(),
            args,
            working_dir: config.working_dir.clone(),
            model: config.model.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

/// Handle to the spawned bridge subprocess.
struct BridgeHandle {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    request_counter: u64,
}

impl BridgeHandle {
    async fn spawn(config: &BridgeConfig) -> Result<Self, SummarizerError> {
        info!(cmd = %config.cmd, args = ?config.args, "spawning summarizer bridge");

        let mut child = Command::new(&config.cmd)
            .args(&config.args)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SummarizerError(format!(
                    "failed to spawn bridge: {e}. Is `{}` installed?",
                    config.cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SummarizerError("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SummarizerError("failed to capture bridge stdout".into()))?;

        let mut handle = Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
            request_counter: 0,
        };
        handle.wait_for_ready().await?;
        Ok(handle)
    }

    async fn read_message(&mut self) -> Result<ResponseMessage, SummarizerError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| SummarizerError(format!("bridge read error: {e}")))?;
        if n == 0 {
            return Err(SummarizerError("bridge closed stdout unexpectedly".into()));
        }
        serde_json::from_str(line.trim()).map_err(|e| {
            let excerpt: String = line.trim().chars().take(200).collect();
            SummarizerError(format!("invalid bridge message: {e} (got: {excerpt})"))
        })
    }

    async fn wait_for_ready(&mut self) -> Result<(), SummarizerError> {
        match self.read_message().await? {
            ResponseMessage::Ready => {
                info!("bridge is ready");
                Ok(())
            }
            other => Err(SummarizerError(format!("expected ready message, got {other:?}"))),
        }
    }

    async fn send(&mut self, request: &RequestMessage) -> Result<(), SummarizerError> {
        let json = serde_json::to_string(request)
            .map_err(|e| SummarizerError(format!("failed to serialize request: {e}")))?;
        self.stdin
            .write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| SummarizerError(format!("failed to write to bridge stdin: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| SummarizerError(format!("failed to flush bridge stdin: {e}")))
    }

    async fn summarize(&mut self, task: SummarizeTask) -> Result<BridgeResult, SummarizerError> {
        self.request_counter += 1;
        let id = format!("req-{}", self.request_counter);
        self.send(&RequestMessage::Summarize {
            id: id.clone(),
            task,
        })
        .await?;

        match self.read_message().await? {
            ResponseMessage::Result { id: resp_id, result } if resp_id == id => Ok(result),
            ResponseMessage::Result { id: resp_id, .. } => Err(SummarizerError(format!(
                "bridge answered {resp_id}, expected {id}"
            ))),
            ResponseMessage::Error { error, .. } => Err(SummarizerError(error)),
            ResponseMessage::Ready => Err(SummarizerError(
                "unexpected ready message during summarization".into(),
            )),
        }
    }

    async fn shutdown(mut self) {
        let _ = self.send(&RequestMessage::Shutdown).await;
        match self.child.wait().await {
            Ok(status) => info!(?status, "bridge exited"),
            Err(e) => warn!("bridge wait error: {e}"),
        }
    }
}

// ---------------------------------------------------------------------------
// BridgeSummarizer
// ---------------------------------------------------------------------------

/// [`Summarizer`] backed by a long-lived bridge subprocess. Requests are
/// serialized over the single pipe.
pub struct BridgeSummarizer {
    config: BridgeConfig,
    handle: Mutex<Option<BridgeHandle>>,
}

impl BridgeSummarizer {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            handle: Mutex::new(None),
        }
    }

    /// Ask the bridge to exit and wait for it.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.shutdown().await;
        }
    }
}

#[async_trait::async_trait]
impl Summarizer for BridgeSummarizer {
    async fn summarize(&self, text: &str, query: &str) -> Result<String, SummarizerError> {
        let mut slot = self.handle.lock().await;
        // Put back only after a clean round trip; dropping it kills the child.
        let mut handle = match slot.take() {
            Some(handle) => handle,
            None => BridgeHandle::spawn(&self.config).await?,
        };

        let task = SummarizeTask {
            content: text.to_string(),
            query: query.to_string(),
            model: self.config.model.clone(),
        };
        let result = handle.summarize(task).await?;
        *slot = Some(handle);
        Ok(result.text)
    }

    fn model(&self) -> &str {
        &self.config.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_message_serializes_correctly() {
        let msg = RequestMessage::Summarize {
            id: "req-1".into(),
            task: SummarizeTask {
                content: "body".into(),
                query: "gist".into(),
                model: "m".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"summarize""#));
        assert!(json.contains(r#""id":"req-1""#));
        assert!(json.contains(r#""query":"gist""#));

        let json = serde_json::to_string(&RequestMessage::Shutdown).unwrap();
        assert_eq!(json, r#"{"type":"shutdown"}"#);
    }

    #[test]
    fn response_messages_deserialize() {
        let msg: ResponseMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(msg, ResponseMessage::Ready));

        let msg: ResponseMessage = serde_json::from_str(
            r#"{"type":"result","id":"req-2","result":{"text":"short","model":"m"}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ResponseMessage::Result { ref id, ref result } if id == "req-2" && result.text == "short"));

        let msg: ResponseMessage =
            serde_json::from_str(r#"{"type":"error","id":"req-3","error":"rate limited"}"#).unwrap();
        assert!(matches!(msg, ResponseMessage::Error { ref error, .. } if error == "rate limited"));
    }

    #[test]
    fn config_from_analysis_section() {
        let config = AnalysisConfig {
            bridge_script: "bridge/main.ts".into(),
            ..AnalysisConfig::default()
        };
        let bridge = BridgeConfig::from(&config);
        assert_eq!(bridge.cmd, "bun");
        assert_eq!(bridge.args, vec!["run", "bridge/main.ts"]);
    }

    /// A shell stand-in for the bridge that answers every request.
    #[cfg(unix)]
    const ECHO_BRIDGE: &str = r#"
echo '{"type":"ready"}'
n=0
while IFS= read -r line; do
  case "$line" in
    *'"type":"shutdown"'*) exit 0 ;;
  esac
  n=$((n+1))
  echo "{\"type\":\"result\",\"id\":\"req-$n\",\"result\":{\"text\":\"summary $n\",\"model\":\"sh\"}}"
done
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn talks_to_a_live_bridge() {
        let summarizer = BridgeSummarizer::new(BridgeConfig {
            cmd: "sh".into(),
            args: vec!["-c".into(), ECHO_BRIDGE.into()],
            working_dir: ".".into(),
            model: "sh".into(),
        });

        assert_eq!(summarizer.summarize("text", "q").await.unwrap(), "summary 1");
        assert_eq!(summarizer.summarize("more", "q").await.unwrap(), "summary 2");
        summarizer.shutdown().await;
    }

    #[cfg(unix)]
    fn sh_bridge(script: &str) -> BridgeSummarizer {
        BridgeSummarizer::new(BridgeConfig {
            cmd: "sh".into(),
            args: vec!["-c".into(), script.into()],
            working_dir: ".".into(),
            model: "sh".into(),
        })
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn garbled_multibyte_reply_is_an_error() {
        // Byte 200 falls inside the two-byte 'é'.
        let script = format!(
            "echo '{{\"type\":\"ready\"}}'\nread -r line\necho '{}é'\n",
            "x".repeat(199)
        );
        let summarizer = sh_bridge(&script);

        let err = summarizer.summarize("text", "q").await.unwrap_err();
        assert!(err.0.contains("invalid bridge message"), "{}", err.0);
        assert!(err.0.contains('é'));
    }

    /// Answers like [`ECHO_BRIDGE`] but stalls on requests mentioning "slow".
    #[cfg(unix)]
    const STALLING_BRIDGE: &str = r#"
echo '{"type":"ready"}'
n=0
while IFS= read -r line; do
  case "$line" in
    *'"type":"shutdown"'*) exit 0 ;;
    *slow*) sleep 2 ;;
  esac
  n=$((n+1))
  echo "{\"type\":\"result\",\"id\":\"req-$n\",\"result\":{\"text\":\"summary $n\",\"model\":\"sh\"}}"
done
"#;

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_request_does_not_poison_the_next_one() {
        let summarizer = sh_bridge(STALLING_BRIDGE);

        let limit = std::time::Duration::from_millis(150);
        let first = tokio::time::timeout(limit, summarizer.summarize("a", "slow")).await;
        assert!(first.is_err(), "first request should time out");

        // A fresh bridge answers; the stale reply to the first request is never read.
        assert_eq!(summarizer.summarize("b", "fast").await.unwrap(), "summary 1");
        assert_eq!(summarizer.summarize("c", "fast").await.unwrap(), "summary 2");
        summarizer.shutdown().await;
    }

    #[tokio::test]
    async fn missing_executable_is_an_error() {
        let summarizer = BridgeSummarizer::new(BridgeConfig {
            cmd: "contentpipe-no-such-bridge".into(),
            args: vec![],
            working_dir: ".".into(),
            model: "none".into(),
        });
        let err = summarizer.summarize("text", "q").await.unwrap_err();
        assert!(err.0.contains("failed to spawn bridge"));
    }
}
