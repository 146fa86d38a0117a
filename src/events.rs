//! Execution requests, the tagged event vocabulary workers stream back, and
//! the two ways of consuming an event stream: relaying it as-is, or
//! aggregating it into one final response.

use std::future::Future;
use std::time::{Duration, Instant};

use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::DispatchError;

/// Default per-run timeout in milliseconds.
pub const DEFAULT_RUN_TIMEOUT_MS: u64 = 30_000;

fn default_timeout() -> u64 {
    DEFAULT_RUN_TIMEOUT_MS
}

/// A request to execute code on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCodeRequest {
    pub code: String,
    /// Execution timeout in milliseconds, enforced by the worker.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default, rename = "isWarmUp")]
    pub is_warm_up: bool,
}

impl RunCodeRequest {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            timeout: DEFAULT_RUN_TIMEOUT_MS,
            is_warm_up: false,
        }
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = timeout_ms;
        self
    }

    pub fn warm_up(code: impl Into<String>, timeout_ms: u64) -> Self {
        Self {
            code: code.into(),
            timeout: timeout_ms,
            is_warm_up: true,
        }
    }

    /// Deadline for the whole remote call: twice the execution timeout,
    /// never less than `floor`.
    pub fn remote_timeout(&self, floor: Duration) -> Duration {
        Duration::from_millis(self.timeout.saturating_mul(2)).max(floor)
    }
}

/// One event in a worker's execution stream, tagged by `kind` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RunEvent {
    Stdout {
        #[serde(rename = "stdOutput")]
        std_output: String,
    },
    Stderr {
        #[serde(rename = "stdError")]
        std_error: String,
    },
    Result {
        result: Value,
    },
    CompilerError {
        #[serde(rename = "compilationError")]
        compiler_error: String,
    },
    Error {
        error: String,
    },
    End(EndEvent),
}

impl RunEvent {
    pub fn is_end(&self) -> bool {
        matches!(self, Self::End(_))
    }
}

/// Terminal event carrying a consolidated summary of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndEvent {
    #[serde(rename = "stdOutput", default, skip_serializing_if = "Option::is_none")]
    pub std_output: Option<String>,
    #[serde(rename = "stdError", default, skip_serializing_if = "Option::is_none")]
    pub std_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = "compilerError", default, skip_serializing_if = "Option::is_none")]
    pub compiler_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Milliseconds spent on the run.
    pub elapsed: u64,
}

/// Final outcome of a run, as returned by the synchronous tool call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    #[serde(rename = "stdOutput", default, skip_serializing_if = "Option::is_none")]
    pub std_output: Option<String>,
    #[serde(rename = "stdError", default, skip_serializing_if = "Option::is_none")]
    pub std_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(rename = "compilerError", default, skip_serializing_if = "Option::is_none")]
    pub compiler_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed: u64,
}

impl From<EndEvent> for FinalResponse {
    fn from(end: EndEvent) -> Self {
        Self {
            std_output: end.std_output,
            std_error: end.std_error,
            result: end.result,
            compiler_error: end.compiler_error,
            error: end.error,
            elapsed: end.elapsed,
        }
    }
}

/// Drain `events`, reporting every non-terminal event through `on_progress`,
/// and turn the `end` event into a [`FinalResponse`].
///
/// Stops reading at the first `end`. A stream error is returned as-is; a
/// stream that finishes without `end` fails with
/// [`DispatchError::MissingEnd`].
pub async fn aggregate<S, F, Fut>(
    events: S,
    address: &str,
    mut on_progress: F,
) -> Result<FinalResponse, DispatchError>
where
    S: Stream<Item = Result<RunEvent, DispatchError>>,
    F: FnMut(RunEvent) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut events = std::pin::pin!(events);
    while let Some(event) = events.next().await {
        match event? {
            RunEvent::End(end) => return Ok(end.into()),
            other => on_progress(other).await,
        }
    }

    Err(DispatchError::MissingEnd {
        address: address.to_string(),
    })
}

enum Seal<S> {
    Open(S),
    Closing(EndEvent),
    Done,
}

/// Relay `events` unchanged, guaranteeing the output ends with `end`.
///
/// When the source fails, or finishes without `end`, an `error` event and a
/// closing `end` event carrying the same message are emitted instead, with
/// `elapsed` measured from `started`. The source is dropped as soon as it
/// has nothing more to give.
pub fn seal<S>(events: S, started: Instant) -> impl Stream<Item = RunEvent>
where
    S: Stream<Item = Result<RunEvent, DispatchError>> + Unpin,
{
    stream::unfold(Seal::Open(events), move |state| async move {
        match state {
            Seal::Open(mut events) => match events.next().await {
                Some(Ok(event)) if event.is_end() => Some((event, Seal::Done)),
                Some(Ok(event)) => Some((event, Seal::Open(events))),
                Some(Err(err)) => {
                    warn!(error = %err, kind = err.kind(), "Event stream failed");
                    Some(failure(err.to_string(), started))
                }
                None => {
                    warn!("Event stream ended without an end event");
                    Some(failure(
                        "Worker closed the stream without an end event".to_string(),
                        started,
                    ))
                }
            },
            Seal::Closing(end) => Some((RunEvent::End(end), Seal::Done)),
            Seal::Done => None,
        }
    })
}

fn failure<S>(message: String, started: Instant) -> (RunEvent, Seal<S>) {
    let end = EndEvent {
        error: Some(message.clone()),
        elapsed: started.elapsed().as_millis() as u64,
        ..Default::default()
    };
    (RunEvent::Error { error: message }, Seal::Closing(end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run() -> Vec<RunEvent> {
        vec![
            RunEvent::Stdout {
                std_output: "line 1\n".into(),
            },
            RunEvent::Stdout {
                std_output: "line 2\n".into(),
            },
            RunEvent::Result { result: json!(42) },
            RunEvent::End(EndEvent {
                std_output: Some("line 1\nline 2\n".into()),
                result: Some(json!(42)),
                elapsed: 12,
                ..Default::default()
            }),
        ]
    }

    #[test]
    fn test_wire_tags() {
        let cases = [
            (json!({"kind": "stdout", "stdOutput": "hi"}), RunEvent::Stdout { std_output: "hi".into() }),
            (json!({"kind": "stderr", "stdError": "oops"}), RunEvent::Stderr { std_error: "oops".into() }),
            (json!({"kind": "result", "result": [1, 2]}), RunEvent::Result { result: json!([1, 2]) }),
            (
                json!({"kind": "compilerError", "compilationError": "CS1002"}),
                RunEvent::CompilerError { compiler_error: "CS1002".into() },
            ),
            (json!({"kind": "error", "error": "timeout"}), RunEvent::Error { error: "timeout".into() }),
        ];

        for (wire, event) in cases {
            assert_eq!(serde_json::from_value::<RunEvent>(wire.clone()).unwrap(), event);
            assert_eq!(serde_json::to_value(&event).unwrap(), wire);
        }
    }

    #[test]
    fn test_end_event_omits_absent_fields() {
        let end = RunEvent::End(EndEvent {
            result: Some(json!("done")),
            elapsed: 7,
            ..Default::default()
        });
        assert_eq!(
            serde_json::to_value(&end).unwrap(),
            json!({"kind": "end", "result": "done", "elapsed": 7})
        );

        let parsed: RunEvent = serde_json::from_str(
            r#"{"kind":"end","stdOutput":"a","compilerError":"bad","elapsed":3}"#,
        )
        .unwrap();
        let RunEvent::End(end) = parsed else {
            panic!("expected end event");
        };
        assert_eq!(end.std_output.as_deref(), Some("a"));
        assert_eq!(end.compiler_error.as_deref(), Some("bad"));
        assert_eq!(end.elapsed, 3);
    }

    #[test]
    fn test_run_code_request_defaults() {
        let request: RunCodeRequest = serde_json::from_str(r#"{"code":"1 + 1"}"#).unwrap();
        assert_eq!(request.timeout, 30_000);
        assert!(!request.is_warm_up);

        let wire = serde_json::to_value(RunCodeRequest::warm_up("1", 500)).unwrap();
        assert_eq!(wire, json!({"code": "1", "timeout": 500, "isWarmUp": true}));
    }

    #[test]
    fn test_remote_timeout_has_floor() {
        let floor = Duration::from_secs(30);
        assert_eq!(RunCodeRequest::new("x").with_timeout(1_000).remote_timeout(floor), floor);
        assert_eq!(
            RunCodeRequest::new("x").with_timeout(60_000).remote_timeout(floor),
            Duration::from_secs(120)
        );
        assert_eq!(
            RunCodeRequest::new("x").with_timeout(u64::MAX).remote_timeout(floor),
            Duration::from_millis(u64::MAX)
        );
    }

    #[tokio::test]
    async fn test_aggregate_reports_progress_and_returns_end() {
        let mut progress = Vec::new();
        let events = stream::iter(sample_run().into_iter().map(Ok));

        let response = aggregate(events, "http://w1/", |event| {
            progress.push(event);
            async {}
        })
        .await
        .unwrap();

        assert_eq!(progress.len(), 3);
        assert_eq!(progress[2], RunEvent::Result { result: json!(42) });
        assert_eq!(response.result, Some(json!(42)));
        assert_eq!(response.std_output.as_deref(), Some("line 1\nline 2\n"));
        assert_eq!(response.elapsed, 12);
    }

    #[tokio::test]
    async fn test_aggregate_without_end_fails() {
        let events = stream::iter(sample_run().into_iter().take(2).map(Ok));
        let err = aggregate(events, "http://w1/", |_| async {}).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::MissingEnd {
                address: "http://w1/".into()
            }
        );
    }

    #[tokio::test]
    async fn test_aggregate_propagates_stream_error() {
        let events = stream::iter(vec![
            Ok(RunEvent::Stdout {
                std_output: "a".into(),
            }),
            Err(DispatchError::StreamDecode("bad json".into())),
        ]);
        let err = aggregate(events, "http://w1/", |_| async {}).await.unwrap_err();
        assert_eq!(err, DispatchError::StreamDecode("bad json".into()));
    }

    #[tokio::test]
    async fn test_seal_passes_complete_stream_through() {
        let events = stream::iter(sample_run().into_iter().map(Ok));
        let relayed: Vec<RunEvent> = seal(events, Instant::now()).collect().await;
        assert_eq!(relayed, sample_run());
    }

    #[tokio::test]
    async fn test_seal_stops_after_end() {
        let mut run = sample_run();
        run.push(RunEvent::Stdout {
            std_output: "late".into(),
        });
        let relayed: Vec<RunEvent> = seal(stream::iter(run.into_iter().map(Ok)), Instant::now())
            .collect()
            .await;
        assert_eq!(relayed.len(), 4);
        assert!(relayed[3].is_end());
    }

    #[tokio::test]
    async fn test_seal_terminates_failed_stream_with_end() {
        let events = stream::iter(vec![
            Ok(RunEvent::Stdout {
                std_output: "a".into(),
            }),
            Err(DispatchError::StreamDecode("bad json".into())),
            Ok(RunEvent::Stdout {
                std_output: "never".into(),
            }),
        ]);
        let relayed: Vec<RunEvent> = seal(events, Instant::now()).collect().await;

        assert_eq!(relayed.len(), 3);
        let RunEvent::Error { error } = &relayed[1] else {
            panic!("expected error event, got {:?}", relayed[1]);
        };
        assert!(error.contains("bad json"));
        let RunEvent::End(end) = &relayed[2] else {
            panic!("expected end event");
        };
        assert_eq!(end.error.as_ref(), Some(error));
    }

    #[tokio::test]
    async fn test_seal_closes_truncated_stream() {
        let events = stream::iter(sample_run().into_iter().take(1).map(Ok));
        let relayed: Vec<RunEvent> = seal(events, Instant::now()).collect().await;

        assert_eq!(relayed.len(), 3);
        assert!(matches!(relayed[1], RunEvent::Error { .. }));
        assert!(relayed[2].is_end());
    }
}
