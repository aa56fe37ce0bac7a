use super::{DeltaStream, Transport, TransportFuture};
use crate::engine::error::EngineError;
use crate::engine::request::{ChatMessage, Request, TurnKind};
use crate::engine::result::{Delta, TurnResult, WireEnvelope};
use anyhow::anyhow;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

/// HTTP transport against an OpenAI-shaped API. Each turn kind maps to one
/// endpoint; completion and chat turns additionally support SSE streaming.
#[derive(Debug, Clone)]
pub struct OpenAiTransport {
    http: reqwest::Client,
    api_key: String,
    api_base: Url,
    /// Classifier endpoint for predict turns; not part of the main API.
    predict_url: Option<Url>,
}

impl OpenAiTransport {
    pub fn new(
        http: reqwest::Client,
        api_key: String,
        api_base: Option<&str>,
        predict_url: Option<&str>,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http,
            api_key,
            api_base: Url::parse(api_base.unwrap_or("https://api.openai.com/"))?,
            predict_url: predict_url.map(Url::parse).transpose()?,
        })
    }

    fn endpoint(&self, kind: TurnKind) -> Result<Url, EngineError> {
        let path = match kind {
            TurnKind::Completion => "v1/completions",
            TurnKind::Chat => "v1/chat/completions",
            TurnKind::Edit => "v1/edits",
            TurnKind::Embedding => "v1/embeddings",
            TurnKind::Predict => {
                return self.predict_url.clone().ok_or_else(|| {
                    EngineError::ContextMissing(
                        "no classifier endpoint configured for predict turns".to_string(),
                    )
                });
            }
        };
        self.api_base
            .join(path)
            .map_err(|e| EngineError::Transport(anyhow!(e)))
    }

    fn headers(&self) -> Result<HeaderMap, EngineError> {
        let mut h = HeaderMap::new();
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let v = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|e| EngineError::ContextMissing(format!("malformed API key: {e}")))?;
        h.insert(AUTHORIZATION, v);
        Ok(h)
    }
}

#[derive(Debug, Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: u32,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<u32>,
    temperature: f32,
    top_p: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    n: u32,
    temperature: f32,
    top_p: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct EditBody<'a> {
    model: &'a str,
    input: &'a str,
    instruction: &'a str,
    n: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct EmbeddingBody<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Serialize)]
struct PredictBody<'a> {
    document: &'a str,
}

fn request_body(req: &Request, stream: bool) -> Result<serde_json::Value, EngineError> {
    let value = match req {
        Request::Completion {
            model,
            prompt,
            max_tokens,
            n,
            logprobs,
            temperature,
            top_p,
            presence_penalty,
            frequency_penalty,
        } => serde_json::to_value(CompletionBody {
            model,
            prompt,
            max_tokens: *max_tokens,
            n: *n,
            logprobs: if *logprobs > 0 { Some(*logprobs) } else { None },
            temperature: *temperature,
            top_p: *top_p,
            presence_penalty: *presence_penalty,
            frequency_penalty: *frequency_penalty,
            stream,
        }),
        Request::Chat {
            model,
            messages,
            max_tokens,
            n,
            temperature,
            top_p,
            presence_penalty,
            frequency_penalty,
        } => serde_json::to_value(ChatBody {
            model,
            messages,
            max_tokens: *max_tokens,
            n: *n,
            temperature: *temperature,
            top_p: *top_p,
            presence_penalty: *presence_penalty,
            frequency_penalty: *frequency_penalty,
            stream,
        }),
        Request::Edit {
            model,
            input,
            instruction,
            n,
            temperature,
            top_p,
        } => serde_json::to_value(EditBody {
            model,
            input,
            instruction,
            n: *n,
            temperature: *temperature,
            top_p: *top_p,
        }),
        Request::Embedding { model, input } => serde_json::to_value(EmbeddingBody { model, input }),
        Request::Predict { document } => serde_json::to_value(PredictBody { document }),
    };
    value.map_err(|e| EngineError::Decode(anyhow!(e)))
}

impl Transport for OpenAiTransport {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn send(&self, req: Request) -> TransportFuture<TurnResult> {
        let this = self.clone();
        Box::pin(async move {
            let kind = req.kind();
            let url = this.endpoint(kind)?;
            let headers = this.headers()?;
            let body = request_body(&req, false)?;

            let resp = this
                .http
                .post(url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .map_err(|e| EngineError::Transport(anyhow!(e)))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(EngineError::Transport(anyhow!(
                    "provider error: HTTP {status}: {text}"
                )));
            }

            let body = resp
                .text()
                .await
                .map_err(|e| EngineError::Transport(anyhow!(e)))?;
            let envelope: WireEnvelope = serde_json::from_str(&body)
                .map_err(|e| EngineError::Decode(anyhow!(e)))?;
            envelope.into_result(kind)
        })
    }

    fn send_stream(&self, req: Request) -> TransportFuture<DeltaStream> {
        let this = self.clone();
        Box::pin(async move {
            let kind = req.kind();
            if !matches!(kind, TurnKind::Completion | TurnKind::Chat) {
                return Err(EngineError::Transport(anyhow!(
                    "{} turns do not stream",
                    kind.as_str()
                )));
            }

            let url = this.endpoint(kind)?;
            let headers = this.headers()?;
            let body = request_body(&req, true)?;

            let resp = this
                .http
                .post(url)
                .headers(headers)
                .json(&body)
                .send()
                .await
                .map_err(|e| EngineError::Transport(anyhow!(e)))?;

            let status = resp.status();
            if !status.is_success() {
                let text = resp.text().await.unwrap_or_default();
                return Err(EngineError::Transport(anyhow!(
                    "provider error: HTTP {status}: {text}"
                )));
            }

            let (tx, rx) = mpsc::channel::<Result<Delta, EngineError>>(64);

            tokio::spawn(async move {
                let mut stream = resp.bytes_stream();
                let mut lines = SseLines::new();

                while let Some(item) = stream.next().await {
                    let bytes = match item {
                        Ok(b) => b,
                        Err(e) => {
                            let _ = tx
                                .send(Err(EngineError::Transport(
                                    anyhow!(e).context("network stream error"),
                                )))
                                .await;
                            return;
                        }
                    };

                    for data in lines.push(&bytes) {
                        if data == "[DONE]" {
                            return;
                        }
                        match serde_json::from_str::<Delta>(&data) {
                            Ok(delta) => {
                                if tx.send(Ok(delta)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                let _ = tx
                                    .send(Err(EngineError::Decode(
                                        anyhow!(e).context("malformed SSE payload"),
                                    )))
                                    .await;
                                return;
                            }
                        }
                    }
                }
            });

            let stream = ReceiverStream::new(rx).map(|x| x);
            Ok(Box::pin(stream) as DeltaStream)
        })
    }
}

/// Incremental SSE `data:` extractor. Feeds on raw byte chunks, emits one
/// string per complete event. Non-data fields (event:, id:, comments) are
/// skipped; multi-line data fields are joined with newlines as SSE requires.
struct SseLines {
    buf: String,
    pending_data: Vec<String>,
}

impl SseLines {
    fn new() -> Self {
        Self {
            buf: String::new(),
            pending_data: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();

        while let Some(pos) = self.buf.find('\n') {
            let mut line: String = self.buf.drain(..=pos).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                if !self.pending_data.is_empty() {
                    out.push(std::mem::take(&mut self.pending_data).join("\n"));
                }
                continue;
            }

            if let Some(rest) = line.strip_prefix("data:") {
                self.pending_data
                    .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_lines_emit_on_blank_line() {
        let mut sse = SseLines::new();
        assert!(sse.push(b"data: {\"id\":\"a\"}\n").is_empty());
        assert_eq!(sse.push(b"\n"), vec!["{\"id\":\"a\"}"]);
    }

    #[test]
    fn events_split_across_chunks_reassemble() {
        let mut sse = SseLines::new();
        let mut all = Vec::new();
        for chunk in [&b"da"[..], b"ta: one\n", b"\ndata: two\n\n"] {
            all.extend(sse.push(chunk));
        }
        assert_eq!(all, vec!["one", "two"]);
    }

    #[test]
    fn crlf_and_non_data_fields_are_tolerated() {
        let mut sse = SseLines::new();
        let events = sse.push(b"event: ping\r\ndata: payload\r\n\r\n");
        assert_eq!(events, vec!["payload"]);
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut sse = SseLines::new();
        let events = sse.push(b"data: first\ndata: second\n\n");
        assert_eq!(events, vec!["first\nsecond"]);
    }

    #[test]
    fn done_sentinel_passes_through_verbatim() {
        let mut sse = SseLines::new();
        let events = sse.push(b"data: [DONE]\n\n");
        assert_eq!(events, vec!["[DONE]"]);
    }

    #[test]
    fn streaming_is_refused_for_non_streamable_kinds() {
        let transport = OpenAiTransport::new(
            reqwest::Client::new(),
            "sk-test".to_string(),
            None,
            None,
        )
        .unwrap();
        let req = Request::Embedding {
            model: "m".to_string(),
            input: vec!["x".to_string()],
        };
        let err = futures_executor_block(transport.send_stream(req));
        assert!(matches!(err, Err(EngineError::Transport(_))));
    }

    #[test]
    fn predict_without_classifier_endpoint_is_context_missing() {
        let transport = OpenAiTransport::new(
            reqwest::Client::new(),
            "sk-test".to_string(),
            None,
            None,
        )
        .unwrap();
        let err = transport.endpoint(TurnKind::Predict);
        assert!(matches!(err, Err(EngineError::ContextMissing(_))));
    }

    // Minimal executor for futures that never actually hit the network.
    fn futures_executor_block<T>(
        fut: std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>,
    ) -> T {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
