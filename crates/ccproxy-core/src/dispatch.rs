//! Retry orchestration across endpoints, accounts, and the fallback-model
//! hop.
//!
//! One request dispatches to exactly one account at a time and walks the
//! endpoint list linearly; recovery decisions follow the status of each
//! upstream call. Once the first canonical event has been forwarded to the
//! client, no retry is performed: the stream ends with `message_stop` or a
//! single terminal error event.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ccproxy_accounts::AccountPool;
use ccproxy_protocol::claude::stream::StreamEvent;
use ccproxy_protocol::claude::{CreateMessageBody, Message};
use ccproxy_protocol::cloudcode::GenerateContentReply;
use ccproxy_protocol::gemini::{
    Candidate, Content, FinishReason, GenerateContentResponse, Part,
};
use ccproxy_protocol::sse::SseParser;
use ccproxy_transform::{
    MessageAccumulator, SignatureCache, StreamAdapter, to_generate_content, to_message,
};

use crate::builder;
use crate::config::ProxyConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::models;
use crate::oauth::{self, AuthClient};
use crate::upstream::{UpstreamBody, UpstreamRequest, UpstreamTransport};

pub const EMPTY_FALLBACK_TEXT: &str = "[No response after retries - please try again]";

/// 429 cooldowns above this switch accounts instead of waiting in place.
const SHORT_RETRY_CEILING_MS: u64 = 10_000;
/// Extra margin added when sleeping out a wholly limited pool.
const POOL_WAIT_MARGIN: Duration = Duration::from_millis(500);
const SERVER_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const NETWORK_ERROR_BACKOFF: Duration = Duration::from_secs(1);
const EMPTY_RETRY_BASE: Duration = Duration::from_millis(500);

pub struct DispatchEngine {
    config: ProxyConfig,
    pool: Arc<AccountPool>,
    transport: Arc<dyn UpstreamTransport>,
    auth: AuthClient,
    signatures: SignatureCache,
}

enum Output<'a> {
    OneShot {
        message: Option<Message>,
    },
    Stream {
        tx: &'a mpsc::Sender<StreamEvent>,
        emitted: bool,
    },
}

impl Output<'_> {
    fn is_stream(&self) -> bool {
        matches!(self, Output::Stream { .. })
    }

    fn emitted(&self) -> bool {
        matches!(self, Output::Stream { emitted: true, .. })
    }

    fn client_gone(&self) -> bool {
        match self {
            Output::Stream { tx, .. } => tx.is_closed(),
            Output::OneShot { .. } => false,
        }
    }
}

/// What one 2xx body amounted to.
enum Consumed {
    Complete,
    Empty,
    ClientGone,
}

impl DispatchEngine {
    pub fn new(
        config: ProxyConfig,
        pool: Arc<AccountPool>,
        transport: Arc<dyn UpstreamTransport>,
        auth: AuthClient,
    ) -> Self {
        let signatures =
            SignatureCache::new(Duration::from_millis(config.thinking_signature_ttl_ms));
        Self {
            config,
            pool,
            transport,
            auth,
            signatures,
        }
    }

    /// One-shot entry point: a complete message or an error.
    pub async fn send(&self, body: &CreateMessageBody) -> DispatchResult<Message> {
        let mut out = Output::OneShot { message: None };
        self.dispatch(body, &body.model, &mut out, self.config.fallback_enabled)
            .await?;
        match out {
            Output::OneShot { message: Some(message) } => Ok(message),
            _ => Err(DispatchError::EmptyResponse),
        }
    }

    /// Streaming entry point: canonical events are pushed into `tx` in
    /// order. Errors after the first event become a terminal error event and
    /// the call still returns Ok.
    pub async fn send_stream(
        &self,
        body: &CreateMessageBody,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> DispatchResult<()> {
        let mut out = Output::Stream { tx, emitted: false };
        let result = self
            .dispatch(body, &body.model, &mut out, self.config.fallback_enabled)
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if out.emitted() => {
                let event = StreamEvent::Error {
                    error: ccproxy_protocol::claude::ErrorDetail {
                        kind: err.kind().to_string(),
                        message: err.to_string(),
                    },
                };
                let _ = tx.send(event).await;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn dispatch(
        &self,
        body: &CreateMessageBody,
        model: &str,
        out: &mut Output<'_>,
        fallback_allowed: bool,
    ) -> DispatchResult<()> {
        let pool_size = self.pool.len().await;
        let attempts = (self.config.max_retries as usize).max(pool_size + 1);
        let use_sse = out.is_stream() || models::is_thinking(model);

        'attempts: for attempt in 0..attempts {
            if out.client_gone() {
                debug!(event = "client_disconnected", model = %model, attempt);
                return Ok(());
            }
            self.pool.clear_expired().await;

            if self.pool.available_for(model).await.is_empty() {
                if self.pool.all_limited(model).await {
                    let wait = self.pool.min_wait(model).await.unwrap_or_default();
                    let wait_ms = wait.as_millis() as u64;
                    if wait_ms > self.config.max_wait_before_error_ms {
                        if fallback_allowed
                            && let Some(fallback) = models::fallback_for(model)
                        {
                            info!(
                                event = "fallback_hop",
                                from = %model,
                                to = %fallback,
                                wait_ms
                            );
                            return Box::pin(self.dispatch(body, fallback, out, false)).await;
                        }
                        return Err(DispatchError::QuotaExhausted { reset_ms: wait_ms });
                    }
                    info!(event = "pool_cooldown", model = %model, wait_ms, attempt);
                    tokio::time::sleep(wait + POOL_WAIT_MARGIN).await;
                    continue 'attempts;
                }
                return Err(DispatchError::NoAccountsAvailable);
            }

            let account = match self.pool.sticky_for(model).await {
                Some(account) => account,
                None => match self.pool.pick_next(model).await {
                    Some(account) => account,
                    None => continue 'attempts,
                },
            };

            let token = match self.auth.access_token_for(&self.pool, &account).await {
                Ok(token) => token,
                Err(DispatchError::AuthInvalid(msg)) => {
                    warn!(event = "auth_invalid", email = %account.email, error = %msg);
                    oauth::invalidate(&self.pool, &account.email).await;
                    let _ = self.pool.pick_next(model).await;
                    continue 'attempts;
                }
                Err(err) => {
                    warn!(event = "token_error", email = %account.email, error = %err);
                    tokio::time::sleep(NETWORK_ERROR_BACKOFF).await;
                    let _ = self.pool.pick_next(model).await;
                    continue 'attempts;
                }
            };
            let project = match self
                .auth
                .project_for(&self.pool, &account, &token, &self.config.endpoints[0])
                .await
            {
                Ok(project) => project,
                Err(DispatchError::AuthInvalid(msg)) => {
                    warn!(event = "project_error", email = %account.email, error = %msg);
                    oauth::invalidate(&self.pool, &account.email).await;
                    let _ = self.pool.pick_next(model).await;
                    continue 'attempts;
                }
                Err(err) => {
                    warn!(event = "project_error", email = %account.email, error = %err);
                    tokio::time::sleep(NETWORK_ERROR_BACKOFF).await;
                    let _ = self.pool.pick_next(model).await;
                    continue 'attempts;
                }
            };

            let options = models::request_options(model, self.config.gemini_max_output_tokens);
            let mut request = to_generate_content(body, &self.signatures, options);
            request.session_id = Some(builder::session_id(&body.messages));

            'endpoints: for endpoint in &self.config.endpoints {
                let mut retried_429_once = false;
                let mut empty_retries = 0u32;
                loop {
                    let envelope = builder::build_envelope(model, &project, request.clone());
                    let payload = match serde_json::to_vec(&envelope) {
                        Ok(payload) => Bytes::from(payload),
                        Err(err) => {
                            return Err(DispatchError::BadRequest {
                                status: 400,
                                body: err.to_string(),
                            });
                        }
                    };
                    let url = generate_url(endpoint, use_sse);
                    debug!(
                        event = "upstream_call",
                        model = %model,
                        email = %account.email,
                        endpoint = %endpoint,
                        attempt,
                        stream = use_sse
                    );
                    let response = match self
                        .transport
                        .send(UpstreamRequest {
                            url,
                            headers: builder::build_headers(&token, model, use_sse),
                            body: payload,
                            stream: use_sse,
                        })
                        .await
                    {
                        Ok(response) => response,
                        Err(err) => {
                            warn!(
                                event = "upstream_network_error",
                                email = %account.email,
                                endpoint = %endpoint,
                                error = %err
                            );
                            tokio::time::sleep(NETWORK_ERROR_BACKOFF).await;
                            let _ = self.pool.pick_next(model).await;
                            continue 'attempts;
                        }
                    };

                    match response.status {
                        200..=299 => {
                            match self.consume_success(model, response, use_sse, out).await {
                                Ok(Consumed::Complete) | Ok(Consumed::ClientGone) => return Ok(()),
                                Err(err) => {
                                    warn!(
                                        event = "upstream_body_error",
                                        email = %account.email,
                                        endpoint = %endpoint,
                                        error = %err
                                    );
                                    tokio::time::sleep(NETWORK_ERROR_BACKOFF).await;
                                    let _ = self.pool.pick_next(model).await;
                                    continue 'attempts;
                                }
                                Ok(Consumed::Empty) => {
                                    if empty_retries < self.config.max_empty_response_retries {
                                        let delay = EMPTY_RETRY_BASE * 2u32.pow(empty_retries);
                                        empty_retries += 1;
                                        info!(
                                            event = "empty_response_retry",
                                            email = %account.email,
                                            endpoint = %endpoint,
                                            retry = empty_retries,
                                            delay_ms = delay.as_millis() as u64
                                        );
                                        tokio::time::sleep(delay).await;
                                        continue;
                                    }
                                    warn!(event = "empty_response_gave_up", email = %account.email);
                                    return self.emit_synthetic(model, out).await;
                                }
                            }
                        }
                        401 => {
                            warn!(event = "upstream_401", email = %account.email, endpoint = %endpoint);
                            oauth::invalidate(&self.pool, &account.email).await;
                            continue 'endpoints;
                        }
                        429 => {
                            let retry_after = response.header("retry-after").map(str::to_string);
                            let body_bytes = response.body_bytes().await;
                            let reset_ms = parse_reset_ms(retry_after.as_deref(), &body_bytes)
                                .unwrap_or(self.config.default_cooldown_ms);
                            if reset_ms > SHORT_RETRY_CEILING_MS {
                                info!(
                                    event = "rate_limited_long",
                                    email = %account.email,
                                    model = %model,
                                    reset_ms
                                );
                                self.pool
                                    .mark_limited(&account.email, Duration::from_millis(reset_ms), model)
                                    .await;
                                continue 'attempts;
                            }
                            if !retried_429_once {
                                retried_429_once = true;
                                info!(
                                    event = "rate_limited_short",
                                    email = %account.email,
                                    reset_ms
                                );
                                tokio::time::sleep(Duration::from_millis(reset_ms)).await;
                                continue;
                            }
                            // reset_ms is already parsed-or-default.
                            self.pool
                                .mark_limited(&account.email, Duration::from_millis(reset_ms), model)
                                .await;
                            continue 'attempts;
                        }
                        500..=599 => {
                            warn!(
                                event = "upstream_5xx",
                                email = %account.email,
                                endpoint = %endpoint,
                                status = response.status
                            );
                            tokio::time::sleep(SERVER_ERROR_BACKOFF).await;
                            continue 'endpoints;
                        }
                        status => {
                            let body_bytes = response.body_bytes().await;
                            return Err(DispatchError::BadRequest {
                                status,
                                body: String::from_utf8_lossy(&body_bytes).into_owned(),
                            });
                        }
                    }
                }
            }
        }

        Err(DispatchError::MaxRetriesExceeded)
    }

    async fn consume_success(
        &self,
        model: &str,
        response: crate::upstream::UpstreamResponse,
        use_sse: bool,
        out: &mut Output<'_>,
    ) -> DispatchResult<Consumed> {
        if !use_sse {
            let bytes = response.body_bytes().await;
            let reply: GenerateContentReply = serde_json::from_slice(&bytes)
                .map_err(|err| DispatchError::NetworkError(format!("bad upstream body: {err}")))?;
            let upstream = reply.into_response();
            if is_empty_oneshot(&upstream) {
                return Ok(Consumed::Empty);
            }
            let message = to_message(model, &upstream);
            if let Output::OneShot { message: slot } = out {
                *slot = Some(message);
            }
            return Ok(Consumed::Complete);
        }

        let UpstreamBody::Stream(mut rx) = response.body else {
            return Err(DispatchError::NetworkError(
                "expected a streaming body".to_string(),
            ));
        };

        let mut parser = SseParser::new();
        let mut adapter = StreamAdapter::new(model);
        let mut accumulator = MessageAccumulator::new();
        let mut saw_done = false;

        'read: while let Some(chunk) = rx.recv().await {
            for event in parser.push_bytes(&chunk) {
                if event.is_done() {
                    saw_done = true;
                    break 'read;
                }
                for fragment in parse_fragments(&event.data) {
                    let events = adapter.on_response(&fragment);
                    if !self
                        .forward(&mut accumulator, out, events)
                        .await
                    {
                        return Ok(Consumed::ClientGone);
                    }
                }
            }
        }
        for event in parser.finish() {
            if event.is_done() {
                saw_done = true;
                continue;
            }
            for fragment in parse_fragments(&event.data) {
                let events = adapter.on_response(&fragment);
                if !self.forward(&mut accumulator, out, events).await {
                    return Ok(Consumed::ClientGone);
                }
            }
        }

        if adapter.is_empty_response() {
            // No events were produced, so the endpoint can be retried.
            return Ok(Consumed::Empty);
        }

        if adapter.is_finished() || saw_done {
            let tail = adapter.finish();
            if !self.forward(&mut accumulator, out, tail).await {
                return Ok(Consumed::ClientGone);
            }
            for (thinking, signature) in adapter.take_captured_signatures() {
                self.signatures.record(&thinking, &signature);
            }
            if let Output::OneShot { message } = out {
                *message = Some(std::mem::take(&mut accumulator).finalize(model));
            }
            return Ok(Consumed::Complete);
        }

        // The body ended mid-message with no terminator. If the client has
        // already seen bytes the only legal ending is a terminal error event;
        // otherwise the attempt is retryable.
        if out.emitted() {
            let events = adapter.abort("upstream_disconnect", "upstream closed the stream early");
            let _ = self.forward(&mut accumulator, out, events).await;
            return Ok(Consumed::Complete);
        }
        Err(DispatchError::UpstreamDisconnect)
    }

    /// Returns false when the client sink is gone.
    async fn forward(
        &self,
        accumulator: &mut MessageAccumulator,
        out: &mut Output<'_>,
        events: Vec<StreamEvent>,
    ) -> bool {
        match out {
            Output::OneShot { .. } => {
                for event in &events {
                    accumulator.push_event(event);
                }
                true
            }
            Output::Stream { tx, emitted } => {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return false;
                    }
                    *emitted = true;
                }
                true
            }
        }
    }

    /// Scenario tail for exhausted empty-response retries: a synthetic
    /// single-block message.
    async fn emit_synthetic(&self, model: &str, out: &mut Output<'_>) -> DispatchResult<()> {
        let fragment = synthetic_response();
        match out {
            Output::OneShot { message } => {
                *message = Some(to_message(model, &fragment));
                Ok(())
            }
            Output::Stream { .. } => {
                let mut adapter = StreamAdapter::new(model);
                let mut events = adapter.on_response(&fragment);
                events.extend(adapter.finish());
                let mut accumulator = MessageAccumulator::new();
                self.forward(&mut accumulator, out, events).await;
                Ok(())
            }
        }
    }
}

fn generate_url(endpoint: &str, stream: bool) -> String {
    let base = endpoint.trim_end_matches('/');
    if stream {
        format!("{base}/v1internal:streamGenerateContent?alt=sse")
    } else {
        format!("{base}/v1internal:generateContent")
    }
}

fn synthetic_response() -> GenerateContentResponse {
    GenerateContentResponse {
        candidates: vec![Candidate {
            content: Some(Content::model(vec![Part::text(EMPTY_FALLBACK_TEXT)])),
            finish_reason: Some(FinishReason::Stop),
            index: Some(0),
        }],
        usage_metadata: None,
        model_version: None,
        response_id: None,
    }
}

fn is_empty_oneshot(response: &GenerateContentResponse) -> bool {
    let output_tokens = response
        .usage_metadata
        .and_then(|u| u.candidates_token_count)
        .unwrap_or(0);
    if output_tokens > 0 {
        return false;
    }
    let Some(candidate) = response.candidates.first() else {
        return true;
    };
    let parts = candidate
        .content
        .as_ref()
        .map(|c| c.parts.as_slice())
        .unwrap_or_default();
    !parts.iter().any(|part| {
        part.function_call.is_some() || part.text.as_deref().is_some_and(|t| !t.is_empty())
    })
}

/// Upstream fragments arrive as single objects, but some hosts batch them
/// into arrays.
fn parse_fragments(data: &str) -> Vec<GenerateContentResponse> {
    if let Ok(single) = serde_json::from_str::<GenerateContentResponse>(data) {
        return vec![single];
    }
    if let Ok(batch) = serde_json::from_str::<Vec<GenerateContentResponse>>(data) {
        return batch;
    }
    Vec::new()
}

/// Cooldown from a 429: `Retry-After` seconds, else the RetryInfo
/// `retryDelay` detail in the error body.
fn parse_reset_ms(retry_after: Option<&str>, body: &[u8]) -> Option<u64> {
    if let Some(value) = retry_after
        && let Ok(seconds) = value.trim().parse::<u64>()
    {
        return Some(seconds * 1000);
    }
    let payload: JsonValue = serde_json::from_slice(body).ok()?;
    let details = payload.get("error")?.get("details")?.as_array()?;
    for detail in details {
        if let Some(delay) = detail.get("retryDelay").and_then(JsonValue::as_str)
            && let Some(ms) = parse_duration_ms(delay)
        {
            return Some(ms);
        }
    }
    None
}

/// Parses Google's duration strings: "3s", "3.5s", "350ms".
fn parse_duration_ms(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(value) = raw.strip_suffix("ms") {
        return value.trim().parse::<f64>().ok().map(|v| v as u64);
    }
    let value = raw.strip_suffix('s')?;
    let seconds: f64 = value.trim().parse().ok()?;
    Some((seconds * 1000.0) as u64)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    use ccproxy_accounts::Account;
    use ccproxy_protocol::claude::types::{MessageContent, MessageParam, MessageRole};

    use crate::config::ProxyConfig;

    use super::*;

    enum Scripted {
        Json {
            status: u16,
            headers: Vec<(String, String)>,
            body: String,
        },
        Sse {
            frames: Vec<String>,
        },
        NetworkError,
    }

    #[derive(Debug, Clone)]
    struct SeenCall {
        url: String,
        authorization: String,
        body: String,
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Scripted>>,
        calls: Mutex<Vec<SeenCall>>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Scripted>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<SeenCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl UpstreamTransport for ScriptedTransport {
        fn send<'a>(
            &'a self,
            req: UpstreamRequest,
        ) -> Pin<Box<dyn Future<Output = Result<crate::upstream::UpstreamResponse, DispatchError>> + Send + 'a>>
        {
            Box::pin(async move {
                let authorization = req
                    .headers
                    .iter()
                    .find(|(k, _)| k == "Authorization")
                    .map(|(_, v)| v.clone())
                    .unwrap_or_default();
                self.calls.lock().unwrap().push(SeenCall {
                    url: req.url.clone(),
                    authorization,
                    body: String::from_utf8_lossy(&req.body).into_owned(),
                });
                let next = self
                    .script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .expect("script exhausted");
                match next {
                    Scripted::Json {
                        status,
                        headers,
                        body,
                    } => Ok(crate::upstream::UpstreamResponse {
                        status,
                        headers,
                        body: UpstreamBody::Bytes(Bytes::from(body)),
                    }),
                    Scripted::Sse { frames } => {
                        let (tx, rx) = mpsc::channel(16);
                        tokio::spawn(async move {
                            for frame in frames {
                                if tx.send(Bytes::from(frame)).await.is_err() {
                                    return;
                                }
                            }
                        });
                        Ok(crate::upstream::UpstreamResponse {
                            status: 200,
                            headers: Vec::new(),
                            body: UpstreamBody::Stream(rx),
                        })
                    }
                    Scripted::NetworkError => {
                        Err(DispatchError::NetworkError("connection refused".to_string()))
                    }
                }
            })
        }
    }

    fn test_config() -> ProxyConfig {
        ProxyConfig {
            max_retries: 3,
            ..ProxyConfig::default()
        }
    }

    async fn seeded_pool(emails: &[&str]) -> Arc<AccountPool> {
        let pool = Arc::new(AccountPool::new(10));
        for email in emails {
            pool.add(Account {
                email: email.to_string(),
                refresh_token: "rt".to_string(),
                client_id: "ci".to_string(),
                client_secret: "cs".to_string(),
                created_at: 0,
            })
            .await
            .unwrap();
            let expiry = tokio::time::Instant::now() + Duration::from_secs(3600);
            pool.store_token(email, format!("tok-{email}"), expiry).await;
            pool.store_project(email, "project-1".to_string()).await;
        }
        pool
    }

    fn engine(
        config: ProxyConfig,
        pool: Arc<AccountPool>,
        transport: Arc<ScriptedTransport>,
    ) -> DispatchEngine {
        let auth = AuthClient::new(config.oauth_token_url.clone(), None).unwrap();
        DispatchEngine::new(config, pool, transport, auth)
    }

    fn request_for(model: &str, stream: bool) -> CreateMessageBody {
        CreateMessageBody {
            model: model.to_string(),
            messages: vec![MessageParam {
                role: MessageRole::User,
                content: MessageContent::Text("hello".to_string()),
            }],
            system: None,
            tools: None,
            max_tokens: Some(1024),
            stream: Some(stream),
            thinking: None,
        }
    }

    fn ok_json_body() -> String {
        serde_json::json!({
            "response": {
                "candidates": [{
                    "content": {"role": "model", "parts": [{"text": "hi there"}]},
                    "finishReason": "STOP",
                    "index": 0
                }],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 2}
            }
        })
        .to_string()
    }

    fn sse_frames(texts: &[&str]) -> Vec<String> {
        let mut frames: Vec<String> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let finish = if i + 1 == texts.len() {
                    ",\"finishReason\":\"STOP\""
                } else {
                    ""
                };
                format!(
                    "data: {{\"candidates\":[{{\"content\":{{\"role\":\"model\",\"parts\":[{{\"text\":\"{text}\"}}]}}{finish},\"index\":0}}],\"usageMetadata\":{{\"promptTokenCount\":3,\"candidatesTokenCount\":4}}}}\n\n"
                )
            })
            .collect();
        frames.push("data: [DONE]\n\n".to_string());
        frames
    }

    #[tokio::test]
    async fn oneshot_happy_path_uses_json_endpoint() {
        let transport = ScriptedTransport::new(vec![Scripted::Json {
            status: 200,
            headers: Vec::new(),
            body: ok_json_body(),
        }]);
        let pool = seeded_pool(&["a@x"]).await;
        let engine = engine(test_config(), pool, transport.clone());

        let message = engine.send(&request_for("gemini-2.5-flash", false)).await.unwrap();
        assert_eq!(message.usage.output_tokens, 2);
        let calls = transport.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].url.ends_with("v1internal:generateContent"));
        assert!(calls[0].url.contains("daily"));
        assert_eq!(calls[0].authorization, "Bearer tok-a@x");
        assert!(calls[0].body.contains("\"requestType\":\"agent\""));
        assert!(calls[0].body.contains("\"sessionId\""));
    }

    #[tokio::test]
    async fn short_429_reissues_same_endpoint_once() {
        let limited = serde_json::json!({
            "error": {
                "code": 429,
                "status": "RESOURCE_EXHAUSTED",
                "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": "0.1s"}]
            }
        })
        .to_string();
        let transport = ScriptedTransport::new(vec![
            Scripted::Json {
                status: 429,
                headers: Vec::new(),
                body: limited,
            },
            Scripted::Json {
                status: 200,
                headers: Vec::new(),
                body: ok_json_body(),
            },
        ]);
        let pool = seeded_pool(&["a@x"]).await;
        let engine = engine(test_config(), pool.clone(), transport.clone());

        engine.send(&request_for("gemini-2.5-flash", false)).await.unwrap();
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].url, calls[1].url);
        // The account stays usable afterwards.
        assert!(!pool.all_limited("gemini-2.5-flash").await);
    }

    #[tokio::test]
    async fn second_short_429_marks_limited_with_parsed_cooldown() {
        let limited = |delay: &str| Scripted::Json {
            status: 429,
            headers: Vec::new(),
            body: serde_json::json!({
                "error": {
                    "code": 429,
                    "status": "RESOURCE_EXHAUSTED",
                    "details": [{"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": delay}]
                }
            })
            .to_string(),
        };
        let transport = ScriptedTransport::new(vec![
            limited("0.1s"),
            limited("2s"),
            Scripted::Json {
                status: 200,
                headers: Vec::new(),
                body: ok_json_body(),
            },
        ]);
        let pool = seeded_pool(&["a@x", "b@x"]).await;
        let engine = engine(test_config(), pool.clone(), transport.clone());

        engine.send(&request_for("gemini-2.5-flash", false)).await.unwrap();
        let calls = transport.calls();
        assert_eq!(calls.len(), 3);
        // One in-place re-issue on the first account, then the switch.
        assert_eq!(calls[0].url, calls[1].url);
        assert_eq!(calls[0].authorization, "Bearer tok-a@x");
        assert_eq!(calls[1].authorization, "Bearer tok-a@x");
        assert_eq!(calls[2].authorization, "Bearer tok-b@x");

        // The cooldown on the first account is the server's 2s hint, not the
        // 10s default.
        assert_eq!(pool.available_for("gemini-2.5-flash").await.len(), 1);
        pool.mark_limited("b@x", Duration::from_secs(60), "gemini-2.5-flash").await;
        let wait = pool.min_wait("gemini-2.5-flash").await.unwrap();
        assert!(wait <= Duration::from_secs(2));
        assert!(wait > Duration::from_millis(1500));
    }

    #[tokio::test]
    async fn long_429_switches_account_and_marks_limited() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Json {
                status: 429,
                headers: vec![("retry-after".to_string(), "120".to_string())],
                body: "{}".to_string(),
            },
            Scripted::Json {
                status: 200,
                headers: Vec::new(),
                body: ok_json_body(),
            },
        ]);
        let pool = seeded_pool(&["a@x", "b@x"]).await;
        let engine = engine(test_config(), pool.clone(), transport.clone());

        engine.send(&request_for("gemini-2.5-flash", false)).await.unwrap();
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].authorization, "Bearer tok-a@x");
        assert_eq!(calls[1].authorization, "Bearer tok-b@x");
        assert_eq!(pool.available_for("gemini-2.5-flash").await.len(), 1);
        // Sticky moved to the account that served the request.
        assert_eq!(pool.sticky_for("gemini-2.5-flash").await.unwrap().email, "b@x");
    }

    #[tokio::test]
    async fn server_error_fails_over_to_next_endpoint() {
        let transport = ScriptedTransport::new(vec![
            Scripted::Json {
                status: 503,
                headers: Vec::new(),
                body: "oops".to_string(),
            },
            Scripted::Json {
                status: 200,
                headers: Vec::new(),
                body: ok_json_body(),
            },
        ]);
        let pool = seeded_pool(&["a@x"]).await;
        let engine = engine(test_config(), pool, transport.clone());

        engine.send(&request_for("gemini-2.5-flash", false)).await.unwrap();
        let calls = transport.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].url.contains("daily"));
        assert!(!calls[1].url.contains("daily"));
    }

    #[tokio::test]
    async fn bad_request_passes_through_unchanged() {
        let transport = ScriptedTransport::new(vec![Scripted::Json {
            status: 400,
            headers: Vec::new(),
            body: "schema violation".to_string(),
        }]);
        let pool = seeded_pool(&["a@x"]).await;
        let engine = engine(test_config(), pool, transport);

        let err = engine
            .send(&request_for("gemini-2.5-flash", false))
            .await
            .unwrap_err();
        match err {
            DispatchError::BadRequest { status, body } => {
                assert_eq!(status, 400);
                assert_eq!(body, "schema violation");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn streaming_happy_path_emits_ordered_events() {
        let transport = ScriptedTransport::new(vec![Scripted::Sse {
            frames: sse_frames(&["hello ", "world"]),
        }]);
        let pool = seeded_pool(&["a@x"]).await;
        let engine = engine(test_config(), pool, transport.clone());

        let (tx, mut rx) = mpsc::channel(64);
        engine
            .send_stream(&request_for("gemini-2.5-flash", true), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut names = Vec::new();
        while let Some(event) = rx.recv().await {
            names.push(event.name());
        }
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(transport.calls()[0].url.contains("streamGenerateContent"));
    }

    #[tokio::test]
    async fn empty_stream_retries_then_synthesizes_fallback() {
        let empty = || Scripted::Sse {
            frames: vec!["data: [DONE]\n\n".to_string()],
        };
        let transport = ScriptedTransport::new(vec![empty(), empty(), empty()]);
        let pool = seeded_pool(&["a@x"]).await;
        let engine = engine(test_config(), pool, transport.clone());

        let (tx, mut rx) = mpsc::channel(64);
        engine
            .send_stream(&request_for("gemini-2.5-flash", true), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut texts = Vec::new();
        while let Some(event) = rx.recv().await {
            if let StreamEvent::ContentBlockDelta {
                delta: ccproxy_protocol::claude::stream::ContentBlockDelta::TextDelta { text },
                ..
            } = event
            {
                texts.push(text);
            }
        }
        // Two retries after the first attempt, then the synthetic block.
        assert_eq!(transport.calls().len(), 3);
        assert_eq!(texts, vec![EMPTY_FALLBACK_TEXT.to_string()]);
    }

    #[tokio::test]
    async fn wholly_limited_pool_falls_back_cross_family() {
        let transport = ScriptedTransport::new(vec![Scripted::Sse {
            frames: sse_frames(&["fallback says hi"]),
        }]);
        let pool = seeded_pool(&["a@x"]).await;
        pool.mark_limited("a@x", Duration::from_secs(300), "claude-sonnet-4-5").await;
        let engine = engine(test_config(), pool, transport.clone());

        let message = engine.send(&request_for("claude-sonnet-4-5", false)).await.unwrap();
        assert!(!message.content.is_empty());
        // The hop swapped in the cross-family model.
        assert!(transport.calls()[0].body.contains("\"model\":\"gemini-2.5-pro\""));
    }

    #[tokio::test]
    async fn wholly_limited_pool_without_fallback_is_quota_exhausted() {
        let transport = ScriptedTransport::new(vec![]);
        let pool = seeded_pool(&["a@x"]).await;
        pool.mark_limited("a@x", Duration::from_secs(300), "claude-sonnet-4-5").await;
        let config = ProxyConfig {
            fallback_enabled: false,
            ..test_config()
        };
        let engine = engine(config, pool, transport);

        let err = engine
            .send(&request_for("claude-sonnet-4-5", false))
            .await
            .unwrap_err();
        match err {
            DispatchError::QuotaExhausted { reset_ms } => assert!(reset_ms > 120_000),
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn network_errors_bound_by_attempt_budget() {
        let transport = ScriptedTransport::new(vec![
            Scripted::NetworkError,
            Scripted::NetworkError,
            Scripted::NetworkError,
        ]);
        let pool = seeded_pool(&["a@x"]).await;
        let config = ProxyConfig {
            max_retries: 3,
            ..test_config()
        };
        let engine = engine(config, pool, transport.clone());

        let err = engine
            .send(&request_for("gemini-2.5-flash", false))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::MaxRetriesExceeded));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn truncated_stream_ends_with_terminal_error_event() {
        let transport = ScriptedTransport::new(vec![Scripted::Sse {
            frames: vec![
                "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"par\"}]},\"index\":0}]}\n\n"
                    .to_string(),
            ],
        }]);
        let pool = seeded_pool(&["a@x"]).await;
        let engine = engine(test_config(), pool, transport);

        let (tx, mut rx) = mpsc::channel(64);
        engine
            .send_stream(&request_for("gemini-2.5-flash", true), &tx)
            .await
            .unwrap();
        drop(tx);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        match events.last() {
            Some(StreamEvent::Error { error }) => {
                assert_eq!(error.kind, "upstream_disconnect");
            }
            other => panic!("unexpected tail: {other:?}"),
        }
        // The open text block was closed before the error.
        assert!(events
            .iter()
            .any(|e| matches!(e, StreamEvent::ContentBlockStop { .. })));
    }

    #[test]
    fn reset_parsing_prefers_retry_after_header() {
        assert_eq!(parse_reset_ms(Some("3"), b"{}"), Some(3000));
        let body = serde_json::json!({
            "error": {"details": [{"retryDelay": "2.5s"}]}
        })
        .to_string();
        assert_eq!(parse_reset_ms(None, body.as_bytes()), Some(2500));
        assert_eq!(parse_reset_ms(None, b"not json"), None);
        assert_eq!(parse_duration_ms("350ms"), Some(350));
    }
}
