//! Connections to the control-plane agent.
//!
//! - [`HttpTransport`]: `POST {agent}/api/v1/executor`, with the subscribe
//!   response read as a RecordIO event stream
//! - [`MockTransport`]: channel-backed, for tests

use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{stream, StreamExt};
use podex_id::TaskId;
use podex_proto::recordio::{decode_event, RecordIoDecoder, DEFAULT_MAX_RECORD};
use podex_proto::{
    Acknowledged, Call, CallKind, Event, ExecutorInfo, ProtoError, Subscribed, TaskStatus,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, trace};

/// Inbound events; the stream ending is the connection closing.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event, TransportError>> + Send>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),

    #[error("connection closed")]
    Closed,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the subscription and returns its event stream.
    async fn subscribe(&self, call: &Call) -> Result<EventStream, TransportError>;

    /// Sends a non-subscribe call.
    async fn send(&self, call: &Call) -> Result<(), TransportError>;

    async fn close(&self);
}

// =============================================================================
// HTTP
// =============================================================================

pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    /// `endpoint` is the agent's `host:port`.
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, TransportError> {
        // No overall timeout: the subscribe response never completes.
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()?;
        let base = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{endpoint}")
        };
        Ok(Self {
            client,
            url: format!("{base}/api/v1/executor"),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn subscribe(&self, call: &Call) -> Result<EventStream, TransportError> {
        debug!(url = %self.url, "Subscribing");
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(call)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let state = (
            response.bytes_stream().boxed(),
            RecordIoDecoder::new(DEFAULT_MAX_RECORD),
            false,
        );
        let events = stream::unfold(state, |(mut body, mut decoder, done)| async move {
            if done {
                return None;
            }
            loop {
                match decoder.next_record() {
                    Ok(Some(record)) => {
                        let event = decode_event(&record).map_err(TransportError::from);
                        return Some((event, (body, decoder, false)));
                    }
                    Ok(None) => {}
                    Err(e) => return Some((Err(e.into()), (body, decoder, true))),
                }
                match body.next().await {
                    Some(Ok(chunk)) => {
                        trace!(bytes = chunk.len(), "Subscription chunk");
                        decoder.push(&chunk);
                    }
                    Some(Err(e)) => return Some((Err(e.into()), (body, decoder, true))),
                    None => {
                        return match decoder.finish() {
                            Ok(()) => None,
                            Err(e) => Some((Err(e.into()), (body, decoder, true))),
                        }
                    }
                }
            }
        });
        Ok(Box::pin(events))
    }

    async fn send(&self, call: &Call) -> Result<(), TransportError> {
        let response = self.client.post(&self.url).json(call).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::ACCEPTED && !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(call = call.kind(), "Call sent");
        Ok(())
    }

    async fn close(&self) {}
}

// =============================================================================
// Mock
// =============================================================================

type EventSender = mpsc::UnboundedSender<Result<Event, TransportError>>;

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<Call>,
    sender: Option<EventSender>,
    /// Events pushed while no subscription was open.
    pending: Vec<Event>,
    fail_subscribes: u32,
    fail_sends: bool,
    auto_ack: bool,
    closed: bool,
}

/// Channel-backed [`Transport`]. Every subscribe answers `SUBSCRIBED` first.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = self.state.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    /// Acknowledge every update as soon as it is sent.
    pub fn auto_ack(&self, enabled: bool) {
        self.with_state(|s| s.auto_ack = enabled);
    }

    /// Fail the next `n` subscribe attempts.
    pub fn fail_subscribes(&self, n: u32) {
        self.with_state(|s| s.fail_subscribes = n);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.with_state(|s| s.fail_sends = fail);
    }

    /// Delivers an event on the open subscription, or queues it for the next.
    pub fn push_event(&self, event: Event) {
        self.with_state(|s| match &s.sender {
            Some(tx) if tx.send(Ok(event.clone())).is_ok() => {}
            _ => s.pending.push(event),
        });
    }

    /// Ends the current event stream.
    pub fn drop_connection(&self) {
        self.with_state(|s| s.sender = None);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with_state(|s| s.calls.clone())
    }

    pub fn subscribe_count(&self) -> usize {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter(|c| matches!(c.kind, CallKind::Subscribe { .. }))
                .count()
        })
    }

    pub fn updates(&self) -> Vec<TaskStatus> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter_map(|c| match &c.kind {
                    CallKind::Update { update } => Some(update.status.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn messages(&self) -> Vec<Vec<u8>> {
        self.with_state(|s| {
            s.calls
                .iter()
                .filter_map(|c| match &c.kind {
                    CallKind::Message { message } => Some(message.data.clone()),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn is_closed(&self) -> bool {
        self.with_state(|s| s.closed)
    }

    /// Polls until `pred` holds for the recorded updates or `timeout` passes.
    pub async fn wait_for_updates(
        &self,
        timeout: Duration,
        pred: impl Fn(&[TaskStatus]) -> bool,
    ) -> Vec<TaskStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let updates = self.updates();
            if pred(&updates) || tokio::time::Instant::now() >= deadline {
                return updates;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Polls until `pred` holds for the recorded messages or `timeout` passes.
    pub async fn wait_for_messages(
        &self,
        timeout: Duration,
        pred: impl Fn(&[Vec<u8>]) -> bool,
    ) -> Vec<Vec<u8>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let messages = self.messages();
            if pred(&messages) || tokio::time::Instant::now() >= deadline {
                return messages;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn subscribed_event(call: &Call) -> Event {
    Event::Subscribed {
        subscribed: Subscribed {
            executor_info: ExecutorInfo {
                executor_id: call.executor_id.clone(),
                framework_id: Some(call.framework_id.clone()),
                name: None,
            },
            framework_info: None,
            agent_id: None,
            container_id: None,
        },
    }
}

fn ack_event(task_id: TaskId, uuid: String) -> Event {
    Event::Acknowledged {
        acknowledged: Acknowledged { task_id, uuid },
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn subscribe(&self, call: &Call) -> Result<EventStream, TransportError> {
        self.with_state(|s| {
            s.calls.push(call.clone());
            if s.fail_subscribes > 0 {
                s.fail_subscribes -= 1;
                return Err(TransportError::Status {
                    status: 503,
                    body: "mock subscribe failure".to_string(),
                });
            }

            let (tx, rx) = mpsc::unbounded_channel();
            let _ = tx.send(Ok(subscribed_event(call)));
            for event in s.pending.drain(..) {
                let _ = tx.send(Ok(event));
            }
            s.sender = Some(tx);
            let events: EventStream = Box::pin(UnboundedReceiverStream::new(rx));
            Ok(events)
        })
    }

    async fn send(&self, call: &Call) -> Result<(), TransportError> {
        self.with_state(|s| {
            if s.fail_sends {
                return Err(TransportError::Closed);
            }
            s.calls.push(call.clone());
            if let (true, CallKind::Update { update }, Some(tx)) = (s.auto_ack, &call.kind, &s.sender)
            {
                if let Some(uuid) = &update.status.uuid {
                    let _ = tx.send(Ok(ack_event(update.status.task_id.clone(), uuid.clone())));
                }
            }
            Ok(())
        })
    }

    async fn close(&self) {
        self.with_state(|s| {
            s.closed = true;
            s.sender = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use podex_proto::recordio::encode_event;
    use podex_proto::{TaskState, Update};
    use podex_testing::{executor_id, framework_id};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn subscribe_call() -> Call {
        Call::subscribe(framework_id(), executor_id(), Default::default())
    }

    #[tokio::test]
    async fn test_http_subscribe_decodes_recordio() {
        let server = MockServer::start().await;
        let mut body = encode_event(&subscribed_event(&subscribe_call())).unwrap();
        body.extend(encode_event(&Event::Heartbeat).unwrap());
        body.extend(encode_event(&Event::Shutdown).unwrap());
        Mock::given(method("POST"))
            .and(path("/api/v1/executor"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let events: Vec<Event> = transport
            .subscribe(&subscribe_call())
            .await
            .unwrap()
            .map(|e| e.unwrap())
            .collect()
            .await;
        let kinds: Vec<&str> = events.iter().map(Event::kind).collect();
        assert_eq!(kinds, vec!["SUBSCRIBED", "HEARTBEAT", "SHUTDOWN"]);
    }

    #[tokio::test]
    async fn test_http_send_requires_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad call"))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), Duration::from_secs(5)).unwrap();
        let status = TaskStatus::new(TaskId::parse("web.task").unwrap(), TaskState::Running);
        let err = transport
            .send(&Call::update(framework_id(), executor_id(), status))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Status { status: 400, .. }));
    }

    #[test]
    fn test_endpoint_normalisation() {
        let t = HttpTransport::new("10.0.0.1:5051", Duration::from_secs(1)).unwrap();
        assert_eq!(t.url(), "http://10.0.0.1:5051/api/v1/executor");
        let t = HttpTransport::new("https://agent/", Duration::from_secs(1)).unwrap();
        assert_eq!(t.url(), "https://agent/api/v1/executor");
    }

    #[tokio::test]
    async fn test_mock_auto_ack() {
        let transport = MockTransport::new();
        transport.auto_ack(true);
        let mut events = transport.subscribe(&subscribe_call()).await.unwrap();
        assert_eq!(events.next().await.unwrap().unwrap().kind(), "SUBSCRIBED");

        let mut status = TaskStatus::new(TaskId::parse("web.task").unwrap(), TaskState::Running);
        status.uuid = Some("u-1".to_string());
        transport
            .send(&Call::update(framework_id(), executor_id(), status.clone()))
            .await
            .unwrap();

        match events.next().await.unwrap().unwrap() {
            Event::Acknowledged { acknowledged } => assert_eq!(acknowledged.uuid, "u-1"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(transport.updates(), vec![status]);
        assert!(matches!(
            transport.calls()[1].kind,
            CallKind::Update {
                update: Update { .. }
            }
        ));

        transport.drop_connection();
        assert!(events.next().await.is_none());
    }
}
