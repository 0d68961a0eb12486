//! Management API: JSON lifecycle endpoints plus the SSE event stream.

use crate::config::Config;
use crate::error::{full_body, GateBody};
use crate::events::{Event, EventBus};
use crate::service::{ServiceMap, ServiceState};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL,
    CONNECTION, CONTENT_TYPE,
};
use hyper::{Request, Response, StatusCode};
use serde_json::json;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Dispatch a management request.
///
/// `/start`, `/stop` and `/status` act on the service named by the `service`
/// query parameter, or on the API service itself when none is given.
pub async fn handle(
    req: Request<Incoming>,
    own_state: Arc<ServiceState>,
    config: Arc<Config>,
    services: Arc<ServiceMap>,
) -> Response<GateBody> {
    let path = req.uri().path().trim_start_matches('/').to_string();

    match path.as_str() {
        "start" => {
            let state = match target_state(&req, &own_state, &config, &services) {
                Ok(state) => state,
                Err(resp) => return resp,
            };
            match state.start().await {
                Ok(()) => json_response(StatusCode::OK, json!({"status": "ok"})),
                Err(e) => json_response(
                    StatusCode::OK,
                    json!({"status": "error", "error": e.to_string()}),
                ),
            }
        }
        "stop" => {
            let state = match target_state(&req, &own_state, &config, &services) {
                Ok(state) => state,
                Err(resp) => return resp,
            };
            state.stop().await;
            json_response(StatusCode::OK, json!({"status": "ok"}))
        }
        "status" => {
            let state = match target_state(&req, &own_state, &config, &services) {
                Ok(state) => state,
                Err(resp) => return resp,
            };
            json_response(StatusCode::OK, json!({"running": state.is_running().await}))
        }
        "list" => list_services(&config, &services).await,
        "events" => event_stream(services.events()),
        _ => json_response(
            StatusCode::NOT_FOUND,
            json!({"status": "error", "error": "Unknown API endpoint"}),
        ),
    }
}

/// Resolve the service a lifecycle endpoint operates on.
fn target_state(
    req: &Request<Incoming>,
    own_state: &Arc<ServiceState>,
    config: &Arc<Config>,
    services: &Arc<ServiceMap>,
) -> Result<Arc<ServiceState>, Response<GateBody>> {
    let Some(name) = service_query(req.uri().query()) else {
        return Ok(Arc::clone(own_state));
    };
    match config.services.get(name) {
        Some(service) => Ok(services.get_or_create(name, service)),
        None => Err(json_response(
            StatusCode::NOT_FOUND,
            json!({"status": "error", "error": format!("Unknown service: {}", name)}),
        )),
    }
}

fn service_query(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("service="))
        .filter(|name| !name.is_empty())
}

async fn list_services(config: &Arc<Config>, services: &Arc<ServiceMap>) -> Response<GateBody> {
    let mut result = serde_json::Map::new();

    for (name, service) in &config.services {
        if service.hidden {
            continue;
        }
        let running = match services.get(name) {
            Some(state) => state.is_running().await,
            None => false,
        };
        let status = if running { "started" } else { "stopped" };
        result.insert(
            name.clone(),
            json!({"status": status, "subdomain": service.subdomain}),
        );
    }

    json_response(StatusCode::OK, serde_json::Value::Object(result))
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<GateBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .header(ACCESS_CONTROL_ALLOW_HEADERS, "*")
        .body(full_body(body.to_string()))
        .expect("valid response with StatusCode enum and static headers")
}

/// Open the SSE stream: headers, a `connected` preamble, then one `message`
/// frame per bus event until the client goes away.
fn event_stream(bus: &Arc<EventBus>) -> Response<GateBody> {
    let body = SseBody::subscribe(Arc::clone(bus));

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .header(CONNECTION, HeaderValue::from_static("keep-alive"))
        .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body.boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Streaming body that frames bus events as server-sent events.
///
/// Dropping the body (hyper does when the client disconnects) unsubscribes
/// from the bus.
struct SseBody {
    preamble: Option<Bytes>,
    rx: mpsc::Receiver<Event>,
    _guard: SubscriptionGuard,
}

impl SseBody {
    fn subscribe(bus: Arc<EventBus>) -> Self {
        let (id, rx) = bus.subscribe();
        Self {
            preamble: Some(Bytes::from_static(b"event: connected\ndata: connected\n\n")),
            rx,
            _guard: SubscriptionGuard { bus, id },
        }
    }
}

struct SubscriptionGuard {
    bus: Arc<EventBus>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

impl hyper::body::Body for SseBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(preamble) = this.preamble.take() {
            return Poll::Ready(Some(Ok(Frame::data(preamble))));
        }

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                let data = serde_json::to_string(&event)
                    .unwrap_or_else(|_| String::from("{}"));
                let frame = Bytes::from(format!("event: message\ndata: {}\n\n", data));
                Poll::Ready(Some(Ok(Frame::data(frame))))
            }
            // Queue closed: the bus shut down, end the stream.
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}
