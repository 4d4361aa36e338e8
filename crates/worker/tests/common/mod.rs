#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};

use tryon_comfyui::reconnect::ReconnectConfig;
use tryon_worker::config::WorkerConfig;

/// What the fake backend does with the next submitted prompt.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Run the prompt and report one output image.
    CompleteWithImage,
    /// Run the prompt and finish without outputs.
    CompleteWithoutImages,
    /// Report `execution_error` with this message.
    Fail(String),
    /// Accept the prompt and never report on it.
    Silent,
    /// Answer `/prompt` with HTTP 400.
    RejectPrompt,
    /// Never answer `/prompt`.
    Hang,
}

/// One multipart upload as the backend received it.
#[derive(Debug, Clone)]
pub struct RecordedUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
    pub overwrite: Option<String>,
}

/// Bytes served by `/view` for every artifact.
pub const OUTPUT_BYTES: &[u8] = b"\x89PNG fake output";

struct FakeState {
    uploads: Mutex<Vec<RecordedUpload>>,
    prompts: Mutex<Vec<Value>>,
    views: Mutex<Vec<String>>,
    deletes: Mutex<Vec<String>>,
    ws_clients: Mutex<Vec<String>>,
    behaviors: Mutex<VecDeque<Behavior>>,
    silent: Mutex<HashSet<String>>,
    reject_uploads: Mutex<bool>,
    hang_queue: Mutex<bool>,
    socket_outage: Mutex<bool>,
    events: broadcast::Sender<String>,
    /// Bumped to make every open socket close.
    kick: watch::Sender<u64>,
    submitted: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

/// An in-process ComfyUI look-alike on a real TCP port.
pub struct FakeBackend {
    pub addr: SocketAddr,
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let (events, _) = broadcast::channel(256);
        let (kick, _) = watch::channel(0);
        let state = Arc::new(FakeState {
            uploads: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            views: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            ws_clients: Mutex::new(Vec::new()),
            behaviors: Mutex::new(VecDeque::new()),
            silent: Mutex::new(HashSet::new()),
            reject_uploads: Mutex::new(false),
            hang_queue: Mutex::new(false),
            socket_outage: Mutex::new(false),
            events,
            kick,
            submitted: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/upload/image", post(upload_image))
            .route("/prompt", post(submit_prompt))
            .route("/queue", post(queue_delete))
            .route("/view", get(view))
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Queue behaviors for the next prompts; unlisted prompts complete
    /// with an image.
    pub fn script(&self, behaviors: impl IntoIterator<Item = Behavior>) {
        self.state.behaviors.lock().unwrap().extend(behaviors);
    }

    pub fn reject_uploads(&self) {
        *self.state.reject_uploads.lock().unwrap() = true;
    }

    /// Leave every later `/queue` request unanswered.
    pub fn hang_queue_deletes(&self) {
        *self.state.hang_queue.lock().unwrap() = true;
    }

    /// Close every open event socket from the server side.
    pub fn drop_sockets(&self) {
        self.state.kick.send_modify(|generation| *generation += 1);
    }

    /// While set, `/ws` answers 503 instead of upgrading.
    pub fn set_socket_outage(&self, down: bool) {
        *self.state.socket_outage.lock().unwrap() = down;
    }

    /// Finish a silent prompt with one output image.
    pub fn complete(&self, prompt_id: &str) {
        assert!(
            self.state.silent.lock().unwrap().remove(prompt_id),
            "{prompt_id} is not a silent prompt",
        );
        self.state.active.fetch_sub(1, Ordering::SeqCst);
        let _ = self.state.events.send(executed_image(prompt_id).to_string());
        let _ = self.state.events.send(
            json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}}).to_string(),
        );
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state.uploads.lock().unwrap().clone()
    }

    /// Full `/prompt` request bodies, in arrival order.
    pub fn prompts(&self) -> Vec<Value> {
        self.state.prompts.lock().unwrap().clone()
    }

    pub fn views(&self) -> Vec<String> {
        self.state.views.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.state.deletes.lock().unwrap().clone()
    }

    pub fn ws_clients(&self) -> Vec<String> {
        self.state.ws_clients.lock().unwrap().clone()
    }

    /// Highest number of prompts that were running at the same time.
    pub fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

/// Config pointing at `backend`, with scratch paths under `dir` and
/// short timings.
pub fn test_config(backend: &FakeBackend, dir: &Path) -> WorkerConfig {
    WorkerConfig {
        api_url: backend.api_url(),
        ws_url: format!("ws://{}", backend.addr),
        workflow_path: dir.join("workflow.json"),
        output_dir: dir.join("out"),
        job_timeout: Duration::from_secs(5),
        failure_delay: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            multiplier: 2.0,
            max_attempts: Some(3),
        },
        ..WorkerConfig::default()
    }
}

/// Write a 10x10 PNG and return its path and bytes.
pub fn write_png(dir: &Path, name: &str) -> (PathBuf, Vec<u8>) {
    let path = dir.join(name);
    image::RgbImage::from_pixel(10, 10, image::Rgb([200, 40, 90]))
        .save(&path)
        .unwrap();
    let bytes = std::fs::read(&path).unwrap();
    (path, bytes)
}

/// Editor-encoded try-on workflow with one Reroute between the person
/// loader and the scaler.
pub fn editor_workflow() -> Value {
    json!({
        "last_node_id": 4,
        "last_link_id": 3,
        "nodes": [
            {"id": 1, "type": "LoadImage", "title": "Load Human Image",
             "inputs": [], "widgets_values": ["placeholder.png", "image"]},
            {"id": 2, "type": "Reroute", "inputs": [{"name": "", "link": 1}]},
            {"id": 3, "type": "ImageScale", "inputs": [{"name": "image", "link": 2}],
             "widgets_values": ["nearest-exact", 512, 512, "disabled"]},
            {"id": 4, "type": "SaveImage", "inputs": [{"name": "images", "link": 3}],
             "widgets_values": ["tryon"]}
        ],
        "links": [
            [1, 1, 0, 2, 0, "IMAGE"],
            [2, 2, 0, 3, 0, "IMAGE"],
            [3, 3, 0, 4, 0, "IMAGE"]
        ]
    })
}

/// Poll `condition` until it holds, failing the test after 5 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn write_workflow(dir: &Path, workflow: &Value) -> PathBuf {
    let path = dir.join("workflow.json");
    std::fs::write(&path, serde_json::to_vec_pretty(workflow).unwrap()).unwrap();
    path
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn upload_image(State(state): State<Arc<FakeState>>, mut multipart: Multipart) -> Response {
    let mut upload = RecordedUpload {
        file_name: String::new(),
        content_type: None,
        bytes: Vec::new(),
        overwrite: None,
    };

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                upload.file_name = field.file_name().unwrap_or_default().to_string();
                upload.content_type = field.content_type().map(str::to_string);
                upload.bytes = field.bytes().await.unwrap().to_vec();
            }
            "overwrite" => upload.overwrite = Some(field.text().await.unwrap()),
            _ => {}
        }
    }

    let file_name = upload.file_name.clone();
    state.uploads.lock().unwrap().push(upload);

    if *state.reject_uploads.lock().unwrap() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "disk full").into_response();
    }
    Json(json!({"name": file_name, "subfolder": "", "type": "input"})).into_response()
}

async fn submit_prompt(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    state.prompts.lock().unwrap().push(body);
    let behavior = state
        .behaviors
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Behavior::CompleteWithImage);

    if matches!(behavior, Behavior::Hang) {
        std::future::pending::<()>().await;
    }
    if matches!(behavior, Behavior::RejectPrompt) {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": {"type": "prompt_outputs_failed_validation"}})),
        )
            .into_response();
    }

    let number = state.submitted.fetch_add(1, Ordering::SeqCst);
    let prompt_id = format!("prompt-{number}");

    let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_active.fetch_max(active, Ordering::SeqCst);

    if matches!(behavior, Behavior::Silent) {
        state.silent.lock().unwrap().insert(prompt_id.clone());
    } else {
        tokio::spawn(run_prompt(Arc::clone(&state), prompt_id.clone(), behavior));
    }

    Json(json!({"prompt_id": prompt_id, "number": number, "node_errors": {}})).into_response()
}

/// Emit the event sequence for one prompt.
async fn run_prompt(state: Arc<FakeState>, prompt_id: String, behavior: Behavior) {
    let emit = |value: Value| {
        let _ = state.events.send(value.to_string());
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    emit(json!({"type": "execution_start", "data": {"prompt_id": prompt_id}}));
    emit(json!({"type": "executing", "data": {"node": "3", "prompt_id": prompt_id}}));
    emit(json!({"type": "progress", "data": {"value": 1, "max": 2, "prompt_id": prompt_id}}));
    tokio::time::sleep(Duration::from_millis(20)).await;

    match behavior {
        Behavior::CompleteWithImage => {
            emit(executed_image(&prompt_id));
            state.active.fetch_sub(1, Ordering::SeqCst);
            emit(json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}}));
        }
        Behavior::CompleteWithoutImages => {
            state.active.fetch_sub(1, Ordering::SeqCst);
            emit(json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}}));
        }
        Behavior::Fail(message) => {
            state.active.fetch_sub(1, Ordering::SeqCst);
            emit(json!({"type": "execution_error", "data": {
                "prompt_id": prompt_id,
                "node_id": "3",
                "node_type": "ImageScale",
                "exception_message": message,
                "exception_type": "RuntimeError"
            }}));
        }
        Behavior::Silent | Behavior::RejectPrompt | Behavior::Hang => {}
    }
}

fn executed_image(prompt_id: &str) -> Value {
    json!({"type": "executed", "data": {
        "node": "4",
        "prompt_id": prompt_id,
        "output": {"images": [
            {"filename": format!("{prompt_id}_00001_.png"), "subfolder": "", "type": "output"}
        ]}
    }})
}

#[derive(Deserialize)]
struct QueueBody {
    #[serde(default)]
    delete: Vec<String>,
}

async fn queue_delete(State(state): State<Arc<FakeState>>, Json(body): Json<QueueBody>) -> StatusCode {
    if *state.hang_queue.lock().unwrap() {
        std::future::pending::<()>().await;
    }
    for prompt_id in body.delete {
        if state.silent.lock().unwrap().remove(&prompt_id) {
            state.active.fetch_sub(1, Ordering::SeqCst);
        }
        state.deletes.lock().unwrap().push(prompt_id);
    }
    StatusCode::OK
}

#[derive(Deserialize)]
struct ViewQuery {
    filename: String,
    #[serde(default)]
    subfolder: String,
    #[serde(rename = "type", default)]
    kind: String,
}

async fn view(State(state): State<Arc<FakeState>>, Query(query): Query<ViewQuery>) -> Response {
    if query.kind != "output" || !query.subfolder.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    state.views.lock().unwrap().push(query.filename);
    ([("content-type", "image/png")], OUTPUT_BYTES).into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<FakeState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    if *state.socket_outage.lock().unwrap() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    state.ws_clients.lock().unwrap().push(query.client_id.clone());
    // Subscribe before the handshake completes so no event is missed.
    let rx = state.events.subscribe();
    let kick = state.kick.subscribe();
    ws.on_upgrade(move |socket| forward_events(socket, query.client_id, rx, kick))
}

async fn forward_events(
    socket: WebSocket,
    client_id: String,
    mut rx: broadcast::Receiver<String>,
    mut kick: watch::Receiver<u64>,
) {
    let (mut sink, mut stream) = socket.split();

    let status = json!({"type": "status", "data": {
        "status": {"exec_info": {"queue_remaining": 0}},
        "sid": client_id
    }});
    if sink.send(Message::Text(status.to_string().into())).await.is_err() {
        return;
    }
    // Something the client must ignore.
    if sink.send(Message::Text(String::from("{not json").into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            _ = kick.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
