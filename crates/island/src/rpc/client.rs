// crates/island/src/rpc/client.rs
//! RPC client for one `pi --mode rpc` child process.
//!
//! A single reader task decodes stdout frames in order. Responses are routed
//! to whoever is waiting for them; everything else goes to the event channel
//! as a [`ClientEvent`]. Every outbound command carries a fresh `id`, and a
//! response without a known id falls back to the oldest waiter for the same
//! command name.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::StreamExt;
use pi_island_core::{ClientEvent, InboundFrame, JsonLinesCodec, RpcCommand, RpcRequest, RpcResponse};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Encoder, FramedRead};
use tracing::{debug, info, warn};

use super::error::RpcError;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for the child to exit after being killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

type AgentWriter = Box<dyn AsyncWrite + Send + Unpin>;
type AgentReader = Box<dyn AsyncRead + Send + Unpin>;
pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

/// Program, arguments and working directory of the agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Default)]
struct PendingRequests {
    waiting: HashMap<String, (&'static str, oneshot::Sender<RpcResponse>)>,
    by_command: HashMap<&'static str, VecDeque<String>>,
    /// Fire-and-forget ids whose responses go to the event channel.
    detached: HashSet<String>,
}

impl PendingRequests {
    fn register(&mut self, id: &str, command: &'static str) -> oneshot::Receiver<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(id.to_string(), (command, tx));
        self.by_command
            .entry(command)
            .or_default()
            .push_back(id.to_string());
        rx
    }

    fn detach(&mut self, id: &str) {
        self.detached.insert(id.to_string());
    }

    fn forget(&mut self, id: &str) {
        self.detached.remove(id);
        if let Some((command, _)) = self.waiting.remove(id) {
            self.unqueue(command, id);
        }
    }

    fn unqueue(&mut self, command: &str, id: &str) {
        if let Some(queue) = self.by_command.get_mut(command) {
            queue.retain(|queued| queued != id);
        }
    }

    /// Hand `resp` to its waiter. Gives it back when nobody is waiting.
    fn resolve(&mut self, resp: RpcResponse) -> Option<RpcResponse> {
        if let Some(id) = resp.id.clone() {
            if self.detached.remove(&id) {
                return Some(resp);
            }
            if let Some((command, tx)) = self.waiting.remove(&id) {
                self.unqueue(command, &id);
                let _ = tx.send(resp);
                return None;
            }
        }

        let oldest = self
            .by_command
            .get_mut(resp.command.as_str())
            .and_then(VecDeque::pop_front);
        match oldest.and_then(|id| self.waiting.remove(&id)) {
            Some((_, tx)) => {
                let _ = tx.send(resp);
                None
            }
            None => Some(resp),
        }
    }

    fn len(&self) -> usize {
        self.waiting.len()
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RpcClient {
    writer: Mutex<AgentWriter>,
    pending: Arc<StdMutex<PendingRequests>>,
    next_id: AtomicU64,
    running: Arc<AtomicBool>,
    response_timeout: Duration,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    child: Arc<Mutex<Option<Child>>>,
}

impl RpcClient {
    /// Spawn the agent and start reading its stdout.
    ///
    /// # Errors
    /// Returns `RpcError::Spawn` if the process cannot be started; nothing
    /// is left running in that case.
    pub fn spawn(
        command: &AgentCommand,
        events: EventSender,
        response_timeout: Duration,
    ) -> Result<Self, RpcError> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::spawn(&command.program, e))?;
        let missing = |what: &str| {
            RpcError::spawn(
                &command.program,
                std::io::Error::new(std::io::ErrorKind::BrokenPipe, format!("{what} not piped")),
            )
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take();

        info!(
            program = %command.program.display(),
            args = ?command.args,
            cwd = ?command.cwd,
            pid = ?child.id(),
            "agent process started"
        );

        let client = Self::start(
            Box::new(stdout),
            Box::new(stdin),
            Some(child),
            events,
            response_timeout,
        );
        if let Some(stderr) = stderr {
            lock(&client.tasks).push(tokio::spawn(drain_stderr(stderr)));
        }
        Ok(client)
    }

    /// Run the protocol over arbitrary pipes instead of a child process.
    pub fn connect_with_io<R, W>(
        reader: R,
        writer: W,
        events: EventSender,
        response_timeout: Duration,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(
            Box::new(reader),
            Box::new(writer),
            None,
            events,
            response_timeout,
        )
    }

    fn start(
        reader: AgentReader,
        writer: AgentWriter,
        child: Option<Child>,
        events: EventSender,
        response_timeout: Duration,
    ) -> Self {
        let pending = Arc::new(StdMutex::new(PendingRequests::default()));
        let running = Arc::new(AtomicBool::new(true));
        let child = Arc::new(Mutex::new(child));

        let reader_task = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            events,
            running.clone(),
            child.clone(),
        ));

        Self {
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            running,
            response_timeout,
            tasks: StdMutex::new(vec![reader_task]),
            child,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests currently awaiting a response.
    pub fn pending_requests(&self) -> usize {
        lock(&self.pending).len()
    }

    fn next_request_id(&self) -> String {
        format!("req-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Write a command without waiting for its response. A failure response
    /// still arrives later as `ClientEvent::Response`.
    pub async fn send(&self, command: RpcCommand) -> Result<(), RpcError> {
        let id = self.next_request_id();
        lock(&self.pending).detach(&id);
        let result = self.write(&id, command).await;
        if result.is_err() {
            lock(&self.pending).forget(&id);
        }
        result
    }

    /// Send a command and wait for its response, bounded by the response
    /// timeout. Returns the response's `data` on success.
    pub async fn request(&self, command: RpcCommand) -> Result<Option<Value>, RpcError> {
        let name = command.name();
        let id = self.next_request_id();
        let rx = lock(&self.pending).register(&id, name);

        if let Err(e) = self.write(&id, command).await {
            lock(&self.pending).forget(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.response_timeout, rx).await {
            Ok(Ok(resp)) => resp.into_result().map_err(|message| RpcError::CommandFailed {
                command: name.to_string(),
                message,
            }),
            Ok(Err(_)) => Err(RpcError::Closed {
                command: name.to_string(),
            }),
            Err(_) => {
                lock(&self.pending).forget(&id);
                warn!(command = name, id = %id, "agent response timed out");
                Err(RpcError::Timeout {
                    command: name.to_string(),
                    after: self.response_timeout,
                })
            }
        }
    }

    async fn write(&self, id: &str, command: RpcCommand) -> Result<(), RpcError> {
        if !self.is_running() {
            return Err(RpcError::NotRunning);
        }
        let name = command.name();
        let request = RpcRequest {
            id: Some(id.to_string()),
            command,
        };
        let mut buf = BytesMut::new();
        JsonLinesCodec::new()
            .encode(&request, &mut buf)
            .map_err(|source| RpcError::Encode {
                command: name,
                source,
            })?;

        let mut writer = self.writer.lock().await;
        writer.write_all(&buf).await.map_err(RpcError::Write)?;
        writer.flush().await.map_err(RpcError::Write)?;
        debug!(command = name, id, "command sent");
        Ok(())
    }

    /// Stop reading, then terminate the child. Requests still waiting are
    /// left to time out.
    pub async fn stop(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.running.store(false, Ordering::SeqCst);

        let child = self.child.lock().await.take();
        let Some(mut child) = child else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!(error = %e, "agent already gone");
        }
        match tokio::time::timeout(KILL_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(exit_code = ?status.code(), "agent stopped"),
            Ok(Err(e)) => warn!(error = %e, "failed to reap agent process"),
            Err(_) => warn!("agent did not exit after kill"),
        }
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

async fn read_loop(
    reader: AgentReader,
    pending: Arc<StdMutex<PendingRequests>>,
    events: EventSender,
    running: Arc<AtomicBool>,
    child: Arc<Mutex<Option<Child>>>,
) {
    let mut frames = FramedRead::new(reader, JsonLinesCodec::new());
    while let Some(frame) = frames.next().await {
        let value = match frame {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "agent stdout read failed");
                break;
            }
        };
        let event = match InboundFrame::classify(value) {
            InboundFrame::Response(resp) => match lock(&pending).resolve(resp) {
                Some(unclaimed) => ClientEvent::Response(unclaimed),
                None => continue,
            },
            InboundFrame::Event(event) => ClientEvent::Rpc(event),
            InboundFrame::Unrecognized { kind, raw } => ClientEvent::Unrecognized { kind, raw },
        };
        if events.send(event).is_err() {
            debug!("event receiver dropped; still routing responses");
        }
    }

    running.store(false, Ordering::SeqCst);
    let exited = child.lock().await.take();
    let code = match exited {
        Some(mut child) => match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!(error = %e, "failed to reap agent process");
                None
            }
        },
        None => None,
    };
    info!(exit_code = ?code, "agent process exited");
    let _ = events.send(ClientEvent::Exited { code });
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(target: "agent_stderr", "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(target: "agent_stderr", error = %e, "stderr read failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pi_island_core::RpcEvent;
    use serde_json::json;
    use tokio::io::{duplex, DuplexStream, Lines};

    struct FakeAgent {
        requests: Lines<BufReader<DuplexStream>>,
        out: DuplexStream,
    }

    impl FakeAgent {
        async fn next_request(&mut self) -> Value {
            let line = self.requests.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn emit(&mut self, value: Value) {
            self.out
                .write_all(format!("{value}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn emit_raw(&mut self, raw: &str) {
            self.out.write_all(raw.as_bytes()).await.unwrap();
        }
    }

    fn connect(timeout: Duration) -> (Arc<RpcClient>, FakeAgent, mpsc::UnboundedReceiver<ClientEvent>) {
        let (client_out, agent_in) = duplex(64 * 1024);
        let (agent_out, client_in) = duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = RpcClient::connect_with_io(client_in, client_out, tx, timeout);
        let agent = FakeAgent {
            requests: BufReader::new(agent_in).lines(),
            out: agent_out,
        };
        (Arc::new(client), agent, rx)
    }

    fn ok(command: &str, id: Option<&Value>, data: Value) -> Value {
        let mut resp = json!({"type": "response", "command": command, "success": true, "data": data});
        if let Some(id) = id {
            resp["id"] = id.clone();
        }
        resp
    }

    #[tokio::test]
    async fn test_request_correlated_by_id() {
        let (client, mut agent, _rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        let c = client.clone();
        let call = tokio::spawn(async move { c.request(RpcCommand::GetState).await });

        let req = agent.next_request().await;
        assert_eq!(req["type"], "get_state");
        assert!(req["id"].as_str().unwrap().starts_with("req-"));
        agent
            .emit(ok("get_state", Some(&req["id"]), json!({"isStreaming": false})))
            .await;

        let data = call.await.unwrap().unwrap();
        assert_eq!(data, Some(json!({"isStreaming": false})));
        assert_eq!(client.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_same_command_concurrent_requests_do_not_cross() {
        let (client, mut agent, _rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        let c1 = client.clone();
        let first = tokio::spawn(async move { c1.request(RpcCommand::GetState).await });
        let req1 = agent.next_request().await;
        let c2 = client.clone();
        let second = tokio::spawn(async move { c2.request(RpcCommand::GetState).await });
        let req2 = agent.next_request().await;

        // Answered in reverse order.
        agent.emit(ok("get_state", Some(&req2["id"]), json!({"n": 2}))).await;
        agent.emit(ok("get_state", Some(&req1["id"]), json!({"n": 1}))).await;

        assert_eq!(first.await.unwrap().unwrap(), Some(json!({"n": 1})));
        assert_eq!(second.await.unwrap().unwrap(), Some(json!({"n": 2})));
    }

    #[tokio::test]
    async fn test_responses_without_id_fall_back_to_command_name() {
        let (client, mut agent, _rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        let c1 = client.clone();
        let state = tokio::spawn(async move { c1.request(RpcCommand::GetState).await });
        agent.next_request().await;
        let c2 = client.clone();
        let models = tokio::spawn(async move { c2.request(RpcCommand::GetAvailableModels).await });
        agent.next_request().await;

        agent
            .emit(ok("get_available_models", None, json!({"models": []})))
            .await;
        agent.emit(ok("get_state", None, json!({"isStreaming": true}))).await;

        assert_eq!(
            models.await.unwrap().unwrap(),
            Some(json!({"models": []}))
        );
        assert_eq!(
            state.await.unwrap().unwrap(),
            Some(json!({"isStreaming": true}))
        );
    }

    #[tokio::test]
    async fn test_timeout_then_late_response_is_uncorrelated() {
        let (client, mut agent, mut rx) = connect(Duration::from_millis(50));
        let err = {
            let c = client.clone();
            let call = tokio::spawn(async move { c.request(RpcCommand::GetMessages).await });
            agent.next_request().await;
            call.await.unwrap().unwrap_err()
        };
        assert!(err.is_timeout());
        assert_eq!(client.pending_requests(), 0);
        assert!(client.is_running());

        agent.emit(ok("get_messages", None, json!({"messages": []}))).await;
        match rx.recv().await.unwrap() {
            ClientEvent::Response(resp) => assert_eq!(resp.command, "get_messages"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_request_is_command_failed() {
        let (client, mut agent, _rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        let c = client.clone();
        let call = tokio::spawn(async move {
            c.request(RpcCommand::SetModel {
                provider: "nope".into(),
                model_id: "x".into(),
            })
            .await
        });
        let req = agent.next_request().await;
        assert_eq!(req["modelId"], "x");
        agent
            .emit(json!({"type": "response", "command": "set_model", "success": false,
                "error": "Model not found: nope/x", "id": req["id"]}))
            .await;
        match call.await.unwrap() {
            Err(RpcError::CommandFailed { command, message }) => {
                assert_eq!(command, "set_model");
                assert_eq!(message, "Model not found: nope/x");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget_failure_reaches_events() {
        let (client, mut agent, mut rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        client.send(RpcCommand::prompt("hello")).await.unwrap();
        let req = agent.next_request().await;
        assert_eq!(req, json!({"id": req["id"].clone(), "type": "prompt", "message": "hello"}));
        agent
            .emit(json!({"type": "response", "command": "prompt", "success": false,
                "error": "No API key", "id": req["id"]}))
            .await;
        match rx.recv().await.unwrap() {
            ClientEvent::Response(resp) => {
                assert!(!resp.success);
                assert_eq!(resp.error.as_deref(), Some("No API key"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_push_events_in_order_with_bad_frame_skipped() {
        let (_client, mut agent, mut rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        agent.emit_raw("{\"type\":\"agent_start\"}\n{broken\n{\"type\":\"turn_sta").await;
        agent.emit_raw("rt\"}\n{\"type\":\"agent_end\",\"messages\":[]}\n").await;

        assert_eq!(rx.recv().await.unwrap(), ClientEvent::Rpc(RpcEvent::AgentStart));
        assert!(matches!(
            rx.recv().await.unwrap(),
            ClientEvent::Unrecognized { ref kind, .. } if kind == "turn_start"
        ));
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::Rpc(RpcEvent::AgentEnd { messages: vec![] })
        );
    }

    #[tokio::test]
    async fn test_eof_emits_exit_and_stops_client() {
        let (client, agent, mut rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        drop(agent);
        assert_eq!(rx.recv().await.unwrap(), ClientEvent::Exited { code: None });
        assert!(!client.is_running());
        assert!(matches!(
            client.send(RpcCommand::Abort).await,
            Err(RpcError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_stop_unregisters_reader_first() {
        let (client, mut agent, mut rx) = connect(DEFAULT_RESPONSE_TIMEOUT);
        client.stop().await;
        assert!(!client.is_running());
        // The read half may already be gone, so the write itself can fail.
        let _ = agent.out.write_all(b"{\"type\":\"agent_start\"}\n").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let cmd = AgentCommand {
            program: PathBuf::from("/nonexistent/pi-agent-binary"),
            args: vec!["--mode".into(), "rpc".into()],
            cwd: None,
        };
        let err = RpcClient::spawn(&cmd, tx, DEFAULT_RESPONSE_TIMEOUT)
            .err()
            .unwrap();
        assert!(matches!(err, RpcError::Spawn { .. }));
    }
}
