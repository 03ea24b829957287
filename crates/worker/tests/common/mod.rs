#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use spark_core::config::Capacity;
use spark_core::identity::Identity;
use spark_core::job::JobHandle;
use spark_core::protocol::{self, Message};
use spark_core::types::JobId;
use spark_link::reconnect::ReconnectConfig;
use spark_link::{Endpoint, Link, LinkConfig, MemoryConnector, MemoryListener, MemoryPeer};
use spark_worker::engine::{Engine, EngineConfig, EngineState, ShutdownReport};
use spark_worker::executor::{ExecutionError, Executor};
use spark_worker::pool::Pool;

/// Upper bound on any single wait in these tests.
pub const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executes payloads as tiny scripts:
///
/// - `ok:<output>` succeeds with `<output>`
/// - `fail:<message>` fails with `<message>`
/// - `panic` panics
/// - `hold` waits for [`ScriptExecutor::release`], then outputs `released`
/// - `forever` never finishes
#[derive(Default)]
pub struct ScriptExecutor {
    gates: Mutex<HashMap<JobId, Arc<Notify>>>,
}

impl ScriptExecutor {
    fn gate(&self, job_id: &JobId) -> Arc<Notify> {
        let mut gates = self.gates.lock().unwrap();
        Arc::clone(gates.entry(job_id.clone()).or_default())
    }

    /// Let a `hold` job finish. May be called before the job starts.
    pub fn release(&self, job_id: &str) {
        self.gate(&JobId::from(job_id)).notify_one();
    }
}

#[async_trait]
impl Executor for ScriptExecutor {
    async fn execute(&self, job: &JobHandle) -> Result<Vec<u8>, ExecutionError> {
        let script = String::from_utf8_lossy(&job.payload).into_owned();
        if let Some(output) = script.strip_prefix("ok:") {
            return Ok(output.as_bytes().to_vec());
        }
        if let Some(message) = script.strip_prefix("fail:") {
            return Err(ExecutionError::Failed(message.to_string()));
        }
        match script.as_str() {
            "panic" => panic!("script asked for a panic"),
            "hold" => {
                self.gate(&job.job_id).notified().await;
                Ok(b"released".to_vec())
            }
            "forever" => std::future::pending().await,
            other => Err(ExecutionError::Failed(format!("unknown script {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// The dispatcher side of the in-memory link.
pub struct Dispatcher {
    listener: MemoryListener,
    peer: Option<MemoryPeer>,
}

impl Dispatcher {
    /// Wait for the node to connect; replaces any previous connection.
    pub async fn accept(&mut self) {
        let peer = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("node connects in time")
            .expect("connector alive");
        self.peer = Some(peer);
    }

    /// Drop the current connection.
    pub fn hang_up(&mut self) {
        self.peer = None;
    }

    pub fn set_refusing(&self, refusing: bool) {
        self.listener.set_refusing(refusing);
    }

    /// Stop (or resume) reading what the node writes.
    pub fn stall(&mut self, stalled: bool) {
        self.peer().set_stalled(stalled);
    }

    fn peer(&mut self) -> &mut MemoryPeer {
        self.peer.as_mut().expect("dispatcher is connected")
    }

    pub fn send(&mut self, message: Message) {
        let frame = protocol::encode(&message).unwrap();
        self.peer().send(frame).unwrap();
    }

    pub fn send_raw(&mut self, frame: &str) {
        self.peer().send(frame).unwrap();
    }

    /// Next frame from the node, or `None` once it closed the connection.
    pub async fn recv(&mut self) -> Option<Message> {
        let frame = tokio::time::timeout(WAIT, self.peer().recv())
            .await
            .expect("node frame in time")?;
        Some(protocol::decode(&frame).expect("node sends valid frames"))
    }

    /// Next message that is not a heartbeat.
    pub async fn expect(&mut self) -> Message {
        loop {
            match self.recv().await {
                Some(Message::Heartbeat { .. }) => continue,
                Some(message) => return message,
                None => panic!("node closed the connection"),
            }
        }
    }

    /// Wait until the node closes the connection, skipping heartbeats.
    pub async fn expect_closed(&mut self) {
        loop {
            match self.recv().await {
                Some(Message::Heartbeat { .. }) => continue,
                Some(other) => panic!("expected close, got {other:?}"),
                None => return,
            }
        }
    }

    pub fn assign(&mut self, job_id: &str, script: &str) {
        self.send(Message::JobAssign {
            job_id: JobId::from(job_id),
            payload: script.as_bytes().to_vec(),
        });
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub executor: Arc<ScriptExecutor>,
    pub state: watch::Receiver<EngineState>,
    pub cancel: CancellationToken,
    pub engine: JoinHandle<ShutdownReport>,
}

pub fn identity() -> Identity {
    Identity {
        machine_id: "0f3c9a".to_string(),
        machine_name: "spark-test".to_string(),
    }
}

pub fn engine_config(max_jobs: u32) -> EngineConfig {
    EngineConfig {
        identity: identity(),
        capacity: Capacity::new(max_jobs).unwrap(),
        heartbeat_interval: Duration::from_secs(60),
        max_missed_heartbeats: 3,
        handshake_timeout: Duration::from_secs(5),
        delivery_timeout: Duration::from_secs(1),
        drain_timeout: Duration::from_secs(5),
    }
}

pub fn link_config() -> LinkConfig {
    LinkConfig {
        connect_timeout: Duration::from_secs(1),
        outbound_capacity: 64,
        reconnect: ReconnectConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
        },
    }
}

/// Start an engine over the in-memory transport.
pub fn spawn(config: EngineConfig) -> Harness {
    spawn_with(config, link_config())
}

pub fn spawn_with(config: EngineConfig, link_config: LinkConfig) -> Harness {
    let (connector, listener) = MemoryConnector::pair();
    let endpoint = Endpoint::parse("ws://lighthouse.test:5570").unwrap();
    let link = Link::start(Arc::new(connector), endpoint, link_config);

    let executor = Arc::new(ScriptExecutor::default());
    let pool = Pool::new(config.capacity.max_jobs() as usize, executor.clone());
    let cancel = CancellationToken::new();

    let engine = Engine::new(config, link, pool, cancel.clone());
    let state = engine.state();

    Harness {
        dispatcher: Dispatcher {
            listener,
            peer: None,
        },
        executor,
        state,
        cancel,
        engine: tokio::spawn(engine.run()),
    }
}

impl Harness {
    pub async fn wait_for(&mut self, target: EngineState) {
        tokio::time::timeout(WAIT, self.state.wait_for(|s| *s == target))
            .await
            .unwrap_or_else(|_| panic!("engine never reached {target}"))
            .expect("engine alive");
    }

    /// Accept the connection, answer `Hello` and wait for `Registered`.
    pub async fn register(&mut self) {
        self.dispatcher.accept().await;
        let hello = self.dispatcher.expect().await;
        assert!(matches!(hello, Message::Hello { .. }), "got {hello:?}");
        self.dispatcher.send(Message::Welcome);
        self.wait_for(EngineState::Registered).await;
    }

    pub async fn finish(self) -> ShutdownReport {
        tokio::time::timeout(WAIT, self.engine)
            .await
            .expect("engine stops in time")
            .expect("engine task did not panic")
    }
}
