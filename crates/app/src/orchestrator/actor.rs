use std::{collections::VecDeque, future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::{Interval, MissedTickBehavior},
};
use tracing::{debug, error, info, instrument, warn};

use super::machine::{Effect, Machine, RunContext, RunEvent, RunState, TestTrigger};
use crate::config::TestRunConfig;
use crate::credentials::{Credentials, Session};
use crate::editor::EditorBridge;
use crate::error::TestRunError;
use crate::graphql::{RemoteQueryExecutor, operations};
use crate::notify::{self, MessageLevel};
use crate::persistence::now_rfc3339;
use crate::server::CallbackServer;

pub const SERVER_URL_HEADER: &str = "X-Prismatic-Server-URL";
pub const TOKEN_HEADER: &str = "X-Prismatic-Token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTimings {
    pub grace_period: Duration,
    pub poll_interval: Option<Duration>,
}

impl From<&TestRunConfig> for RunTimings {
    fn from(config: &TestRunConfig) -> Self {
        Self {
            grace_period: Duration::from_secs(config.grace_period_secs),
            poll_interval: config
                .poll_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSnapshot {
    pub state: RunState,
    pub context: RunContext,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunNotice {
    Started { integration_id: String },
    ConfigurationRequired { integration_id: String },
    ExecutionStarted { execution_id: String },
    Failed { message: String },
    ResultsSynced { execution_id: String, step_names: Vec<String> },
    ResultsSyncFailed { execution_id: String, error: String },
}

/// Why a result sync stopped waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
    GracePeriod,
    CompletionSignal,
    RemoteEnded,
}

#[derive(Clone)]
pub struct TestRunDeps {
    pub executor: Arc<dyn RemoteQueryExecutor>,
    pub server: Arc<CallbackServer>,
    pub editor: Arc<dyn EditorBridge>,
    pub timings: RunTimings,
}

/// Handle to the test-run actor. Triggers are queued and handled one run at a time.
#[derive(Clone)]
pub struct TestRunOrchestrator {
    triggers: mpsc::UnboundedSender<TestTrigger>,
    snapshots: watch::Receiver<RunSnapshot>,
    notices: broadcast::Sender<RunNotice>,
}

impl TestRunOrchestrator {
    pub fn spawn(deps: TestRunDeps) -> Self {
        let (triggers, rx) = mpsc::unbounded_channel();
        let machine = Machine::new();
        let (snapshot_tx, snapshots) = watch::channel(snapshot_of(&machine));
        let (notices, _) = broadcast::channel(64);
        let actor = Actor {
            deps,
            machine,
            snapshots: snapshot_tx,
            notices: notices.clone(),
            completions: None,
            started: 0,
            types: Arc::new(TypesGate::default()),
        };
        tokio::spawn(actor.run(rx));
        Self {
            triggers,
            snapshots,
            notices,
        }
    }

    /// Queues a test run. Missing credentials are rejected here, before any
    /// state changes or network calls.
    pub fn test_integration(
        &self,
        integration_id: &str,
        flow_id: Option<&str>,
        credentials: &Credentials,
    ) -> Result<(), TestRunError> {
        if integration_id.trim().is_empty() {
            return Err(TestRunError::Configuration(
                "no integration selected".into(),
            ));
        }
        let session = Session::new(
            credentials.access_token.clone(),
            Some(credentials.service_url.clone()),
        )
        .map_err(|err| TestRunError::Configuration(err.to_string()))?;
        self.triggers
            .send(TestTrigger {
                integration_id: integration_id.to_owned(),
                flow_id: flow_id.filter(|id| !id.is_empty()).map(str::to_owned),
                session,
            })
            .map_err(|_| TestRunError::Closed)
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshots.clone()
    }

    pub fn notices(&self) -> broadcast::Receiver<RunNotice> {
        self.notices.subscribe()
    }
}

fn snapshot_of(machine: &Machine) -> RunSnapshot {
    RunSnapshot {
        state: machine.state(),
        context: machine.context().clone(),
    }
}

struct Actor {
    deps: TestRunDeps,
    machine: Machine,
    snapshots: watch::Sender<RunSnapshot>,
    notices: broadcast::Sender<RunNotice>,
    // Subscribed before the test mutation so an early completion is not missed.
    completions: Option<broadcast::Receiver<String>>,
    started: u64,
    types: Arc<TypesGate>,
}

/// Orders `types.ts` rewrites by execution start. A sync for an older
/// execution never replaces types written for a newer one.
#[derive(Default)]
struct TypesGate {
    written: Mutex<u64>,
}

impl TypesGate {
    /// Runs `write` unless a later execution already wrote the types file.
    /// Returns whether it ran.
    fn write_if_newest(
        &self,
        sequence: u64,
        write: impl FnOnce() -> anyhow::Result<()>,
    ) -> anyhow::Result<bool> {
        let mut written = self.written.lock();
        if sequence <= *written {
            return Ok(false);
        }
        write()?;
        *written = sequence;
        Ok(true)
    }
}

impl Actor {
    async fn run(mut self, mut triggers: mpsc::UnboundedReceiver<TestTrigger>) {
        while let Some(trigger) = triggers.recv().await {
            let integration_id = trigger.integration_id.clone();
            info!(%integration_id, "test run requested");
            self.notice(RunNotice::Started { integration_id });

            let mut pending: VecDeque<Effect> =
                self.apply(RunEvent::TestIntegration(trigger)).into();
            while let Some(effect) = pending.pop_front() {
                if let Some(event) = self.perform(effect).await {
                    pending.extend(self.apply(event));
                }
            }
            self.completions = None;
        }
        debug!("test run actor stopped");
    }

    fn apply(&mut self, event: RunEvent) -> Vec<Effect> {
        let effects = self.machine.send(event);
        for state in self.machine.last_path() {
            debug!(?state, "test run transition");
        }
        self.snapshots.send_replace(snapshot_of(&self.machine));
        effects
    }

    fn notice(&self, notice: RunNotice) {
        let _ = self.notices.send(notice);
    }

    async fn perform(&mut self, effect: Effect) -> Option<RunEvent> {
        match effect {
            Effect::LoadIntegration {
                integration_id,
                session,
            } => Some(self.load_integration(&integration_id, &session).await),
            Effect::OpenConfiguration {
                integration_id,
                system_instance_id,
            } => {
                self.notice(RunNotice::ConfigurationRequired {
                    integration_id: integration_id.clone(),
                });
                if let Err(err) = self
                    .deps
                    .editor
                    .open_configuration(&integration_id, system_instance_id.as_deref())
                    .await
                {
                    warn!(%integration_id, ?err, "failed to open instance configuration");
                }
                None
            }
            Effect::ResolveCallback => {
                let server = &self.deps.server;
                let callback_url = if server.is_server_running() {
                    server.public_url()
                } else {
                    warn!("callback server is not running; step results will not be collected");
                    None
                };
                Some(RunEvent::CallbackResolved { callback_url })
            }
            Effect::RunFlowTest {
                integration_id,
                flow_id,
                session,
                callback_url,
            } => Some(
                self.run_flow_test(&integration_id, &flow_id, &session, callback_url)
                    .await,
            ),
            Effect::SyncResults {
                execution_id,
                session,
            } => {
                self.notice(RunNotice::ExecutionStarted {
                    execution_id: execution_id.clone(),
                });
                let completions = self
                    .completions
                    .take()
                    .unwrap_or_else(|| self.deps.server.subscribe_completions());
                self.started += 1;
                tokio::spawn(sync_results(
                    self.deps.clone(),
                    self.notices.clone(),
                    SyncJob {
                        execution_id,
                        session,
                        sequence: self.started,
                        types: self.types.clone(),
                    },
                    completions,
                ));
                None
            }
            Effect::Notify { level, message } => {
                if level == MessageLevel::Error {
                    self.notice(RunNotice::Failed {
                        message: message.clone(),
                    });
                }
                notify::report(self.deps.editor.as_ref(), level, &message, true);
                None
            }
        }
    }

    #[instrument(skip(self, session))]
    async fn load_integration(&self, integration_id: &str, session: &Session) -> RunEvent {
        let loaded = self
            .deps
            .executor
            .execute(session, operations::get_integration(integration_id))
            .await
            .and_then(|data| operations::parse_integration(&data));
        match loaded {
            Ok(summary) => {
                info!(
                    name = ?summary.name,
                    config_state = ?summary.config_state,
                    "integration loaded"
                );
                RunEvent::IntegrationLoaded {
                    config_state: summary.config_state,
                    system_instance_id: summary.system_instance_id,
                    initial_flow_id: summary.initial_flow.map(|flow| flow.id),
                }
            }
            Err(err) => RunEvent::IntegrationFailed {
                error: err.to_string(),
            },
        }
    }

    #[instrument(skip(self, session, callback_url))]
    async fn run_flow_test(
        &mut self,
        integration_id: &str,
        flow_id: &str,
        session: &Session,
        callback_url: Option<String>,
    ) -> RunEvent {
        let headers = match (&callback_url, self.deps.server.auth_token()) {
            (Some(url), Some(token)) => Some(callback_headers(url, &token)),
            _ => None,
        };
        self.completions = Some(self.deps.server.subscribe_completions());

        let started = self
            .deps
            .executor
            .execute(
                session,
                operations::test_integration_flow(flow_id, headers.as_ref()),
            )
            .await
            .and_then(|data| operations::parse_execution_id(&data));
        match started {
            Ok(execution_id) => {
                info!(%execution_id, "integration test started");
                let metadata = json!({
                    "executionId": execution_id,
                    "integrationId": integration_id,
                    "flowId": flow_id,
                    "callbackUrl": callback_url,
                    "startedAt": now_rfc3339(),
                });
                if let Err(err) = self
                    .deps
                    .server
                    .persistence()
                    .write_execution_metadata(&execution_id, &metadata)
                {
                    warn!(%execution_id, ?err, "failed to write execution metadata");
                }
                RunEvent::TestStarted { execution_id }
            }
            Err(err) => RunEvent::TestFailed {
                error: err.to_string(),
            },
        }
    }
}

struct SyncJob {
    execution_id: String,
    session: Session,
    sequence: u64,
    types: Arc<TypesGate>,
}

async fn sync_results(
    deps: TestRunDeps,
    notices: broadcast::Sender<RunNotice>,
    job: SyncJob,
    completions: broadcast::Receiver<String>,
) {
    let SyncJob {
        execution_id,
        session,
        sequence,
        types,
    } = job;
    let trigger = wait_for_results(&deps, &execution_id, &session, completions).await;
    info!(%execution_id, ?trigger, "syncing step results");

    let persistence = deps.server.persistence();
    let synced = persistence.list_step_names(&execution_id).and_then(|names| {
        if names.is_empty() {
            return Ok(names);
        }
        let written = types.write_if_newest(sequence, || {
            persistence.update_types_file(&execution_id, &names).map(|_| ())
        })?;
        if !written {
            info!(%execution_id, "newer execution already owns the types file");
        }
        Ok(names)
    });
    let notice = match synced {
        Ok(step_names) => {
            if step_names.is_empty() {
                info!(%execution_id, "no step results received");
            }
            RunNotice::ResultsSynced {
                execution_id,
                step_names,
            }
        }
        Err(err) => {
            error!(%execution_id, ?err, "failed to sync step results");
            RunNotice::ResultsSyncFailed {
                execution_id,
                error: format!("{err:#}"),
            }
        }
    };
    let _ = notices.send(notice);
}

/// Resolves on whichever comes first: the grace period, a `/complete` callback
/// for this execution, or the remote status reporting an end time.
async fn wait_for_results(
    deps: &TestRunDeps,
    execution_id: &str,
    session: &Session,
    mut completions: broadcast::Receiver<String>,
) -> SyncTrigger {
    let grace = tokio::time::sleep(deps.timings.grace_period);
    tokio::pin!(grace);
    let mut poll = deps.timings.poll_interval.map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut signals_open = true;

    loop {
        tokio::select! {
            _ = &mut grace => return SyncTrigger::GracePeriod,
            received = completions.recv(), if signals_open => match received {
                Ok(id) if id == execution_id => return SyncTrigger::CompletionSignal,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => signals_open = false,
            },
            _ = next_tick(&mut poll) => {
                match deps
                    .executor
                    .execute(session, operations::get_execution_status(execution_id))
                    .await
                {
                    Ok(data) if operations::execution_ended(&data) => return SyncTrigger::RemoteEnded,
                    Ok(_) => {}
                    Err(err) => debug!(%execution_id, %err, "execution status poll failed"),
                }
            }
        }
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

/// Headers the remote flow uses to post step results back to this machine.
pub fn callback_headers(callback_url: &str, token: &str) -> Value {
    json!({
        SERVER_URL_HEADER: callback_url,
        TOKEN_HEADER: token,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(gate: &TypesGate, sequence: u64, order: &mut Vec<u64>) -> bool {
        gate.write_if_newest(sequence, || {
            order.push(sequence);
            Ok(())
        })
        .unwrap()
    }

    #[test]
    fn older_execution_never_replaces_newer_types() {
        let gate = TypesGate::default();
        let mut order = Vec::new();

        assert!(record(&gate, 2, &mut order));
        assert!(!record(&gate, 1, &mut order));
        assert!(record(&gate, 3, &mut order));
        assert_eq!(order, vec![2, 3]);
    }

    #[test]
    fn failed_write_does_not_advance() {
        let gate = TypesGate::default();
        assert!(gate.write_if_newest(1, || Err(anyhow::anyhow!("disk full"))).is_err());
        assert!(gate.write_if_newest(1, || Ok(())).unwrap());
    }
}
