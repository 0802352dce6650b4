//! Pure test-run state machine. `Machine::send` applies one event and returns the
//! effects the caller has to perform; nothing here does I/O.

use serde::Serialize;
use tracing::debug;

use crate::credentials::Session;
use crate::graphql::operations::FULLY_CONFIGURED;
use crate::notify::MessageLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    WaitingForTest,
    LoadingIntegration,
    CheckingConfiguration,
    ConfiguringInstance,
    ExecutingTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StateTag {
    Idle,
    Testing,
}

impl RunState {
    pub fn tag(self) -> StateTag {
        match self {
            RunState::WaitingForTest => StateTag::Idle,
            _ => StateTag::Testing,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunContext {
    pub integration_id: Option<String>,
    pub flow_id: Option<String>,
    pub access_token: Option<String>,
    pub service_url: Option<String>,
    pub config_state: Option<String>,
    pub system_instance_id: Option<String>,
    pub callback_url: Option<String>,
    pub execution_id: Option<String>,
}

impl RunContext {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn session(&self) -> Option<Session> {
        Session::new(self.access_token.clone(), self.service_url.clone()).ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTrigger {
    pub integration_id: String,
    pub flow_id: Option<String>,
    pub session: Session,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    TestIntegration(TestTrigger),
    IntegrationLoaded {
        config_state: Option<String>,
        system_instance_id: Option<String>,
        initial_flow_id: Option<String>,
    },
    IntegrationFailed {
        error: String,
    },
    CallbackResolved {
        callback_url: Option<String>,
    },
    TestStarted {
        execution_id: String,
    },
    TestFailed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    LoadIntegration {
        integration_id: String,
        session: Session,
    },
    OpenConfiguration {
        integration_id: String,
        system_instance_id: Option<String>,
    },
    ResolveCallback,
    RunFlowTest {
        integration_id: String,
        flow_id: String,
        session: Session,
        callback_url: Option<String>,
    },
    /// Wait for callbacks to land, then regenerate step types.
    SyncResults {
        execution_id: String,
        session: Session,
    },
    Notify {
        level: MessageLevel,
        message: String,
    },
}

/// Strict equality with the one ready state; anything else needs configuration.
pub fn is_fully_configured(config_state: Option<&str>) -> bool {
    config_state == Some(FULLY_CONFIGURED)
}

#[derive(Debug)]
pub struct Machine {
    state: RunState,
    context: RunContext,
    path: Vec<RunState>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: RunState::WaitingForTest,
            context: RunContext::default(),
            path: Vec::new(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// States entered while handling the most recent event, in order.
    pub fn last_path(&self) -> &[RunState] {
        &self.path
    }

    pub fn send(&mut self, event: RunEvent) -> Vec<Effect> {
        self.path.clear();
        let mut effects = Vec::new();
        match (self.state, event) {
            (RunState::WaitingForTest, RunEvent::TestIntegration(trigger)) => {
                self.context = RunContext {
                    integration_id: Some(trigger.integration_id.clone()),
                    flow_id: trigger.flow_id,
                    access_token: Some(trigger.session.access_token.clone()),
                    service_url: Some(trigger.session.service_url.clone()),
                    ..RunContext::default()
                };
                self.enter(RunState::LoadingIntegration);
                effects.push(Effect::LoadIntegration {
                    integration_id: trigger.integration_id,
                    session: trigger.session,
                });
            }
            (
                RunState::LoadingIntegration,
                RunEvent::IntegrationLoaded {
                    config_state,
                    system_instance_id,
                    initial_flow_id,
                },
            ) => {
                if self.context.flow_id.is_none() {
                    self.context.flow_id = initial_flow_id;
                }
                self.context.config_state = config_state;
                self.context.system_instance_id = system_instance_id;
                self.enter(RunState::CheckingConfiguration);
                self.check_configuration(&mut effects);
            }
            (RunState::LoadingIntegration, RunEvent::IntegrationFailed { error }) => {
                self.fail("Failed to load integration", &error, &mut effects);
            }
            (RunState::ExecutingTest, RunEvent::CallbackResolved { callback_url }) => {
                self.context.callback_url = callback_url.clone();
                match (
                    self.context.integration_id.clone(),
                    self.context.flow_id.clone(),
                    self.context.session(),
                ) {
                    (Some(integration_id), Some(flow_id), Some(session)) => {
                        effects.push(Effect::RunFlowTest {
                            integration_id,
                            flow_id,
                            session,
                            callback_url,
                        });
                    }
                    (_, None, _) => {
                        self.fail("Cannot test integration", "integration has no flow to test", &mut effects)
                    }
                    _ => self.fail("Cannot test integration", "run context is incomplete", &mut effects),
                }
            }
            (RunState::ExecutingTest, RunEvent::TestStarted { execution_id }) => {
                self.context.execution_id = Some(execution_id.clone());
                if let Some(session) = self.context.session() {
                    effects.push(Effect::SyncResults {
                        execution_id: execution_id.clone(),
                        session,
                    });
                }
                effects.push(Effect::Notify {
                    level: MessageLevel::Success,
                    message: format!("Integration test started (execution {execution_id})"),
                });
                self.reset();
            }
            (RunState::ExecutingTest, RunEvent::TestFailed { error }) => {
                self.fail("Integration test failed", &error, &mut effects);
            }
            (state, event) => {
                debug!(?state, ?event, "event ignored in current state");
            }
        }
        effects
    }

    fn check_configuration(&mut self, effects: &mut Vec<Effect>) {
        if is_fully_configured(self.context.config_state.as_deref()) {
            self.enter(RunState::ExecutingTest);
            effects.push(Effect::ResolveCallback);
            return;
        }
        self.enter(RunState::ConfiguringInstance);
        if let Some(integration_id) = self.context.integration_id.clone() {
            effects.push(Effect::OpenConfiguration {
                integration_id,
                system_instance_id: self.context.system_instance_id.clone(),
            });
        }
        self.reset();
    }

    fn fail(&mut self, summary: &str, error: &str, effects: &mut Vec<Effect>) {
        effects.push(Effect::Notify {
            level: MessageLevel::Error,
            message: format!("{summary}: {error}"),
        });
        self.reset();
    }

    fn reset(&mut self) {
        self.context = RunContext::default();
        self.enter(RunState::WaitingForTest);
    }

    fn enter(&mut self, state: RunState) {
        self.state = state;
        self.path.push(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trigger(flow_id: Option<&str>) -> RunEvent {
        RunEvent::TestIntegration(TestTrigger {
            integration_id: "int-1".into(),
            flow_id: flow_id.map(str::to_owned),
            session: Session {
                access_token: "token".into(),
                service_url: "https://app.prismatic.io".into(),
            },
        })
    }

    fn loaded(config_state: &str) -> RunEvent {
        RunEvent::IntegrationLoaded {
            config_state: Some(config_state.into()),
            system_instance_id: Some("si-1".into()),
            initial_flow_id: Some("flow-initial".into()),
        }
    }

    #[test]
    fn trigger_captures_context_and_loads() {
        let mut machine = Machine::new();
        assert_eq!(machine.state().tag(), StateTag::Idle);
        let effects = machine.send(trigger(None));
        assert_eq!(machine.state(), RunState::LoadingIntegration);
        assert_eq!(machine.state().tag(), StateTag::Testing);
        assert_eq!(machine.context().integration_id.as_deref(), Some("int-1"));
        assert!(matches!(effects.as_slice(), [Effect::LoadIntegration { .. }]));
    }

    #[test]
    fn fully_configured_adopts_initial_flow_and_executes() {
        let mut machine = Machine::new();
        machine.send(trigger(None));
        let effects = machine.send(loaded(FULLY_CONFIGURED));
        assert_eq!(
            machine.last_path(),
            &[RunState::CheckingConfiguration, RunState::ExecutingTest]
        );
        assert_eq!(effects, vec![Effect::ResolveCallback]);
        assert_eq!(machine.context().flow_id.as_deref(), Some("flow-initial"));

        let effects = machine.send(RunEvent::CallbackResolved {
            callback_url: Some("https://x.trycloudflare.com".into()),
        });
        match effects.as_slice() {
            [Effect::RunFlowTest { flow_id, callback_url, .. }] => {
                assert_eq!(flow_id, "flow-initial");
                assert_eq!(callback_url.as_deref(), Some("https://x.trycloudflare.com"));
            }
            other => panic!("unexpected effects {other:?}"),
        }
    }

    #[test]
    fn explicit_flow_is_kept() {
        let mut machine = Machine::new();
        machine.send(trigger(Some("flow-explicit")));
        machine.send(loaded(FULLY_CONFIGURED));
        assert_eq!(machine.context().flow_id.as_deref(), Some("flow-explicit"));
    }

    #[test]
    fn unconfigured_instance_opens_configuration_and_resets() {
        let mut machine = Machine::new();
        machine.send(trigger(None));
        let effects = machine.send(loaded("NEEDS_INSTANCE_CONFIGURATION"));
        assert_eq!(
            machine.last_path(),
            &[
                RunState::CheckingConfiguration,
                RunState::ConfiguringInstance,
                RunState::WaitingForTest
            ]
        );
        assert_eq!(
            effects,
            vec![Effect::OpenConfiguration {
                integration_id: "int-1".into(),
                system_instance_id: Some("si-1".into()),
            }]
        );
        assert!(machine.context().is_empty());
    }

    #[test]
    fn unknown_or_missing_config_state_needs_configuration() {
        assert!(is_fully_configured(Some(FULLY_CONFIGURED)));
        assert!(!is_fully_configured(Some("fully_configured")));
        assert!(!is_fully_configured(None));
    }

    #[test]
    fn every_terminal_transition_clears_context() {
        let failures: Vec<Vec<RunEvent>> = vec![
            vec![RunEvent::IntegrationFailed {
                error: "boom".into(),
            }],
            vec![
                loaded(FULLY_CONFIGURED),
                RunEvent::CallbackResolved { callback_url: None },
                RunEvent::TestFailed {
                    error: "no execution id".into(),
                },
            ],
            vec![
                loaded(FULLY_CONFIGURED),
                RunEvent::CallbackResolved { callback_url: None },
                RunEvent::TestStarted {
                    execution_id: "exec-1".into(),
                },
            ],
            vec![loaded("NEEDS_USER_LEVEL_CONFIGURATION")],
        ];
        for events in failures {
            let mut machine = Machine::new();
            machine.send(trigger(None));
            for event in events {
                machine.send(event);
            }
            assert_eq!(machine.state(), RunState::WaitingForTest);
            assert!(machine.context().is_empty(), "{:?}", machine.context());
        }
    }

    #[test]
    fn success_schedules_result_sync() {
        let mut machine = Machine::new();
        machine.send(trigger(None));
        machine.send(loaded(FULLY_CONFIGURED));
        machine.send(RunEvent::CallbackResolved { callback_url: None });
        let effects = machine.send(RunEvent::TestStarted {
            execution_id: "exec-1".into(),
        });
        assert!(matches!(
            effects.first(),
            Some(Effect::SyncResults { execution_id, .. }) if execution_id == "exec-1"
        ));
    }

    #[test]
    fn missing_flow_fails_the_run() {
        let mut machine = Machine::new();
        machine.send(trigger(None));
        machine.send(RunEvent::IntegrationLoaded {
            config_state: Some(FULLY_CONFIGURED.into()),
            system_instance_id: None,
            initial_flow_id: None,
        });
        let effects = machine.send(RunEvent::CallbackResolved { callback_url: None });
        assert!(matches!(
            effects.as_slice(),
            [Effect::Notify { level: MessageLevel::Error, .. }]
        ));
        assert!(machine.context().is_empty());
    }

    #[test]
    fn triggers_during_a_run_are_ignored() {
        let mut machine = Machine::new();
        machine.send(trigger(None));
        let effects = machine.send(trigger(Some("other")));
        assert!(effects.is_empty());
        assert_eq!(machine.state(), RunState::LoadingIntegration);
        assert_eq!(machine.context().flow_id, None);
    }

    #[test]
    fn stray_events_in_idle_are_ignored() {
        let mut machine = Machine::new();
        let effects = machine.send(RunEvent::TestStarted {
            execution_id: "late".into(),
        });
        assert!(effects.is_empty());
        assert!(machine.context().is_empty());
    }
}
