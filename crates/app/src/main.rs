use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tokio::{signal, sync::broadcast};
use tracing::{info, warn};

use prism_bridge::config::{AppConfig, load_config};
use prism_bridge::consistency::IntegrationConsistencyManager;
use prism_bridge::credentials::CredentialStore;
use prism_bridge::editor::{EditorBridge, HeadlessEditor};
use prism_bridge::graphql::{HttpGraphqlClient, RemoteQueryExecutor};
use prism_bridge::notify::{MessageLevel, report};
use prism_bridge::orchestrator::{RunNotice, RunTimings, TestRunDeps, TestRunOrchestrator};
use prism_bridge::persistence::ResultPersistence;
use prism_bridge::prism_cli::PrismCli;
use prism_bridge::server::CallbackServer;
use prism_bridge::state::{FileStateStore, SharedStateStore, keys};
use prism_bridge::tunnel::TunnelManager;

const TEST_COMMAND: &str = "prismatic.integrations.test";

#[derive(Parser, Debug)]
#[command(
    name = "prism-bridge",
    version,
    about = "Run Prismatic integration tests and collect step results locally"
)]
struct Cli {
    /// Path to the configuration file (defaults to .prismatic/bridge.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<Utf8PathBuf>,
    /// Workspace root (defaults to the configured root)
    #[arg(long, value_name = "DIR", global = true)]
    workspace: Option<Utf8PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the callback server and tunnel, and accept test triggers until ctrl-c
    Serve,
    /// Run one integration test and wait for its step results
    Test {
        /// Integration to test (defaults to the active integration)
        #[arg(long)]
        integration_id: Option<String>,
        /// Flow to test (defaults to the integration's first flow)
        #[arg(long)]
        flow_id: Option<String>,
    },
    /// Active-integration management
    Integration {
        #[command(subcommand)]
        command: IntegrationCommand,
    },
    /// Inspect recorded executions
    Executions {
        #[command(subcommand)]
        command: ExecutionsCommand,
    },
    /// Credentials via the Prism CLI
    Auth {
        #[command(subcommand)]
        command: AuthCommand,
    },
}

#[derive(Subcommand, Debug)]
enum IntegrationCommand {
    /// Make the integration in PATH active
    Set {
        path: Utf8PathBuf,
        /// Write this id into the marker file first
        #[arg(long)]
        integration_id: Option<String>,
    },
    /// Verify and repair the active-integration state
    Check,
    /// Print the active integration
    Show,
}

#[derive(Subcommand, Debug)]
enum ExecutionsCommand {
    /// List executions, newest first
    List,
    /// Regenerate types.ts from an execution's step files
    Types { execution_id: String },
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    Login,
    Logout,
    Status,
}

struct Bridge {
    config: AppConfig,
    workspace: SharedStateStore,
    credentials: Arc<CredentialStore>,
    executor: Arc<dyn RemoteQueryExecutor>,
    editor: Arc<HeadlessEditor>,
    persistence: Arc<ResultPersistence>,
    cli: PrismCli,
}

impl Bridge {
    fn build(config: AppConfig) -> Result<Self> {
        let workspace: SharedStateStore = FileStateStore::new(config.workspace.state_path())?;
        let global: SharedStateStore =
            FileStateStore::new(config.state.resolve_global_path(&config.workspace))?;
        let credentials = Arc::new(CredentialStore::new(global, config.service.url.clone()));
        let executor: Arc<dyn RemoteQueryExecutor> =
            Arc::new(HttpGraphqlClient::new(config.service.request_timeout()));
        let editor = Arc::new(HeadlessEditor::new(
            config.workspace.display_name(),
            config.workspace.root.to_string(),
        ));
        let persistence = Arc::new(ResultPersistence::new(config.workspace.root.clone()));
        let cli = PrismCli::new(config.cli.binary.clone());
        Ok(Self {
            config,
            workspace,
            credentials,
            executor,
            editor,
            persistence,
            cli,
        })
    }

    fn callback_server(&self) -> Arc<CallbackServer> {
        let tunnels = Arc::new(TunnelManager::from_config(
            &self.config.tunnel,
            self.workspace.clone(),
        ));
        let editor: Arc<dyn EditorBridge> = self.editor.clone();
        Arc::new(CallbackServer::new(
            self.config.server.clone(),
            self.workspace.clone(),
            self.persistence.clone(),
            editor,
            tunnels,
        ))
    }

    fn orchestrator(&self, server: Arc<CallbackServer>) -> TestRunOrchestrator {
        TestRunOrchestrator::spawn(TestRunDeps {
            executor: self.executor.clone(),
            server,
            editor: self.editor.clone(),
            timings: RunTimings::from(&self.config.test_run),
        })
    }

    fn consistency(&self) -> IntegrationConsistencyManager {
        IntegrationConsistencyManager::new(
            self.workspace.clone(),
            self.executor.clone(),
            self.credentials.clone(),
        )
    }

    /// Uses stored tokens, falling back to the Prism CLI's session.
    async fn ensure_credentials(&self) {
        if self.credentials.current().access_token.is_some() {
            return;
        }
        if let Err(err) = self.credentials.refresh_from_cli(&self.cli).await {
            warn!(?err, "no stored credentials and prism cli refresh failed");
        }
    }

    fn report(&self, level: MessageLevel, message: &str) {
        report(self.editor.as_ref(), level, message, true);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.workspace.as_deref())?;
    let bridge = Bridge::build(config)?;
    match cli.command {
        Command::Serve => serve(&bridge).await?,
        Command::Test {
            integration_id,
            flow_id,
        } => run_test(&bridge, integration_id, flow_id).await?,
        Command::Integration { command } => handle_integration(&bridge, command).await?,
        Command::Executions { command } => handle_executions(&bridge, command)?,
        Command::Auth { command } => handle_auth(&bridge, command).await?,
    }

    Ok(())
}

async fn serve(bridge: &Bridge) -> Result<()> {
    bridge.ensure_credentials().await;
    let server = bridge.callback_server();
    let port = server.start().await?;
    let orchestrator = bridge.orchestrator(server.clone());

    match bridge.consistency().check_consistency().await {
        Ok(outcome) => info!(?outcome, "active integration checked"),
        Err(err) => warn!(?err, "active integration check failed"),
    }

    register_test_command(bridge, orchestrator.clone());
    tokio::spawn(log_notices(orchestrator.notices()));

    info!(
        port,
        public_url = ?server.public_url(),
        command = TEST_COMMAND,
        "bridge ready"
    );
    shutdown_signal().await;

    server.stop().await;
    bridge.credentials.clear();
    Ok(())
}

/// Lets an editor shell start runs via `POST /api/command`.
fn register_test_command(bridge: &Bridge, orchestrator: TestRunOrchestrator) {
    let credentials = bridge.credentials.clone();
    let workspace = bridge.workspace.clone();
    bridge.editor.register_command(TEST_COMMAND, move |args| {
        let orchestrator = orchestrator.clone();
        let credentials = credentials.clone();
        let workspace = workspace.clone();
        async move {
            let integration_id = args
                .first()
                .and_then(Value::as_str)
                .map(str::to_owned)
                .or_else(|| workspace.get_string(keys::INTEGRATION_ID))
                .ok_or_else(|| anyhow!("no integration id given and none is active"))?;
            let flow_id = args.get(1).and_then(Value::as_str);
            orchestrator.test_integration(&integration_id, flow_id, &credentials.current())?;
            Ok(json!({ "queued": true, "integrationId": integration_id }))
        }
    });
}

async fn log_notices(mut notices: broadcast::Receiver<RunNotice>) {
    loop {
        match notices.recv().await {
            Ok(notice) => info!(?notice, "test run notice"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "test run notices dropped")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_test(
    bridge: &Bridge,
    integration_id: Option<String>,
    flow_id: Option<String>,
) -> Result<()> {
    let integration_id = integration_id
        .or_else(|| bridge.workspace.get_string(keys::INTEGRATION_ID))
        .context("no --integration-id given and no active integration set")?;
    bridge.ensure_credentials().await;

    let server = bridge.callback_server();
    server.start().await?;
    let orchestrator = bridge.orchestrator(server.clone());
    let mut notices = orchestrator.notices();

    let outcome = match orchestrator.test_integration(
        &integration_id,
        flow_id.as_deref(),
        &bridge.credentials.current(),
    ) {
        Ok(()) => await_run(&mut notices).await,
        Err(err) => {
            bridge.report(MessageLevel::Error, &format!("Cannot test integration: {err}"));
            Err(err.into())
        }
    };
    server.stop().await;
    outcome
}

async fn await_run(notices: &mut broadcast::Receiver<RunNotice>) -> Result<()> {
    loop {
        let notice = match notices.recv().await {
            Ok(notice) => notice,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => {
                return Err(anyhow!("test run ended without a result"));
            }
        };
        match notice {
            RunNotice::ExecutionStarted { execution_id } => {
                info!(%execution_id, "waiting for step results");
            }
            RunNotice::ResultsSynced {
                execution_id,
                step_names,
            } => {
                println!("execution {execution_id}: {} step result(s)", step_names.len());
                for name in step_names {
                    println!("  {name}");
                }
                return Ok(());
            }
            RunNotice::ResultsSyncFailed {
                execution_id,
                error,
            } => return Err(anyhow!("execution {execution_id}: {error}")),
            RunNotice::Failed { message } => return Err(anyhow!(message)),
            RunNotice::ConfigurationRequired { integration_id } => {
                return Err(anyhow!("integration {integration_id} needs configuration"));
            }
            RunNotice::Started { .. } => {}
        }
    }
}

async fn handle_integration(bridge: &Bridge, command: IntegrationCommand) -> Result<()> {
    let manager = bridge.consistency();
    match command {
        IntegrationCommand::Set {
            path,
            integration_id,
        } => {
            let path = absolute(&bridge.config.workspace.root, &path);
            bridge.ensure_credentials().await;
            let outcome = match integration_id {
                Some(id) => manager.link_integration(&path, &id).await,
                None => manager.set_active_integration(&path).await,
            };
            match outcome {
                Ok(outcome) => {
                    info!(?outcome, "active integration updated");
                    bridge.report(
                        MessageLevel::Success,
                        &format!("Active integration set from {path}"),
                    );
                }
                Err(err) => {
                    bridge.report(
                        MessageLevel::Error,
                        &format!("Failed to set active integration: {err:#}"),
                    );
                    return Err(err);
                }
            }
        }
        IntegrationCommand::Check => {
            bridge.ensure_credentials().await;
            let outcome = manager.check_consistency().await?;
            println!("{outcome:?}");
        }
        IntegrationCommand::Show => {
            let active = manager.active();
            let view = json!({
                "integrationId": active.integration_id,
                "path": active.path.map(|p| p.to_string()),
                "flowId": active.flow_id,
                "configState": active.config_state,
                "name": active.snapshot.as_ref().and_then(|s| s.get("name")).cloned(),
            });
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
    }
    Ok(())
}

fn handle_executions(bridge: &Bridge, command: ExecutionsCommand) -> Result<()> {
    match command {
        ExecutionsCommand::List => {
            for execution in bridge.persistence.list_executions()? {
                println!(
                    "{}\t{} step(s){}",
                    execution.execution_id,
                    execution.step_count,
                    if execution.has_metadata { "" } else { "\t(no metadata)" }
                );
            }
        }
        ExecutionsCommand::Types { execution_id } => {
            let names = bridge.persistence.list_step_names(&execution_id)?;
            let path = bridge.persistence.update_types_file(&execution_id, &names)?;
            bridge.report(
                MessageLevel::Success,
                &format!("Wrote {path} with {} step(s)", names.len()),
            );
        }
    }
    Ok(())
}

async fn handle_auth(bridge: &Bridge, command: AuthCommand) -> Result<()> {
    let service_url = bridge.credentials.current().service_url;
    match command {
        AuthCommand::Login => {
            bridge.cli.resolve()?;
            let result = async {
                bridge.cli.login(&service_url).await?;
                bridge.credentials.refresh_from_cli(&bridge.cli).await
            }
            .await;
            match result {
                Ok(()) => {
                    bridge.report(MessageLevel::Success, &format!("Logged in to {service_url}"))
                }
                Err(err) => {
                    bridge.report(MessageLevel::Error, &format!("Login failed: {err:#}"));
                    return Err(err);
                }
            }
        }
        AuthCommand::Logout => {
            if let Err(err) = bridge.cli.logout(&service_url).await {
                warn!(?err, "prism cli logout failed; clearing stored tokens anyway");
            }
            bridge.credentials.logout()?;
            bridge.report(MessageLevel::Success, "Logged out");
        }
        AuthCommand::Status => {
            let current = bridge.credentials.current();
            println!("service url:   {}", current.service_url);
            println!(
                "access token:  {}",
                if current.access_token.is_some() { "present" } else { "missing" }
            );
            println!(
                "refresh token: {}",
                if current.refresh_token.is_some() { "present" } else { "missing" }
            );
        }
    }
    Ok(())
}

fn absolute(root: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        root.join(path)
    }
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        warn!(?err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

fn init_tracing() {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
