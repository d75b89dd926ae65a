//! Client side of the control plane
//!
//! A [`ClientContext`] owns everything one process needs: the server list,
//! the agent that talks to the server, the pool registry, the single poll
//! worker, the alarm controller and the optional runtime reporter.

pub mod agent;
pub mod reporter;
pub mod server_list;
pub mod worker;

pub use agent::ServerAgent;
pub use reporter::RuntimeReporter;
pub use server_list::ServerList;
pub use worker::{ClientWorker, ConfigListener, PollOutcome, WorkerSettings};

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::alarm::{AlarmHandle, Notifiers};
use crate::digest::fingerprint;
use crate::error::{RegisterError, RegistryError, TransportError};
use crate::executor::ExecutorBuilder;
use crate::model::{GroupKey, NotifyAlarmConfig, PoolConfig};
use crate::registry::{PoolHandle, PoolRegistry, RegistryListener};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub servers: Vec<String>,
    pub tenant: String,
    pub item: String,
    pub token: Option<String>,
    pub worker: WorkerSettings,
    pub health_refresh: Duration,
    pub alarm_check: Duration,

    /// `None` disables runtime reports
    pub report_period: Option<Duration>,
}

impl ClientSettings {
    pub fn new(
        servers: Vec<String>,
        tenant: impl Into<String>,
        item: impl Into<String>,
    ) -> Self {
        Self {
            servers,
            tenant: tenant.into(),
            item: item.into(),
            token: None,
            worker: WorkerSettings::default(),
            health_refresh: Duration::from_secs(30),
            alarm_check: crate::alarm::controller::DEFAULT_CHECK_PERIOD,
            report_period: None,
        }
    }
}

pub struct ClientContext {
    settings: ClientSettings,
    servers: Arc<ServerList>,
    agent: ServerAgent,
    registry: PoolRegistry,
    worker: Arc<ClientWorker>,
    notifiers: Notifiers,
    alarm: Option<AlarmHandle>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ClientContext {
    pub fn new(settings: ClientSettings, notifiers: Notifiers) -> Result<Self, TransportError> {
        let servers = Arc::new(ServerList::new(settings.servers.iter().cloned())?);
        let agent = ServerAgent::new(
            Arc::clone(&servers),
            settings.tenant.clone(),
            settings.token.clone(),
            settings.worker.timeout_margin,
        )?;
        let worker = Arc::new(ClientWorker::new(agent.clone(), settings.worker.clone()));

        Ok(Self {
            settings,
            servers,
            agent,
            registry: PoolRegistry::new(),
            worker,
            notifiers,
            alarm: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn registry(&self) -> &PoolRegistry {
        &self.registry
    }

    pub fn agent(&self) -> &ServerAgent {
        &self.agent
    }

    pub fn worker(&self) -> &Arc<ClientWorker> {
        &self.worker
    }

    pub fn servers(&self) -> &Arc<ServerList> {
        &self.servers
    }

    pub fn alarm(&self) -> Option<&AlarmHandle> {
        self.alarm.as_ref()
    }

    pub fn group_key(&self, pool_id: &str) -> Result<GroupKey, RegisterError> {
        Ok(GroupKey::new(&self.settings.tenant, &self.settings.item, pool_id)?)
    }

    /// Register a pool with the server, build it and subscribe to changes.
    ///
    /// The server copy wins when it already holds different content: the
    /// subscription starts from the local fingerprint, so the first poll
    /// pulls and applies the server's version.
    #[instrument(skip(self, builder, alarm), fields(pool = builder.pool_id()))]
    pub async fn register_pool(
        &self,
        builder: ExecutorBuilder,
        alarm: NotifyAlarmConfig,
    ) -> Result<Arc<PoolHandle>, RegisterError> {
        let key = self.group_key(builder.pool_id())?;
        if self.registry.lookup(&key).is_ok() {
            return Err(RegistryError::DuplicateRegistration(key).into());
        }

        let config = PoolConfig {
            parameters: builder.current_parameters().clone(),
            alarm: alarm.clone(),
        };
        config.validate()?;

        let response = self.agent.register(&key, &config).await?;
        let local = fingerprint(&config.to_content());
        if response.fingerprint != local {
            debug!(pool = %key, version = response.version, "server holds different content");
        }

        let executor = builder.build()?;
        let handle = self
            .registry
            .register(PoolHandle::new(key.clone(), executor, alarm))?;
        self.worker.subscribe(
            key.clone(),
            local,
            Arc::new(RegistryListener::new(self.registry.clone())),
        );

        info!(pool = %key, created = response.created, "registered pool");
        Ok(handle)
    }

    /// Spawn the poll worker, the health refresh, the alarm controller and,
    /// when configured, the runtime reporter.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            warn!("client already started");
            return;
        }

        self.tasks.push(tokio::spawn(
            Arc::clone(&self.worker).run(self.cancel.child_token()),
        ));
        self.tasks.push(tokio::spawn(Arc::clone(&self.servers).run(
            self.settings.health_refresh,
            self.cancel.child_token(),
        )));
        if let Some(period) = self.settings.report_period {
            let reporter = RuntimeReporter::new(self.registry.clone(), self.agent.clone(), period);
            self.tasks
                .push(tokio::spawn(reporter.run(self.cancel.child_token())));
        }

        self.alarm = Some(AlarmHandle::spawn(
            self.registry.clone(),
            self.notifiers.clone(),
            self.settings.alarm_check,
        ));
        info!(pools = self.registry.len(), "client started");
    }

    /// Stop the loops, then shut every pool down and wait up to `grace` for
    /// its queued work. Returns whether every pool terminated in time.
    pub async fn shutdown(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        if let Some(alarm) = self.alarm.take() {
            alarm.shutdown().await;
        }
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("client task ended abnormally: {e}");
            }
        }

        let handles = self.registry.handles();
        for handle in &handles {
            handle.executor().shutdown();
        }

        let terminated = tokio::task::spawn_blocking(move || {
            handles.iter().fold(true, |all, handle| {
                handle.executor().await_termination(grace) && all
            })
        })
        .await
        .unwrap_or(false);

        info!(terminated, "client stopped");
        terminated
    }
}
