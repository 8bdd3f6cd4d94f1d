//! Stub collaborators and builders shared by the integration tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use sumi_sluice::config::IdentitiesConfig;
use sumi_sluice::pool::{IdentityPool, ProxyPool};
use sumi_sluice::progress::ProgressStore;
use sumi_sluice::scheduler::{Scheduler, SchedulerSettings};
use sumi_sluice::state::{Identity, Lease};
use sumi_sluice::transport::UnitExecutor;
use sumi_sluice::work::{ExecutionOutput, FailureKind, WorkKind, WorkUnit};

type Script = dyn Fn(&Identity, &WorkUnit) -> Result<ExecutionOutput, FailureKind> + Send + Sync;

/// One executor call as seen by the stub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub identity: String,
    pub unit: String,
    pub attempt: u32,
}

/// Executor whose answers come from a closure; records every call
pub struct ScriptedExecutor {
    script: Box<Script>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedExecutor {
    pub fn new(
        script: impl Fn(&Identity, &WorkUnit) -> Result<ExecutionOutput, FailureKind>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Succeeds with one item for every unit
    pub fn always_ok() -> Arc<Self> {
        Self::new(|_, _| Ok(ExecutionOutput::new("{}", 1)))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, unit_id: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| call.unit == unit_id)
            .collect()
    }
}

#[async_trait]
impl UnitExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        identity: &Identity,
        _lease: Option<&Lease>,
        unit: &WorkUnit,
    ) -> Result<ExecutionOutput, FailureKind> {
        self.calls.lock().unwrap().push(Call {
            identity: identity.id.clone(),
            unit: unit.id.clone(),
            attempt: unit.attempt,
        });
        (self.script)(identity, unit)
    }
}

pub fn blocked() -> FailureKind {
    FailureKind::Blocked {
        status: Some(403),
        reason: "HTTP 403".to_string(),
    }
}

/// Settings with pacing and backoff shortened; long pauses disabled
pub fn create_test_settings() -> SchedulerSettings {
    let mut settings = SchedulerSettings::default();
    settings.pacing.min_interval_ms = 100;
    settings.pacing.max_interval_ms = 200;
    settings.pacing.jitter_ms = 50;
    settings.pacing.long_pause_every = 0;
    settings.scheduler.resubmit_rounds = 0;
    settings
}

pub fn create_identity_pool(count: usize) -> Arc<IdentityPool> {
    let identities = (1..=count)
        .map(|i| Identity::new(format!("acct-{}", i), format!("SUB=cookie-{}", i)))
        .collect();
    Arc::new(IdentityPool::new(identities, IdentitiesConfig::default(), 5))
}

pub fn create_units(count: usize) -> Vec<WorkUnit> {
    (1..=count)
        .map(|i| WorkUnit::new(i.to_string(), WorkKind::PostDetail, ""))
        .collect()
}

pub fn create_scheduler(
    settings: SchedulerSettings,
    identities: Arc<IdentityPool>,
    executor: Arc<ScriptedExecutor>,
    store: Arc<ProgressStore>,
) -> Scheduler {
    Scheduler::new(
        settings,
        identities,
        Arc::new(ProxyPool::disabled()),
        executor,
        store,
    )
}
