//! Assembles the workers for a role plan and runs each on a named thread.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use serde::Serialize;
use tracing::{error, info};

use super::{
    arrival_ring, plan_roles, EngineConfig, RoleBehavior, RxPath, RxReport, RxTxWorker, RxWorker,
    StatWorker, TxPath, TxReport, TxWorker,
};
use crate::clock::CycleClock;
use crate::config::ProbeConfig;
use crate::control::{Controller, Role, WorkerState};
use crate::error::EngineError;
use crate::port::{loopback, Port};
use crate::sink::RecordSink;
use crate::stats::{RunSummary, TrafficCounters};
use crate::template::ProbeTemplate;

enum RoleOutcome {
    Stat(RunSummary),
    Rx(RxReport),
    Tx(TxReport),
    RxTx(RxReport, TxReport),
}

type Job = Box<dyn FnOnce() -> RoleOutcome + Send + 'static>;

/// Everything the roles reported once joined.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionReport {
    pub plan: Vec<RoleBehavior>,
    pub summary: Option<RunSummary>,
    pub rx: Option<RxReport>,
    pub tx: Option<TxReport>,
}

/// A launched run.
pub struct Session {
    ctl: Arc<Controller>,
    plan: Vec<RoleBehavior>,
    handles: Vec<(RoleBehavior, JoinHandle<RoleOutcome>)>,
}

impl Session {
    /// Runs `cfg` over an in-process loop-back port.
    pub fn loopback<C>(
        cfg: &ProbeConfig,
        clock: C,
        ctl: Arc<Controller>,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self, EngineError>
    where
        C: CycleClock + Clone + 'static,
    {
        let template = ProbeTemplate::build(&cfg.packet)?;
        let (tx_port, rx_port) = loopback(cfg.pool_size, template.wire_size());
        Self::launch(
            cfg.units,
            EngineConfig::from(cfg),
            template,
            tx_port,
            rx_port,
            clock,
            ctl,
            sink,
        )
    }

    /// Builds every worker for `units` execution units, then spawns them in
    /// plan order. Configuration problems surface here, before any thread
    /// exists.
    #[allow(clippy::too_many_arguments)]
    pub fn launch<C, T, R>(
        units: usize,
        engine: EngineConfig,
        template: ProbeTemplate,
        tx_port: T,
        rx_port: R,
        clock: C,
        ctl: Arc<Controller>,
        sink: Box<dyn RecordSink>,
    ) -> Result<Self, EngineError>
    where
        C: CycleClock + Clone + 'static,
        T: Port + 'static,
        R: Port + 'static,
    {
        let plan = plan_roles(units)?;
        let counters = TrafficCounters::new();
        let tx = TxPath::new(
            tx_port,
            template.clone(),
            clock.clone(),
            sink,
            counters.clone(),
            &engine,
        )?;
        let rx = RxPath::new(rx_port, template, counters.clone(), engine.rx_burst);

        let stat = StatWorker::new(ctl.clone(), clock.clone(), counters, engine.stat_period);
        let stat_job: Job = Box::new(move || RoleOutcome::Stat(stat.run()));
        let mut jobs = vec![(RoleBehavior::Stat, stat_job)];

        if plan.contains(&RoleBehavior::RxTx) {
            let worker = RxTxWorker::new(ctl.clone(), rx, tx, engine.start_poll.clone());
            let job: Job = Box::new(move || {
                let (rx, tx) = worker.run();
                RoleOutcome::RxTx(rx, tx)
            });
            jobs.push((RoleBehavior::RxTx, job));
        } else {
            let (producer, consumer) = arrival_ring(engine.pool_size);
            let rx_worker = RxWorker::new(
                ctl.clone(),
                clock.clone(),
                rx,
                producer,
                engine.start_poll.clone(),
            );
            let tx_worker = TxWorker::new(
                ctl.clone(),
                tx.with_arrivals(consumer),
                engine.start_poll.clone(),
            );
            let rx_job: Job = Box::new(move || RoleOutcome::Rx(rx_worker.run()));
            let tx_job: Job = Box::new(move || RoleOutcome::Tx(tx_worker.run()));
            jobs.push((RoleBehavior::RxOnly, rx_job));
            jobs.push((RoleBehavior::TxOnly, tx_job));
        }

        let mut handles = Vec::with_capacity(jobs.len());
        for (behavior, job) in jobs {
            let spawned = thread::Builder::new()
                .name(behavior.thread_name().into())
                .spawn(job);
            match spawned {
                Ok(handle) => handles.push((behavior, handle)),
                Err(source) => {
                    ctl.request_stop();
                    // Roles that never got a thread are settled here so a
                    // running STAT can still observe a finished data plane.
                    for &role in plan.iter().flat_map(|b| b.roles()) {
                        if role != Role::Stat && ctl.state(role) == WorkerState::Uninit {
                            ctl.set_state(role, WorkerState::Stopped);
                        }
                    }
                    return Err(EngineError::Spawn {
                        role: behavior.thread_name(),
                        source,
                    });
                }
            }
        }
        info!(?plan, "roles launched");

        Ok(Session { ctl, plan, handles })
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.ctl
    }

    /// True once every role thread has returned.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|(_, h)| h.is_finished())
    }

    /// Waits for every role. A panicked role is logged and leaves its part
    /// of the report empty.
    pub fn join(self) -> SessionReport {
        let mut report = SessionReport {
            plan: self.plan,
            ..Default::default()
        };
        for (behavior, handle) in self.handles {
            match handle.join() {
                Ok(RoleOutcome::Stat(summary)) => report.summary = Some(summary),
                Ok(RoleOutcome::Rx(rx)) => report.rx = Some(rx),
                Ok(RoleOutcome::Tx(tx)) => report.tx = Some(tx),
                Ok(RoleOutcome::RxTx(rx, tx)) => {
                    report.rx = Some(rx);
                    report.tx = Some(tx);
                }
                Err(_) => error!(role = behavior.thread_name(), "role thread panicked"),
            }
        }
        report
    }
}
