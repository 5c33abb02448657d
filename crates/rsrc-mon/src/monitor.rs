use std::collections::HashMap;
use std::io::Write;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use api_types::ClassReport;
use api_types::DeviceClass;
use api_types::PollReport;
use chrono::Local;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use utils::version;

use crate::device::ClassSnapshot;
use crate::device::DeviceApi;
use crate::pool::PoolAccess;
use crate::query::query;
use crate::report::ReportSink;
use crate::selector::select;
use crate::selector::QueriedDevice;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Zero reports once and returns
    pub interval: Duration,
    /// Re-scan the host before every report
    pub refresh: bool,
    pub match_fw_revision: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::ZERO,
            refresh: true,
            match_fw_revision: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The single report of a run-once invocation was written
    Completed,
    Cancelled,
}

/// Periodically reports the load of every pooled module.
pub struct Monitor<'a, P: PoolAccess + ?Sized, A: DeviceApi, W: Write> {
    config: MonitorConfig,
    pool: &'a P,
    api: A,
    sink: ReportSink<W>,
    started: Instant,
    /// Last snapshot copied per class, used while the pool lock is unavailable
    last_snapshot: HashMap<DeviceClass, ClassSnapshot>,
    /// Set once the pool lock timed out in the current poll
    lock_busy: bool,
}

impl<'a, P, A, W> Monitor<'a, P, A, W>
where
    P: PoolAccess + ?Sized,
    A: DeviceApi,
    W: Write,
{
    pub fn new(config: MonitorConfig, pool: &'a P, api: A, sink: ReportSink<W>) -> Self {
        Self {
            config,
            pool,
            api,
            sink,
            started: Instant::now(),
            last_snapshot: HashMap::new(),
            lock_busy: false,
        }
    }

    pub fn sink(&self) -> &ReportSink<W> {
        &self.sink
    }

    /// Reports until cancelled, or once if the interval is zero.
    ///
    /// A report in progress is always finished before cancellation is
    /// honored.
    pub async fn run(&mut self, cancellation_token: &CancellationToken) -> Result<MonitorExit> {
        self.sink.start().context("Failed to write report")?;

        loop {
            if cancellation_token.is_cancelled() {
                info!("Monitor shutdown requested");
                return Ok(MonitorExit::Cancelled);
            }

            let report = self.poll_once();
            self.sink.emit(&report).context("Failed to write report")?;

            if self.config.interval.is_zero() {
                return Ok(MonitorExit::Completed);
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("Monitor shutdown requested");
                    return Ok(MonitorExit::Cancelled);
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// Refreshes the pool if enabled and builds one report.
    ///
    /// Once the pool lock times out, the rest of the poll works from the
    /// snapshots of earlier polls instead of waiting on the lock again.
    pub fn poll_once(&mut self) -> PollReport {
        self.lock_busy = false;

        if self.config.refresh {
            if let Err(report) = self.pool.refresh(self.config.match_fw_revision) {
                if report.current_context().is_lock_busy() {
                    self.lock_busy = true;
                    warn!(error = ?report, "Pool lock unavailable, refresh skipped");
                } else {
                    error!(error = ?report, "Resource pool records might be corrupted");
                }
            }
        }

        let timestamp = Local::now();
        let uptime_secs = self.started.elapsed().as_secs();

        let mut classes = Vec::with_capacity(DeviceClass::ALL.len());
        for class in DeviceClass::ALL {
            if let Some(report) = self.report_class(class) {
                classes.push(report);
            }
        }

        PollReport {
            timestamp,
            uptime_secs,
            version: version::VERSION.to_string(),
            classes,
        }
    }

    fn class_snapshot(&mut self, class: DeviceClass) -> Option<ClassSnapshot> {
        if !self.lock_busy {
            match self.pool.snapshot_class(class) {
                Ok(snapshot) => {
                    self.last_snapshot.insert(class, snapshot.clone());
                    return Some(snapshot);
                }
                Err(report) => {
                    self.lock_busy = report.current_context().is_lock_busy();
                    warn!(%class, error = ?report, "Failed to copy pool records");
                }
            }
        }

        match self.last_snapshot.get(&class) {
            Some(snapshot) => {
                warn!(%class, "Reporting from the previous pool snapshot");
                Some(snapshot.clone())
            }
            None => {
                warn!(%class, "No pool snapshot available, skipping class");
                None
            }
        }
    }

    /// Queries every module of `class` in raw order. `None` if the class
    /// could not be read at all.
    pub fn report_class(&mut self, class: DeviceClass) -> Option<ClassReport> {
        let pool_snapshot = self.class_snapshot(class)?;
        let raw_order = pool_snapshot.identifiers();

        let mut queried = HashMap::with_capacity(raw_order.len());
        for &module_id in &raw_order {
            let result = pool_snapshot.resolve(module_id).and_then(|descriptor| {
                let snapshot = query(&self.api, class, descriptor)?;
                Ok(QueriedDevice {
                    descriptor: descriptor.clone(),
                    snapshot,
                })
            });

            match result {
                Ok(device) => {
                    queried.insert(module_id, device);
                }
                Err(e) => warn!(%class, module_id, error = ?e, "Skipping device: {}", e),
            }
        }

        Some(ClassReport {
            class,
            device_count: raw_order.len(),
            rows: select(&raw_order, &queried),
        })
    }
}
