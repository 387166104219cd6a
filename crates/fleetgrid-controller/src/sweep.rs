//! Drain sweep: hard-deletes unlinked instances whose sessions have
//! drained and frees their ports.
//!
//! The trigger set is the mirror query `Status = MarkedForDeletion AND
//! ActiveSessions = 0`. An instance the cluster still links to a
//! collection is never deleted, whatever its mirror row says.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleetgrid_cluster::{ClusterClient, ObjectKey};
use fleetgrid_state::{PruneReport, StateStore, entity_key};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::ControllerResult;

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Instances removed together with their mirror row and port.
    pub deleted: usize,
    /// Drained rows whose instance is still linked to a collection.
    pub skipped: usize,
    /// Rows left in place after an error; retried next pass.
    pub failed: usize,
}

pub struct Sweeper {
    cluster: Arc<dyn ClusterClient>,
    store: StateStore,
}

impl Sweeper {
    pub fn new(cluster: Arc<dyn ClusterClient>, store: StateStore) -> Self {
        Self { cluster, store }
    }

    /// Drop mirror rows and port reservations that no live instance
    /// accounts for.
    ///
    /// Run before the controllers start. With a cluster that does not
    /// outlive the process, this frees everything a previous run left in
    /// the store.
    pub async fn reclaim_orphans(&self) -> ControllerResult<PruneReport> {
        let live: HashMap<String, u16> = self
            .cluster
            .list_instances()
            .await?
            .into_iter()
            .map(|instance| (entity_key(&instance.namespace, &instance.name), instance.port))
            .collect();
        let report = self.store.retain_live(&live)?;
        if report != PruneReport::default() {
            info!(
                rows = report.rows,
                ports = report.ports,
                live = live.len(),
                "reclaimed entries without a live instance"
            );
        }
        Ok(report)
    }

    /// Run one pass over the drained rows.
    pub async fn sweep_once(&self) -> ControllerResult<SweepReport> {
        let drained = self.store.query_marked_for_deletion_zero_sessions()?;
        let mut report = SweepReport::default();

        for row in drained {
            let key = ObjectKey::new(&row.namespace, &row.name);

            let exists = match self.cluster.get_instance(&key).await {
                Ok(instance) if instance.owner.is_some() => {
                    debug!(%key, "drained row still linked, skipping");
                    report.skipped += 1;
                    continue;
                }
                Ok(_) => true,
                Err(e) if e.is_not_found() => false,
                Err(e) => {
                    warn!(%key, error = %e, "failed to look up instance");
                    report.failed += 1;
                    continue;
                }
            };

            // The port must be releasable before anything is removed.
            if let Err(e) = row.parsed_port() {
                warn!(%key, error = %e, "drained row has an unusable port, keeping instance");
                report.failed += 1;
                continue;
            }

            if exists {
                match self.cluster.delete_instance(&key).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        warn!(%key, error = %e, "failed to delete instance");
                        report.failed += 1;
                        continue;
                    }
                }
            }

            match self.store.delete_instance(&row.namespace, &row.name) {
                Ok(()) => {
                    info!(%key, port = row.port.as_deref().unwrap_or("-"), "instance reclaimed");
                    report.deleted += 1;
                }
                Err(e) if e.is_not_found() => {
                    report.deleted += 1;
                }
                Err(e) => {
                    warn!(%key, error = %e, "failed to remove mirror row");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Run the sweep loop.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "drain sweep started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => {
                            info!(
                                deleted = report.deleted,
                                skipped = report.skipped,
                                failed = report.failed,
                                "sweep pass complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "sweep pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("drain sweep shutting down");
                    break;
                }
            }
        }
    }
}
