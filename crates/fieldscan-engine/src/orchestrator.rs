//! Discovery orchestrator.
//!
//! One cycle scans every probe concurrently, merges what came back into the
//! registry, and regenerates artifacts when the registry moved. The registry
//! is the only shared state; everything else is a proposal.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use fieldscan_artifacts::{build_all, ArtifactGenerator, FileSink, GroupArtifacts};
use fieldscan_core::{
    now_millis, CurrentView, DeviceRecord, DiscoveryConfig, DiscoveryEvent, Error, EventMetadata, Fault,
    Result, SharedEventBus,
};
use fieldscan_devices::{ProtocolProbe, ScanOutcome, ScanSink};
use fieldscan_discovery::{Classifier, NamespaceBuilder, SignalProfiler};
use fieldscan_storage::{ClassificationMerge, Registry, SnapshotBackend, SnapshotStore, StatusFile};

use crate::state::{CycleReport, OrchestratorState, ProbeSummary, StatusReport};

/// Name of the status document kept next to the snapshots.
pub const STATUS_DOCUMENT: &str = "status";

/// Ticks to skip after `failures` consecutive fatal cycles.
pub fn backoff_cycles(failures: u32, max: u32) -> u32 {
    if failures == 0 {
        return 0;
    }
    2u32.saturating_pow(failures - 1).min(max)
}

/// Read the status the last running orchestrator persisted.
pub fn load_status(store: &dyn SnapshotBackend) -> Result<Option<StatusReport>> {
    Ok(store.get_meta(STATUS_DOCUMENT)?)
}

/// Read the status file a running (or stopped) orchestrator keeps beside its
/// snapshot store. Needs no lock on the store itself.
pub fn read_status_file(file: &StatusFile) -> Result<Option<StatusReport>> {
    Ok(file.read()?)
}

#[derive(Default)]
struct StatusInner {
    cycles_run: u64,
    last_successful_cycle: Option<u64>,
    last_successful_at: Option<i64>,
    probe_faults: BTreeMap<String, u64>,
    consecutive_failures: u32,
    backoff_remaining: u32,
    last_error: Option<String>,
}

pub struct Orchestrator {
    config: DiscoveryConfig,
    probes: tokio::sync::RwLock<Vec<Arc<ProtocolProbe>>>,
    registry: Arc<Registry>,
    profiler: SignalProfiler,
    classifier: Classifier,
    namespace: NamespaceBuilder,
    generator: ArtifactGenerator,
    sink: Option<FileSink>,
    store: Option<Arc<dyn SnapshotBackend>>,
    status_file: Option<StatusFile>,
    /// Registry version last written to the store.
    persisted_version: AtomicU64,
    /// Registry version last turned into artifacts.
    generated_version: AtomicU64,
    event_bus: SharedEventBus,
    state: RwLock<OrchestratorState>,
    cycle: AtomicU64,
    cycle_lock: tokio::sync::Mutex<()>,
    status: Mutex<StatusInner>,
}

impl Orchestrator {
    /// Orchestrator over the given probes, without persistence or file output.
    pub fn new(config: DiscoveryConfig, probes: Vec<ProtocolProbe>, event_bus: SharedEventBus) -> Self {
        let registry = Arc::new(Registry::new(
            config.registry.clone(),
            config.classifier.hysteresis_margin,
        ));
        Self {
            profiler: SignalProfiler::new().with_min_samples(config.classifier.min_profile_samples),
            classifier: Classifier::new(config.effective_vocabulary(), config.classifier.clone()),
            namespace: NamespaceBuilder::from_config(&config),
            generator: ArtifactGenerator::new(config.artifacts.clone()),
            probes: tokio::sync::RwLock::new(probes.into_iter().map(Arc::new).collect()),
            registry,
            sink: None,
            store: None,
            status_file: None,
            persisted_version: AtomicU64::new(0),
            generated_version: AtomicU64::new(0),
            event_bus,
            state: RwLock::new(OrchestratorState::Idle),
            cycle: AtomicU64::new(0),
            cycle_lock: tokio::sync::Mutex::new(()),
            status: Mutex::new(StatusInner::default()),
            config,
        }
    }

    /// Build probes, snapshot store, status file and file sink from
    /// configuration.
    pub fn from_config(config: DiscoveryConfig, event_bus: SharedEventBus) -> Result<Self> {
        let vocabulary = config.effective_vocabulary();
        let probes = config
            .probes
            .iter()
            .map(|probe| ProtocolProbe::from_config(probe, &vocabulary))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let store = match &config.registry.snapshot_path {
            Some(path) => Some((
                SnapshotStore::open(path, config.registry.snapshot_retention)?,
                StatusFile::beside(path),
            )),
            None => None,
        };
        let sink = config.artifacts.output_dir.clone().map(FileSink::new);

        let mut orchestrator = Self::new(config, probes, event_bus);
        if let Some(sink) = sink {
            orchestrator = orchestrator.with_sink(sink);
        }
        if let Some((store, status_file)) = store {
            orchestrator = orchestrator.with_snapshot_store(store)?.with_status_file(status_file);
        }
        Ok(orchestrator)
    }

    pub fn with_sink(mut self, sink: FileSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Status file rewritten after every cycle, readable while the store is
    /// held open by this process.
    pub fn with_status_file(mut self, file: StatusFile) -> Self {
        self.status_file = Some(file);
        self
    }

    /// Attach a snapshot store and resume from its latest snapshot.
    pub fn with_snapshot_store(mut self, store: impl SnapshotBackend + 'static) -> Result<Self> {
        if let Some(snapshot) = store.latest()? {
            info!(
                category = "engine",
                cycle = snapshot.cycle,
                location = %store.location(),
                "Resuming from snapshot"
            );
            self.cycle.store(snapshot.cycle, Ordering::SeqCst);
            self.registry.restore(snapshot);
            let restored = self.registry.version();
            self.persisted_version.store(restored, Ordering::SeqCst);
            self.generated_version.store(restored, Ordering::SeqCst);
        }
        if let Some(previous) = load_status(&store)? {
            let mut status = self.status.lock();
            status.last_successful_cycle = previous.last_successful_cycle;
            status.last_successful_at = previous.last_successful_at;
            status.probe_faults = previous.probe_faults;
        }
        self.store = Some(Arc::new(store));
        Ok(self)
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.event_bus
    }

    pub fn state(&self) -> OrchestratorState {
        *self.state.read()
    }

    /// Number of the last cycle started.
    pub fn current_cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: OrchestratorState) {
        let mut state = self.state.write();
        let from = *state;
        if from != next {
            debug!(category = "engine", from = %from, to = %next, "State transition");
            *state = next;
        }
    }

    /// Swap the probe set; takes effect on the next cycle.
    pub async fn replace_probes(&self, probes: Vec<ProtocolProbe>) {
        let probes: Vec<Arc<ProtocolProbe>> = probes.into_iter().map(Arc::new).collect();
        info!(category = "engine", probes = probes.len(), "Probe set replaced");
        *self.probes.write().await = probes;
    }

    /// Artifacts for the current registry view, regardless of what changed.
    pub fn artifacts(&self) -> BTreeMap<String, GroupArtifacts> {
        build_all(&self.registry.get_current_view(), &self.config.artifacts)
    }

    fn publish(&self, event: DiscoveryEvent, run_id: &str) {
        self.event_bus
            .publish_with_metadata(event, EventMetadata::new("orchestrator").with_correlation_id(run_id));
    }

    /// Run one full cycle.
    ///
    /// Only a catastrophic failure is returned as an error; it is published
    /// as a fatal event and schedules a backoff.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let _guard = self.cycle_lock.lock().await;
        if self.state() == OrchestratorState::Shutdown {
            return Err(Error::Internal("orchestrator is shut down".to_string()));
        }
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let run_id = uuid::Uuid::new_v4().to_string();

        match self.execute_cycle(cycle, &run_id).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.record_failure(cycle, &run_id, &e);
                Err(e)
            }
        }
    }

    async fn execute_cycle(&self, cycle: u64, run_id: &str) -> Result<CycleReport> {
        let started = Instant::now();
        let started_at = now_millis();
        let probes = self.probes.read().await.clone();

        self.set_state(OrchestratorState::Scanning);
        info!(category = "engine", cycle, probes = probes.len(), "Cycle started");
        self.publish(
            DiscoveryEvent::CycleStarted {
                cycle,
                run_id: run_id.to_string(),
                probes: probes.len(),
                timestamp: started_at,
            },
            run_id,
        );
        let outcomes = self.scan_all(&probes).await;

        self.set_state(OrchestratorState::Merging);
        let mut report = CycleReport {
            cycle,
            run_id: run_id.to_string(),
            started_at,
            duration_ms: 0,
            probes: Vec::with_capacity(outcomes.len()),
            changed: false,
            degraded: false,
            devices: 0,
            tags: 0,
            unclassified: 0,
            reclassified: 0,
            stale: Vec::new(),
            purged: Vec::new(),
            generated_groups: Vec::new(),
            removed_groups: Vec::new(),
            faults: Vec::new(),
        };
        self.merge(cycle, run_id, &outcomes, &mut report);
        // Deltas are relative to the last saved and last generated versions;
        // a failed save or write stays pending until one succeeds.
        let version = self.registry.version();
        report.changed = version != self.generated_version.load(Ordering::SeqCst);

        if let Some(store) = &self.store {
            if version != self.persisted_version.load(Ordering::SeqCst) {
                store.save(&self.registry.snapshot(cycle))?;
                self.persisted_version.store(version, Ordering::SeqCst);
            }
        }

        let failed = report.failed_probes().len();
        report.degraded =
            !probes.is_empty() && failed as f64 / probes.len() as f64 > self.config.cycle.degraded_fraction;
        if report.degraded {
            let failed_probes: Vec<String> = report.failed_probes().into_iter().map(str::to_string).collect();
            warn!(
                category = "engine",
                cycle,
                failed = failed_probes.len(),
                total = probes.len(),
                "Cycle degraded"
            );
            self.publish(
                DiscoveryEvent::Degraded {
                    cycle,
                    failed_probes,
                    total_probes: probes.len(),
                    timestamp: now_millis(),
                },
                run_id,
            );
        }

        let view = self.registry.get_current_view();
        if report.changed {
            self.set_state(OrchestratorState::Generating);
            if self.generate(cycle, run_id, &view, &mut report) {
                self.generated_version.store(version, Ordering::SeqCst);
            }
        } else {
            debug!(category = "engine", cycle, "No registry delta, generation skipped");
        }

        report.devices = view.devices.len();
        report.tags = view.tags.len();
        report.unclassified = view.unclassified_device_count();
        report.duration_ms = started.elapsed().as_millis() as u64;

        {
            let mut status = self.status.lock();
            status.cycles_run += 1;
            status.last_successful_cycle = Some(cycle);
            status.last_successful_at = Some(now_millis());
            status.consecutive_failures = 0;
            status.last_error = None;
        }
        self.set_state(if report.degraded {
            OrchestratorState::Degraded
        } else {
            OrchestratorState::Idle
        });
        self.persist_status()?;
        info!(
            category = "engine",
            cycle,
            changed = report.changed,
            devices = report.devices,
            tags = report.tags,
            unclassified = report.unclassified,
            duration_ms = report.duration_ms,
            "Cycle completed"
        );
        self.publish(
            DiscoveryEvent::CycleCompleted {
                cycle,
                changed: report.changed,
                devices: report.devices,
                tags: report.tags,
                unclassified: report.unclassified,
                duration_ms: report.duration_ms,
                timestamp: now_millis(),
            },
            run_id,
        );
        Ok(report)
    }

    /// Scan every probe concurrently until all finish or the cycle timeout
    /// elapses. Probes still running are dropped and whatever they pushed is
    /// returned as a timed-out outcome.
    async fn scan_all(&self, probes: &[Arc<ProtocolProbe>]) -> Vec<ScanOutcome> {
        let started = Instant::now();
        let sinks: Vec<ScanSink> = probes.iter().map(|_| ScanSink::new()).collect();
        let mut outcomes: Vec<Option<ScanOutcome>> = vec![None; probes.len()];

        let mut pending: FuturesUnordered<_> = probes
            .iter()
            .zip(&sinks)
            .enumerate()
            .map(|(i, (probe, sink))| async move { (i, probe.scan_with_sink(probe.timeout(), sink.clone()).await) })
            .collect();
        let collect = async {
            while let Some((i, outcome)) = pending.next().await {
                outcomes[i] = Some(outcome);
            }
        };
        if tokio::time::timeout(self.config.cycle.cycle_timeout(), collect).await.is_err() {
            warn!(
                category = "engine",
                timeout_secs = self.config.cycle.cycle_timeout_secs,
                "Cycle timeout reached, cutting off slow probes"
            );
        }
        drop(pending);

        outcomes
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| outcome.unwrap_or_else(|| ScanOutcome::cut_off(&probes[i], &sinks[i], started.elapsed())))
            .collect()
    }

    fn merge(&self, cycle: u64, run_id: &str, outcomes: &[ScanOutcome], report: &mut CycleReport) {
        let mut seen = HashSet::new();
        let mut faulted = HashSet::new();

        for outcome in outcomes {
            let faults: Vec<&Fault> = outcome.fault.iter().chain(&outcome.device_faults).collect();
            if outcome.failed() {
                faulted.insert(outcome.probe.clone());
            }
            *self
                .status
                .lock()
                .probe_faults
                .entry(outcome.probe.clone())
                .or_default() += faults.len() as u64;
            for fault in faults {
                self.publish(
                    DiscoveryEvent::ProbeFault {
                        cycle,
                        probe: outcome.probe.clone(),
                        kind: fault.kind,
                        message: fault.message.clone(),
                        timestamp: fault.at,
                    },
                    run_id,
                );
                report.faults.push(fault.clone());
            }

            let elapsed_ms = outcome.elapsed.as_millis() as u64;
            self.publish(
                DiscoveryEvent::ProbeCompleted {
                    cycle,
                    probe: outcome.probe.clone(),
                    devices: outcome.records.len(),
                    duration_ms: elapsed_ms,
                    timestamp: now_millis(),
                },
                run_id,
            );
            report.probes.push(ProbeSummary {
                probe: outcome.probe.clone(),
                devices: outcome.records.len(),
                elapsed_ms,
                fault: outcome.fault.clone(),
            });

            for record in &outcome.records {
                seen.insert(record.id.clone());
                self.merge_record(run_id, record, report);
            }
        }

        for (device_id, missed_cycles) in self.registry.record_cycle_miss(&seen, &faulted) {
            self.publish(
                DiscoveryEvent::DeviceStale {
                    device_id: device_id.clone(),
                    missed_cycles,
                    timestamp: now_millis(),
                },
                run_id,
            );
            report.stale.push(device_id);
        }
        for device_id in self.registry.purge_stale(self.config.registry.purge_after()) {
            self.publish(
                DiscoveryEvent::DevicePurged {
                    device_id: device_id.clone(),
                    timestamp: now_millis(),
                },
                run_id,
            );
            report.purged.push(device_id);
        }

        for fault in self.registry.rebuild_tags(&self.namespace) {
            warn!(category = "engine", kind = %fault.kind, message = %fault.message, "Namespace fault");
            report.faults.push(fault);
        }
    }

    /// Profile and classify every channel of one record, then hand the
    /// proposals to the registry.
    fn merge_record(&self, run_id: &str, record: &DeviceRecord, report: &mut CycleReport) {
        self.registry.upsert_device(record.clone());

        for channel in &record.channels {
            let profile = self.profiler.profile(&record.id, channel);
            if let Some(drift) = self.registry.record_profile(profile.clone()) {
                info!(
                    category = "engine",
                    device = %record.id,
                    channel = %channel.name,
                    previous_mean = drift.previous_mean,
                    current_mean = drift.current_mean,
                    "Signal drift detected"
                );
                self.publish(
                    DiscoveryEvent::DriftDetected {
                        device_id: record.id.clone(),
                        channel: channel.name.clone(),
                        previous_mean: drift.previous_mean,
                        current_mean: drift.current_mean,
                        timestamp: now_millis(),
                    },
                    run_id,
                );
            }

            let (classification, fault) = self.classifier.classify(record, channel, &profile);
            if let Some(fault) = fault {
                debug!(category = "engine", device = %record.id, channel = %channel.name, "{}", fault.message);
                report.faults.push(fault);
            }
            let (to, confidence) = (classification.sensor_type.to_string(), classification.confidence);
            if let ClassificationMerge::Replaced { from } = self.registry.upsert_classification(classification) {
                report.reclassified += 1;
                self.publish(
                    DiscoveryEvent::Reclassified {
                        device_id: record.id.clone(),
                        channel: channel.name.clone(),
                        from: from.to_string(),
                        to,
                        confidence,
                        timestamp: now_millis(),
                    },
                    run_id,
                );
            }
        }
    }

    /// Returns false when the artifacts could not be produced or written; the
    /// next cycle generates again.
    fn generate(&self, cycle: u64, run_id: &str, view: &CurrentView, report: &mut CycleReport) -> bool {
        let generation = match self.generator.generate(view) {
            Ok(generation) => generation,
            Err(e) => {
                warn!(category = "engine", cycle, error = %e, "Artifact generation failed");
                return false;
            }
        };
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.apply(&generation) {
                warn!(
                    category = "engine",
                    cycle,
                    error = %e,
                    pending_removals = generation.removed.len(),
                    "Writing artifacts failed"
                );
                self.generator.reject(&generation);
                return false;
            }
        }

        report.generated_groups = generation.changed.iter().map(|g| g.group_id.clone()).collect();
        report.removed_groups = generation.removed.clone();
        if !generation.is_empty() {
            info!(
                category = "engine",
                cycle,
                changed = report.generated_groups.len(),
                removed = report.removed_groups.len(),
                unchanged = generation.unchanged,
                "Artifacts regenerated"
            );
            self.publish(
                DiscoveryEvent::ArtifactsGenerated {
                    cycle,
                    groups: report.generated_groups.clone(),
                    removed_groups: report.removed_groups.clone(),
                    timestamp: now_millis(),
                },
                run_id,
            );
        }
        true
    }

    /// Write the status document to the store and the status file.
    fn persist_status(&self) -> Result<()> {
        let status = self.status();
        if let Some(store) = &self.store {
            store.put_meta(STATUS_DOCUMENT, &status)?;
        }
        if let Some(file) = &self.status_file {
            file.write(&status)?;
        }
        Ok(())
    }

    fn record_failure(&self, cycle: u64, run_id: &str, e: &Error) {
        let backoff = {
            let mut status = self.status.lock();
            status.cycles_run += 1;
            status.last_error = Some(e.to_string());
            if !e.is_catastrophic() {
                None
            } else {
                status.consecutive_failures += 1;
                status.backoff_remaining =
                    backoff_cycles(status.consecutive_failures, self.config.cycle.max_backoff_cycles);
                Some(status.backoff_remaining)
            }
        };
        self.set_state(OrchestratorState::Degraded);
        if let Some(file) = &self.status_file {
            if let Err(status_err) = file.write(&self.status()) {
                warn!(category = "engine", error = %status_err, "Could not write status file");
            }
        }

        match backoff {
            Some(backoff_cycles) => {
                error!(category = "engine", cycle, error = %e, backoff_cycles, "Cycle aborted");
                self.publish(
                    DiscoveryEvent::Fatal {
                        cycle,
                        error: e.to_string(),
                        backoff_cycles,
                        timestamp: now_millis(),
                    },
                    run_id,
                );
            }
            None => warn!(category = "engine", cycle, error = %e, "Cycle failed"),
        }
    }

    /// One scheduled tick: run a cycle unless a backoff is pending.
    pub async fn tick(&self) -> Option<CycleReport> {
        {
            let mut status = self.status.lock();
            if status.backoff_remaining > 0 {
                status.backoff_remaining -= 1;
                info!(
                    category = "engine",
                    remaining = status.backoff_remaining,
                    "Skipping cycle after fatal error"
                );
                return None;
            }
        }
        self.run_cycle().await.ok()
    }

    /// Drive cycles on the configured interval until `shutdown` flips to true
    /// or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.config.cycle.interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            category = "engine",
            interval_secs = self.config.cycle.interval_secs,
            "Discovery loop started"
        );

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    self.tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&self) {
        self.set_state(OrchestratorState::Shutdown);
        info!(category = "engine", cycles = self.current_cycle(), "Discovery loop stopped");
    }

    pub fn status(&self) -> StatusReport {
        let view = self.registry.get_current_view();
        let status = self.status.lock();
        StatusReport {
            state: Some(self.state()),
            cycles_run: status.cycles_run,
            last_successful_cycle: status.last_successful_cycle,
            last_successful_at: status.last_successful_at,
            registry_version: view.version,
            devices: view.devices.len(),
            stale_devices: view.devices.iter().filter(|d| d.stale).count(),
            tags: view.tags.len(),
            unclassified_devices: view.unclassified_device_count(),
            registry_conflicts: self.registry.conflict_count(),
            probe_faults: status.probe_faults.clone(),
            backoff_remaining: status.backoff_remaining,
            last_error: status.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldscan_core::EventBus;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let steps: Vec<u32> = (0..7).map(|n| backoff_cycles(n, 8)).collect();
        assert_eq!(steps, vec![0, 1, 2, 4, 8, 8, 8]);
        assert_eq!(backoff_cycles(40, 8), 8);
    }

    #[tokio::test]
    async fn test_cycle_without_probes() {
        let orchestrator = Orchestrator::new(DiscoveryConfig::default(), Vec::new(), Arc::new(EventBus::new()));
        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.cycle, 1);
        assert!(!report.changed);
        assert!(!report.degraded);
        assert_eq!(orchestrator.state(), OrchestratorState::Idle);
        assert_eq!(orchestrator.status().last_successful_cycle, Some(1));
    }

    #[tokio::test]
    async fn test_no_cycle_after_shutdown() {
        let orchestrator = Orchestrator::new(DiscoveryConfig::default(), Vec::new(), Arc::new(EventBus::new()));
        orchestrator.shutdown();
        assert!(orchestrator.run_cycle().await.is_err());
        assert_eq!(orchestrator.state(), OrchestratorState::Shutdown);
        assert_eq!(orchestrator.current_cycle(), 0);
    }
}
