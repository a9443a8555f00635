//! Slice-based window operator.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::{Mutex, RwLock};

use super::{OperatorError, SliceProbe, TerminationType, TriggerChecker, WindowMetaData};
use crate::buffer::{Buffer, BufferProvider, Record, RecordBuffer};
use crate::config::WindowOperatorConfig;
use crate::sequence::Sequencer;
use crate::slice::{
    self, CacheMetrics, JoinSide, Slice, SliceAssigner, SliceCache, SliceError, SliceLifecycle,
    SliceRef, SliceStore, SliceWriteGuard,
};
use crate::time::{
    build_predictor, min_estimated_watermark, MultiOriginWatermarkProcessor, SharedPredictor,
    Watermark, WatermarkCheckpoint, WatermarkSample,
};
use crate::{Error, OriginId, Result, Timestamp};

/// Upper bound on slices created by one [`WindowOperator::prewarm`] call.
const MAX_PREWARM_SLICES: usize = 1024;

/// Removal attempts on a sealed slice before its writers are reported.
const MAX_REMOVE_ATTEMPTS: usize = 256;

/// Counters for dropped late records.
#[derive(Debug, Default)]
pub struct LateDataMetrics {
    behind_watermark: AtomicU64,
    closed_slice: AtomicU64,
}

impl LateDataMetrics {
    /// Total late records dropped.
    #[must_use]
    pub fn late_records_total(&self) -> u64 {
        self.dropped_behind_watermark() + self.dropped_closed_slice()
    }

    /// Records dropped because their timestamp was below the last trigger watermark.
    #[must_use]
    pub fn dropped_behind_watermark(&self) -> u64 {
        self.behind_watermark.load(Ordering::Relaxed)
    }

    /// Records dropped because their slice was already triggered.
    #[must_use]
    pub fn dropped_closed_slice(&self) -> u64 {
        self.closed_slice.load(Ordering::Relaxed)
    }

    /// Resets all counters to zero.
    pub fn reset(&self) {
        self.behind_watermark.store(0, Ordering::Relaxed);
        self.closed_slice.store(0, Ordering::Relaxed);
    }

    fn record_behind_watermark(&self) {
        self.behind_watermark.fetch_add(1, Ordering::Relaxed);
    }

    fn record_closed_slice(&self) {
        self.closed_slice.fetch_add(1, Ordering::Relaxed);
    }
}

/// A buffer waiting in the sequencer.
#[derive(Debug)]
struct SequencedInput {
    side: Option<JoinSide>,
    buffer: RecordBuffer,
}

/// Slice-based window operator for aggregations and stream joins.
///
/// One instance is shared by all worker threads of an operator; every method
/// takes `&self`. `worker` arguments select the worker's slice cache and may
/// be any value (taken modulo the configured worker count).
///
/// # Watermark and trigger ordering
///
/// A buffer's records are written before its watermark is applied. Slices
/// whose end the global watermark reaches are triggered once, emitted to the
/// probe in ascending end order and marked flushed. Flushed slices stay
/// readable until no window needs them anymore (immediately for tumbling
/// windows).
///
/// # Example
///
/// ```rust
/// use laminar_slicing::buffer::{Record, RecordBuffer};
/// use laminar_slicing::config::WindowOperatorConfig;
/// use laminar_slicing::operator::{CollectingProbe, TerminationType, WindowOperator};
/// use laminar_slicing::sequence::SequenceData;
/// use laminar_slicing::OriginId;
///
/// let config = WindowOperatorConfig::builder().tumbling(10).build()?;
/// let operator = WindowOperator::new(config, CollectingProbe::default());
/// operator.create_origin(OriginId(1));
///
/// // Sequence 2 arrives first and waits for sequence 1.
/// let late = RecordBuffer::new(OriginId(1), SequenceData::single(2), 25)
///     .with_records(vec![Record::new(14, 1, 4)]);
/// let early = RecordBuffer::new(OriginId(1), SequenceData::single(1), 9)
///     .with_records(vec![Record::new(2, 1, 1)]);
/// operator.submit(0, late)?;
/// assert!(operator.probe().emitted().is_empty());
///
/// operator.submit(0, early)?;
/// assert_eq!(operator.probe().emitted().len(), 2);
///
/// operator.terminate(TerminationType::Graceful)?;
/// assert!(operator.store().is_empty());
/// # Ok::<(), laminar_slicing::Error>(())
/// ```
#[derive(Debug)]
pub struct WindowOperator<P> {
    config: WindowOperatorConfig,
    probe: P,
    store: SliceStore,
    trigger: TriggerChecker,
    watermarks: MultiOriginWatermarkProcessor,
    sequencer: Sequencer<SequencedInput>,
    predictors: RwLock<FxHashMap<OriginId, SharedPredictor>>,
    caches: Box<[Mutex<SliceCache>]>,
    late: LateDataMetrics,
    terminated: AtomicBool,
}

impl<P: SliceProbe> WindowOperator<P> {
    /// Creates an operator. `config` is expected to be validated, as
    /// [`WindowOperatorConfigBuilder::build`](crate::config::WindowOperatorConfigBuilder::build) does.
    #[must_use]
    pub fn new(config: WindowOperatorConfig, probe: P) -> Self {
        let assigner = SliceAssigner::new(config.window);
        let caches = (0..config.worker_threads.max(1))
            .map(|_| Mutex::new(SliceCache::new(&config.slice_cache)))
            .collect();
        Self {
            store: SliceStore::new(assigner, config.slice_kind, config.partitions),
            trigger: TriggerChecker::new(assigner),
            watermarks: MultiOriginWatermarkProcessor::new(config.max_pending_sequences),
            sequencer: Sequencer::new(config.max_pending_sequences),
            predictors: RwLock::new(FxHashMap::default()),
            caches,
            late: LateDataMetrics::default(),
            terminated: AtomicBool::new(false),
            config,
            probe,
        }
    }

    /// Validates `config` and creates an operator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn try_new(config: WindowOperatorConfig, probe: P) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config, probe))
    }

    /// Operator configuration.
    #[must_use]
    pub fn config(&self) -> &WindowOperatorConfig {
        &self.config
    }

    /// The downstream probe.
    #[must_use]
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// The slice store.
    #[must_use]
    pub fn store(&self) -> &SliceStore {
        &self.store
    }

    /// Global watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        self.watermarks.current_watermark()
    }

    /// Active origins, ordered by id.
    #[must_use]
    pub fn origins(&self) -> Vec<OriginId> {
        self.watermarks.origins()
    }

    /// Late-data counters.
    #[must_use]
    pub fn late_data_metrics(&self) -> &LateDataMetrics {
        &self.late
    }

    /// Cache counters of one worker.
    #[must_use]
    pub fn cache_metrics(&self, worker: usize) -> CacheMetrics {
        self.cache(worker).lock().metrics()
    }

    /// Returns `true` once [`terminate`](Self::terminate) was called.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Registers an origin. Returns `false` if it already exists.
    pub fn create_origin(&self, origin: OriginId) -> bool {
        let created = self.watermarks.create_origin(origin);
        if created {
            if let Some(predictor) = build_predictor(&self.config.predictor) {
                self.predictors
                    .write()
                    .insert(origin, SharedPredictor::new(predictor));
            }
        }
        created
    }

    /// Removes a terminated origin and triggers whatever its removal unblocks.
    ///
    /// Buffers of the origin still waiting in the sequencer are discarded.
    ///
    /// # Errors
    ///
    /// - [`Error::Time`] if the origin is not active
    /// - [`Error::Operator`] if the probe rejects a triggered slice
    pub fn remove_origin(&self, origin: OriginId) -> Result<Watermark> {
        let global = self.watermarks.remove_origin(origin)?;
        self.sequencer.remove_origin(origin);
        self.predictors.write().remove(&origin);
        self.fire(global)?;
        Ok(global)
    }

    /// Processes an in-order aggregation buffer and returns the global watermark.
    ///
    /// # Errors
    ///
    /// - [`Error::Time`] for unknown or removed origins, invalid sequence
    ///   positions and watermark regressions
    /// - [`Error::Slice`] if the operator holds join slices
    /// - [`Error::Operator`] if the probe rejects a triggered slice or the
    ///   operator is terminated
    pub fn process(&self, worker: usize, buffer: &RecordBuffer) -> Result<Watermark> {
        self.ingest(worker, buffer, |guard, record| guard.aggregate(record))
    }

    /// Processes an in-order buffer for one join side and returns the global watermark.
    ///
    /// # Errors
    ///
    /// As [`process`](Self::process); [`Error::Slice`] if the operator holds
    /// aggregation slices.
    pub fn process_join(
        &self,
        worker: usize,
        side: JoinSide,
        buffer: &RecordBuffer,
    ) -> Result<Watermark> {
        self.ingest(worker, buffer, |guard, record| guard.append(side, record))
    }

    /// Sequences an aggregation buffer and processes everything it releases.
    ///
    /// # Errors
    ///
    /// - [`Error::Sequence`] for invalid positions or a full backlog
    /// - the first error of [`process`](Self::process) among released
    ///   buffers; the buffers after it are still processed
    pub fn submit(&self, worker: usize, buffer: RecordBuffer) -> Result<Watermark> {
        self.submit_input(worker, None, buffer)
    }

    /// Sequences a join buffer and processes everything it releases.
    ///
    /// # Errors
    ///
    /// As [`submit`](Self::submit).
    pub fn submit_join(
        &self,
        worker: usize,
        side: JoinSide,
        buffer: RecordBuffer,
    ) -> Result<Watermark> {
        self.submit_input(worker, Some(side), buffer)
    }

    /// Pre-creates the slices the watermark is predicted to reach by
    /// `wall_clock + horizon` and returns how many slices cover that range.
    ///
    /// Does nothing when prediction is disabled or no origin has reported yet.
    ///
    /// # Errors
    ///
    /// [`Error::Operator`] if the operator is terminated.
    pub fn prewarm(&self, wall_clock: u64, horizon: u64) -> Result<usize> {
        self.ensure_running()?;
        let predicted = min_estimated_watermark(
            self.predictors.read().values(),
            wall_clock.saturating_add(horizon),
        );
        let Some(predicted) = predicted else {
            return Ok(0);
        };

        let mut ts = self
            .current_watermark()
            .max(self.trigger.last_watermark())
            .timestamp();
        let mut covered = 0;
        while ts < predicted && covered < MAX_PREWARM_SLICES {
            let slice = self.store.get_or_create_slice(ts)?;
            ts = slice.end();
            covered += 1;
        }
        tracing::debug!(predicted, covered, "pre-warmed slices");
        Ok(covered)
    }

    /// Flushes and drops all state.
    ///
    /// The store is closed first, so no slice can be created behind the
    /// flush. Each drained slice is claimed before it is emitted: open slices
    /// by sealing them, triggered slices only if the probe rejected them
    /// earlier. A slice another thread is still emitting is left to it.
    ///
    /// Afterwards the store is empty and closed, every cache is cleared and
    /// every further call fails with [`OperatorError::Terminated`].
    ///
    /// # Errors
    ///
    /// - [`OperatorError::Terminated`] if called twice
    /// - [`OperatorError::Termination`] carrying every probe failure and, for
    ///   [`TerminationType::Graceful`], every slice that still had a writer
    pub fn terminate(&self, termination: TerminationType) -> Result<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Err(OperatorError::Terminated.into());
        }
        let watermark = self.trigger.last_watermark().max(self.current_watermark());
        let drained = self.store.close();
        tracing::info!(?termination, %watermark, slices = drained.len(), "terminating window operator");

        let mut failures: Vec<Error> = Vec::new();
        let mut flushed = 0usize;
        if termination != TerminationType::HardStop {
            for slice in &drained {
                if !slice.seal() && !slice.take_emit_failure() {
                    continue;
                }
                let writers = slice.in_flight_writers();
                if writers > 0 {
                    let (start, end) = slice.interval();
                    if termination == TerminationType::Graceful {
                        failures.push(SliceError::WritersInFlight { start, end, writers }.into());
                    } else {
                        tracing::warn!(slice_start = start, slice_end = end, writers, "flushing slice with writers in flight");
                    }
                }
                let meta = self.trigger.metadata(slice, watermark, true);
                match self.emit(slice, &meta) {
                    Ok(()) => flushed += 1,
                    Err(e) => failures.push(e),
                }
            }
        }

        for cache in &*self.caches {
            cache.lock().clear();
        }
        for origin in self.sequencer.origins() {
            self.sequencer.remove_origin(origin);
        }
        tracing::info!(
            ?termination,
            drained = drained.len(),
            flushed,
            failures = failures.len(),
            "window operator terminated"
        );

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OperatorError::Termination { failures }.into())
        }
    }

    /// Moves the open slices overlapping `[start_ts, stop_ts)` out of this operator.
    ///
    /// A slice is selected if it starts in the range or ends strictly inside
    /// it. Only slices still `Open` are taken: triggered and flushed slices
    /// already went to the probe here and stay behind until they expire.
    /// Selected slices are serialized into buffers taken from `provider` and
    /// removed from the store; the caller releases the buffers.
    ///
    /// # Errors
    ///
    /// - [`Error::Slice`] if a selected slice has a writer in flight
    /// - [`Error::Buffer`] if the provider runs out of buffers
    ///
    /// On error the selected slices stay in the store, accept writes again
    /// and every buffer taken so far is back with `provider`.
    pub fn state_to_migrate(
        &self,
        start_ts: Timestamp,
        stop_ts: Timestamp,
        provider: &dyn BufferProvider,
    ) -> Result<Vec<Buffer>> {
        self.ensure_running()?;
        // Sealing claims a slice against concurrent triggers.
        let selected: Vec<Arc<Slice>> = self
            .store
            .get_all_slices()
            .into_iter()
            .filter(|s| slice::selected_for_migration(s.start(), s.end(), start_ts, stop_ts))
            .filter(|s| s.seal())
            .collect();
        let reopen = |slices: &[Arc<Slice>]| {
            for slice in slices {
                slice.reopen();
            }
        };

        if let Some(busy) = selected.iter().find(|s| s.in_flight_writers() > 0) {
            let err = SliceError::WritersInFlight {
                start: busy.start(),
                end: busy.end(),
                writers: busy.in_flight_writers(),
            };
            reopen(&selected);
            return Err(err.into());
        }

        let snapshots: Vec<_> = selected.iter().map(|s| s.snapshot()).collect();
        let written = slice::encode_slices(&snapshots)
            .map_err(Error::from)
            .and_then(|bytes| Ok(slice::write_frame(provider, &bytes)?));
        let buffers = match written {
            Ok(buffers) => buffers,
            Err(e) => {
                reopen(&selected);
                return Err(e);
            }
        };

        for (removed, slice) in selected.iter().enumerate() {
            if let Err(e) = self.remove_sealed(slice.start()) {
                for buffer in buffers {
                    provider.release(buffer);
                }
                self.reinstate(&snapshots[..removed]);
                reopen(&selected[removed..]);
                return Err(e.into());
            }
        }
        tracing::info!(
            start_ts,
            stop_ts,
            slices = selected.len(),
            buffers = buffers.len(),
            "migrated slice state"
        );
        Ok(buffers)
    }

    /// Inserts or merges slices produced by [`state_to_migrate`](Self::state_to_migrate)
    /// and returns how many were restored.
    ///
    /// The frame is applied all or nothing: every snapshot is checked and a
    /// writer slot is held on every target before the first merge, so a
    /// failed restore can be retried without counting anything twice.
    /// Restored slices the watermark already passed are triggered right away.
    ///
    /// # Errors
    ///
    /// - [`Error::Buffer`] / [`Error::Slice`] if the buffers do not hold a valid frame
    /// - [`Error::Slice`] if a snapshot does not fit this operator's slices or
    ///   its target slice was already triggered
    pub fn restore_state(&self, buffers: &[Buffer]) -> Result<usize> {
        self.ensure_running()?;
        let bytes = slice::read_frame(buffers)?;
        let snapshots = slice::decode_slices(&bytes)?;

        let kind = self.store.kind();
        for snapshot in &snapshots {
            let (start, end) = (snapshot.start, snapshot.end);
            let (expected_start, expected_end) = self.store.assigner().slice_bounds(start);
            if (expected_start, expected_end) != (start, end) {
                return Err(SliceError::BoundsMismatch {
                    start,
                    end,
                    expected_start,
                    expected_end,
                }
                .into());
            }
            if snapshot.content.kind() != kind {
                return Err(SliceError::KindMismatch { start, end, expected: kind }.into());
            }
            if let Some(existing) = self.store.get_slice(start) {
                if existing.lifecycle() != SliceLifecycle::Open {
                    return Err(SliceError::Closed { start, end }.into());
                }
            }
        }

        let targets = snapshots
            .iter()
            .map(|s| self.store.get_or_insert_exact(s.start, s.end))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let guards = targets
            .iter()
            .map(|t| t.begin_write())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (guard, snapshot) in guards.iter().zip(&snapshots) {
            guard.restore(snapshot)?;
        }
        drop(guards);

        tracing::info!(slices = snapshots.len(), "restored slice state");
        self.fire(self.current_watermark())?;
        Ok(snapshots.len())
    }

    /// Captures the watermark state of every origin.
    #[must_use]
    pub fn checkpoint_watermarks(&self) -> WatermarkCheckpoint {
        self.watermarks.checkpoint()
    }

    /// Replaces the watermark state and triggers what the restored watermark closes.
    ///
    /// Each checkpointed origin resumes sequencing at its checkpointed
    /// position; buffers still waiting in the sequencer are discarded and
    /// origins missing from the checkpoint are forgotten.
    ///
    /// # Errors
    ///
    /// - [`Error::Time`] if the checkpoint is inconsistent
    /// - [`Error::Operator`] if the probe rejects a triggered slice
    pub fn restore_watermarks(&self, checkpoint: WatermarkCheckpoint) -> Result<Watermark> {
        let positions: FxHashMap<OriginId, u64> = checkpoint
            .origins
            .iter()
            .map(|o| (o.origin, o.next_sequence))
            .collect();
        let global = self.watermarks.restore(checkpoint)?;

        for origin in self.sequencer.origins() {
            if !positions.contains_key(&origin) {
                self.sequencer.remove_origin(origin);
            }
        }
        for (&origin, &next_sequence) in &positions {
            self.sequencer.reset_origin(origin, next_sequence);
        }

        {
            let mut predictors = self.predictors.write();
            predictors.retain(|origin, _| positions.contains_key(origin));
            for &origin in positions.keys() {
                if predictors.contains_key(&origin) {
                    continue;
                }
                if let Some(predictor) = build_predictor(&self.config.predictor) {
                    predictors.insert(origin, SharedPredictor::new(predictor));
                }
            }
        }
        self.fire(global)?;
        Ok(global)
    }

    // ── Internals ──

    fn ensure_running(&self) -> Result<()> {
        if self.is_terminated() {
            return Err(OperatorError::Terminated.into());
        }
        Ok(())
    }

    fn cache(&self, worker: usize) -> &Mutex<SliceCache> {
        &self.caches[worker % self.caches.len()]
    }

    fn submit_input(
        &self,
        worker: usize,
        side: Option<JoinSide>,
        buffer: RecordBuffer,
    ) -> Result<Watermark> {
        self.ensure_running()?;
        self.watermarks.check_origin(buffer.origin)?;
        let (origin, sequence) = (buffer.origin, buffer.sequence);
        let released = self
            .sequencer
            .submit(origin, sequence, SequencedInput { side, buffer })?;

        // Released buffers are gone from the sequencer: each one is processed
        // even if an earlier one failed.
        let mut first_error = None;
        for (_, input) in released {
            let processed = match input.side {
                None => self.process(worker, &input.buffer),
                Some(side) => self.process_join(worker, side, &input.buffer),
            };
            if let Err(e) = processed {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or_else(|| Ok(self.current_watermark()), Err)
    }

    /// Writes a buffer's records, then applies its watermark.
    ///
    /// The watermark is applied even if a record failed to land, so the
    /// origin's sequence keeps moving; the write error wins over any error
    /// raised while advancing.
    fn ingest(
        &self,
        worker: usize,
        buffer: &RecordBuffer,
        write: impl Fn(&SliceWriteGuard<'_>, &Record) -> std::result::Result<(), SliceError>,
    ) -> Result<Watermark> {
        self.ensure_running()?;
        self.watermarks.check_origin(buffer.origin)?;

        let written = {
            let mut cache = self.cache(worker).lock();
            self.write_records(&mut cache, buffer, &write)
        };
        let advanced = self.advance(buffer);
        written.map_err(Error::from).and(advanced)
    }

    fn write_records(
        &self,
        cache: &mut SliceCache,
        buffer: &RecordBuffer,
        write: impl Fn(&SliceWriteGuard<'_>, &Record) -> std::result::Result<(), SliceError>,
    ) -> std::result::Result<(), SliceError> {
        let bound = self.trigger.last_watermark();
        let mut first_error = None;
        for record in &buffer.records {
            if bound.is_late(record.timestamp) {
                self.late.record_behind_watermark();
                tracing::warn!(
                    origin = %buffer.origin,
                    timestamp = record.timestamp,
                    watermark = %bound,
                    "dropping late record"
                );
                continue;
            }
            let written = self
                .slice_for(cache, record.timestamp)
                .and_then(|slice| {
                    let begun = slice.begin_write();
                    match begun {
                        Ok(guard) => write(&guard, record),
                        Err(SliceError::Closed { start, end }) => {
                            self.late.record_closed_slice();
                            tracing::warn!(
                                origin = %buffer.origin,
                                timestamp = record.timestamp,
                                slice_start = start,
                                slice_end = end,
                                "dropping record for closed slice"
                            );
                            Ok(())
                        }
                        Err(e) => Err(e),
                    }
                });
            if let Err(e) = written {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn slice_for(
        &self,
        cache: &mut SliceCache,
        timestamp: Timestamp,
    ) -> std::result::Result<Arc<Slice>, SliceError> {
        let start = self.store.assigner().slice_start(timestamp);
        if let Some(slice) = cache.lookup(start) {
            return Ok(slice);
        }
        let slice = self.store.get_or_create_slice(timestamp)?;
        cache.insert(start, SliceRef::new(&slice));
        Ok(slice)
    }

    fn advance(&self, buffer: &RecordBuffer) -> Result<Watermark> {
        let global =
            self.watermarks
                .update_watermark(buffer.watermark, buffer.sequence, buffer.origin)?;
        if let Some(predictor) = self.predictors.read().get(&buffer.origin) {
            if let Some(origin_watermark) = self.watermarks.origin_watermark(buffer.origin) {
                predictor.update(&[WatermarkSample::new(
                    buffer.ingestion_time,
                    origin_watermark.timestamp(),
                )]);
            }
        }
        self.fire(global)?;
        Ok(global)
    }

    /// Emits every slice `watermark` closes, then drops slices no window needs.
    ///
    /// All triggered slices are handed to the probe even if one fails; the
    /// first failure is returned.
    fn fire(&self, watermark: Watermark) -> Result<()> {
        let triggered = self
            .trigger
            .update_and_get_triggered_slices(&self.store, watermark);
        let mut first_error = None;
        for (slice, meta) in triggered {
            if let Err(e) = self.emit(&slice, &meta) {
                first_error.get_or_insert(e);
            }
        }
        self.evict_expired();
        first_error.map_or(Ok(()), Err)
    }

    fn emit(&self, slice: &Arc<Slice>, meta: &WindowMetaData) -> Result<()> {
        if let Err(source) = self.probe.emit(slice, meta) {
            slice.mark_emit_failed();
            tracing::error!(
                slice_start = slice.start(),
                slice_end = slice.end(),
                error = %source,
                "probe rejected slice"
            );
            return Err(OperatorError::Probe {
                start: slice.start(),
                end: slice.end(),
                source,
            }
            .into());
        }
        slice.mark_flushed();
        Ok(())
    }

    fn evict_expired(&self) {
        let watermark = self.trigger.last_watermark();
        for start in self.store.expired_by(watermark) {
            match self.store.remove_slice(start) {
                Ok(_) | Err(SliceError::NotFound { .. }) => {}
                Err(e) => tracing::debug!(slice_start = start, error = %e, "slice removal deferred"),
            }
        }
    }

    /// Removes a sealed slice. Writers that race with the seal back off
    /// immediately, so an in-flight count seen here is normally transient;
    /// one that outlasts [`MAX_REMOVE_ATTEMPTS`] is reported.
    fn remove_sealed(&self, start: Timestamp) -> std::result::Result<(), SliceError> {
        let mut attempts = 0;
        loop {
            match self.store.remove_slice(start) {
                Ok(_) | Err(SliceError::NotFound { .. }) => return Ok(()),
                Err(SliceError::WritersInFlight { .. }) if attempts < MAX_REMOVE_ATTEMPTS => {
                    attempts += 1;
                    if attempts % 16 == 0 {
                        std::thread::yield_now();
                    } else {
                        std::hint::spin_loop();
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Puts already removed slices back after a failed migration.
    fn reinstate(&self, snapshots: &[slice::SliceSnapshot]) {
        for snapshot in snapshots {
            let restored = self
                .store
                .get_or_insert_exact(snapshot.start, snapshot.end)
                .and_then(|target| target.restore(snapshot));
            if let Err(e) = restored {
                tracing::error!(
                    slice_start = snapshot.start,
                    slice_end = snapshot.end,
                    error = %e,
                    "failed to reinstate slice after aborted migration"
                );
            }
        }
    }
}
