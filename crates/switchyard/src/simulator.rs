//! The simulation engine: synchronous event dispatch, the propagation
//! engine, the time wheel for timed states, the four-phase init sequencer
//! and the `run_forever` lifecycle.
//!
//! Everything here runs on the cooperative scheduler. Event dispatch is
//! synchronous and runs to completion; suspension happens only in async
//! init/stop routines, main tasks and the simulation loop itself.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::block::{
    BlockCtx, BlockEntry, BlockId, BlockKind, CombEntry, ConnState, InputSignature, Inputs,
    Producer, SeqEntry, Slot, SlotValues,
};
use crate::circuit::Circuit;
use crate::error::{CircuitError, SimResult};
use crate::event::EventType;
use crate::value::{fmt_output, truthy, EventData, Value};

tokio::task_local! {
    static IN_SIM_TASK: ();
}

/// True when called from within the simulation task.
pub(crate) fn in_sim_task() -> bool {
    IN_SIM_TASK.try_with(|_| ()).is_ok()
}

// ---------------------------------------------------------------------
// Time wheel
// ---------------------------------------------------------------------

struct WheelEntry {
    deadline: tokio::time::Instant,
    seq: u64,
    block: BlockId,
    generation: u64,
    event: EventType,
}

impl PartialEq for WheelEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for WheelEntry {}

impl PartialOrd for WheelEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for WheelEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // reversed: BinaryHeap is a max-heap, we want the earliest deadline
        // on top; ties fire in scheduling order
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Min-heap of wake-up deadlines for timed states.
///
/// Cancellation does not remove heap entries: each scheduled entry carries
/// a per-block generation counter and stale entries are skipped on pop.
pub(crate) struct TimerWheel {
    heap: BinaryHeap<WheelEntry>,
    generations: HashMap<BlockId, u64>,
    seq: u64,
}

impl TimerWheel {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            generations: HashMap::new(),
            seq: 0,
        }
    }

    fn schedule(&mut self, block: BlockId, after: Duration, event: EventType) {
        let generation = self.generations.entry(block).or_insert(0);
        *generation += 1;
        let generation = *generation;
        self.seq += 1;
        self.heap.push(WheelEntry {
            deadline: tokio::time::Instant::now() + after,
            seq: self.seq,
            block,
            generation,
            event,
        });
    }

    fn cancel(&mut self, block: BlockId) {
        *self.generations.entry(block).or_insert(0) += 1;
    }

    fn is_stale(&self, entry: &WheelEntry) -> bool {
        self.generations.get(&entry.block).copied().unwrap_or(0) != entry.generation
    }

    fn next_deadline(&mut self) -> Option<tokio::time::Instant> {
        while let Some(top) = self.heap.peek() {
            if self.is_stale(top) {
                self.heap.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    fn pop_due(&mut self, now: tokio::time::Instant) -> Option<(BlockId, EventType)> {
        while let Some(top) = self.heap.peek() {
            if self.is_stale(top) {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                return None;
            }
            let entry = self.heap.pop().expect("peeked entry");
            return Some((entry.block, entry.event));
        }
        None
    }
}

/// A main task attached to a block's lifetime.
pub(crate) struct MainTaskHolder {
    pub id: BlockId,
    pub token: CancellationToken,
    pub handle: JoinHandle<()>,
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn output_event_data(previous: &Option<Value>, value: &Value) -> EventData {
    let mut data = EventData::new();
    data.insert("trigger".into(), json!("output"));
    if let Some(previous) = previous {
        data.insert("previous".into(), previous.clone());
    }
    data.insert("value".into(), value.clone());
    data
}

impl Circuit {
    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    pub(crate) fn schedule_block_timer(
        &self,
        id: BlockId,
        after: Duration,
        event: EventType,
    ) -> SimResult<()> {
        self.timers.lock().schedule(id, after, event);
        self.timer_notify.notify_waiters();
        Ok(())
    }

    pub(crate) fn cancel_block_timer(&self, id: BlockId) {
        self.timers.lock().cancel(id);
        self.timer_notify.notify_waiters();
    }

    fn fire_due_timers(self: &Arc<Self>) -> SimResult<()> {
        loop {
            let due = self.timers.lock().pop_due(tokio::time::Instant::now());
            let (block, event) = match due {
                Some(due) => due,
                None => return Ok(()),
            };
            if self.debug_enabled(block) {
                debug!(block = %self.block_name(block), event = %event, "timer fired");
            }
            self.deliver(block, &event, EventData::new())?;
        }
    }

    // ------------------------------------------------------------------
    // Event dispatch
    // ------------------------------------------------------------------

    /// Synchronously route an event to its destination's handler and
    /// return the handler's result.
    pub(crate) fn deliver(
        self: &Arc<Self>,
        id: BlockId,
        etype: &EventType,
        data: EventData,
    ) -> SimResult<Value> {
        let entry = self.entry(id)?;
        let seq = entry.seq().ok_or_else(|| CircuitError::TypeMismatch {
            name: entry.name.clone(),
            expected: "sequential",
            actual: entry.kind_name(),
        })?;
        let block_debug = entry.debug.load(Ordering::Relaxed);

        // resolve conditional events against the `value` item
        let mut current = etype.clone();
        let etype = loop {
            match current {
                EventType::Cond(cond) => {
                    let value_truthy = data.get("value").map(truthy).unwrap_or(false);
                    let branch = if value_truthy { cond.etrue } else { cond.efalse };
                    match branch {
                        Some(next) => {
                            if block_debug {
                                debug!(block = %entry.name, event = %next, "conditional event resolved");
                            }
                            current = *next;
                        }
                        // no event on this branch
                        None => return Ok(Value::Null),
                    }
                }
                other => break other,
            }
        };
        etype.validate()?;

        if block_debug {
            debug!(block = %entry.name, event = %etype, data = ?data, "got event");
        }
        if seq.event_active.swap(true, Ordering::SeqCst) {
            let err = CircuitError::RecursiveEvent {
                block: entry.name.clone(),
            };
            self.abort(err.clone());
            return Err(err);
        }
        let guard = ActiveGuard(&seq.event_active);
        let ctx = BlockCtx::new(self.clone(), id);
        let result = seq.logic.handle_event(&ctx, &etype, &data);
        drop(guard);

        match result {
            Ok(value) => {
                let sync_state = seq
                    .persist
                    .read()
                    .as_ref()
                    .map(|p| p.sync_state)
                    .unwrap_or(false);
                if sync_state {
                    self.save_persistent_state(id);
                }
                Ok(value)
            }
            Err(err) if err.is_unknown_event() => Err(err),
            Err(err) => {
                let err = err.in_block(&entry.name);
                // the internal state may be corrupted now
                if seq.persist.read().is_some() {
                    warn!(block = %entry.name, "disabling persistent state due to an error");
                    *seq.persist.write() = None;
                }
                self.abort(err.clone());
                Err(err)
            }
        }
    }

    /// A destination block may still be uninitialized when an event
    /// arrives during circuit initialization; run its remaining
    /// synchronous init steps first.
    pub(crate) fn ensure_init_for_event(self: &Arc<Self>, id: BlockId) -> SimResult<()> {
        let entry = self.entry(id)?;
        if let Some(seq) = entry.seq() {
            if seq.init_steps.load(Ordering::SeqCst) < 2 {
                if entry.debug.load(Ordering::Relaxed) {
                    debug!(block = %entry.name, "pending event, initializing early");
                }
                self.init_sblock(id, true)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Output assignment & propagation
    // ------------------------------------------------------------------

    /// Assign a sequential block's output.
    ///
    /// On change: record the value, notify the propagation engine and fire
    /// `on_output` events. `on_every_output` events fire on every call,
    /// but an unchanged value never propagates.
    pub(crate) fn set_output(self: &Arc<Self>, id: BlockId, value: Value) -> SimResult<()> {
        let entry = self.entry(id)?;
        let seq = entry.seq().ok_or_else(|| {
            CircuitError::InvalidState(format!(
                "set_output: {:?} is a combinational block",
                entry.name
            ))
        })?;
        let block_debug = entry.debug.load(Ordering::Relaxed);
        let previous = entry.output.read().clone();
        let changed = previous.as_ref() != Some(&value);
        if changed {
            if block_debug {
                debug!(
                    block = %entry.name,
                    from = %fmt_output(&previous),
                    to = %value,
                    "output"
                );
            }
            *entry.output.write() = Some(value.clone());
            if let Some(tx) = &*self.queue_tx.lock() {
                let _ = tx.send(id);
            }
            for event in &seq.on_output {
                event.send(self, id, output_event_data(&previous, &value))?;
            }
        } else {
            if seq.on_every_output.is_empty() {
                return Ok(());
            }
            if block_debug {
                debug!(block = %entry.name, value = %value, "output unchanged");
            }
        }
        for event in &seq.on_every_output {
            event.send(self, id, output_event_data(&previous, &value))?;
        }
        Ok(())
    }

    fn input_snapshot(&self, entry: &BlockEntry, comb: &CombEntry) -> SimResult<Inputs> {
        let resolved = match &*comb.inputs.read() {
            ConnState::Resolved(slots) => slots.clone(),
            _ => {
                return Err(CircuitError::InvalidState(format!(
                    "{:?}: inputs not resolved (circuit not finalized)",
                    entry.name
                )))
            }
        };
        let read = |producer: &Producer| -> Option<Value> {
            match producer {
                Producer::Const(v) => Some(v.clone()),
                Producer::Block(id) => self.output_of(*id),
            }
        };
        let slots = resolved
            .iter()
            .map(|(name, slot)| {
                let values = match slot {
                    Slot::Single(p) => SlotValues::Single(read(p)),
                    Slot::Group(ps) => SlotValues::Group(ps.iter().map(&read).collect()),
                };
                (name.clone(), values)
            })
            .collect();
        Ok(Inputs::new(slots))
    }

    /// Re-evaluate one combinational block. Returns the change indicator.
    fn eval_comb(self: &Arc<Self>, id: BlockId) -> SimResult<bool> {
        let entry = self.entry(id)?;
        let comb = entry.comb().expect("eval_comb on a sequential block");
        let inputs = self.input_snapshot(&entry, comb)?;
        let value = comb
            .logic
            .calc_output(&inputs)
            .map_err(|e| e.in_block(&entry.name))?;
        let previous = entry.output.read().clone();
        if previous.as_ref() == Some(&value) {
            return Ok(false);
        }
        if entry.debug.load(Ordering::Relaxed) {
            debug!(
                block = %entry.name,
                from = %fmt_output(&previous),
                to = %value,
                "output"
            );
        }
        *entry.output.write() = Some(value.clone());
        for event in &comb.on_output {
            event.send(self, id, output_event_data(&previous, &value))?;
        }
        Ok(true)
    }

    /// Run one propagation wave: FIFO re-evaluation of enqueued consumers,
    /// bounded per block to detect instability.
    fn run_wave(
        self: &Arc<Self>,
        pending: &mut VecDeque<BlockId>,
        rx: &mut mpsc::UnboundedReceiver<BlockId>,
    ) -> SimResult<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let limit = self.block_count().max(1);
        let mut eval_counts: HashMap<BlockId, usize> = HashMap::new();
        while let Some(id) = pending.pop_front() {
            let count = eval_counts.entry(id).or_insert(0);
            *count += 1;
            if *count > limit {
                let err = CircuitError::Instability {
                    block: self.block_name(id),
                    limit,
                };
                self.abort(err.clone());
                return Err(err);
            }
            let changed = self.eval_comb(id)?;
            if changed {
                pending.extend(self.consumers_of(id));
            }
            // sequential outputs changed by output events join the wave
            while let Ok(sblock) = rx.try_recv() {
                pending.extend(self.consumers_of(sblock));
            }
        }
        Ok(())
    }

    async fn simulate(
        self: &Arc<Self>,
        rx: &mut mpsc::UnboundedReceiver<BlockId>,
    ) -> SimResult<()> {
        // first run: evaluate every combinational block, dependencies first
        let mut comb_ids: Vec<(usize, BlockId)> = self
            .all_entries()
            .iter()
            .filter_map(|e| {
                e.comb()
                    .map(|c| (c.depth.load(Ordering::Relaxed), e.id))
            })
            .collect();
        comb_ids.sort();
        let mut pending: VecDeque<BlockId> = comb_ids.into_iter().map(|(_, id)| id).collect();

        loop {
            while let Ok(id) = rx.try_recv() {
                pending.extend(self.consumers_of(id));
            }
            self.run_wave(&mut pending, rx)?;

            let deadline = self.timers.lock().next_deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(self
                        .error()
                        .unwrap_or_else(|| CircuitError::Cancelled("simulation cancelled".into())));
                }
                received = rx.recv() => {
                    if let Some(id) = received {
                        pending.extend(self.consumers_of(id));
                    }
                }
                _ = async {
                    match deadline {
                        Some(instant) => tokio::time::sleep_until(instant).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.fire_due_timers()?;
                }
                _ = self.timer_notify.notified() => {
                    // a timer was scheduled or cancelled; recompute the deadline
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn check_persistent_data(&self) {
        let persistent: Vec<Arc<BlockEntry>> = self
            .all_entries()
            .into_iter()
            .filter(|e| e.seq().map(|s| s.persist.read().is_some()).unwrap_or(false))
            .collect();
        match self.persistent_store() {
            None => {
                if !persistent.is_empty() {
                    warn!("no data storage, state persistence unavailable");
                    for entry in persistent {
                        *entry.seq().expect("sequential").persist.write() = None;
                    }
                }
            }
            Some(store) => {
                let keep: Vec<String> = persistent.iter().map(|e| e.name.clone()).collect();
                if let Ok(keys) = store.keys() {
                    for key in keys {
                        if !keep.contains(&key) {
                            info!(key = %key, "removing unused persistent state");
                            let _ = store.delete(&key);
                        }
                    }
                }
            }
        }
    }

    /// Save the block's state to persistent storage if enabled.
    /// Errors are suppressed; stale data is removed on failure.
    pub(crate) fn save_persistent_state(self: &Arc<Self>, id: BlockId) {
        let entry = match self.entry(id) {
            Ok(entry) => entry,
            Err(_) => return,
        };
        let seq = match entry.seq() {
            Some(seq) if seq.persist.read().is_some() => seq,
            _ => return,
        };
        let store = match self.persistent_store() {
            Some(store) => store,
            None => return,
        };
        let ctx = BlockCtx::new(self.clone(), id);
        let payload = seq
            .logic
            .get_state(&ctx)
            .and_then(|state| {
                serde_json::to_vec(&state).map_err(|e| CircuitError::Block {
                    block: entry.name.clone(),
                    message: format!("cannot encode state: {e}"),
                })
            });
        match payload {
            Ok(bytes) => {
                if let Err(err) = store.put(&entry.name, &bytes, SystemTime::now()) {
                    warn!(block = %entry.name, error = %err, "persistent data save error");
                    let _ = store.delete(&entry.name);
                }
            }
            Err(err) => {
                warn!(block = %entry.name, error = %err, "persistent data save error");
                let _ = store.delete(&entry.name);
            }
        }
    }

    fn init_from_persistent(self: &Arc<Self>, entry: &Arc<BlockEntry>, seq: &SeqEntry) {
        let store = match self.persistent_store() {
            Some(store) => store,
            None => return,
        };
        let opts = match seq.persist.read().clone() {
            Some(opts) => opts,
            None => return,
        };
        let record = match store.get(&entry.name) {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(err) => {
                warn!(block = %entry.name, error = %err, "persistent data retrieval error");
                return;
            }
        };
        if let Some(expiration) = opts.expiration {
            match record.saved_at {
                None => {
                    warn!(block = %entry.name, "saved state has no timestamp, expiration not checked");
                }
                Some(saved_at) => match SystemTime::now().duration_since(saved_at) {
                    // clock went backwards: treat as not expired
                    Err(_) => {
                        warn!(block = %entry.name, "saved state timestamp is in the future, check the system time");
                    }
                    Ok(age) if age > expiration => {
                        if entry.debug.load(Ordering::Relaxed) {
                            debug!(block = %entry.name, "the saved state has expired");
                        }
                        return;
                    }
                    Ok(_) => {}
                },
            }
        }
        let ctx = BlockCtx::new(self.clone(), entry.id);
        match serde_json::from_slice::<Value>(&record.payload) {
            Err(err) => {
                warn!(block = %entry.name, error = %err, "cannot decode saved state");
            }
            Ok(state) => {
                if let Err(err) = seq.logic.restore_state(&ctx, &state) {
                    warn!(block = %entry.name, error = %err, state = %state, "error restoring saved state");
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Init sequencer
    // ------------------------------------------------------------------

    /// Run the synchronous init steps of one sequential block.
    ///
    /// The sequencer does either two calls with `full = false` (so async
    /// init can run between them) or one call with `full = true`. After
    /// these steps a block may still be uninitialized but must be able to
    /// process events: an event is its last chance to get initialized.
    pub(crate) fn init_sblock(self: &Arc<Self>, id: BlockId, full: bool) -> SimResult<()> {
        let entry = self.entry(id)?;
        let seq = match entry.seq() {
            Some(seq) => seq,
            None => return Ok(()),
        };
        let ctx = BlockCtx::new(self.clone(), id);
        let steps = seq.init_steps.load(Ordering::SeqCst);
        let result = (|| -> SimResult<()> {
            if steps == 0 {
                if seq.persist.read().is_some() {
                    self.init_from_persistent(&entry, seq);
                    if entry.is_initialized() && entry.debug.load(Ordering::Relaxed) {
                        debug!(block = %entry.name, "initialized from saved state");
                    }
                }
                seq.init_steps.store(1, Ordering::SeqCst);
            }
            if steps == 1 || (steps == 0 && full) {
                seq.logic.init_regular(&ctx)?;
                if !entry.is_initialized() {
                    if let Some(initdef) = &seq.initdef {
                        seq.logic.init_from_value(&ctx, initdef)?;
                    }
                }
                seq.init_steps.store(2, Ordering::SeqCst);
            }
            Ok(())
        })();
        result.map_err(|e| e.in_block(&entry.name))
    }

    async fn init_sblocks_async(self: &Arc<Self>) {
        let mut tasks: Vec<(String, Duration, JoinHandle<SimResult<()>>)> = Vec::new();
        for entry in self.all_entries() {
            let seq = match entry.seq() {
                Some(seq) => seq,
                None => continue,
            };
            if entry.is_initialized()
                || seq.logic.as_async().is_none()
                || seq.init_timeout.is_zero()
            {
                continue;
            }
            let logic = seq.logic.clone();
            let ctx = BlockCtx::new(self.clone(), entry.id);
            let handle = tokio::spawn(async move {
                match logic.as_async() {
                    Some(async_logic) => async_logic.init_async(ctx).await,
                    None => Ok(()),
                }
            });
            tasks.push((entry.name.clone(), seq.init_timeout, handle));
        }
        if !tasks.is_empty() {
            if self.circuit_debug() {
                debug!("initializing async sequential blocks");
            }
            run_block_tasks("init", tasks).await;
        }
    }

    // ------------------------------------------------------------------
    // Start / stop
    // ------------------------------------------------------------------

    fn resolved_signature(comb: &CombEntry) -> InputSignature {
        match &*comb.inputs.read() {
            ConnState::Resolved(slots) => slots
                .iter()
                .map(|(name, slot)| {
                    let arity = match slot {
                        Slot::Single(_) => None,
                        Slot::Group(g) => Some(g.len()),
                    };
                    (name.clone(), arity)
                })
                .collect(),
            _ => InputSignature::new(),
        }
    }

    fn start_block(self: &Arc<Self>, entry: &Arc<BlockEntry>) -> SimResult<()> {
        match &entry.kind {
            BlockKind::Comb(comb) => {
                let signature = Self::resolved_signature(comb);
                comb.logic
                    .check_connections(&signature)
                    .map_err(|e| e.in_block(&entry.name))?;
            }
            BlockKind::Seq(seq) => {
                let ctx = BlockCtx::new(self.clone(), entry.id);
                seq.logic.start(&ctx).map_err(|e| e.in_block(&entry.name))?;
                if seq.logic.as_main_task().is_some() {
                    self.spawn_block_main_task(entry, seq);
                }
            }
        }
        entry.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn spawn_block_main_task(self: &Arc<Self>, entry: &Arc<BlockEntry>, seq: &SeqEntry) {
        let token = self.cancel.child_token();
        let task_token = token.clone();
        let logic = seq.logic.clone();
        let ctx = BlockCtx::new(self.clone(), entry.id);
        let circuit = self.clone();
        let name = entry.name.clone();
        let handle = tokio::spawn(async move {
            let task = async {
                match logic.as_main_task() {
                    Some(main_task) => main_task.run(ctx).await,
                    None => Ok(()),
                }
            };
            tokio::select! {
                _ = task_token.cancelled() => {}
                result = task => match result {
                    // a main task is a service: a normal exit is an error
                    Ok(()) => circuit.abort(CircuitError::Block {
                        block: name.clone(),
                        message: "unexpected main task termination".into(),
                    }),
                    Err(err) if err.is_cancelled() => {}
                    Err(err) => circuit.abort(err.in_block(&name)),
                },
            }
        });
        self.main_tasks.lock().push(MainTaskHolder {
            id: entry.id,
            token,
            handle,
        });
    }

    async fn stop_all(self: &Arc<Self>, started: &[BlockId], start_ok: bool) {
        // 1. cancel monitored main tasks
        let holders: Vec<MainTaskHolder> = self.main_tasks.lock().drain(..).collect();
        let mut main_handles: HashMap<BlockId, JoinHandle<()>> = HashMap::new();
        for holder in holders {
            holder.token.cancel();
            main_handles.insert(holder.id, holder.handle);
        }

        // 2. async cleanup under per-block stop timeouts
        let mut tasks: Vec<(String, Duration, JoinHandle<SimResult<()>>)> = Vec::new();
        for &id in started {
            let entry = match self.entry(id) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let seq = match entry.seq() {
                Some(seq) => seq,
                None => continue,
            };
            let main_handle = main_handles.remove(&id);
            let has_async = seq.logic.as_async().is_some();
            if main_handle.is_none() && (!has_async || seq.stop_timeout.is_zero()) {
                continue;
            }
            let logic = seq.logic.clone();
            let ctx = BlockCtx::new(self.clone(), id);
            let handle = tokio::spawn(async move {
                if let Some(main_handle) = main_handle {
                    let _ = main_handle.await;
                }
                match logic.as_async() {
                    Some(async_logic) => async_logic.stop_async(ctx).await,
                    None => Ok(()),
                }
            });
            tasks.push((entry.name.clone(), seq.stop_timeout, handle));
        }
        if !tasks.is_empty() {
            if self.circuit_debug() {
                debug!("waiting for async cleanup");
            }
            run_block_tasks("stop", tasks).await;
        }

        // 3. synchronous stop hooks (must tolerate a partial start)
        for &id in started {
            let entry = match self.entry(id) {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            if let Some(seq) = entry.seq() {
                let ctx = BlockCtx::new(self.clone(), id);
                if let Err(err) = seq.logic.stop(&ctx) {
                    error!(block = %entry.name, error = %err, "ignored error in stop()");
                }
            }
        }

        // 4. flush persistent state
        if start_ok {
            for &id in started {
                self.save_persistent_state(id);
            }
        }
    }

    async fn startup(
        self: &Arc<Self>,
        rx: &mut mpsc::UnboundedReceiver<BlockId>,
        started: &mut Vec<BlockId>,
        start_ok: &mut bool,
    ) -> SimResult<()> {
        if let Some(err) = self.error() {
            // stopped before start
            return Err(err);
        }
        if self.block_count() == 0 {
            return Err(CircuitError::InvalidState("the circuit is empty".into()));
        }
        if self.circuit_debug() {
            debug!("initializing the circuit");
        }
        self.apply_debug_env();
        self.check_persistent_data();
        self.finalize()?;
        self.ready.store(true, Ordering::SeqCst);

        if self.circuit_debug() {
            debug!("setting up circuit blocks");
        }
        for entry in self.all_entries() {
            self.start_block(&entry)?;
            started.push(entry.id);
        }
        // return control to the scheduler so tasks created by start() run
        tokio::task::yield_now().await;
        *start_ok = true;

        if self.circuit_debug() {
            debug!("initializing sequential blocks");
        }
        let seq_ids: Vec<BlockId> = self
            .all_entries()
            .iter()
            .filter(|e| e.seq().is_some())
            .map(|e| e.id)
            .collect();
        for &id in &seq_ids {
            self.init_sblock(id, false)?;
        }
        self.init_sblocks_async().await;
        for &id in &seq_ids {
            // do not check the output yet: a block may be waiting for an
            // event sent during another block's init
            self.init_sblock(id, false)?;
        }
        for &id in &seq_ids {
            let entry = self.entry(id)?;
            if !entry.is_initialized() {
                return Err(CircuitError::InitializationFailed(entry.name.clone()));
            }
        }
        for &id in &seq_ids {
            self.save_persistent_state(id);
        }
        // the first simulation wave evaluates everything anyway
        while rx.try_recv().is_ok() {}

        if let Some(err) = self.error() {
            return Err(err);
        }
        let _ = self.init_done_tx.send(true);
        if self.circuit_debug() {
            debug!("starting simulation");
        }
        self.simulate(rx).await
    }

    async fn run_forever_inner(self: &Arc<Self>) -> SimResult<()> {
        if self.sim_started.swap(true, Ordering::SeqCst) {
            let message = if self.sim_finished.load(Ordering::SeqCst) {
                "cannot restart a finished simulation"
            } else {
                "the simulator is already running"
            };
            return Err(CircuitError::InvalidState(message.into()));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        *self.queue_tx.lock() = Some(tx);

        let mut started: Vec<BlockId> = Vec::new();
        let mut start_ok = false;
        let result = self.startup(&mut rx, &mut started, &mut start_ok).await;

        {
            let mut error = self.error.lock();
            if error.is_none() {
                *error = Some(match result {
                    Err(err) => err,
                    // simulate() never returns normally
                    Ok(()) => CircuitError::Cancelled("simulation ended".into()),
                });
            }
        }
        let final_error = self.error().expect("terminating error recorded");
        self.ready.store(false, Ordering::SeqCst);
        if final_error.is_cancelled() {
            info!("normal circuit simulation stop");
        } else {
            error!(error = %final_error, "fatal circuit simulation error");
        }

        if !started.is_empty() {
            self.stop_all(&started, start_ok).await;
        }
        *self.queue_tx.lock() = None;
        self.sim_finished.store(true, Ordering::SeqCst);
        let _ = self.sim_done_tx.send(true);
        Err(final_error)
    }

    /// Run the circuit simulation until cancelled.
    ///
    /// Never exits normally: it always returns the terminating error,
    /// [`CircuitError::Cancelled`] for a normal stop. A finished
    /// simulation cannot be restarted.
    pub async fn run_forever(self: Arc<Self>) -> SimResult<()> {
        let circuit = self;
        IN_SIM_TASK
            .scope((), async move { circuit.run_forever_inner().await })
            .await
    }

    /// Wait until a running circuit is fully initialized.
    ///
    /// Fails with *InvalidState* when the simulation is not running or
    /// ends before initialization completes.
    pub async fn wait_init(&self) -> SimResult<()> {
        if !self.sim_started.load(Ordering::SeqCst) {
            // the task may have been spawned but not polled yet
            tokio::task::yield_now().await;
            if !self.sim_started.load(Ordering::SeqCst) {
                return Err(CircuitError::InvalidState(
                    "the simulation task was not started".into(),
                ));
            }
        }
        let mut init_rx = self.init_done_tx.subscribe();
        let mut done_rx = self.sim_done_tx.subscribe();
        loop {
            if self.sim_finished.load(Ordering::SeqCst) {
                let message = match self.error() {
                    Some(err) if err.is_cancelled() => "the simulation task is finished".into(),
                    Some(err) => format!("the simulation task failed: {err}"),
                    None => "the simulation task is finished".into(),
                };
                return Err(CircuitError::InvalidState(message));
            }
            if *init_rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                changed = init_rx.changed() => {
                    if changed.is_err() {
                        return Err(CircuitError::InvalidState(
                            "the simulation task is gone".into(),
                        ));
                    }
                }
                _ = done_rx.changed() => {}
            }
        }
    }

    /// Stop the simulation and wait until its cleanup finishes.
    ///
    /// Returns normally if the simulation ended by cancellation, else
    /// propagates the terminating error. Calling this from the simulation
    /// task (or any task owned by a block) is a usage error; such callers
    /// must use [`Circuit::abort`] instead.
    pub async fn shutdown(&self) -> SimResult<()> {
        if !self.sim_started.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
            if !self.sim_started.load(Ordering::SeqCst) {
                return Err(CircuitError::InvalidState(
                    "the simulation task was not started".into(),
                ));
            }
        }
        if in_sim_task() {
            return Err(CircuitError::InvalidState(
                "cannot await the simulation task from the simulation task".into(),
            ));
        }
        self.abort(CircuitError::Cancelled("shutdown".into()));
        let mut done = self.sim_done_tx.subscribe();
        let _ = done.wait_for(|finished| *finished).await;
        match self.error() {
            Some(err) if err.is_cancelled() => Ok(()),
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Await block-level init/stop tasks, longest timeout first, logging and
/// suppressing their errors.
async fn run_block_tasks(job: &str, mut tasks: Vec<(String, Duration, JoinHandle<SimResult<()>>)>) {
    tasks.sort_by(|a, b| b.1.cmp(&a.1));
    let begin = tokio::time::Instant::now();
    let mut errors = 0usize;
    for (name, task_timeout, mut handle) in tasks {
        let remaining = task_timeout.saturating_sub(begin.elapsed());
        match tokio::time::timeout(remaining, &mut handle).await {
            Err(_) => {
                handle.abort();
                errors += 1;
                warn!(block = %name, timeout = ?task_timeout, "{job} timeout, check the timeout value");
            }
            Ok(Err(join_err)) => {
                if !join_err.is_cancelled() {
                    errors += 1;
                    error!(block = %name, error = %join_err, "{job} task failed");
                }
            }
            Ok(Ok(Err(err))) => {
                if !err.is_cancelled() {
                    errors += 1;
                    error!(block = %name, error = %err, "{job} error");
                }
            }
            Ok(Ok(Ok(()))) => {}
        }
    }
    if errors > 0 {
        error!(count = errors, "block {job} error(s) suppressed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_wheel_ordering() {
        let mut wheel = TimerWheel::new();
        let a = BlockId(0);
        let b = BlockId(1);
        wheel.schedule(b, Duration::from_secs(2), EventType::named("late"));
        wheel.schedule(a, Duration::from_secs(1), EventType::named("early"));
        let t0 = tokio::time::Instant::now();
        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_secs(1)));
        assert!(wheel.pop_due(t0).is_none());
        let (block, event) = wheel.pop_due(t0 + Duration::from_secs(1)).unwrap();
        assert_eq!(block, a);
        assert_eq!(event, EventType::named("early"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_wheel_ties_fire_in_schedule_order() {
        let mut wheel = TimerWheel::new();
        let a = BlockId(0);
        let b = BlockId(1);
        wheel.schedule(a, Duration::from_secs(1), EventType::named("first"));
        wheel.schedule(b, Duration::from_secs(1), EventType::named("second"));
        let due = tokio::time::Instant::now() + Duration::from_secs(1);
        assert_eq!(wheel.pop_due(due).unwrap().0, a);
        assert_eq!(wheel.pop_due(due).unwrap().0, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_wheel_cancellation_by_generation() {
        let mut wheel = TimerWheel::new();
        let a = BlockId(0);
        wheel.schedule(a, Duration::from_secs(1), EventType::named("stale"));
        wheel.cancel(a);
        wheel.schedule(a, Duration::from_secs(3), EventType::named("fresh"));
        let t0 = tokio::time::Instant::now();
        // the stale entry is skipped even though its deadline is earlier
        assert_eq!(wheel.next_deadline(), Some(t0 + Duration::from_secs(3)));
        let (_, event) = wheel.pop_due(t0 + Duration::from_secs(3)).unwrap();
        assert_eq!(event, EventType::named("fresh"));
    }
}
