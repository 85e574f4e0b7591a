//! The circuit: block registry, name resolver and lifecycle state.
//!
//! There is one *current* circuit per process (`current()` / `reset()`);
//! every construction path also works against an explicit `Arc<Circuit>`,
//! which is what tests use to avoid global coupling.
//!
//! Blocks can be added but never removed. `finalize()` freezes the
//! structure: it creates the automatic blocks (`_ctrl`, `_not_<name>`
//! inverters), replaces producer names with resolved references and
//! populates the reverse connections.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::block::{
    BlockEntry, BlockHandle, BlockId, BlockKind, CombEntry, CombLogic, ConnState, Connect,
    PersistOpts, Producer, ProducerSpec, SeqEntry, SeqLogic, Slot, SlotSpec,
};
use crate::error::{CircuitError, SimResult};
use crate::event::Event;
use crate::persist::StateStore;
use crate::simulator::{MainTaskHolder, TimerWheel};
use crate::value::{check_name, env_flag, wildcard_match, Value};

/// Name of the automatically created simulation control block.
pub const CTRL_BLOCK_NAME: &str = "_ctrl";

/// Prefix of the automatic inverter shortcut.
pub const NOT_PREFIX: &str = "_not_";

/// Environment variable enabling circuit-level debug records.
pub const ENV_DEBUG_CIRCUIT: &str = "SWITCHYARD_DEBUG_CIRCUIT";

/// Environment variable seeding per-block debug flags
/// (comma-separated `[+|-]pattern` items with `*`/`?` wildcards).
pub const ENV_DEBUG_BLOCKS: &str = "SWITCHYARD_DEBUG_BLOCKS";

pub(crate) const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

static CURRENT: Mutex<Option<Arc<Circuit>>> = Mutex::new(None);

/// Get the current circuit, creating it if absent.
pub fn current() -> Arc<Circuit> {
    CURRENT.lock().get_or_insert_with(Circuit::new_arc).clone()
}

/// Abort any running simulation, wait for it to finish and install a fresh,
/// empty circuit. A process restart is the preferred alternative.
///
/// Must not be called from the simulation task or a block-owned task.
pub async fn reset() {
    let previous = CURRENT.lock().take();
    if let Some(circuit) = previous {
        circuit.abort(CircuitError::Cancelled("circuit reset".into()));
        if circuit.sim_started.load(Ordering::SeqCst) && !circuit.sim_finished.load(Ordering::SeqCst)
        {
            let mut done = circuit.sim_done_tx.subscribe();
            let _ = done.wait_for(|finished| *finished).await;
        }
    }
}

/// Kind requirement of a late-resolved block reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeReq {
    Any,
    Sequential,
}

enum CellTarget {
    Name(String),
    Resolved(BlockId),
}

/// A block reference held by name until finalization.
///
/// Third parties holding references by name (events, filters) register a
/// cell with the circuit; `finalize()` substitutes the block, failing with
/// *NotFound* or *TypeMismatch*.
pub struct NameCell {
    required: TypeReq,
    target: Mutex<CellTarget>,
}

impl NameCell {
    /// A reference to any block, held by name until finalization.
    ///
    /// Register the cell with [`Circuit::resolve_name`]; after
    /// finalization, [`NameCell::handle`] yields the referenced block.
    pub fn any(name: impl Into<String>) -> Arc<Self> {
        Self::unresolved(name.into(), TypeReq::Any)
    }

    /// A reference that must resolve to a sequential block.
    pub fn sequential(name: impl Into<String>) -> Arc<Self> {
        Self::unresolved(name.into(), TypeReq::Sequential)
    }

    /// The referenced block, resolving the name if finalization has
    /// already happened. Failure kinds: *InvalidState* (not finalized),
    /// *NotFound*, *TypeMismatch*.
    pub fn handle(&self, circuit: &Arc<Circuit>) -> SimResult<crate::block::BlockHandle> {
        let id = self.get_or_resolve(circuit)?;
        Ok(crate::block::BlockHandle {
            circuit: circuit.clone(),
            id,
        })
    }

    pub(crate) fn unresolved(name: String, required: TypeReq) -> Arc<Self> {
        Arc::new(Self {
            required,
            target: Mutex::new(CellTarget::Name(name)),
        })
    }

    pub(crate) fn resolved(id: BlockId) -> Arc<Self> {
        Arc::new(Self {
            required: TypeReq::Any,
            target: Mutex::new(CellTarget::Resolved(id)),
        })
    }

    pub(crate) fn label(&self) -> String {
        match &*self.target.lock() {
            CellTarget::Name(n) => n.clone(),
            CellTarget::Resolved(id) => format!("{id}"),
        }
    }

    /// Resolve during finalization; automatic blocks may be created.
    pub(crate) fn resolve_in(&self, circuit: &Arc<Circuit>) -> SimResult<()> {
        let mut target = self.target.lock();
        if let CellTarget::Name(name) = &*target {
            let id = circuit.resolve_or_autocreate(name)?;
            circuit.check_type_req(id, self.required)?;
            *target = CellTarget::Resolved(id);
        }
        Ok(())
    }

    /// Resolved id; resolves lazily after finalization, fails with
    /// *InvalidState* before it.
    pub(crate) fn get_or_resolve(&self, circuit: &Arc<Circuit>) -> SimResult<BlockId> {
        let mut target = self.target.lock();
        match &*target {
            CellTarget::Resolved(id) => Ok(*id),
            CellTarget::Name(name) => {
                if !circuit.is_finalized() {
                    return Err(CircuitError::InvalidState(format!(
                        "block name {name:?} not resolved yet (circuit not finalized)"
                    )));
                }
                let id = circuit
                    .lookup(name)
                    .ok_or_else(|| CircuitError::NotFound(name.clone()))?;
                circuit.check_type_req(id, self.required)?;
                *target = CellTarget::Resolved(id);
                Ok(id)
            }
        }
    }
}

/// The container of all blocks and their interconnections, plus the engine
/// state shared by the dispatcher, the propagation engine and the
/// supervisor.
pub struct Circuit {
    pub(crate) blocks: RwLock<Vec<Arc<BlockEntry>>>,
    pub(crate) index: RwLock<HashMap<String, BlockId>>,
    pub(crate) finalized: AtomicBool,
    pub(crate) error: Mutex<Option<CircuitError>>,
    /// Accepting external events.
    pub(crate) ready: AtomicBool,
    pub(crate) sim_started: AtomicBool,
    pub(crate) sim_finished: AtomicBool,
    /// Circuit-level debug records.
    pub(crate) debug: AtomicBool,
    pub(crate) cancel: CancellationToken,
    pub(crate) resolver: Mutex<Vec<Arc<NameCell>>>,
    /// Changed sequential blocks, drained by the simulation loop.
    pub(crate) queue_tx: Mutex<Option<mpsc::UnboundedSender<BlockId>>>,
    pub(crate) timers: Mutex<TimerWheel>,
    pub(crate) timer_notify: Notify,
    pub(crate) store: RwLock<Option<Arc<dyn StateStore>>>,
    pub(crate) init_done_tx: watch::Sender<bool>,
    pub(crate) sim_done_tx: watch::Sender<bool>,
    pub(crate) main_tasks: Mutex<Vec<MainTaskHolder>>,
    auto_seq: AtomicUsize,
}

impl Circuit {
    pub fn new_arc() -> Arc<Self> {
        let (init_done_tx, _) = watch::channel(false);
        let (sim_done_tx, _) = watch::channel(false);
        Arc::new(Self {
            blocks: RwLock::new(Vec::new()),
            index: RwLock::new(HashMap::new()),
            finalized: AtomicBool::new(false),
            error: Mutex::new(None),
            ready: AtomicBool::new(false),
            sim_started: AtomicBool::new(false),
            sim_finished: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            resolver: Mutex::new(Vec::new()),
            queue_tx: Mutex::new(None),
            timers: Mutex::new(TimerWheel::new()),
            timer_notify: Notify::new(),
            store: RwLock::new(None),
            init_done_tx,
            sim_done_tx,
            main_tasks: Mutex::new(Vec::new()),
            auto_seq: AtomicUsize::new(0),
        })
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Start building a combinational block.
    pub fn cblock(self: &Arc<Self>, name: &str, logic: impl CombLogic) -> CBlockBuilder {
        CBlockBuilder {
            circuit: self.clone(),
            name: name.to_string(),
            comment: String::new(),
            debug: false,
            on_output: Vec::new(),
            logic: Arc::new(logic),
            reserved: false,
        }
    }

    /// Start building a sequential block.
    pub fn sblock(self: &Arc<Self>, name: &str, logic: impl SeqLogic) -> SBlockBuilder {
        SBlockBuilder {
            circuit: self.clone(),
            name: name.to_string(),
            comment: String::new(),
            debug: false,
            on_output: Vec::new(),
            on_every_output: Vec::new(),
            initdef: None,
            persistent: false,
            sync_state: true,
            expiration: None,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            logic: Arc::new(logic),
            reserved: false,
        }
    }

    pub(crate) fn register_reserved_comb(
        self: &Arc<Self>,
        name: &str,
        logic: impl CombLogic,
        comment: &str,
    ) -> SimResult<BlockHandle> {
        let mut builder = self.cblock(name, logic).comment(comment);
        builder.reserved = true;
        builder.register()
    }

    pub(crate) fn register_reserved_seq(
        self: &Arc<Self>,
        name: &str,
        logic: impl SeqLogic,
        comment: &str,
    ) -> SimResult<BlockHandle> {
        let mut builder = self.sblock(name, logic).comment(comment);
        builder.reserved = true;
        builder.register()
    }

    fn register_entry(
        self: &Arc<Self>,
        name: &str,
        comment: String,
        debug: bool,
        reserved: bool,
        kind: BlockKind,
    ) -> SimResult<BlockHandle> {
        self.check_not_finalized()?;
        check_name(name, "block name", reserved)?;
        let mut blocks = self.blocks.write();
        let mut index = self.index.write();
        if index.contains_key(name) {
            return Err(CircuitError::DuplicateName(name.to_string()));
        }
        let id = BlockId(blocks.len());
        blocks.push(Arc::new(BlockEntry {
            id,
            name: name.to_string(),
            comment,
            debug: AtomicBool::new(debug),
            output: RwLock::new(None),
            oconn: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
            kind,
        }));
        index.insert(name.to_string(), id);
        Ok(BlockHandle {
            circuit: self.clone(),
            id,
        })
    }

    pub(crate) fn next_auto_name(&self, what: &str) -> String {
        let n = self.auto_seq.fetch_add(1, Ordering::Relaxed);
        format!("_{what}_{n}")
    }

    // ------------------------------------------------------------------
    // Lookup & accessors
    // ------------------------------------------------------------------

    pub(crate) fn lookup(&self, name: &str) -> Option<BlockId> {
        self.index.read().get(name).copied()
    }

    pub(crate) fn entry(&self, id: BlockId) -> SimResult<Arc<BlockEntry>> {
        self.blocks
            .read()
            .get(id.0)
            .cloned()
            .ok_or_else(|| CircuitError::NotFound(format!("{id}")))
    }

    /// Find a block by name.
    pub fn find_block(self: &Arc<Self>, name: &str) -> SimResult<BlockHandle> {
        let id = self
            .lookup(name)
            .ok_or_else(|| CircuitError::NotFound(name.to_string()))?;
        Ok(BlockHandle {
            circuit: self.clone(),
            id,
        })
    }

    /// Names of all registered blocks, in registration order.
    pub fn block_names(&self) -> Vec<String> {
        self.blocks.read().iter().map(|e| e.name.clone()).collect()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub(crate) fn block_name(&self, id: BlockId) -> String {
        self.blocks
            .read()
            .get(id.0)
            .map(|e| e.name.clone())
            .unwrap_or_else(|| format!("{id}"))
    }

    pub(crate) fn output_of(&self, id: BlockId) -> Option<Value> {
        self.blocks
            .read()
            .get(id.0)
            .and_then(|e| e.output.read().clone())
    }

    pub(crate) fn block_conf(&self, id: BlockId) -> Option<crate::block::BlockConf> {
        self.blocks.read().get(id.0).map(|e| e.conf())
    }

    pub(crate) fn all_entries(&self) -> Vec<Arc<BlockEntry>> {
        self.blocks.read().clone()
    }

    pub(crate) fn consumers_of(&self, id: BlockId) -> Vec<BlockId> {
        self.blocks
            .read()
            .get(id.0)
            .map(|e| e.oconn.read().clone())
            .unwrap_or_default()
    }

    pub(crate) fn require_sequential(&self, id: BlockId) -> SimResult<()> {
        self.check_type_req(id, TypeReq::Sequential)
    }

    fn check_type_req(&self, id: BlockId, required: TypeReq) -> SimResult<()> {
        if required == TypeReq::Any {
            return Ok(());
        }
        let entry = self.entry(id)?;
        if entry.seq().is_none() {
            return Err(CircuitError::TypeMismatch {
                name: entry.name.clone(),
                expected: "sequential",
                actual: entry.kind_name(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Connections & finalization
    // ------------------------------------------------------------------

    pub(crate) fn connect(&self, id: BlockId, connections: Connect) -> SimResult<()> {
        self.check_not_finalized()?;
        let entry = self.entry(id)?;
        let comb = entry.comb().ok_or_else(|| {
            CircuitError::InvalidState(format!(
                "connect() is only valid for combinational blocks, {:?} is {}",
                entry.name,
                entry.kind_name()
            ))
        })?;
        if connections.is_empty() {
            return Err(CircuitError::Config("no inputs to connect".into()));
        }
        let mut state = comb.inputs.write();
        if !matches!(*state, ConnState::Unconnected) {
            return Err(CircuitError::InvalidState(format!(
                "{:?}: connect() may be called only once",
                entry.name
            )));
        }
        *state = ConnState::Specs(connections.slots);
        Ok(())
    }

    pub(crate) fn register_name_cell(&self, cell: Arc<NameCell>) {
        if !self.is_finalized() {
            self.resolver.lock().push(cell);
        }
    }

    /// Register a block reference held by name for resolution at
    /// finalization (for third parties holding forward references).
    pub fn resolve_name(&self, cell: &Arc<NameCell>) {
        self.register_name_cell(cell.clone());
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub(crate) fn check_not_finalized(&self) -> SimResult<()> {
        if self.error.lock().is_some() {
            return Err(CircuitError::InvalidState("the circuit was shut down".into()));
        }
        if self.is_finalized() {
            return Err(CircuitError::InvalidState(
                "no changes allowed in a finalized circuit".into(),
            ));
        }
        Ok(())
    }

    /// Process a producer name: an existing block, or one of the automatic
    /// blocks (`_ctrl`, `_not_<name>` for an existing target not starting
    /// with an underscore).
    pub(crate) fn resolve_or_autocreate(self: &Arc<Self>, name: &str) -> SimResult<BlockId> {
        if let Some(id) = self.lookup(name) {
            return Ok(id);
        }
        if name == CTRL_BLOCK_NAME {
            let handle = self.register_reserved_seq(
                CTRL_BLOCK_NAME,
                crate::blocks::ControlBlock,
                "simulation control block",
            )?;
            return Ok(handle.id);
        }
        if let Some(target) = name.strip_prefix(NOT_PREFIX) {
            // No double inverters: the inner name must not be reserved.
            if !target.is_empty() && !target.starts_with('_') && self.lookup(target).is_some() {
                let handle = self.register_reserved_comb(
                    name,
                    crate::blocks::Invert,
                    &format!("inverted output of {target:?}"),
                )?;
                handle.connect(Connect::new().unnamed([target]))?;
                return Ok(handle.id);
            }
        }
        Err(CircuitError::NotFound(name.to_string()))
    }

    fn resolve_producer(self: &Arc<Self>, owner: &str, spec: ProducerSpec) -> SimResult<Producer> {
        match spec {
            ProducerSpec::Const(v) => Ok(Producer::Const(v)),
            ProducerSpec::Name(name) => match self.resolve_or_autocreate(&name) {
                Ok(id) => Ok(Producer::Block(id)),
                Err(err) => Err(CircuitError::Block {
                    block: owner.to_string(),
                    message: format!("failed connection from {name:?}: {err}"),
                }),
            },
        }
    }

    fn resolve_inputs(self: &Arc<Self>, id: BlockId) -> SimResult<()> {
        let entry = self.entry(id)?;
        let comb = match entry.comb() {
            Some(c) => c,
            None => return Ok(()),
        };
        let specs = match &*comb.inputs.read() {
            ConnState::Resolved(_) => return Ok(()),
            ConnState::Unconnected => indexmap::IndexMap::new(),
            ConnState::Specs(specs) => specs.clone(),
        };
        let mut resolved = indexmap::IndexMap::new();
        for (slot_name, spec) in specs {
            let slot = match spec {
                SlotSpec::Single(p) => Slot::Single(self.resolve_producer(&entry.name, p)?),
                SlotSpec::Group(ps) => Slot::Group(
                    ps.into_iter()
                        .map(|p| self.resolve_producer(&entry.name, p))
                        .collect::<SimResult<Vec<_>>>()?,
                ),
            };
            resolved.insert(slot_name, slot);
        }
        *comb.inputs.write() = ConnState::Resolved(resolved);
        Ok(())
    }

    fn resolve_cells(self: &Arc<Self>) -> SimResult<()> {
        loop {
            let cells: Vec<Arc<NameCell>> = std::mem::take(&mut *self.resolver.lock());
            if cells.is_empty() {
                return Ok(());
            }
            for cell in cells {
                cell.resolve_in(self)?;
            }
        }
    }

    fn rebuild_connections(&self) {
        let blocks = self.all_entries();
        for entry in &blocks {
            entry.oconn.write().clear();
        }
        for entry in &blocks {
            let comb = match entry.comb() {
                Some(c) => c,
                None => continue,
            };
            let resolved = match &*comb.inputs.read() {
                ConnState::Resolved(slots) => slots.clone(),
                _ => continue,
            };
            for slot in resolved.values() {
                let producers: Vec<&Producer> = match slot {
                    Slot::Single(p) => vec![p],
                    Slot::Group(ps) => ps.iter().collect(),
                };
                for producer in producers {
                    if let Producer::Block(pid) = producer {
                        let mut oconn = blocks[pid.0].oconn.write();
                        if !oconn.contains(&entry.id) {
                            oconn.push(entry.id);
                        }
                    }
                }
            }
        }
    }

    fn compute_depths(&self) {
        fn depth_of(
            blocks: &[Arc<BlockEntry>],
            id: usize,
            memo: &mut HashMap<usize, usize>,
            visiting: &mut HashSet<usize>,
        ) -> usize {
            if let Some(d) = memo.get(&id) {
                return *d;
            }
            if !visiting.insert(id) {
                // combinational cycle: the instability check will catch it
                return 0;
            }
            let depth = match blocks[id].comb() {
                None => 0,
                Some(comb) => {
                    let mut max_dep = 0;
                    if let ConnState::Resolved(slots) = &*comb.inputs.read() {
                        for slot in slots.values() {
                            let producers: Vec<&Producer> = match slot {
                                Slot::Single(p) => vec![p],
                                Slot::Group(ps) => ps.iter().collect(),
                            };
                            for producer in producers {
                                if let Producer::Block(pid) = producer {
                                    if blocks[pid.0].comb().is_some() {
                                        max_dep =
                                            max_dep.max(depth_of(blocks, pid.0, memo, visiting));
                                    }
                                }
                            }
                        }
                    }
                    max_dep + 1
                }
            };
            visiting.remove(&id);
            memo.insert(id, depth);
            depth
        }

        let blocks = self.all_entries();
        let mut memo = HashMap::new();
        for entry in &blocks {
            if let Some(comb) = entry.comb() {
                let d = depth_of(&blocks, entry.id.0, &mut memo, &mut HashSet::new());
                comb.depth.store(d, Ordering::Relaxed);
            }
        }
    }

    /// Freeze the circuit structure. Idempotent.
    pub fn finalize(self: &Arc<Self>) -> SimResult<()> {
        if self.is_finalized() {
            return Ok(());
        }
        self.resolve_cells()?;
        loop {
            let ids: Vec<BlockId> = self
                .all_entries()
                .iter()
                .filter(|e| e.comb().is_some())
                .map(|e| e.id)
                .collect();
            let before = self.block_count();
            for id in ids {
                self.resolve_inputs(id)?;
            }
            if self.block_count() == before {
                break;
            }
        }
        self.resolve_cells()?;
        self.rebuild_connections();
        self.compute_depths();
        self.finalized.store(true, Ordering::SeqCst);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Debug control
    // ------------------------------------------------------------------

    pub(crate) fn debug_enabled(&self, id: BlockId) -> bool {
        self.blocks
            .read()
            .get(id.0)
            .map(|e| e.debug.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub(crate) fn set_block_debug(&self, id: BlockId, enabled: bool) {
        if let Some(entry) = self.blocks.read().get(id.0) {
            entry.debug.store(enabled, Ordering::Relaxed);
        }
    }

    /// Circuit-level debug records.
    pub fn set_circuit_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    pub(crate) fn circuit_debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// Set the debug flag of all blocks matching the given names or
    /// wildcard patterns. Returns the number of affected blocks.
    pub fn set_debug(&self, enabled: bool, patterns: &[&str]) -> usize {
        let blocks = self.blocks.read();
        let mut affected = HashSet::new();
        for pattern in patterns {
            if pattern.contains('*') || pattern.contains('?') {
                for entry in blocks.iter() {
                    if wildcard_match(pattern, &entry.name) {
                        entry.debug.store(enabled, Ordering::Relaxed);
                        affected.insert(entry.id);
                    }
                }
            } else if let Some(id) = self.index.read().get(*pattern) {
                blocks[id.0].debug.store(enabled, Ordering::Relaxed);
                affected.insert(*id);
            }
        }
        affected.len()
    }

    /// Seed debug flags from the environment. Processed once at start.
    pub(crate) fn apply_debug_env(&self) {
        if let Ok(raw) = std::env::var(ENV_DEBUG_CIRCUIT) {
            match env_flag(&raw) {
                Some(enabled) => self.debug.store(enabled, Ordering::Relaxed),
                None => warn!(value = %raw, "unrecognized {} value", ENV_DEBUG_CIRCUIT),
            }
        }
        if let Ok(raw) = std::env::var(ENV_DEBUG_BLOCKS) {
            for item in raw.split(',') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let (enabled, pattern) = match item.strip_prefix('-') {
                    Some(rest) => (false, rest),
                    None => (true, item.strip_prefix('+').unwrap_or(item)),
                };
                let count = self.set_debug(enabled, &[pattern]);
                if count == 0 {
                    warn!(pattern = %pattern, "{} pattern matched no blocks", ENV_DEBUG_BLOCKS);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Simulation state
    // ------------------------------------------------------------------

    /// True only if the circuit accepts external events.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.error.lock().is_none()
    }

    /// The exception that terminated (or will terminate) the simulation.
    pub fn error(&self) -> Option<CircuitError> {
        self.error.lock().clone()
    }

    /// Thread-safely record the terminating exception and cancel the
    /// simulation task. The first exception wins; later calls are ignored.
    pub fn abort(&self, exc: CircuitError) {
        {
            let mut error = self.error.lock();
            if let Some(existing) = &*error {
                if !exc.is_cancelled() && exc.to_string() != existing.to_string() {
                    warn!(error = %exc, "ignoring subsequent abort");
                }
                return;
            }
            if exc.is_cancelled() {
                info!(reason = %exc, "simulation stop requested");
            } else {
                warn!(error = %exc, "simulation abort requested");
            }
            *error = Some(exc);
        }
        self.cancel.cancel();
    }

    /// The simulation-lifetime cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Configure the persistent state store. Allowed only before
    /// finalization.
    pub fn set_persistent_store(&self, store: impl StateStore + 'static) -> SimResult<()> {
        self.check_not_finalized()?;
        *self.store.write() = Some(Arc::new(store));
        Ok(())
    }

    pub(crate) fn persistent_store(&self) -> Option<Arc<dyn StateStore>> {
        self.store.read().clone()
    }
}

impl std::fmt::Debug for Circuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Circuit")
            .field("blocks", &self.block_count())
            .field("finalized", &self.is_finalized())
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Builder for a combinational block.
pub struct CBlockBuilder {
    circuit: Arc<Circuit>,
    name: String,
    comment: String,
    debug: bool,
    on_output: Vec<Event>,
    logic: Arc<dyn CombLogic>,
    pub(crate) reserved: bool,
}

impl CBlockBuilder {
    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Add an event fired when the output actually changes.
    pub fn on_output(mut self, event: Event) -> Self {
        self.on_output.push(event);
        self
    }

    pub fn register(self) -> SimResult<BlockHandle> {
        let kind = BlockKind::Comb(CombEntry {
            logic: self.logic,
            inputs: RwLock::new(ConnState::Unconnected),
            on_output: self.on_output,
            depth: AtomicUsize::new(0),
        });
        self.circuit
            .register_entry(&self.name, self.comment, self.debug, self.reserved, kind)
    }
}

/// Builder for a sequential block.
pub struct SBlockBuilder {
    circuit: Arc<Circuit>,
    name: String,
    comment: String,
    debug: bool,
    on_output: Vec<Event>,
    on_every_output: Vec<Event>,
    initdef: Option<Value>,
    persistent: bool,
    sync_state: bool,
    expiration: Option<Duration>,
    init_timeout: Duration,
    stop_timeout: Duration,
    logic: Arc<dyn SeqLogic>,
    pub(crate) reserved: bool,
}

impl SBlockBuilder {
    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        self
    }

    /// Add an event fired when the output actually changes (including the
    /// first change from undefined).
    pub fn on_output(mut self, event: Event) -> Self {
        self.on_output.push(event);
        self
    }

    /// Add an event fired on every output assignment, changed or not.
    pub fn on_every_output(mut self, event: Event) -> Self {
        self.on_every_output.push(event);
        self
    }

    /// Default value applied by the last init strategy.
    pub fn initdef(mut self, value: Value) -> Self {
        self.initdef = Some(value);
        self
    }

    /// Opt into persistent state.
    pub fn persistent(mut self, enabled: bool) -> Self {
        self.persistent = enabled;
        self
    }

    /// Saved state older than this is treated as absent.
    pub fn expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Save state after every handled event (default: true).
    pub fn sync_state(mut self, enabled: bool) -> Self {
        self.sync_state = enabled;
        self
    }

    pub fn init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn register(self) -> SimResult<BlockHandle> {
        let initdef = self.initdef.or_else(|| self.logic.default_initdef());
        let persist = self.persistent.then_some(PersistOpts {
            expiration: self.expiration,
            sync_state: self.sync_state,
        });
        let kind = BlockKind::Seq(SeqEntry {
            logic: self.logic,
            event_active: AtomicBool::new(false),
            on_output: self.on_output,
            on_every_output: self.on_every_output,
            initdef,
            init_steps: std::sync::atomic::AtomicU8::new(0),
            persist: RwLock::new(persist),
            init_timeout: self.init_timeout,
            stop_timeout: self.stop_timeout,
        });
        self.circuit
            .register_entry(&self.name, self.comment, self.debug, self.reserved, kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_fixtures::{Noop, ValueStore};
    use serde_json::json;

    #[test]
    fn test_registration_and_lookup() {
        let circuit = Circuit::new_arc();
        let handle = circuit.sblock("inp", ValueStore).register().unwrap();
        assert_eq!(handle.name(), "inp");
        assert!(circuit.find_block("inp").is_ok());
        assert!(matches!(
            circuit.find_block("nope"),
            Err(CircuitError::NotFound(_))
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let circuit = Circuit::new_arc();
        circuit.sblock("x", Noop).register().unwrap();
        assert!(matches!(
            circuit.sblock("x", Noop).register(),
            Err(CircuitError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_reserved_names_rejected() {
        let circuit = Circuit::new_arc();
        assert!(circuit.sblock("_private", Noop).register().is_err());
        assert!(circuit.sblock("", Noop).register().is_err());
    }

    #[test]
    fn test_finalize_is_idempotent_and_freezes() {
        let circuit = Circuit::new_arc();
        circuit.sblock("a", ValueStore).register().unwrap();
        circuit.finalize().unwrap();
        circuit.finalize().unwrap();
        assert!(circuit.is_finalized());
        assert!(matches!(
            circuit.sblock("late", Noop).register(),
            Err(CircuitError::InvalidState(_))
        ));
    }

    #[test]
    fn test_not_shortcut_creates_single_inverter() {
        let circuit = Circuit::new_arc();
        circuit.sblock("x", ValueStore).register().unwrap();
        let a = circuit
            .cblock("a", crate::blocks::Invert)
            .register()
            .unwrap();
        a.connect(Connect::new().unnamed(["_not_x"])).unwrap();
        let b = circuit
            .cblock("b", crate::blocks::Invert)
            .register()
            .unwrap();
        b.connect(Connect::new().unnamed(["_not_x"])).unwrap();
        circuit.finalize().unwrap();
        assert!(circuit.find_block("_not_x").is_ok());
        // one inverter serving both references
        let names = circuit.block_names();
        assert_eq!(names.iter().filter(|n| n.as_str() == "_not_x").count(), 1);
    }

    #[test]
    fn test_no_double_inverter() {
        let circuit = Circuit::new_arc();
        circuit.sblock("x", ValueStore).register().unwrap();
        let a = circuit
            .cblock("a", crate::blocks::Invert)
            .register()
            .unwrap();
        a.connect(Connect::new().unnamed(["_not__not_x"])).unwrap();
        assert!(circuit.finalize().is_err());
    }

    #[test]
    fn test_missing_inverter_target() {
        let circuit = Circuit::new_arc();
        let a = circuit
            .cblock("a", crate::blocks::Invert)
            .register()
            .unwrap();
        a.connect(Connect::new().unnamed(["_not_ghost"])).unwrap();
        assert!(circuit.finalize().is_err());
    }

    #[test]
    fn test_ctrl_autocreation() {
        let circuit = Circuit::new_arc();
        circuit.sblock("x", ValueStore).register().unwrap();
        let _abort = Event::new_in(&circuit, "_ctrl", "abort");
        circuit.finalize().unwrap();
        assert!(circuit.find_block(CTRL_BLOCK_NAME).is_ok());
    }

    #[test]
    fn test_connect_once() {
        let circuit = Circuit::new_arc();
        circuit.sblock("x", ValueStore).register().unwrap();
        let inv = circuit
            .cblock("inv", crate::blocks::Invert)
            .register()
            .unwrap();
        inv.connect(Connect::new().unnamed(["x"])).unwrap();
        assert!(inv.connect(Connect::new().unnamed(["x"])).is_err());
    }

    #[test]
    fn test_set_debug_patterns() {
        let circuit = Circuit::new_arc();
        circuit.sblock("pump_a", Noop).register().unwrap();
        circuit.sblock("pump_b", Noop).register().unwrap();
        circuit.sblock("valve", Noop).register().unwrap();
        assert_eq!(circuit.set_debug(true, &["pump_*"]), 2);
        assert_eq!(circuit.set_debug(true, &["valve"]), 1);
        assert_eq!(circuit.set_debug(true, &["nothing_*"]), 0);
    }

    #[test]
    fn test_block_conf() {
        let circuit = Circuit::new_arc();
        let handle = circuit
            .sblock("pump", Noop)
            .comment("main pump")
            .register()
            .unwrap();
        let conf = handle.conf().unwrap();
        assert_eq!(conf.name, "pump");
        assert_eq!(conf.kind, "sequential");
        assert_eq!(conf.comment, "main pump");
        assert!(!conf.debug);
    }

    #[test]
    fn test_abort_first_wins() {
        let circuit = Circuit::new_arc();
        circuit.abort(CircuitError::InvalidState("first".into()));
        circuit.abort(CircuitError::InvalidState("second".into()));
        assert!(circuit.error().unwrap().to_string().contains("first"));
    }

    #[test]
    fn test_initdef_is_recorded() {
        let circuit = Circuit::new_arc();
        let handle = circuit
            .sblock("v", ValueStore)
            .initdef(json!(7))
            .register()
            .unwrap();
        let entry = circuit.entry(handle.id()).unwrap();
        assert_eq!(entry.seq().unwrap().initdef, Some(json!(7)));
    }
}
