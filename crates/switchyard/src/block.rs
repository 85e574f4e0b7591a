//! Circuit blocks: the combinational/sequential logic seams, capability
//! traits and the engine-side block records.
//!
//! User code implements [`CombLogic`] or [`SeqLogic`] and registers the
//! logic through the builders on [`crate::circuit::Circuit`]. The engine
//! owns one [`BlockEntry`] per registered block; logic objects are shared
//! `Arc<dyn ...>` values, so stateful logic uses interior mutability the
//! same way rules do in a rule registry.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::RwLock;

use crate::circuit::Circuit;
use crate::error::{CircuitError, SimResult};
use crate::event::{Event, EventType};
use crate::value::{EventData, Value};

/// Engine-internal block identifier (stable registration index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) usize);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A producer reference as written by the user, before finalization.
#[derive(Debug, Clone)]
pub enum ProducerSpec {
    /// Reference by block name, resolved at finalization. The `_not_<name>`
    /// inversion shortcut is an ordinary name here.
    Name(String),
    /// A constant value usable anywhere a producer is expected.
    Const(Value),
}

impl ProducerSpec {
    /// A constant producer.
    pub fn constant(value: Value) -> Self {
        ProducerSpec::Const(value)
    }
}

impl From<&str> for ProducerSpec {
    fn from(name: &str) -> Self {
        ProducerSpec::Name(name.to_string())
    }
}

impl From<String> for ProducerSpec {
    fn from(name: String) -> Self {
        ProducerSpec::Name(name)
    }
}

impl From<&BlockHandle> for ProducerSpec {
    fn from(handle: &BlockHandle) -> Self {
        ProducerSpec::Name(handle.name())
    }
}

/// A resolved producer.
#[derive(Debug, Clone)]
pub(crate) enum Producer {
    Const(Value),
    Block(BlockId),
}

/// One named input slot specification.
#[derive(Debug, Clone)]
pub(crate) enum SlotSpec {
    Single(ProducerSpec),
    Group(Vec<ProducerSpec>),
}

/// One named input slot after finalization.
#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Single(Producer),
    Group(Vec<Producer>),
}

/// Name of the anonymous input group used by single-purpose blocks.
pub const UNNAMED_INPUT: &str = "_";

/// Input connection builder for combinational blocks.
///
/// ```ignore
/// handle.connect(Connect::new().unnamed(["a", "b"]))?;
/// handle.connect(Connect::new().single("input", "src").single("override", "ovr"))?;
/// ```
#[derive(Debug, Default)]
pub struct Connect {
    pub(crate) slots: IndexMap<String, SlotSpec>,
}

impl Connect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a single named input.
    pub fn single(mut self, name: &str, producer: impl Into<ProducerSpec>) -> Self {
        self.slots
            .insert(name.to_string(), SlotSpec::Single(producer.into()));
        self
    }

    /// Connect an ordered input group.
    pub fn group<I, P>(mut self, name: &str, producers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProducerSpec>,
    {
        let group = producers.into_iter().map(Into::into).collect();
        self.slots.insert(name.to_string(), SlotSpec::Group(group));
        self
    }

    /// Connect the anonymous input group (positional inputs).
    pub fn unnamed<I, P>(self, producers: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<ProducerSpec>,
    {
        self.group(UNNAMED_INPUT, producers)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Input signature: slot name to `None` (single input) or `Some(len)`
/// (group arity).
pub type InputSignature = IndexMap<String, Option<usize>>;

/// Snapshot of input values handed to [`CombLogic::calc_output`].
///
/// Each value is `None` while its producer is still undefined.
#[derive(Debug, Clone)]
pub struct Inputs {
    slots: IndexMap<String, SlotValues>,
}

#[derive(Debug, Clone)]
pub(crate) enum SlotValues {
    Single(Option<Value>),
    Group(Vec<Option<Value>>),
}

impl Inputs {
    pub(crate) fn new(slots: IndexMap<String, SlotValues>) -> Self {
        Self { slots }
    }

    /// Value of a single input.
    pub fn single(&self, name: &str) -> SimResult<&Option<Value>> {
        match self.slots.get(name) {
            Some(SlotValues::Single(v)) => Ok(v),
            Some(SlotValues::Group(_)) => Err(CircuitError::Config(format!(
                "input {name:?} is a group, not a single input"
            ))),
            None => Err(CircuitError::Config(format!("no input named {name:?}"))),
        }
    }

    /// Values of an input group, in connection order.
    pub fn group(&self, name: &str) -> SimResult<&[Option<Value>]> {
        match self.slots.get(name) {
            Some(SlotValues::Group(v)) => Ok(v),
            Some(SlotValues::Single(_)) => Err(CircuitError::Config(format!(
                "input {name:?} is a single input, not a group"
            ))),
            None => Err(CircuitError::Config(format!("no input named {name:?}"))),
        }
    }

    /// Values of the anonymous input group.
    pub fn unnamed(&self) -> SimResult<&[Option<Value>]> {
        self.group(UNNAMED_INPUT)
    }

    /// The actual input signature of this snapshot.
    pub fn signature(&self) -> InputSignature {
        self.slots
            .iter()
            .map(|(name, slot)| {
                let arity = match slot {
                    SlotValues::Single(_) => None,
                    SlotValues::Group(g) => Some(g.len()),
                };
                (name.clone(), arity)
            })
            .collect()
    }
}

/// Compare an actual signature against an expected shape.
///
/// `None` expects a single input; `Some(n)` expects a group of exactly `n`
/// producers.
pub fn check_signature(
    actual: &InputSignature,
    expected: &[(&str, Option<usize>)],
) -> SimResult<()> {
    let expected_names: Vec<&str> = expected.iter().map(|(n, _)| *n).collect();
    for name in actual.keys() {
        if !expected_names.contains(&name.as_str()) {
            return Err(CircuitError::Config(format!(
                "not connected correctly: unexpected input {name:?} (accepted: {expected_names:?})"
            )));
        }
    }
    for (name, arity) in expected {
        match (actual.get(*name), arity) {
            (None, _) => {
                return Err(CircuitError::Config(format!(
                    "not connected correctly: missing input {name:?}"
                )))
            }
            (Some(None), None) => {}
            (Some(Some(_)), None) => {
                return Err(CircuitError::Config(format!(
                    "input {name:?} is a group, expected a single input"
                )))
            }
            (Some(None), Some(_)) => {
                return Err(CircuitError::Config(format!(
                    "input {name:?} is a single input, expected a group"
                )))
            }
            (Some(Some(actual_len)), Some(want)) if actual_len != want => {
                return Err(CircuitError::Config(format!(
                    "group {name:?}: input count is {actual_len}, expected {want}"
                )))
            }
            _ => {}
        }
    }
    Ok(())
}

/// Combinational logic: a pure function from input values to the output.
pub trait CombLogic: Send + Sync + 'static {
    /// Compute the next output from the current input snapshot.
    fn calc_output(&self, inputs: &Inputs) -> SimResult<Value>;

    /// Validate the connected input signature. Called once at start.
    fn check_connections(&self, signature: &InputSignature) -> SimResult<()> {
        let _ = signature;
        Ok(())
    }
}

/// Per-block context passed to logic callbacks and async capabilities.
///
/// Cheap to clone; owning it keeps the circuit alive, which lets async
/// capabilities move it into spawned tasks.
#[derive(Clone)]
pub struct BlockCtx {
    pub(crate) circuit: Arc<Circuit>,
    pub(crate) id: BlockId,
}

impl BlockCtx {
    pub(crate) fn new(circuit: Arc<Circuit>, id: BlockId) -> Self {
        Self { circuit, id }
    }

    pub fn name(&self) -> String {
        self.circuit.block_name(self.id)
    }

    pub fn circuit(&self) -> &Arc<Circuit> {
        &self.circuit
    }

    /// Current output value (`None` = undefined).
    pub fn output(&self) -> Option<Value> {
        self.circuit.output_of(self.id)
    }

    pub fn is_initialized(&self) -> bool {
        self.output().is_some()
    }

    /// Assign a new output value; drives propagation and output events.
    pub fn set_output(&self, value: Value) -> SimResult<()> {
        self.circuit.set_output(self.id, value)
    }

    /// Whether per-block debug records are enabled for this block.
    pub fn debug_enabled(&self) -> bool {
        self.circuit.debug_enabled(self.id)
    }

    /// Emit a block-tagged debug record if this block's debug flag is set.
    pub fn log_debug(&self, message: impl AsRef<str>) {
        if self.debug_enabled() {
            tracing::debug!(block = %self.name(), "{}", message.as_ref());
        }
    }

    /// A child cancellation token tied to the simulation lifetime.
    pub fn cancel_token(&self) -> tokio_util::sync::CancellationToken {
        self.circuit.cancel_token().child_token()
    }
}

impl fmt::Debug for BlockCtx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCtx")
            .field("block", &self.name())
            .finish()
    }
}

/// Sequential logic: a block with internal state that accepts typed events.
///
/// The capability accessors replace mixin inheritance: the engine probes
/// each logic for the optional interfaces it implements.
pub trait SeqLogic: Send + Sync + 'static {
    /// Handle one event. Return the handler's result value.
    ///
    /// Unrecognized event types must return [`CircuitError::UnknownEvent`];
    /// it is reported to the sender and is the only non-fatal handler error.
    fn handle_event(&self, ctx: &BlockCtx, etype: &EventType, data: &EventData)
        -> SimResult<Value>;

    /// Synchronous initialization (third init strategy).
    fn init_regular(&self, ctx: &BlockCtx) -> SimResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Initialize from a supplied default value (fourth init strategy).
    /// The default implementation ignores the value.
    fn init_from_value(&self, ctx: &BlockCtx, value: &Value) -> SimResult<()> {
        let _ = (ctx, value);
        Ok(())
    }

    /// Internal state for persistence. Defaults to the output value.
    fn get_state(&self, ctx: &BlockCtx) -> SimResult<Value> {
        Ok(ctx.output().unwrap_or(Value::Null))
    }

    /// Restore state saved by [`SeqLogic::get_state`]. Defaults to
    /// [`SeqLogic::init_from_value`].
    fn restore_state(&self, ctx: &BlockCtx, state: &Value) -> SimResult<()> {
        self.init_from_value(ctx, state)
    }

    /// Pre-simulation hook (acquire resources).
    fn start(&self, ctx: &BlockCtx) -> SimResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Post-simulation hook. Must tolerate a partially completed start.
    fn stop(&self, ctx: &BlockCtx) -> SimResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Implicit `initdef` supplied by the logic itself (the FSM uses this
    /// for its default initial state).
    fn default_initdef(&self) -> Option<Value> {
        None
    }

    /// Async init/stop capability.
    fn as_async(&self) -> Option<&dyn AsyncLogic> {
        None
    }

    /// Long-lived service task capability.
    fn as_main_task(&self) -> Option<&dyn MainTask> {
        None
    }
}

/// Cooperative async init and cleanup, awaited under per-block timeouts.
#[async_trait]
pub trait AsyncLogic: Send + Sync {
    /// Second init strategy, run concurrently across blocks. If an event
    /// initializes the block first, the routine must not overwrite that.
    async fn init_async(&self, ctx: BlockCtx) -> SimResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Async cleanup before the synchronous `stop`.
    async fn stop_async(&self, ctx: BlockCtx) -> SimResult<()> {
        let _ = ctx;
        Ok(())
    }
}

/// A single long-lived task attached to the block's lifetime. The
/// supervisor aborts the simulation if it terminates before shutdown.
#[async_trait]
pub trait MainTask: Send + Sync {
    async fn run(&self, ctx: BlockCtx) -> SimResult<()>;
}

/// Static block description for host diagnostics.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BlockConf {
    pub name: String,
    pub kind: &'static str,
    pub comment: String,
    pub debug: bool,
}

/// Persistence configuration of a sequential block.
#[derive(Debug, Clone)]
pub(crate) struct PersistOpts {
    pub expiration: Option<Duration>,
    pub sync_state: bool,
}

pub(crate) struct SeqEntry {
    pub logic: Arc<dyn SeqLogic>,
    /// Re-entry guard: set while the block's handler runs.
    pub event_active: AtomicBool,
    pub on_output: Vec<Event>,
    pub on_every_output: Vec<Event>,
    pub initdef: Option<Value>,
    /// Completed synchronous init steps (0, 1 or 2).
    pub init_steps: AtomicU8,
    /// `None` when the block does not participate in persistence (or was
    /// downgraded because no store is configured).
    pub persist: RwLock<Option<PersistOpts>>,
    pub init_timeout: Duration,
    pub stop_timeout: Duration,
}

pub(crate) enum ConnState {
    Unconnected,
    Specs(IndexMap<String, SlotSpec>),
    Resolved(IndexMap<String, Slot>),
}

pub(crate) struct CombEntry {
    pub logic: Arc<dyn CombLogic>,
    pub inputs: RwLock<ConnState>,
    pub on_output: Vec<Event>,
    /// Combinational depth, used to order the initial full evaluation.
    pub depth: AtomicUsize,
}

pub(crate) enum BlockKind {
    Comb(CombEntry),
    Seq(SeqEntry),
}

/// Engine-side record of one registered block.
pub(crate) struct BlockEntry {
    pub id: BlockId,
    pub name: String,
    pub comment: String,
    pub debug: AtomicBool,
    pub output: RwLock<Option<Value>>,
    /// Downstream combinational consumers, in registration order.
    pub oconn: RwLock<Vec<BlockId>>,
    pub started: AtomicBool,
    pub kind: BlockKind,
}

impl BlockEntry {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            BlockKind::Comb(_) => "combinational",
            BlockKind::Seq(_) => "sequential",
        }
    }

    pub fn seq(&self) -> Option<&SeqEntry> {
        match &self.kind {
            BlockKind::Seq(s) => Some(s),
            BlockKind::Comb(_) => None,
        }
    }

    pub fn comb(&self) -> Option<&CombEntry> {
        match &self.kind {
            BlockKind::Comb(c) => Some(c),
            BlockKind::Seq(_) => None,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.output.read().is_some()
    }

    /// Static block description for host diagnostics.
    pub fn conf(&self) -> BlockConf {
        BlockConf {
            name: self.name.clone(),
            kind: self.kind_name(),
            comment: self.comment.clone(),
            debug: self.debug.load(Ordering::Relaxed),
        }
    }
}

/// User-facing handle to a registered block.
#[derive(Clone)]
pub struct BlockHandle {
    pub(crate) circuit: Arc<Circuit>,
    pub(crate) id: BlockId,
}

impl BlockHandle {
    pub fn name(&self) -> String {
        self.circuit.block_name(self.id)
    }

    /// Current output (`None` = undefined).
    pub fn output(&self) -> Option<Value> {
        self.circuit.output_of(self.id)
    }

    pub fn is_initialized(&self) -> bool {
        self.output().is_some()
    }

    /// Deliver an event to this (sequential) block and return the handler's
    /// result.
    pub fn event(&self, etype: impl Into<EventType>, data: EventData) -> SimResult<Value> {
        self.circuit.deliver(self.id, &etype.into(), data)
    }

    /// Shortcut for the conventional `put` event carrying `value`.
    pub fn put(&self, value: Value) -> SimResult<Value> {
        self.event("put", crate::value::value_data(value))
    }

    /// Connect inputs (combinational blocks only; at most once, before
    /// finalization).
    pub fn connect(&self, connections: Connect) -> SimResult<&Self> {
        self.circuit.connect(self.id, connections)?;
        Ok(self)
    }

    /// Enable or disable per-block debug records.
    pub fn set_debug(&self, enabled: bool) {
        self.circuit.set_block_debug(self.id, enabled);
    }

    /// Static block description.
    pub fn conf(&self) -> Option<BlockConf> {
        self.circuit.block_conf(self.id)
    }

    pub(crate) fn id(&self) -> BlockId {
        self.id
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<block {:?}>", self.name())
    }
}
