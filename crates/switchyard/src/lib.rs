//! Event-driven, zero-delay circuit simulation for small automated
//! control systems.
//!
//! A *circuit* is assembled from interconnected *blocks* and run by a
//! single long-lived simulation that propagates value changes until the
//! circuit settles, dispatches typed events between stateful blocks,
//! manages timed state transitions and preserves selected block state
//! across restarts.
//!
//! ## Core concepts
//!
//! - **Combinational block** ([`CombLogic`]): a pure function from its
//!   input values to one output; re-evaluated by the propagation engine
//!   whenever an input changes.
//! - **Sequential block** ([`SeqLogic`]): internal state plus an output
//!   derived from it; driven by synchronously dispatched typed events.
//!   Optional capabilities (async init/cleanup, a long-lived main task)
//!   are probed through accessors on the logic.
//! - **FSM** ([`Fsm`]): a sequential block specialization driven by
//!   declarative transition tables with timed states, per-event
//!   conditions and enter/exit actions.
//! - **Circuit** ([`Circuit`]): the registry owning all blocks; names are
//!   resolved and the structure frozen by finalization. The `_not_<name>`
//!   producer shortcut inserts an inverter automatically.
//! - **Supervisor** ([`supervisor::run`]): hosts the simulation and the
//!   application's supporting tasks, converts SIGTERM into a clean stop
//!   and surfaces the first failure.
//!
//! ## A tiny circuit
//!
//! ```ignore
//! use switchyard::{circuit, supervisor, Connect, Event};
//!
//! let c = circuit::current();
//! let button = c.sblock("button", MyButton).register()?;
//! let light = c
//!     .cblock("light", MyDriverLogic)
//!     .register()?;
//! light.connect(Connect::new().unnamed(["_not_button"]))?;
//! supervisor::run(c, vec![], true).await?;
//! ```

pub mod blocks;
pub mod circuit;
pub mod filters;
pub mod supervisor;
pub mod test_fixtures;

mod block;
mod error;
mod event;
mod fsm;
mod persist;
mod simulator;
mod value;

pub use block::{
    check_signature, AsyncLogic, BlockConf, BlockCtx, BlockHandle, CombLogic, Connect,
    InputSignature, Inputs, MainTask, ProducerSpec, SeqLogic, UNNAMED_INPUT,
};
pub use circuit::{
    current, reset, CBlockBuilder, Circuit, NameCell, SBlockBuilder, CTRL_BLOCK_NAME,
    ENV_DEBUG_BLOCKS, ENV_DEBUG_CIRCUIT, NOT_PREFIX,
};
pub use error::{CircuitError, SimResult};
pub use event::{
    DestSpec, Event, EventCond, EventFilter, EventType, ExtEvent, FilterVerdict,
    EXT_SOURCE_PREFIX,
};
pub use fsm::{
    FromStates, Fsm, FsmDef, FsmDefBuilder, FsmHookCtx, FsmView, StateDuration, TimerSpec,
    INF_TIME,
};
pub use persist::{BrokenStore, MemoryStore, StateStore, StoredState};
pub use supervisor::{run, shield_from_cancel, spawn_monitored, support, SupportTask};
pub use value::{data_from, truthy, value_data, EventData, Value};
