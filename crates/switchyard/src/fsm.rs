//! Event-driven finite-state machine with optional timed states.
//!
//! An FSM is declared in two layers, the way the original transition
//! tables were split between the machine type and its instances:
//!
//! - [`FsmDef`] holds the declarative tables (states, transition rules,
//!   timers) shared by every instance; built once with [`FsmDefBuilder`]
//!   and validated for determinism.
//! - [`Fsm`] is a per-instance [`SeqLogic`] carrying durations overrides,
//!   per-event conditions, per-state enter/exit actions and outbound event
//!   configurations.
//!
//! Hooks receive their context explicitly; an enter action requests a
//! chained transition by calling [`FsmHookCtx::goto`] (allowed exactly once
//! per transition). The outside world sees a chained transition as one
//! direct state change: intermediate states produce no output updates and
//! no `on_enter`/`on_exit` events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::json;

use crate::block::{BlockCtx, SeqLogic};
use crate::error::{CircuitError, SimResult};
use crate::event::{Event, EventType};
use crate::value::{check_name, EventData, Value};

/// Duration of a timed state: finite, or never firing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StateDuration {
    Finite(Duration),
    Infinite,
}

/// The "never fires" timer duration.
pub const INF_TIME: StateDuration = StateDuration::Infinite;

impl StateDuration {
    /// Duration from seconds; negative values count as zero.
    pub fn secs(seconds: f64) -> Self {
        if seconds <= 0.0 {
            StateDuration::Finite(Duration::ZERO)
        } else {
            StateDuration::Finite(Duration::from_secs_f64(seconds))
        }
    }
}

impl From<Duration> for StateDuration {
    fn from(d: Duration) -> Self {
        StateDuration::Finite(d)
    }
}

/// Timer attached to a timed state.
#[derive(Debug, Clone)]
pub struct TimerSpec {
    /// Default duration; `None` must be supplied per instance.
    pub duration: Option<StateDuration>,
    /// Event dispatched to the block when the timer fires.
    pub event: EventType,
}

/// Source states of a transition rule.
#[derive(Debug, Clone)]
pub enum FromStates {
    /// Wildcard: any state, lower precedence than specific entries.
    Any,
    One(String),
    Many(Vec<String>),
}

impl From<&str> for FromStates {
    fn from(state: &str) -> Self {
        FromStates::One(state.to_string())
    }
}

impl From<Vec<&str>> for FromStates {
    fn from(states: Vec<&str>) -> Self {
        FromStates::Many(states.into_iter().map(str::to_string).collect())
    }
}

/// Declarative FSM tables: states, transition rules and timers.
#[derive(Debug)]
pub struct FsmDef {
    /// Declared states; the first is the default initial state.
    states: Vec<String>,
    /// Declared states plus implicit timed states.
    all_states: Vec<String>,
    /// Known event names.
    events: Vec<String>,
    /// `(event, Some(state) | None for wildcard)` to `Some(next)` or
    /// `None` ("explicitly not accepted").
    transitions: HashMap<(String, Option<String>), Option<String>>,
    timers: HashMap<String, TimerSpec>,
    default_state: String,
    chain_limit: usize,
}

impl FsmDef {
    pub fn builder() -> FsmDefBuilder {
        FsmDefBuilder::default()
    }

    pub fn default_state(&self) -> &str {
        &self.default_state
    }

    pub fn states(&self) -> &[String] {
        &self.all_states
    }

    fn check_state(&self, state: &str) -> SimResult<()> {
        if self.all_states.iter().any(|s| s == state) {
            Ok(())
        } else {
            Err(CircuitError::Config(format!("unknown state {state:?}")))
        }
    }

    fn has_event(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event)
    }
}

/// Builder validating the declarative tables.
#[derive(Debug, Default)]
pub struct FsmDefBuilder {
    states: Vec<String>,
    rules: Vec<(String, FromStates, Option<String>)>,
    timers: Vec<(String, Option<StateDuration>, EventType)>,
}

impl FsmDefBuilder {
    /// Declare the ordered state set; the first entry is the default
    /// initial state.
    pub fn states<I, S>(mut self, states: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.states = states.into_iter().map(Into::into).collect();
        self
    }

    /// Add a transition rule `(event, states) -> next_state`.
    pub fn event(mut self, event: &str, from: impl Into<FromStates>, next: &str) -> Self {
        self.rules
            .push((event.to_string(), from.into(), Some(next.to_string())));
        self
    }

    /// Declare that `event` is explicitly not accepted in the given states.
    pub fn event_rejected(mut self, event: &str, from: impl Into<FromStates>) -> Self {
        self.rules.push((event.to_string(), from.into(), None));
        self
    }

    /// Attach a timer to a state. The state is added implicitly if it is
    /// not declared. `duration = None` requires a per-instance duration.
    pub fn timer(
        mut self,
        state: &str,
        duration: Option<StateDuration>,
        event: impl Into<EventType>,
    ) -> Self {
        self.timers.push((state.to_string(), duration, event.into()));
        self
    }

    pub fn build(self) -> SimResult<Arc<FsmDef>> {
        let mut all_states = self.states.clone();
        for (state, _, _) in &self.timers {
            if !all_states.iter().any(|s| s == state) {
                all_states.push(state.clone());
            }
        }
        if all_states.is_empty() {
            return Err(CircuitError::Config(
                "cannot create a state machine with no states".into(),
            ));
        }
        for state in &all_states {
            check_name(state, "FSM state name", false)?;
        }
        let default_state = all_states[0].clone();
        let chain_limit = 3 * all_states.len();

        let mut def = FsmDef {
            states: self.states,
            all_states,
            events: Vec::new(),
            transitions: HashMap::new(),
            timers: HashMap::new(),
            default_state,
            chain_limit,
        };

        for (event, from, next) in self.rules {
            check_name(&event, "FSM event name", false)?;
            if !def.has_event(&event) {
                def.events.push(event.clone());
            }
            if let Some(next_state) = &next {
                def.check_state(next_state)?;
            }
            let from_states: Vec<Option<String>> = match from {
                FromStates::Any => vec![None],
                FromStates::One(s) => vec![Some(s)],
                FromStates::Many(states) => states.into_iter().map(Some).collect(),
            };
            for from_state in from_states {
                if let Some(s) = &from_state {
                    def.check_state(s)?;
                }
                let key = (event.clone(), from_state);
                if def.transitions.contains_key(&key) {
                    return Err(CircuitError::Config(format!(
                        "multiple transitions defined for event {:?} in state {:?}",
                        key.0, key.1
                    )));
                }
                def.transitions.insert(key, next.clone());
            }
        }

        for (state, duration, event) in self.timers {
            match &event {
                EventType::Goto(target) => def.check_state(target)?,
                EventType::Named(name) => {
                    if !def.has_event(name) {
                        return Err(CircuitError::Config(format!(
                            "timer for state {state:?}: undefined event {name:?}"
                        )));
                    }
                }
                EventType::Cond(_) => {
                    return Err(CircuitError::Config(format!(
                        "timer for state {state:?}: conditional events are not allowed here"
                    )))
                }
            }
            def.timers.insert(state, TimerSpec { duration, event });
        }

        Ok(Arc::new(def))
    }
}

/// Read-only context handed to per-event conditions.
pub struct FsmView<'a> {
    pub block: &'a BlockCtx,
    /// Data of the event under evaluation.
    pub data: &'a EventData,
    /// Current state (`None` while uninitialized).
    pub state: Option<&'a str>,
    /// Extra persistent state fields.
    pub sdata: &'a EventData,
}

/// Mutable context handed to enter/exit actions.
pub struct FsmHookCtx<'a> {
    pub block: &'a BlockCtx,
    /// Data of the event that triggered the transition.
    pub data: &'a EventData,
    /// State being entered or exited.
    pub state: &'a str,
    sdata: &'a mut EventData,
    goto: Option<&'a mut Option<String>>,
}

impl FsmHookCtx<'_> {
    /// Extra persistent state fields, mutable.
    pub fn sdata(&mut self) -> &mut EventData {
        self.sdata
    }

    /// Read access to the extra state fields.
    pub fn sdata_ref(&self) -> &EventData {
        self.sdata
    }

    /// Request a chained transition to `state`. Valid in enter actions
    /// only, at most once per transition.
    pub fn goto(&mut self, state: &str) -> SimResult<()> {
        match &mut self.goto {
            Some(slot) => {
                if slot.is_some() {
                    return Err(CircuitError::Block {
                        block: self.block.name(),
                        message: "forbidden event multiplication: two chained transitions \
                                  requested while handling a single event"
                            .into(),
                    });
                }
                **slot = Some(state.to_string());
                Ok(())
            }
            None => Err(CircuitError::Block {
                block: self.block.name(),
                message: "chained transitions may only be requested from an enter action".into(),
            }),
        }
    }
}

type CondFn = Box<dyn Fn(&FsmView<'_>) -> bool + Send + Sync>;
type HookFn = Box<dyn Fn(&mut FsmHookCtx<'_>) -> SimResult<()> + Send + Sync>;
type OutputFn = Box<dyn Fn(&str, &EventData) -> Option<Value> + Send + Sync>;

struct FsmInner {
    state: Option<String>,
    sdata: EventData,
    transition_active: bool,
    /// Wall-clock expiration of the pending timed event, kept for
    /// persistence (it survives `stop()` so the flushed state remains
    /// restorable).
    timer_deadline: Option<SystemTime>,
}

enum Resolution {
    To(String),
    No,
}

/// A finite-state machine instance: `SeqLogic` driven by declarative
/// tables.
pub struct Fsm {
    def: Arc<FsmDef>,
    durations: HashMap<String, StateDuration>,
    conds: HashMap<String, CondFn>,
    enters: HashMap<String, HookFn>,
    exits: HashMap<String, HookFn>,
    on_enter: HashMap<String, Vec<Event>>,
    on_exit: HashMap<String, Vec<Event>>,
    on_notrans: Vec<Event>,
    output_fn: Option<OutputFn>,
    inner: Mutex<FsmInner>,
}

impl Fsm {
    pub fn new(def: Arc<FsmDef>) -> Self {
        Self {
            def,
            durations: HashMap::new(),
            conds: HashMap::new(),
            enters: HashMap::new(),
            exits: HashMap::new(),
            on_enter: HashMap::new(),
            on_exit: HashMap::new(),
            on_notrans: Vec::new(),
            output_fn: None,
            inner: Mutex::new(FsmInner {
                state: None,
                sdata: EventData::new(),
                transition_active: false,
                timer_deadline: None,
            }),
        }
    }

    /// Override the timer duration of a timed state for this instance.
    pub fn duration(mut self, state: &str, duration: StateDuration) -> SimResult<Self> {
        if !self.def.timers.contains_key(state) {
            return Err(CircuitError::Config(format!(
                "{state:?} is not a timed state"
            )));
        }
        self.durations.insert(state.to_string(), duration);
        Ok(self)
    }

    /// Per-event condition; returning false rejects the event.
    pub fn cond(
        mut self,
        event: &str,
        cond: impl Fn(&FsmView<'_>) -> bool + Send + Sync + 'static,
    ) -> SimResult<Self> {
        if !self.def.has_event(event) {
            return Err(CircuitError::Config(format!("unknown event {event:?}")));
        }
        self.conds.insert(event.to_string(), Box::new(cond));
        Ok(self)
    }

    /// Per-state entry action.
    pub fn enter(
        mut self,
        state: &str,
        hook: impl Fn(&mut FsmHookCtx<'_>) -> SimResult<()> + Send + Sync + 'static,
    ) -> SimResult<Self> {
        self.def.check_state(state)?;
        self.enters.insert(state.to_string(), Box::new(hook));
        Ok(self)
    }

    /// Per-state exit action.
    pub fn exit(
        mut self,
        state: &str,
        hook: impl Fn(&mut FsmHookCtx<'_>) -> SimResult<()> + Send + Sync + 'static,
    ) -> SimResult<Self> {
        self.def.check_state(state)?;
        self.exits.insert(state.to_string(), Box::new(hook));
        Ok(self)
    }

    /// Outbound event sent after the state is entered.
    pub fn on_enter(mut self, state: &str, event: Event) -> SimResult<Self> {
        self.def.check_state(state)?;
        self.on_enter.entry(state.to_string()).or_default().push(event);
        Ok(self)
    }

    /// Outbound event sent when the state is exited.
    pub fn on_exit(mut self, state: &str, event: Event) -> SimResult<Self> {
        self.def.check_state(state)?;
        self.on_exit.entry(state.to_string()).or_default().push(event);
        Ok(self)
    }

    /// Outbound event sent when an event produces no transition.
    pub fn on_notrans(mut self, event: Event) -> Self {
        self.on_notrans.push(event);
        self
    }

    /// Custom output function `(state, sdata) -> output`; returning `None`
    /// leaves the output unchanged. The default output is the state name.
    pub fn with_output(
        mut self,
        output: impl Fn(&str, &EventData) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        self.output_fn = Some(Box::new(output));
        self
    }

    /// Current state (`None` while uninitialized).
    pub fn state(&self) -> Option<String> {
        self.inner.lock().state.clone()
    }

    /// Snapshot of the extra persistent state fields.
    pub fn sdata(&self) -> EventData {
        self.inner.lock().sdata.clone()
    }

    // ------------------------------------------------------------------
    // Transition machinery
    // ------------------------------------------------------------------

    fn send_notrans(&self, ctx: &BlockCtx, etype: &EventType) -> SimResult<()> {
        let state = self.inner.lock().state.clone();
        for event in &self.on_notrans {
            let mut data = EventData::new();
            data.insert("trigger".into(), json!("notrans"));
            if let Some(state) = &state {
                data.insert("state".into(), json!(state));
            }
            data.insert("event".into(), json!(etype.label()));
            event.send(ctx.circuit(), ctx.id, data)?;
        }
        Ok(())
    }

    fn send_state_events(
        &self,
        ctx: &BlockCtx,
        trigger: &str,
        state: &str,
        events: &HashMap<String, Vec<Event>>,
    ) -> SimResult<()> {
        let events = match events.get(state) {
            Some(events) => events,
            None => return Ok(()),
        };
        let sdata: EventData = self
            .inner
            .lock()
            .sdata
            .iter()
            .filter(|(k, _)| !k.starts_with('_'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for event in events {
            let mut data = EventData::new();
            data.insert("sdata".into(), Value::Object(sdata.clone()));
            data.insert("trigger".into(), json!(trigger));
            data.insert("state".into(), json!(state));
            if let Some(output) = ctx.output() {
                data.insert("value".into(), output);
            }
            event.send(ctx.circuit(), ctx.id, data)?;
        }
        Ok(())
    }

    fn run_hook(
        &self,
        ctx: &BlockCtx,
        hooks: &HashMap<String, HookFn>,
        state: &str,
        data: &EventData,
        mut goto: Option<&mut Option<String>>,
    ) -> SimResult<()> {
        let hook = match hooks.get(state) {
            Some(hook) => hook,
            None => return Ok(()),
        };
        let mut inner = self.inner.lock();
        let mut hctx = FsmHookCtx {
            block: ctx,
            data,
            state,
            sdata: &mut inner.sdata,
            goto: goto.take(),
        };
        hook(&mut hctx)
    }

    /// Resolve an event to the next state (steps 1-2 of the transition
    /// algorithm): table lookup or `Goto` bypass, then the condition.
    /// Fires `on_notrans` when the event is not accepted.
    fn resolve_next(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
    ) -> SimResult<Resolution> {
        match etype {
            EventType::Goto(state) => {
                self.def.check_state(state).map_err(|_| CircuitError::Block {
                    block: ctx.name(),
                    message: format!("goto: unknown state {state:?}"),
                })?;
                Ok(Resolution::To(state.clone()))
            }
            EventType::Named(name) => {
                if !self.def.has_event(name) {
                    return Err(CircuitError::UnknownEvent {
                        block: ctx.name(),
                        etype: name.clone(),
                    });
                }
                let current = self.inner.lock().state.clone();
                let specific = (name.clone(), current.clone());
                let next = match self.def.transitions.get(&specific) {
                    Some(next) => next.clone(),
                    None => self
                        .def
                        .transitions
                        .get(&(name.clone(), None))
                        .cloned()
                        .flatten(),
                };
                let next = match next {
                    Some(next) => next,
                    None => {
                        ctx.log_debug(format!(
                            "no transition defined for event {name:?} in state {current:?}"
                        ));
                        self.send_notrans(ctx, etype)?;
                        return Ok(Resolution::No);
                    }
                };
                if current.is_some() {
                    if let Some(cond) = self.conds.get(name) {
                        let accepted = {
                            let inner = self.inner.lock();
                            let view = FsmView {
                                block: ctx,
                                data,
                                state: inner.state.as_deref(),
                                sdata: &inner.sdata,
                            };
                            cond(&view)
                        };
                        if !accepted {
                            ctx.log_debug(format!(
                                "not executing event {name:?} ({current:?} -> {next:?}), \
                                 condition not satisfied"
                            ));
                            self.send_notrans(ctx, etype)?;
                            return Ok(Resolution::No);
                        }
                    }
                }
                Ok(Resolution::To(next))
            }
            EventType::Cond(_) => Err(CircuitError::UnknownEvent {
                block: ctx.name(),
                etype: etype.label(),
            }),
        }
    }

    fn resolve_duration(
        &self,
        ctx: &BlockCtx,
        state: &str,
        data: &EventData,
    ) -> SimResult<StateDuration> {
        if let Some(override_value) = data.get("duration") {
            let seconds = override_value.as_f64().ok_or_else(|| CircuitError::Block {
                block: ctx.name(),
                message: format!("duration override is not a number: {override_value}"),
            })?;
            return Ok(StateDuration::secs(seconds));
        }
        if let Some(d) = self.durations.get(state) {
            return Ok(*d);
        }
        let spec = &self.def.timers[state];
        spec.duration.ok_or_else(|| CircuitError::Block {
            block: ctx.name(),
            message: format!("timer duration for state {state:?} not set"),
        })
    }

    fn cancel_timer(&self, ctx: &BlockCtx) {
        let mut inner = self.inner.lock();
        if inner.timer_deadline.take().is_some() {
            ctx.log_debug("timer: cancelled");
        }
        drop(inner);
        ctx.circuit.cancel_block_timer(ctx.id);
    }

    fn start_timer(&self, ctx: &BlockCtx, duration: Duration, event: &EventType) -> SimResult<()> {
        ctx.log_debug(format!("timer: {duration:?} before {event}"));
        ctx.circuit
            .schedule_block_timer(ctx.id, duration, event.clone())?;
        self.inner.lock().timer_deadline = Some(SystemTime::now() + duration);
        Ok(())
    }

    /// Steps 3-9 of the transition algorithm, including chained
    /// transitions through zero-duration timers and enter-action gotos.
    fn run_transition(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
        first_next: String,
        current: Option<String>,
    ) -> SimResult<bool> {
        if let Some(current_state) = &current {
            self.run_hook(ctx, &self.exits, current_state, data, None)?;
            self.send_state_events(ctx, "exit", current_state, &self.on_exit)?;
            self.cancel_timer(ctx);
        }

        let mut pending: Option<(EventType, EventData, String)> =
            Some((etype.clone(), data.clone(), first_next));
        let mut iterations = 0usize;
        while let Some((event, event_data, next_state)) = pending.take() {
            iterations += 1;
            if iterations > self.def.chain_limit {
                return Err(CircuitError::Block {
                    block: ctx.name(),
                    message: "chained state transition limit reached (infinite loop?)".into(),
                });
            }
            {
                let mut inner = self.inner.lock();
                let from = inner.state.clone();
                if ctx.debug_enabled() {
                    tracing::debug!(
                        block = %ctx.name(),
                        from = ?from,
                        to = %next_state,
                        event = %event,
                        "state transition"
                    );
                }
                inner.state = Some(next_state.clone());
            }

            // enter action; it may request one chained transition
            let mut goto: Option<String> = None;
            self.run_hook(ctx, &self.enters, &next_state, &event_data, Some(&mut goto))?;
            if let Some(target) = goto {
                self.def.check_state(&target).map_err(|_| CircuitError::Block {
                    block: ctx.name(),
                    message: format!("chained goto: unknown state {target:?}"),
                })?;
                // intermediate state: exit silently, continue the chain
                self.run_hook(ctx, &self.exits, &next_state, &event_data, None)?;
                pending = Some((EventType::goto(&target), EventData::new(), target));
                continue;
            }

            if let Some(spec) = self.def.timers.get(&next_state) {
                let timed_event = spec.event.clone();
                match self.resolve_duration(ctx, &next_state, &event_data)? {
                    StateDuration::Infinite => {}
                    StateDuration::Finite(d) if d.is_zero() => {
                        ctx.log_debug(format!("timer: zero delay before {timed_event}"));
                        if let Resolution::To(next2) =
                            self.resolve_next(ctx, &timed_event, &EventData::new())?
                        {
                            self.run_hook(ctx, &self.exits, &next_state, &event_data, None)?;
                            pending = Some((timed_event, EventData::new(), next2));
                            continue;
                        }
                    }
                    StateDuration::Finite(d) => self.start_timer(ctx, d, &timed_event)?,
                }
            }
        }

        let (final_state, sdata) = {
            let inner = self.inner.lock();
            (inner.state.clone().unwrap_or_default(), inner.sdata.clone())
        };
        let output = match &self.output_fn {
            Some(f) => f(&final_state, &sdata),
            None => Some(json!(final_state)),
        };
        if let Some(value) = output {
            ctx.set_output(value)?;
        }
        self.send_state_events(ctx, "enter", &final_state, &self.on_enter)?;
        Ok(true)
    }

    fn transition(&self, ctx: &BlockCtx, etype: &EventType, data: &EventData) -> SimResult<bool> {
        let next = match self.resolve_next(ctx, etype, data)? {
            Resolution::To(next) => next,
            Resolution::No => return Ok(false),
        };
        let current = {
            let mut inner = self.inner.lock();
            if inner.transition_active {
                return Err(CircuitError::Block {
                    block: ctx.name(),
                    message: "forbidden recursive transition".into(),
                });
            }
            inner.transition_active = true;
            inner.state.clone()
        };
        let result = self.run_transition(ctx, etype, data, next, current);
        self.inner.lock().transition_active = false;
        result
    }
}

impl SeqLogic for Fsm {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
    ) -> SimResult<Value> {
        self.transition(ctx, etype, data).map(Value::Bool)
    }

    fn init_from_value(&self, ctx: &BlockCtx, value: &Value) -> SimResult<()> {
        let state = value.as_str().ok_or_else(|| CircuitError::Block {
            block: ctx.name(),
            message: format!("FSM initial state must be a string, got {value}"),
        })?;
        self.transition(ctx, &EventType::goto(state), &EventData::new())?;
        Ok(())
    }

    /// Internal state triple: `(state, timer expiration timestamp, sdata)`.
    fn get_state(&self, _ctx: &BlockCtx) -> SimResult<Value> {
        let inner = self.inner.lock();
        let expiration = inner.timer_deadline.and_then(|deadline| {
            deadline
                .duration_since(UNIX_EPOCH)
                .ok()
                .map(|d| json!(d.as_secs_f64()))
        });
        Ok(json!([
            inner.state.clone(),
            expiration.unwrap_or(Value::Null),
            Value::Object(inner.sdata.clone()),
        ]))
    }

    /// Restore a state saved by `get_state`. Conditions, enter actions and
    /// `on_enter` events do not run: the state was entered in the past and
    /// is only being resumed. An expired timed state is ignored.
    fn restore_state(&self, ctx: &BlockCtx, state: &Value) -> SimResult<()> {
        let parts = state.as_array().ok_or_else(|| CircuitError::Block {
            block: ctx.name(),
            message: format!("unrecognized saved state: {state}"),
        })?;
        if parts.len() < 2 {
            return Err(CircuitError::Block {
                block: ctx.name(),
                message: format!("unrecognized saved state: {state}"),
            });
        }
        let state_name = parts[0].as_str().ok_or_else(|| CircuitError::Block {
            block: ctx.name(),
            message: format!("saved state name is not a string: {}", parts[0]),
        })?;
        self.def.check_state(state_name)?;
        let sdata = match parts.get(2) {
            Some(Value::Object(map)) => map.clone(),
            _ => EventData::new(),
        };

        if let Some(expiration) = parts[1].as_f64() {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let remaining = expiration - now;
            if remaining <= 0.0 {
                ctx.log_debug("restore state: ignoring expired state");
                return Ok(());
            }
            let spec = self
                .def
                .timers
                .get(state_name)
                .ok_or_else(|| CircuitError::Block {
                    block: ctx.name(),
                    message: format!("cannot set a timer for a not timed state {state_name:?}"),
                })?;
            self.start_timer(ctx, Duration::from_secs_f64(remaining), &spec.event.clone())?;
        }

        {
            let mut inner = self.inner.lock();
            inner.state = Some(state_name.to_string());
            inner.sdata = sdata;
        }
        ctx.log_debug(format!("state: <undef> -> {state_name} (restored)"));
        let (final_state, sdata) = {
            let inner = self.inner.lock();
            (inner.state.clone().unwrap_or_default(), inner.sdata.clone())
        };
        let output = match &self.output_fn {
            Some(f) => f(&final_state, &sdata),
            None => Some(json!(final_state)),
        };
        if let Some(value) = output {
            ctx.set_output(value)?;
        }
        Ok(())
    }

    fn stop(&self, ctx: &BlockCtx) -> SimResult<()> {
        // Cancel the scheduled wake-up but keep the recorded deadline:
        // the stop-time state flush must still persist the expiration.
        ctx.circuit.cancel_block_timer(ctx.id);
        Ok(())
    }

    fn default_initdef(&self) -> Option<Value> {
        Some(json!(self.def.default_state))
    }
}

impl<L: SeqLogic> SeqLogic for Arc<L> {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        data: &EventData,
    ) -> SimResult<Value> {
        (**self).handle_event(ctx, etype, data)
    }

    fn init_regular(&self, ctx: &BlockCtx) -> SimResult<()> {
        (**self).init_regular(ctx)
    }

    fn init_from_value(&self, ctx: &BlockCtx, value: &Value) -> SimResult<()> {
        (**self).init_from_value(ctx, value)
    }

    fn get_state(&self, ctx: &BlockCtx) -> SimResult<Value> {
        (**self).get_state(ctx)
    }

    fn restore_state(&self, ctx: &BlockCtx, state: &Value) -> SimResult<()> {
        (**self).restore_state(ctx, state)
    }

    fn start(&self, ctx: &BlockCtx) -> SimResult<()> {
        (**self).start(ctx)
    }

    fn stop(&self, ctx: &BlockCtx) -> SimResult<()> {
        (**self).stop(ctx)
    }

    fn default_initdef(&self) -> Option<Value> {
        (**self).default_initdef()
    }

    fn as_async(&self) -> Option<&dyn crate::block::AsyncLogic> {
        (**self).as_async()
    }

    fn as_main_task(&self) -> Option<&dyn crate::block::MainTask> {
        (**self).as_main_task()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turnstile_def() -> Arc<FsmDef> {
        FsmDef::builder()
            .states(["locked", "unlocked"])
            .event("coin", "locked", "unlocked")
            .event("push", "unlocked", "locked")
            .build()
            .unwrap()
    }

    #[test]
    fn test_def_builder_validation() {
        assert!(FsmDef::builder().build().is_err());

        let dup = FsmDef::builder()
            .states(["a", "b"])
            .event("go", "a", "b")
            .event("go", "a", "a")
            .build();
        assert!(dup.is_err());

        let bad_next = FsmDef::builder()
            .states(["a"])
            .event("go", "a", "missing")
            .build();
        assert!(bad_next.is_err());

        let bad_timer_event = FsmDef::builder()
            .states(["a"])
            .timer("a", Some(StateDuration::secs(1.0)), "undefined_event")
            .build();
        assert!(bad_timer_event.is_err());
    }

    #[test]
    fn test_default_state() {
        let def = turnstile_def();
        assert_eq!(def.default_state(), "locked");

        // timer-only states become implicit states; the first declared
        // state still wins as the default
        let def = FsmDef::builder()
            .states(["idle"])
            .timer("busy", Some(INF_TIME), EventType::goto("idle"))
            .build()
            .unwrap();
        assert_eq!(def.default_state(), "idle");
        assert_eq!(def.states().len(), 2);
    }

    #[test]
    fn test_timer_only_fsm_default() {
        let def = FsmDef::builder()
            .timer("on", Some(StateDuration::secs(0.5)), EventType::goto("off"))
            .timer("off", Some(StateDuration::secs(0.5)), EventType::goto("on"))
            .build()
            .unwrap();
        assert_eq!(def.default_state(), "on");
    }

    #[test]
    fn test_instance_duration_validation() {
        let def = turnstile_def();
        let fsm = Fsm::new(def);
        assert!(fsm.duration("locked", StateDuration::secs(1.0)).is_err());
    }

    #[test]
    fn test_state_duration_secs() {
        assert_eq!(
            StateDuration::secs(-1.0),
            StateDuration::Finite(Duration::ZERO)
        );
        assert_eq!(
            StateDuration::secs(0.5),
            StateDuration::Finite(Duration::from_millis(500))
        );
    }
}
