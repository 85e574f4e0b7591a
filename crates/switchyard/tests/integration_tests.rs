//! End-to-end tests driving whole circuits through the supervisor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde_json::json;

use switchyard::blocks::Invert;
use switchyard::test_fixtures::{timer_fsm, EventMemory, Noop, ValueStore};
use switchyard::{
    support, supervisor, AsyncLogic, BlockCtx, Circuit, CircuitError, CombLogic, Connect, Event,
    EventData, EventType, ExtEvent, FilterVerdict, Fsm, FsmDef, Inputs, MainTask, MemoryStore,
    SeqLogic, SimResult, StateDuration, Value,
};

// ============================================================================
// Test logic blocks
// ============================================================================

/// Two-input XOR; undefined inputs count as false.
struct Xor;

impl CombLogic for Xor {
    fn calc_output(&self, inputs: &Inputs) -> SimResult<Value> {
        let values = inputs.unnamed()?;
        let a = values
            .first()
            .cloned()
            .flatten()
            .map(|v| switchyard::truthy(&v))
            .unwrap_or(false);
        let b = values
            .get(1)
            .cloned()
            .flatten()
            .map(|v| switchyard::truthy(&v))
            .unwrap_or(false);
        Ok(json!(a != b))
    }
}

/// A sensor delivering its value asynchronously after a delay.
struct SlowSensor {
    delay: Duration,
    value: Value,
}

impl SeqLogic for SlowSensor {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        _data: &EventData,
    ) -> SimResult<Value> {
        Err(CircuitError::UnknownEvent {
            block: ctx.name(),
            etype: etype.label(),
        })
    }

    fn as_async(&self) -> Option<&dyn AsyncLogic> {
        Some(self)
    }
}

#[async_trait]
impl AsyncLogic for SlowSensor {
    async fn init_async(&self, ctx: BlockCtx) -> SimResult<()> {
        tokio::time::sleep(self.delay).await;
        // an event may have initialized the block meanwhile
        if !ctx.is_initialized() {
            ctx.set_output(self.value.clone())?;
        }
        Ok(())
    }
}

/// A block with a long-lived main task and async cleanup.
struct Worker {
    stopped: Arc<AtomicBool>,
    exit_early: bool,
}

impl Worker {
    fn new(stopped: Arc<AtomicBool>) -> Self {
        Self {
            stopped,
            exit_early: false,
        }
    }
}

impl SeqLogic for Worker {
    fn handle_event(
        &self,
        ctx: &BlockCtx,
        etype: &EventType,
        _data: &EventData,
    ) -> SimResult<Value> {
        Err(CircuitError::UnknownEvent {
            block: ctx.name(),
            etype: etype.label(),
        })
    }

    fn init_regular(&self, ctx: &BlockCtx) -> SimResult<()> {
        ctx.set_output(json!("ready"))
    }

    fn as_async(&self) -> Option<&dyn AsyncLogic> {
        Some(self)
    }

    fn as_main_task(&self) -> Option<&dyn MainTask> {
        Some(self)
    }
}

#[async_trait]
impl AsyncLogic for Worker {
    async fn stop_async(&self, _ctx: BlockCtx) -> SimResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl MainTask for Worker {
    async fn run(&self, _ctx: BlockCtx) -> SimResult<()> {
        if self.exit_early {
            tokio::time::sleep(Duration::from_millis(10)).await;
            return Ok(());
        }
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn counting_filter(counter: Arc<AtomicUsize>) -> impl Fn(&mut EventData) -> FilterVerdict {
    move |_data: &mut EventData| {
        counter.fetch_add(1, Ordering::SeqCst);
        FilterVerdict::Accept
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn settle() {
    for _ in 0..4 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// FSM scenarios
// ============================================================================

#[tokio::test]
async fn test_turnstile() {
    init_tracing();
    let circuit = Circuit::new_arc();
    let def = FsmDef::builder()
        .states(["locked", "unlocked"])
        .event("coin", "locked", "unlocked")
        .event("push", "unlocked", "locked")
        .build()
        .unwrap();
    let gate = circuit
        .sblock("turnstile", Fsm::new(def))
        .register()
        .unwrap();

    let driver_circuit = circuit.clone();
    let driver_gate = gate.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            let gate = driver_gate;
            assert_eq!(gate.output(), Some(json!("locked")));
            assert_eq!(gate.event("push", EventData::new())?, json!(false));
            assert_eq!(gate.output(), Some(json!("locked")));
            assert_eq!(gate.event("coin", EventData::new())?, json!(true));
            assert_eq!(gate.output(), Some(json!("unlocked")));
            assert_eq!(gate.event("push", EventData::new())?, json!(true));
            assert_eq!(gate.output(), Some(json!("locked")));
            assert_eq!(gate.event("coin", EventData::new())?, json!(true));
            assert_eq!(gate.event("coin", EventData::new())?, json!(false));
            assert_eq!(gate.output(), Some(json!("unlocked")));
            assert_eq!(gate.event("push", EventData::new())?, json!(true));
            assert_eq!(gate.output(), Some(json!("locked")));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_square_wave() {
    init_tracing();
    let circuit = Circuit::new_arc();
    let def = FsmDef::builder()
        .timer("off", Some(StateDuration::secs(0.5)), EventType::goto("on"))
        .timer("on", Some(StateDuration::secs(0.5)), EventType::goto("off"))
        .build()
        .unwrap();
    let wave = Fsm::new(def).with_output(|state, _| Some(json!(state == "on")));
    let clock = circuit.sblock("clock", wave).register().unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            let mut samples = Vec::new();
            // sample in the middle of each half-period
            tokio::time::sleep(Duration::from_millis(250)).await;
            for _ in 0..5 {
                samples.push(clock.output());
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            assert_eq!(
                samples,
                vec![
                    Some(json!(false)),
                    Some(json!(true)),
                    Some(json!(false)),
                    Some(json!(true)),
                    Some(json!(false)),
                ]
            );
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_restartable() {
    let circuit = Circuit::new_arc();
    let restartable = timer_fsm(true)
        .duration("on", StateDuration::secs(1.0))
        .unwrap();
    let timer = circuit.sblock("timer", restartable).register().unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            timer.event("start", EventData::new())?;
            assert_eq!(timer.output(), Some(json!(true)));
            tokio::time::sleep(Duration::from_millis(600)).await;
            // restart extends the running timer to t = 1.6
            assert_eq!(timer.event("start", EventData::new())?, json!(true));
            tokio::time::sleep(Duration::from_millis(700)).await; // t = 1.3
            assert_eq!(timer.output(), Some(json!(true)));
            tokio::time::sleep(Duration::from_millis(500)).await; // t = 1.8
            assert_eq!(timer.output(), Some(json!(false)));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_not_restartable() {
    let circuit = Circuit::new_arc();
    let fixed = timer_fsm(false)
        .duration("on", StateDuration::secs(1.0))
        .unwrap();
    let timer = circuit.sblock("timer", fixed).register().unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            timer.event("start", EventData::new())?;
            tokio::time::sleep(Duration::from_millis(600)).await;
            // the running timer is left untouched
            assert_eq!(timer.event("start", EventData::new())?, json!(false));
            tokio::time::sleep(Duration::from_millis(700)).await; // t = 1.3
            assert_eq!(timer.output(), Some(json!(false)));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timer_duration_override_in_event_data() {
    let circuit = Circuit::new_arc();
    // the machine default never fires; the event data supplies the duration
    let timer = circuit.sblock("timer", timer_fsm(true)).register().unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            let mut data = EventData::new();
            data.insert("duration".into(), json!(0.3));
            timer.event("start", data)?;
            assert_eq!(timer.output(), Some(json!(true)));
            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(timer.output(), Some(json!(false)));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test]
async fn test_chained_transition_hides_intermediate_state() {
    let circuit = Circuit::new_arc();
    let visited: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let s2_events = circuit.sblock("s2_events", EventMemory).register().unwrap();
    let s3_events = circuit.sblock("s3_events", EventMemory).register().unwrap();

    let def = FsmDef::builder()
        .states(["s1", "s2", "s3"])
        .event("go", "s1", "s2")
        .build()
        .unwrap();
    let enter_log = visited.clone();
    let enter_log2 = visited.clone();
    let fsm = Fsm::new(def)
        .enter("s2", move |ctx| {
            enter_log.lock().unwrap().push("enter_s2".into());
            ctx.goto("s3")
        })
        .unwrap()
        .enter("s3", move |_ctx| {
            enter_log2.lock().unwrap().push("enter_s3".into());
            Ok(())
        })
        .unwrap()
        .on_enter("s2", Event::new_in(&circuit, &s2_events, "mark"))
        .unwrap()
        .on_enter("s3", Event::new_in(&circuit, &s3_events, "mark"))
        .unwrap();
    let machine = circuit.sblock("machine", fsm).register().unwrap();

    machine
        .event(EventType::goto("s1"), EventData::new())
        .unwrap();
    assert_eq!(machine.output(), Some(json!("s1")));

    machine.event("go", EventData::new()).unwrap();
    // the outside world sees one direct s1 -> s3 transition
    assert_eq!(machine.output(), Some(json!("s3")));
    assert_eq!(
        visited.lock().unwrap().as_slice(),
        ["enter_s2".to_string(), "enter_s3".to_string()]
    );
    // the intermediate state produced no on_enter event
    assert_eq!(s2_events.output(), None);
    let recorded = s3_events.output().unwrap();
    assert_eq!(recorded[1]["state"], json!("s3"));
}

#[tokio::test]
async fn test_zero_duration_timer_chains() {
    let circuit = Circuit::new_arc();
    let def = FsmDef::builder()
        .states(["idle", "pulse"])
        .event("fire", "idle", "pulse")
        .timer("pulse", Some(StateDuration::secs(0.0)), EventType::goto("idle"))
        .build()
        .unwrap();
    let machine = circuit
        .sblock("machine", Fsm::new(def))
        .register()
        .unwrap();

    machine
        .event(EventType::goto("idle"), EventData::new())
        .unwrap();
    assert_eq!(machine.event("fire", EventData::new()).unwrap(), json!(true));
    // the zero-delay pulse state collapses back to idle synchronously
    assert_eq!(machine.output(), Some(json!("idle")));
}

#[tokio::test]
async fn test_fsm_notrans_and_conditions() {
    let circuit = Circuit::new_arc();
    let notrans = circuit.sblock("notrans", EventMemory).register().unwrap();
    let def = FsmDef::builder()
        .states(["a", "b"])
        .event("go", "a", "b")
        .build()
        .unwrap();
    let fsm = Fsm::new(def)
        .cond("go", |view| view.data.get("force").is_some())
        .unwrap()
        .on_notrans(Event::new_in(&circuit, &notrans, "note"));
    let machine = circuit.sblock("machine", fsm).register().unwrap();
    machine
        .event(EventType::goto("a"), EventData::new())
        .unwrap();

    // condition rejects: no transition, on_notrans fires
    assert_eq!(machine.event("go", EventData::new()).unwrap(), json!(false));
    assert_eq!(machine.output(), Some(json!("a")));
    let note = notrans.output().unwrap();
    assert_eq!(note[1]["trigger"], json!("notrans"));
    assert_eq!(note[1]["event"], json!("go"));

    // condition satisfied
    let mut data = EventData::new();
    data.insert("force".into(), json!(true));
    assert_eq!(machine.event("go", data).unwrap(), json!(true));
    assert_eq!(machine.output(), Some(json!("b")));
}

// ============================================================================
// Propagation
// ============================================================================

#[tokio::test]
async fn test_inverter_shortcut_follows_driver() {
    let circuit = Circuit::new_arc();
    let driver = circuit
        .sblock("x", ValueStore)
        .initdef(json!(0))
        .register()
        .unwrap();
    // two consumers referencing the same shortcut
    let first = circuit.cblock("first", Invert).register().unwrap();
    first.connect(Connect::new().unnamed(["_not_x"])).unwrap();
    let second = circuit.cblock("second", Invert).register().unwrap();
    second.connect(Connect::new().unnamed(["_not_x"])).unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit.clone(),
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            let inverter = driver_circuit.find_block("_not_x")?;
            settle().await;
            assert_eq!(inverter.output(), Some(json!(true)));

            driver.put(json!(1))?;
            settle().await;
            assert_eq!(inverter.output(), Some(json!(false)));

            driver.put(json!(1))?;
            settle().await;
            assert_eq!(inverter.output(), Some(json!(false)));

            driver.put(json!(0))?;
            settle().await;
            assert_eq!(inverter.output(), Some(json!(true)));

            // only one inverter was created for both references
            let names = driver_circuit.block_names();
            assert_eq!(names.iter().filter(|n| n.as_str() == "_not_x").count(), 1);
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test]
async fn test_instability_inverter_ring() {
    let circuit = Circuit::new_arc();
    let a = circuit.cblock("A", Invert).register().unwrap();
    a.connect(Connect::new().unnamed(["B"])).unwrap();
    let b = circuit.cblock("B", Invert).register().unwrap();
    b.connect(Connect::new().unnamed(["C"])).unwrap();
    let c = circuit.cblock("C", Invert).register().unwrap();
    c.connect(Connect::new().unnamed(["A"])).unwrap();

    let result = supervisor::run(circuit, vec![], false).await;
    assert!(matches!(result, Err(CircuitError::Instability { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_stable_circuit_becomes_unstable() {
    let circuit = Circuit::new_arc();
    let ctrl = circuit
        .sblock("ctrl", ValueStore)
        .initdef(json!(false))
        .register()
        .unwrap();
    let xor = circuit.cblock("xor", Xor).register().unwrap();
    xor.connect(Connect::new().unnamed(["ctrl", "xor"]))
        .unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            settle().await;
            // stable while the feedback is neutral
            assert!(driver_circuit.find_block("xor")?.output().is_some());
            ctrl.put(json!(true))?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })],
        false,
    )
    .await;
    assert!(matches!(result, Err(CircuitError::Instability { .. })));
}

// ============================================================================
// Events, filters, dispatch
// ============================================================================

#[tokio::test]
async fn test_edge_rise_filter_delivery_count() {
    let circuit = Circuit::new_arc();
    let memory = circuit.sblock("memory", EventMemory).register().unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let event = Event::new_in(&circuit, &memory, "put")
        .with_filter(switchyard::filters::Edge::new().rise(true))
        .with_filter(counting_filter(delivered.clone()));
    let source = circuit
        .sblock("source", ValueStore)
        .on_output(event)
        .register()
        .unwrap();

    for value in [false, true, true, false, true] {
        source.put(json!(value)).unwrap();
    }
    // two rising edges pass; the repeated true does not even fire on_output
    assert_eq!(delivered.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_on_every_output_fires_without_propagating() {
    let circuit = Circuit::new_arc();
    let sink = circuit.sblock("sink", EventMemory).register().unwrap();
    let changed = Arc::new(AtomicUsize::new(0));
    let every = Arc::new(AtomicUsize::new(0));
    let source = circuit
        .sblock("source", ValueStore)
        .on_output(
            Event::new_in(&circuit, &sink, "changed").with_filter(counting_filter(changed.clone())),
        )
        .on_every_output(
            Event::new_in(&circuit, &sink, "any").with_filter(counting_filter(every.clone())),
        )
        .register()
        .unwrap();

    source.put(json!(1)).unwrap();
    source.put(json!(1)).unwrap();
    source.put(json!(2)).unwrap();
    assert_eq!(changed.load(Ordering::SeqCst), 2);
    assert_eq!(every.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_filter_rejection_stops_the_pipeline() {
    let circuit = Circuit::new_arc();
    let memory = circuit.sblock("memory", EventMemory).register().unwrap();
    let after_reject = Arc::new(AtomicUsize::new(0));
    let event = Event::new_in(&circuit, &memory, "put")
        .with_filter(|_data: &mut EventData| FilterVerdict::Reject)
        .with_filter(counting_filter(after_reject.clone()));
    let source = circuit
        .sblock("source", ValueStore)
        .on_output(event)
        .register()
        .unwrap();

    source.put(json!(1)).unwrap();
    assert_eq!(after_reject.load(Ordering::SeqCst), 0);
    assert_eq!(memory.output(), None);
}

#[tokio::test]
async fn test_filter_replaces_payload() {
    let circuit = Circuit::new_arc();
    let memory = circuit.sblock("memory", EventMemory).register().unwrap();
    let event = Event::new_in(&circuit, &memory, "put").with_filter(|data: &mut EventData| {
        let mut replacement = EventData::new();
        replacement.insert("value".into(), data.get("value").cloned().unwrap_or_default());
        replacement.insert("edited".into(), json!(true));
        FilterVerdict::Replace(replacement)
    });
    let source = circuit
        .sblock("source", ValueStore)
        .on_output(event)
        .register()
        .unwrap();

    source.put(json!(5)).unwrap();
    let recorded = memory.output().unwrap();
    assert_eq!(recorded[1]["edited"], json!(true));
    assert_eq!(recorded[1]["value"], json!(5));
    assert!(recorded[1].get("trigger").is_none());
}

#[tokio::test]
async fn test_conditional_event_resolution() {
    let circuit = Circuit::new_arc();
    let memory = circuit.sblock("memory", EventMemory).register().unwrap();

    let cond = EventType::cond(Some("went_up".into()), None);
    memory
        .event(cond.clone(), switchyard::value_data(json!(true)))
        .unwrap();
    let recorded = memory.output().unwrap();
    assert_eq!(recorded[0], json!("went_up"));

    // the falsy branch is "no event"
    memory
        .event(cond, switchyard::value_data(json!(false)))
        .unwrap();
    let recorded_after = memory.output().unwrap();
    assert_eq!(recorded_after[0], json!("went_up"));
}

#[tokio::test]
async fn test_unknown_event_is_not_fatal() {
    let circuit = Circuit::new_arc();
    let block = circuit.sblock("noop", Noop).register().unwrap();
    let result = block.event("mystery", EventData::new());
    assert!(matches!(result, Err(CircuitError::UnknownEvent { .. })));
    assert!(circuit.error().is_none());
}

#[tokio::test]
async fn test_recursive_event_is_fatal() {
    let circuit = Circuit::new_arc();
    // a -> b by forward name reference, b -> a by handle: an event loop
    let a = circuit
        .sblock("a", ValueStore)
        .on_output(Event::new_in(&circuit, "b", "put"))
        .register()
        .unwrap();
    circuit
        .sblock("b", ValueStore)
        .on_output(Event::new_in(&circuit, &a, "put"))
        .register()
        .unwrap();
    circuit.finalize().unwrap();

    let result = a.put(json!(1));
    assert!(result.is_err());
    assert!(matches!(
        circuit.error(),
        Some(CircuitError::RecursiveEvent { .. })
    ));
}

#[tokio::test]
async fn test_external_event_source_tagging() {
    let circuit = Circuit::new_arc();
    let memory = circuit.sblock("memory", EventMemory).register().unwrap();
    let ext = ExtEvent::new(&circuit, &memory, "put")
        .unwrap()
        .with_source("device");
    assert_eq!(ext.source(), "_ext_device");

    // not ready yet
    assert!(matches!(
        ext.send(json!(1)),
        Err(CircuitError::InvalidState(_))
    ));

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            ext.send(json!(1))?;
            let recorded = memory.output().unwrap();
            assert_eq!(recorded[1]["source"], json!("_ext_device"));
            assert_eq!(recorded[1]["value"], json!(1));

            let mut data = EventData::new();
            data.insert("source".into(), json!("panel"));
            data.insert("value".into(), json!(2));
            ext.send_data(data)?;
            let recorded = memory.output().unwrap();
            assert_eq!(recorded[1]["source"], json!("_ext_panel"));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test]
async fn test_event_sent_during_init_initializes_destination_early() {
    let circuit = Circuit::new_arc();
    let announce = Event::new_in(&circuit, "late", "put");
    let _early = circuit
        .sblock("early", ValueStore)
        .initdef(json!(7))
        .on_output(announce)
        .register()
        .unwrap();
    let late = circuit.sblock("late", EventMemory).register().unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            let recorded = late.output().unwrap();
            assert_eq!(recorded[0], json!("put"));
            assert_eq!(recorded[1]["value"], json!(7));
            assert_eq!(recorded[1]["source"], json!("early"));
            assert_eq!(recorded[1]["trigger"], json!("output"));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_event() {
    let circuit = Circuit::new_arc();
    let memory = circuit.sblock("memory", EventMemory).register().unwrap();
    let event = Event::repeated(&circuit, &memory, "put", Duration::from_secs(1), Some(2)).unwrap();
    let source = circuit
        .sblock("source", ValueStore)
        .initdef(json!("alive"))
        .on_output(event)
        .register()
        .unwrap();
    let _ = source;

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit.clone(),
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            // the original event arrives synchronously during init
            let recorded = memory.output().unwrap();
            assert_eq!(recorded[1]["repeat"], json!(0));
            assert_eq!(recorded[1]["orig_source"], json!("source"));

            tokio::time::sleep(Duration::from_millis(3500)).await;
            let recorded = memory.output().unwrap();
            // capped at two repeats
            assert_eq!(recorded[1]["repeat"], json!(2));
            let repeater = driver_circuit.find_block("_repeat_0")?;
            assert_eq!(repeater.output(), Some(json!(2)));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

// ============================================================================
// Lifecycle, supervisor, persistence
// ============================================================================

#[tokio::test]
async fn test_initialization_failure_aborts_start() {
    let circuit = Circuit::new_arc();
    // no initdef, no init_regular, no events: stays undefined
    circuit.sblock("orphan", ValueStore).register().unwrap();
    let result = supervisor::run(circuit, vec![], false).await;
    assert!(matches!(result, Err(CircuitError::InitializationFailed(_))));
}

#[tokio::test]
async fn test_empty_circuit_cannot_start() {
    let circuit = Circuit::new_arc();
    let result = supervisor::run(circuit, vec![], false).await;
    assert!(matches!(result, Err(CircuitError::InvalidState(_))));
}

#[tokio::test(start_paused = true)]
async fn test_async_init_applies_value() {
    let circuit = Circuit::new_arc();
    let sensor = circuit
        .sblock(
            "sensor",
            SlowSensor {
                delay: Duration::from_millis(50),
                value: json!(21.5),
            },
        )
        .register()
        .unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            assert_eq!(sensor.output(), Some(json!(21.5)));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_async_init_timeout_falls_back_to_default() {
    let circuit = Circuit::new_arc();
    let sensor = circuit
        .sblock(
            "sensor",
            SlowSensor {
                delay: Duration::from_secs(3600),
                value: json!(21.5),
            },
        )
        .init_timeout(Duration::from_secs(1))
        .initdef(json!("fallback"))
        .register()
        .unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            assert_eq!(sensor.output(), Some(json!("fallback")));
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
}

#[tokio::test]
async fn test_main_task_early_exit_aborts_simulation() {
    let circuit = Circuit::new_arc();
    let stopped = Arc::new(AtomicBool::new(false));
    let mut worker = Worker::new(stopped);
    worker.exit_early = true;
    circuit.sblock("worker", worker).register().unwrap();

    let result = supervisor::run(circuit, vec![], false).await;
    match result {
        Err(CircuitError::Block { block, message }) => {
            assert_eq!(block, "worker");
            assert!(message.contains("unexpected main task termination"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_graceful_shutdown_stops_worker_and_flushes_state() {
    let circuit = Circuit::new_arc();
    let store = MemoryStore::new();
    circuit.set_persistent_store(store.clone()).unwrap();
    let stopped = Arc::new(AtomicBool::new(false));
    circuit
        .sblock("worker", Worker::new(stopped.clone()))
        .persistent(true)
        .register()
        .unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await;
    result.unwrap();
    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(store.get_json("worker"), Some(json!("ready")));
}

#[cfg(unix)]
#[tokio::test]
async fn test_sigterm_triggers_graceful_stop() {
    let circuit = Circuit::new_arc();
    let store = MemoryStore::new();
    circuit.set_persistent_store(store.clone()).unwrap();
    let stopped = Arc::new(AtomicBool::new(false));
    circuit
        .sblock("worker", Worker::new(stopped.clone()))
        .persistent(true)
        .register()
        .unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            let pid = std::process::id().to_string();
            std::process::Command::new("kill")
                .args(["-TERM", pid.as_str()])
                .status()
                .expect("kill is available");
            std::future::pending::<()>().await;
            Ok(())
        })],
        true,
    )
    .await;
    result.unwrap();
    assert!(stopped.load(Ordering::SeqCst));
    assert_eq!(store.get_json("worker"), Some(json!("ready")));
}

#[tokio::test]
async fn test_control_block_abort_event() {
    let circuit = Circuit::new_arc();
    let trip = Event::abort_event(&circuit);
    let source = circuit
        .sblock("panic_button", ValueStore)
        .initdef(json!(false))
        .on_output(trip.with_filter(switchyard::filters::Edge::new().rise(true)))
        .register()
        .unwrap();

    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            source.put(json!(true))?;
            std::future::pending::<()>().await;
            Ok(())
        })],
        false,
    )
    .await;
    match result {
        Err(CircuitError::Block { block, .. }) => assert_eq!(block, "panic_button"),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_persistence_roundtrip_and_expiration() {
    let store = MemoryStore::new();

    // first life: state is saved on every event and at stop
    {
        let circuit = Circuit::new_arc();
        circuit.set_persistent_store(store.clone()).unwrap();
        let value = circuit
            .sblock("v", ValueStore)
            .persistent(true)
            .initdef(json!(1))
            .register()
            .unwrap();
        let driver_circuit = circuit.clone();
        supervisor::run(
            circuit,
            vec![support("driver", async move {
                driver_circuit.wait_init().await?;
                assert_eq!(value.output(), Some(json!(1)));
                value.put(json!(42))?;
                driver_circuit.shutdown().await
            })],
            false,
        )
        .await
        .unwrap();
        assert_eq!(store.get_json("v"), Some(json!(42)));
    }

    // second life: restored from the store, not from initdef
    {
        let circuit = Circuit::new_arc();
        circuit.set_persistent_store(store.clone()).unwrap();
        let value = circuit
            .sblock("v", ValueStore)
            .persistent(true)
            .initdef(json!(1))
            .register()
            .unwrap();
        let driver_circuit = circuit.clone();
        supervisor::run(
            circuit,
            vec![support("driver", async move {
                driver_circuit.wait_init().await?;
                assert_eq!(value.output(), Some(json!(42)));
                driver_circuit.shutdown().await
            })],
            false,
        )
        .await
        .unwrap();
    }

    // third life: the record is too old, fall back to initdef
    {
        store.put_json(
            "v",
            &json!(99),
            Some(SystemTime::now() - Duration::from_secs(100)),
        );
        let circuit = Circuit::new_arc();
        circuit.set_persistent_store(store.clone()).unwrap();
        let value = circuit
            .sblock("v", ValueStore)
            .persistent(true)
            .expiration(Duration::from_secs(10))
            .initdef(json!(1))
            .register()
            .unwrap();
        let driver_circuit = circuit.clone();
        supervisor::run(
            circuit,
            vec![support("driver", async move {
                driver_circuit.wait_init().await?;
                assert_eq!(value.output(), Some(json!(1)));
                driver_circuit.shutdown().await
            })],
            false,
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_unused_persistent_records_are_pruned() {
    let store = MemoryStore::new();
    store.put_json("ghost", &json!("old"), Some(SystemTime::now()));

    let circuit = Circuit::new_arc();
    circuit.set_persistent_store(store.clone()).unwrap();
    circuit
        .sblock("v", ValueStore)
        .persistent(true)
        .initdef(json!(0))
        .register()
        .unwrap();
    let driver_circuit = circuit.clone();
    supervisor::run(
        circuit,
        vec![support("driver", async move {
            driver_circuit.wait_init().await?;
            driver_circuit.shutdown().await
        })],
        false,
    )
    .await
    .unwrap();
    assert_eq!(store.get_json("ghost"), None);
    assert!(store.get_json("v").is_some());
}

#[tokio::test(start_paused = true)]
async fn test_fsm_timed_state_survives_restart() {
    let store = MemoryStore::new();
    let def = FsmDef::builder()
        .states(["armed"])
        .timer("waiting", Some(StateDuration::secs(5.0)), EventType::goto("armed"))
        .build()
        .unwrap();

    {
        let circuit = Circuit::new_arc();
        circuit.set_persistent_store(store.clone()).unwrap();
        let machine = circuit
            .sblock("m", Fsm::new(def.clone()))
            .persistent(true)
            .register()
            .unwrap();
        let driver_circuit = circuit.clone();
        supervisor::run(
            circuit,
            vec![support("driver", async move {
                driver_circuit.wait_init().await?;
                machine.event(EventType::goto("waiting"), EventData::new())?;
                driver_circuit.shutdown().await
            })],
            false,
        )
        .await
        .unwrap();
        // the flushed state still carries the timer expiration
        let saved = store.get_json("m").unwrap();
        assert_eq!(saved[0], json!("waiting"));
        assert!(saved[1].is_f64());
    }

    {
        let circuit = Circuit::new_arc();
        circuit.set_persistent_store(store.clone()).unwrap();
        let machine = circuit
            .sblock("m", Fsm::new(def))
            .persistent(true)
            .register()
            .unwrap();
        let driver_circuit = circuit.clone();
        supervisor::run(
            circuit,
            vec![support("driver", async move {
                driver_circuit.wait_init().await?;
                assert_eq!(machine.output(), Some(json!("waiting")));
                // the restored timer still fires
                tokio::time::sleep(Duration::from_secs(6)).await;
                assert_eq!(machine.output(), Some(json!("armed")));
                driver_circuit.shutdown().await
            })],
            false,
        )
        .await
        .unwrap();
    }
}

#[tokio::test]
async fn test_supporting_task_failure_is_reported() {
    let circuit = Circuit::new_arc();
    circuit
        .sblock("v", ValueStore)
        .initdef(json!(0))
        .register()
        .unwrap();
    let driver_circuit = circuit.clone();
    let result = supervisor::run(
        circuit,
        vec![support("feeder", async move {
            driver_circuit.wait_init().await?;
            Err(CircuitError::Config("feeder broke".into()))
        })],
        false,
    )
    .await;
    match result {
        Err(CircuitError::Block { block, message }) => {
            assert_eq!(block, "feeder");
            assert!(message.contains("feeder broke"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_global_circuit_reset() {
    let circuit = switchyard::current();
    circuit
        .sblock("v", ValueStore)
        .initdef(json!(0))
        .register()
        .unwrap();
    let runner = tokio::spawn(supervisor::run(circuit.clone(), vec![], false));
    circuit.wait_init().await.unwrap();
    switchyard::reset().await;
    let outcome = runner.await.unwrap();
    assert!(outcome.is_ok());

    let fresh = switchyard::current();
    assert!(!Arc::ptr_eq(&circuit, &fresh));
    assert_eq!(fresh.block_count(), 0);
}
