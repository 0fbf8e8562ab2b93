//! End-to-end component scenarios: lifecycle, buffer flow, tunneling,
//! flush and port reconfiguration, driven through the public host API
//! with a channel-instrumented fake host.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use omxcore::{
    CommandReq, Component, ComponentDefinition, HostCallbacks, IlEvent, PcmPortModel, PortConfig,
    Processor, ProcessorContext, Runtime, WatcherKey,
};
use omxil::{
    AudioEncoding, AudioPortDefinition, BufferFlags, BufferSupplier, Command, ComponentId, Dir,
    HeaderRef, IlError, IlResult, Index, Mark, PcmModeType, PortFormat, PortSelector, State,
    TunnelSetup,
};

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------
// Fake host
// ---------------------------------------------------------------------

struct TestHost {
    events: mpsc::UnboundedSender<IlEvent>,
    empty_done: mpsc::UnboundedSender<HeaderRef>,
    fill_done: mpsc::UnboundedSender<HeaderRef>,
}

#[async_trait]
impl HostCallbacks for TestHost {
    async fn event_handler(&self, _source: ComponentId, event: IlEvent) {
        let _ = self.events.send(event);
    }

    async fn empty_buffer_done(&self, _source: ComponentId, hdr: HeaderRef) {
        let _ = self.empty_done.send(hdr);
    }

    async fn fill_buffer_done(&self, _source: ComponentId, hdr: HeaderRef) {
        let _ = self.fill_done.send(hdr);
    }
}

struct HostRx {
    events: mpsc::UnboundedReceiver<IlEvent>,
    empty_done: mpsc::UnboundedReceiver<HeaderRef>,
    fill_done: mpsc::UnboundedReceiver<HeaderRef>,
}

fn fake_host() -> (Arc<TestHost>, HostRx) {
    let (ev_tx, ev_rx) = mpsc::unbounded_channel();
    let (ebd_tx, ebd_rx) = mpsc::unbounded_channel();
    let (fbd_tx, fbd_rx) = mpsc::unbounded_channel();
    (
        Arc::new(TestHost {
            events: ev_tx,
            empty_done: ebd_tx,
            fill_done: fbd_tx,
        }),
        HostRx {
            events: ev_rx,
            empty_done: ebd_rx,
            fill_done: fbd_rx,
        },
    )
}

impl HostRx {
    async fn next_event(&mut self) -> IlEvent {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event channel closed")
    }

    /// Waits for the first event matching `pred`, skipping unrelated ones.
    async fn expect_event(&mut self, pred: impl Fn(&IlEvent) -> bool) -> IlEvent {
        loop {
            let event = self.next_event().await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn expect_state_complete(&mut self, expected: State) {
        self.expect_event(
            |e| matches!(e, IlEvent::StateSetComplete { state, error: None } if *state == expected),
        )
        .await;
    }

    async fn expect_cmd_complete(&mut self, command: Command, pid: u32) {
        self.expect_event(|e| {
            matches!(e, IlEvent::CmdComplete { command: c, pid: p, error: None }
                     if *c == command && *p == pid)
        })
        .await;
    }

    async fn assert_no_event(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            self.events.try_recv().is_err(),
            "expected no pending events"
        );
    }

    async fn next_empty_done(&mut self) -> HeaderRef {
        timeout(WAIT, self.empty_done.recv())
            .await
            .expect("timed out waiting for EmptyBufferDone")
            .expect("channel closed")
    }

    async fn next_fill_done(&mut self) -> HeaderRef {
        timeout(WAIT, self.fill_done.recv())
            .await
            .expect("timed out waiting for FillBufferDone")
            .expect("channel closed")
    }
}

// ---------------------------------------------------------------------
// Processor fixtures
// ---------------------------------------------------------------------

fn audio_format() -> PortFormat {
    PortFormat::Audio(AudioPortDefinition {
        mime_type: "audio/x-raw".into(),
        encoding: AudioEncoding::Pcm,
    })
}

/// Copies every input buffer of port 0 into an output buffer of port 1,
/// flags included. Never holds buffers across hook invocations.
struct PassThrough;

#[async_trait]
impl Processor for PassThrough {
    async fn buffers_ready(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        while ctx.ingress_len(0) > 0 && ctx.ingress_len(1) > 0 {
            let Some(inb) = ctx.claim_buffer(0, 0)? else { break };
            let Some(outb) = ctx.claim_buffer(1, 0)? else {
                ctx.release_buffer(0, inb)?;
                break;
            };
            {
                let src = inb.lock().unwrap();
                let mut dst = outb.lock().unwrap();
                let n = src.filled_len.min(dst.alloc_len);
                if let Some(payload) = src.payload() {
                    if let Some(out) = dst.payload_mut() {
                        out[..n].copy_from_slice(&payload[..n]);
                    }
                }
                dst.filled_len = n;
                dst.flags = src.flags;
                dst.timestamp = src.timestamp;
            }
            ctx.release_buffer(0, inb)?;
            ctx.release_buffer(1, outb)?;
        }
        Ok(())
    }
}

fn passthrough_component(name: &str) -> ComponentDefinition {
    ComponentDefinition::new(name, "audio_filter.pass", Box::new(PassThrough))
        .with_port(
            PortConfig::new(Dir::Input, audio_format())
                .buffer_count(2)
                .buffer_size(16)
                .model(Box::new(PcmPortModel::new(PcmModeType::stereo_48k(0)))),
        )
        .with_port(
            PortConfig::new(Dir::Output, audio_format())
                .buffer_count(2)
                .buffer_size(16)
                .model(Box::new(PcmPortModel::new(PcmModeType::stereo_48k(1)))),
        )
}

async fn spawned_passthrough(rt: &Runtime, name: &str) -> (Component, HostRx) {
    let comp = rt.spawn_component(passthrough_component(name));
    let (host, rx) = fake_host();
    comp.set_callbacks(host);
    (comp, rx)
}

/// Brings a fresh pass-through component to Executing and returns the
/// four host buffers (two per port).
async fn to_executing(comp: &Component, rx: &mut HostRx) -> (Vec<HeaderRef>, Vec<HeaderRef>) {
    comp.send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for _ in 0..2 {
        inputs.push(comp.use_buffer(0, vec![0; 16]).await.unwrap());
        outputs.push(comp.use_buffer(1, vec![0; 16]).await.unwrap());
    }
    rx.expect_state_complete(State::Idle).await;
    comp.send_command(CommandReq::StateSet(State::Executing))
        .await
        .unwrap();
    rx.expect_state_complete(State::Executing).await;
    (inputs, outputs)
}

// ---------------------------------------------------------------------
// Scenario 1: Loaded -> Idle -> Executing, two ports, two buffers each
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_loaded_idle_executing_lifecycle() {
    let rt = Runtime::default();
    let (comp, mut rx) = spawned_passthrough(&rt, "pass.lifecycle").await;

    assert_eq!(comp.get_state().await, State::Loaded);

    comp.send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    // No completion before the buffers arrive.
    rx.assert_no_event().await;

    let mut headers = Vec::new();
    headers.push(comp.use_buffer(0, vec![0; 16]).await.unwrap());
    headers.push(comp.use_buffer(0, vec![0; 16]).await.unwrap());
    headers.push(comp.use_buffer(1, vec![0; 16]).await.unwrap());
    rx.assert_no_event().await;
    headers.push(comp.use_buffer(1, vec![0; 16]).await.unwrap());

    rx.expect_state_complete(State::Idle).await;
    assert_eq!(comp.get_state().await, State::Idle);

    comp.send_command(CommandReq::StateSet(State::Executing))
        .await
        .unwrap();
    rx.expect_state_complete(State::Executing).await;
    assert_eq!(comp.get_state().await, State::Executing);

    // And back down: Idle, then Loaded once every buffer is freed.
    comp.send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    rx.expect_state_complete(State::Idle).await;

    comp.send_command(CommandReq::StateSet(State::Loaded))
        .await
        .unwrap();
    comp.free_buffer(0, &headers[0]).await.unwrap();
    comp.free_buffer(0, &headers[1]).await.unwrap();
    comp.free_buffer(1, &headers[2]).await.unwrap();
    comp.free_buffer(1, &headers[3]).await.unwrap();
    rx.expect_state_complete(State::Loaded).await;

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Scenario 2: EOS propagation, plus per-port FIFO ordering
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_eos_propagation_and_fifo_order() {
    let rt = Runtime::default();
    let (comp, mut rx) = spawned_passthrough(&rt, "pass.eos").await;
    let (inputs, outputs) = to_executing(&comp, &mut rx).await;

    for out in &outputs {
        comp.fill_this_buffer(out.clone()).await.unwrap();
    }

    inputs[0].lock().unwrap().filled_len = 4;
    inputs[0].lock().unwrap().payload_mut().unwrap()[..4].copy_from_slice(b"one!");
    comp.empty_this_buffer(inputs[0].clone()).await.unwrap();

    {
        let mut h = inputs[1].lock().unwrap();
        h.filled_len = 4;
        h.payload_mut().unwrap()[..4].copy_from_slice(b"two!");
        h.flags = BufferFlags::EOS;
    }
    comp.empty_this_buffer(inputs[1].clone()).await.unwrap();

    // Input buffers come back in submission order.
    let first = rx.next_empty_done().await;
    let second = rx.next_empty_done().await;
    assert!(Arc::ptr_eq(&first, &inputs[0]));
    assert!(Arc::ptr_eq(&second, &inputs[1]));

    // Output buffers carry the copied payload, EOS included.
    let out1 = rx.next_fill_done().await;
    assert_eq!(out1.lock().unwrap().payload().unwrap(), b"one!");
    let out2 = rx.next_fill_done().await;
    {
        let h = out2.lock().unwrap();
        assert_eq!(h.payload().unwrap(), b"two!");
        assert!(h.flags.contains(BufferFlags::EOS));
    }

    // The kernel reported end-of-stream on the input port.
    rx.expect_event(|e| {
        matches!(e, IlEvent::BufferFlag { pid: 0, flags } if flags.contains(BufferFlags::EOS))
    })
    .await;

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Scenario 3: port disable while buffers are queued
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_port_disable_returns_and_completes_once() {
    let rt = Runtime::default();
    let (comp, mut rx) = spawned_passthrough(&rt, "pass.disable").await;
    let (_inputs, outputs) = to_executing(&comp, &mut rx).await;

    // Two output buffers in flight; the processor cannot consume them
    // without input, so they sit on the port.
    for out in &outputs {
        comp.fill_this_buffer(out.clone()).await.unwrap();
    }

    comp.send_command(CommandReq::PortDisable(PortSelector::Port(1)))
        .await
        .unwrap();

    // Both come back untouched.
    let _ = rx.next_fill_done().await;
    let _ = rx.next_fill_done().await;

    // Disable completes only after the host frees its buffers.
    rx.assert_no_event().await;
    comp.free_buffer(1, &outputs[0]).await.unwrap();
    comp.free_buffer(1, &outputs[1]).await.unwrap();
    rx.expect_cmd_complete(Command::PortDisable, 1).await;

    // Buffer traffic towards the disabled port is rejected outright.
    assert_eq!(
        comp.fill_this_buffer(outputs[0].clone()).await,
        Err(IlError::IncorrectStateOperation)
    );

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Scenario 4: tunneled supplier handshake and buffer exchange
// ---------------------------------------------------------------------

/// Produces `limit` payload buffers on its single output port.
struct Producer {
    produced: u32,
    limit: u32,
}

#[async_trait]
impl Processor for Producer {
    async fn buffers_ready(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        while self.produced < self.limit {
            let Some(hdr) = ctx.claim_buffer(0, 0)? else { break };
            {
                let mut h = hdr.lock().unwrap();
                let word = self.produced.to_le_bytes();
                if let Some(out) = h.payload_mut() {
                    out[..4].copy_from_slice(&word);
                }
                h.filled_len = 4;
            }
            self.produced += 1;
            ctx.release_buffer(0, hdr)?;
        }
        Ok(())
    }
}

/// Consumes its single input port and reports every payload.
struct Sink {
    consumed: mpsc::UnboundedSender<Vec<u8>>,
}

#[async_trait]
impl Processor for Sink {
    async fn buffers_ready(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        while let Some(hdr) = ctx.claim_buffer(0, 0)? {
            {
                let h = hdr.lock().unwrap();
                let _ = self.consumed.send(h.payload().unwrap_or(&[]).to_vec());
            }
            ctx.release_buffer(0, hdr)?;
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_tunneled_supplier_handshake() {
    let rt = Runtime::default();

    let producer = rt.spawn_component(
        ComponentDefinition::new(
            "tone.source",
            "audio_source.tone",
            Box::new(Producer {
                produced: 0,
                limit: 4,
            }),
        )
        .with_port(
            PortConfig::new(Dir::Output, audio_format())
                .buffer_count(4)
                .buffer_size(16)
                .supplier_preference(BufferSupplier::Output),
        ),
    );
    let (consumed_tx, mut consumed_rx) = mpsc::unbounded_channel();
    let sink = rt.spawn_component(
        ComponentDefinition::new(
            "pcm.sink",
            "audio_renderer.pcm",
            Box::new(Sink {
                consumed: consumed_tx,
            }),
        )
        .with_port(
            PortConfig::new(Dir::Input, audio_format())
                .buffer_count(2)
                .buffer_size(16),
        ),
    );

    let (host_a, mut rx_a) = fake_host();
    producer.set_callbacks(host_a);
    let (host_b, mut rx_b) = fake_host();
    sink.set_callbacks(host_b);

    // Output side proposes, input side settles on the output supplier.
    let mut setup = TunnelSetup::default();
    producer
        .component_tunnel_request(0, Some((&sink, 0)), &mut setup)
        .await
        .unwrap();
    sink.component_tunnel_request(0, Some((&producer, 0)), &mut setup)
        .await
        .unwrap();
    assert_eq!(setup.supplier, BufferSupplier::Output);

    // The supplier's Loaded-to-Idle stalls until the sink advertises its
    // allocation phase, then both complete.
    producer
        .send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    sink.send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    rx_a.expect_state_complete(State::Idle).await;
    rx_b.expect_state_complete(State::Idle).await;

    sink.send_command(CommandReq::StateSet(State::Executing))
        .await
        .unwrap();
    rx_b.expect_state_complete(State::Executing).await;
    producer
        .send_command(CommandReq::StateSet(State::Executing))
        .await
        .unwrap();
    rx_a.expect_state_complete(State::Executing).await;

    // Four buffers flow through the tunnel without host mediation.
    for expected in 0u32..4 {
        let payload = timeout(WAIT, consumed_rx.recv())
            .await
            .expect("timed out waiting for tunneled payload")
            .expect("sink channel closed");
        assert_eq!(payload, expected.to_le_bytes());
    }

    // Let the last returns land, then wind both sides down.
    tokio::time::sleep(Duration::from_millis(100)).await;
    producer
        .send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    rx_a.expect_state_complete(State::Idle).await;
    sink.send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    rx_b.expect_state_complete(State::Idle).await;

    rt.destroy(&producer).await.unwrap();
    rt.destroy(&sink).await.unwrap();
}

// ---------------------------------------------------------------------
// Scenario 5: slaved port parameter change
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_slaved_port_parameter_change() {
    let rt = Runtime::default();
    let comp = rt.spawn_component(
        ComponentDefinition::new("pass.slaved", "audio_filter.pass", Box::new(PassThrough))
            .with_port(
                PortConfig::new(Dir::Input, audio_format())
                    .buffer_count(2)
                    .buffer_size(16)
                    .paired_with(1)
                    .model(Box::new(PcmPortModel::new(PcmModeType::stereo_48k(0)))),
            )
            .with_port(
                PortConfig::new(Dir::Output, audio_format())
                    .buffer_count(2)
                    .buffer_size(16)
                    .model(Box::new(PcmPortModel::new(PcmModeType::stereo_48k(1)))),
            ),
    );
    let (host, mut rx) = fake_host();
    comp.set_callbacks(host);

    let mut pcm = PcmModeType::stereo_48k(0);
    pcm.sampling_rate = 44_100;
    comp.set_parameter(&pcm).await.unwrap();

    rx.expect_event(|e| {
        matches!(
            e,
            IlEvent::PortSettingsChanged {
                pid: 1,
                index: Index::ParamAudioPcm
            }
        )
    })
    .await;
    rx.assert_no_event().await;

    let mut slaved = PcmModeType::stereo_48k(1);
    comp.get_parameter(&mut slaved).await.unwrap();
    assert_eq!(slaved.sampling_rate, 44_100);

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Scenario 6: flush during pause
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_flush_during_pause_returns_empty_buffers() {
    let rt = Runtime::default();
    let (comp, mut rx) = spawned_passthrough(&rt, "pass.flush").await;
    let (inputs, _outputs) = to_executing(&comp, &mut rx).await;

    comp.send_command(CommandReq::StateSet(State::Pause))
        .await
        .unwrap();
    rx.expect_state_complete(State::Pause).await;

    // Buffers delivered in Pause are held, not processed.
    for hdr in &inputs {
        hdr.lock().unwrap().filled_len = 8;
        comp.empty_this_buffer(hdr.clone()).await.unwrap();
    }
    rx.assert_no_event().await;

    comp.send_command(CommandReq::Flush(PortSelector::All))
        .await
        .unwrap();

    let h1 = rx.next_empty_done().await;
    let h2 = rx.next_empty_done().await;
    assert_eq!(h1.lock().unwrap().filled_len, 0);
    assert_eq!(h2.lock().unwrap().filled_len, 0);

    rx.expect_cmd_complete(Command::Flush, 0).await;
    rx.expect_cmd_complete(Command::Flush, 1).await;

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Mark round-trip
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_mark_round_trip() {
    let rt = Runtime::default();
    let (comp, mut rx) = spawned_passthrough(&rt, "pass.mark").await;
    let (inputs, outputs) = to_executing(&comp, &mut rx).await;

    comp.send_command(CommandReq::MarkBuffer(
        0,
        Mark {
            target_component: comp.id(),
            data: Arc::new("marked".to_string()),
        },
    ))
    .await
    .unwrap();

    comp.fill_this_buffer(outputs[0].clone()).await.unwrap();
    inputs[0].lock().unwrap().filled_len = 4;
    comp.empty_this_buffer(inputs[0].clone()).await.unwrap();

    // Attachment completes the command; consumption echoes the mark.
    rx.expect_cmd_complete(Command::MarkBuffer, 0).await;
    let event = rx
        .expect_event(|e| matches!(e, IlEvent::Mark { .. }))
        .await;
    if let IlEvent::Mark { data } = event {
        assert_eq!(data.downcast_ref::<String>().unwrap(), "marked");
    }

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Processor-driven timers
// ---------------------------------------------------------------------

struct TimerDriven {
    fired: mpsc::UnboundedSender<WatcherKey>,
}

#[async_trait]
impl Processor for TimerDriven {
    async fn prepare_to_transfer(
        &mut self,
        ctx: &mut ProcessorContext<'_>,
        _sel: PortSelector,
    ) -> IlResult<()> {
        let key = ctx.timer_init();
        ctx.timer_start(key, Duration::from_millis(10), None)?;
        Ok(())
    }

    async fn timer_ready(
        &mut self,
        _ctx: &mut ProcessorContext<'_>,
        key: WatcherKey,
    ) -> IlResult<()> {
        let _ = self.fired.send(key);
        Ok(())
    }
}

#[tokio::test]
async fn test_processor_timer_fires_in_executing() {
    let rt = Runtime::default();
    let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
    let comp = rt.spawn_component(
        ComponentDefinition::new(
            "timer.source",
            "audio_source.timer",
            Box::new(TimerDriven { fired: fired_tx }),
        )
        .with_port(
            PortConfig::new(Dir::Input, audio_format())
                .buffer_count(1)
                .buffer_size(16),
        ),
    );
    let (host, mut rx) = fake_host();
    comp.set_callbacks(host);

    comp.send_command(CommandReq::StateSet(State::Idle))
        .await
        .unwrap();
    let _hdr = comp.use_buffer(0, vec![0; 16]).await.unwrap();
    rx.expect_state_complete(State::Idle).await;
    comp.send_command(CommandReq::StateSet(State::Executing))
        .await
        .unwrap();
    rx.expect_state_complete(State::Executing).await;

    timeout(WAIT, fired_rx.recv())
        .await
        .expect("timer never fired")
        .expect("channel closed");

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Pluggable events
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_pluggable_event_runs_on_component_task() {
    let rt = Runtime::default();
    let (comp, _rx) = spawned_passthrough(&rt, "pass.pluggable").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    comp.receive_pluggable_event(Box::new(move || {
        let _ = tx.send(std::thread::current().id());
    }))
    .unwrap();

    timeout(WAIT, rx.recv())
        .await
        .expect("pluggable event never ran")
        .expect("channel closed");

    rt.destroy(&comp).await.unwrap();
}

// ---------------------------------------------------------------------
// Command and state validation
// ---------------------------------------------------------------------

#[tokio::test]
async fn test_invalid_transitions_and_bad_ports() {
    let rt = Runtime::default();
    let (comp, _rx) = spawned_passthrough(&rt, "pass.validation").await;

    // Loaded -> Executing is not a legal cell.
    assert_eq!(
        comp.send_command(CommandReq::StateSet(State::Executing))
            .await,
        Err(IlError::IncorrectStateTransition)
    );
    assert_eq!(
        comp.send_command(CommandReq::StateSet(State::Loaded)).await,
        Err(IlError::SameState)
    );
    assert_eq!(
        comp.send_command(CommandReq::Flush(PortSelector::Port(9)))
            .await,
        Err(IlError::BadPortIndex)
    );

    // Buffer traffic is meaningless in Loaded.
    let foreign = omxil::new_header(omxil::BufferData::Owned(vec![0; 16]), 16);
    foreign.lock().unwrap().input_port_index = Some(0);
    assert_eq!(
        comp.empty_this_buffer(foreign).await,
        Err(IlError::IncorrectStateOperation)
    );

    // UseBuffer without a pending Loaded-to-Idle is rejected too.
    assert_eq!(
        comp.use_buffer(0, vec![0; 16]).await.unwrap_err(),
        IlError::IncorrectStateOperation
    );

    rt.destroy(&comp).await.unwrap();
}
