//! Two tunneled components end to end: a tone source supplying its own
//! buffers and a sink consuming them, driven through the full state-set
//! protocol. Run with `RUST_LOG=omxcore=debug` to watch the handshake.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use omxcore::{
    CommandReq, ComponentDefinition, HostCallbacks, IlEvent, PortConfig, Processor,
    ProcessorContext, Runtime,
};
use omxil::{
    AudioEncoding, AudioPortDefinition, BufferFlags, BufferSupplier, ComponentId, Dir, HeaderRef,
    IlResult, PortFormat, State, TunnelSetup,
};

struct LoggingHost {
    name: &'static str,
    idle: mpsc::UnboundedSender<()>,
}

#[async_trait]
impl HostCallbacks for LoggingHost {
    async fn event_handler(&self, _source: ComponentId, event: IlEvent) {
        println!("[{}] {:?}", self.name, event);
        if matches!(
            event,
            IlEvent::StateSetComplete {
                state: State::Idle,
                ..
            }
        ) {
            let _ = self.idle.send(());
        }
    }

    async fn empty_buffer_done(&self, _source: ComponentId, _hdr: HeaderRef) {}
    async fn fill_buffer_done(&self, _source: ComponentId, _hdr: HeaderRef) {}
}

/// Emits a ramp, one buffer per claim, and flags the last one EOS.
struct ToneSource {
    remaining: u32,
}

#[async_trait]
impl Processor for ToneSource {
    async fn buffers_ready(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        while self.remaining > 0 {
            let Some(hdr) = ctx.claim_buffer(0, 0)? else { break };
            {
                let mut h = hdr.lock().expect("header");
                let len = h.alloc_len;
                if let Some(out) = h.payload_mut() {
                    for (i, sample) in out.iter_mut().enumerate() {
                        *sample = (i % 251) as u8;
                    }
                }
                h.filled_len = len;
                if self.remaining == 1 {
                    h.flags |= BufferFlags::EOS;
                }
            }
            self.remaining -= 1;
            ctx.release_buffer(0, hdr)?;
        }
        Ok(())
    }
}

struct PrintSink {
    bytes: usize,
}

#[async_trait]
impl Processor for PrintSink {
    async fn buffers_ready(&mut self, ctx: &mut ProcessorContext<'_>) -> IlResult<()> {
        while let Some(hdr) = ctx.claim_buffer(0, 0)? {
            {
                let h = hdr.lock().expect("header");
                self.bytes += h.filled_len;
                println!(
                    "[sink] {} bytes (total {}){}",
                    h.filled_len,
                    self.bytes,
                    if h.flags.contains(BufferFlags::EOS) {
                        ", end of stream"
                    } else {
                        ""
                    }
                );
            }
            ctx.release_buffer(0, hdr)?;
        }
        Ok(())
    }
}

fn pcm_format() -> PortFormat {
    PortFormat::Audio(AudioPortDefinition {
        mime_type: "audio/x-raw".into(),
        encoding: AudioEncoding::Pcm,
    })
}

#[tokio::main]
async fn main() -> IlResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let runtime = Runtime::default();

    let source = runtime.spawn_component(
        ComponentDefinition::new(
            "tone.source",
            "audio_source.tone",
            Box::new(ToneSource { remaining: 8 }),
        )
        .with_port(
            PortConfig::new(Dir::Output, pcm_format())
                .buffer_count(4)
                .buffer_size(512)
                .supplier_preference(BufferSupplier::Output),
        ),
    );
    let sink = runtime.spawn_component(
        ComponentDefinition::new(
            "print.sink",
            "audio_renderer.print",
            Box::new(PrintSink { bytes: 0 }),
        )
        .with_port(
            PortConfig::new(Dir::Input, pcm_format())
                .buffer_count(4)
                .buffer_size(512),
        ),
    );

    let (idle_tx, mut idle_rx) = mpsc::unbounded_channel();
    source.set_callbacks(Arc::new(LoggingHost {
        name: "source",
        idle: idle_tx.clone(),
    }));
    sink.set_callbacks(Arc::new(LoggingHost {
        name: "sink",
        idle: idle_tx,
    }));

    // Tunnel the two ports; the source insists on supplying.
    let mut setup = TunnelSetup::default();
    source
        .component_tunnel_request(0, Some((&sink, 0)), &mut setup)
        .await?;
    sink.component_tunnel_request(0, Some((&source, 0)), &mut setup)
        .await?;
    println!("tunnel negotiated, supplier: {:?}", setup.supplier);

    // Loaded -> Idle on both sides; the supplier populates once the sink
    // advertises its allocation phase.
    source.send_command(CommandReq::StateSet(State::Idle)).await?;
    sink.send_command(CommandReq::StateSet(State::Idle)).await?;
    idle_rx.recv().await;
    idle_rx.recv().await;

    sink.send_command(CommandReq::StateSet(State::Executing))
        .await?;
    source
        .send_command(CommandReq::StateSet(State::Executing))
        .await?;

    // Let the eight buffers stream through the tunnel.
    tokio::time::sleep(Duration::from_millis(200)).await;

    source.send_command(CommandReq::StateSet(State::Idle)).await?;
    sink.send_command(CommandReq::StateSet(State::Idle)).await?;
    idle_rx.recv().await;
    idle_rx.recv().await;

    runtime.shutdown().await;
    Ok(())
}
