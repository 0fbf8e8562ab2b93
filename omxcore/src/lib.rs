//! OpenMAX IL component runtime.
//!
//! Each component is one cooperative task built from four collaborators:
//! the servant mailbox (priority queue plus deferred side effects), the
//! kernel (ports, ingress/egress buffer queues, command dispatch and
//! transition completion), the table-driven FSM, and the user-supplied
//! [`Processor`]. Hosts talk to a component exclusively through the
//! [`Component`] handle; components talk to each other only through
//! tunnels, which go through the peer's mailbox as well.
//!
//! A minimal host session:
//!
//! ```no_run
//! use std::sync::Arc;
//! use omxcore::{ComponentDefinition, Runtime};
//! use omxcore::{NullProcessor, PortConfig};
//! use omxil::{AudioEncoding, AudioPortDefinition, Dir, PortFormat};
//!
//! # async fn example() -> omxil::IlResult<()> {
//! let runtime = Runtime::default();
//! let component = runtime.spawn_component(
//!     ComponentDefinition::new("pcm.sink", "audio_renderer.pcm", Box::new(NullProcessor))
//!         .with_port(PortConfig::new(
//!             Dir::Input,
//!             PortFormat::Audio(AudioPortDefinition {
//!                 mime_type: "audio/x-raw".into(),
//!                 encoding: AudioEncoding::Pcm,
//!             }),
//!         )),
//! );
//! // component.set_callbacks(...); send_command(StateSet Idle); use_buffer(...); ...
//! # runtime.destroy(&component).await
//! # }
//! ```

pub mod component;
pub mod events;
pub mod fsm;
pub mod kernel;
pub mod msg;
pub mod port;
pub mod pqueue;
pub mod processor;
pub mod runtime;
pub mod servant;
pub mod watchers;

pub use component::Component;
pub use events::{HostCallbacks, IlEvent};
pub use fsm::{Fsm, FsmState, TransitionKind};
pub use kernel::{Kernel, PopulationStatus, SetConfigAction};
pub use msg::{CommandReq, Msg, PluggableEvent, PRIO_BUFFER, PRIO_COMMAND, PRIO_NOTIFY};
pub use port::{
    BasePortModel, ConfigPort, HeaderSlot, PcmPortModel, Port, PortConfig, PortModel, Tunnel,
};
pub use processor::{NullProcessor, Processor, ProcessorContext};
pub use runtime::{ComponentDefinition, ComponentInfo, Runtime, RuntimeConfig};
pub use servant::{Effect, Mailbox, Servant};
pub use watchers::{IoEvents, WatcherKey, Watchers};
