//! Host-side core of the grow box controller: the serial line protocol, the
//! packet link that keeps it alive, and the reconciler that turns sensor
//! reports into actuator commands.

pub mod codec;
pub mod error;
pub mod link;
pub mod reconciler;
pub mod transport;

pub use codec::{Inbound, InboundKind, Outbound, OutboundKind, SensorReport, LEVEL_MAX};
pub use error::{CodecError, LinkError};
pub use link::{LinkSettings, PacketLink};
pub use reconciler::{
    reconcile, reconcile_at, DisableWindow, Gains, ReconcilerCommand, ReconcilerConfig,
    ReconcilerState, ReconcilerTune,
};
pub use transport::{Connect, Transport};
