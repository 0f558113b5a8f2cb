//! Network transport: one socket per controller, demultiplexed in-band.

pub mod channel;
pub mod demux;

pub use channel::{Endpoint, TransportChannel};
pub use demux::{AsyncFrame, FrameDemux, ASYNC_SIGNATURE};
