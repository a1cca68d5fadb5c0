mod mux_stream;
mod session;
mod shaper;
mod state;

pub use mux_stream::MuxStream;
pub use session::Session;
pub use shaper::{Shaper, ShaperHeap, WriteRequest};
pub use state::{SessionState, StreamFlag, StreamState};
