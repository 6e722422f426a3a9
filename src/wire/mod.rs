//! Frame-based command wire protocol.
//!
//! Three-layer split:
//! 1. `frame` - bit-exact codec for the 4-byte-header frame format
//! 2. `encoder` - client-side request serialization
//! 3. `reactor` - server-side state machine folding frames into commands
//!
//! ```text
//! client                                server
//! +----------+   frames    +---------+  actions  +----------+
//! | encoder  | ----------> | codec   | --------> | reactor  |
//! +----------+             +---------+           +----------+
//! ```
//!
//! The reactor performs no I/O; the serve loop in `crate::server` owns
//! the stream and dispatches `RunCommand` actions.

pub mod encoder;
pub mod frame;
pub mod reactor;

pub use encoder::{command_frames, MAX_ARGUMENT_VALUE_SIZE};
pub use frame::{
    encode_frame, frame_from_human_string, parse_header, read_frame, write_frame, ArgumentFlags,
    CommandNameFlags, DataFlags, Frame, FrameType, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use reactor::{Action, Reactor, State};
