//! Server reactor: state held between frames of one connection.
//!
//! The protocol is stateless from the perspective of whole commands, but
//! something has to track which frames have arrived and which are still
//! expected. The reactor is that thing. It performs no I/O and runs no
//! commands; callers feed it decoded frames and act on the returned
//! [`Action`]. Every transition is a pure function of the current state,
//! the accumulated command, and the incoming frame.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::wire::frame::{ArgumentFlags, CommandNameFlags, DataFlags, Frame, FrameType};

/// What the consumer should do after feeding a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Protocol violation. The consumer should abort the connection; the
    /// reactor stays errored for every subsequent frame.
    Error { message: String },
    /// A complete command request is ready to dispatch.
    RunCommand {
        command: Bytes,
        args: HashMap<Bytes, Bytes>,
        data: Option<Bytes>,
    },
    /// Nothing actionable yet; read another frame.
    WantFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    ReceivingArgs,
    ReceivingData,
    Errored,
}

#[derive(Debug, Default)]
struct ActiveCommand {
    name: Bytes,
    args: HashMap<Bytes, Bytes>,
    data: Option<BytesMut>,
    expecting_data: bool,
}

/// Frame-at-a-time state machine for one connection. Never invoked
/// re-entrantly; one command's state is buffered at a time.
#[derive(Debug)]
pub struct Reactor {
    state: State,
    active: ActiveCommand,
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            active: ActiveCommand::default(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Fold one received frame into the connection state.
    pub fn on_frame(&mut self, frame: &Frame) -> Action {
        match self.state {
            State::Idle => self.on_frame_idle(frame),
            State::ReceivingArgs => self.on_frame_receiving_args(frame),
            State::ReceivingData => self.on_frame_receiving_data(frame),
            State::Errored => Action::Error {
                message: "reactor already errored".to_string(),
            },
        }
    }

    fn error(&mut self, message: impl Into<String>) -> Action {
        self.state = State::Errored;
        Action::Error {
            message: message.into(),
        }
    }

    fn run_command(&mut self) -> Action {
        self.state = State::Idle;
        let active = std::mem::take(&mut self.active);
        Action::RunCommand {
            command: active.name,
            args: active.args,
            data: active.data.map(BytesMut::freeze),
        }
    }

    fn on_frame_idle(&mut self, frame: &Frame) -> Action {
        // Only a command request may open an exchange.
        if frame.frame_type() != Some(FrameType::CommandName) {
            return self.error(format!("expected command frame; got {}", frame.ftype));
        }

        self.active = ActiveCommand {
            name: frame.payload.clone(),
            ..ActiveCommand::default()
        };

        let flags = frame.name_flags();
        if flags.contains(CommandNameFlags::EOS) {
            return self.run_command();
        }

        self.active.expecting_data = flags.contains(CommandNameFlags::HAVE_DATA);

        if flags.contains(CommandNameFlags::HAVE_ARGS) {
            self.state = State::ReceivingArgs;
            Action::WantFrame
        } else if self.active.expecting_data {
            self.active.data = Some(BytesMut::new());
            self.state = State::ReceivingData;
            Action::WantFrame
        } else {
            self.error("missing frame flags on command frame")
        }
    }

    fn on_frame_receiving_args(&mut self, frame: &Frame) -> Action {
        if frame.frame_type() != Some(FrameType::CommandArgument) {
            return self.error(format!(
                "expected command argument frame; got {}",
                frame.ftype
            ));
        }

        let payload = &frame.payload;
        if payload.len() < 4 {
            return self.error("malformed argument frame: short header");
        }
        let name_size = u16::from_le_bytes([payload[0], payload[1]]) as usize;
        let value_size = u16::from_le_bytes([payload[2], payload[3]]) as usize;

        // The argument name must fit inside the frame.
        if payload.len() < 4 + name_size {
            return self.error("malformed argument frame: partial argument name");
        }
        let name = payload.slice(4..4 + name_size);
        let value = payload.slice(4 + name_size..);

        if frame.argument_flags().contains(ArgumentFlags::CONTINUATION) {
            // Declared in the protocol, never emitted by any known peer.
            // A multi-frame value would need reassembly state this
            // reactor does not carry; refuse loudly instead.
            return self.error("argument value continuation is not supported");
        }

        if value.len() != value_size {
            return self.error("malformed argument frame: partial argument value");
        }

        // Later frames with an identical name overwrite earlier ones.
        self.active.args.insert(name, value);

        if frame.argument_flags().contains(ArgumentFlags::EOA) {
            if self.active.expecting_data {
                self.active.data = Some(BytesMut::new());
                self.state = State::ReceivingData;
                Action::WantFrame
            } else {
                self.run_command()
            }
        } else {
            Action::WantFrame
        }
    }

    fn on_frame_receiving_data(&mut self, frame: &Frame) -> Action {
        if frame.frame_type() != Some(FrameType::CommandData) {
            return self.error(format!("expected command data frame; got {}", frame.ftype));
        }

        let buffer = self
            .active
            .data
            .get_or_insert_with(BytesMut::new);
        buffer.extend_from_slice(&frame.payload);

        let flags = frame.data_flags();
        if flags.contains(DataFlags::CONTINUATION) {
            Action::WantFrame
        } else if flags.contains(DataFlags::EOS) {
            self.run_command()
        } else {
            self.error("command data frame without flags")
        }
    }
}
