use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError, TrySendError};
use std::time::Duration;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// What a writer does when the channel is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Wait for the reader to make room. Only used by the transport thread.
    Block,
    /// Refuse the message and report `ChannelError::Full`.
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("channel is full, message dropped")]
    Full,
    #[error("channel peer disconnected")]
    Disconnected,
    #[error("message codec failure: {0}")]
    Codec(String),
}

/// Producer half of a bounded FIFO of byte messages.
#[derive(Debug, Clone)]
pub struct ChannelWriter {
    tx: SyncSender<Vec<u8>>,
    policy: Backpressure,
}

impl ChannelWriter {
    pub fn write(&self, message: Vec<u8>) -> Result<(), ChannelError> {
        match self.policy {
            Backpressure::Block => self.tx.send(message).map_err(|_| ChannelError::Disconnected),
            Backpressure::Drop => match self.tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(ChannelError::Full),
                Err(TrySendError::Disconnected(_)) => Err(ChannelError::Disconnected),
            },
        }
    }

    pub fn policy(&self) -> Backpressure {
        self.policy
    }
}

/// Consumer half. Never blocks unless asked to with `read_timeout`.
#[derive(Debug)]
pub struct ChannelReader {
    rx: Receiver<Vec<u8>>,
}

impl ChannelReader {
    pub fn read(&self) -> Result<Option<Vec<u8>>, ChannelError> {
        match self.rx.try_recv() {
            Ok(message) => Ok(Some(message)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }

    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        match self.rx.recv_timeout(timeout) {
            Ok(message) => Ok(Some(message)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ChannelError::Disconnected),
        }
    }
}

pub fn byte_channel(capacity: usize, policy: Backpressure) -> (ChannelWriter, ChannelReader) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (ChannelWriter { tx, policy }, ChannelReader { rx })
}
