//! Typed messages exchanged between the main thread and a transport thread.
//!
//! Both directions travel as rkyv-encoded byte messages over bounded channels.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::channel::{Backpressure, ChannelError, ChannelReader, ChannelWriter, byte_channel};

/// Session identifier as seen by the transport engine.
pub type TransportSessionId = u32;

/// Main thread → transport thread.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum TransportCommand {
    CloseSession {
        session_id: TransportSessionId,
        reason: String,
    },
    SendEncapsulated {
        session_id: TransportSessionId,
        payload: Vec<u8>,
        immediate: bool,
    },
    SendRaw {
        address: String,
        port: u16,
        payload: Vec<u8>,
    },
    BlockAddress {
        address: String,
        timeout_secs: i64,
    },
    UnblockAddress {
        address: String,
    },
    SetName {
        name: String,
    },
    AddRawFilter {
        pattern: String,
    },
    RemoveRawFilter {
        pattern: String,
    },
}

/// Transport thread → main thread.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum TransportEvent {
    ClientConnected {
        session_id: TransportSessionId,
        address: String,
        port: u16,
        client_id: u64,
    },
    ClientDisconnected {
        session_id: TransportSessionId,
        reason: String,
    },
    PacketReceived {
        session_id: TransportSessionId,
        payload: Vec<u8>,
    },
    RawPacketReceived {
        address: String,
        port: u16,
        payload: Vec<u8>,
    },
    PacketAck {
        session_id: TransportSessionId,
        identifier: u32,
    },
    BandwidthStats {
        bytes_sent: u64,
        bytes_received: u64,
    },
    PingMeasured {
        session_id: TransportSessionId,
        ping_ms: u64,
    },
}

/// Copies into an aligned buffer first; channel messages are plain `Vec<u8>`.
fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buffer = AlignedVec::with_capacity(bytes.len());
    buffer.extend_from_slice(bytes);
    buffer
}

impl TransportCommand {
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|bytes| bytes.into_vec())
            .map_err(|e| ChannelError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        rkyv::from_bytes::<Self, rancor::Error>(&aligned(bytes))
            .map_err(|e| ChannelError::Codec(e.to_string()))
    }
}

impl TransportEvent {
    pub fn encode(&self) -> Result<Vec<u8>, ChannelError> {
        rkyv::to_bytes::<rancor::Error>(self)
            .map(|bytes| bytes.into_vec())
            .map_err(|e| ChannelError::Codec(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ChannelError> {
        rkyv::from_bytes::<Self, rancor::Error>(&aligned(bytes))
            .map_err(|e| ChannelError::Codec(e.to_string()))
    }
}

/// Main-side writer for commands. Never blocks; a full channel drops the command.
#[derive(Debug, Clone)]
pub struct CommandSender {
    writer: ChannelWriter,
}

impl CommandSender {
    pub fn send(&self, command: &TransportCommand) -> Result<(), ChannelError> {
        self.writer.write(command.encode()?)
    }
}

#[derive(Debug)]
pub struct CommandReceiver {
    reader: ChannelReader,
}

impl CommandReceiver {
    pub fn try_recv(&self) -> Result<Option<TransportCommand>, ChannelError> {
        match self.reader.read()? {
            Some(bytes) => TransportCommand::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Transport-side writer for events. Blocks while the main thread catches up.
#[derive(Debug, Clone)]
pub struct EventSender {
    writer: ChannelWriter,
}

impl EventSender {
    pub fn send(&self, event: &TransportEvent) -> Result<(), ChannelError> {
        self.writer.write(event.encode()?)
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    reader: ChannelReader,
}

impl EventReceiver {
    pub fn try_recv(&self) -> Result<Option<TransportEvent>, ChannelError> {
        match self.reader.read()? {
            Some(bytes) => TransportEvent::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

pub fn command_channel(capacity: usize) -> (CommandSender, CommandReceiver) {
    let (writer, reader) = byte_channel(capacity, Backpressure::Drop);
    (CommandSender { writer }, CommandReceiver { reader })
}

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (writer, reader) = byte_channel(capacity, Backpressure::Block);
    (EventSender { writer }, EventReceiver { reader })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_channel_preserves_order() {
        let (tx, rx) = command_channel(8);

        tx.send(&TransportCommand::SetName {
            name: "SkyWing Net".into(),
        })
        .unwrap();
        tx.send(&TransportCommand::BlockAddress {
            address: "203.0.113.5".into(),
            timeout_secs: 5,
        })
        .unwrap();

        assert_eq!(
            rx.try_recv().unwrap(),
            Some(TransportCommand::SetName {
                name: "SkyWing Net".into()
            })
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            Some(TransportCommand::BlockAddress {
                address: "203.0.113.5".into(),
                timeout_secs: 5
            })
        );
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn test_event_with_payload_survives_channel() {
        let (tx, rx) = event_channel(2);
        let event = TransportEvent::PacketReceived {
            session_id: 3,
            payload: vec![0x01, 0xFE, 0x00, 0x7F],
        };

        tx.send(&event).unwrap();

        assert_eq!(rx.try_recv().unwrap(), Some(event));
    }

    #[test]
    fn test_garbage_is_a_codec_error() {
        assert!(matches!(
            TransportEvent::decode(&[0xFF, 0x00, 0x13]),
            Err(ChannelError::Codec(_))
        ));
    }

    #[test]
    fn test_full_command_channel_drops() {
        let (tx, _rx) = command_channel(1);
        let command = TransportCommand::UnblockAddress {
            address: "192.0.2.1".into(),
        };

        tx.send(&command).unwrap();
        assert_eq!(tx.send(&command), Err(ChannelError::Full));
    }
}
