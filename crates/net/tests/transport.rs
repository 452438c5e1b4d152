use std::cell::RefCell;
use std::net::{SocketAddr, UdpSocket};
use std::rc::Rc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use skywing::transport::{EngineLink, TRANSPORT_RESERVED_ID};
use skywing::{
    AdvancedNetworkInterface, Context, Network, NetworkError, NetworkInterface, PacketError,
    PacketSender, PeerInfo, RawPacketHandler, Server, ServerError, ServerState, SessionHandler,
    TickConfig, TransportBridge, TransportEngine, TransportError, UdpEngine,
};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(40000);

fn next_addr() -> SocketAddr {
    let port = PORT_COUNTER.fetch_add(1, Ordering::SeqCst);
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn client(server: SocketAddr) -> UdpSocket {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    socket.connect(server).unwrap();
    socket
}

fn tick_until(network: &mut Network, mut done: impl FnMut(&Network) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        network.tick().unwrap();
        if done(network) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[derive(Debug, Default)]
struct Log {
    decoded: Vec<Vec<u8>>,
    disconnects: Vec<String>,
}

/// Echoes every body back and rejects bodies starting with 0xFF.
struct EchoHandler {
    log: Rc<RefCell<Log>>,
}

impl SessionHandler for EchoHandler {
    fn handle_encoded(
        &mut self,
        payload: &[u8],
        sender: &mut dyn PacketSender,
    ) -> Result<(), PacketError> {
        if payload.first() == Some(&0xFF) {
            return Err(PacketError::UnexpectedPacket { id: 0xFF });
        }
        self.log.borrow_mut().decoded.push(payload.to_vec());
        sender.send(payload, true);
        Ok(())
    }

    fn on_disconnect(&mut self, reason: &str) {
        self.log.borrow_mut().disconnects.push(reason.to_owned());
    }
}

fn udp_bridge(addr: SocketAddr, log: &Rc<RefCell<Log>>) -> Box<TransportBridge> {
    let log = Rc::clone(log);
    let factory = move |_: &PeerInfo| -> Box<dyn SessionHandler> {
        Box::new(EchoHandler {
            log: Rc::clone(&log),
        })
    };
    Box::new(TransportBridge::new(
        addr.to_string(),
        Box::new(UdpEngine::new(addr)),
        Box::new(factory),
    ))
}

struct PingHandler;

impl RawPacketHandler for PingHandler {
    fn pattern(&self) -> &str {
        "^PING"
    }

    fn handle(
        &mut self,
        interface: &mut dyn AdvancedNetworkInterface,
        address: &str,
        port: u16,
        payload: &[u8],
    ) -> Result<bool, PacketError> {
        let mut reply = b"PONG".to_vec();
        reply.extend_from_slice(&payload[4..]);
        interface.send_raw_packet(address, port, &reply);
        Ok(true)
    }
}

#[test]
fn test_raw_ping_round_trip_through_late_registered_bridge() {
    let addr = next_addr();
    let log = Rc::new(RefCell::new(Log::default()));
    let mut network = Network::new(Context::system(), "SkyWing Net");

    // Handler first: the bridge must pick up the filter when it registers.
    network
        .register_raw_packet_handler(Box::new(PingHandler))
        .unwrap();
    network.register_interface(udp_bridge(addr, &log)).unwrap();

    let socket = client(addr);
    let mut reply = [0u8; 64];
    let mut received = None;
    for _ in 0..20 {
        socket.send(b"PING 42").unwrap();
        for _ in 0..20 {
            network.tick().unwrap();
            thread::sleep(Duration::from_millis(5));
        }
        if let Ok(size) = socket.recv(&mut reply) {
            received = Some(reply[..size].to_vec());
            break;
        }
    }

    assert_eq!(received.as_deref(), Some(&b"PONG 42"[..]));
    // Raw traffic never opens a session.
    assert!(network.sessions().is_empty());
}

#[test]
fn test_session_traffic_is_framed_and_echoed() {
    let addr = next_addr();
    let log = Rc::new(RefCell::new(Log::default()));
    let mut network = Network::new(Context::system(), "SkyWing Net");
    network.register_interface(udp_bridge(addr, &log)).unwrap();

    let socket = client(addr);
    socket.send(&[0x8C, b'h', b'e', b'y']).unwrap();
    assert!(tick_until(&mut network, |_| !log.borrow().decoded.is_empty()));

    assert_eq!(network.sessions().session_count(), 1);
    assert_eq!(log.borrow().decoded, vec![b"hey".to_vec()]);

    let mut echoed = [0u8; 16];
    let size = socket.recv(&mut echoed).unwrap();
    assert_eq!(&echoed[..size], b"hey");

    // Transport-reserved traffic from a connected peer never reaches the handler.
    socket.send(&[TRANSPORT_RESERVED_ID, 0x00]).unwrap();
    for _ in 0..20 {
        network.tick().unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(log.borrow().decoded.len(), 1);
}

#[test]
fn test_malformed_session_packet_disconnects_with_error_id() {
    let addr = next_addr();
    let log = Rc::new(RefCell::new(Log::default()));
    let mut network = Network::new(Context::system(), "SkyWing Net");
    network.register_interface(udp_bridge(addr, &log)).unwrap();

    let socket = client(addr);
    socket.send(&[0x01, 0xFF]).unwrap();
    assert!(tick_until(&mut network, |n| {
        !log.borrow().disconnects.is_empty() && n.sessions().is_empty()
    }));

    let reason = log.borrow().disconnects[0].clone();
    assert!(reason.starts_with("Packet processing error (Error ID: "));

    // The source now sits out a short ban on the transport side.
    thread::sleep(Duration::from_millis(50));
    socket.send(&[0x01, 0x02]).unwrap();
    for _ in 0..40 {
        network.tick().unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(network.sessions().is_empty());
    assert_eq!(log.borrow().decoded.len(), 0);
}

#[test]
fn test_bind_conflict_fails_registration() {
    let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();
    let log = Rc::new(RefCell::new(Log::default()));
    let mut network = Network::new(Context::system(), "SkyWing Net");

    let result = network.register_interface(udp_bridge(addr, &log));

    let Err(NetworkError::StartupFailure(message)) = result else {
        panic!("expected startup failure");
    };
    assert!(message.contains("failed to bind"));
    assert_eq!(network.interface_count(), 0);
    assert_eq!(network.advanced_interface_count(), 0);
}

/// Starts fine, then dies on its third tick.
struct DoomedEngine {
    ticks: u32,
    _link: Option<EngineLink>,
}

impl TransportEngine for DoomedEngine {
    fn start(&mut self, link: EngineLink) -> Result<(), TransportError> {
        self._link = Some(link);
        Ok(())
    }

    fn tick(&mut self) -> Result<(), TransportError> {
        self.ticks += 1;
        if self.ticks == 3 {
            panic!("socket vanished");
        }
        thread::sleep(Duration::from_millis(5));
        Ok(())
    }

    fn shutdown(&mut self) {}
}

fn doomed_bridge() -> Box<dyn NetworkInterface> {
    let factory = |_: &PeerInfo| -> Box<dyn SessionHandler> {
        Box::new(EchoHandler {
            log: Rc::new(RefCell::new(Log::default())),
        })
    };
    Box::new(TransportBridge::new(
        "doomed",
        Box::new(DoomedEngine {
            ticks: 0,
            _link: None,
        }),
        Box::new(factory),
    ))
}

#[test]
fn test_engine_panic_surfaces_as_transport_crash() {
    let mut network = Network::new(Context::system(), "SkyWing Net");
    network.register_interface(doomed_bridge()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    let error = loop {
        match network.tick() {
            Err(e) => break e,
            Ok(()) if Instant::now() < deadline => thread::sleep(Duration::from_millis(5)),
            Ok(()) => panic!("crash was never reported"),
        }
    };

    let NetworkError::TransportCrash(message) = error else {
        panic!("expected a transport crash, got {error:?}");
    };
    assert!(message.contains("socket vanished"));
    assert!(message.contains("transport.rs"));
}

#[test]
fn test_server_run_ends_crashed_when_transport_dies() {
    let network = Network::new(Context::system(), "SkyWing Net");
    let mut server = Server::start(TickConfig::default(), network, vec![doomed_bridge()]).unwrap();

    let result = server.run();

    assert!(matches!(
        result,
        Err(ServerError::Network(NetworkError::TransportCrash(_)))
    ));
    assert_eq!(server.state(), ServerState::Crashed);
    assert_eq!(server.network().interface_count(), 0);
}
