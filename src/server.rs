//! The UDP receive loop and reply path.
//!
//! [`DhcpServer`] owns one socket bound to `0.0.0.0:67` so that broadcast
//! DISCOVERs and REQUESTs reach it; `server_ip` is the address it answers
//! as (server identifier, foreign-server check). Each datagram is
//! decoded and dispatched to the [`DhcpHandler`] on the receive task; replies
//! are finalized (subnet mask, server identifier) and sent from a spawned
//! task so a slow send never blocks the next receive.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::DhcpHandler;
use crate::options::{MessageType, OptionCode};
use crate::packet::{BOOTREQUEST, DhcpMessage, DhcpPacket};
use crate::reply::{build_offer, build_request_reply};

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;
/// Largest UDP payload over IPv4. A client may advertise a maximum message
/// size (option 57) above the Ethernet MTU.
const RECV_BUFFER_SIZE: usize = 65507;

/// A DHCPv4 server bound to a single IPv4 address.
///
/// The server is idle after construction. [`start`](Self::start) binds the
/// socket and spawns the receive loop; [`stop`](Self::stop) tears it down.
/// Both are idempotent and serialized by one control lock, so a server can
/// be started and stopped repeatedly.
pub struct DhcpServer<H: DhcpHandler> {
    inner: Arc<Inner<H>>,
}

struct Inner<H: DhcpHandler> {
    dispatcher: Dispatcher<H>,
    server_port: u16,
    control: Mutex<Option<Listener>>,
    generation: AtomicU64,
}

struct Listener {
    generation: u64,
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl<H: DhcpHandler> DhcpServer<H> {
    /// Creates a server answering as `server_ip` on the standard ports.
    pub fn new(server_ip: Ipv4Addr, subnet_mask: Ipv4Addr, handler: H) -> Self {
        Self::with_ports(
            server_ip,
            subnet_mask,
            handler,
            DHCP_SERVER_PORT,
            DHCP_CLIENT_PORT,
        )
    }

    /// Creates a server from the address settings of `config`.
    pub fn from_config(config: &Config, handler: H) -> Self {
        Self::new(config.server_ip, config.subnet_mask, handler)
    }

    fn with_ports(
        server_ip: Ipv4Addr,
        subnet_mask: Ipv4Addr,
        handler: H,
        server_port: u16,
        client_port: u16,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher: Dispatcher::new(server_ip, subnet_mask, client_port, Arc::new(handler)),
                server_port,
                control: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn server_ip(&self) -> Ipv4Addr {
        self.inner.dispatcher.server_ip
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.inner.dispatcher.subnet_mask
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.inner.dispatcher.handler
    }

    /// Binds the socket and starts the receive loop.
    ///
    /// Does nothing if the server is already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the socket cannot be created or bound,
    /// typically because port 67 requires elevated privileges or is held by
    /// another process.
    pub async fn start(&self) -> Result<()> {
        let mut control = self.inner.control.lock().await;
        if control.is_some() {
            debug!("DHCP server already running");
            return Ok(());
        }

        let socket = Arc::new(create_socket(self.inner.server_port)?);
        let local_addr = socket.local_addr()?;

        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let (shutdown, shutdown_receiver) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            inner
                .receive_loop(socket, shutdown_receiver, generation)
                .await;
        });

        *control = Some(Listener {
            generation,
            local_addr,
            shutdown,
            task,
        });

        info!("DHCP server starting on {}", local_addr);
        Ok(())
    }

    /// Stops the receive loop and closes the socket.
    ///
    /// Waits for the loop to exit. Does nothing if the server is not running.
    /// Replies already handed to a send task may still go out.
    pub async fn stop(&self) {
        let mut control = self.inner.control.lock().await;
        let Some(listener) = control.take() else {
            return;
        };

        let _ = listener.shutdown.send(());
        if let Err(error) = listener.task.await {
            warn!("DHCP receive task ended abnormally: {}", error);
        }

        info!("DHCP server on {} stopped", listener.local_addr);
    }

    pub async fn is_running(&self) -> bool {
        self.inner.control.lock().await.is_some()
    }

    /// Returns the bound socket address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .control
            .lock()
            .await
            .as_ref()
            .map(|listener| listener.local_addr)
    }
}

impl<H: DhcpHandler> Drop for DhcpServer<H> {
    fn drop(&mut self) {
        if let Ok(mut control) = self.inner.control.try_lock()
            && let Some(listener) = control.take()
        {
            let _ = listener.shutdown.send(());
        }
    }
}

impl<H: DhcpHandler> Inner<H> {
    async fn receive_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        mut shutdown: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];

        info!("DHCP server ready and listening");

        loop {
            let received = tokio::select! {
                _ = &mut shutdown => {
                    debug!("Receive loop shutting down");
                    return;
                }
                result = socket.recv_from(&mut buffer) => result,
            };

            match received {
                Ok((size, source)) => {
                    if let Some(reply) = self.dispatcher.handle_datagram(&buffer[..size], source) {
                        self.dispatcher.send_reply(Arc::clone(&socket), reply);
                    }
                }
                Err(error) => {
                    self.fail_receive(generation, &mut shutdown, error).await;
                    return;
                }
            }
        }
    }

    /// Stops the server after an unrecoverable receive error and reports it.
    async fn fail_receive(
        &self,
        generation: u64,
        shutdown: &mut oneshot::Receiver<()>,
        error: std::io::Error,
    ) {
        error!("Error receiving packet: {}", error);
        self.release_listener(generation, shutdown).await;
        self.dispatcher.handler.on_socket_error(&Error::Io(error));
    }

    /// Clears the control slot after a fatal receive error, unless a
    /// concurrent `stop` is already tearing this listener down.
    async fn release_listener(&self, generation: u64, shutdown: &mut oneshot::Receiver<()>) {
        tokio::select! {
            mut control = self.control.lock() => {
                if control
                    .as_ref()
                    .is_some_and(|listener| listener.generation == generation)
                {
                    *control = None;
                }
            }
            _ = shutdown => {}
        }
    }
}

fn create_socket(port: u16) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
        Error::Socket(format!("Failed to convert to tokio socket: {}", error))
    })?;

    Ok(tokio_socket)
}

/// Where a reply goes: unicast to `ciaddr` when the client has one,
/// otherwise limited broadcast.
pub fn reply_destination(reply: &DhcpPacket, client_port: u16) -> SocketAddrV4 {
    if reply.ciaddr.is_unspecified() {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, client_port)
    } else {
        SocketAddrV4::new(reply.ciaddr, client_port)
    }
}

/// A finalized reply ready for the socket.
struct Outgoing {
    message_type: MessageType,
    packet: DhcpPacket,
    encoded: Vec<u8>,
    destination: SocketAddrV4,
}

/// Protocol rules between the socket and the handler.
struct Dispatcher<H: DhcpHandler> {
    server_ip: Ipv4Addr,
    subnet_mask: Ipv4Addr,
    client_port: u16,
    handler: Arc<H>,
}

impl<H: DhcpHandler> Dispatcher<H> {
    fn new(server_ip: Ipv4Addr, subnet_mask: Ipv4Addr, client_port: u16, handler: Arc<H>) -> Self {
        Self {
            server_ip,
            subnet_mask,
            client_port,
            handler,
        }
    }

    /// Decodes one datagram and runs it through the handler. Any failure is
    /// reported to the handler and yields no reply.
    fn handle_datagram(&self, data: &[u8], source: SocketAddr) -> Option<DhcpPacket> {
        match self.dispatch(data, source) {
            Ok(reply) => reply,
            Err(error) => {
                debug!("Dropping datagram from {}: {}", source, error);
                self.report_message_error(&error);
                None
            }
        }
    }

    fn dispatch(&self, data: &[u8], source: SocketAddr) -> Result<Option<DhcpPacket>> {
        let message = DhcpMessage::decode(data)?;
        let mac = message.format_mac();

        if !message.giaddr().is_unspecified() {
            return Err(Error::Rejected(format!(
                "relayed message from {} via {}",
                mac,
                message.giaddr()
            )));
        }

        if message.op() != BOOTREQUEST {
            return Err(Error::Rejected(format!(
                "expected BOOTREQUEST from {}, got op {}",
                mac,
                message.op()
            )));
        }

        let message_type = message.message_type();
        info!("{} from {} ({})", message_type, mac, source);

        match message_type {
            MessageType::Discover => self.handle_discover(&message),
            MessageType::Request => self.handle_request(&message),
            MessageType::Decline => {
                self.handler.on_decline(&message);
                Ok(None)
            }
            MessageType::Release => {
                self.handler.on_release(&message);
                Ok(None)
            }
            MessageType::Inform => {
                self.handler.on_inform(&message);
                Ok(None)
            }
            MessageType::Offer | MessageType::Ack | MessageType::Nak => Err(Error::Rejected(
                format!("{} is not a client message (from {})", message_type, mac),
            )),
        }
    }

    fn handle_discover(&self, message: &DhcpMessage) -> Result<Option<DhcpPacket>> {
        let Some(offer) = self.handler.on_discover(message) else {
            debug!("No offer for {}", message.format_mac());
            return Ok(None);
        };

        build_offer(message, &offer).map(Some)
    }

    fn handle_request(&self, message: &DhcpMessage) -> Result<Option<DhcpPacket>> {
        if let Some(server_id) = message.server_identifier()?
            && server_id != self.server_ip
        {
            info!(
                "REQUEST from {} is for different server {}",
                message.format_mac(),
                server_id
            );
            return Ok(None);
        }

        let Some(decision) = self.handler.on_request(message) else {
            debug!("No answer for REQUEST from {}", message.format_mac());
            return Ok(None);
        };

        build_request_reply(message, &decision).map(Some)
    }

    /// Stamps server-owned options onto `reply`, encodes it and picks the
    /// destination.
    fn finalize(&self, mut reply: DhcpPacket) -> Result<Outgoing> {
        let message_type = reply.message_type().map_err(|error| {
            Error::Contract(format!("Response has no usable message type: {}", error))
        })?;

        match message_type {
            MessageType::Offer | MessageType::Ack => {
                reply
                    .options
                    .set_ipv4(OptionCode::SubnetMask, self.subnet_mask);
            }
            MessageType::Nak => {}
            other => {
                return Err(Error::Contract(format!(
                    "{} cannot be sent as a server response",
                    other
                )));
            }
        }

        reply
            .options
            .set_ipv4(OptionCode::ServerIdentifier, self.server_ip);

        Ok(Outgoing {
            message_type,
            encoded: reply.encode()?,
            destination: reply_destination(&reply, self.client_port),
            packet: reply,
        })
    }

    fn send_reply(&self, socket: Arc<UdpSocket>, reply: DhcpPacket) {
        let outgoing = match self.finalize(reply) {
            Ok(outgoing) => outgoing,
            Err(error) => {
                self.report_message_error(&error);
                return;
            }
        };

        let handler = Arc::clone(&self.handler);
        tokio::spawn(async move {
            let destination = outgoing.destination;
            match socket.send_to(&outgoing.encoded, destination).await {
                Ok(_) => {
                    info!(
                        "{} {} to {} via {}",
                        outgoing.message_type,
                        outgoing.packet.yiaddr,
                        outgoing.packet.format_mac(),
                        destination
                    );
                    handler.on_response_sent(&outgoing.packet);
                }
                Err(error) => {
                    error!(
                        "Failed to send {} to {}: {}",
                        outgoing.message_type, destination, error
                    );
                    handler.on_socket_error(&Error::Io(error));
                }
            }
        });
    }

    fn report_message_error(&self, error: &Error) {
        if error.is_contract_error() {
            error!("{}", error);
        }
        self.handler.on_message_error(error);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::handler::{Offer, RequestDecision};
    use crate::packet::BOOTREPLY;

    const SERVER_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const SUBNET_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
    const MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

    #[derive(Default)]
    struct RecordingHandler {
        offer: Option<Offer>,
        decision: Option<RequestDecision>,
        events: StdMutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl DhcpHandler for RecordingHandler {
        fn on_discover(&self, _message: &DhcpMessage) -> Option<Offer> {
            self.record("discover");
            self.offer
        }

        fn on_request(&self, _message: &DhcpMessage) -> Option<RequestDecision> {
            self.record("request");
            self.decision.clone()
        }

        fn on_decline(&self, _message: &DhcpMessage) {
            self.record("decline");
        }

        fn on_release(&self, _message: &DhcpMessage) {
            self.record("release");
        }

        fn on_inform(&self, _message: &DhcpMessage) {
            self.record("inform");
        }

        fn on_response_sent(&self, response: &DhcpPacket) {
            self.record(format!("sent {}", response.message_type().unwrap()));
        }

        fn on_socket_error(&self, error: &Error) {
            self.record(format!("socket error: {}", error));
        }

        fn on_message_error(&self, error: &Error) {
            let kind = if error.is_decode_error() {
                "decode error"
            } else if error.is_rejection() {
                "rejected"
            } else if error.is_contract_error() {
                "contract error"
            } else {
                "other error"
            };
            self.record(kind);
        }
    }

    fn offering_handler() -> RecordingHandler {
        RecordingHandler {
            offer: Some(Offer {
                address: Ipv4Addr::new(192, 168, 1, 50),
                lease_seconds: 3600,
            }),
            ..Default::default()
        }
    }

    fn acking_handler(address: Ipv4Addr) -> RecordingHandler {
        RecordingHandler {
            decision: Some(RequestDecision::Ack {
                address,
                lease_seconds: 600,
            }),
            ..Default::default()
        }
    }

    fn dispatcher(handler: RecordingHandler) -> Dispatcher<RecordingHandler> {
        Dispatcher::new(SERVER_IP, SUBNET_MASK, DHCP_CLIENT_PORT, Arc::new(handler))
    }

    fn source() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, DHCP_CLIENT_PORT))
    }

    fn client_packet(message_type: MessageType) -> DhcpPacket {
        let mut packet = DhcpPacket::new(BOOTREQUEST, message_type);
        packet.xid = 0xdeadbeef;
        packet.flags = 0x8000;
        packet.chaddr = MAC;
        packet
    }

    fn encode(packet: &DhcpPacket) -> Vec<u8> {
        packet.encode().unwrap()
    }

    #[test]
    fn test_constants() {
        assert_eq!(DHCP_SERVER_PORT, 67);
        assert_eq!(DHCP_CLIENT_PORT, 68);
        assert_eq!(RECV_BUFFER_SIZE, 65507);
    }

    #[test]
    fn test_discover_produces_offer() {
        let dispatcher = dispatcher(offering_handler());
        let discover = client_packet(MessageType::Discover);

        let reply = dispatcher
            .handle_datagram(&encode(&discover), source())
            .unwrap();

        assert_eq!(reply.op, BOOTREPLY);
        assert_eq!(reply.message_type().unwrap(), MessageType::Offer);
        assert_eq!(reply.yiaddr, Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(reply.xid, 0xdeadbeef);
        assert_eq!(dispatcher.handler.events(), vec!["discover"]);
    }

    #[test]
    fn test_discover_without_offer_is_silent() {
        let dispatcher = dispatcher(RecordingHandler::default());
        let discover = client_packet(MessageType::Discover);

        assert!(
            dispatcher
                .handle_datagram(&encode(&discover), source())
                .is_none()
        );
        assert_eq!(dispatcher.handler.events(), vec!["discover"]);
    }

    #[test]
    fn test_request_for_this_server_is_answered() {
        let address = Ipv4Addr::new(192, 168, 1, 50);
        let dispatcher = dispatcher(acking_handler(address));
        let mut request = client_packet(MessageType::Request);
        request
            .options
            .set_ipv4(OptionCode::ServerIdentifier, SERVER_IP);
        request
            .options
            .set_ipv4(OptionCode::RequestedIpAddress, address);

        let reply = dispatcher
            .handle_datagram(&encode(&request), source())
            .unwrap();

        assert_eq!(reply.message_type().unwrap(), MessageType::Ack);
        assert_eq!(reply.yiaddr, address);
        assert_eq!(dispatcher.handler.events(), vec!["request"]);
    }

    #[test]
    fn test_request_for_other_server_is_ignored() {
        let dispatcher = dispatcher(acking_handler(Ipv4Addr::new(192, 168, 1, 50)));
        let mut request = client_packet(MessageType::Request);
        request
            .options
            .set_ipv4(OptionCode::ServerIdentifier, Ipv4Addr::new(192, 168, 1, 2));

        assert!(
            dispatcher
                .handle_datagram(&encode(&request), source())
                .is_none()
        );
        assert!(dispatcher.handler.events().is_empty());
    }

    #[test]
    fn test_request_with_malformed_server_identifier() {
        let dispatcher = dispatcher(acking_handler(Ipv4Addr::new(192, 168, 1, 50)));
        let mut request = client_packet(MessageType::Request);
        request
            .options
            .set(OptionCode::ServerIdentifier, vec![192, 168, 1]);

        assert!(
            dispatcher
                .handle_datagram(&encode(&request), source())
                .is_none()
        );
        assert_eq!(dispatcher.handler.events(), vec!["decode error"]);
    }

    #[test]
    fn test_request_nak() {
        let dispatcher = dispatcher(RecordingHandler {
            decision: Some(RequestDecision::Nak {
                message: "no requested address".to_string(),
            }),
            ..Default::default()
        });
        let request = client_packet(MessageType::Request);

        let reply = dispatcher
            .handle_datagram(&encode(&request), source())
            .unwrap();

        assert_eq!(reply.message_type().unwrap(), MessageType::Nak);
        assert_eq!(reply.yiaddr, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_relayed_message_rejected() {
        let dispatcher = dispatcher(offering_handler());
        let mut discover = client_packet(MessageType::Discover);
        discover.giaddr = Ipv4Addr::new(10, 0, 0, 1);

        assert!(
            dispatcher
                .handle_datagram(&encode(&discover), source())
                .is_none()
        );
        assert_eq!(dispatcher.handler.events(), vec!["rejected"]);
    }

    #[test]
    fn test_bootreply_rejected() {
        let dispatcher = dispatcher(offering_handler());
        let mut discover = client_packet(MessageType::Discover);
        discover.op = BOOTREPLY;

        assert!(
            dispatcher
                .handle_datagram(&encode(&discover), source())
                .is_none()
        );
        assert_eq!(dispatcher.handler.events(), vec!["rejected"]);
    }

    #[test]
    fn test_server_message_types_rejected() {
        let dispatcher = dispatcher(offering_handler());

        for message_type in [MessageType::Offer, MessageType::Ack, MessageType::Nak] {
            let packet = client_packet(message_type);
            assert!(
                dispatcher
                    .handle_datagram(&encode(&packet), source())
                    .is_none()
            );
        }

        assert_eq!(
            dispatcher.handler.events(),
            vec!["rejected", "rejected", "rejected"]
        );
    }

    #[test]
    fn test_notifications_produce_no_reply() {
        let dispatcher = dispatcher(offering_handler());

        for message_type in [
            MessageType::Decline,
            MessageType::Release,
            MessageType::Inform,
        ] {
            let mut packet = client_packet(message_type);
            packet.ciaddr = Ipv4Addr::new(192, 168, 1, 50);
            assert!(
                dispatcher
                    .handle_datagram(&encode(&packet), source())
                    .is_none()
            );
        }

        assert_eq!(
            dispatcher.handler.events(),
            vec!["decline", "release", "inform"]
        );
    }

    #[test]
    fn test_garbage_reported_as_decode_error() {
        let dispatcher = dispatcher(offering_handler());

        assert!(dispatcher.handle_datagram(&[0u8; 10], source()).is_none());

        let mut bad_cookie = encode(&client_packet(MessageType::Discover));
        bad_cookie[236] = 0;
        assert!(dispatcher.handle_datagram(&bad_cookie, source()).is_none());

        assert_eq!(
            dispatcher.handler.events(),
            vec!["decode error", "decode error"]
        );
    }

    #[test]
    fn test_finalize_offer_adds_server_options() {
        let dispatcher = dispatcher(offering_handler());
        let mut offer = DhcpPacket::new(BOOTREPLY, MessageType::Offer);
        offer.yiaddr = Ipv4Addr::new(192, 168, 1, 50);

        let outgoing = dispatcher.finalize(offer).unwrap();
        let offer = &outgoing.packet;

        assert_eq!(outgoing.message_type, MessageType::Offer);
        assert_eq!(
            offer.options.get_ipv4(OptionCode::SubnetMask).unwrap(),
            Some(SUBNET_MASK)
        );
        assert_eq!(
            offer.options.get_ipv4(OptionCode::ServerIdentifier).unwrap(),
            Some(SERVER_IP)
        );
        assert_eq!(
            outgoing.destination,
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );

        let decoded = DhcpMessage::decode(&outgoing.encoded).unwrap();
        assert_eq!(decoded.server_identifier().unwrap(), Some(SERVER_IP));
    }

    #[test]
    fn test_finalize_nak_has_no_subnet_mask() {
        let dispatcher = dispatcher(offering_handler());
        let nak = DhcpPacket::new(BOOTREPLY, MessageType::Nak);

        let nak = dispatcher.finalize(nak).unwrap().packet;

        assert!(!nak.options.contains(OptionCode::SubnetMask));
        assert_eq!(
            nak.options.get_ipv4(OptionCode::ServerIdentifier).unwrap(),
            Some(SERVER_IP)
        );
    }

    #[test]
    fn test_finalize_overwrites_server_identifier() {
        let dispatcher = dispatcher(offering_handler());
        let mut ack = DhcpPacket::new(BOOTREPLY, MessageType::Ack);
        ack.options
            .set_ipv4(OptionCode::ServerIdentifier, Ipv4Addr::new(1, 2, 3, 4));

        let ack = dispatcher.finalize(ack).unwrap().packet;

        assert_eq!(
            ack.options.get_ipv4(OptionCode::ServerIdentifier).unwrap(),
            Some(SERVER_IP)
        );
    }

    #[test]
    fn test_finalize_rejects_client_message_types() {
        let dispatcher = dispatcher(offering_handler());

        for message_type in [MessageType::Discover, MessageType::Request, MessageType::Inform] {
            let packet = DhcpPacket::new(BOOTREPLY, message_type);
            assert!(matches!(
                dispatcher.finalize(packet),
                Err(Error::Contract(_))
            ));
        }

        let mut untyped = DhcpPacket::new(BOOTREPLY, MessageType::Ack);
        untyped.options.remove(OptionCode::DhcpMessageType);
        assert!(matches!(
            dispatcher.finalize(untyped),
            Err(Error::Contract(_))
        ));
    }

    #[test]
    fn test_reply_destination() {
        let mut reply = DhcpPacket::new(BOOTREPLY, MessageType::Ack);
        assert_eq!(
            reply_destination(&reply, 68),
            SocketAddrV4::new(Ipv4Addr::BROADCAST, 68)
        );

        reply.ciaddr = Ipv4Addr::new(192, 168, 1, 77);
        assert_eq!(
            reply_destination(&reply, 68),
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 77), 68)
        );
    }

    async fn wait_for_events(handler: &RecordingHandler, prefix: &str, count: usize) -> bool {
        for _ in 0..200 {
            let seen = handler
                .events()
                .iter()
                .filter(|recorded| recorded.starts_with(prefix))
                .count();
            if seen >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    async fn wait_for_event(handler: &RecordingHandler, prefix: &str) -> bool {
        wait_for_events(handler, prefix, 1).await
    }

    fn loopback(server: SocketAddr) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, server.port()))
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let server = DhcpServer::with_ports(
            Ipv4Addr::LOCALHOST,
            SUBNET_MASK,
            RecordingHandler::default(),
            0,
            DHCP_CLIENT_PORT,
        );

        assert!(!server.is_running().await);
        assert!(server.local_addr().await.is_none());
        server.stop().await;

        server.start().await.unwrap();
        assert!(server.is_running().await);
        let first = server.local_addr().await.unwrap();
        assert_ne!(first.port(), 0);

        server.start().await.unwrap();
        assert_eq!(server.local_addr().await, Some(first));

        server.stop().await;
        assert!(!server.is_running().await);
        server.stop().await;

        server.start().await.unwrap();
        assert!(server.is_running().await);
        server.stop().await;
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_start_fails_when_port_taken() {
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let server = DhcpServer::with_ports(
            Ipv4Addr::LOCALHOST,
            SUBNET_MASK,
            RecordingHandler::default(),
            port,
            DHCP_CLIENT_PORT,
        );

        assert!(matches!(server.start().await, Err(Error::Socket(_))));
        assert!(!server.is_running().await);
    }

    #[tokio::test]
    async fn test_listens_on_all_addresses() {
        let server = DhcpServer::with_ports(
            Ipv4Addr::new(192, 0, 2, 2),
            SUBNET_MASK,
            RecordingHandler::default(),
            0,
            DHCP_CLIENT_PORT,
        );
        server.start().await.unwrap();

        let local = server.local_addr().await.unwrap();
        assert_eq!(local.ip(), Ipv4Addr::UNSPECIFIED);
        assert_eq!(server.server_ip(), Ipv4Addr::new(192, 0, 2, 2));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_broadcast_discover_reaches_server() {
        let client = UdpSocket::bind("0.0.0.0:0").await.unwrap();
        client.set_broadcast(true).unwrap();
        let client_port = client.local_addr().unwrap().port();

        let server = DhcpServer::with_ports(
            Ipv4Addr::new(192, 0, 2, 2),
            SUBNET_MASK,
            offering_handler(),
            0,
            client_port,
        );
        server.start().await.unwrap();
        let server_port = server.local_addr().await.unwrap().port();

        let discover = encode(&client_packet(MessageType::Discover));
        client
            .send_to(&discover, (Ipv4Addr::BROADCAST, server_port))
            .await
            .unwrap();

        let handler = Arc::clone(server.handler());
        assert!(wait_for_event(&handler, "discover").await);
        assert!(server.is_running().await);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_send_failure_keeps_server_running() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // Port 0 is never a valid destination, so every reply send fails.
        let server = DhcpServer::with_ports(
            Ipv4Addr::LOCALHOST,
            SUBNET_MASK,
            acking_handler(Ipv4Addr::LOCALHOST),
            0,
            0,
        );
        server.start().await.unwrap();
        let server_addr = loopback(server.local_addr().await.unwrap());

        let mut request = client_packet(MessageType::Request);
        request.ciaddr = Ipv4Addr::LOCALHOST;
        client.send_to(&encode(&request), server_addr).await.unwrap();

        let handler = Arc::clone(server.handler());
        assert!(wait_for_event(&handler, "socket error: IO error").await);
        assert!(server.is_running().await);

        client.send_to(&encode(&request), server_addr).await.unwrap();
        assert!(wait_for_events(&handler, "request", 2).await);
        assert!(wait_for_events(&handler, "socket error", 2).await);
        assert!(server.is_running().await);
        assert!(!handler.events().iter().any(|event| event.starts_with("sent")));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_receive_failure_stops_server() {
        let server = DhcpServer::with_ports(
            Ipv4Addr::LOCALHOST,
            SUBNET_MASK,
            RecordingHandler::default(),
            0,
            DHCP_CLIENT_PORT,
        );
        server.start().await.unwrap();

        let generation = server
            .inner
            .control
            .lock()
            .await
            .as_ref()
            .map(|listener| listener.generation)
            .unwrap();
        let (_shutdown, mut shutdown_receiver) = oneshot::channel::<()>();

        server
            .inner
            .fail_receive(
                generation + 1,
                &mut shutdown_receiver,
                std::io::Error::other("stale loop"),
            )
            .await;
        assert!(server.is_running().await);

        server
            .inner
            .fail_receive(
                generation,
                &mut shutdown_receiver,
                std::io::Error::other("network down"),
            )
            .await;
        assert!(!server.is_running().await);
        assert!(server.local_addr().await.is_none());
        assert_eq!(
            server.handler().events(),
            vec![
                "socket error: IO error: stale loop",
                "socket error: IO error: network down"
            ]
        );

        server.start().await.unwrap();
        assert!(server.is_running().await);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_request_answered_over_udp() {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_port = client.local_addr().unwrap().port();

        let server = DhcpServer::with_ports(
            Ipv4Addr::LOCALHOST,
            SUBNET_MASK,
            acking_handler(Ipv4Addr::LOCALHOST),
            0,
            client_port,
        );
        server.start().await.unwrap();
        let server_addr = loopback(server.local_addr().await.unwrap());

        client.send_to(&[0u8; 10], server_addr).await.unwrap();

        let mut request = client_packet(MessageType::Request);
        request.ciaddr = Ipv4Addr::LOCALHOST;
        for code in 200u8..208 {
            request.options.set(code, vec![code; 250]);
        }
        let datagram = encode(&request);
        assert!(datagram.len() > 1500);
        client.send_to(&datagram, server_addr).await.unwrap();

        let mut buffer = vec![0u8; RECV_BUFFER_SIZE];
        let (size, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buffer))
            .await
            .expect("no reply within timeout")
            .unwrap();

        let reply = DhcpMessage::decode(&buffer[..size]).unwrap();
        assert_eq!(reply.op(), BOOTREPLY);
        assert_eq!(reply.message_type(), MessageType::Ack);
        assert_eq!(reply.xid(), 0xdeadbeef);
        assert_eq!(reply.ciaddr(), Ipv4Addr::LOCALHOST);
        assert_eq!(reply.yiaddr(), Ipv4Addr::LOCALHOST);
        assert_eq!(reply.server_identifier().unwrap(), Some(Ipv4Addr::LOCALHOST));
        assert_eq!(
            reply.options().get_ipv4(OptionCode::SubnetMask).unwrap(),
            Some(SUBNET_MASK)
        );

        let handler = Arc::clone(server.handler());
        assert!(wait_for_event(&handler, "sent ACK").await);
        assert_eq!(handler.events()[0], "decode error");
        assert!(server.is_running().await);

        server.stop().await;
    }
}
