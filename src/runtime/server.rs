use super::config::SlpConfig;
use super::lifecycle::{Lifecycle, ServerState};
use crate::codec::{Body, Message};
use crate::error::{Result, SlpError};
use crate::transport::{SlpTransport, TcpConnection, TcpServer, UdpTransport};
use log::{debug, error, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Sockets handed to handlers for unsolicited traffic.
pub struct ServerContext {
    pub udp: Arc<UdpTransport>,
    pub udp_addr: SocketAddr,
    pub tcp_addr: SocketAddr,
    /// `None` when the server does not use multicast.
    pub multicast: Option<SocketAddr>,
    pub max_transmission_unit: usize,
}

impl ServerContext {
    /// Sends `message` to the multicast group, if any.
    pub fn send_multicast(&self, message: &Message) -> Result<()> {
        let Some(group) = self.multicast else {
            return Ok(());
        };
        let bytes = message.encode()?;
        self.udp.send(&bytes, group)?;
        Ok(())
    }
}

pub trait MessageHandler: Send + Sync + 'static {
    /// A request that arrived over UDP. The reply goes back to `from`.
    fn handle_datagram(&self, message: Message, from: SocketAddr) -> Option<Message>;

    /// A request that arrived over an accepted TCP connection.
    fn handle_stream(&self, message: Message, from: SocketAddr) -> Option<Message>;

    fn on_start(&self, _ctx: &ServerContext) -> Result<()> {
        Ok(())
    }

    fn on_stop(&self, _ctx: &ServerContext) {}

    /// Called every timer period from the timer thread.
    fn on_timer(&self, _now: Instant, _ctx: &ServerContext) {}
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// UDP and TCP listen address; port 0 picks one port for both.
    pub bind: SocketAddr,
    pub multicast_group: Option<Ipv4Addr>,
    pub multicast_interface: Ipv4Addr,
    pub multicast_ttl: u32,
    pub max_transmission_unit: usize,
    pub max_tcp_connections: usize,
    pub max_tcp_frame: usize,
    /// Only loopback peers may open TCP connections.
    pub tcp_loopback_only: bool,
    pub tcp_timeout: Duration,
    pub timer_period: Duration,
}

impl ServerOptions {
    pub fn from_config(config: &SlpConfig) -> Result<Self> {
        Ok(ServerOptions {
            bind: config.bind_socket()?,
            multicast_group: Some(config.multicast_group()?),
            multicast_interface: config.multicast_interface(),
            multicast_ttl: config.multicast_ttl,
            max_transmission_unit: config.max_transmission_unit,
            max_tcp_connections: config.max_tcp_connections,
            max_tcp_frame: config.max_tcp_frame,
            tcp_loopback_only: false,
            tcp_timeout: config.unicast_timeout(),
            timer_period: config.sweep_period(),
        })
    }

    /// Unicast-only options on an ephemeral loopback port.
    pub fn loopback() -> Self {
        ServerOptions {
            bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            multicast_group: None,
            multicast_interface: Ipv4Addr::LOCALHOST,
            multicast_ttl: 1,
            max_transmission_unit: 1400,
            max_tcp_connections: 16,
            max_tcp_frame: 1 << 20,
            tcp_loopback_only: false,
            tcp_timeout: Duration::from_secs(5),
            timer_period: Duration::from_millis(200),
        }
    }

    pub fn with_tcp_loopback_only(mut self, enabled: bool) -> Self {
        self.tcp_loopback_only = enabled;
        self
    }
}

/// Runs a [`MessageHandler`] behind one UDP listener thread, one TCP accept
/// thread (one thread per accepted connection) and one timer thread.
pub struct AgentServer<H: MessageHandler> {
    handler: Arc<H>,
    options: ServerOptions,
    lifecycle: Lifecycle,
    running: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    context: Mutex<Option<Arc<ServerContext>>>,
}

impl<H: MessageHandler> AgentServer<H> {
    pub fn new(handler: Arc<H>, options: ServerOptions) -> Self {
        AgentServer {
            handler,
            options,
            lifecycle: Lifecycle::new("agent server"),
            running: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            context: Mutex::new(None),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn state(&self) -> ServerState {
        self.lifecycle.state()
    }

    pub fn wait_stopped(&self) {
        self.lifecycle.wait_for(ServerState::Stopped);
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.context().map(|ctx| ctx.udp_addr)
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.context().map(|ctx| ctx.tcp_addr)
    }

    fn context(&self) -> Option<Arc<ServerContext>> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Binds the listeners, runs the handler's start hook and spawns the
    /// listener threads. Does nothing if already running.
    pub fn start(&self) -> Result<()> {
        self.lifecycle.start(|| self.open()).map(|_| ())
    }

    /// Stops the listener threads and waits for them. Idempotent.
    pub fn stop(&self) {
        self.lifecycle.stop(|| self.close());
    }

    fn open(&self) -> Result<()> {
        let udp = if self.options.multicast_group.is_some() {
            UdpTransport::new_multicast(self.options.bind)?
        } else {
            UdpTransport::new(self.options.bind)?
        };
        let udp_addr = udp.local_addr()?;
        if let Some(group) = self.options.multicast_group {
            udp.try_join_multicast_v4(&group, &self.options.multicast_interface);
            if let Err(e) = udp.set_multicast_ttl_v4(self.options.multicast_ttl) {
                warn!("Could not set multicast TTL: {}", e);
            }
            let _ = udp.set_multicast_loop_v4(true);
        }

        let tcp_bind = SocketAddr::new(self.options.bind.ip(), udp_addr.port());
        let tcp = TcpServer::bind(tcp_bind, self.options.max_tcp_connections)?
            .with_max_frame(self.options.max_tcp_frame)
            .loopback_only(self.options.tcp_loopback_only);
        tcp.set_nonblocking(true)?;
        let tcp_addr = tcp.local_addr()?;

        let ctx = Arc::new(ServerContext {
            udp: Arc::new(udp),
            udp_addr,
            tcp_addr,
            multicast: self
                .options
                .multicast_group
                .map(|g| SocketAddr::from((g, udp_addr.port()))),
            max_transmission_unit: self.options.max_transmission_unit,
        });

        self.handler.on_start(&ctx)?;
        self.running.store(true, Ordering::SeqCst);

        let threads = vec![
            self.spawn("slp-udp", {
                let handler = Arc::clone(&self.handler);
                let running = Arc::clone(&self.running);
                let ctx = Arc::clone(&ctx);
                move || udp_loop(handler, running, ctx)
            })?,
            self.spawn("slp-tcp", {
                let handler = Arc::clone(&self.handler);
                let running = Arc::clone(&self.running);
                let timeout = self.options.tcp_timeout;
                move || tcp_loop(handler, running, tcp, timeout)
            })?,
            self.spawn("slp-timer", {
                let handler = Arc::clone(&self.handler);
                let running = Arc::clone(&self.running);
                let ctx = Arc::clone(&ctx);
                let period = self.options.timer_period;
                move || timer_loop(handler, running, ctx, period)
            })?,
        ];
        self.threads.lock().unwrap_or_else(PoisonError::into_inner).extend(threads);
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
        info!("Agent listening on udp {} tcp {}", udp_addr, tcp_addr);
        Ok(())
    }

    fn spawn<F>(&self, name: &str, f: F) -> Result<thread::JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        thread::Builder::new().name(name.to_string()).spawn(f).map_err(|e| {
            self.running.store(false, Ordering::SeqCst);
            SlpError::network(format!("cannot spawn {} thread: {}", name, e))
        })
    }

    fn close(&self) {
        let ctx = self.context.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(ctx) = &ctx {
            self.handler.on_stop(ctx);
        }
        self.running.store(false, Ordering::SeqCst);
        let threads: Vec<_> =
            self.threads.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("Listener thread panicked");
            }
        }
        info!("Agent stopped");
    }
}

impl<H: MessageHandler> Drop for AgentServer<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Runs one handler call; a panic drops the request instead of the listener.
fn guarded<F>(what: &str, from: SocketAddr, call: F) -> Option<Message>
where
    F: FnOnce() -> Option<Message>,
{
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(reply) => reply,
        Err(_) => {
            error!("Handler panicked on {} from {}, request dropped", what, from);
            None
        }
    }
}

fn udp_loop<H: MessageHandler>(
    handler: Arc<H>,
    running: Arc<AtomicBool>,
    ctx: Arc<ServerContext>,
) {
    let mut buf = vec![0u8; 0xFFFF];
    while running.load(Ordering::Relaxed) {
        let (len, from) = match ctx.udp.receive(&mut buf, POLL_INTERVAL) {
            Ok(Some(received)) => received,
            Ok(None) => continue,
            Err(e) => {
                debug!("UDP receive error: {}", e);
                continue;
            }
        };
        let message = match Message::decode(&buf[..len]) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping datagram from {}: {}", from, e);
                continue;
            }
        };
        let reply = guarded("datagram", from, || handler.handle_datagram(message, from));
        let Some(reply) = reply else {
            continue;
        };
        match fit_datagram(reply, ctx.max_transmission_unit) {
            Ok(bytes) => {
                if let Err(e) = ctx.udp.send(&bytes, from) {
                    warn!("Failed to reply to {}: {}", from, e);
                }
            }
            Err(e) => warn!("Failed to encode reply to {}: {}", from, e),
        }
    }
}

fn tcp_loop<H: MessageHandler>(
    handler: Arc<H>,
    running: Arc<AtomicBool>,
    server: TcpServer,
    timeout: Duration,
) {
    while running.load(Ordering::Relaxed) {
        match server.accept() {
            Ok(Some(conn)) => {
                let handler = Arc::clone(&handler);
                let spawned = thread::Builder::new()
                    .name(format!("slp-conn-{}", conn.peer))
                    .spawn(move || serve_connection(handler, conn, timeout));
                if let Err(e) = spawned {
                    warn!("Cannot spawn connection thread: {}", e);
                }
            }
            Ok(None) => thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

fn serve_connection<H: MessageHandler>(handler: Arc<H>, conn: TcpConnection, timeout: Duration) {
    let TcpConnection { transport, peer, permit: _permit } = conn;
    if let Err(e) = transport.set_timeout(timeout) {
        warn!("Cannot set timeout on connection from {}: {}", peer, e);
    }
    loop {
        let frame = match transport.read_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("Closing connection from {}: {}", peer, e);
                break;
            }
        };
        let message = match Message::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping frame from {}: {}", peer, e);
                continue;
            }
        };
        if let Some(reply) = guarded("stream", peer, || handler.handle_stream(message, peer)) {
            if let Err(e) = transport.reply(&reply) {
                debug!("Failed to reply to {}: {}", peer, e);
                break;
            }
        }
    }
    transport.close();
}

fn timer_loop<H: MessageHandler>(
    handler: Arc<H>,
    running: Arc<AtomicBool>,
    ctx: Arc<ServerContext>,
    period: Duration,
) {
    let mut next = Instant::now() + period;
    while running.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= next {
            handler.on_timer(now, &ctx);
            next = now + period;
        }
        thread::sleep(next.saturating_duration_since(now).min(POLL_INTERVAL));
    }
}

/// Encodes `reply`, dropping trailing entries and setting the overflow flag
/// when it does not fit in one datagram.
pub fn fit_datagram(mut reply: Message, mtu: usize) -> Result<Vec<u8>> {
    let bytes = reply.encode()?;
    if bytes.len() <= mtu {
        return Ok(bytes);
    }
    reply.header.overflow = true;
    loop {
        let shrunk = match &mut reply.body {
            Body::SrvRply(rply) => rply.urls.pop().is_some(),
            Body::SrvTypeRply(rply) => rply.service_types.pop().is_some(),
            Body::AttrRply(rply) if !rply.attributes.is_empty() => {
                rply.attributes = Default::default();
                true
            }
            _ => false,
        };
        let bytes = reply.encode()?;
        if bytes.len() <= mtu || !shrunk {
            return Ok(bytes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MessageHeader, SrvAck, SrvRply};
    use crate::model::ServiceUrl;
    use std::sync::atomic::AtomicUsize;

    struct EchoHandler {
        ticks: AtomicUsize,
    }

    impl MessageHandler for EchoHandler {
        fn handle_datagram(&self, message: Message, _from: SocketAddr) -> Option<Message> {
            Some(message.ack(0))
        }

        fn handle_stream(&self, message: Message, _from: SocketAddr) -> Option<Message> {
            Some(message.ack(7))
        }

        fn on_timer(&self, _now: Instant, _ctx: &ServerContext) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Panics on XID 1, acks everything else.
    struct FragileHandler;

    impl MessageHandler for FragileHandler {
        fn handle_datagram(&self, message: Message, _from: SocketAddr) -> Option<Message> {
            assert_ne!(message.xid(), 1, "bad request");
            Some(message.ack(0))
        }

        fn handle_stream(&self, message: Message, from: SocketAddr) -> Option<Message> {
            self.handle_datagram(message, from)
        }
    }

    fn request(xid: u16) -> Message {
        Message::new(MessageHeader::new(xid, "en"), Body::SrvAck(SrvAck::default()))
    }

    #[test]
    fn test_server_lifecycle_and_replies() {
        let handler = Arc::new(EchoHandler { ticks: AtomicUsize::new(0) });
        let mut options = ServerOptions::loopback();
        options.timer_period = Duration::from_millis(20);
        let server = AgentServer::new(Arc::clone(&handler), options);
        server.start().unwrap();
        assert_eq!(server.state(), ServerState::Running);
        let udp_addr = server.udp_addr().unwrap();
        let tcp_addr = server.tcp_addr().unwrap();
        assert_eq!(udp_addr.port(), tcp_addr.port());

        let client = UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap();
        let bytes = request(9).encode().unwrap();
        let (reply, _) = client
            .send_and_receive(&bytes, udp_addr, 9, 1500, Duration::from_secs(2))
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(&reply).unwrap().body.error_code(), Some(0));

        let tcp =
            crate::transport::TcpTransport::connect(tcp_addr, Duration::from_secs(2)).unwrap();
        let reply = tcp.exchange(&request(10).encode().unwrap()).unwrap();
        assert_eq!(Message::decode(&reply).unwrap().body.error_code(), Some(7));

        thread::sleep(Duration::from_millis(100));
        assert!(handler.ticks.load(Ordering::SeqCst) > 0);

        server.stop();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.udp_addr().is_none());
    }

    #[test]
    fn test_loopback_only_tcp_accepts_loopback() {
        let handler = Arc::new(EchoHandler { ticks: AtomicUsize::new(0) });
        let options = ServerOptions::loopback().with_tcp_loopback_only(true);
        let server = AgentServer::new(handler, options);
        server.start().unwrap();
        let tcp_addr = server.tcp_addr().unwrap();
        let tcp =
            crate::transport::TcpTransport::connect(tcp_addr, Duration::from_secs(2)).unwrap();
        assert!(tcp.exchange(&request(1).encode().unwrap()).is_ok());
    }

    #[test]
    fn test_fit_datagram_sets_overflow() {
        let urls = (0..100)
            .map(|i| ServiceUrl::new(format!("service:test://host-{:03}", i), 60))
            .collect();
        let reply = Message::new(
            MessageHeader::new(1, "en"),
            Body::SrvRply(SrvRply { error_code: 0, urls }),
        );
        let bytes = fit_datagram(reply, 512).unwrap();
        assert!(bytes.len() <= 512);
        let decoded = Message::decode(&bytes).unwrap();
        assert!(decoded.header.overflow);
        match decoded.body {
            Body::SrvRply(rply) => assert!(!rply.urls.is_empty() && rply.urls.len() < 100),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_handler_panic_keeps_listeners_up() {
        let server = AgentServer::new(Arc::new(FragileHandler), ServerOptions::loopback());
        server.start().unwrap();
        let udp_addr = server.udp_addr().unwrap();

        let client = UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap();
        let bad = request(1).encode().unwrap();
        let timeout = Duration::from_millis(300);
        assert!(client.send_and_receive(&bad, udp_addr, 1, 1500, timeout).unwrap().is_none());

        let good = request(2).encode().unwrap();
        let reply = client.send_and_receive(&good, udp_addr, 2, 1500, Duration::from_secs(2));
        assert!(reply.unwrap().is_some());

        let tcp_addr = server.tcp_addr().unwrap();
        let tcp =
            crate::transport::TcpTransport::connect(tcp_addr, Duration::from_secs(2)).unwrap();
        tcp.write_frame(&bad).unwrap();
        let reply = tcp.exchange(&request(3).encode().unwrap()).unwrap();
        assert_eq!(Message::decode(&reply).unwrap().xid(), 3);
        server.stop();
    }
}
