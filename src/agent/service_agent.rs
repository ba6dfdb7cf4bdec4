use super::ack::{AckPerformer, UdpAckPerformer};
use super::forwarder::{ForwardTicket, Operation, RegistrationForwarder};
use super::{advertised_url, deregistration_entry, local_addresses, query, registration_entry};
use crate::cache::{CacheResult, ServiceInfoCache};
use crate::codec::{Body, DaAdvert, Message, SaAdvert, SrvRqst, XidGenerator};
use crate::discovery::{directory_agent_request, Converger};
use crate::error::{ErrorCode, Result, SlpError};
use crate::model::{Attributes, DirectoryAgentInfo, Scopes, ServiceInfo, ServiceType};
use crate::runtime::{MessageHandler, ServerContext, SlpConfig};
use crate::transport::UdpTransport;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// Service agent: holds the registrations of local services, answers
/// multicast queries for them and keeps every known DA in sync.
///
/// Local services register over a loopback TCP connection (SrvReg/SrvDeReg,
/// acknowledged with a SrvAck) or directly through [`register_service`].
///
/// [`register_service`]: ServiceAgent::register_service
pub struct ServiceAgent {
    scopes: Scopes,
    attributes: Attributes,
    language: String,
    multicast_group: Ipv4Addr,
    multicast_ttl: u32,
    da_port: u16,
    discovery_timeframe: Option<Duration>,
    mtu: usize,
    cache: ServiceInfoCache,
    forwarder: RegistrationForwarder,
    /// Held across a cache change and its forward so DA queues see changes
    /// in cache order.
    forwarding: Mutex<()>,
    directory_agents: RwLock<HashMap<SocketAddr, DirectoryAgentInfo>>,
    xids: Arc<XidGenerator>,
    local: RwLock<Vec<IpAddr>>,
    url: Mutex<String>,
}

impl ServiceAgent {
    /// Forwards to DAs over UDP.
    pub fn new(config: &SlpConfig) -> Result<Self> {
        let performer =
            Arc::new(UdpAckPerformer::new(config.unicast_timeout(), config.max_transmission_unit));
        Self::with_performer(config, performer)
    }

    pub fn with_performer(config: &SlpConfig, performer: Arc<dyn AckPerformer>) -> Result<Self> {
        let xids = Arc::new(XidGenerator::new());
        let multicast_group = config.multicast_group()?;
        let static_das = config
            .directory_agent_addresses()?
            .into_iter()
            .map(|addr| (addr, DirectoryAgentInfo::from_address(addr, Scopes::default())))
            .collect();
        Ok(ServiceAgent {
            scopes: config.agent_scopes(),
            attributes: config.agent_attributes()?,
            language: config.language.clone(),
            multicast_group,
            multicast_ttl: config.multicast_ttl,
            da_port: config.port,
            discovery_timeframe: config
                .da_discovery_on_start
                .then(|| config.convergence_timeframe()),
            mtu: config.max_transmission_unit,
            cache: ServiceInfoCache::new(),
            forwarder: RegistrationForwarder::new(
                performer,
                Arc::clone(&xids),
                config.forward_retries,
            ),
            forwarding: Mutex::new(()),
            directory_agents: RwLock::new(static_das),
            xids,
            local: RwLock::new(local_addresses(config.bind_ip()?, multicast_group)),
            url: Mutex::new(advertised_url(
                ServiceType::SERVICE_AGENT,
                config.bind_socket()?,
                multicast_group,
            )),
        })
    }

    pub fn cache(&self) -> &ServiceInfoCache {
        &self.cache
    }

    pub fn forwarder(&self) -> &RegistrationForwarder {
        &self.forwarder
    }

    pub fn directory_agents(&self) -> Vec<DirectoryAgentInfo> {
        let mut das: Vec<_> = self
            .directory_agents
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        das.sort_by_key(|da| da.address);
        das
    }

    /// Caches `entry` and forwards it to the DAs serving its scopes.
    ///
    /// Empty scopes mean the agent's own scopes. Scopes the agent does not
    /// serve are rejected, as is a zero lifetime.
    pub fn register_service(
        &self,
        mut entry: ServiceInfo,
        is_update: bool,
    ) -> Result<Vec<ForwardTicket>> {
        if entry.url.lifetime() == 0 {
            return Err(SlpError::Protocol { code: ErrorCode::InvalidRegistration.into() });
        }
        self.apply_agent_scopes(&mut entry)?;
        let _order = self.forwarding.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.cache.register(entry.clone(), is_update)?;
        info!(
            "{} {} in scopes {}",
            if is_update { "Updated" } else { "Registered" },
            entry.url,
            entry.scopes
        );
        let das = self.directory_agents();
        Ok(self.forwarder.forward(Operation::Register, &entry, &result, is_update, &das))
    }

    /// Removes `entry` (or, with `is_update`, the attribute tags it carries)
    /// and forwards the removal.
    pub fn deregister_service(
        &self,
        mut entry: ServiceInfo,
        is_update: bool,
    ) -> Result<Vec<ForwardTicket>> {
        self.apply_agent_scopes(&mut entry)?;
        let _order = self.forwarding.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.cache.deregister(&entry, is_update)?;
        info!("Deregistered {}{}", entry.url, if is_update { " attributes" } else { "" });
        let das = self.directory_agents();
        Ok(self.forwarder.forward(Operation::Deregister, &entry, &result, is_update, &das))
    }

    fn apply_agent_scopes(&self, entry: &mut ServiceInfo) -> Result<()> {
        if entry.scopes.is_empty() {
            entry.scopes = self.scopes.clone();
        }
        if !self.scopes.is_empty() && !self.scopes.contains_all(&entry.scopes) {
            return Err(SlpError::ScopeMismatch {
                url: entry.url.to_string(),
                registered: self.scopes.to_string(),
                requested: entry.scopes.to_string(),
            });
        }
        Ok(())
    }

    /// Adds or refreshes a DA. A DA seen for the first time, or one that
    /// rebooted, receives every cached registration.
    pub fn add_directory_agent(&self, da: DirectoryAgentInfo) -> Vec<ForwardTicket> {
        let _order = self.forwarding.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self
            .directory_agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(da.address, da.clone());
        let rebooted = match &previous {
            None => true,
            Some(known) => known.boot_timestamp != da.boot_timestamp,
        };
        if !rebooted {
            return Vec::new();
        }
        info!("Directory agent {} at {} scopes {}", da.url, da.address, da.scopes);
        let mut tickets = Vec::new();
        for service in self.cache.snapshot(|_| true) {
            let result = CacheResult { previous: None, current: Some(service.clone()) };
            tickets.extend(self.forwarder.forward(
                Operation::Register,
                &service,
                &result,
                false,
                std::slice::from_ref(&da),
            ));
        }
        tickets
    }

    pub fn remove_directory_agent(&self, address: &SocketAddr) -> bool {
        let removed = self
            .directory_agents
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);
        if removed.is_some() {
            self.forwarder.forget(address);
            info!("Directory agent at {} went away", address);
        }
        removed.is_some()
    }

    fn on_da_advert(&self, advert: DaAdvert, language: String, from: SocketAddr) {
        if advert.error_code != 0 {
            return;
        }
        let address = DirectoryAgentInfo::resolve_address(&advert.url, from.ip(), self.da_port);
        if advert.boot_timestamp == 0 {
            self.remove_directory_agent(&address);
            return;
        }
        self.add_directory_agent(DirectoryAgentInfo {
            url: advert.url,
            address,
            scopes: advert.scopes,
            attributes: advert.attributes,
            language,
            boot_timestamp: advert.boot_timestamp,
        });
    }

    fn local(&self) -> Vec<IpAddr> {
        self.local.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn sa_advert(&self, request: &Message, rqst: &SrvRqst) -> Option<Message> {
        let foreign = !self.scopes.is_empty() && !self.scopes.overlaps(&rqst.scopes);
        if !rqst.scopes.is_empty() && foreign {
            return None;
        }
        let responded = query::already_responded(&rqst.previous_responders, &self.local());
        if request.header.multicast && responded {
            return None;
        }
        let url = self.url.lock().unwrap_or_else(PoisonError::into_inner).clone();
        Some(Message::new(
            request.reply_header(),
            Body::SaAdvert(SaAdvert {
                url,
                scopes: self.scopes.clone(),
                attributes: self.attributes.clone(),
            }),
        ))
    }

    fn handle_registration(&self, message: &Message) -> Option<Message> {
        let outcome = match &message.body {
            Body::SrvReg(reg) => {
                let (entry, is_update) = registration_entry(&message.header, reg);
                self.register_service(entry, is_update)
            }
            Body::SrvDeReg(dereg) => {
                let (entry, is_update) = deregistration_entry(&message.header, dereg);
                self.deregister_service(entry, is_update)
            }
            _ => return None,
        };
        let code = match outcome {
            Ok(_tickets) => 0,
            Err(e) => {
                warn!("{:?} xid={} rejected: {}", message.function(), message.xid(), e);
                e.error_code()
            }
        };
        Some(message.ack(code))
    }

    fn discover_directory_agents(&self, ctx: &ServerContext, timeframe: Duration) -> Result<()> {
        let Some(group) = ctx.multicast else {
            return Ok(());
        };
        let transport = UdpTransport::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        transport.set_multicast_ttl_v4(self.multicast_ttl)?;
        let request = directory_agent_request(self.xids.next_xid(), &self.language, &self.scopes);
        let found = Converger::new(&transport, group, timeframe)
            .with_max_len(self.mtu)
            .converge_da_adverts(&request)?;
        debug!("DA discovery found {} directory agent(s)", found.len());
        for da in found.into_iter().filter(DirectoryAgentInfo::is_alive) {
            self.add_directory_agent(da);
        }
        Ok(())
    }
}

impl MessageHandler for ServiceAgent {
    fn handle_datagram(&self, message: Message, from: SocketAddr) -> Option<Message> {
        match &message.body {
            Body::DaAdvert(advert) => {
                self.on_da_advert(advert.clone(), message.header.language.clone(), from);
                None
            }
            Body::SrvRqst(rqst) if query::requests_type(rqst, ServiceType::SERVICE_AGENT) => {
                self.sa_advert(&message, rqst)
            }
            Body::SrvRqst(rqst) if query::requests_type(rqst, ServiceType::DIRECTORY_AGENT) => None,
            Body::SrvReg(_) | Body::SrvDeReg(_) => {
                debug!("Ignoring {:?} over UDP from {}", message.function(), from);
                None
            }
            _ => query::answer(&self.cache, &message, &self.scopes, &self.local()),
        }
    }

    fn handle_stream(&self, message: Message, from: SocketAddr) -> Option<Message> {
        if !from.ip().is_loopback() {
            debug!("Dropping {:?} from non-local peer {}", message.function(), from);
            return None;
        }
        match &message.body {
            Body::SrvReg(_) | Body::SrvDeReg(_) => self.handle_registration(&message),
            _ => query::answer(&self.cache, &message, &self.scopes, &self.local()),
        }
    }

    fn on_start(&self, ctx: &ServerContext) -> Result<()> {
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) =
            advertised_url(ServiceType::SERVICE_AGENT, ctx.udp_addr, self.multicast_group);
        {
            let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
            if !local.contains(&ctx.udp_addr.ip()) && !ctx.udp_addr.ip().is_unspecified() {
                local.push(ctx.udp_addr.ip());
            }
        }
        if let Some(timeframe) = self.discovery_timeframe {
            if let Err(e) = self.discover_directory_agents(ctx, timeframe) {
                warn!("Directory agent discovery failed: {}", e);
            }
        }
        info!("Service agent up, scopes {}", self.scopes);
        Ok(())
    }

    fn on_timer(&self, now: Instant, _ctx: &ServerContext) {
        for expired in self.cache.sweep(now) {
            info!("Registration of {} expired", expired.url);
        }
    }

    fn on_stop(&self, _ctx: &ServerContext) {
        info!("Service agent stopping with {} registration(s)", self.cache.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{MessageHeader, SrvAck, SrvDeReg, SrvReg};
    use crate::model::ServiceUrl;

    /// Acks everything and remembers what it was sent.
    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(SocketAddr, Message)>>,
    }

    impl AckPerformer for Recorder {
        fn perform(&self, destination: SocketAddr, message: &Message) -> Result<SrvAck> {
            self.sent.lock().unwrap().push((destination, message.clone()));
            Ok(SrvAck { error_code: 0 })
        }
    }

    fn config(das: &[&str]) -> SlpConfig {
        SlpConfig {
            bind_address: "127.0.0.1".into(),
            scopes: vec!["scope1".into(), "scope2".into()],
            directory_agents: das.iter().map(|s| s.to_string()).collect(),
            da_discovery_on_start: false,
            ..SlpConfig::default()
        }
    }

    fn agent(das: &[&str]) -> (ServiceAgent, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let agent = ServiceAgent::with_performer(&config(das), recorder.clone()).unwrap();
        (agent, recorder)
    }

    fn jmx(scopes: &[&str], lifetime: u16) -> ServiceInfo {
        ServiceInfo::new(
            ServiceUrl::new("service:jmx:rmi:///jndi/rmi:///jmxrmi", lifetime),
            Scopes::new(scopes),
            Attributes::new(),
            "en",
        )
    }

    fn wait_all(tickets: Vec<ForwardTicket>) {
        for ticket in tickets {
            assert!(ticket.wait().unwrap().is_success());
        }
    }

    fn local_peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_register_forwards_to_configured_da() {
        let (agent, recorder) = agent(&["127.0.0.1:4270"]);
        let tickets = agent.register_service(jmx(&[], 13), false).unwrap();
        assert_eq!(tickets.len(), 1);
        wait_all(tickets);

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent[0].0, "127.0.0.1:4270".parse().unwrap());
        match &sent[0].1.body {
            Body::SrvReg(reg) => {
                assert_eq!(reg.scopes, Scopes::new(["scope1", "scope2"]));
                assert_eq!(reg.url.lifetime(), 13);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(sent[0].1.header.fresh);
    }

    #[test]
    fn test_register_rejects_foreign_scope_and_zero_lifetime() {
        let (agent, _) = agent(&[]);
        let err = agent.register_service(jmx(&["elsewhere"], 13), false).unwrap_err();
        assert_eq!(err.error_code(), 4);
        let err = agent.register_service(jmx(&["scope1"], 0), false).unwrap_err();
        assert_eq!(err.error_code(), 3);
        assert!(agent.cache().is_empty());
    }

    #[test]
    fn test_tcp_registration_is_loopback_only() {
        let (agent, _) = agent(&[]);
        let mut header = MessageHeader::new(9, "en");
        header.fresh = true;
        let reg = Message::new(
            header,
            Body::SrvReg(SrvReg {
                url: ServiceUrl::new("service:jmx:rmi:///jndi/rmi:///jmxrmi", 13),
                service_type: ServiceType::new("service:jmx:rmi"),
                scopes: Scopes::new(["scope1"]),
                attributes: Attributes::new(),
            }),
        );

        assert!(agent.handle_stream(reg.clone(), "10.0.0.7:5000".parse().unwrap()).is_none());
        assert!(agent.cache().is_empty());
        assert!(agent.handle_datagram(reg.clone(), local_peer()).is_none());
        assert!(agent.cache().is_empty());

        let ack = agent.handle_stream(reg, local_peer()).unwrap();
        assert_eq!(ack.xid(), 9);
        assert_eq!(ack.body, Body::SrvAck(SrvAck { error_code: 0 }));
        assert_eq!(agent.cache().len(), 1);
    }

    #[test]
    fn test_tcp_deregistration_of_unknown_service() {
        let (agent, _) = agent(&[]);
        let dereg = Message::new(
            MessageHeader::new(4, "en"),
            Body::SrvDeReg(SrvDeReg {
                scopes: Scopes::new(["scope1"]),
                url: ServiceUrl::new("service:none://h", 0),
                tags: vec![],
            }),
        );
        let ack = agent.handle_stream(dereg, local_peer()).unwrap();
        assert_eq!(ack.body.error_code(), Some(3));
    }

    #[test]
    fn test_learns_and_forgets_directory_agents() {
        let (agent, recorder) = agent(&[]);
        agent.register_service(jmx(&["scope1"], 300), false).unwrap();

        let advert = |boot: u32| {
            Message::new(
                MessageHeader::new(0, "en"),
                Body::DaAdvert(DaAdvert {
                    error_code: 0,
                    boot_timestamp: boot,
                    url: "service:directory-agent://10.0.0.5:4270".into(),
                    scopes: Scopes::new(["scope1"]),
                    attributes: Attributes::new(),
                    spi: String::new(),
                }),
            )
        };
        let from: SocketAddr = "10.0.0.5:4270".parse().unwrap();
        assert!(agent.handle_datagram(advert(100), from).is_none());
        assert_eq!(agent.directory_agents().len(), 1);
        agent.forwarder().shutdown();
        // the cached registration was pushed to the new DA
        let sent = recorder.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, from);

        agent.handle_datagram(advert(0), from);
        assert!(agent.directory_agents().is_empty());
    }

    #[test]
    fn test_answers_service_agent_request() {
        let (agent, _) = agent(&[]);
        let mut header = MessageHeader::new(12, "en");
        header.multicast = true;
        let request = Message::new(
            header,
            Body::SrvRqst(SrvRqst {
                service_type: ServiceType::new(ServiceType::SERVICE_AGENT),
                scopes: Scopes::new(["scope2"]),
                ..Default::default()
            }),
        );
        let reply = agent.handle_datagram(request, "10.0.0.8:427".parse().unwrap()).unwrap();
        match reply.body {
            Body::SaAdvert(advert) => {
                assert!(advert.url.starts_with("service:service-agent://127.0.0.1"));
                assert_eq!(advert.scopes, Scopes::new(["scope1", "scope2"]));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_answers_multicast_query_for_registered_service() {
        let (agent, _) = agent(&[]);
        agent.register_service(jmx(&["scope1"], 300), false).unwrap();
        let mut header = MessageHeader::new(13, "en");
        header.multicast = true;
        let request = Message::new(
            header,
            Body::SrvRqst(SrvRqst {
                service_type: ServiceType::new("service:jmx"),
                scopes: Scopes::new(["scope1"]),
                ..Default::default()
            }),
        );
        let reply = agent.handle_datagram(request, "10.0.0.8:427".parse().unwrap()).unwrap();
        match reply.body {
            Body::SrvRply(rply) => assert_eq!(rply.urls.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_timer_sweeps_expired() {
        let (agent, _) = agent(&[]);
        agent.register_service(jmx(&["scope1"], 13), false).unwrap();
        let ctx = ServerContext {
            udp: Arc::new(UdpTransport::new("127.0.0.1:0".parse().unwrap()).unwrap()),
            udp_addr: "127.0.0.1:0".parse().unwrap(),
            tcp_addr: "127.0.0.1:0".parse().unwrap(),
            multicast: None,
            max_transmission_unit: 1400,
        };
        agent.on_timer(Instant::now() + Duration::from_secs(12), &ctx);
        assert_eq!(agent.cache().len(), 1);
        agent.on_timer(Instant::now() + Duration::from_secs(14), &ctx);
        assert!(agent.cache().is_empty());
    }

    #[test]
    fn test_concurrent_registrations_reach_da_in_cache_order() {
        let (agent, recorder) = agent(&["127.0.0.1:4270"]);
        let agent = Arc::new(agent);
        let writers: Vec<_> = (0..4)
            .map(|writer| {
                let agent = Arc::clone(&agent);
                std::thread::spawn(move || {
                    for round in 0..25 {
                        let mut entry = jmx(&["scope1"], 300);
                        let attrs = format!("(w={}),(r={})", writer, round);
                        entry.attributes = Attributes::from_wire(&attrs).unwrap();
                        agent.register_service(entry, false).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        agent.forwarder().shutdown();

        let cached = agent.cache().snapshot(|_| true).remove(0);
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 100);
        match &sent[sent.len() - 1].1.body {
            Body::SrvReg(reg) => assert_eq!(reg.attributes, cached.attributes),
            other => panic!("unexpected {:?}", other),
        }
    }
}
