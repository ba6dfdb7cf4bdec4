use super::ack::ephemeral_for;
use crate::codec::{AttrRqst, Body, Message, MessageHeader, SrvRqst, SrvTypeRqst, XidGenerator};
use crate::discovery::{
    directory_agent_request, multicast_service_request, service_agent_request, Converger,
};
use crate::error::{Result, SlpError};
use crate::model::{
    Attributes, DirectoryAgentInfo, Scopes, ServiceAgentInfo, ServiceType, ServiceUrl,
};
use crate::runtime::SlpConfig;
use crate::transport::{TcpTransport, UdpTransport};
use log::{debug, warn};
use std::net::SocketAddr;
use std::time::Duration;

const MAX_DATAGRAM: usize = 0xFFFF;

/// Client side of SLP.
///
/// With known DAs every query goes to them by unicast, first DA that answers
/// wins. Without, queries are multicast and the replies converged.
pub struct UserAgent {
    scopes: Scopes,
    language: String,
    multicast: SocketAddr,
    multicast_ttl: u32,
    directory_agents: Vec<SocketAddr>,
    timeframe: Duration,
    timeout: Duration,
    mtu: usize,
    xids: XidGenerator,
}

impl UserAgent {
    pub fn new(config: &SlpConfig) -> Result<Self> {
        Ok(UserAgent {
            scopes: config.agent_scopes(),
            language: config.language.clone(),
            multicast: config.multicast_destination()?,
            multicast_ttl: config.multicast_ttl,
            directory_agents: config.directory_agent_addresses()?,
            timeframe: config.convergence_timeframe(),
            timeout: config.unicast_timeout(),
            mtu: config.max_transmission_unit,
            xids: XidGenerator::new(),
        })
    }

    pub fn with_directory_agent(mut self, address: SocketAddr) -> Self {
        if !self.directory_agents.contains(&address) {
            self.directory_agents.push(address);
        }
        self
    }

    pub fn directory_agents(&self) -> &[SocketAddr] {
        &self.directory_agents
    }

    fn scopes_or_default(&self, scopes: &Scopes) -> Scopes {
        if scopes.is_empty() { self.scopes.clone() } else { scopes.clone() }
    }

    fn header(&self) -> MessageHeader {
        MessageHeader::new(self.xids.next_xid(), self.language.clone())
    }

    fn multicast_transport(&self) -> Result<UdpTransport> {
        let transport = UdpTransport::new(ephemeral_for(self.multicast))?;
        transport.set_multicast_ttl_v4(self.multicast_ttl)?;
        Ok(transport)
    }

    fn converge<R, F>(&self, mut request: Message, accept: F) -> Result<Vec<R>>
    where
        F: FnMut(Message, SocketAddr) -> Option<R>,
    {
        request.header.multicast = true;
        let transport = self.multicast_transport()?;
        let converged = Converger::new(&transport, self.multicast, self.timeframe)
            .with_max_len(self.mtu)
            .converge(&request, accept)?;
        Ok(converged.into_replies())
    }

    /// One unicast request/reply over UDP, repeated over TCP when the
    /// datagram reply was truncated.
    pub fn unicast(&self, destination: SocketAddr, request: &Message) -> Result<Message> {
        let bytes = request.encode()?;
        let transport = UdpTransport::new(ephemeral_for(destination))?;
        let (frame, _) = transport
            .send_and_receive(&bytes, destination, request.xid(), MAX_DATAGRAM, self.timeout)?
            .ok_or_else(|| {
                let timeout = self.timeout;
                SlpError::network(format!("no reply from {} within {:?}", destination, timeout))
            })?;
        let reply = Message::decode(&frame)?;
        if !reply.header.overflow {
            return Ok(reply);
        }
        debug!("Reply from {} overflowed, retrying over TCP", destination);
        let stream = TcpTransport::connect(destination, self.timeout)?;
        let frame = stream.exchange(&bytes);
        stream.close();
        Message::decode(&frame?)
    }

    /// Asks the known DAs in order; the first reply with a zero error code wins.
    fn ask_directory_agents<R>(
        &self,
        build: impl Fn() -> Message,
        extract: impl Fn(Body) -> Option<R>,
    ) -> Result<R> {
        let mut last_error = SlpError::network("no directory agent answered");
        for da in &self.directory_agents {
            let reply = match self.unicast(*da, &build()) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("Directory agent {} failed: {}", da, e);
                    last_error = e;
                    continue;
                }
            };
            match reply.body.error_code() {
                Some(0) => {}
                Some(code) => {
                    last_error = SlpError::Protocol { code };
                    continue;
                }
                None => {}
            }
            match extract(reply.body) {
                Some(result) => return Ok(result),
                None => last_error = SlpError::parse(format!("unexpected reply from {}", da)),
            }
        }
        Err(last_error)
    }

    pub fn find_directory_agents(&self, scopes: &Scopes) -> Result<Vec<DirectoryAgentInfo>> {
        let scopes = self.scopes_or_default(scopes);
        let request = directory_agent_request(self.xids.next_xid(), &self.language, &scopes);
        let transport = self.multicast_transport()?;
        Converger::new(&transport, self.multicast, self.timeframe)
            .with_max_len(self.mtu)
            .converge_da_adverts(&request)
    }

    pub fn find_service_agents(&self, scopes: &Scopes) -> Result<Vec<ServiceAgentInfo>> {
        let scopes = self.scopes_or_default(scopes);
        let request = service_agent_request(self.xids.next_xid(), &self.language, &scopes);
        let transport = self.multicast_transport()?;
        Converger::new(&transport, self.multicast, self.timeframe)
            .with_max_len(self.mtu)
            .converge_sa_adverts(&request)
    }

    /// URLs of services of `service_type` in `scopes` matching the LDAP `filter`.
    pub fn find_services(
        &self,
        service_type: &str,
        scopes: &Scopes,
        filter: &str,
    ) -> Result<Vec<ServiceUrl>> {
        let scopes = self.scopes_or_default(scopes);
        if self.directory_agents.is_empty() {
            let xid = self.xids.next_xid();
            let request =
                multicast_service_request(xid, &self.language, service_type, &scopes, filter);
            let transport = self.multicast_transport()?;
            return Converger::new(&transport, self.multicast, self.timeframe)
                .with_max_len(self.mtu)
                .converge_service_replies(&request);
        }
        self.ask_directory_agents(
            || {
                Message::new(
                    self.header(),
                    Body::SrvRqst(SrvRqst {
                        previous_responders: Vec::new(),
                        service_type: ServiceType::new(service_type),
                        scopes: scopes.clone(),
                        predicate: filter.to_string(),
                        spi: String::new(),
                    }),
                )
            },
            |body| match body {
                Body::SrvRply(rply) => Some(rply.urls),
                _ => None,
            },
        )
    }

    /// Attributes of a service URL, or of every service of a type.
    /// An empty tag list asks for all attributes.
    pub fn find_attributes(
        &self,
        url_or_type: &str,
        scopes: &Scopes,
        tags: &[String],
    ) -> Result<Attributes> {
        let scopes = self.scopes_or_default(scopes);
        let build = || {
            Message::new(
                self.header(),
                Body::AttrRqst(AttrRqst {
                    previous_responders: Vec::new(),
                    url: url_or_type.to_string(),
                    scopes: scopes.clone(),
                    tags: tags.to_vec(),
                    spi: String::new(),
                }),
            )
        };
        let extract = |body: Body| match body {
            Body::AttrRply(rply) if rply.error_code == 0 => Some(rply.attributes),
            _ => None,
        };
        if self.directory_agents.is_empty() {
            let replies = self.converge(build(), |reply, _| extract(reply.body))?;
            return Ok(replies.iter().fold(Attributes::new(), |acc, a| acc.merge(a)));
        }
        self.ask_directory_agents(build, extract)
    }

    /// Service types in `scopes`. `None` asks for every naming authority.
    pub fn find_service_types(
        &self,
        naming_authority: Option<&str>,
        scopes: &Scopes,
    ) -> Result<Vec<ServiceType>> {
        let scopes = self.scopes_or_default(scopes);
        let build = || {
            Message::new(
                self.header(),
                Body::SrvTypeRqst(SrvTypeRqst {
                    previous_responders: Vec::new(),
                    naming_authority: naming_authority.map(str::to_string),
                    scopes: scopes.clone(),
                }),
            )
        };
        let extract = |body: Body| match body {
            Body::SrvTypeRply(rply) if rply.error_code == 0 => Some(rply.service_types),
            _ => None,
        };
        let lists = if self.directory_agents.is_empty() {
            self.converge(build(), |reply, _| extract(reply.body))?
        } else {
            vec![self.ask_directory_agents(build, extract)?]
        };
        let mut types: Vec<ServiceType> = Vec::new();
        for service_type in lists.into_iter().flatten() {
            if !types.iter().any(|t| t.as_str().eq_ignore_ascii_case(service_type.as_str())) {
                types.push(service_type);
            }
        }
        Ok(types)
    }
}
