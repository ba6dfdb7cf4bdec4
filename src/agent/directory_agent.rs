use super::{advertised_url, deregistration_entry, local_addresses, query, registration_entry};
use crate::cache::ServiceInfoCache;
use crate::codec::{Body, DaAdvert, Message, MessageHeader, SrvRqst};
use crate::error::{ErrorCode, Result};
use crate::model::{Attributes, Scopes, ServiceType};
use crate::runtime::{MessageHandler, ServerContext, SlpConfig};
use log::{debug, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Directory agent: a registration cache for every SA in its scopes.
///
/// Accepts SrvReg/SrvDeReg from any peer over UDP or TCP, answers queries
/// from the cache and announces itself with DAAdverts.
pub struct DirectoryAgent {
    scopes: Scopes,
    attributes: Attributes,
    language: String,
    multicast_group: Ipv4Addr,
    boot_timestamp: u32,
    advertise_period: Option<Duration>,
    cache: ServiceInfoCache,
    url: Mutex<String>,
    local: RwLock<Vec<IpAddr>>,
    next_advert: Mutex<Option<Instant>>,
}

impl DirectoryAgent {
    pub fn new(config: &SlpConfig) -> Result<Self> {
        let multicast_group = config.multicast_group()?;
        let boot_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1)
            .max(1);
        Ok(DirectoryAgent {
            scopes: config.agent_scopes(),
            attributes: config.agent_attributes()?,
            language: config.language.clone(),
            multicast_group,
            boot_timestamp,
            advertise_period: config.advertise_period(),
            cache: ServiceInfoCache::new(),
            url: Mutex::new(advertised_url(
                ServiceType::DIRECTORY_AGENT,
                config.bind_socket()?,
                multicast_group,
            )),
            local: RwLock::new(local_addresses(config.bind_ip()?, multicast_group)),
            next_advert: Mutex::new(None),
        })
    }

    pub fn cache(&self) -> &ServiceInfoCache {
        &self.cache
    }

    pub fn url(&self) -> String {
        self.url.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn boot_timestamp(&self) -> u32 {
        self.boot_timestamp
    }

    fn advert(&self, header: MessageHeader, boot_timestamp: u32) -> Message {
        Message::new(
            header,
            Body::DaAdvert(DaAdvert {
                error_code: 0,
                boot_timestamp,
                url: self.url(),
                scopes: self.scopes.clone(),
                attributes: self.attributes.clone(),
                spi: String::new(),
            }),
        )
    }

    /// Unsolicited adverts carry XID 0.
    fn unsolicited_advert(&self, boot_timestamp: u32) -> Message {
        let mut header = MessageHeader::new(0, self.language.clone());
        header.multicast = true;
        self.advert(header, boot_timestamp)
    }

    fn announce(&self, ctx: &ServerContext, boot_timestamp: u32) {
        if let Err(e) = ctx.send_multicast(&self.unsolicited_advert(boot_timestamp)) {
            warn!("Failed to multicast DAAdvert: {}", e);
        }
    }

    fn solicited_advert(&self, request: &Message, rqst: &SrvRqst) -> Option<Message> {
        let local = self.local.read().unwrap_or_else(PoisonError::into_inner);
        if request.header.multicast && query::already_responded(&rqst.previous_responders, &local) {
            return None;
        }
        if let Err(code) = query::check_scopes(&self.scopes, &rqst.scopes) {
            if request.header.multicast {
                return None;
            }
            let mut reply = self.advert(request.reply_header(), self.boot_timestamp);
            if let Body::DaAdvert(advert) = &mut reply.body {
                advert.error_code = code;
            }
            return Some(reply);
        }
        Some(self.advert(request.reply_header(), self.boot_timestamp))
    }

    /// A DA with no configured scopes accepts any non-empty scope set.
    fn supports_scopes(&self, scopes: &Scopes) -> bool {
        !scopes.is_empty() && (self.scopes.is_empty() || self.scopes.contains_all(scopes))
    }

    /// Applies a SrvReg or SrvDeReg and builds the SrvAck.
    fn handle_registration(&self, message: &Message, from: SocketAddr) -> Option<Message> {
        let code = match &message.body {
            Body::SrvReg(reg) => {
                let (entry, is_update) = registration_entry(&message.header, reg);
                if entry.url.lifetime() == 0 {
                    ErrorCode::InvalidRegistration.into()
                } else if !self.supports_scopes(&entry.scopes) {
                    ErrorCode::ScopeNotSupported.into()
                } else {
                    match self.cache.register(entry, is_update) {
                        Ok(_) => {
                            info!("Registered {} from {}", reg.url, from);
                            0
                        }
                        Err(e) => e.error_code(),
                    }
                }
            }
            Body::SrvDeReg(dereg) => {
                let (entry, is_update) = deregistration_entry(&message.header, dereg);
                match self.cache.deregister(&entry, is_update) {
                    Ok(_) => {
                        info!("Deregistered {} from {}", dereg.url, from);
                        0
                    }
                    Err(e) => e.error_code(),
                }
            }
            _ => return None,
        };
        if code != 0 {
            debug!("{:?} from {} rejected with code {}", message.function(), from, code);
        }
        Some(message.ack(code))
    }

    fn dispatch(&self, message: Message, from: SocketAddr) -> Option<Message> {
        match &message.body {
            Body::SrvReg(_) | Body::SrvDeReg(_) => self.handle_registration(&message, from),
            Body::SrvRqst(rqst) if query::requests_type(rqst, ServiceType::DIRECTORY_AGENT) => {
                self.solicited_advert(&message, rqst)
            }
            Body::SrvRqst(rqst) if query::requests_type(rqst, ServiceType::SERVICE_AGENT) => None,
            _ => {
                let local = self.local.read().unwrap_or_else(PoisonError::into_inner);
                query::answer(&self.cache, &message, &self.scopes, &local)
            }
        }
    }
}

impl MessageHandler for DirectoryAgent {
    fn handle_datagram(&self, message: Message, from: SocketAddr) -> Option<Message> {
        self.dispatch(message, from)
    }

    fn handle_stream(&self, message: Message, from: SocketAddr) -> Option<Message> {
        self.dispatch(message, from)
    }

    fn on_start(&self, ctx: &ServerContext) -> Result<()> {
        *self.url.lock().unwrap_or_else(PoisonError::into_inner) =
            advertised_url(ServiceType::DIRECTORY_AGENT, ctx.udp_addr, self.multicast_group);
        {
            let mut local = self.local.write().unwrap_or_else(PoisonError::into_inner);
            let ip = ctx.udp_addr.ip();
            if !ip.is_unspecified() && !local.contains(&ip) {
                local.push(ip);
            }
        }
        self.announce(ctx, self.boot_timestamp);
        *self.next_advert.lock().unwrap_or_else(PoisonError::into_inner) =
            self.advertise_period.map(|period| Instant::now() + period);
        info!("Directory agent {} up, scopes {}", self.url(), self.scopes);
        Ok(())
    }

    fn on_timer(&self, now: Instant, ctx: &ServerContext) {
        for expired in self.cache.sweep(now) {
            debug!("Registration of {} expired", expired.url);
        }
        let mut next = self.next_advert.lock().unwrap_or_else(PoisonError::into_inner);
        if let (Some(due), Some(period)) = (*next, self.advertise_period) {
            if now >= due {
                self.announce(ctx, self.boot_timestamp);
                *next = Some(now + period);
            }
        }
    }

    fn on_stop(&self, ctx: &ServerContext) {
        self.announce(ctx, 0);
        info!("Directory agent {} stopping", self.url());
    }
}
