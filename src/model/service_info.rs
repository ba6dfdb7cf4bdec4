use super::{Attributes, Scopes, ServiceType, ServiceUrl};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Cache identity of a registration: lower-cased service type plus URL text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub service_type: String,
    pub url: String,
}

/// One advertised service.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub url: ServiceUrl,
    pub service_type: ServiceType,
    pub scopes: Scopes,
    pub attributes: Attributes,
    pub language: String,
    /// Set when the registration that produced this entry was a fresh one.
    pub fresh: bool,
    /// `None` for permanent registrations or entries not yet cached.
    pub expires_at: Option<Instant>,
}

impl ServiceInfo {
    pub fn new(
        url: ServiceUrl,
        scopes: Scopes,
        attributes: Attributes,
        language: impl Into<String>,
    ) -> Self {
        let service_type = url.service_type();
        ServiceInfo {
            url,
            service_type,
            scopes,
            attributes,
            language: language.into(),
            fresh: true,
            expires_at: None,
        }
    }

    /// Used when the registered type differs from the URL scheme (non `service:` URLs).
    pub fn with_service_type(mut self, service_type: ServiceType) -> Self {
        if !service_type.is_empty() {
            self.service_type = service_type;
        }
        self
    }

    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            service_type: self.service_type.as_str().to_ascii_lowercase(),
            url: self.url.as_str().to_string(),
        }
    }

    /// Recomputes the expiry from the URL lifetime, starting at `now`.
    pub fn refresh_expiry(&mut self, now: Instant) {
        self.expires_at = match self.url.lifetime() {
            ServiceUrl::LIFETIME_PERMANENT => None,
            secs => Some(now + Duration::from_secs(u64::from(secs))),
        };
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }

    /// Whole seconds left before expiry, rounded up.
    pub fn remaining_lifetime(&self, now: Instant) -> u16 {
        match self.expires_at {
            None => self.url.lifetime(),
            Some(at) => {
                let left = at.saturating_duration_since(now);
                let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
                secs.min(u64::from(self.url.lifetime())) as u16
            }
        }
    }
}

/// A directory agent known to this agent, learned from a DAAdvert or configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryAgentInfo {
    pub url: String,
    /// Where to send unicast traffic; the host comes from the transport, never from the payload.
    pub address: SocketAddr,
    pub scopes: Scopes,
    pub attributes: Attributes,
    pub language: String,
    pub boot_timestamp: u32,
}

impl DirectoryAgentInfo {
    pub fn from_address(address: SocketAddr, scopes: Scopes) -> Self {
        DirectoryAgentInfo {
            url: format!("{}://{}", ServiceType::DIRECTORY_AGENT, address.ip()),
            address,
            scopes,
            attributes: Attributes::new(),
            language: String::new(),
            boot_timestamp: 1,
        }
    }

    /// Target port is taken from the advertised URL when present, else `default_port`.
    pub fn resolve_address(url: &str, responder: IpAddr, default_port: u16) -> SocketAddr {
        let port = ServiceUrl::new(url, 0).port().unwrap_or(default_port);
        SocketAddr::new(responder, port)
    }

    /// A boot timestamp of zero announces that the DA is going down.
    pub fn is_alive(&self) -> bool {
        self.boot_timestamp != 0
    }

    /// An agent with no configured scopes is served by every DA.
    pub fn serves(&self, scopes: &Scopes) -> bool {
        self.scopes.is_empty() || self.scopes.overlaps(scopes)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceAgentInfo {
    pub url: String,
    pub responder: IpAddr,
    pub scopes: Scopes,
    pub attributes: Attributes,
    pub language: String,
}
