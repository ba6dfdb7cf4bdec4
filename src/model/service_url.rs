use std::fmt;

/// A service type such as `service:printer:lpr` or plain `http`.
///
/// `service:` types are either abstract (`service:jmx`) or concrete
/// (`service:jmx:rmi`); an abstract type matches every concrete type below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ServiceType {
    text: String,
}

impl ServiceType {
    pub const DIRECTORY_AGENT: &'static str = "service:directory-agent";
    pub const SERVICE_AGENT: &'static str = "service:service-agent";

    pub fn new(text: impl Into<String>) -> Self {
        ServiceType { text: text.into() }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn is_service_url(&self) -> bool {
        self.text.get(..8).is_some_and(|prefix| prefix.eq_ignore_ascii_case("service:"))
    }

    /// `service:jmx:rmi` -> `service:jmx`; non-service types are returned as is.
    pub fn abstract_type(&self) -> &str {
        if !self.is_service_url() {
            return &self.text;
        }
        match self.text[8..].find(':') {
            Some(idx) => &self.text[..8 + idx],
            None => &self.text,
        }
    }

    pub fn is_abstract(&self) -> bool {
        self.is_service_url() && self.abstract_type().len() == self.text.len()
    }

    /// Naming authority of the abstract type; empty for IANA.
    pub fn naming_authority(&self) -> &str {
        let name = self.abstract_type();
        let name = if self.is_service_url() { &name[8..] } else { name };
        match name.find('.') {
            Some(idx) => &name[idx + 1..],
            None => "",
        }
    }

    /// True when a request for `self` should return services of type `registered`.
    pub fn matches(&self, registered: &ServiceType) -> bool {
        if self.text.eq_ignore_ascii_case(&registered.text) {
            return true;
        }
        self.is_abstract() && self.text.eq_ignore_ascii_case(registered.abstract_type())
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// A service URL with its advertised lifetime in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceUrl {
    url: String,
    lifetime: u16,
}

impl ServiceUrl {
    pub const LIFETIME_NONE: u16 = 0;
    pub const LIFETIME_DEFAULT: u16 = 10800;
    /// Registrations with this lifetime never expire.
    pub const LIFETIME_PERMANENT: u16 = 0xFFFF;

    pub fn new(url: impl Into<String>, lifetime: u16) -> Self {
        ServiceUrl { url: url.into(), lifetime }
    }

    pub fn as_str(&self) -> &str {
        &self.url
    }

    pub fn lifetime(&self) -> u16 {
        self.lifetime
    }

    pub fn with_lifetime(&self, lifetime: u16) -> Self {
        ServiceUrl { url: self.url.clone(), lifetime }
    }

    pub fn service_type(&self) -> ServiceType {
        ServiceType::new(self.scheme())
    }

    /// Everything before `://`, or the whole URL when there is no authority part.
    pub fn scheme(&self) -> &str {
        match self.url.find("://") {
            Some(idx) => &self.url[..idx],
            None => &self.url,
        }
    }

    fn authority(&self) -> &str {
        let Some(idx) = self.url.find("://") else {
            return "";
        };
        let rest = &self.url[idx + 3..];
        let end = rest.find('/').unwrap_or(rest.len());
        let authority = &rest[..end];
        match authority.rfind('@') {
            Some(at) => &authority[at + 1..],
            None => authority,
        }
    }

    pub fn host(&self) -> Option<&str> {
        let authority = self.authority();
        if authority.is_empty() {
            return None;
        }
        if let Some(stripped) = authority.strip_prefix('[') {
            return stripped.find(']').map(|end| &stripped[..end]);
        }
        match authority.rfind(':') {
            Some(idx) => Some(&authority[..idx]),
            None => Some(authority),
        }
    }

    pub fn port(&self) -> Option<u16> {
        let authority = self.authority();
        let port_part = if authority.starts_with('[') {
            let end = authority.find(']')?;
            authority[end + 1..].strip_prefix(':')?
        } else {
            &authority[authority.rfind(':')? + 1..]
        };
        port_part.parse().ok()
    }

    pub fn path(&self) -> &str {
        let Some(idx) = self.url.find("://") else {
            return "";
        };
        let rest = &self.url[idx + 3..];
        match rest.find('/') {
            Some(start) => &rest[start..],
            None => "",
        }
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jmx_url_parts() {
        let url = ServiceUrl::new("service:jmx:rmi:///jndi/rmi:///jmxrmi", 13);
        assert_eq!(url.scheme(), "service:jmx:rmi");
        assert_eq!(url.host(), None);
        assert_eq!(url.port(), None);
        assert_eq!(url.path(), "/jndi/rmi:///jmxrmi");
        assert_eq!(url.service_type().as_str(), "service:jmx:rmi");
        assert_eq!(url.lifetime(), 13);
    }

    #[test]
    fn test_host_and_port() {
        let url = ServiceUrl::new("service:printer:lpr://10.0.0.7:515/queue", 60);
        assert_eq!(url.host(), Some("10.0.0.7"));
        assert_eq!(url.port(), Some(515));
        assert_eq!(url.path(), "/queue");

        let v6 = ServiceUrl::new("http://[fe80::1]:8080", 60);
        assert_eq!(v6.host(), Some("fe80::1"));
        assert_eq!(v6.port(), Some(8080));

        let plain = ServiceUrl::new("service:directory-agent://192.168.1.4", 0);
        assert_eq!(plain.host(), Some("192.168.1.4"));
        assert_eq!(plain.port(), None);
    }

    #[test]
    fn test_abstract_type_matching() {
        let concrete = ServiceType::new("service:jmx:rmi");
        let abstract_type = ServiceType::new("service:jmx");
        assert_eq!(concrete.abstract_type(), "service:jmx");
        assert!(abstract_type.is_abstract());
        assert!(!concrete.is_abstract());
        assert!(abstract_type.matches(&concrete));
        assert!(!concrete.matches(&abstract_type));
        assert!(ServiceType::new("SERVICE:JMX:RMI").matches(&concrete));
        assert!(!ServiceType::new("service:printer").matches(&concrete));
    }

    #[test]
    fn test_non_ascii_types() {
        let odd = ServiceType::new("a\u{e9}\u{e9}\u{e9}\u{e9}");
        assert!(!odd.is_service_url());
        assert_eq!(odd.abstract_type(), odd.as_str());
        assert_eq!(odd.naming_authority(), "");
        assert!(!odd.matches(&ServiceType::new("service:x:y")));

        let accented = ServiceType::new("service:\u{e9}t\u{e9}.acme:lpr");
        assert_eq!(accented.abstract_type(), "service:\u{e9}t\u{e9}.acme");
        assert_eq!(accented.naming_authority(), "acme");
    }

    #[test]
    fn test_naming_authority() {
        assert_eq!(ServiceType::new("service:printer.acme:lpr").naming_authority(), "acme");
        assert_eq!(ServiceType::new("service:printer:lpr").naming_authority(), "");
    }
}
