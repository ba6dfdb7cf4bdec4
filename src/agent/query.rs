//! Answers to SrvRqst, AttrRqst and SrvTypeRqst from a service cache,
//! shared by the service agent and the directory agent.

use crate::cache::ServiceInfoCache;
use crate::codec::{
    AttrRply, AttrRqst, Body, Message, SrvRply, SrvRqst, SrvTypeRply, SrvTypeRqst,
};
use crate::error::ErrorCode;
use crate::model::{Attributes, Filter, Scopes, ServiceInfo, ServiceType, ServiceUrl};
use log::debug;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Instant;

/// True when one of our addresses is in the request's previous responder list.
pub fn already_responded(previous_responders: &[String], local: &[IpAddr]) -> bool {
    previous_responders
        .iter()
        .filter_map(|pr| pr.trim().parse::<IpAddr>().ok())
        .any(|pr| local.contains(&pr))
}

/// True for a SrvRqst asking for the agent type `name`.
pub fn requests_type(rqst: &SrvRqst, name: &str) -> bool {
    rqst.service_type.as_str().eq_ignore_ascii_case(name)
}

fn language_matches(requested: &str, registered: &str) -> bool {
    requested.is_empty() || registered.is_empty() || requested.eq_ignore_ascii_case(registered)
}

fn in_scope(service: &ServiceInfo, scopes: &Scopes) -> bool {
    scopes.is_empty() || service.scopes.overlaps(scopes)
}

/// Cached services a SrvRqst selects, in URL order.
pub fn matching_services(
    cache: &ServiceInfoCache,
    service_type: &ServiceType,
    scopes: &Scopes,
    filter: &Filter,
    language: &str,
) -> Vec<ServiceInfo> {
    let mut found = cache.snapshot(|s| {
        service_type.matches(&s.service_type)
            && in_scope(s, scopes)
            && language_matches(language, &s.language)
            && filter.matches(&s.attributes)
    });
    found.sort_by(|a, b| a.url.as_str().cmp(b.url.as_str()));
    found
}

/// Rejects requests for scopes this agent does not serve.
pub fn check_scopes(agent_scopes: &Scopes, requested: &Scopes) -> Result<(), u16> {
    if agent_scopes.is_empty() || requested.is_empty() || agent_scopes.overlaps(requested) {
        Ok(())
    } else {
        Err(ErrorCode::ScopeNotSupported.into())
    }
}

/// URLs go out with the lifetime they were registered with.
pub fn service_reply(
    cache: &ServiceInfoCache,
    request: &Message,
    rqst: &SrvRqst,
    agent_scopes: &Scopes,
) -> Message {
    let header = request.reply_header();
    if let Err(code) = check_scopes(agent_scopes, &rqst.scopes) {
        return Message::new(header, Body::SrvRply(SrvRply { error_code: code, urls: vec![] }));
    }
    let filter = match Filter::parse(&rqst.predicate) {
        Ok(filter) => filter,
        Err(e) => {
            debug!("Bad predicate '{}': {}", rqst.predicate, e);
            return Message::new(
                header,
                Body::SrvRply(SrvRply { error_code: ErrorCode::ParseError.into(), urls: vec![] }),
            );
        }
    };
    let now = Instant::now();
    let language = &request.header.language;
    let urls: Vec<ServiceUrl> =
        matching_services(cache, &rqst.service_type, &rqst.scopes, &filter, language)
            .into_iter()
            .filter(|s| !s.is_expired(now))
            .map(|s| s.url)
            .collect();
    Message::new(header, Body::SrvRply(SrvRply { error_code: 0, urls }))
}

/// AttrRqst names either a registered URL or a service type.
pub fn attribute_reply(
    cache: &ServiceInfoCache,
    request: &Message,
    rqst: &AttrRqst,
    agent_scopes: &Scopes,
) -> Message {
    let header = request.reply_header();
    if let Err(code) = check_scopes(agent_scopes, &rqst.scopes) {
        let attributes = Attributes::new();
        return Message::new(header, Body::AttrRply(AttrRply { error_code: code, attributes }));
    }
    let by_url = cache.snapshot(|s| s.url.as_str() == rqst.url && in_scope(s, &rqst.scopes));
    let sources = if by_url.is_empty() {
        let service_type = ServiceType::new(rqst.url.as_str());
        let language = &request.header.language;
        matching_services(cache, &service_type, &rqst.scopes, &Filter::All, language)
    } else {
        by_url
    };
    let attributes = sources
        .iter()
        .fold(Attributes::new(), |acc, s| acc.merge(&s.attributes.select(&rqst.tags)));
    Message::new(header, Body::AttrRply(AttrRply { error_code: 0, attributes }))
}

pub fn service_type_reply(
    cache: &ServiceInfoCache,
    request: &Message,
    rqst: &SrvTypeRqst,
    agent_scopes: &Scopes,
) -> Message {
    let header = request.reply_header();
    if let Err(code) = check_scopes(agent_scopes, &rqst.scopes) {
        let service_types = vec![];
        return Message::new(
            header,
            Body::SrvTypeRply(SrvTypeRply { error_code: code, service_types }),
        );
    }
    let types: BTreeSet<String> = cache
        .snapshot(|s| {
            in_scope(s, &rqst.scopes)
                && match &rqst.naming_authority {
                    None => true,
                    Some(authority) => {
                        s.service_type.naming_authority().eq_ignore_ascii_case(authority)
                    }
                }
        })
        .into_iter()
        .map(|s| s.service_type.as_str().to_ascii_lowercase())
        .collect();
    Message::new(
        header,
        Body::SrvTypeRply(SrvTypeRply {
            error_code: 0,
            service_types: types.into_iter().map(ServiceType::new).collect(),
        }),
    )
}

/// Answers a query from `cache`. Returns `None` for non-query messages, and
/// for multicast queries already answered by us or with nothing to report.
pub fn answer(
    cache: &ServiceInfoCache,
    message: &Message,
    agent_scopes: &Scopes,
    local: &[IpAddr],
) -> Option<Message> {
    let (reply, previous_responders) = match &message.body {
        Body::SrvRqst(rqst) => {
            (service_reply(cache, message, rqst, agent_scopes), &rqst.previous_responders)
        }
        Body::AttrRqst(rqst) => {
            (attribute_reply(cache, message, rqst, agent_scopes), &rqst.previous_responders)
        }
        Body::SrvTypeRqst(rqst) => {
            (service_type_reply(cache, message, rqst, agent_scopes), &rqst.previous_responders)
        }
        _ => return None,
    };
    if message.header.multicast
        && (already_responded(previous_responders, local) || !worth_multicast_reply(&reply))
    {
        return None;
    }
    Some(reply)
}

/// Multicast requests get no answer when the answer would be empty or an error.
pub fn worth_multicast_reply(reply: &Message) -> bool {
    if reply.body.error_code().unwrap_or(0) != 0 {
        return false;
    }
    match &reply.body {
        Body::SrvRply(r) => !r.urls.is_empty(),
        Body::AttrRply(r) => !r.attributes.is_empty(),
        Body::SrvTypeRply(r) => !r.service_types.is_empty(),
        _ => true,
    }
}
