//! Register / query / expire over real loopback sockets.
//!
//! A directory agent and a service agent run as `AgentServer`s on ephemeral
//! ports; clients talk to them the way a local service and a user agent would.

use slp_engine::agent::{AckPerformer, TcpAckPerformer};
use slp_engine::codec::{Body, Message, MessageHeader, SrvDeReg, SrvReg};
use slp_engine::model::{Attributes, Scopes, ServiceType, ServiceUrl};
use slp_engine::runtime::{AgentServer, ServerOptions, ServerState, SlpConfig};
use slp_engine::{DirectoryAgent, ServiceAgent, UserAgent};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const JMX_URL: &str = "service:jmx:rmi:///jndi/rmi:///jmxrmi";

fn config() -> SlpConfig {
    SlpConfig {
        bind_address: "127.0.0.1".into(),
        scopes: vec!["scope1".into(), "scope2".into()],
        unicast_timeout_ms: 2000,
        da_discovery_on_start: false,
        ..SlpConfig::default()
    }
}

fn start_directory_agent() -> AgentServer<DirectoryAgent> {
    let da = Arc::new(DirectoryAgent::new(&config()).unwrap());
    let server = AgentServer::new(da, ServerOptions::loopback());
    server.start().unwrap();
    server
}

fn jmx_registration(xid: u16) -> Message {
    let mut header = MessageHeader::new(xid, "en");
    header.fresh = true;
    Message::new(
        header,
        Body::SrvReg(SrvReg {
            url: ServiceUrl::new(JMX_URL, 13),
            service_type: ServiceType::new("service:jmx:rmi"),
            scopes: Scopes::new(["scope1", "scope2"]),
            attributes: Attributes::new(),
        }),
    )
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

#[test]
fn test_register_query_expire_via_directory_agent() {
    let server = start_directory_agent();
    let da_addr = server.tcp_addr().unwrap();

    let ack = TcpAckPerformer::new(Duration::from_secs(2))
        .perform(da_addr, &jmx_registration(100))
        .unwrap();
    assert_eq!(ack.error_code, 0);

    let ua = UserAgent::new(&config()).unwrap().with_directory_agent(server.udp_addr().unwrap());
    let scopes = Scopes::new(["scope1", "scope2"]);
    let found = ua.find_services("service:jmx:rmi", &scopes, "").unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].as_str(), JMX_URL);
    assert_eq!(found[0].lifetime(), 13);

    // abstract type finds the concrete registration too
    assert_eq!(ua.find_services("service:jmx", &scopes, "").unwrap().len(), 1);

    server.handler().cache().sweep(Instant::now() + Duration::from_secs(14));
    assert!(ua.find_services("service:jmx:rmi", &scopes, "").unwrap().is_empty());

    server.stop();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn test_service_agent_forwards_to_directory_agent() {
    let da_server = start_directory_agent();
    let da_addr = da_server.udp_addr().unwrap();

    let sa_config = SlpConfig { directory_agents: vec![da_addr.to_string()], ..config() };
    let sa = Arc::new(ServiceAgent::new(&sa_config).unwrap());
    let sa_server = AgentServer::new(sa, ServerOptions::loopback().with_tcp_loopback_only(true));
    sa_server.start().unwrap();

    let performer = TcpAckPerformer::new(Duration::from_secs(2));
    let ack = performer.perform(sa_server.tcp_addr().unwrap(), &jmx_registration(200)).unwrap();
    assert_eq!(ack.error_code, 0);
    assert_eq!(sa_server.handler().cache().len(), 1);
    assert!(wait_until(Duration::from_secs(5), || da_server.handler().cache().len() == 1));

    let dereg = Message::new(
        MessageHeader::new(201, "en"),
        Body::SrvDeReg(SrvDeReg {
            scopes: Scopes::new(["scope1", "scope2"]),
            url: ServiceUrl::new(JMX_URL, 0),
            tags: vec![],
        }),
    );
    let ack = performer.perform(sa_server.tcp_addr().unwrap(), &dereg).unwrap();
    assert_eq!(ack.error_code, 0);
    assert!(sa_server.handler().cache().is_empty());
    assert!(wait_until(Duration::from_secs(5), || da_server.handler().cache().is_empty()));

    sa_server.stop();
    da_server.stop();
}

#[test]
fn test_attribute_and_type_queries() {
    let server = start_directory_agent();
    let performer = TcpAckPerformer::new(Duration::from_secs(2));
    let mut header = MessageHeader::new(300, "en");
    header.fresh = true;
    let printer = Message::new(
        header,
        Body::SrvReg(SrvReg {
            url: ServiceUrl::new("service:printer:lpr://p1", 600),
            service_type: ServiceType::new("service:printer:lpr"),
            scopes: Scopes::new(["scope1"]),
            attributes: Attributes::from_wire("(color=true),(pages=20),duplex").unwrap(),
        }),
    );
    assert_eq!(performer.perform(server.tcp_addr().unwrap(), &printer).unwrap().error_code, 0);
    let jmx = jmx_registration(301);
    assert_eq!(performer.perform(server.tcp_addr().unwrap(), &jmx).unwrap().error_code, 0);

    let ua = UserAgent::new(&config()).unwrap().with_directory_agent(server.udp_addr().unwrap());
    let scope1 = Scopes::new(["scope1"]);

    let found = ua
        .find_services("service:printer", &scope1, "(&(color=true)(pages>=10))")
        .unwrap();
    assert_eq!(found.len(), 1);
    assert!(ua.find_services("service:printer", &scope1, "(color=false)").unwrap().is_empty());

    let attrs = ua
        .find_attributes("service:printer:lpr://p1", &scope1, &["pages".to_string()])
        .unwrap();
    assert_eq!(attrs.to_wire(), "(pages=20)");

    let mut types: Vec<String> = ua
        .find_service_types(None, &scope1)
        .unwrap()
        .into_iter()
        .map(|t| t.as_str().to_string())
        .collect();
    types.sort();
    assert_eq!(types, vec!["service:jmx:rmi", "service:printer:lpr"]);
}

#[test]
fn test_non_ascii_service_type_does_not_stall_directory_agent() {
    let server = start_directory_agent();
    let performer = TcpAckPerformer::new(Duration::from_secs(2));
    let mut header = MessageHeader::new(400, "en");
    header.fresh = true;
    let odd = Message::new(
        header,
        Body::SrvReg(SrvReg {
            url: ServiceUrl::new("a\u{e9}\u{e9}\u{e9}\u{e9}://h", 600),
            service_type: ServiceType::new("a\u{e9}\u{e9}\u{e9}\u{e9}"),
            scopes: Scopes::new(["scope1"]),
            attributes: Attributes::new(),
        }),
    );
    assert_eq!(performer.perform(server.tcp_addr().unwrap(), &odd).unwrap().error_code, 0);
    let jmx = jmx_registration(401);
    assert_eq!(performer.perform(server.tcp_addr().unwrap(), &jmx).unwrap().error_code, 0);

    let ua = UserAgent::new(&config()).unwrap().with_directory_agent(server.udp_addr().unwrap());
    let scopes = Scopes::new(["scope1"]);
    let found = ua.find_services("a\u{e9}\u{e9}\u{e9}\u{e9}", &scopes, "").unwrap();
    assert_eq!(found.len(), 1);
    assert!(ua.find_services("\u{e9}\u{e9}\u{e9}\u{e9}\u{e9}", &scopes, "").unwrap().is_empty());
    assert!(ua.find_service_types(Some("acme"), &scopes).unwrap().is_empty());

    let found = ua.find_services("service:jmx:rmi", &scopes, "").unwrap();
    assert_eq!(found, vec![ServiceUrl::new(JMX_URL, 13)]);
    server.stop();
}
