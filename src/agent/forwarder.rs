use super::ack::AckPerformer;
use crate::cache::CacheResult;
use crate::codec::{Body, FunctionId, Message, MessageHeader, SrvDeReg, SrvReg, XidGenerator};
use crate::error::SlpError;
use crate::model::{DirectoryAgentInfo, ServiceInfo};
use crate::runtime::KeyedExecutor;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;

/// Which local cache operation is being mirrored to directory agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Register,
    Deregister,
}

/// Outcome of forwarding one message to one directory agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardEvent {
    Succeeded {
        directory_agent: SocketAddr,
        function: FunctionId,
        url: String,
    },
    Failed {
        directory_agent: SocketAddr,
        function: FunctionId,
        url: String,
        attempts: u32,
        /// Error code of the last ack, or `INTERNAL_ERROR` for transport failures.
        error_code: u16,
        reason: String,
    },
}

impl ForwardEvent {
    pub fn is_success(&self) -> bool {
        matches!(self, ForwardEvent::Succeeded { .. })
    }

    pub fn directory_agent(&self) -> SocketAddr {
        match self {
            ForwardEvent::Succeeded { directory_agent, .. }
            | ForwardEvent::Failed { directory_agent, .. } => *directory_agent,
        }
    }
}

pub trait ForwardObserver: Send + Sync {
    fn on_event(&self, event: &ForwardEvent);
}

/// Default observer: forward outcomes go to the log.
pub struct LoggingObserver;

impl ForwardObserver for LoggingObserver {
    fn on_event(&self, event: &ForwardEvent) {
        match event {
            ForwardEvent::Succeeded { directory_agent, function, url } => {
                info!("Forwarded {:?} of {} to DA {}", function, url, directory_agent)
            }
            ForwardEvent::Failed { directory_agent, function, url, attempts, reason, .. } => warn!(
                "Forwarding {:?} of {} to DA {} failed after {} attempt(s): {}",
                function, url, directory_agent, attempts, reason
            ),
        }
    }
}

/// Handle on one pending forward.
#[derive(Debug)]
pub struct ForwardTicket {
    pub directory_agent: SocketAddr,
    receiver: oneshot::Receiver<ForwardEvent>,
}

impl ForwardTicket {
    /// Blocks until the forward has finished. Must not be called from async code.
    pub fn wait(self) -> Option<ForwardEvent> {
        self.receiver.blocking_recv().ok()
    }

    pub async fn outcome(self) -> Option<ForwardEvent> {
        self.receiver.await.ok()
    }
}

/// Mirrors local registrations to every directory agent whose scopes overlap
/// the service. Each DA has its own serial worker, so a slow or dead DA only
/// delays messages addressed to it.
pub struct RegistrationForwarder {
    performer: Arc<dyn AckPerformer>,
    executor: KeyedExecutor<SocketAddr>,
    xids: Arc<XidGenerator>,
    retries: u32,
    observers: Arc<Vec<Arc<dyn ForwardObserver>>>,
}

impl RegistrationForwarder {
    pub fn new(performer: Arc<dyn AckPerformer>, xids: Arc<XidGenerator>, retries: u32) -> Self {
        RegistrationForwarder {
            performer,
            executor: KeyedExecutor::new("slp-forward"),
            xids,
            retries,
            observers: Arc::new(vec![Arc::new(LoggingObserver)]),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ForwardObserver>) -> Self {
        let mut observers: Vec<_> = self.observers.iter().cloned().collect();
        observers.push(observer);
        self.observers = Arc::new(observers);
        self
    }

    /// Queues the messages that bring `known_das` in line with a cache
    /// mutation. `entry` is the request as received; `result` is what the
    /// cache did with it. Never fails: outcomes arrive as events.
    pub fn forward(
        &self,
        operation: Operation,
        entry: &ServiceInfo,
        result: &CacheResult,
        is_update: bool,
        known_das: &[DirectoryAgentInfo],
    ) -> Vec<ForwardTicket> {
        let now = Instant::now();
        let mut tickets = Vec::new();
        for da in known_das.iter().filter(|da| da.is_alive()) {
            let message = match (operation, &result.current, &result.previous) {
                (Operation::Register, Some(current), previous) => {
                    if da.serves(&current.scopes) {
                        let sent = if is_update { entry } else { current };
                        Some(self.registration(sent, current, is_update, now))
                    } else {
                        // A fresh registration moved the service out of this DA's scopes.
                        previous
                            .as_ref()
                            .filter(|p| !is_update && da.serves(&p.scopes))
                            .map(|p| self.deregistration(p, Vec::new()))
                    }
                }
                (Operation::Deregister, Some(current), _) if is_update => {
                    let tags = entry.attributes.tags().map(str::to_string).collect();
                    da.serves(&current.scopes).then(|| self.deregistration(current, tags))
                }
                (Operation::Deregister, None, Some(previous)) => {
                    da.serves(&previous.scopes).then(|| self.deregistration(previous, Vec::new()))
                }
                _ => None,
            };
            if let Some(message) = message {
                if let Some(ticket) = self.dispatch(da.address, message) {
                    tickets.push(ticket);
                }
            }
        }
        tickets
    }

    /// Stops the worker of a DA that went away.
    pub fn forget(&self, directory_agent: &SocketAddr) {
        self.executor.remove(directory_agent);
    }

    pub fn shutdown(&self) {
        self.executor.shutdown();
    }

    fn header(&self, language: &str, fresh: bool) -> MessageHeader {
        let mut header = MessageHeader::new(self.xids.next_xid(), language);
        header.fresh = fresh;
        header
    }

    fn registration(
        &self,
        sent: &ServiceInfo,
        current: &ServiceInfo,
        is_update: bool,
        now: Instant,
    ) -> Message {
        Message::new(
            self.header(&current.language, !is_update),
            Body::SrvReg(SrvReg {
                url: sent.url.with_lifetime(current.remaining_lifetime(now)),
                service_type: current.service_type.clone(),
                scopes: current.scopes.clone(),
                attributes: sent.attributes.clone(),
            }),
        )
    }

    fn deregistration(&self, service: &ServiceInfo, tags: Vec<String>) -> Message {
        Message::new(
            self.header(&service.language, false),
            Body::SrvDeReg(SrvDeReg {
                scopes: service.scopes.clone(),
                url: service.url.clone(),
                tags,
            }),
        )
    }

    fn dispatch(&self, directory_agent: SocketAddr, message: Message) -> Option<ForwardTicket> {
        let (sender, receiver) = oneshot::channel();
        let performer = Arc::clone(&self.performer);
        let observers = Arc::clone(&self.observers);
        let attempts = self.retries + 1;
        let job = move || {
            let event = send_with_retries(performer.as_ref(), directory_agent, &message, attempts);
            for observer in observers.iter() {
                observer.on_event(&event);
            }
            let _ = sender.send(event);
        };
        match self.executor.execute(directory_agent, job) {
            Ok(()) => Some(ForwardTicket { directory_agent, receiver }),
            Err(e) => {
                warn!("Cannot queue forward to DA {}: {}", directory_agent, e);
                None
            }
        }
    }
}

impl Drop for RegistrationForwarder {
    fn drop(&mut self) {
        self.executor.shutdown();
    }
}

fn send_with_retries(
    performer: &dyn AckPerformer,
    directory_agent: SocketAddr,
    message: &Message,
    attempts: u32,
) -> ForwardEvent {
    let url = match &message.body {
        Body::SrvReg(reg) => reg.url.to_string(),
        Body::SrvDeReg(dereg) => dereg.url.to_string(),
        _ => String::new(),
    };
    let mut last = SlpError::network("not attempted");
    for _ in 0..attempts {
        match performer.perform(directory_agent, message) {
            Ok(ack) if ack.error_code == 0 => {
                let function = message.function();
                return ForwardEvent::Succeeded { directory_agent, function, url };
            }
            Ok(ack) => last = SlpError::Protocol { code: ack.error_code },
            Err(e) => last = e,
        }
    }
    ForwardEvent::Failed {
        directory_agent,
        function: message.function(),
        url,
        attempts,
        error_code: last.error_code(),
        reason: last.to_string(),
    }
}
