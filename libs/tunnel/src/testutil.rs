use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Result, bail};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{RData, Record};
use ip_network::Ipv4Network;
use parking_lot::Mutex;

use crate::host::HostAdapter;
use crate::protocol::{Capabilities, Protocol};

/// Host adapter fake that records every side effect.
#[derive(Default)]
pub(crate) struct RecordingHost {
    fail_routes: bool,
    added: Mutex<Vec<Ipv4Network>>,
    deleted: Mutex<Vec<Ipv4Network>>,
    resolvers: Mutex<Vec<String>>,
}

impl RecordingHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail_routes: true,
            ..Self::default()
        }
    }

    pub(crate) fn added_routes(&self) -> Vec<Ipv4Network> {
        self.added.lock().clone()
    }

    pub(crate) fn deleted_routes(&self) -> Vec<Ipv4Network> {
        self.deleted.lock().clone()
    }

    pub(crate) fn resolver_domains(&self) -> Vec<String> {
        self.resolvers.lock().clone()
    }
}

#[async_trait::async_trait]
impl HostAdapter for RecordingHost {
    async fn create_tun(&self, _name: &str, _ip: Ipv4Addr, _mtu: u32) -> Result<()> {
        Ok(())
    }

    async fn delete_tun(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn add_route(&self, network: Ipv4Network, _gateway: Ipv4Addr) -> Result<()> {
        if self.fail_routes {
            bail!("route installation rejected")
        }

        self.added.lock().push(network);

        Ok(())
    }

    async fn delete_route(&self, network: Ipv4Network, _gateway: Ipv4Addr) -> Result<()> {
        self.deleted.lock().push(network);

        Ok(())
    }

    async fn set_resolver(&self, domain: &str, _ip: Ipv4Addr) -> Result<()> {
        self.resolvers.lock().push(domain.to_owned());

        Ok(())
    }

    async fn remove_resolver(&self, domain: &str) -> Result<()> {
        self.resolvers.lock().retain(|d| d != domain);

        Ok(())
    }

    async fn flush_dns(&self) -> Result<()> {
        Ok(())
    }
}

/// What a [`StubProtocol`] does when its resolver is invoked.
pub(crate) enum StubAnswer {
    Records(Vec<Ipv4Addr>),
    Empty,
    Error,
    Hang,
}

/// Protocol fake with scriptable resolver behaviour.
pub(crate) struct StubProtocol {
    name: &'static str,
    domains: Vec<String>,
    capabilities: Capabilities,
    answer: StubAnswer,
    resolve_calls: AtomicUsize,
}

impl StubProtocol {
    pub(crate) fn named(name: &'static str) -> Self {
        Self {
            name,
            domains: Vec::new(),
            capabilities: Capabilities::resolve_only().with_tcp().with_udp(),
            answer: StubAnswer::Empty,
            resolve_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_domain(mut self, domain: &str) -> Self {
        self.domains = vec![domain.to_owned()];
        self
    }

    pub(crate) fn with_answer(mut self, answer: StubAnswer) -> Self {
        self.answer = answer;
        self
    }

    pub(crate) fn resolve_only(mut self) -> Self {
        self.capabilities = Capabilities::resolve_only();
        self
    }

    pub(crate) fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Protocol for StubProtocol {
    fn name(&self) -> &'static str {
        self.name
    }

    fn domains(&self) -> &[String] {
        &self.domains
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn resolve(&self, query: Message) -> Result<Message> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);

        match &self.answer {
            StubAnswer::Records(ips) => Ok(answer_a(&query, ips)),
            StubAnswer::Empty => {
                let mut response = query.clone();
                response.set_message_type(MessageType::Response);

                Ok(response)
            }
            StubAnswer::Error => bail!("resolver unavailable"),
            StubAnswer::Hang => {
                futures::future::pending::<()>().await;
                unreachable!()
            }
        }
    }
}

/// Builds a response to `query` answering with the given A records.
pub(crate) fn answer_a(query: &Message, ips: &[Ipv4Addr]) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_response_code(ResponseCode::NoError);
    response.set_recursion_desired(query.recursion_desired());
    response.set_recursion_available(true);
    response.add_queries(query.queries().to_vec());

    if let Some(question) = query.queries().first() {
        for ip in ips {
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                60,
                RData::A(A(*ip)),
            ));
        }
    }

    response
}

/// A bare A/AAAA query for the given name.
pub(crate) fn query(name: &str, record_type: hickory_proto::rr::RecordType) -> Message {
    use hickory_proto::op::{OpCode, Query};
    use hickory_proto::rr::Name;

    let mut message = Message::new();
    message.set_id(rand_id(name));
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(
        Name::from_ascii(name).expect("test name must parse"),
        record_type,
    ));

    message
}

fn rand_id(seed: &str) -> u16 {
    seed.bytes().fold(0x5a17u16, |acc, b| {
        acc.rotate_left(3) ^ u16::from(b)
    })
}
