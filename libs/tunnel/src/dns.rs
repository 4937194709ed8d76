use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use netstack::{TcpFlow, UdpFlow};

use crate::codec;
use crate::protocol::Protocol;
use crate::routes::RouteTable;

pub(crate) const DNS_PORT: u16 = 53;

/// How long a single protocol resolver may take before we move on.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Per-suffix dispatch of DNS queries to protocol resolvers.
///
/// The first protocol (in configuration order) whose claimed domain matches
/// the first question name is asked; the first non-empty answer wins and its
/// A records are installed as routes before the response leaves the engine,
/// so the client's follow-up SYN always finds the binding in place.
pub struct DnsEngine {
    protocols: Vec<Arc<dyn Protocol>>,
    routes: Arc<RouteTable>,
    ipv6: bool,
}

impl DnsEngine {
    pub fn new(protocols: Vec<Arc<dyn Protocol>>, routes: Arc<RouteTable>, ipv6: bool) -> Self {
        Self {
            protocols,
            routes,
            ipv6,
        }
    }

    /// Produce the response for one query.
    ///
    /// Resolver trouble never surfaces to the client: errors and timeouts
    /// count as "no answer from this protocol" and iteration continues. If
    /// nothing answers, the query itself is echoed back.
    pub async fn serve(&self, query: Message) -> Message {
        if !self.ipv6 && contains_aaaa_question(&query) {
            return empty_authoritative(&query);
        }

        let Some(question) = query.queries().first() else {
            return query;
        };

        let name = normalise(&question.name().to_string());

        for protocol in &self.protocols {
            if !claims(protocol.as_ref(), &name) {
                continue;
            }

            let response =
                match tokio::time::timeout(RESOLVE_TIMEOUT, protocol.resolve(query.clone())).await
                {
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) => {
                        tracing::warn!(protocol = protocol.name(), %name, "Resolver failed: {e:#}");
                        continue;
                    }
                    Err(_) => {
                        tracing::warn!(protocol = protocol.name(), %name, "Resolver timed out");
                        continue;
                    }
                };

            if response.answers().is_empty() {
                continue;
            }

            if protocol.capabilities().carries_traffic() {
                tracing::info!(protocol = protocol.name(), %name, "DNS resolved");

                for answer in response.answers() {
                    if let RData::A(a) = answer.data() {
                        if let Err(e) = self.routes.add_host(a.0, protocol.clone()).await {
                            tracing::warn!(ip = %a.0, "Failed to add route: {e:#}");
                        }
                    }
                }
            }

            return response;
        }

        query
    }

    /// Serve a captured TCP connection to `TUN_IP:53`: one message per
    /// connection.
    pub(crate) async fn serve_tcp(&self, mut flow: TcpFlow) {
        let query = match codec::read_message(&mut flow).await {
            Ok(Some(query)) => query,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!("Failed to read DNS query: {e:#}");
                return;
            }
        };

        let response = self.serve(query).await;

        if let Err(e) = codec::write_message(&mut flow, &response).await {
            tracing::warn!("Failed to write DNS response: {e:#}");
        }
    }

    /// Serve a captured UDP session to `TUN_IP:53`: a single datagram.
    pub(crate) async fn serve_udp(&self, mut flow: UdpFlow) {
        let Some(datagram) = flow.recv().await else {
            return;
        };

        let query = match Message::from_vec(&datagram) {
            Ok(query) => query,
            Err(e) => {
                tracing::warn!("Failed to parse DNS query: {e}");
                return;
            }
        };

        let response = self.serve(query).await;

        let bytes = match response.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!("Failed to encode DNS response: {e}");
                return;
            }
        };

        if let Err(e) = flow.send(Bytes::from(bytes)).await {
            tracing::warn!("Failed to send DNS response: {e}");
        }
    }
}

fn contains_aaaa_question(query: &Message) -> bool {
    query
        .queries()
        .iter()
        .any(|q| q.query_type() == RecordType::AAAA)
}

/// Authoritative success with no answers, echoing id and questions.
fn empty_authoritative(query: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(query.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(query.op_code());
    response.set_response_code(ResponseCode::NoError);
    response.set_authoritative(true);
    response.set_recursion_desired(query.recursion_desired());
    response.add_queries(query.queries().to_vec());

    response
}

/// Does the protocol claim this (normalised) query name?
fn claims(protocol: &dyn Protocol, name: &str) -> bool {
    let domains = protocol.domains();

    if domains.is_empty() {
        return true;
    }

    domains.iter().any(|domain| {
        let domain = normalise(domain);
        let domain = domain.trim_start_matches('.');

        !domain.is_empty() && (name == domain || name.ends_with(&format!(".{domain}")))
    })
}

fn normalise(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
