//! Challenge-name DNS authority
//!
//! Answers exactly three query shapes on behalf of the cluster: SOA for the
//! zone itself (so the public CA treats the node as the zone authority),
//! TXT for `_acme-challenge.*` (answered cluster-wide), and TXT for
//! `_local_acme-challenge.*` (answered from this node only). Everything
//! else is left to the embedding application's own DNS handling.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{SOA, TXT};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{normalize_fqdn, ChallengeError, Challenger, ACME_CHALLENGE_PREFIX, LOCAL_CHALLENGE_PREFIX};

/// Deadline for assembling a challenge answer, independent of however long
/// the querying client is willing to wait.
const ANSWER_TIMEOUT: Duration = Duration::from_secs(3);

/// TTL of challenge TXT answers.
const CHALLENGE_TTL: u32 = 60;

/// Cap on concurrently assembling answers; a distributed lookup fans out to
/// the whole cluster, so unbounded spawning would amplify a query flood.
const MAX_INFLIGHT_ANSWERS: usize = 128;

/// DNS-01 query router and responder.
pub struct DnsServer {
    zone: Name,
    distributed: Arc<dyn Challenger>,
    local: Arc<dyn Challenger>,
}

impl DnsServer {
    /// `zone` is the cluster domain; `distributed` answers on behalf of the
    /// whole cluster, `local` from this node's memory provider.
    pub fn new(
        zone: &str,
        distributed: Arc<dyn Challenger>,
        local: Arc<dyn Challenger>,
    ) -> Result<Self, ChallengeError> {
        let zone = Name::from_ascii(normalize_fqdn(zone)).map_err(|e| {
            ChallengeError::InvalidName {
                fqdn: zone.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            zone,
            distributed,
            local,
        })
    }

    /// Classify a raw DNS message.
    ///
    /// Returns `None` when the message is not for us (a response, not
    /// parseable, or a name outside the challenge namespace) so the caller
    /// can forward it upstream unchanged. Returns the pending answer
    /// otherwise; resolving it may involve a cluster-wide fan-out and is
    /// deferred to [`PendingAnswer::answer`].
    pub fn route(&self, msg: &[u8]) -> Option<PendingAnswer> {
        let message = Message::from_vec(msg).ok()?;
        if message.message_type() != MessageType::Query {
            return None;
        }
        let query = message.queries().first()?.clone();
        let fqdn = normalize_fqdn(&query.name().to_string());

        let mirror = HeaderMirror {
            id: message.id(),
            recursion_desired: message.recursion_desired(),
            checking_disabled: message.checking_disabled(),
        };

        if query.query_type() == RecordType::SOA && query.name() == &self.zone {
            let bytes = soa_response(&mirror, &query)?;
            return Some(PendingAnswer {
                kind: AnswerKind::Ready(bytes),
            });
        }

        let (challenger, lookup) = if fqdn.starts_with(ACME_CHALLENGE_PREFIX) {
            // Translate so peers consult their own local providers rather
            // than fanning out again.
            (self.distributed.clone(), format!("_local{fqdn}"))
        } else if fqdn.starts_with(LOCAL_CHALLENGE_PREFIX) {
            let stripped = fqdn
                .strip_prefix("_local")
                .expect("prefix checked above")
                .to_string();
            (self.local.clone(), stripped)
        } else {
            return None;
        };

        Some(PendingAnswer {
            kind: AnswerKind::Challenge {
                challenger,
                lookup,
                query,
                mirror,
            },
        })
    }
}

impl std::fmt::Debug for DnsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsServer").field("zone", &self.zone).finish()
    }
}

#[derive(Clone, Copy)]
struct HeaderMirror {
    id: u16,
    recursion_desired: bool,
    checking_disabled: bool,
}

enum AnswerKind {
    Ready(Vec<u8>),
    Challenge {
        challenger: Arc<dyn Challenger>,
        lookup: String,
        query: Query,
        mirror: HeaderMirror,
    },
}

/// A routed query whose answer may still need assembling.
pub struct PendingAnswer {
    kind: AnswerKind,
}

impl PendingAnswer {
    /// Assemble the response bytes. Challenge lookups run under their own
    /// deadline; failures and empty results both render as NXDOMAIN.
    pub async fn answer(self) -> Option<Vec<u8>> {
        match self.kind {
            AnswerKind::Ready(bytes) => Some(bytes),
            AnswerKind::Challenge {
                challenger,
                lookup,
                query,
                mirror,
            } => {
                let mut values = Vec::new();
                if query.query_type() == RecordType::TXT {
                    match tokio::time::timeout(ANSWER_TIMEOUT, challenger.challenge(&lookup)).await
                    {
                        Ok(Ok(v)) => values = v,
                        Ok(Err(e)) => {
                            warn!(fqdn = %lookup, error = %e, "challenge lookup failed")
                        }
                        Err(_) => warn!(fqdn = %lookup, "challenge lookup timed out"),
                    }
                }
                debug!(
                    qtype = %query.query_type(),
                    fqdn = %query.name(),
                    values = values.len(),
                    "answering DNS-01 query"
                );
                challenge_response(&mirror, &query, &values)
            }
        }
    }
}

fn response_message(mirror: &HeaderMirror, query: &Query, rcode: ResponseCode) -> Message {
    let mut resp = Message::new();
    resp.set_id(mirror.id)
        .set_message_type(MessageType::Response)
        .set_op_code(OpCode::Query)
        .set_authoritative(true)
        .set_recursion_desired(mirror.recursion_desired)
        .set_checking_disabled(mirror.checking_disabled)
        .set_response_code(rcode);
    resp.add_query(query.clone());
    resp
}

fn challenge_response(mirror: &HeaderMirror, query: &Query, values: &[String]) -> Option<Vec<u8>> {
    let rcode = if values.is_empty() {
        ResponseCode::NXDomain
    } else {
        ResponseCode::NoError
    };
    let mut resp = response_message(mirror, query, rcode);
    for value in values {
        resp.add_answer(Record::from_rdata(
            query.name().clone(),
            CHALLENGE_TTL,
            RData::TXT(TXT::new(vec![value.clone()])),
        ));
    }
    resp.to_vec().ok()
}

fn soa_response(mirror: &HeaderMirror, query: &Query) -> Option<Vec<u8>> {
    let ns = Name::from_ascii(format!("ns.{}", query.name())).ok()?;
    let soa = SOA::new(ns.clone(), ns, 0, 1200, 300, 1_209_600, 300);
    let mut resp = response_message(mirror, query, ResponseCode::NoError);
    resp.add_answer(Record::from_rdata(
        query.name().clone(),
        300,
        RData::SOA(soa),
    ));
    resp.to_vec().ok()
}

/// UDP interceptor for the DNS-01 authority.
///
/// Mirrors the socket's `recv_from`: challenge queries are answered in the
/// background and never surface; the first packet that is not ours is
/// handed to the caller for its own DNS handling.
pub struct DnsListener {
    socket: Arc<UdpSocket>,
    server: Arc<DnsServer>,
    permits: Arc<Semaphore>,
}

impl DnsListener {
    pub fn new(socket: UdpSocket, server: Arc<DnsServer>) -> Self {
        Self {
            socket: Arc::new(socket),
            server,
            permits: Arc::new(Semaphore::new(MAX_INFLIGHT_ANSWERS)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive the next packet that is not a challenge query.
    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        loop {
            let (n, addr) = self.socket.recv_from(buf).await?;
            let Some(pending) = self.server.route(&buf[..n]) else {
                return Ok((n, addr));
            };

            match self.permits.clone().try_acquire_owned() {
                Ok(permit) => {
                    let socket = self.socket.clone();
                    tokio::spawn(async move {
                        if let Some(resp) = pending.answer().await {
                            if let Err(e) = socket.send_to(&resp, addr).await {
                                warn!(peer = %addr, error = %e, "failed to send DNS answer");
                            }
                        }
                        drop(permit);
                    });
                }
                Err(_) => {
                    warn!(peer = %addr, "answer concurrency limit reached, dropping query");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct StubChallenger {
        values: Vec<String>,
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Challenger for StubChallenger {
        async fn challenge(&self, fqdn: &str) -> Result<Vec<String>, ChallengeError> {
            self.seen.lock().push(fqdn.to_string());
            if self.fail {
                return Err(ChallengeError::Upstream("stub failure".into()));
            }
            Ok(self.values.clone())
        }
    }

    fn server(
        distributed: Arc<StubChallenger>,
        local: Arc<StubChallenger>,
    ) -> DnsServer {
        DnsServer::new("cluster.test", distributed, local).unwrap()
    }

    fn wire_query(name: &str, rtype: RecordType) -> Vec<u8> {
        let mut msg = Message::new();
        msg.set_id(0x1234)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_ascii(name).unwrap(), rtype));
        msg.to_vec().unwrap()
    }

    async fn answer(server: &DnsServer, wire: &[u8]) -> Message {
        let bytes = server.route(wire).unwrap().answer().await.unwrap();
        Message::from_vec(&bytes).unwrap()
    }

    #[tokio::test]
    async fn soa_for_zone_is_synthesized() {
        let srv = server(Arc::default(), Arc::default());
        let resp = answer(&srv, &wire_query("cluster.test.", RecordType::SOA)).await;

        assert_eq!(resp.id(), 0x1234);
        assert!(resp.authoritative());
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        let RData::SOA(soa) = resp.answers()[0].data() else {
            panic!("expected SOA answer");
        };
        assert_eq!(soa.mname().to_string(), "ns.cluster.test.");
        assert_eq!(soa.refresh(), 1200);
        assert_eq!(soa.expire(), 1_209_600);
    }

    #[tokio::test]
    async fn acme_name_fans_out_via_local_translation() {
        let distributed = Arc::new(StubChallenger {
            values: vec!["value-1".to_string(), "value-2".to_string()],
            ..Default::default()
        });
        let srv = server(distributed.clone(), Arc::default());

        let resp = answer(
            &srv,
            &wire_query("_acme-challenge.cluster.test.", RecordType::TXT),
        )
        .await;

        assert_eq!(
            distributed.seen.lock().as_slice(),
            ["_local_acme-challenge.cluster.test."]
        );
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert!(resp.authoritative());
        assert!(resp.recursion_desired());
        assert_eq!(resp.answers().len(), 2);
        assert_eq!(resp.answers()[0].ttl(), CHALLENGE_TTL);
    }

    #[tokio::test]
    async fn local_name_is_answered_from_local_provider() {
        let local = Arc::new(StubChallenger {
            values: vec!["local-value".to_string()],
            ..Default::default()
        });
        let srv = server(Arc::default(), local.clone());

        let resp = answer(
            &srv,
            &wire_query("_local_acme-challenge.cluster.test.", RecordType::TXT),
        )
        .await;

        assert_eq!(
            local.seen.lock().as_slice(),
            ["_acme-challenge.cluster.test."]
        );
        assert_eq!(resp.answers().len(), 1);
    }

    #[tokio::test]
    async fn empty_values_render_nxdomain() {
        let srv = server(Arc::default(), Arc::default());
        let resp = answer(
            &srv,
            &wire_query("_acme-challenge.cluster.test.", RecordType::TXT),
        )
        .await;
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
        assert!(resp.answers().is_empty());
    }

    #[tokio::test]
    async fn failed_lookup_renders_nxdomain() {
        let distributed = Arc::new(StubChallenger {
            fail: true,
            ..Default::default()
        });
        let srv = server(distributed, Arc::default());
        let resp = answer(
            &srv,
            &wire_query("_acme-challenge.cluster.test.", RecordType::TXT),
        )
        .await;
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn non_txt_challenge_query_skips_the_challenger() {
        let distributed = Arc::new(StubChallenger {
            values: vec!["value".to_string()],
            ..Default::default()
        });
        let srv = server(distributed.clone(), Arc::default());
        let resp = answer(
            &srv,
            &wire_query("_acme-challenge.cluster.test.", RecordType::A),
        )
        .await;
        assert!(distributed.seen.lock().is_empty());
        assert_eq!(resp.response_code(), ResponseCode::NXDomain);
    }

    #[tokio::test]
    async fn unrelated_queries_pass_through() {
        let srv = server(Arc::default(), Arc::default());
        assert!(srv
            .route(&wire_query("www.cluster.test.", RecordType::TXT))
            .is_none());
        assert!(srv
            .route(&wire_query("cluster.test.", RecordType::A))
            .is_none());
        // SOA for some other zone is not ours either.
        assert!(srv
            .route(&wire_query("other.test.", RecordType::SOA))
            .is_none());
    }

    #[tokio::test]
    async fn responses_and_garbage_pass_through() {
        let srv = server(Arc::default(), Arc::default());

        let mut resp = Message::new();
        resp.set_id(9).set_message_type(MessageType::Response);
        resp.add_query(Query::query(
            Name::from_ascii("_acme-challenge.cluster.test.").unwrap(),
            RecordType::TXT,
        ));
        assert!(srv.route(&resp.to_vec().unwrap()).is_none());
        assert!(srv.route(b"\x01\x02not dns").is_none());
    }

    #[tokio::test]
    async fn listener_answers_ours_and_passes_the_rest() {
        let local = Arc::new(StubChallenger {
            values: vec!["txt-value".to_string()],
            ..Default::default()
        });
        let srv = Arc::new(server(Arc::default(), local));
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = socket.local_addr().unwrap();
        let listener = DnsListener::new(socket, srv);

        let passthrough = tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, _) = listener.recv_from(&mut buf).await.unwrap();
            buf[..n].to_vec()
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let challenge = wire_query("_local_acme-challenge.cluster.test.", RecordType::TXT);
        client.send_to(&challenge, listener_addr).await.unwrap();

        let mut buf = [0u8; 4096];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let resp = Message::from_vec(&buf[..n]).unwrap();
        assert_eq!(resp.response_code(), ResponseCode::NoError);
        assert_eq!(resp.answers().len(), 1);

        let other = wire_query("www.cluster.test.", RecordType::A);
        client.send_to(&other, listener_addr).await.unwrap();
        let surfaced = tokio::time::timeout(Duration::from_secs(5), passthrough)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(surfaced, other);
    }
}
