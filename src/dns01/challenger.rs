//! Cluster-wide challenge lookup

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tracing::trace;

use async_trait::async_trait;

use super::{ChallengeError, Challenger};
use crate::error::join_errors;
use crate::fanout::race_all;
use crate::glue::IpSource;

/// Per-peer query timeout.
const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Pulls challenge TXT values from every node in the cluster.
///
/// The peer set is whatever the glue resolver reports as authoritative for
/// the queried name, which for a cluster domain is the nodes themselves.
/// Queries are sent non-recursively so a peer can only answer from its own
/// memory provider.
pub struct PeerChallenger {
    ips: Arc<dyn IpSource>,
    port: u16,
}

impl PeerChallenger {
    pub fn new(ips: Arc<dyn IpSource>) -> Self {
        Self::with_port(ips, 53)
    }

    /// Port override for clusters whose DNS listeners are not on 53.
    pub fn with_port(ips: Arc<dyn IpSource>, port: u16) -> Self {
        Self { ips, port }
    }

    async fn query_txt(fqdn: Name, ip: IpAddr, port: u16) -> Result<Vec<String>, ChallengeError> {
        let upstream = |message: String| ChallengeError::Upstream(format!("{ip}: {message}"));

        tokio::time::timeout(QUERY_TIMEOUT, async move {
            let mut query = Message::new();
            query
                .set_id(rand::random())
                .set_message_type(MessageType::Query)
                .set_op_code(OpCode::Query)
                .set_recursion_desired(false);
            query.add_query(Query::query(fqdn, RecordType::TXT));
            let wire = query.to_vec().map_err(|e| upstream(e.to_string()))?;

            let bind = if ip.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let socket = UdpSocket::bind(bind)
                .await
                .map_err(|e| upstream(e.to_string()))?;
            socket
                .send_to(&wire, (ip, port))
                .await
                .map_err(|e| upstream(e.to_string()))?;

            let mut buf = [0u8; 4096];
            loop {
                let (n, _) = socket
                    .recv_from(&mut buf)
                    .await
                    .map_err(|e| upstream(e.to_string()))?;
                let response = Message::from_vec(&buf[..n]).map_err(|e| upstream(e.to_string()))?;
                if response.id() != query.id() {
                    continue;
                }
                let mut values = Vec::new();
                for record in response.answers() {
                    if let RData::TXT(txt) = record.data() {
                        for data in txt.txt_data() {
                            values.push(String::from_utf8_lossy(data).into_owned());
                        }
                    }
                }
                return Ok(values);
            }
        })
        .await
        .map_err(|_| upstream("timed out".to_string()))?
    }
}

#[async_trait]
impl Challenger for PeerChallenger {
    async fn challenge(&self, fqdn: &str) -> Result<Vec<String>, ChallengeError> {
        let name = Name::from_ascii(fqdn).map_err(|e| ChallengeError::InvalidName {
            fqdn: fqdn.to_string(),
            message: e.to_string(),
        })?;
        let ips = self.ips.ips(fqdn).await?;
        trace!(fqdn = %fqdn, peers = ips.len(), "polling peers for challenge values");

        let tasks: Vec<_> = ips
            .iter()
            .map(|&ip| Self::query_txt(name.clone(), ip, self.port))
            .collect();
        let (answers, errors) = race_all(tasks).await;

        let values: Vec<String> = answers.into_iter().flatten().collect();
        if values.is_empty() && !errors.is_empty() {
            return Err(ChallengeError::Upstream(join_errors(&errors)));
        }
        Ok(values)
    }
}
