//! Upstream exchange: classical DNS over UDP, or DNS-over-HTTPS when the
//! configured upstream is an `https://` URL.
use std::{net::SocketAddr, time::Duration};

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::{metrics, DnsError};

/// how long we wait on the upstream before giving up
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(3);
/// media type for DoH POST bodies
const DOH_CONTENT_TYPE: &str = "application/dns-udpwireformat";

/// A resolved upstream target.
#[derive(Debug, Clone)]
pub enum Upstream {
    /// classic DNS over UDP
    Udp(SocketAddr),
    /// DNS-over-HTTPS endpoint
    Doh(String),
}

impl Upstream {
    /// Parse the configured `dnsserver` string. `https://` selects DoH; a
    /// bare address (optionally `:port`) selects UDP on port 53.
    pub fn parse(server: &str) -> Result<Self, DnsError> {
        if server.starts_with("https://") {
            return Ok(Upstream::Doh(server.to_owned()));
        }
        let addr: SocketAddr = if server.contains(':') {
            server
                .parse()
                .map_err(|err| DnsError::Upstream(format!("bad upstream {server}: {err}")))?
        } else {
            format!("{server}:53")
                .parse()
                .map_err(|err| DnsError::Upstream(format!("bad upstream {server}: {err}")))?
        };
        Ok(Upstream::Udp(addr))
    }
}

/// The proxy half: owns the HTTP client for DoH.
#[derive(Debug)]
pub struct Proxy {
    upstream: Upstream,
    http: reqwest::Client,
}

impl Proxy {
    /// proxy speaking to `upstream`
    pub fn new(upstream: Upstream) -> Self {
        Self {
            upstream,
            http: reqwest::Client::new(),
        }
    }

    /// Forward one request, returning the decoded response.
    pub async fn exchange(&self, request: &Message) -> Result<(Message, usize), DnsError> {
        let query = request.to_vec()?;
        let raw = match &self.upstream {
            Upstream::Udp(addr) => self.exchange_udp(&query, *addr).await,
            Upstream::Doh(url) => self.exchange_doh(&query, url).await,
        };
        let raw = match raw {
            Ok(raw) => {
                metrics::UPSTREAM.with_label_values(&["ok"]).inc();
                raw
            }
            Err(err) => {
                metrics::UPSTREAM.with_label_values(&["error"]).inc();
                return Err(err);
            }
        };
        let size = raw.len();
        let resp = Message::from_vec(&raw)?;
        debug!(id = resp.id(), size, "upstream answered");
        Ok((resp, size))
    }

    async fn exchange_udp(&self, query: &[u8], addr: SocketAddr) -> Result<Vec<u8>, DnsError> {
        let soc = UdpSocket::bind("0.0.0.0:0").await?;
        soc.connect(addr).await?;
        soc.send(query).await?;
        let mut buf = vec![0u8; 4096];
        let len = tokio::time::timeout(EXCHANGE_TIMEOUT, soc.recv(&mut buf))
            .await
            .map_err(|_| DnsError::Upstream(format!("timeout waiting on {addr}")))??;
        buf.truncate(len);
        Ok(buf)
    }

    async fn exchange_doh(&self, query: &[u8], url: &str) -> Result<Vec<u8>, DnsError> {
        let resp = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, DOH_CONTENT_TYPE)
            .body(query.to_vec())
            .timeout(EXCHANGE_TIMEOUT)
            .send()
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;
        if !resp.status().is_success() {
            return Err(DnsError::Upstream(format!("doh status {}", resp.status())));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|err| DnsError::Upstream(err.to_string()))?;
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query, ResponseCode};
    use hickory_proto::rr::{rdata, DNSClass, Name, RData, Record, RecordType};

    #[test]
    fn upstream_parse_selects_transport() {
        assert!(matches!(
            Upstream::parse("8.8.8.8").unwrap(),
            Upstream::Udp(addr) if addr.port() == 53
        ));
        assert!(matches!(
            Upstream::parse("9.9.9.9:5353").unwrap(),
            Upstream::Udp(addr) if addr.port() == 5353
        ));
        assert!(matches!(
            Upstream::parse("https://dns.example/dns-query").unwrap(),
            Upstream::Doh(_)
        ));
        assert!(Upstream::parse("not an upstream").is_err());
    }

    #[tokio::test]
    async fn udp_exchange_round_trips_against_local_responder() {
        // a tiny upstream on loopback
        let upstream_soc = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream_soc.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let (len, peer) = upstream_soc.recv_from(&mut buf).await.unwrap();
            let req = Message::from_vec(&buf[..len]).unwrap();
            let mut resp = Message::new();
            resp.set_id(req.id());
            resp.set_message_type(MessageType::Response);
            resp.set_op_code(OpCode::Query);
            resp.set_response_code(ResponseCode::NoError);
            resp.add_query(req.queries()[0].clone());
            resp.add_answer(Record::from_rdata(
                req.queries()[0].name().clone(),
                60,
                RData::A(rdata::A([93, 184, 216, 34].into())),
            ));
            upstream_soc
                .send_to(&resp.to_vec().unwrap(), peer)
                .await
                .unwrap();
        });

        let proxy = Proxy::new(Upstream::Udp(upstream_addr));
        let mut req = Message::new();
        req.set_id(77);
        req.set_op_code(OpCode::Query);
        req.set_message_type(MessageType::Query);
        let mut q = Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A);
        q.set_query_class(DNSClass::IN);
        req.add_query(q);

        let (resp, size) = proxy.exchange(&req).await.unwrap();
        assert_eq!(resp.id(), 77);
        assert_eq!(resp.answers().len(), 1);
        assert!(size > 0);
    }
}
