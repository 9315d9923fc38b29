use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::atomic::{AtomicU16, Ordering},
    time::Duration,
};
use thiserror::Error;
use tokio::net::UdpSocket;

const QTYPE_A: u16 = 1;
const QTYPE_AAAA: u16 = 28;
const QCLASS_IN: u16 = 1;
const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const RECV_BUF: usize = 1232;

static NEXT_ID: AtomicU16 = AtomicU16::new(0x2a17);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Resolved,
    /// The resolver answered, but not with an address (or did not answer in time).
    NotFound,
    /// The reply was cut short before any answer; nothing can be concluded.
    Inconclusive,
}

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("resolver socket error: {0}")]
    Socket(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
    Records,
    Empty,
    Truncated,
    Failed,
}

/// Looks `domain` up against one fixed resolver, A first, then AAAA.
pub async fn resolve(
    resolver: SocketAddr,
    domain: &str,
    timeout: Duration,
) -> Result<Resolution, DnsError> {
    if domain.parse::<IpAddr>().is_ok() {
        return Ok(Resolution::Resolved);
    }

    let qname = match encode_name(domain) {
        Some(q) => q,
        None => return Ok(Resolution::NotFound),
    };

    for qtype in [QTYPE_A, QTYPE_AAAA] {
        match query(resolver, &qname, qtype, timeout).await? {
            Answer::Records => return Ok(Resolution::Resolved),
            Answer::Empty => continue,
            Answer::Truncated => return Ok(Resolution::Inconclusive),
            Answer::Failed => return Ok(Resolution::NotFound),
        }
    }

    Ok(Resolution::NotFound)
}

async fn query(
    resolver: SocketAddr,
    qname: &[u8],
    qtype: u16,
    timeout: Duration,
) -> Result<Answer, DnsError> {
    let local: SocketAddr = if resolver.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(resolver).await?;

    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    socket.send(&build_query(id, qname, qtype)).await?;

    let result = tokio::time::timeout(timeout, async {
        let mut buf = [0u8; RECV_BUF];
        loop {
            let n = socket.recv(&mut buf).await?;
            if let Some(answer) = parse_response(id, &buf[..n]) {
                return Ok::<_, std::io::Error>(answer);
            }
        }
    })
    .await;

    match result {
        Ok(Ok(answer)) => Ok(answer),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(Answer::Failed),
    }
}

fn encode_name(domain: &str) -> Option<Vec<u8>> {
    let name = domain.trim_end_matches('.');
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.is_ascii() {
        return None;
    }

    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return None;
        }
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    Some(out)
}

fn build_query(id: u16, qname: &[u8], qtype: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(HEADER_LEN + qname.len() + 4);
    packet.extend_from_slice(&id.to_be_bytes());
    // RD set, everything else zero
    packet.extend_from_slice(&0x0100u16.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    packet.extend_from_slice(qname);
    packet.extend_from_slice(&qtype.to_be_bytes());
    packet.extend_from_slice(&QCLASS_IN.to_be_bytes());
    packet
}

/// `None` for datagrams that are not the reply we are waiting for.
fn parse_response(id: u16, packet: &[u8]) -> Option<Answer> {
    if packet.len() < HEADER_LEN {
        return None;
    }
    if u16::from_be_bytes([packet[0], packet[1]]) != id || packet[2] & 0x80 == 0 {
        return None;
    }

    let truncated = packet[2] & 0x02 != 0;
    let rcode = packet[3] & 0x0f;
    let ancount = u16::from_be_bytes([packet[6], packet[7]]);

    Some(match (rcode, ancount) {
        (0, 0) if truncated => Answer::Truncated,
        (0, 0) => Answer::Empty,
        (0, _) => Answer::Records,
        _ => Answer::Failed,
    })
}
