//! Ways of getting a request to the proxy and classifying its reply

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::CoaError;
use crate::packet::{keyed_digest, verify_response, Attribute, Code, Packet, HEADER_SIZE};

/// How the proxy answered a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acknowledged,
    /// NAK, an unexpected code or a reply that failed verification
    Rejected(u8),
}

impl Outcome {
    pub fn is_acknowledged(&self) -> bool {
        matches!(self, Outcome::Acknowledged)
    }
}

/// One round trip: send a request, wait once for its reply
#[async_trait]
pub trait SessionControlTransport: Send + Sync {
    async fn exchange(&self, code: Code, attributes: &[Attribute]) -> Result<Outcome, CoaError>;
}

fn expected_ack(code: Code) -> Result<Code, CoaError> {
    code.ack()
        .ok_or_else(|| CoaError::InvalidRequest(format!("{:?} is not a request code", code)))
}

async fn connect(target: &str) -> Result<UdpSocket, CoaError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(target).await?;
    Ok(socket)
}

/// Typed packet encoder with identifier and response authenticator checks
pub struct UdpStructuredTransport {
    target: String,
    secret: Vec<u8>,
    timeout: Duration,
}

impl UdpStructuredTransport {
    pub fn new(target: impl Into<String>, secret: &str, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            secret: secret.as_bytes().to_vec(),
            timeout,
        }
    }
}

#[async_trait]
impl SessionControlTransport for UdpStructuredTransport {
    async fn exchange(&self, code: Code, attributes: &[Attribute]) -> Result<Outcome, CoaError> {
        let ack = expected_ack(code)?;
        let mut request = Packet::new(code, rand::random(), attributes.to_vec());
        let datagram = request.encode_request(&self.secret)?;

        let socket = connect(&self.target).await?;
        socket.send(&datagram).await?;
        debug!(
            identifier = request.identifier,
            "Sent {:?} to {} ({} bytes)",
            code,
            self.target,
            datagram.len()
        );

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; 4096];
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| CoaError::Timeout {
                    target: self.target.clone(),
                    after: self.timeout,
                })??;
            let reply = &buf[..received];

            // Replies for other requests are ignored
            if reply.len() >= 2 && reply[1] != request.identifier {
                debug!("Ignoring reply with identifier {}", reply[1]);
                continue;
            }
            let Some(&reply_code) = reply.first() else {
                continue;
            };

            if !verify_response(reply, &request.authenticator, &self.secret) {
                warn!(
                    "Reply from {} failed authenticator check (code {})",
                    self.target, reply_code
                );
                return Ok(Outcome::Rejected(reply_code));
            }

            let decoded = Packet::decode(Bytes::copy_from_slice(reply));
            return Ok(match decoded {
                Ok(packet) if packet.code == ack => Outcome::Acknowledged,
                Ok(packet) => {
                    debug!("Reply attributes: {:?}", packet.attributes);
                    Outcome::Rejected(reply_code)
                }
                Err(e) => {
                    warn!("Unparseable reply from {}: {}", self.target, e);
                    Outcome::Rejected(reply_code)
                }
            });
        }
    }
}

/// Minimal hand-built datagram; only the reply's first octet is inspected
pub struct RawSocketTransport {
    target: String,
    secret: Vec<u8>,
    timeout: Duration,
}

impl RawSocketTransport {
    pub fn new(target: impl Into<String>, secret: &str, timeout: Duration) -> Self {
        Self {
            target: target.into(),
            secret: secret.as_bytes().to_vec(),
            timeout,
        }
    }

    /// Serialize header, placeholder authenticator and TLV attributes, then
    /// splice in MD5(packet + secret)
    pub fn build_datagram(
        code: Code,
        identifier: u8,
        attributes: &[Attribute],
        secret: &[u8],
    ) -> Result<Vec<u8>, CoaError> {
        let mut tlvs = Vec::new();
        for attribute in attributes {
            let value = attribute.value();
            if value.is_empty() || value.len() > 253 {
                return Err(CoaError::AttributeTooLong {
                    attribute: attribute.type_code(),
                    length: value.len(),
                });
            }
            tlvs.push(attribute.type_code());
            tlvs.push((value.len() + 2) as u8);
            tlvs.extend_from_slice(&value);
        }

        let length = HEADER_SIZE + tlvs.len();
        if length > 4096 {
            return Err(CoaError::PacketTooLarge(length));
        }

        let mut datagram = Vec::with_capacity(length);
        datagram.push(code as u8);
        datagram.push(identifier);
        datagram.extend_from_slice(&(length as u16).to_be_bytes());
        datagram.extend_from_slice(&[0u8; 16]);
        datagram.extend_from_slice(&tlvs);

        let authenticator = keyed_digest(&datagram, secret);
        datagram[4..HEADER_SIZE].copy_from_slice(&authenticator);
        Ok(datagram)
    }
}

#[async_trait]
impl SessionControlTransport for RawSocketTransport {
    async fn exchange(&self, code: Code, attributes: &[Attribute]) -> Result<Outcome, CoaError> {
        let ack = expected_ack(code)?;
        let datagram = Self::build_datagram(code, rand::random(), attributes, &self.secret)?;

        let socket = connect(&self.target).await?;
        socket.send(&datagram).await?;
        debug!("Sent raw {:?} to {}", code, self.target);

        let mut buf = [0u8; 4096];
        let received = tokio::time::timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| CoaError::Timeout {
                target: self.target.clone(),
                after: self.timeout,
            })??;

        match buf[..received].first() {
            Some(&reply) if reply == ack as u8 => Ok(Outcome::Acknowledged),
            Some(&reply) => Ok(Outcome::Rejected(reply)),
            None => Ok(Outcome::Rejected(0)),
        }
    }
}
