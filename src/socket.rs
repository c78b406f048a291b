//! Socket abstraction and the scrape-aware socket wrapper a DHT engine can run on.

use crate::{
    adapter::HealthHooks,
    message::{Message, MessageBody, Request},
};
use async_trait::async_trait;
use serde_bencode::value::Value;
use std::{io, net::SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;

/// Datagram socket a DHT engine sends its KRPC messages through.
#[async_trait]
pub trait SocketTrait {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()>;
    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl SocketTrait for UdpSocket {
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, buf, target).await.map(|_| ())
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Socket wrapper that reports `get_peers` traffic to [`HealthHooks`].
///
/// Every outgoing `get_peers` query is reported through [`HealthHooks::on_outgoing_query`]
/// before it is written to the inner socket, and by default gets the BEP33 `scrape` flag set so
/// that the remote nodes include their bloom filters in the response. Every incoming response
/// that carries `BFsd` or `BFpe` is reported through [`HealthHooks::on_response`].
///
/// Datagrams are otherwise passed through unchanged, including those that fail to decode.
pub struct ScrapeSocket<S, H> {
    inner: S,
    hooks: H,
    request_scrape: bool,
    no_seed: bool,
}

impl<S, H> ScrapeSocket<S, H>
where
    S: SocketTrait,
    H: HealthHooks,
{
    pub fn new(inner: S, hooks: H) -> Self {
        Self {
            inner,
            hooks,
            request_scrape: true,
            no_seed: false,
        }
    }

    /// Set whether to add `scrape=1` to outgoing `get_peers` queries. Defaults to true.
    ///
    /// Disable this only if the engine already requests scrapes on its own.
    pub fn set_request_scrape(mut self, request_scrape: bool) -> Self {
        self.request_scrape = request_scrape;
        self
    }

    /// Set whether to add `noseed=1` to outgoing `get_peers` queries. Defaults to false.
    pub fn set_no_seed(mut self, no_seed: bool) -> Self {
        self.no_seed = no_seed;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Returns the datagram to send instead of `datagram`, if it needs rewriting.
    fn observe_outgoing(&self, datagram: &[u8]) -> Option<Vec<u8>> {
        let message = Message::decode(datagram).ok()?;
        let request = match &message.body {
            MessageBody::Request(Request::GetPeers(request)) => request,
            _ => return None,
        };

        self.hooks
            .on_outgoing_query(&message.transaction_id, request.info_hash);

        let scrape = self.request_scrape && !request.scrape;
        let noseed = self.no_seed && !request.noseed;

        if !scrape && !noseed {
            return None;
        }

        match set_query_flags(datagram, scrape, noseed) {
            Ok(datagram) => Some(datagram),
            Err(error) => {
                log::warn!("Failed to request scrape: {}", error);
                None
            }
        }
    }

    fn observe_incoming(&self, datagram: &[u8], addr: SocketAddr) {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(_) => return,
        };

        if let MessageBody::Response(response) = &message.body {
            if response.has_scrape() {
                let (seeders, peers) = response.scrape();
                log::trace!(
                    "Received scrape from {addr:?} (seeders: {}, peers: {})",
                    seeders.is_some(),
                    peers.is_some()
                );
                self.hooks
                    .on_response(&message.transaction_id, seeders, peers);
            }
        }
    }
}

#[async_trait]
impl<S, H> SocketTrait for ScrapeSocket<S, H>
where
    S: SocketTrait + Send + Sync,
    H: HealthHooks,
{
    async fn send_to(&self, buf: &[u8], target: &SocketAddr) -> io::Result<()> {
        // The hook fires here, before the query is on the wire, so that it is always registered
        // before its response can arrive.
        match self.observe_outgoing(buf) {
            Some(rewritten) => self.inner.send_to(&rewritten, target).await,
            None => self.inner.send_to(buf, target).await,
        }
    }

    async fn recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (size, addr) = self.inner.recv_from(buf).await?;
        self.observe_incoming(&buf[..size], addr);
        Ok((size, addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[derive(Error, Debug)]
enum RewriteError {
    #[error("invalid bencode data")]
    InvalidBencode(#[from] serde_bencode::Error),
    #[error("query has no arguments")]
    MissingArguments,
}

// Sets the flags on the generic bencode tree so that keys unknown to `Message` survive.
fn set_query_flags(datagram: &[u8], scrape: bool, noseed: bool) -> Result<Vec<u8>, RewriteError> {
    let mut message: Value = serde_bencode::from_bytes(datagram)?;

    let args = match &mut message {
        Value::Dict(dict) => dict.get_mut(&b"a"[..]),
        _ => None,
    };

    let args = match args {
        Some(Value::Dict(args)) => args,
        _ => return Err(RewriteError::MissingArguments),
    };

    if scrape {
        args.insert(b"scrape".to_vec(), Value::Int(1));
    }

    if noseed {
        args.insert(b"noseed".to_vec(), Value::Int(1));
    }

    Ok(serde_bencode::to_bytes(&message)?)
}
