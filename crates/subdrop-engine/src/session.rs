//! Peer channel establishment.
//!
//! The side that wants a channel (the offerer) binds an ephemeral listener,
//! generates a session token, and advertises both through the relay. The
//! answering side dials the advertised candidates and proves it received the
//! offer by writing the raw 16 token bytes as its very first payload. The
//! offerer accepts exactly one connection with the right token; everything
//! else is dropped. Either side gives up after the channel-open timeout.

use crate::error::EngineError;
use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

/// Length of the session token in bytes.
pub const TOKEN_LEN: usize = 16;

/// Proof-of-offer token carried in the session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken([u8; TOKEN_LEN]);

impl SessionToken {
    /// Generate a fresh random token.
    pub fn generate() -> Self {
        Self(rand::random())
    }

    /// Hex encoding used on the signaling wire.
    pub fn to_hex(self) -> String {
        self.0.iter().fold(String::with_capacity(TOKEN_LEN * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
    }

    /// Parse the hex form; anything but 32 hex digits is rejected.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != TOKEN_LEN * 2 {
            return None;
        }
        let mut bytes = [0u8; TOKEN_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }
}

/// Bind the offerer's listener on an ephemeral port.
///
/// `advertise_ip` replaces a wildcard bind address in the advertised
/// candidate, since peers cannot dial `0.0.0.0`.
pub async fn bind_offer_listener(
    advertise_ip: std::net::IpAddr,
) -> Result<(TcpListener, SocketAddr), EngineError> {
    let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
    let local = listener.local_addr()?;
    Ok((listener, SocketAddr::new(advertise_ip, local.port())))
}

/// Offerer side: accept the one connection that presents the token.
///
/// Connections with a wrong or missing token are dropped and the wait
/// continues, until the deadline covers the whole exchange.
pub async fn accept_with_token(
    listener: TcpListener,
    token: SessionToken,
    deadline: Duration,
) -> Result<TcpStream, EngineError> {
    let accept_loop = async {
        loop {
            let (mut stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "accept failed while awaiting peer");
                    continue;
                }
            };
            let mut presented = [0u8; TOKEN_LEN];
            match stream.read_exact(&mut presented).await {
                Ok(_) if presented == *token.as_bytes() => return Ok(stream),
                Ok(_) => debug!(%peer, "wrong session token"),
                Err(e) => debug!(%peer, error = %e, "token read failed"),
            }
        }
    };
    match timeout(deadline, accept_loop).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::ChannelOpenTimeout),
    }
}

/// Answerer side: dial candidates as they arrive and present the token.
///
/// Candidates come from the offer itself plus any trickled afterwards; the
/// first successful dial wins. Individual dial failures just move on to the
/// next candidate.
pub async fn dial_with_token(
    mut candidates: mpsc::Receiver<SocketAddr>,
    token: SessionToken,
    deadline: Duration,
) -> Result<TcpStream, EngineError> {
    let dial_loop = async {
        while let Some(addr) = candidates.recv().await {
            match TcpStream::connect(addr).await {
                Ok(mut stream) => {
                    if stream.write_all(token.as_bytes()).await.is_ok()
                        && stream.flush().await.is_ok()
                    {
                        return Ok(stream);
                    }
                }
                Err(e) => debug!(%addr, error = %e, "candidate dial failed"),
            }
        }
        Err(EngineError::ChannelClosed)
    };
    match timeout(deadline, dial_loop).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::ChannelOpenTimeout),
    }
}
