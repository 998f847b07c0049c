//! Data-channel negotiation and the transfer loop.
//!
//! Passive mode binds a listener from the configured port range and
//! stores it on the session; it is consumed by the next transfer or
//! replaced (and closed) by the next PASV/EPSV. Active mode records the
//! validated PORT/EPRT target. When `PROT P` is in effect the accepted or
//! connected socket is wrapped with TLS before any payload flows.
//!
//! The transfer loop streams fixed-size chunks, meters bytes into the
//! session and global counters through a callback, shapes throughput with
//! a token bucket when the account carries a KiB/s cap, and honors abort
//! by returning [`FtpError::Aborted`] so the session can emit 426 + 226.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Instant};
use tracing::{debug, trace};

use crate::error::{FtpError, FtpResult};
use crate::session::stream::MaybeTlsStream;

/// Transfer chunk size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// A bound, not yet accepted passive listener.
pub struct PassiveSocket {
    pub listener: TcpListener,
    pub advertised_ip: IpAddr,
    pub port: u16,
}

impl PassiveSocket {
    /// The `(a,b,c,d,p1,p2)` body of a 227 reply. Only meaningful for
    /// IPv4 advertisements.
    pub fn pasv_reply_body(&self) -> Option<String> {
        match self.advertised_ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                Some(format!(
                    "{},{},{},{},{},{}",
                    o[0],
                    o[1],
                    o[2],
                    o[3],
                    self.port >> 8,
                    self.port & 0xFF
                ))
            }
            IpAddr::V6(_) => None,
        }
    }
}

/// Binds a passive listener on the first free port of the configured
/// range.
pub async fn open_passive(
    bind_ip: IpAddr,
    advertised_ip: IpAddr,
    port_min: u16,
    port_max: u16,
) -> FtpResult<PassiveSocket> {
    for port in port_min..=port_max {
        match TcpListener::bind(SocketAddr::new(bind_ip, port)).await {
            Ok(listener) => {
                let port = listener.local_addr()?.port();
                trace!(port, "passive listener bound");
                return Ok(PassiveSocket { listener, advertised_ip, port });
            }
            Err(_) => continue,
        }
    }
    Err(FtpError::protocol(425, "No free passive port"))
}

/// Parses the PORT argument `h1,h2,h3,h4,p1,p2`.
pub fn parse_port_target(arg: &str) -> FtpResult<SocketAddr> {
    let parts: Vec<u8> = arg
        .split(',')
        .map(|p| p.trim().parse::<u8>())
        .collect::<Result<_, _>>()
        .map_err(|_| FtpError::bad_argument("Bad PORT argument"))?;
    if parts.len() != 6 {
        return Err(FtpError::bad_argument("Bad PORT argument"));
    }
    let ip = IpAddr::from([parts[0], parts[1], parts[2], parts[3]]);
    let port = (u16::from(parts[4]) << 8) | u16::from(parts[5]);
    if port == 0 {
        return Err(FtpError::bad_argument("Bad PORT argument"));
    }
    Ok(SocketAddr::new(ip, port))
}

/// Parses the EPRT argument `|af|addr|port|` with an arbitrary delimiter.
pub fn parse_eprt_target(arg: &str) -> FtpResult<SocketAddr> {
    let mut chars = arg.chars();
    let delim = chars.next().ok_or_else(|| FtpError::bad_argument("Bad EPRT argument"))?;
    let rest: String = chars.collect();
    let parts: Vec<&str> = rest.split(delim).collect();
    if parts.len() < 3 {
        return Err(FtpError::bad_argument("Bad EPRT argument"));
    }
    let family = parts[0];
    let addr = parts[1];
    let port: u16 =
        parts[2].parse().map_err(|_| FtpError::bad_argument("Bad EPRT port"))?;
    if port == 0 {
        return Err(FtpError::bad_argument("Bad EPRT port"));
    }
    let ip: IpAddr = addr.parse().map_err(|_| FtpError::bad_argument("Bad EPRT address"))?;
    match (family, ip) {
        ("1", IpAddr::V4(_)) | ("2", IpAddr::V6(_)) => Ok(SocketAddr::new(ip, port)),
        _ => Err(FtpError::protocol(522, "Network protocol mismatch")),
    }
}

/// Accepts the pending passive connection within the establishment
/// timeout. Returns the stream and the connecting peer.
pub async fn accept_passive(
    socket: PassiveSocket,
    establish_timeout: Duration,
) -> FtpResult<(TcpStream, SocketAddr)> {
    match timeout(establish_timeout, socket.listener.accept()).await {
        Ok(Ok((stream, peer))) => {
            stream.set_nodelay(true).ok();
            debug!(%peer, "passive data connection accepted");
            Ok((stream, peer))
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(FtpError::Timeout),
    }
}

/// Connects to an active-mode target within the establishment timeout.
pub async fn connect_active(
    target: SocketAddr,
    establish_timeout: Duration,
) -> FtpResult<TcpStream> {
    match timeout(establish_timeout, TcpStream::connect(target)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            debug!(%target, "active data connection established");
            Ok(stream)
        }
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(FtpError::Timeout),
    }
}

/// Wraps a fresh data socket per the session's PROT state.
pub async fn protect_data_socket(
    stream: TcpStream,
    acceptor: Option<&tokio_rustls::TlsAcceptor>,
    handshake_timeout: Duration,
) -> FtpResult<MaybeTlsStream> {
    match acceptor {
        None => Ok(MaybeTlsStream::Plain(stream)),
        Some(acceptor) => match timeout(handshake_timeout, acceptor.accept(stream)).await {
            Ok(Ok(tls)) => Ok(MaybeTlsStream::Tls(Box::new(tls))),
            Ok(Err(e)) => Err(FtpError::protocol(522, format!("TLS handshake failed: {e}"))),
            Err(_) => Err(FtpError::Timeout),
        },
    }
}

/// Token bucket shaping a transfer to a KiB/s cap. Delays reads instead
/// of dropping bytes.
pub struct TokenBucket {
    rate_bytes_per_sec: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(rate_kibs: u32) -> Self {
        let rate = f64::from(rate_kibs) * 1024.0;
        TokenBucket {
            rate_bytes_per_sec: rate,
            capacity: rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    /// Waits until `amount` bytes of budget are available, then spends
    /// them.
    pub async fn consume(&mut self, amount: usize) {
        let amount = amount as f64;
        loop {
            let now = Instant::now();
            let elapsed = now.duration_since(self.last_refill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.rate_bytes_per_sec).min(self.capacity);
            self.last_refill = now;
            if self.tokens >= amount {
                self.tokens -= amount;
                return;
            }
            let deficit = amount - self.tokens;
            let wait = Duration::from_secs_f64(deficit / self.rate_bytes_per_sec);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Streams `src` into `dst` in fixed chunks. Invokes `on_chunk` with each
/// chunk after a successful write so the caller can meter counters and
/// fold checksums. Each chunk must make progress within
/// `progress_timeout`.
pub async fn pump(
    src: &mut (impl AsyncRead + Unpin),
    dst: &mut (impl AsyncWrite + Unpin),
    bucket: Option<&mut TokenBucket>,
    progress_timeout: Duration,
    mut on_chunk: impl FnMut(&[u8]),
) -> FtpResult<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    let mut bucket = bucket;
    loop {
        let n = match timeout(progress_timeout, src.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(FtpError::Timeout),
        };
        if let Some(bucket) = bucket.as_deref_mut() {
            bucket.consume(n).await;
        }
        match timeout(progress_timeout, dst.write_all(&buf[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(FtpError::Timeout),
        }
        total += n as u64;
        on_chunk(&buf[..n]);
    }
    dst.flush().await?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_argument_parsing() {
        let addr = parse_port_target("192,168,1,2,4,1").unwrap();
        assert_eq!(addr, "192.168.1.2:1025".parse().unwrap());
        assert!(parse_port_target("1,2,3,4,5").is_err());
        assert!(parse_port_target("256,2,3,4,5,6").is_err());
        assert!(parse_port_target("1,2,3,4,0,0").is_err());
    }

    #[test]
    fn eprt_argument_parsing() {
        let addr = parse_eprt_target("|1|132.235.1.2|6275|").unwrap();
        assert_eq!(addr, "132.235.1.2:6275".parse().unwrap());
        let addr = parse_eprt_target("|2|2001:db8::9|6446|").unwrap();
        assert_eq!(addr, "[2001:db8::9]:6446".parse().unwrap());
        // Family/address mismatch.
        assert!(parse_eprt_target("|1|2001:db8::9|6446|").is_err());
        assert!(parse_eprt_target("|2|10.0.0.1|6446|").is_err());
        assert!(parse_eprt_target("garbage").is_err());
    }

    #[test]
    fn pasv_body_formats_ipv4() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let socket = rt
            .block_on(open_passive(
                "127.0.0.1".parse().unwrap(),
                "127.0.0.1".parse().unwrap(),
                0,
                0,
            ))
            .unwrap();
        let body = socket.pasv_reply_body().unwrap();
        let p1 = socket.port >> 8;
        let p2 = socket.port & 0xFF;
        assert_eq!(body, format!("127,0,0,1,{p1},{p2}"));
    }

    #[tokio::test]
    async fn pump_meters_chunks() {
        let payload = vec![7u8; CHUNK_SIZE + 123];
        let mut src = std::io::Cursor::new(payload.clone());
        let mut dst = Vec::new();
        let mut metered = 0u64;
        let total = pump(&mut src, &mut dst, None, Duration::from_secs(5), |chunk| {
            metered += chunk.len() as u64
        })
        .await
        .unwrap();
        assert_eq!(total, payload.len() as u64);
        assert_eq!(metered, total);
        assert_eq!(dst, payload);
    }

    #[tokio::test]
    async fn token_bucket_delays() {
        // 1 KiB/s cap; consuming 2 KiB must take north of a second. Use a
        // generous lower bound to stay robust on slow CI.
        let mut bucket = TokenBucket::new(1);
        bucket.consume(1024).await; // free, bucket starts full
        let start = Instant::now();
        bucket.consume(1024).await;
        assert!(start.elapsed() >= Duration::from_millis(600));
    }
}
