//! Shared harness for the end-to-end tests: spawns a real server on an
//! ephemeral port and drives it with a line-oriented scripted client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::io::AsyncBufReadExt;
use tokio::net::TcpStream;

use amftpd::config::DaemonConfig;
use amftpd::server::{FtpServer, ServerRuntime, Stores};
use amftpd::store::section::Section;
use amftpd::store::user::{Capabilities, User};
use amftpd::vfs::physical::Mount;
use amftpd::vfs::VirtualPath;

/// A running test site: the server, its runtime handle and the tempdirs
/// keeping its state alive.
pub struct TestSite {
    pub server: FtpServer,
    pub runtime: Arc<ServerRuntime>,
    pub addr: SocketAddr,
    pub data_root: tempfile::TempDir,
    _state: tempfile::TempDir,
}

/// Spawns a server with one section `APPS` mounted at `/apps` over a
/// temp directory. `tweak` runs before startup to adjust users, config
/// and stores.
pub async fn spawn_site(
    tweak: impl FnOnce(&mut DaemonConfig, &Stores),
) -> TestSite {
    let state = tempfile::tempdir().expect("state dir");
    let data_root = tempfile::tempdir().expect("data dir");
    let stores = Stores::open(state.path()).expect("stores");

    let mut section = Section::new("APPS", "/apps");
    section.upload_multiplier = 3.0;
    stores.sections.upsert(section).expect("seed section");
    stores
        .mounts
        .add(Mount::new(VirtualPath::parse("/apps").unwrap(), data_root.path()));

    let mut admin = User::new("admin", "admin");
    admin.caps = Capabilities { siteop: true, fxp: true, ..Capabilities::default() };
    admin.credits_kib = 1 << 20;
    stores.users.upsert_user(admin).expect("seed admin");

    let mut config = DaemonConfig {
        bind_addr: "127.0.0.1".parse().unwrap(),
        port: 0,
        passive_port_min: 0,
        passive_port_max: 0,
        greeting: "amftpd test ready.".to_string(),
        ..DaemonConfig::default()
    };
    config.tls.cert_path = state.path().join("cert.pem");
    config.tls.key_path = state.path().join("key.pem");

    tweak(&mut config, &stores);

    let server = FtpServer::new(config, stores).expect("server");
    let addr = server.start().await.expect("start");
    let runtime = server.runtime();
    TestSite { server, runtime, addr, data_root, _state: state }
}

/// Line-oriented FTP control client.
pub struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Client {
        let stream = TcpStream::connect(addr).await.expect("connect");
        let (read, writer) = stream.into_split();
        Client { reader: BufReader::new(read), writer }
    }

    pub async fn send(&mut self, line: &str) {
        self.writer.write_all(format!("{line}\r\n").as_bytes()).await.expect("send");
    }

    /// Reads one complete reply (following multi-line framing) and
    /// returns `(code, first_line_text)`.
    pub async fn reply(&mut self) -> (u16, String) {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.expect("read reply");
        assert!(line.len() >= 4, "short reply: {line:?}");
        let code: u16 = line[..3].parse().unwrap_or_else(|_| panic!("bad code in {line:?}"));
        let text = line[4..].trim_end().to_string();
        if line.as_bytes()[3] == b'-' {
            // Multi-line: swallow until the closing "CODE " line.
            let terminator = format!("{code} ");
            loop {
                let mut next = String::new();
                self.reader.read_line(&mut next).await.expect("read reply continuation");
                if next.starts_with(&terminator) {
                    break;
                }
            }
        }
        (code, text)
    }

    pub async fn expect(&mut self, code: u16) -> String {
        let (got, text) = self.reply().await;
        assert_eq!(got, code, "unexpected reply {got} {text}");
        text
    }

    /// Logs in and consumes the greeting.
    pub async fn login(&mut self, user: &str, pass: &str) {
        self.expect(220).await;
        self.send(&format!("USER {user}")).await;
        self.expect(331).await;
        self.send(&format!("PASS {pass}")).await;
        self.expect(230).await;
    }
}

/// Parses the `(a,b,c,d,p1,p2)` body of a 227 reply.
pub fn parse_pasv(text: &str) -> SocketAddr {
    let open = text.find('(').expect("no ( in PASV reply");
    let close = text.rfind(')').expect("no ) in PASV reply");
    let parts: Vec<u16> = text[open + 1..close]
        .split(',')
        .map(|p| p.trim().parse().expect("pasv number"))
        .collect();
    assert_eq!(parts.len(), 6, "bad PASV body {text}");
    let ip = format!("{}.{}.{}.{}", parts[0], parts[1], parts[2], parts[3]);
    let port = (parts[4] << 8) | parts[5];
    format!("{ip}:{port}").parse().expect("pasv addr")
}

/// Opens the advertised data connection and returns everything it
/// carries until EOF.
pub async fn drain_data(addr: SocketAddr) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("data connect");
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.expect("data read");
    out
}
