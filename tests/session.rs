//! End-to-end control-channel scenarios against a live server.

mod support;

use support::{drain_data, parse_pasv, spawn_site, Client};

#[tokio::test]
async fn anonymous_login_is_refused() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;

    client.expect(220).await;
    client.send("USER anon").await;
    client.expect(331).await;
    client.send("PASS foo").await;
    let text = client.expect(530).await;
    assert_eq!(text, "Login incorrect.");
    site.server.stop().await;
}

#[tokio::test]
async fn login_then_basics() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;

    client.send("SYST").await;
    let text = client.expect(215).await;
    assert!(text.contains("UNIX"));

    client.send("PWD").await;
    let text = client.expect(257).await;
    assert!(text.contains("\"/\""), "{text}");

    client.send("FEAT").await;
    client.expect(211).await;

    client.send("NOOP").await;
    client.expect(200).await;

    client.send("QUIT").await;
    client.expect(221).await;
    site.server.stop().await;
}

#[tokio::test]
async fn replies_keep_command_order() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.expect(220).await;

    // Pipelined commands are answered strictly in order.
    client.send("NOOP\r\nNOOP\r\nSYST").await;
    client.expect(200).await;
    client.expect(200).await;
    client.expect(215).await;
    site.server.stop().await;
}

#[tokio::test]
async fn commands_require_login() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.expect(220).await;

    for cmd in ["LIST", "PASV", "RETR x", "CWD /apps", "SITE HELP"] {
        client.send(cmd).await;
        client.expect(530).await;
    }
    site.server.stop().await;
}

#[tokio::test]
async fn prot_requires_tls_and_pbsz() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.expect(220).await;

    // Neither PBSZ nor PROT are valid on a plaintext control channel.
    client.send("PBSZ 0").await;
    client.expect(503).await;
    client.send("PROT P").await;
    client.expect(503).await;
    site.server.stop().await;
}

#[tokio::test]
async fn passive_mlsd_listing() {
    let site = spawn_site(|_, _| {}).await;
    std::fs::write(site.data_root.path().join("tool.r00"), b"12345").unwrap();

    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;

    client.send("CWD /apps").await;
    client.expect(250).await;

    client.send("PASV").await;
    let text = client.expect(227).await;
    let data_addr = parse_pasv(&text);

    let data = tokio::spawn(drain_data(data_addr));
    client.send("MLSD").await;
    client.expect(150).await;
    client.expect(226).await;

    let listing = String::from_utf8(data.await.unwrap()).unwrap();
    let lines: Vec<&str> = listing.split("\r\n").filter(|l| !l.is_empty()).collect();
    assert_eq!(lines.len(), 1, "{listing:?}");
    assert!(lines[0].starts_with("type=file;size=5;modify="), "{listing:?}");
    assert!(lines[0].ends_with("; tool.r00"), "{listing:?}");
    site.server.stop().await;
}

#[tokio::test]
async fn cwd_into_missing_directory_fails() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;

    client.send("CWD /apps/nope").await;
    client.expect(550).await;
    // The failed CWD leaves the working directory alone.
    client.send("PWD").await;
    let text = client.expect(257).await;
    assert!(text.contains("\"/\""), "{text}");
    site.server.stop().await;
}

#[tokio::test]
async fn banned_peers_are_dropped_at_accept() {
    let site = spawn_site(|_, _| {}).await;
    site.runtime.bans.ban_ip("127.0.0.1".parse().unwrap(), None);

    let mut stream = tokio::net::TcpStream::connect(site.addr).await.unwrap();
    let mut buf = [0u8; 64];
    // No banner, just a close.
    let n = tokio::io::AsyncReadExt::read(&mut stream, &mut buf).await.unwrap();
    assert_eq!(n, 0);
    site.server.stop().await;
}

#[tokio::test]
async fn fxp_target_is_refused_at_port_time() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;

    // Third-party target while FXP is globally disabled: refused at the
    // PORT, nothing is ever connected.
    client.send("PORT 10,1,2,3,4,5").await;
    client.expect(550).await;

    // A same-host PORT is fine.
    client.send("PORT 127,0,0,1,200,10").await;
    client.expect(200).await;
    site.server.stop().await;
}

#[tokio::test]
async fn shutdown_notifies_active_sessions() {
    let site = spawn_site(|config, _| {
        config.shutdown_grace_secs = 1;
    })
    .await;
    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;

    let stop = tokio::spawn(async move {
        site.server.stop().await;
        site
    });
    client.expect(421).await;
    stop.await.unwrap();
}
