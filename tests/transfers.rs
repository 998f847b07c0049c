//! Transfer scenarios: credit accounting, REST, duplicate detection.

mod support;

use support::{drain_data, parse_pasv, spawn_site, Client};

use amftpd::store::user::User;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Uploads `payload` as `name` through a fresh passive data connection.
async fn upload(client: &mut Client, name: &str, payload: &[u8]) {
    client.send("PASV").await;
    let data_addr = parse_pasv(&client.expect(227).await);
    client.send(&format!("STOR {name}")).await;

    let payload = payload.to_vec();
    let push = tokio::spawn(async move {
        let mut data = TcpStream::connect(data_addr).await.expect("data connect");
        data.write_all(&payload).await.expect("data write");
        data.shutdown().await.expect("data shutdown");
    });
    client.expect(150).await;
    client.expect(226).await;
    push.await.unwrap();
}

#[tokio::test]
async fn upload_awards_section_credits() {
    let site = spawn_site(|_, stores| {
        // Section APPS has upload multiplier 3 and no group override.
        let mut user = User::new("racer", "pw");
        user.credits_kib = 0;
        stores.users.upsert_user(user).unwrap();
    })
    .await;

    let mut client = Client::connect(site.addr).await;
    client.login("racer", "pw").await;
    client.send("CWD /apps").await;
    client.expect(250).await;

    upload(&mut client, "tool.bin", &[0u8; 4096]).await;

    // 4096 bytes = 4 KiB, floor(4 * 3) = 12.
    assert_eq!(site.runtime.users.user("racer").unwrap().credits_kib, 12);
    assert!(site.data_root.path().join("tool.bin").exists());
    assert_eq!(site.runtime.stats.snapshot().bytes_uploaded, 4096);
    site.server.stop().await;
}

#[tokio::test]
async fn download_without_credits_is_refused() {
    let site = spawn_site(|_, stores| {
        let mut user = User::new("leech", "pw");
        user.credits_kib = 10;
        stores.users.upsert_user(user).unwrap();
    })
    .await;
    // 20 KiB at download multiplier 1.0 costs 20, balance is 10.
    std::fs::write(site.data_root.path().join("big.bin"), vec![1u8; 20480]).unwrap();

    let mut client = Client::connect(site.addr).await;
    client.login("leech", "pw").await;
    client.send("CWD /apps").await;
    client.expect(250).await;

    client.send("RETR big.bin").await;
    let text = client.expect(550).await;
    assert_eq!(text, "Not enough credits.");
    assert_eq!(site.runtime.users.user("leech").unwrap().credits_kib, 10);
    assert_eq!(site.runtime.stats.snapshot().bytes_downloaded, 0);
    site.server.stop().await;
}

#[tokio::test]
async fn successful_download_settles_credits() {
    let site = spawn_site(|_, stores| {
        let mut user = User::new("payer", "pw");
        user.credits_kib = 100;
        stores.users.upsert_user(user).unwrap();
    })
    .await;
    std::fs::write(site.data_root.path().join("file.bin"), vec![2u8; 4096]).unwrap();

    let mut client = Client::connect(site.addr).await;
    client.login("payer", "pw").await;
    client.send("CWD /apps").await;
    client.expect(250).await;

    client.send("PASV").await;
    let data_addr = parse_pasv(&client.expect(227).await);
    let data = tokio::spawn(drain_data(data_addr));
    client.send("RETR file.bin").await;
    client.expect(150).await;
    client.expect(226).await;
    assert_eq!(data.await.unwrap().len(), 4096);

    // 4 KiB at multiplier 1.0.
    assert_eq!(site.runtime.users.user("payer").unwrap().credits_kib, 96);
    site.server.stop().await;
}

#[tokio::test]
async fn rest_resumes_mid_file() {
    let site = spawn_site(|_, _| {}).await;
    std::fs::write(site.data_root.path().join("x.bin"), b"0123456789").unwrap();

    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;
    client.send("CWD /apps").await;
    client.expect(250).await;

    client.send("REST 4").await;
    client.expect(350).await;

    client.send("PASV").await;
    let data_addr = parse_pasv(&client.expect(227).await);
    let data = tokio::spawn(drain_data(data_addr));
    client.send("RETR x.bin").await;
    client.expect(150).await;
    client.expect(226).await;
    assert_eq!(data.await.unwrap(), b"456789");

    // REST is consumed by the transfer.
    client.send("PASV").await;
    let data_addr = parse_pasv(&client.expect(227).await);
    let data = tokio::spawn(drain_data(data_addr));
    client.send("RETR x.bin").await;
    client.expect(150).await;
    client.expect(226).await;
    assert_eq!(data.await.unwrap(), b"0123456789");
    site.server.stop().await;
}

#[tokio::test]
async fn release_upload_feeds_dupe_store() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;
    client.send("CWD /apps").await;
    client.expect(250).await;

    client.send("MKD Tool.v1.0-CREW").await;
    client.expect(257).await;
    client.send("CWD Tool.v1.0-CREW").await;
    client.expect(250).await;

    upload(&mut client, "tool.r00", &[3u8; 2048]).await;

    let release = site.runtime.dupes.find("APPS", "Tool.v1.0-CREW").unwrap().unwrap();
    assert_eq!(release.file_count, 1);
    assert_eq!(release.archive_count, 1);
    assert_eq!(release.total_bytes, 2048);
    assert_eq!(release.crcs.len(), 1);
    assert_eq!(release.crcs[0].0, "tool.r00");
    assert_eq!(release.crcs[0].1, crc32fast::hash(&[3u8; 2048]));

    // Re-creating the same release anywhere in the section is a dupe.
    client.send("MKD /apps/Tool.v1.0-CREW").await;
    let text = client.expect(550).await;
    assert!(text.contains("Duplicate"), "{text}");

    // SITE DUPE sees it too.
    client.send("SITE DUPE tool*").await;
    client.expect(200).await;
    site.server.stop().await;
}

#[tokio::test]
async fn site_nuke_marks_release() {
    let site = spawn_site(|_, _| {}).await;
    let mut client = Client::connect(site.addr).await;
    client.login("admin", "admin").await;
    client.send("CWD /apps").await;
    client.expect(250).await;
    client.send("MKD Bad.Rel-GRP").await;
    client.expect(257).await;
    client.send("CWD Bad.Rel-GRP").await;
    client.expect(250).await;
    upload(&mut client, "bad.r00", &[4u8; 1024]).await;

    client.send("SITE NUKE APPS Bad.Rel-GRP 3.0 mislabeled").await;
    client.expect(200).await;

    let release = site.runtime.dupes.find("APPS", "Bad.Rel-GRP").unwrap().unwrap();
    let nuke = release.nuke.expect("release should be nuked");
    assert_eq!(nuke.reason, "mislabeled");
    assert_eq!(nuke.multiplier, 3.0);
    assert_eq!(site.runtime.releases.nuked().len(), 1);
    site.server.stop().await;
}
