//! Trojan instance end to end over loopback sockets

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use multiproxy_node::config::ConnConfig;
use multiproxy_node::core::auth::trojan_sha256;
use multiproxy_node::settings::TrojanSettings;
use multiproxy_node::storage::MemoryStorage;
use multiproxy_node::{ProxyManager, ProxySettings};

async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut sock, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut rd, mut wr) = sock.split();
                let _ = tokio::io::copy(&mut rd, &mut wr).await;
            });
        }
    });
    port
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn trojan_header(password: &str, host: &str, port: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 56];
    buf[..32].copy_from_slice(&trojan_sha256(password));
    buf.push(0x01);
    buf.extend_from_slice(b"\r\n");
    buf.push(0x03);
    buf.push(host.len() as u8);
    buf.extend_from_slice(host.as_bytes());
    buf.extend_from_slice(&port.to_be_bytes());
    buf
}

fn manager() -> ProxyManager {
    let config = ConnConfig {
        listen_host: "127.0.0.1".to_string(),
        ..ConnConfig::default()
    };
    ProxyManager::new(Arc::new(MemoryStorage::new()), config)
}

fn trojan_settings(password: &str) -> ProxySettings {
    ProxySettings::Trojan(TrojanSettings {
        password: password.to_string(),
        network: "tcp".to_string(),
        host: String::new(),
        path: String::new(),
        tls: false,
        tls_settings: None,
    })
}

#[tokio::test]
async fn test_trojan_domain_header_relays() {
    let target = echo_server().await;
    let manager = manager();
    let port = free_port().await;
    let proxy = manager
        .create(1, port, trojan_settings("p@ss"), None)
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(&trojan_header("p@ss", "127.0.0.1", target))
        .await
        .unwrap();
    client.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();

    let mut buf = vec![0u8; 18];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"GET / HTTP/1.0\r\n\r\n");
    drop(client);

    // counters land once the relay has wound down
    let mut snapshot = manager.get(proxy.id).await.unwrap();
    for _ in 0..50 {
        if snapshot.download == 18 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        snapshot = manager.get(proxy.id).await.unwrap();
    }
    assert_eq!(snapshot.upload, 18);
    assert_eq!(snapshot.download, 18);
    assert!(snapshot.last_active_at.is_some());
    manager.shutdown().await;
}

#[tokio::test]
async fn test_trojan_bad_password_gets_closed_connection() {
    let target = echo_server().await;
    let manager = manager();
    let port = free_port().await;
    let proxy = manager
        .create(1, port, trojan_settings("p@ss"), None)
        .await
        .unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client
        .write_all(&trojan_header("wrong", "127.0.0.1", target))
        .await
        .unwrap();
    let _ = client.write_all(b"payload").await;

    let mut buf = Vec::new();
    let _ = client.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    assert_eq!(manager.get(proxy.id).await.unwrap().upload, 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_trojan_missing_crlf_is_dropped() {
    let target = echo_server().await;
    let manager = manager();
    let port = free_port().await;
    manager
        .create(1, port, trojan_settings("p@ss"), None)
        .await
        .unwrap();

    let mut header = trojan_header("p@ss", "127.0.0.1", target);
    header[57] = b'X';
    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&header).await.unwrap();

    let mut buf = Vec::new();
    let _ = client.read_to_end(&mut buf).await;
    assert!(buf.is_empty());
    manager.shutdown().await;
}
