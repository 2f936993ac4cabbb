//! SOCKS5 instance end to end over loopback sockets

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use multiproxy_node::config::ConnConfig;
use multiproxy_node::settings::{SocksAuthMode, SocksSettings};
use multiproxy_node::storage::MemoryStorage;
use multiproxy_node::{ProxyManager, ProxySettings};

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn manager() -> ProxyManager {
    let config = ConnConfig {
        listen_host: "127.0.0.1".to_string(),
        connect_timeout: std::time::Duration::from_secs(2),
        ..ConnConfig::default()
    };
    ProxyManager::new(Arc::new(MemoryStorage::new()), config)
}

fn socks() -> ProxySettings {
    ProxySettings::Socks(SocksSettings {
        auth: SocksAuthMode::None,
        username: None,
        password: None,
        udp: false,
    })
}

#[tokio::test]
async fn test_socks5_unreachable_target_gets_negative_reply() {
    let manager = manager();
    let port = free_port().await;
    manager.create(1, port, socks(), None).await.unwrap();
    let unreachable = free_port().await;

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&unreachable.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, [0x05, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
    manager.shutdown().await;
}

#[tokio::test]
async fn test_socks5_connect_reports_bound_address() {
    let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target_port = target.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut sock, _)) = target.accept().await {
            let _ = sock.write_all(b"banner").await;
        }
    });

    let manager = manager();
    let port = free_port().await;
    manager.create(1, port, socks(), None).await.unwrap();

    let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();

    let mut request = vec![0x05, 0x01, 0x00, 0x03, 9];
    request.extend_from_slice(b"127.0.0.1");
    request.extend_from_slice(&target_port.to_be_bytes());
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);
    assert_eq!(&reply[4..8], &[127, 0, 0, 1]);

    let mut banner = [0u8; 6];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"banner");
    manager.shutdown().await;
}
