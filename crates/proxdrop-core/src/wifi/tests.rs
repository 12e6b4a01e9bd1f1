//! 本地链路测试
//!
//! 凭据 JSON 格式和链路拆除次数

use super::*;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct CountingLink {
    removed: AtomicUsize,
    fail: bool,
    hang: bool,
}

#[async_trait]
impl LocalLink for CountingLink {
    async fn create_group(&self) -> anyhow::Result<GroupInfo> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            anyhow::bail!("hotspot refused");
        }
        Ok(GroupInfo {
            ssid: "DIRECT-test".to_string(),
            psk: "12345678".to_string(),
            mac: "02:00:00:00:00:01".to_string(),
        })
    }

    async fn join_group(&self, _credentials: &LinkCredentials) -> anyhow::Result<IpAddr> {
        if self.fail {
            anyhow::bail!("no such network");
        }
        Ok(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1)))
    }

    async fn remove_group(&self) -> anyhow::Result<()> {
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn credentials() -> LinkCredentials {
    LinkCredentials {
        id: None,
        ssid: "DIRECT-test".to_string(),
        psk: "12345678".to_string(),
        mac: "02:00:00:00:00:01".to_string(),
        port: 8443,
        key: None,
    }
}

#[test]
fn test_credentials_wire_format() {
    let json = serde_json::to_value(credentials()).unwrap();
    assert_eq!(
        json,
        serde_json::json!({
            "ssid": "DIRECT-test",
            "psk": "12345678",
            "mac": "02:00:00:00:00:01",
            "port": 8443
        })
    );

    let parsed: LinkCredentials = serde_json::from_str(
        r#"{"id":"ab12","ssid":"x","psk":"y","mac":"z","port":9000,"key":"PUBKEY","extra":1}"#,
    )
    .unwrap();
    assert_eq!(parsed.key.as_deref(), Some("PUBKEY"));
    assert_eq!(parsed.port, 9000);
}

#[tokio::test]
async fn test_release_tears_down_once() {
    let link = Arc::new(CountingLink::default());
    let negotiator = LinkNegotiator::new(link.clone());

    let session = negotiator
        .connect(&credentials(), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(session.peer_addr(), Some(IpAddr::V4(Ipv4Addr::new(192, 168, 49, 1))));

    session.release().await;
    assert_eq!(link.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_dropped_session_schedules_teardown() {
    let link = Arc::new(CountingLink::default());
    let negotiator = LinkNegotiator::new(link.clone());

    let (group, session) = negotiator.form(Duration::from_secs(1)).await.unwrap();
    assert_eq!(group.ssid, "DIRECT-test");
    assert_eq!(session.peer_addr(), None);
    drop(session);

    for _ in 0..50 {
        if link.removed.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(link.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failure_maps_to_link_error_and_tears_down() {
    let link = Arc::new(CountingLink {
        fail: true,
        ..Default::default()
    });
    let negotiator = LinkNegotiator::new(link.clone());

    let err = negotiator
        .connect(&credentials(), Duration::from_secs(1))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, TransferError::Link(ref reason) if reason.contains("no such network")));
    assert_eq!(link.removed.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_maps_to_timeout_error() {
    let link = Arc::new(CountingLink {
        hang: true,
        ..Default::default()
    });
    let negotiator = LinkNegotiator::new(link.clone());

    let err = negotiator.form(Duration::from_secs(10)).await.err().unwrap();
    assert!(matches!(err, TransferError::Timeout { after, .. } if after == Duration::from_secs(10)));
    assert_eq!(link.removed.load(Ordering::SeqCst), 1);
}
