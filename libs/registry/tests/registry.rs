mod common;

use std::time::Duration;

use anyhow::Result;
use common::{FakeDialer, client, config};
use registry::{Address, MemoryCluster, RegistryClient, RegistryError, SessionState};

const WAIT: Duration = Duration::from_secs(5);

/// Two servers register `echo` under `/rpc`; a consumer sees both, then only
/// the second once the first unregisters.
#[tokio::test]
async fn test_echo_two_instances() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server_a = client(&cluster, &dialer, "/rpc").await;
    let server_b = client(&cluster, &dialer, "/rpc").await;
    let consumer = client(&cluster, &dialer, "/rpc").await;

    let a = server_a.register("echo", "10.0.0.1", 9000).await?;
    let b = server_b.register("echo", "10.0.0.2", 9000).await?;
    assert!(a.node.starts_with("/rpc/echo/10.0.0.1_9000_"));
    assert!(b.node.starts_with("/rpc/echo/10.0.0.2_9000_"));
    assert_eq!(cluster.data(&a.node).unwrap(), b"10.0.0.1:9000");

    let conns = consumer.get_connections("echo").await?;
    let mut targets: Vec<_> = conns.iter().map(|c| c.address().to_string()).collect();
    targets.sort();
    assert_eq!(targets, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);

    server_a.unregister().await?;
    let mut rx = consumer.watch("echo").await?;
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.addresses.len() == 1)).await??;

    let conns = consumer.get_connections("echo").await?;
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].address(), &Address::new("10.0.0.2", 9000));
    assert_eq!(conns[0].channel().target(), &Address::new("10.0.0.2", 9000));

    for c in [server_a, server_b, consumer] {
        c.close().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_concurrent_bootstrap_one_node() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let (a, b) = tokio::join!(
        RegistryClient::connect(config("/deep/rpc"), &cluster, dialer.clone()),
        RegistryClient::connect(config("/deep/rpc"), &cluster, dialer.clone()),
    );
    let (a, b) = (a?, b?);
    assert_eq!(cluster.children("/"), vec!["deep"]);
    assert_eq!(cluster.children("/deep"), vec!["rpc"]);

    let (ra, rb) = tokio::join!(
        a.register("echo", "10.0.0.1", 9000),
        b.register("echo", "10.0.0.2", 9000),
    );
    ra?;
    rb?;
    assert_eq!(cluster.children("/deep/rpc"), vec!["echo"]);
    assert_eq!(cluster.children("/deep/rpc/echo").len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_two_registrars_same_client() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server = client(&cluster, &dialer, "/rpc").await;
    let first = server.registrar();
    let second = server.registrar();
    let echo = registry::ServiceName::new("echo")?;

    let (r1, r2) = tokio::join!(
        first.register(&echo, Address::new("10.0.0.1", 9000)),
        second.register(&echo, Address::new("10.0.0.1", 9000)),
    );
    let (r1, r2) = (r1?, r2?);
    assert_ne!(r1.node, r2.node);
    let seq = |node: &str| registry::path::parse_sequence(node).unwrap();
    assert_ne!(seq(&r1.node), seq(&r2.node));

    // the client's own registration is independent
    assert!(server.node().await.is_none());
    server.register("echo", "10.0.0.1", 9000).await?;
    assert_eq!(cluster.children("/rpc/echo").len(), 3);
    Ok(())
}

#[tokio::test]
async fn test_unregister_removes_only_own_entry() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let a = client(&cluster, &dialer, "/rpc").await;
    let b = client(&cluster, &dialer, "/rpc").await;

    let ra = a.register("echo", "10.0.0.1", 9000).await?;
    let rb = b.register("echo", "10.0.0.1", 9000).await?;
    a.unregister().await?;

    assert!(!cluster.exists(&ra.node));
    assert!(cluster.exists(&rb.node));
    assert_eq!(b.node().await, Some(rb.node));
    assert!(matches!(a.unregister().await, Err(RegistryError::NotRegistered)));
    Ok(())
}

#[tokio::test]
async fn test_watch_follows_successive_changes() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let consumer = client(&cluster, &dialer, "/rpc").await;
    let mut rx = consumer.watch("echo").await?;
    assert_eq!(rx.borrow_and_update().version, 1);

    let mut servers = Vec::new();
    for i in 1..=3u8 {
        let server = client(&cluster, &dialer, "/rpc").await;
        server
            .register("echo", &format!("10.0.0.{i}"), 9000)
            .await?;
        servers.push(server);
        let want = usize::from(i);
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.addresses.len() == want)).await??;
    }

    let mut last_version = rx.borrow().version;
    for server in &servers {
        server.unregister().await?;
        tokio::time::timeout(WAIT, rx.changed()).await??;
        let version = rx.borrow_and_update().version;
        assert!(version > last_version, "versions must increase");
        last_version = version;
    }
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.addresses.is_empty())).await??;
    Ok(())
}

#[tokio::test]
async fn test_unknown_service_empty() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let consumer = client(&cluster, &dialer, "/rpc").await;
    assert!(consumer.get_connections("nobody").await?.is_empty());
    assert!(consumer.resolve("nobody").await?.is_empty());
    assert_eq!(dialer.dial_count(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refresh_tick_redials() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server = client(&cluster, &dialer, "/rpc").await;
    server.register("echo", "10.0.0.1", 9000).await?;

    let consumer = RegistryClient::connect(
        config("/rpc").with_refresh_interval(Duration::from_secs(60)),
        &cluster,
        dialer.clone(),
    )
    .await?;
    let before = dialer.dial_count();
    consumer.get_connections("echo").await?;
    consumer.get_connections("echo").await?;
    assert_eq!(dialer.dial_count(), before + 1, "second lookup is a cache hit");

    tokio::time::sleep(Duration::from_secs(61)).await;
    consumer.get_connections("echo").await?;
    assert_eq!(dialer.dial_count(), before + 2);
    Ok(())
}

#[tokio::test]
async fn test_close_during_blocked_dial() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server = client(&cluster, &dialer, "/rpc").await;
    server.register("slow", "10.0.0.9", 9000).await?;
    dialer.block(Address::new("10.0.0.9", 9000));

    let consumer = RegistryClient::connect(
        config("/rpc").with_dial_timeout(Duration::from_secs(60)),
        &cluster,
        dialer.clone(),
    )
    .await?;
    let lookup = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.get_connections("slow").await }
    });

    let blocked = Address::new("10.0.0.9", 9000);
    let dialed = dialer.dials().iter().filter(|a| **a == blocked).count();
    tokio::time::timeout(WAIT, async {
        while dialer.dials().iter().filter(|a| **a == blocked).count() == dialed {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await?;

    consumer.close().await;
    let result = tokio::time::timeout(WAIT, lookup).await??;
    assert!(matches!(result, Err(RegistryError::Closed)));
    assert_eq!(consumer.background_tasks(), 0);
    Ok(())
}

#[tokio::test]
async fn test_session_expiry_surfaces() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server = client(&cluster, &dialer, "/rpc").await;
    let consumer = client(&cluster, &dialer, "/rpc").await;
    server.register("echo", "10.0.0.1", 9000).await?;
    let mut rx = consumer.watch("echo").await?;
    assert_eq!(rx.borrow_and_update().addresses.len(), 1);

    let mut state = server.subscribe_session();
    assert!(cluster.expire_session(server.session_id()));
    tokio::time::timeout(WAIT, state.wait_for(|s| *s == SessionState::Expired)).await??;

    // the entry went with the session
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.addresses.is_empty())).await??;
    assert!(matches!(
        server.get_connections("echo").await,
        Err(RegistryError::SessionExpired)
    ));
    assert!(matches!(
        server.register("echo", "10.0.0.1", 9000).await,
        Err(RegistryError::SessionExpired)
    ));
    // the lost entry counts as removed
    server.unregister().await?;
    server.close().await;
    assert_eq!(server.background_tasks(), 0);
    Ok(())
}

#[tokio::test]
async fn test_dial_check_failure_prevents_registration() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    dialer.fail(Address::new("10.0.0.1", 9000));
    let server = client(&cluster, &dialer, "/rpc").await;

    let err = server.register("echo", "10.0.0.1", 9000).await.unwrap_err();
    assert!(matches!(err, RegistryError::Dial { .. }), "{err}");
    assert!(cluster.children("/rpc/echo").is_empty());
    assert!(server.node().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_unreadable_address_never_registered() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server = client(&cluster, &dialer, "/rpc").await;

    for (host, port) in [("10.0.0.1", 0), ("", 9000)] {
        let err = server.register("echo", host, port).await.unwrap_err();
        assert!(matches!(err, RegistryError::Codec(_)), "{err}");
    }
    assert!(!cluster.exists("/rpc/echo"));
    assert_eq!(dialer.dial_count(), 0);

    // a valid address still registers and resolves
    server.register("echo", "10.0.0.1", 9000).await?;
    let consumer = client(&cluster, &dialer, "/rpc").await;
    assert_eq!(consumer.resolve("echo").await?.len(), 1);

    server.close().await;
    consumer.close().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_timeout() {
    let cluster = MemoryCluster::new();
    cluster.set_unreachable(true);
    let err = RegistryClient::connect(
        config("/rpc").with_session_timeout(Duration::from_millis(50)),
        &cluster,
        FakeDialer::new(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, RegistryError::Connect(_)), "{err}");
}

#[tokio::test]
async fn test_held_connections_survive_invalidation() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server_a = client(&cluster, &dialer, "/rpc").await;
    let server_b = client(&cluster, &dialer, "/rpc").await;
    let consumer = client(&cluster, &dialer, "/rpc").await;
    server_a.register("echo", "10.0.0.1", 9000).await?;

    let held = consumer.get_connections("echo").await?;
    assert_eq!(held.len(), 1);

    // a membership change invalidates the consumer's cached set
    server_b.register("echo", "10.0.0.2", 9000).await?;
    let mut rx = consumer.watch("echo").await?;
    tokio::time::timeout(WAIT, rx.wait_for(|s| s.addresses.len() == 2)).await??;
    assert_eq!(consumer.get_connections("echo").await?.len(), 2);

    // the handle taken before the change is still open
    assert_eq!(held[0].channel().target(), &Address::new("10.0.0.1", 9000));
    let open = dialer.open_connections();
    drop(held);
    assert_eq!(dialer.open_connections(), open - 1);
    Ok(())
}

#[tokio::test]
async fn test_unreachable_instance_skipped() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let a = client(&cluster, &dialer, "/rpc").await;
    let b = client(&cluster, &dialer, "/rpc").await;
    a.register("echo", "10.0.0.1", 9000).await?;
    b.register("echo", "10.0.0.2", 9000).await?;
    dialer.fail(Address::new("10.0.0.1", 9000));

    let consumer = client(&cluster, &dialer, "/rpc").await;
    let conns = consumer.get_connections("echo").await?;
    assert_eq!(conns.len(), 1);
    assert_eq!(conns[0].address(), &Address::new("10.0.0.2", 9000));
    Ok(())
}

#[tokio::test]
async fn test_ipv6_registration() -> Result<()> {
    let cluster = MemoryCluster::new();
    let dialer = FakeDialer::new();
    let server = client(&cluster, &dialer, "/").await;
    let reg = server.register("echo", "::1", 9000).await?;
    assert!(reg.node.starts_with("/echo/__1_9000_"));
    assert_eq!(cluster.data(&reg.node).unwrap(), b"[::1]:9000");

    let consumer = client(&cluster, &dialer, "/").await;
    let conns = consumer.get_connections("echo").await?;
    assert_eq!(conns[0].address(), &Address::new("::1", 9000));
    Ok(())
}
