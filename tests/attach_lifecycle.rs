//! Attach/detach lifecycle against real ptys and real listening sockets.
//!
//! Each test uses its own port range so the suite can run in parallel.

mod common;

use std::collections::HashSet;
use std::time::Duration;

use common::{cat_registry, options_with, port_is_free, wait_until};
use futures::FutureExt;
use lxcterm::reaper::{Reaper, ReaperStrategy};
use lxcterm::registry::{AttachError, DetachError, SessionRegistry};
use lxcterm::session::SessionOptions;

#[tokio::test]
async fn attach_returns_port_in_range_until_detach() {
    let registry = cat_registry(61000..=61009);

    let info = registry.attach("web01").await.unwrap();
    assert_eq!(info.container_name, "web01");
    assert!((61000..=61009).contains(&info.port));
    assert!(registry.is_attached("web01"));
    assert!(!port_is_free(info.port), "session listener should hold the port");

    registry.detach("web01").await.unwrap();
    assert!(!registry.is_attached("web01"));
    assert_eq!(registry.bound_ports(), 0);
    assert!(port_is_free(info.port), "port should be free after detach");
}

#[tokio::test]
async fn concurrent_attach_same_unit_yields_one_session() {
    let registry = cat_registry(61010..=61019);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.attach("db01").await })
        })
        .collect();

    let mut ok = 0;
    let mut duplicate = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(AttachError::AlreadyAttached(name)) => {
                assert_eq!(name, "db01");
                duplicate += 1;
            }
            Err(other) => panic!("unexpected attach error: {other}"),
        }
    }
    assert_eq!(ok, 1);
    assert_eq!(duplicate, 7);
    assert_eq!(registry.bound_ports(), 1);

    registry.detach("db01").await.unwrap();
    assert_eq!(registry.bound_ports(), 0);
}

#[tokio::test]
async fn concurrent_attach_distinct_units_get_distinct_ports() {
    let registry = cat_registry(61020..=61029);

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.attach(&format!("unit{i}")).await })
        })
        .collect();

    let mut ports = HashSet::new();
    for handle in handles {
        let info = handle.await.unwrap().unwrap();
        assert!((61020..=61029).contains(&info.port));
        assert!(ports.insert(info.port), "port {} handed out twice", info.port);
    }
    assert_eq!(registry.len(), 10);

    registry.drain().await;
    assert_eq!(registry.bound_ports(), 0);
}

#[tokio::test]
async fn exhausted_pool_recovers_after_detach() {
    let registry = cat_registry(61030..=61031);

    registry.attach("a").await.unwrap();
    registry.attach("b").await.unwrap();

    let err = registry.attach("c").await.unwrap_err();
    assert!(matches!(err, AttachError::Exhausted(_)), "got {err}");
    assert!(!registry.is_attached("c"));
    assert_eq!(registry.bound_ports(), 2);

    registry.detach("a").await.unwrap();
    let info = registry.attach("c").await.unwrap();
    assert!((61030..=61031).contains(&info.port));

    registry.drain().await;
}

#[tokio::test]
async fn detach_twice_is_not_found() {
    let registry = cat_registry(61040..=61041);

    registry.attach("web").await.unwrap();
    registry.detach("web").await.unwrap();

    assert_eq!(
        registry.detach("web").await,
        Err(DetachError::NotFound("web".into()))
    );
    assert_eq!(registry.bound_ports(), 0);
}

#[tokio::test]
async fn freed_port_can_be_reused_by_another_unit() {
    let registry = cat_registry(61050..=61050);

    let first = registry.attach("one").await.unwrap();
    registry.detach("one").await.unwrap();
    let second = registry.attach("two").await.unwrap();
    assert_eq!(first.port, second.port);

    registry.drain().await;
}

#[tokio::test]
async fn process_exit_detaches_implicitly() {
    let registry = SessionRegistry::new(
        options_with("sh", &["-c", "sleep 0.2; exit 0"]),
        61060..=61061,
        Reaper::disabled(),
    );

    let info = registry.attach("shortlived").await.unwrap();
    assert!(registry.is_attached("shortlived"));

    let detached = wait_until(Duration::from_secs(5), || !registry.is_attached("shortlived")).await;
    assert!(detached, "session should end when its process exits");

    let released = wait_until(Duration::from_secs(5), || registry.bound_ports() == 0).await;
    assert!(released, "port should return to the pool");
    assert!(port_is_free(info.port));

    // The unit can be attached again afterwards.
    registry.attach("shortlived").await.unwrap();
    registry.drain().await;
}

#[tokio::test]
async fn spawn_failure_releases_port() {
    let registry = SessionRegistry::new(
        options_with("/nonexistent/lxc-attach", &[]),
        61070..=61070,
        Reaper::disabled(),
    );

    let err = registry.attach("web").await.unwrap_err();
    assert!(matches!(err, AttachError::Open(_)), "got {err}");
    assert!(!registry.is_attached("web"));
    assert_eq!(registry.bound_ports(), 0);
}

#[tokio::test]
async fn listener_bind_failure_releases_port() {
    let _squatter = std::net::TcpListener::bind("127.0.0.1:61080").unwrap();
    let registry = cat_registry(61080..=61080);

    let err = registry.attach("web").await.unwrap_err();
    assert!(matches!(err, AttachError::Open(_)), "got {err}");
    assert_eq!(registry.bound_ports(), 0);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn idle_session_is_detached() {
    let registry = SessionRegistry::new(
        SessionOptions {
            idle_timeout: Some(Duration::from_millis(300)),
            ..options_with("cat", &[])
        },
        61090..=61091,
        Reaper::disabled(),
    );

    registry.attach("quiet").await.unwrap();
    let detached = wait_until(Duration::from_secs(5), || !registry.is_attached("quiet")).await;
    assert!(detached, "idle session should be torn down");
    let released = wait_until(Duration::from_secs(5), || registry.bound_ports() == 0).await;
    assert!(released);
}

#[tokio::test]
async fn list_reports_attached_sessions_sorted() {
    let registry = cat_registry(61100..=61104);

    registry.attach("zeta").await.unwrap();
    registry.attach("alpha").await.unwrap();

    let names: Vec<_> = registry
        .list()
        .into_iter()
        .map(|s| s.container_name)
        .collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
    assert!(registry.list().iter().all(|s| s.viewers == 0 && s.pid.is_some()));

    registry.drain().await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn drain_refuses_new_attaches() {
    let registry = cat_registry(61110..=61111);
    registry.attach("web").await.unwrap();

    registry.drain().await;
    assert!(!registry.is_attached("web"));
    assert!(matches!(
        registry.attach("db").await,
        Err(AttachError::ShuttingDown)
    ));
    assert_eq!(registry.bound_ports(), 0);
}

#[tokio::test]
async fn proc_reaper_leaves_the_service_alive() {
    let registry = SessionRegistry::new(
        options_with("cat", &[]),
        61120..=61121,
        Reaper::from_strategy(ReaperStrategy::Proc),
    );

    let info = registry.attach("web").await.unwrap();
    registry.detach("web").await.unwrap();
    assert!(port_is_free(info.port));

    // Still running, and still able to attach.
    registry.attach("web").await.unwrap();
    registry.drain().await;
}

#[tokio::test]
async fn abandoned_attach_call_still_settles() {
    let registry = cat_registry(61130..=61130);

    // Poll once, then drop the future while the pty is still spawning.
    assert!(registry.attach("web").now_or_never().is_none());

    assert!(wait_until(Duration::from_secs(5), || registry.is_attached("web")).await);
    registry.detach("web").await.unwrap();
    assert_eq!(registry.bound_ports(), 0);

    let info = registry.attach("web").await.unwrap();
    assert_eq!(info.port, 61130);
    registry.drain().await;
}

#[tokio::test]
async fn abandoned_detach_call_still_frees_port() {
    let registry = cat_registry(61140..=61140);
    let info = registry.attach("web").await.unwrap();

    assert!(registry.detach("web").now_or_never().is_none());
    assert!(!registry.is_attached("web"));

    assert!(wait_until(Duration::from_secs(5), || registry.bound_ports() == 0).await);
    assert!(port_is_free(info.port));
    let other = registry.attach("other").await.unwrap();
    assert_eq!(other.port, 61140);
    registry.drain().await;
}
