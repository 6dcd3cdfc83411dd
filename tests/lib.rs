//! End-to-end tests over real endpoints: server/proxy pairs and the full
//! channel lifecycle, no process spawning.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use peerlink::channel::DESTROY_PEER_PROXY;
use peerlink::framing::{LengthPrefixedRead, LengthPrefixedWrite};
use peerlink::prelude::*;
use peerlink::protocol::{Frame, Request};
use peerlink::server::LIST_FUNCTIONS;
use peerlink::{args, kwargs, AuthKey};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn echo_server(name: &str) -> RpcServer {
    let server = RpcServer::spawn(name, Arc::new(InlineDispatcher)).unwrap();
    server.register_fn("echo", |args, _kwargs| async move {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    });
    server
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trip_then_connection_error_after_server_close() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = echo_server("echo");
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();

        let got = proxy.call("echo", args![42], kwargs![]).await.unwrap();
        assert_eq!(got, Value::Int(42));

        server.close().await;
        match proxy.call("echo", args![1], kwargs![]).await {
            Err(err) if err.is_disconnect() => {}
            other => panic!("expected a connection error, got {other:?}"),
        }
        proxy.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_function_errors_and_server_keeps_serving() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = echo_server("unknown");
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();

        match proxy.call("frobnicate", args![], kwargs![]).await {
            Err(RpcError::Remote(err)) => {
                assert!(err.is_unknown_function());
                assert_eq!(err.message, "unknown function call: frobnicate");
            }
            other => panic!("expected unknown function error, got {other:?}"),
        }

        // The miss was answered, not fatal: the next call still works.
        let got = proxy.call("echo", args!["still here"], kwargs![]).await.unwrap();
        assert_eq!(got.as_str(), Some("still here"));

        proxy.close().await;
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_error_is_re_raised_on_the_caller_side() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = RpcServer::spawn("boom", Arc::new(InlineDispatcher)).unwrap();
        server.register_fn("boom", |_args, _kwargs| async {
            Err(RemoteError::new("Boom", "exploded on purpose"))
        });
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();

        match proxy.call("boom", args![], kwargs![]).await {
            Err(RpcError::Remote(err)) => {
                assert_eq!(err.kind, "Boom");
                assert_eq!(err.message, "exploded on purpose");
            }
            other => panic!("expected Boom, got {other:?}"),
        }

        proxy.close().await;
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fire_and_forget_returns_early_and_eventually_applies() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let seen = Arc::new(AtomicI64::new(0));
        let server = RpcServer::spawn("fnf", Arc::new(InlineDispatcher)).unwrap();
        let sink = Arc::clone(&seen);
        server.register_fn("set", move |args, _kwargs| {
            let sink = Arc::clone(&sink);
            async move {
                sink.store(args[0].as_i64().unwrap_or(0), Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();

        proxy.call_no_response("set", args![7], kwargs![]).await.unwrap();
        wait_until("fire-and-forget effect", || seen.load(Ordering::SeqCst) == 7).await;

        proxy.close().await;
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn proxy_close_unblocks_a_waiting_call() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = RpcServer::spawn("slow", Arc::new(InlineDispatcher)).unwrap();
        server.register_fn("slow", |_args, _kwargs| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        });
        let proxy = Arc::new(
            RpcProxy::connect(server.address(), server.auth_key())
                .await
                .unwrap(),
        );

        let caller = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.call("slow", args![], kwargs![]).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        proxy.close().await;

        match caller.await.unwrap() {
            Err(RpcError::ClosedWhileWaiting) => {}
            other => panic!("expected ClosedWhileWaiting, got {other:?}"),
        }
        assert!(proxy.is_closed());

        // Calls after close fail without touching the wire.
        match proxy.call("slow", args![], kwargs![]).await {
            Err(RpcError::ProxyClosed) => {}
            other => panic!("expected ProxyClosed, got {other:?}"),
        }
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn server_close_unblocks_a_waiting_call() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = RpcServer::spawn("slow-close", Arc::new(InlineDispatcher)).unwrap();
        server.register_fn("slow", |_args, _kwargs| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(Value::Int(1))
        });
        let proxy = Arc::new(
            RpcProxy::connect(server.address(), server.auth_key())
                .await
                .unwrap(),
        );

        let caller = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.call("slow", args![], kwargs![]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Close waits for the in-flight handler, suppresses its response,
        // and drops the connection; the caller sees a closed connection,
        // never a stale value.
        server.close().await;

        match caller.await.unwrap() {
            Err(err) if err.is_disconnect() => {}
            other => panic!("expected a disconnect error, got {other:?}"),
        }
        proxy.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_auth_key_never_reaches_the_registry() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let touched = Arc::new(AtomicBool::new(false));
        let server = RpcServer::spawn("auth", Arc::new(InlineDispatcher)).unwrap();
        let flag = Arc::clone(&touched);
        server.register_fn("sensitive", move |_args, _kwargs| {
            let flag = Arc::clone(&flag);
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });

        match RpcProxy::connect(server.address(), &AuthKey::from("wrong-key")).await {
            Err(RpcError::AuthRejected) => {}
            other => panic!("expected AuthRejected, got {other:?}"),
        }
        assert!(!touched.load(Ordering::SeqCst));

        // The listener survives a rejected connection.
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();
        proxy.call("sensitive", args![], kwargs![]).await.unwrap();
        assert!(touched.load(Ordering::SeqCst));

        proxy.close().await;
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_on_one_proxy_each_get_their_own_result() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = RpcServer::spawn("shared", Arc::new(InlineDispatcher)).unwrap();
        server.register_fn("slowEcho", |args, _kwargs| async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        });
        let proxy = Arc::new(
            RpcProxy::connect(server.address(), server.auth_key())
                .await
                .unwrap(),
        );

        // Two tasks race on the same proxy; the internal lock serializes
        // them, so every response pairs with its own request.
        let mut callers = Vec::new();
        for base in [100i64, 200i64] {
            let proxy = Arc::clone(&proxy);
            callers.push(tokio::spawn(async move {
                for i in 0..5i64 {
                    let got = proxy
                        .call("slowEcho", args![base + i], kwargs![])
                        .await
                        .unwrap();
                    assert_eq!(got, Value::Int(base + i));
                }
            }));
        }
        for caller in callers {
            caller.await.unwrap();
        }

        proxy.close().await;
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn decode_failure_drops_one_message_and_the_server_keeps_serving() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = echo_server("garbage");

        // Raw framed connection so a corrupt payload can be injected
        // between two well-formed requests.
        let stream = parity_tokio_ipc::Endpoint::connect(server.address())
            .await
            .unwrap();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = LengthPrefixedRead::new(read_half);
        let mut writer = LengthPrefixedWrite::new(write_half);

        writer
            .write_msg(&Frame::Hello {
                auth_key: server.auth_key().as_str().to_string(),
            })
            .await
            .unwrap();
        match reader.read_msg::<Frame>().await.unwrap() {
            Frame::HelloOk => {}
            other => panic!("expected HelloOk, got {other:?}"),
        }

        // A well-framed payload that is not a valid frame.
        use tokio::io::AsyncWriteExt;
        writer.inner_mut().write_all(&3u32.to_le_bytes()).await.unwrap();
        writer.inner_mut().write_all(&[0xff, 0xff, 0xff]).await.unwrap();
        writer.inner_mut().flush().await.unwrap();

        writer
            .write_msg(&Frame::Request(Request::new("echo", args![5], kwargs![])))
            .await
            .unwrap();
        match reader.read_msg::<Frame>().await.unwrap() {
            Frame::Response(response) => {
                assert_eq!(response.into_result().unwrap(), Value::Int(5));
            }
            other => panic!("expected a response, got {other:?}"),
        }

        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxy_close_is_idempotent() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = echo_server("idem-proxy");
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();
        proxy.close().await;
        proxy.close().await;
        assert!(proxy.is_closed());
        server.close().await;
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_functions_is_remotely_callable() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let server = echo_server("introspect");
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();
        let got = proxy.call(LIST_FUNCTIONS, args![], kwargs![]).await.unwrap();
        let names: Vec<&str> = got
            .as_list()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert!(names.contains(&"echo"));
        assert!(names.contains(&LIST_FUNCTIONS));
        proxy.close().await;
        server.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_dispatcher_runs_requests_on_the_draining_task() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(10), async {
        let (dispatcher, mut queue) = peerlink::main_thread_queue();
        let main_loop = tokio::spawn(async move { queue.run_until_closed().await });

        let server = RpcServer::spawn("queued", Arc::new(dispatcher)).unwrap();
        server.register_fn("double", |args, _kwargs| async move {
            Ok(Value::Int(args[0].as_i64().unwrap_or(0) * 2))
        });
        let proxy = RpcProxy::connect(server.address(), server.auth_key())
            .await
            .unwrap();

        let got = proxy.call("double", args![21], kwargs![]).await.unwrap();
        assert_eq!(got, Value::Int(42));

        proxy.close().await;
        server.close().await;
        drop(server);
        main_loop.abort();
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn channel_lifecycle_connect_call_both_ways_and_disconnect() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(15), async {
        let site = PeerChannel::start("site", Arc::new(InlineDispatcher)).unwrap();
        let project = PeerChannel::start("project", Arc::new(InlineDispatcher)).unwrap();

        site.register_fn("siteName", |_args, _kwargs| async {
            Ok(Value::from("central"))
        });
        project.register_fn("projectName", |_args, _kwargs| async {
            Ok(Value::from("shot-042"))
        });

        assert!(!site.connected());
        match site.call("projectName", args![], kwargs![]).await {
            Err(RpcError::NotConnected) => {}
            other => panic!("expected NotConnected, got {other:?}"),
        }

        // Initiator side: the project's bootstrap pair arrived out-of-band.
        site.connect_to_peer(&project.bootstrap_info()).await.unwrap();
        assert!(site.connected());
        assert!(project.connected());

        let got = site.call("projectName", args![], kwargs![]).await.unwrap();
        assert_eq!(got.as_str(), Some("shot-042"));
        let got = project.call("siteName", args![], kwargs![]).await.unwrap();
        assert_eq!(got.as_str(), Some("central"));

        // Log forwarding is fire-and-forget and must not disturb calls.
        site.log_to_peer("info", "project opened", args!["shot-042"])
            .await
            .unwrap();
        let got = site.call("projectName", args![], kwargs![]).await.unwrap();
        assert_eq!(got.as_str(), Some("shot-042"));

        site.disconnect().await;
        assert!(!site.connected());
        wait_until("peer observed the disconnect", || !project.connected()).await;

        site.close().await;
        project.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn destroy_peer_proxy_keeps_the_server_available_for_reconnect() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(15), async {
        let site = PeerChannel::start("site-dpp", Arc::new(InlineDispatcher)).unwrap();
        let project = PeerChannel::start("project-dpp", Arc::new(InlineDispatcher)).unwrap();
        project.register_fn("projectName", |_args, _kwargs| async {
            Ok(Value::from("shot-007"))
        });

        site.connect_to_peer(&project.bootstrap_info()).await.unwrap();
        assert!(site.connected() && project.connected());

        // Only the reverse proxy goes away; unlike a disconnect, the
        // target's server stays up.
        site.call(DESTROY_PEER_PROXY, args![], kwargs![]).await.unwrap();
        wait_until("reverse proxy dropped", || !project.connected()).await;

        let got = site.call("projectName", args![], kwargs![]).await.unwrap();
        assert_eq!(got.as_str(), Some("shot-007"));

        // A fresh bootstrap restores both directions.
        site.disconnect().await;
        site.connect_to_peer(&project.bootstrap_info()).await.unwrap();
        assert!(site.connected());
        wait_until("reverse proxy rebuilt", || project.connected()).await;
        let got = site.call("projectName", args![], kwargs![]).await.unwrap();
        assert_eq!(got.as_str(), Some("shot-007"));

        site.close().await;
        project.close().await;
    })
    .await
    .expect("test timed out");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn teardown_completes_even_when_the_peer_is_already_gone() {
    init_tracing();
    tokio::time::timeout(Duration::from_secs(15), async {
        let site = PeerChannel::start("site-dead", Arc::new(InlineDispatcher)).unwrap();
        let project = PeerChannel::start("project-dead", Arc::new(InlineDispatcher)).unwrap();

        site.connect_to_peer(&project.bootstrap_info()).await.unwrap();
        assert!(site.connected() && project.connected());

        // The project process dies without saying goodbye.
        project.close().await;

        // Local teardown still completes; the failed notification is
        // logged and swallowed.
        site.disconnect().await;
        assert!(!site.connected());
        site.close().await;
    })
    .await
    .expect("test timed out");
}
