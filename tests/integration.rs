//! End-to-end tests over loopback TCP.
//!
//! Every test runs its own poll manager, server and client.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use wirecall::errno;
use wirecall::marshal::{StructValue, TypeDesc, TypeRegistry, Value};
use wirecall::{
    CallResult, Client, ClientConfig, ClientPool, HandlerResult, PollManager, RpcError, Server,
    ServiceDescriptor,
};

const ADD: i32 = 1987;
const SLEEP: i32 = 7;
const INTS: &[TypeDesc] = &[TypeDesc::I32, TypeDesc::I32];
const INT: &[TypeDesc] = &[TypeDesc::I32];
const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn add(args: Vec<Value>) -> HandlerResult {
    let a = args[0].as_i32().unwrap_or_default();
    let b = args[1].as_i32().unwrap_or_default();
    Ok(vec![Value::I32(a.wrapping_add(b))])
}

/// Sleeps for `args[0]` milliseconds and echoes it back.
fn sleep(args: Vec<Value>) -> HandlerResult {
    let ms = args[0].as_i32().unwrap_or_default();
    thread::sleep(Duration::from_millis(ms as u64));
    Ok(vec![Value::I32(ms)])
}

struct Fixture {
    poll: PollManager,
    server: Server,
    addr: String,
}

impl Fixture {
    fn new() -> Self {
        Self::with_registry(TypeRegistry::new())
    }

    fn with_registry(registry: TypeRegistry) -> Self {
        init_tracing();
        let poll = PollManager::new().unwrap();
        let server = Server::builder().registry(registry).build(&poll).unwrap();
        server.reg_func(ADD, INTS, INT, add).unwrap();
        server.reg_func(SLEEP, INT, INT, sleep).unwrap();
        let addr = server.start("127.0.0.1:0").unwrap().to_string();
        Self { poll, server, addr }
    }

    fn client(&self) -> Client {
        Client::connect(&self.poll, &self.addr).unwrap()
    }
}

fn ints(values: &[i32]) -> Vec<Value> {
    values.iter().copied().map(Value::I32).collect()
}

#[test]
fn test_sync_add() {
    let fx = Fixture::new();
    let client = fx.client();

    let result = client.sync_call(ADD, &ints(&[3, 4]), INTS, INT).unwrap();
    assert_eq!(result, CallResult::ok(vec![Value::I32(7)]));
    assert!(result.is_ok());
}

#[test]
fn test_sequential_calls_leave_nothing_pending() {
    let fx = Fixture::new();
    let client = fx.client();

    for i in 0..1000 {
        let result = client.sync_call(ADD, &ints(&[i, 1]), INTS, INT).unwrap();
        assert_eq!(result.results, vec![Value::I32(i + 1)]);
    }
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.pending_callbacks(), 0);
}

#[test]
fn test_concurrent_callers_share_a_client() {
    let fx = Fixture::new();
    let client = Arc::new(fx.client());

    let workers: Vec<_> = (0..8)
        .map(|t| {
            let client = client.clone();
            thread::spawn(move || {
                for i in 0..100 {
                    let result = client.sync_call(ADD, &ints(&[t * 1000, i]), INTS, INT).unwrap();
                    assert_eq!(result.results, vec![Value::I32(t * 1000 + i)]);
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(client.pending_calls(), 0);
}

#[test]
fn test_callbacks_follow_reply_order() {
    let fx = Fixture::new();
    let client = fx.client();
    let (tx, rx) = mpsc::channel();

    let slow_tx = tx.clone();
    client
        .async_call_with_callback(SLEEP, &ints(&[300]), INT, INT, move |r| {
            let _ = slow_tx.send(("slow", r));
        })
        .unwrap();
    client
        .async_call_with_callback(ADD, &ints(&[1, 2]), INTS, INT, move |r| {
            let _ = tx.send(("fast", r));
        })
        .unwrap();

    let (first, first_result) = rx.recv_timeout(WAIT).unwrap();
    let (second, second_result) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(first, "fast");
    assert_eq!(first_result.results, vec![Value::I32(3)]);
    assert_eq!(second, "slow");
    assert_eq!(second_result.results, vec![Value::I32(300)]);
}

#[test]
fn test_callback_runs_on_delivery_thread() {
    let fx = Fixture::new();
    let client = fx.client();
    let (tx, rx) = mpsc::channel();

    client
        .async_call_with_callback(ADD, &ints(&[1, 1]), INTS, INT, move |_| {
            let _ = tx.send(thread::current().name().map(str::to_string));
        })
        .unwrap();

    let name = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(name.as_deref(), Some("wirecall-delivery"));
}

#[test]
fn test_future_and_callback_see_the_same_outcome() {
    let fx = Fixture::new();
    let client = fx.client();
    let (tx, rx) = mpsc::channel();

    let future = client
        .async_call_with_callback(ADD, &ints(&[20, 22]), INTS, INT, move |r| {
            let _ = tx.send(r);
        })
        .unwrap();

    let from_callback = rx.recv_timeout(WAIT).unwrap();
    let from_future = future.into_result().unwrap();
    assert_eq!(from_callback, from_future);
    assert_eq!(from_future.results, vec![Value::I32(42)]);
}

#[test]
fn test_take_reply_once() {
    let fx = Fixture::new();
    let client = fx.client();

    let future = client.async_call(ADD, &ints(&[5, 6]), INTS, INT).unwrap();
    let mut reply = future.take_reply().unwrap().unwrap();
    assert_eq!(reply.read_i32().unwrap(), 11);
    assert!(reply.is_empty());

    assert!(matches!(future.take_reply(), Err(RpcError::ReplyTaken)));
    assert!(matches!(future.into_result(), Err(RpcError::ReplyTaken)));
}

#[test]
fn test_unknown_call_id() {
    let fx = Fixture::new();
    let client = fx.client();

    let result = client.sync_call(0x0bad, &[], &[], INT).unwrap();
    assert_eq!(result.error_code, errno::ENOENT);
    assert!(result.results.is_empty());

    // The connection survives.
    let result = client.sync_call(ADD, &ints(&[1, 1]), INTS, INT).unwrap();
    assert!(result.is_ok());
}

#[test]
fn test_handler_error_and_panic() {
    let fx = Fixture::new();
    fx.server
        .reg_func(100, &[], INT, |_: Vec<Value>| -> HandlerResult {
            Err("no quota left".into())
        })
        .unwrap();
    fx.server
        .reg_func(101, &[], INT, |_: Vec<Value>| -> HandlerResult {
            panic!("handler bug")
        })
        .unwrap();
    let client = fx.client();

    let failed = client.sync_call(100, &[], &[], INT).unwrap();
    assert_eq!(failed.error_code, errno::EREMOTEIO);

    let panicked = client.sync_call(101, &[], &[], INT).unwrap();
    assert_eq!(panicked.error_code, errno::EREMOTEIO);
    assert_eq!(panicked.error_message(), errno::describe(errno::EREMOTEIO));

    let result = client.sync_call(ADD, &ints(&[2, 2]), INTS, INT).unwrap();
    assert_eq!(result.results, vec![Value::I32(4)]);
}

#[test]
fn test_short_arguments_are_rejected() {
    let fx = Fixture::new();
    let client = fx.client();

    // One i32 where the handler expects two.
    let result = client.sync_call(ADD, &ints(&[3]), INT, INT).unwrap();
    assert_eq!(result.error_code, errno::EINVAL);

    // Later calls on the same connection are unaffected.
    let result = client.sync_call(ADD, &ints(&[2, 2]), INTS, INT).unwrap();
    assert_eq!(result, CallResult::ok(vec![Value::I32(4)]));
}

#[test]
fn test_reply_not_matching_result_types() {
    let fx = Fixture::new();
    let client = fx.client();

    // The server replies with one i32; reading it as a string fails.
    let result = client
        .sync_call(ADD, &ints(&[1, 2]), INTS, &[TypeDesc::Str])
        .unwrap();
    assert_eq!(result.error_code, errno::EBADMSG);

    let result = client.sync_call(ADD, &ints(&[2, 2]), INTS, INT).unwrap();
    assert_eq!(result, CallResult::ok(vec![Value::I32(4)]));
}

#[test]
fn test_struct_arguments() {
    let registry = TypeRegistry::new()
        .with_struct(
            "vec3",
            &[
                ("x", TypeDesc::Double),
                ("y", TypeDesc::Double),
                ("z", TypeDesc::Double),
            ],
        )
        .unwrap();
    let fx = Fixture::with_registry(registry.clone());

    let vec3 = TypeDesc::structure("vec3");
    fx.server
        .reg_func(
            200,
            &[vec3.clone(), vec3.clone()],
            &[TypeDesc::Double],
            |args: Vec<Value>| -> HandlerResult {
                let coords = |v: &Value| -> Vec<f64> {
                    let s = v.as_struct().cloned().unwrap_or_else(|| StructValue::new("vec3"));
                    ["x", "y", "z"]
                        .iter()
                        .map(|f| s.get(f).and_then(Value::as_f64).unwrap_or_default())
                        .collect()
                };
                let a = coords(&args[0]);
                let b = coords(&args[1]);
                let dot = a.iter().zip(&b).map(|(x, y)| x * y).sum::<f64>();
                Ok(vec![Value::Double(dot)])
            },
        )
        .unwrap();

    let client = Client::builder()
        .registry(registry)
        .connect(&fx.poll, &fx.addr)
        .unwrap();

    let point = |x: f64, y: f64, z: f64| {
        Value::from(StructValue::new("vec3").field("x", x).field("y", y).field("z", z))
    };
    let result = client
        .sync_call(
            200,
            &[point(1.0, 2.0, 3.0), point(4.0, 5.0, 6.0)],
            &[vec3.clone(), vec3],
            &[TypeDesc::Double],
        )
        .unwrap();
    assert_eq!(result.results, vec![Value::Double(32.0)]);
}

#[test]
fn test_services_by_name() {
    init_tracing();
    let poll = PollManager::new().unwrap();
    let math = ServiceDescriptor::new("Math")
        .method("add", INTS, INT, add)
        .method("echo", &[TypeDesc::Str], &[TypeDesc::Str], |args: Vec<Value>| {
            Ok(args)
        });
    let add_sig = math.signature("add").cloned().unwrap();
    let echo_sig = math.signature("echo").cloned().unwrap();
    assert_eq!(add_sig.call_id, wirecall::call_id("Math.add"));

    let server = Server::builder().service(math).build(&poll).unwrap();
    let addr = server.start("127.0.0.1:0").unwrap();
    let client = Client::connect(&poll, &addr.to_string()).unwrap();

    let sum = client.call(&add_sig, &ints(&[40, 2])).unwrap();
    assert_eq!(sum.results, vec![Value::I32(42)]);

    let echoed = client.call(&echo_sig, &[Value::from("héllo")]).unwrap();
    assert_eq!(echoed.results, vec![Value::from("héllo")]);
}

#[test]
fn test_reg_svc_is_all_or_nothing() {
    let fx = Fixture::new();
    fx.server
        .reg_func(wirecall::call_id("Math.sub"), INTS, INT, add)
        .unwrap();

    let math = ServiceDescriptor::new("Math")
        .method("add", INTS, INT, add)
        .method("sub", INTS, INT, add);
    assert!(matches!(fx.server.reg_svc(&math), Err(RpcError::Config(_))));
    assert!(!fx.server.is_registered(wirecall::call_id("Math.add")));
}

#[test]
fn test_duplicate_registration_rejected() {
    let fx = Fixture::new();
    let err = fx.server.reg_func(ADD, INTS, INT, add).unwrap_err();
    assert!(matches!(err, RpcError::Config(_)));
}

#[test]
fn test_unreg_makes_call_unknown() {
    let fx = Fixture::new();
    let client = fx.client();

    assert!(fx.server.unreg(ADD));
    let result = client.sync_call(ADD, &ints(&[1, 2]), INTS, INT).unwrap();
    assert_eq!(result.error_code, errno::ENOENT);

    fx.server.reg_func(ADD, INTS, INT, add).unwrap();
    let result = client.sync_call(ADD, &ints(&[1, 2]), INTS, INT).unwrap();
    assert_eq!(result.results, vec![Value::I32(3)]);
}

#[test]
fn test_sync_call_timeout() {
    let fx = Fixture::new();
    let client = fx.client();

    let started = Instant::now();
    let result = client
        .sync_call_timeout(SLEEP, &ints(&[1000]), INT, INT, Duration::from_millis(100))
        .unwrap();
    assert_eq!(result.error_code, errno::ETIMEDOUT);
    assert!(started.elapsed() < Duration::from_millis(900));
    assert_eq!(client.pending_calls(), 0);

    // The late reply is dropped and the connection stays usable.
    let result = client.sync_call(ADD, &ints(&[1, 2]), INTS, INT).unwrap();
    assert_eq!(result.results, vec![Value::I32(3)]);
}

#[test]
fn test_configured_call_timeout() {
    let fx = Fixture::new();
    let client = Client::builder()
        .call_timeout(Duration::from_millis(100))
        .connect(&fx.poll, &fx.addr)
        .unwrap();

    let result = client.sync_call(SLEEP, &ints(&[1000]), INT, INT).unwrap();
    assert_eq!(result.error_code, errno::ETIMEDOUT);
}

#[test]
fn test_close_with_outstanding_calls() {
    let fx = Fixture::new();
    let client = fx.client();
    let invoked = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::channel();

    let plain = client.async_call(SLEEP, &ints(&[2000]), INT, INT).unwrap();
    let counter = invoked.clone();
    let with_callback = client
        .async_call_with_callback(SLEEP, &ints(&[2000]), INT, INT, move |r| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(r);
        })
        .unwrap();
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    client.close();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(plain.error_code(), Some(errno::EBADF));
    assert_eq!(with_callback.error_code(), Some(errno::EBADF));
    assert_eq!(client.pending_calls(), 0);
    assert_eq!(client.pending_callbacks(), 0);

    // The callback ran exactly once, before close returned.
    assert_eq!(rx.try_recv().unwrap(), CallResult::err(errno::EBADF));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(invoked.load(Ordering::SeqCst), 1);

    let late = client.async_call(ADD, &ints(&[1, 2]), INTS, INT).unwrap();
    assert_eq!(late.error_code(), Some(errno::ENOTCONN));
}

#[test]
fn test_server_stop_resets_outstanding_calls() {
    let fx = Fixture::new();
    let client = fx.client();

    let future = client.async_call(SLEEP, &ints(&[500]), INT, INT).unwrap();
    thread::sleep(Duration::from_millis(50));
    fx.server.stop();

    assert!(future.wait_timeout(WAIT));
    assert_eq!(future.error_code(), Some(errno::ECONNRESET));
    assert!(!client.is_connected());

    // Issued after the drop: fails at once, callback on this thread.
    let ran_inline = Arc::new(AtomicBool::new(false));
    let flag = ran_inline.clone();
    let caller = thread::current().id();
    let late = client
        .async_call_with_callback(ADD, &ints(&[1, 2]), INTS, INT, move |r| {
            assert_eq!(r.error_code, errno::ENOTCONN);
            flag.store(thread::current().id() == caller, Ordering::SeqCst);
        })
        .unwrap();
    assert!(ran_inline.load(Ordering::SeqCst));
    assert_eq!(late.error_code(), Some(errno::ENOTCONN));
}

#[test]
fn test_server_tracks_connections() {
    let fx = Fixture::new();
    let client = fx.client();
    client.sync_call(ADD, &ints(&[1, 2]), INTS, INT).unwrap();
    assert_eq!(fx.server.connection_count(), 1);

    client.close();
    let deadline = Instant::now() + WAIT;
    while fx.server.connection_count() != 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(fx.server.connection_count(), 0);
}

#[test]
fn test_client_pool() {
    let fx = Fixture::new();
    let pool = ClientPool::new(&fx.poll, TypeRegistry::new(), ClientConfig::default());

    let a = pool.get_client(&fx.addr).unwrap();
    let b = pool.get_client(&fx.addr).unwrap();
    assert!(Arc::ptr_eq(&a, &b));

    let result = b.sync_call(ADD, &ints(&[2, 3]), INTS, INT).unwrap();
    assert_eq!(result.results, vec![Value::I32(5)]);

    pool.close_all();
    assert!(pool.is_empty());
}

#[test]
fn test_connect_refused() {
    init_tracing();
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let poll = PollManager::new().unwrap();

    let err = Client::connect(&poll, &format!("127.0.0.1:{}", port)).unwrap_err();
    assert!(matches!(err, RpcError::Io(_)));
}

#[test]
fn test_config_from_json() {
    let config = wirecall::RpcConfig::from_json_str(
        r#"{ "poll": { "io_threads": 2 }, "client": { "call_timeout_ms": 250 } }"#,
    )
    .unwrap();

    let poll = PollManager::init(config.poll.clone()).unwrap();
    let server = Server::builder()
        .config(config.server.clone())
        .build(&poll)
        .unwrap();
    server.reg_func(SLEEP, INT, INT, sleep).unwrap();
    let addr = server.start("127.0.0.1:0").unwrap();

    let client = Client::builder()
        .config(config.client.clone())
        .connect(&poll, &addr.to_string())
        .unwrap();
    let result = client.sync_call(SLEEP, &ints(&[1000]), INT, INT).unwrap();
    assert_eq!(result.error_code, errno::ETIMEDOUT);
}
