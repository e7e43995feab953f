//! Callbacks - completion callbacks on the delivery thread.
//!
//! This example demonstrates:
//! - Callbacks running in the order replies arrive, not the order calls
//!   were issued
//! - A call on a closed client failing with `ENOTCONN` inline
//!
//! Runs a server and a client in one process:
//!
//! ```text
//! RUST_LOG=wirecall=debug cargo run --example callbacks
//! ```

use std::sync::mpsc;
use std::time::Duration;

use wirecall::marshal::{TypeDesc, Value};
use wirecall::{Client, PollManager, Server};

const SLEEP: i32 = 1;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let poll = PollManager::builder().io_threads(2).build()?;
    let server = Server::builder().build(&poll)?;
    server.reg_func(SLEEP, &[TypeDesc::I32], &[TypeDesc::I32], |args: Vec<Value>| {
        let ms = args[0].as_i32().unwrap_or_default();
        std::thread::sleep(Duration::from_millis(ms as u64));
        Ok(vec![Value::I32(ms)])
    })?;
    let addr = server.start("127.0.0.1:0")?;

    let client = Client::connect(&poll, &addr.to_string())?;
    let (done_tx, done_rx) = mpsc::channel();

    for ms in [300, 100, 200] {
        let done_tx = done_tx.clone();
        client.async_call_with_callback(SLEEP, &[Value::I32(ms)], &[TypeDesc::I32], &[TypeDesc::I32], move |r| {
            println!(
                "slept {:?} on {}",
                r.results,
                std::thread::current().name().unwrap_or("?")
            );
            let _ = done_tx.send(());
        })?;
    }
    for _ in 0..3 {
        done_rx.recv_timeout(Duration::from_secs(5))?;
    }

    client.close();
    client.async_call_with_callback(SLEEP, &[Value::I32(0)], &[TypeDesc::I32], &[TypeDesc::I32], |r| {
        println!("after close: {}", r.error_message());
    })?;

    server.stop();
    Ok(())
}
