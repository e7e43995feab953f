//! Add server - answers the `add` call on a TCP port.
//!
//! This example demonstrates:
//! - Starting a poll manager and a server
//! - Registering a handler under a fixed call ID
//! - Registering a named service
//!
//! # Running
//!
//! ```text
//! RUST_LOG=wirecall=debug cargo run --example add_server -- 127.0.0.1:8848
//! cargo run --example add_client -- 127.0.0.1:8848
//! ```

use wirecall::marshal::{TypeDesc, Value};
use wirecall::{PollManager, Server, ServiceDescriptor};

/// Call ID the client uses for `add`.
const ADD: i32 = 1987;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8848".to_string());

    let poll = PollManager::new()?;

    let math = ServiceDescriptor::new("Math").method(
        "mul",
        &[TypeDesc::I64, TypeDesc::I64],
        &[TypeDesc::I64],
        |args: Vec<Value>| {
            let a = args[0].as_i64().unwrap_or_default();
            let b = args[1].as_i64().unwrap_or_default();
            Ok(vec![Value::I64(a.wrapping_mul(b))])
        },
    );
    let server = Server::builder().service(math).build(&poll)?;

    server.reg_func(
        ADD,
        &[TypeDesc::I32, TypeDesc::I32],
        &[TypeDesc::I32],
        |args: Vec<Value>| {
            let a = args[0].as_i32().unwrap_or_default();
            let b = args[1].as_i32().unwrap_or_default();
            Ok(vec![Value::I32(a.wrapping_add(b))])
        },
    )?;

    let bound = server.start(&addr)?;
    println!("listening on {}", bound);

    // Serve until killed.
    loop {
        std::thread::park();
    }
}
