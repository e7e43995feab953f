//! Add client - calls the `add_server` example.
//!
//! This example demonstrates:
//! - A blocking call
//! - A future-based call
//! - A call through a named service signature
//!
//! # Running
//!
//! ```text
//! cargo run --example add_server -- 127.0.0.1:8848
//! cargo run --example add_client -- 127.0.0.1:8848
//! ```

use wirecall::marshal::{TypeDesc, Value};
use wirecall::{Client, PollManager, Signature};

const ADD: i32 = 1987;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8848".to_string());

    let poll = PollManager::new()?;
    let client = Client::connect(&poll, &addr)?;

    let ints = [TypeDesc::I32, TypeDesc::I32];
    let result = client.sync_call(ADD, &[Value::I32(3), Value::I32(4)], &ints, &[TypeDesc::I32])?;
    println!("3 + 4 -> {:?} ({})", result.results, result.error_message());

    let future = client.async_call(ADD, &[Value::I32(40), Value::I32(2)], &ints, &[TypeDesc::I32])?;
    let result = future.into_result()?;
    println!("40 + 2 -> {:?}", result.results);

    let mul = Signature::named("Math.mul", &[TypeDesc::I64, TypeDesc::I64], &[TypeDesc::I64]);
    let result = client.call(&mul, &[Value::I64(1 << 20), Value::I64(1 << 20)])?;
    println!("2^20 * 2^20 -> {:?}", result.results);

    let result = client.sync_call(0x5eed, &[], &[], &[])?;
    println!("unregistered call -> {}", result.error_message());

    client.close();
    Ok(())
}
