//! # wirecall
//!
//! Schema-driven binary RPC over TCP.
//!
//! Calls are identified by a 32-bit call ID, usually derived from a
//! `"Service.method"` name with [`call_id`]. Arguments and results are
//! typed with [`marshal::TypeDesc`] lists that both ends agree on; structs
//! are registered by name in a [`marshal::TypeRegistry`] and travel as the
//! concatenation of their fields.
//!
//! ## Architecture
//!
//! - **Poll manager**: one shared I/O runtime per process. Every socket, the
//!   server accept loop and the server's handlers run on it.
//! - **Server**: maps call IDs to handlers. Each request is decoded, run on
//!   the blocking pool and answered with an error code and typed results.
//! - **Client**: one connection. Calls are blocking ([`Client::sync_call`]),
//!   future-based ([`Client::async_call`]) or callback-based
//!   ([`Client::async_call_with_callback`]); callbacks run on a dedicated
//!   delivery thread per client.
//!
//! Failures travel as POSIX errno values ([`errno`]): `ENOENT` for an
//! unknown call, `EINVAL` for undecodable arguments, `EREMOTEIO` for a
//! failed handler, `ECONNRESET` / `EBADF` / `ENOTCONN` / `ETIMEDOUT` for
//! connection trouble seen by the client.
//!
//! ## Example
//!
//! ```no_run
//! use wirecall::marshal::{TypeDesc, Value};
//! use wirecall::{Client, PollManager, Server, ServiceDescriptor};
//!
//! fn main() -> wirecall::Result<()> {
//!     let poll = PollManager::new()?;
//!
//!     let math = ServiceDescriptor::new("Math").method(
//!         "add",
//!         &[TypeDesc::I32, TypeDesc::I32],
//!         &[TypeDesc::I32],
//!         |args: Vec<Value>| {
//!             let a = args[0].as_i32().unwrap_or_default();
//!             let b = args[1].as_i32().unwrap_or_default();
//!             Ok(vec![Value::I32(a.wrapping_add(b))])
//!         },
//!     );
//!     let add = math.signature("add").cloned().unwrap();
//!
//!     let server = Server::builder().service(math).build(&poll)?;
//!     let addr = server.start("127.0.0.1:0")?;
//!
//!     let client = Client::connect(&poll, &addr.to_string())?;
//!     let result = client.call(&add, &[Value::I32(3), Value::I32(4)])?;
//!     assert_eq!(result.results, vec![Value::I32(7)]);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod errno;
pub mod error;
pub mod future;
pub mod marshal;
pub mod poll;
pub mod protocol;
pub mod server;
pub mod service;
pub mod writer;

pub use client::{Client, ClientBuilder, ClientPool};
pub use config::{ClientConfig, PollConfig, RpcConfig, ServerConfig};
pub use error::{HandlerError, Result, RpcError};
pub use future::{CallResult, Future};
pub use poll::{PollManager, PollManagerBuilder};
pub use server::{Handler, HandlerResult, Server, ServerBuilder};
pub use service::{call_id, MethodDescriptor, ServiceDescriptor, Signature};
