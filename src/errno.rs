//! Error codes carried in reply frames.
//!
//! Values follow Linux errno numbering on every platform so that both ends
//! of a connection read the same meaning out of a code.

/// Success.
pub const OK: i32 = 0;
/// No handler registered for the call ID.
pub const ENOENT: i32 = 2;
/// Client was closed with the call still outstanding.
pub const EBADF: i32 = 9;
/// Server could not decode the request arguments.
pub const EINVAL: i32 = 22;
/// Client could not decode the reply results.
pub const EBADMSG: i32 = 74;
/// Connection dropped with the call still outstanding.
pub const ECONNRESET: i32 = 104;
/// Call issued on a client without a live connection.
pub const ENOTCONN: i32 = 107;
/// Deadline elapsed before the reply arrived.
pub const ETIMEDOUT: i32 = 110;
/// Handler failed or panicked while serving the call.
pub const EREMOTEIO: i32 = 121;

/// Render a human-readable message for an error code.
pub fn describe(code: i32) -> String {
    let text = match code {
        OK => "success",
        ENOENT => "no handler registered for call ID",
        EBADF => "client closed",
        EINVAL => "invalid request arguments",
        EBADMSG => "malformed reply",
        ECONNRESET => "connection reset",
        ENOTCONN => "not connected",
        ETIMEDOUT => "call timed out",
        EREMOTEIO => "remote handler failed",
        other => return format!("error code {}", other),
    };
    text.to_string()
}
