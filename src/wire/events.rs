use bytes::Bytes;

use super::protocol::Command;

/// A fully-decoded unit of client input.
///
/// `put` is special-cased: the decoder reads the declared body off the
/// stream and emits it here in one piece, so the dispatcher never sees a
/// half-received job.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClientEvent {
    /// Any command other than `put`.
    Command(Command),
    /// A `put` command together with its body (CRLF framing stripped).
    Put {
        pri: u32,
        delay: u32,
        ttr: u32,
        body: Bytes,
    },
}
