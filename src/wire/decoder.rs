use std::{error, fmt, io};

use bytes::Buf;
use itertools::Itertools;
use tokio_util::codec;

use super::events::ClientEvent;
use super::protocol::{Command, Response};

/// Command lines longer than this, including the CRLF, are rejected.
const MAX_CMD_LINE: usize = 224;

/// A decoder for a stream of client messages.
///
/// Client errors (overlong lines, unparseable commands, oversized or
/// unterminated job bodies) are unrecoverable at this layer: the stream may
/// be out of sync, so the error carries the response to send before the
/// connection is dropped.
#[derive(Debug)]
pub struct Decoder {
    max_job_size: u32,
    state: State,
}

#[derive(Debug)]
enum State {
    /// Waiting for a CRLF-terminated command line.
    Command,
    /// Waiting for the body of a `put`, plus its trailing CRLF.
    Body {
        pri: u32,
        delay: u32,
        ttr: u32,
        n_bytes: usize,
    },
}

impl Decoder {
    pub fn new(max_job_size: u32) -> Self {
        Self {
            max_job_size,
            state: State::Command,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = ClientEvent;

    type Error = Error;

    fn decode(
        &mut self,
        src: &mut bytes::BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // Loops so that a put header immediately consumes any body bytes
        // already buffered; returning None mid-buffer would stall the stream
        // until the peer sent more data.
        loop {
            match self.state {
                State::Command => {
                    // Scan for \r\n in the first MAX_CMD_LINE bytes. With
                    // src = b"abc\r\n" the windows are ab, bc, c\r, \r\n, so
                    // idx is 3, and idx != None implies src.len() >= idx + 2.
                    let found = src
                        .iter()
                        .take(MAX_CMD_LINE)
                        .tuple_windows()
                        .find_position(|&(&a, &b)| a == b'\r' && b == b'\n');

                    let Some((idx, _)) = found else {
                        return if src.len() >= MAX_CMD_LINE {
                            Err(Response::BadFormat.into())
                        } else {
                            Ok(None)
                        };
                    };

                    // Panic safety: split_to and advance are in bounds per
                    // the iterator form above.
                    let line = src.split_to(idx);
                    src.advance(2);

                    let cmd: Command = line.as_ref().try_into()?;

                    let Command::Put {
                        pri,
                        delay,
                        ttr,
                        n_bytes,
                    } = cmd
                    else {
                        return Ok(Some(ClientEvent::Command(cmd)));
                    };

                    if n_bytes > self.max_job_size {
                        return Err(Response::JobTooBig.into());
                    }

                    self.state = State::Body {
                        pri,
                        delay,
                        ttr,
                        n_bytes: n_bytes as usize,
                    };
                },
                State::Body {
                    pri,
                    delay,
                    ttr,
                    n_bytes,
                } => {
                    if src.len() < n_bytes + 2 {
                        src.reserve(n_bytes + 2 - src.len());
                        return Ok(None);
                    }

                    // Panic safety: indexing is in bounds as
                    // src.len() >= n_bytes + 2.
                    if src[n_bytes] != b'\r' || src[n_bytes + 1] != b'\n' {
                        return Err(Response::ExpectedCrlf.into());
                    }

                    let body = src.split_to(n_bytes).freeze();
                    src.advance(2);
                    self.state = State::Command;

                    return Ok(Some(ClientEvent::Put {
                        pri,
                        delay,
                        ttr,
                        body,
                    }));
                },
            }
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// The response to send to the client before disconnecting.
    Client(Response),
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<Response> for Error {
    fn from(value: Response) -> Self {
        Self::Client(value)
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}
