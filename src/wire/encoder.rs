use std::{error, fmt, io};

use bytes::{BufMut, Bytes};
use serde::ser;
use tokio_util::codec;

use super::protocol::Response;

// An encoder producing server replies in wire format.
#[derive(Debug, Default)]
pub struct Encoder {}

impl codec::Encoder<Response> for Encoder {
    type Error = Error;

    fn encode(
        &mut self,
        item: Response,
        dst: &mut bytes::BytesMut,
    ) -> Result<(), Self::Error> {
        use Response::*;

        fn put_verb_args(dst: &mut bytes::BytesMut, verb: &[u8], args: &[u64]) {
            //! Writes `"{verb} {args[0]} {args[1]} ...\r\n"` to `dst`.
            // u64::MAX is 20 digits, plus a separating space
            dst.reserve(verb.len() + args.len() * 21 + 2);

            dst.put_slice(verb);
            for arg in args {
                dst.put_slice(b" ");
                dst.put_slice(arg.to_string().as_bytes());
            }
            dst.put_slice(b"\r\n");
        }

        fn put_job(
            dst: &mut bytes::BytesMut,
            verb: &[u8],
            id: u64,
            pri: u32,
            body: Bytes,
        ) {
            //! Writes `"{verb} {id} {pri} {body.len()}\r\n{body}\r\n"`.
            put_verb_args(dst, verb, &[id, pri as u64, body.len() as u64]);
            dst.reserve(body.len() + 2);
            dst.extend(body);
            dst.put_slice(b"\r\n");
        }

        fn put_ok_and_data(
            dst: &mut bytes::BytesMut,
            data: impl ser::Serialize,
        ) -> serde_yaml::Result<()> {
            //! Serialises data into dst as `OK {data.len()}\r\n{data}\r\n`.
            //! On serialisation failure, sends an internal error to the
            //! client and returns the error.
            match serde_yaml::to_string(&data) {
                Ok(data) => {
                    let data = data.into_bytes();

                    put_verb_args(dst, b"OK", &[data.len() as u64]);
                    dst.reserve(data.len() + 2);
                    dst.extend(data);
                    dst.put_slice(b"\r\n");

                    Ok(())
                },
                Err(err) => {
                    dst.put_slice(b"SERVER_ERROR 1 internal error\r\n");
                    Err(err)
                },
            }
        }

        Ok(match item {
            OutOfMemory => dst.put_slice(b"SERVER_ERROR 0 out of memory\r\n"),
            InternalError => {
                dst.put_slice(b"SERVER_ERROR 1 internal error\r\n")
            },
            Draining => dst.put_slice(b"SERVER_ERROR 2 draining\r\n"),
            BadFormat => {
                dst.put_slice(b"CLIENT_ERROR 0 bad command line format\r\n")
            },
            UnknownCommand => {
                dst.put_slice(b"CLIENT_ERROR 1 unknown command\r\n")
            },
            ExpectedCrlf => dst.put_slice(
                b"CLIENT_ERROR 2 expected CR-LF after job body\r\n",
            ),
            JobTooBig => dst.put_slice(b"CLIENT_ERROR 3 job too big\r\n"),

            Buried => dst.put_slice(b"BURIED\r\n"),
            Deleted => dst.put_slice(b"DELETED\r\n"),
            NotFound => dst.put_slice(b"NOT_FOUND\r\n"),
            Released => dst.put_slice(b"RELEASED\r\n"),

            BuriedId { id } => put_verb_args(dst, b"BURIED", &[id]),
            Inserted { id } => put_verb_args(dst, b"INSERTED", &[id]),
            Kicked { count } => put_verb_args(dst, b"KICKED", &[count]),

            Reserved { id, pri, body } => {
                put_job(dst, b"RESERVED", id, pri, body)
            },
            Found { id, pri, body } => put_job(dst, b"FOUND", id, pri, body),

            OkStats { data } => put_ok_and_data(dst, data)?,
            OkStatsJob { data } => put_ok_and_data(dst, data)?,
        })
    }
}

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    Serde(serde_yaml::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Serde(value)
    }
}
