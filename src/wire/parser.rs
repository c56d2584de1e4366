use std::str::{self, FromStr};

use super::protocol::{Command, Response};

/// Parses one CRLF-stripped command line.
///
/// Tokens are separated by exactly one space; empty tokens, trailing
/// garbage, and non-decimal numeric fields are all `BadFormat`. A
/// well-formed line with an unrecognised first token is `UnknownCommand`.
/// The error value is the response to send before disconnecting.
impl TryFrom<&[u8]> for Command {
    type Error = Response;

    fn try_from(line: &[u8]) -> Result<Self, Response> {
        let line = str::from_utf8(line).map_err(|_| Response::BadFormat)?;
        if line.is_empty() {
            return Err(Response::BadFormat);
        }

        let mut tokens = line.split(' ');
        // Panic safety: split always yields at least one token.
        let name = tokens.next().unwrap();

        let cmd = match name {
            "put" => Command::Put {
                pri: arg(&mut tokens)?,
                delay: arg(&mut tokens)?,
                ttr: arg(&mut tokens)?,
                n_bytes: arg(&mut tokens)?,
            },
            "reserve" => Command::Reserve,
            "delete" => Command::Delete {
                id: arg(&mut tokens)?,
            },
            "release" => Command::Release {
                id: arg(&mut tokens)?,
                pri: arg(&mut tokens)?,
                delay: arg(&mut tokens)?,
            },
            "bury" => Command::Bury {
                id: arg(&mut tokens)?,
                pri: arg(&mut tokens)?,
            },
            "kick" => Command::Kick {
                bound: arg(&mut tokens)?,
            },
            // `peek` and `stats` take an optional job ID
            "peek" => match tokens.next() {
                None => Command::Peek,
                Some(raw) => Command::PeekJob { id: num(raw)? },
            },
            "stats" => match tokens.next() {
                None => Command::Stats,
                Some(raw) => Command::StatsJob { id: num(raw)? },
            },
            _ => return Err(Response::UnknownCommand),
        };

        match tokens.next() {
            Some(_) => Err(Response::BadFormat),
            None => Ok(cmd),
        }
    }
}

fn arg<'a, T, I>(tokens: &mut I) -> Result<T, Response>
where
    T: FromStr,
    I: Iterator<Item = &'a str>,
{
    num(tokens.next().ok_or(Response::BadFormat)?)
}

fn num<T: FromStr>(token: &str) -> Result<T, Response> {
    token.parse().map_err(|_| Response::BadFormat)
}
