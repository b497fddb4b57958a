use bytes::{BufMut, Bytes, BytesMut};
use itertools::Itertools;
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};
use thiserror::Error as ThisError;

use crate::frame::CRLF;

#[derive(Debug, ThisError, Clone, PartialEq)]
pub enum Error {
    #[error("command name is empty")]
    EmptyName,
    #[error("unknown command {0}")]
    UnknownCommand(String),
}

/// Commands with a well known name. Any other name can still be sent through [`Command::new`].
///
/// Ref: <https://redis.io/docs/latest/commands/>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, AsRefStr, Display, EnumIter, EnumString)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum CommandName {
    Append,
    DbSize,
    Decr,
    DecrBy,
    Del,
    Echo,
    Exists,
    Expire,
    FlushDb,
    Get,
    GetDel,
    GetRange,
    Incr,
    IncrBy,
    Info,
    Keys,
    Mget,
    Mset,
    Ping,
    Pttl,
    Select,
    Set,
    SetNx,
    SetRange,
    Strlen,
    Ttl,
    Type,
}

impl CommandName {
    pub fn parse(name: &str) -> Result<Self, Error> {
        CommandName::from_str(name).map_err(|_| Error::UnknownCommand(name.to_string()))
    }
}

/// A command ready to be written as one inline line: `NAME arg1 arg2\r\n`.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    name: String,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Command {
        Command {
            name: name.into(),
            args: vec![],
        }
    }

    pub fn from_name<I, A>(name: CommandName, args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        args.into_iter()
            .fold(Command::new(name.as_ref()), |cmd, arg| cmd.arg(arg))
    }

    /// Splits a line typed by a user on whitespace. No quoting is interpreted.
    pub fn parse_line(line: &str) -> Result<Command, Error> {
        let mut tokens = line.split_whitespace();
        let name = tokens.next().ok_or(Error::EmptyName)?;

        Ok(tokens.fold(Command::new(name), |cmd, token| cmd.arg(token)))
    }

    pub fn arg(mut self, arg: impl AsRef<[u8]>) -> Self {
        self.args.push(Bytes::copy_from_slice(arg.as_ref()));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.name.trim().is_empty() {
            return Err(Error::EmptyName);
        }
        Ok(())
    }

    /// Appends the inline encoding of the command, terminator included, to `dst`.
    pub fn write_line(&self, dst: &mut BytesMut) {
        write_token(dst, self.name.as_bytes());
        for arg in &self.args {
            dst.put_u8(b' ');
            write_token(dst, arg);
        }
        dst.extend_from_slice(CRLF);
    }

    pub fn to_line(&self) -> Bytes {
        let mut dst = BytesMut::new();
        self.write_line(&mut dst);
        dst.freeze()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args = self.args.iter().map(|arg| String::from_utf8_lossy(arg));
        let line = std::iter::once(Cow::Borrowed(self.name.as_str()))
            .chain(args)
            .join(" ");
        write!(f, "{}", line)
    }
}

// Inline commands are split on whitespace by the server, so tokens that would not survive that
// are sent double quoted with C-style escapes.
fn write_token(dst: &mut BytesMut, token: &[u8]) {
    if !needs_quotes(token) {
        dst.extend_from_slice(token);
        return;
    }

    dst.put_u8(b'"');
    for &byte in token {
        match byte {
            b'"' => dst.extend_from_slice(b"\\\""),
            b'\\' => dst.extend_from_slice(b"\\\\"),
            b'\n' => dst.extend_from_slice(b"\\n"),
            b'\r' => dst.extend_from_slice(b"\\r"),
            b'\t' => dst.extend_from_slice(b"\\t"),
            b' ' => dst.put_u8(b' '),
            byte if byte.is_ascii_graphic() => dst.put_u8(byte),
            byte => dst.extend_from_slice(format!("\\x{:02x}", byte).as_bytes()),
        }
    }
    dst.put_u8(b'"');
}

fn needs_quotes(token: &[u8]) -> bool {
    token.is_empty()
        || token
            .iter()
            .any(|&b| !b.is_ascii_graphic() || b == b'"' || b == b'\'' || b == b'\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn plain_tokens() {
        let cmd = Command::new("GET").arg("a");

        assert_eq!(cmd.to_line(), Bytes::from("GET a\r\n"));
    }

    #[test]
    fn no_args() {
        assert_eq!(Command::new("PING").to_line(), Bytes::from("PING\r\n"));
    }

    #[test]
    fn quotes_whitespace_and_empty_args() {
        let cmd = Command::new("SET").arg("greeting").arg("hello world");
        assert_eq!(
            cmd.to_line(),
            Bytes::from("SET greeting \"hello world\"\r\n")
        );

        let cmd = Command::new("SET").arg("empty").arg("");
        assert_eq!(cmd.to_line(), Bytes::from("SET empty \"\"\r\n"));
    }

    #[test]
    fn escapes_control_and_binary_bytes() {
        let cmd = Command::new("SET").arg("k").arg(b"a\r\nb\"c\\\x00\xff");

        assert_eq!(
            cmd.to_line(),
            Bytes::from("SET k \"a\\r\\nb\\\"c\\\\\\x00\\xff\"\r\n")
        );
    }

    #[test]
    fn single_quote_is_quoted() {
        let cmd = Command::new("SET").arg("k").arg("it's");

        assert_eq!(cmd.to_line(), Bytes::from("SET k \"it's\"\r\n"));
    }

    #[test]
    fn from_name() {
        let cmd = Command::from_name(CommandName::Keys, ["*"]);
        assert_eq!(cmd.to_line(), Bytes::from("KEYS *\r\n"));

        let cmd = Command::from_name(CommandName::IncrBy, ["counter", "5"]);
        assert_eq!(cmd.name(), "INCRBY");
        assert_eq!(cmd.args(), &[Bytes::from("counter"), Bytes::from("5")]);
    }

    #[test]
    fn parse_command_name() {
        assert_eq!(CommandName::parse("get"), Ok(CommandName::Get));
        assert_eq!(CommandName::parse("FlushDB"), Ok(CommandName::FlushDb));
        assert_eq!(
            CommandName::parse("nope"),
            Err(Error::UnknownCommand("nope".to_string()))
        );
    }

    #[test]
    fn command_names_are_upper_case() {
        for name in CommandName::iter() {
            let rendered = name.to_string();
            assert_eq!(rendered, rendered.to_uppercase());
            assert_eq!(CommandName::parse(&rendered), Ok(name));
        }
    }

    #[test]
    fn parse_line() {
        let cmd = Command::parse_line("  set  foo   bar ").unwrap();

        assert_eq!(cmd, Command::new("set").arg("foo").arg("bar"));
        assert_eq!(Command::parse_line("   "), Err(Error::EmptyName));
    }

    #[test]
    fn validate() {
        assert_eq!(Command::new("").validate(), Err(Error::EmptyName));
        assert_eq!(Command::new("PING").validate(), Ok(()));
    }

    #[test]
    fn display() {
        let cmd = Command::new("SET").arg("k").arg("v v");

        assert_eq!(cmd.to_string(), "SET k v v");
    }
}
