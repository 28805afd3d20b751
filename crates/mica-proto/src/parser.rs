//! Incremental command parser.
//!
//! `parse` is a pure function of the buffer contents and a start offset:
//! it either produces a command (with the offset just past it), an error
//! reply with the offset past the next newline, a request for more input
//! (nothing consumed; the caller reads and re-invokes with the same
//! cursor), or a verdict that the peer is sending trash and the
//! connection should be dropped.

use bytes::Bytes;

use mica_buffer::SegBuf;

use crate::command::{DataRef, Request, StoreOp};
use crate::{JUNK_LIMIT, KEY_LEN_MAX};

/// Outcome of one parse attempt.
#[derive(Debug)]
pub enum Parsed {
    /// A complete command; `end` is the offset just past it (including
    /// any data block and line terminator).
    Cmd { request: Request, end: u64 },
    /// A protocol error to report; `end` is past the offending line.
    Error { reply: &'static str, end: u64 },
    /// The command is incomplete; read more and retry from the same start.
    More,
    /// Junk limit exceeded; drop the connection without courtesy.
    Trash,
}

enum Stop {
    More,
    Trash,
    Protocol(&'static str),
}

const ERR_GENERIC: &str = "ERROR\r\n";
const ERR_MISSING: &str = "CLIENT_ERROR missing parameter\r\n";
const ERR_TOO_LONG: &str = "CLIENT_ERROR parameter is too long\r\n";
const ERR_NUMBER: &str = "CLIENT_ERROR invalid number parameter\r\n";
const ERR_UNEXPECTED: &str = "CLIENT_ERROR unexpected parameter\r\n";
const ERR_BAD_CHUNK: &str = "CLIENT_ERROR bad data chunk\r\n";

struct Cursor<'a> {
    buf: &'a SegBuf,
    off: u64,
}

impl Cursor<'_> {
    fn peek(&self) -> Option<u8> {
        self.buf.run_at(self.off).map(|run| run[0])
    }

    fn peek_at(&self, ahead: u64) -> Option<u8> {
        self.buf.run_at(self.off + ahead).map(|run| run[0])
    }

    fn bump(&mut self) {
        self.off += 1;
    }
}

/// Attempt to parse one command beginning at absolute offset `start`.
pub fn parse(buf: &SegBuf, start: u64) -> Parsed {
    let mut cur = Cursor { buf, off: start };
    match parse_inner(&mut cur) {
        Ok(request) => Parsed::Cmd { request, end: cur.off },
        Err(Stop::More) => Parsed::More,
        Err(Stop::Trash) => Parsed::Trash,
        Err(Stop::Protocol(reply)) => resync(buf, cur.off, reply),
    }
}

/// Skip past the next newline so the connection can recover, bounding how
/// much garbage we are willing to scan.
fn resync(buf: &SegBuf, mut off: u64, reply: &'static str) -> Parsed {
    let mut scanned = 0usize;
    while let Some(run) = buf.run_at(off) {
        if let Some(pos) = run.iter().position(|&b| b == b'\n') {
            return Parsed::Error { reply, end: off + pos as u64 + 1 };
        }
        off += run.len() as u64;
        scanned += run.len();
        if scanned > JUNK_LIMIT {
            return Parsed::Trash;
        }
    }
    Parsed::More
}

fn parse_inner(cur: &mut Cursor) -> Result<Request, Stop> {
    skip_spaces(cur)?;

    // The first four characters select the command; a per-command tail
    // verifies the remainder.
    let mut word = [0u8; 4];
    let mut n = 0;
    while n < 4 {
        match cur.peek() {
            None => return Err(Stop::More),
            Some(b' ' | b'\r' | b'\n') => break,
            Some(c) => {
                word[n] = c;
                n += 1;
                cur.bump();
            }
        }
    }

    match &word[..n] {
        b"get" => parse_get(cur, false),
        b"set" => parse_store(cur, StoreOp::Set),
        b"add" => parse_store(cur, StoreOp::Add),
        b"cas" => parse_store(cur, StoreOp::Cas),
        b"gets" => {
            tail(cur, b"")?;
            parse_get(cur, true)
        }
        b"incr" => {
            tail(cur, b"")?;
            parse_arith(cur, false)
        }
        b"decr" => {
            tail(cur, b"")?;
            parse_arith(cur, true)
        }
        b"quit" => {
            tail(cur, b"")?;
            parse_eol(cur)?;
            Ok(Request::Quit)
        }
        b"repl" => {
            tail(cur, b"ace")?;
            parse_store(cur, StoreOp::Replace)
        }
        b"appe" => {
            tail(cur, b"nd")?;
            parse_store(cur, StoreOp::Append)
        }
        b"prep" => {
            tail(cur, b"end")?;
            parse_store(cur, StoreOp::Prepend)
        }
        b"dele" => {
            tail(cur, b"te")?;
            parse_delete(cur)
        }
        b"touc" => {
            tail(cur, b"h")?;
            parse_touch(cur)
        }
        b"flus" => {
            tail(cur, b"h_all")?;
            parse_flush(cur)
        }
        b"vers" => {
            tail(cur, b"ion")?;
            parse_eol(cur)?;
            Ok(Request::Version)
        }
        b"verb" => {
            tail(cur, b"osity")?;
            parse_verbosity(cur)
        }
        b"slab" => {
            tail(cur, b"s")?;
            skip_line(cur)?;
            Ok(Request::Slabs)
        }
        b"stat" => {
            tail(cur, b"s")?;
            skip_line(cur)?;
            Ok(Request::Stats)
        }
        _ => Err(Stop::Protocol(ERR_GENERIC)),
    }
}

/// Consume the expected rest of a command name, then require a delimiter.
fn tail(cur: &mut Cursor, expect: &[u8]) -> Result<(), Stop> {
    for &t in expect {
        match cur.peek() {
            None => return Err(Stop::More),
            Some(c) if c == t => cur.bump(),
            Some(_) => return Err(Stop::Protocol(ERR_GENERIC)),
        }
    }
    match cur.peek() {
        None => Err(Stop::More),
        Some(b' ' | b'\r' | b'\n') => Ok(()),
        Some(_) => Err(Stop::Protocol(ERR_GENERIC)),
    }
}

fn skip_spaces(cur: &mut Cursor) -> Result<(), Stop> {
    let mut scanned = 0usize;
    loop {
        match cur.peek() {
            None => return Err(Stop::More),
            Some(b' ') => {
                cur.bump();
                scanned += 1;
                if scanned > JUNK_LIMIT {
                    return Err(Stop::Trash);
                }
            }
            Some(_) => return Ok(()),
        }
    }
}

/// One parameter: bytes up to a space or line end, at most
/// [`KEY_LEN_MAX`]. The caller has skipped leading spaces.
fn parse_word(cur: &mut Cursor) -> Result<Bytes, Stop> {
    let mut out = [0u8; KEY_LEN_MAX];
    let mut n = 0;
    loop {
        match cur.peek() {
            None => return Err(Stop::More),
            Some(b' ' | b'\r' | b'\n') => break,
            Some(c) => {
                if n == KEY_LEN_MAX {
                    return Err(Stop::Protocol(ERR_TOO_LONG));
                }
                out[n] = c;
                n += 1;
                cur.bump();
            }
        }
    }
    if n == 0 {
        return Err(Stop::Protocol(ERR_MISSING));
    }
    Ok(Bytes::copy_from_slice(&out[..n]))
}

fn dec_u64(word: &[u8]) -> Option<u64> {
    if word.is_empty() {
        return None;
    }
    let mut acc: u64 = 0;
    for &b in word {
        if !b.is_ascii_digit() {
            return None;
        }
        acc = acc.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(acc)
}

fn parse_u64(cur: &mut Cursor) -> Result<u64, Stop> {
    skip_spaces(cur)?;
    let word = parse_word(cur)?;
    dec_u64(&word).ok_or(Stop::Protocol(ERR_NUMBER))
}

fn parse_u32(cur: &mut Cursor) -> Result<u32, Stop> {
    let v = parse_u64(cur)?;
    u32::try_from(v).map_err(|_| Stop::Protocol(ERR_NUMBER))
}

/// Optional trailing `noreply`. Anything else before the line end is an
/// unexpected parameter.
fn parse_noreply(cur: &mut Cursor) -> Result<bool, Stop> {
    skip_spaces(cur)?;
    match cur.peek() {
        None => Err(Stop::More),
        Some(b'\r' | b'\n') => Ok(false),
        Some(_) => {
            let word = parse_word(cur)?;
            if &word[..] == b"noreply" {
                Ok(true)
            } else {
                Err(Stop::Protocol(ERR_UNEXPECTED))
            }
        }
    }
}

/// Line terminator: `\n` or `\r\n`, with tolerated padding spaces.
fn parse_eol(cur: &mut Cursor) -> Result<(), Stop> {
    skip_spaces(cur)?;
    match cur.peek() {
        None => Err(Stop::More),
        Some(b'\n') => {
            cur.bump();
            Ok(())
        }
        Some(b'\r') => match cur.peek_at(1) {
            None => Err(Stop::More),
            Some(b'\n') => {
                cur.off += 2;
                Ok(())
            }
            Some(_) => Err(Stop::Protocol(ERR_UNEXPECTED)),
        },
        Some(_) => Err(Stop::Protocol(ERR_UNEXPECTED)),
    }
}

fn skip_line(cur: &mut Cursor) -> Result<(), Stop> {
    let mut scanned = 0usize;
    loop {
        match cur.peek() {
            None => return Err(Stop::More),
            Some(b'\n') => {
                cur.bump();
                return Ok(());
            }
            Some(_) => {
                cur.bump();
                scanned += 1;
                if scanned > JUNK_LIMIT {
                    return Err(Stop::Trash);
                }
            }
        }
    }
}

fn parse_get(cur: &mut Cursor, with_cas: bool) -> Result<Request, Stop> {
    let mut keys = Vec::new();
    loop {
        skip_spaces(cur)?;
        match cur.peek() {
            None => return Err(Stop::More),
            Some(b'\r' | b'\n') => {
                parse_eol(cur)?;
                break;
            }
            Some(_) => keys.push(parse_word(cur)?),
        }
    }
    Ok(Request::Get { keys, with_cas })
}

fn parse_store(cur: &mut Cursor, op: StoreOp) -> Result<Request, Stop> {
    skip_spaces(cur)?;
    let key = parse_word(cur)?;
    let flags = parse_u32(cur)?;
    let exptime = parse_u32(cur)?;
    let bytes = parse_u32(cur)?;
    let cas = if op == StoreOp::Cas { parse_u64(cur)? } else { 0 };
    let noreply = parse_noreply(cur)?;
    parse_eol(cur)?;

    // The data block: exactly `bytes` octets, then a line terminator. The
    // bytes themselves are not copied; the command records their range.
    let off = cur.off;
    let avail = cur.buf.write_pos() - off;
    if avail < bytes as u64 + 1 {
        return Err(Stop::More);
    }
    let data_end = off + bytes as u64;
    match cur.buf.run_at(data_end).map(|run| run[0]) {
        Some(b'\n') => cur.off = data_end + 1,
        Some(b'\r') => match cur.buf.run_at(data_end + 1).map(|run| run[0]) {
            None => return Err(Stop::More),
            Some(b'\n') => cur.off = data_end + 2,
            Some(_) => {
                cur.off = data_end;
                return Err(Stop::Protocol(ERR_BAD_CHUNK));
            }
        },
        Some(_) => {
            cur.off = data_end;
            return Err(Stop::Protocol(ERR_BAD_CHUNK));
        }
        None => return Err(Stop::More),
    }

    Ok(Request::Store {
        op,
        key,
        flags,
        exptime,
        data: DataRef { off, len: bytes },
        cas,
        noreply,
    })
}

fn parse_arith(cur: &mut Cursor, decr: bool) -> Result<Request, Stop> {
    skip_spaces(cur)?;
    let key = parse_word(cur)?;
    let delta = parse_u64(cur)?;
    let noreply = parse_noreply(cur)?;
    parse_eol(cur)?;
    Ok(Request::Arith { key, delta, decr, noreply })
}

fn parse_delete(cur: &mut Cursor) -> Result<Request, Stop> {
    skip_spaces(cur)?;
    let key = parse_word(cur)?;
    let noreply = parse_noreply(cur)?;
    parse_eol(cur)?;
    Ok(Request::Delete { key, noreply })
}

fn parse_touch(cur: &mut Cursor) -> Result<Request, Stop> {
    skip_spaces(cur)?;
    let key = parse_word(cur)?;
    let exptime = parse_u32(cur)?;
    let noreply = parse_noreply(cur)?;
    parse_eol(cur)?;
    Ok(Request::Touch { key, exptime, noreply })
}

/// `flush_all [delay] [noreply]` with both parameters optional.
fn parse_flush(cur: &mut Cursor) -> Result<Request, Stop> {
    skip_spaces(cur)?;
    let (delay, noreply) = match cur.peek() {
        None => return Err(Stop::More),
        Some(b'\r' | b'\n') => (0, false),
        Some(_) => {
            let word = parse_word(cur)?;
            if &word[..] == b"noreply" {
                (0, true)
            } else {
                let delay = dec_u64(&word)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or(Stop::Protocol(ERR_NUMBER))?;
                (delay, parse_noreply(cur)?)
            }
        }
    };
    parse_eol(cur)?;
    Ok(Request::FlushAll { delay, noreply })
}

fn parse_verbosity(cur: &mut Cursor) -> Result<Request, Stop> {
    skip_spaces(cur)?;
    let level = parse_u32(cur)?;
    let noreply = parse_noreply(cur)?;
    parse_eol(cur)?;
    Ok(Request::Verbosity { level, noreply })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mica_buffer::ChunkPool;

    fn feed(input: &[u8]) -> (SegBuf, u64) {
        let mut buf = SegBuf::new(ChunkPool::handle());
        buf.append(input);
        let start = buf.read_pos();
        (buf, start)
    }

    fn one(input: &[u8]) -> Request {
        let (buf, start) = feed(input);
        match parse(&buf, start) {
            Parsed::Cmd { request, end } => {
                assert_eq!(end, buf.write_pos(), "command must consume all input");
                request
            }
            other => panic!("expected command for {:?}, got {other:?}", String::from_utf8_lossy(input)),
        }
    }

    fn error(input: &[u8]) -> &'static str {
        let (buf, start) = feed(input);
        match parse(&buf, start) {
            Parsed::Error { reply, .. } => reply,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn parses_get_family() {
        assert_eq!(
            one(b"get foo\r\n"),
            Request::Get { keys: vec![Bytes::from_static(b"foo")], with_cas: false }
        );
        assert_eq!(
            one(b"gets a b\r\n"),
            Request::Get {
                keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")],
                with_cas: true
            }
        );
        // A get without keys is pointless but legal.
        assert_eq!(one(b"get\r\n"), Request::Get { keys: vec![], with_cas: false });
    }

    #[test]
    fn parses_storage_commands() {
        let req = one(b"set foo 7 60 5\r\nhello\r\n");
        let Request::Store { op, key, flags, exptime, data, noreply, .. } = req else {
            panic!("not a store");
        };
        assert_eq!(op, StoreOp::Set);
        assert_eq!(key, Bytes::from_static(b"foo"));
        assert_eq!(flags, 7);
        assert_eq!(exptime, 60);
        assert_eq!(data.len, 5);
        assert!(!noreply);

        let req = one(b"cas foo 0 0 1 99 noreply\r\nx\r\n");
        let Request::Store { op, cas, noreply, .. } = req else { panic!() };
        assert_eq!(op, StoreOp::Cas);
        assert_eq!(cas, 99);
        assert!(noreply);
    }

    #[test]
    fn bare_lf_terminators_are_accepted() {
        let req = one(b"set k 0 0 2\nab\n");
        assert!(matches!(req, Request::Store { .. }));
        assert_eq!(one(b"get k\n"), Request::Get { keys: vec![Bytes::from_static(b"k")], with_cas: false });
    }

    #[test]
    fn incomplete_input_asks_for_more() {
        for partial in [
            &b"se"[..],
            b"set foo",
            b"set foo 0 0 5",
            b"set foo 0 0 5\r\nhel",
            b"set foo 0 0 5\r\nhello",
            b"set foo 0 0 5\r\nhello\r",
            b"get foo",
        ] {
            let (buf, start) = feed(partial);
            assert!(matches!(parse(&buf, start), Parsed::More), "{partial:?}");
        }
    }

    #[test]
    fn unknown_commands_error_and_resync() {
        let (buf, start) = feed(b"bogus nonsense\r\nget k\r\n");
        let Parsed::Error { reply, end } = parse(&buf, start) else { panic!() };
        assert_eq!(reply, ERR_GENERIC);
        // The cursor lands on the next command.
        let Parsed::Cmd { request, .. } = parse(&buf, end) else { panic!() };
        assert_eq!(request, Request::Get { keys: vec![Bytes::from_static(b"k")], with_cas: false });
    }

    #[test]
    fn key_length_boundary() {
        let key250 = vec![b'k'; 250];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&key250);
        line.extend_from_slice(b"\r\n");
        let Request::Get { keys, .. } = one(&line) else { panic!() };
        assert_eq!(keys[0].len(), 250);

        let mut line = b"get ".to_vec();
        line.extend_from_slice(&vec![b'k'; 251]);
        line.extend_from_slice(b"\r\n");
        assert_eq!(error(&line), ERR_TOO_LONG);
    }

    #[test]
    fn numeric_parameters_are_strict() {
        assert_eq!(error(b"set k 12x 0 5\r\nhello\r\n"), ERR_NUMBER);
        assert_eq!(error(b"set k 0 0 99999999999999999999\r\n"), ERR_NUMBER);
        assert_eq!(error(b"incr k 12a\r\n"), ERR_NUMBER);
        // u32 parameters reject u64-range values.
        assert_eq!(error(b"set k 4294967296 0 5\r\nhello\r\n"), ERR_NUMBER);
    }

    #[test]
    fn stray_tokens_are_unexpected() {
        assert_eq!(error(b"delete k extra\r\n"), ERR_UNEXPECTED);
        assert_eq!(error(b"get k\rX\r\n"), ERR_UNEXPECTED);
    }

    #[test]
    fn bad_data_terminator_is_reported() {
        assert_eq!(error(b"set k 0 0 2\r\nabXtail\r\n"), ERR_BAD_CHUNK);
    }

    #[test]
    fn flush_all_arguments_are_optional() {
        assert_eq!(one(b"flush_all\r\n"), Request::FlushAll { delay: 0, noreply: false });
        assert_eq!(one(b"flush_all 30\r\n"), Request::FlushAll { delay: 30, noreply: false });
        assert_eq!(
            one(b"flush_all 30 noreply\r\n"),
            Request::FlushAll { delay: 30, noreply: true }
        );
        assert_eq!(one(b"flush_all noreply\r\n"), Request::FlushAll { delay: 0, noreply: true });
    }

    #[test]
    fn admin_commands_parse() {
        assert_eq!(one(b"version\r\n"), Request::Version);
        assert_eq!(one(b"quit\r\n"), Request::Quit);
        assert_eq!(one(b"stats\r\n"), Request::Stats);
        assert_eq!(one(b"stats items\r\n"), Request::Stats);
        assert_eq!(one(b"slabs automove 1\r\n"), Request::Slabs);
        assert_eq!(
            one(b"verbosity 2\r\n"),
            Request::Verbosity { level: 2, noreply: false }
        );
        assert_eq!(
            one(b"touch k 100\r\n"),
            Request::Touch { key: Bytes::from_static(b"k"), exptime: 100, noreply: false }
        );
    }

    #[test]
    fn junk_floods_are_fatal() {
        let mut junk = vec![b'x'; JUNK_LIMIT + 100];
        junk.push(b' ');
        let (buf, start) = feed(&junk);
        assert!(matches!(parse(&buf, start), Parsed::Trash));
    }

    #[test]
    fn leading_spaces_are_tolerated() {
        assert_eq!(
            one(b"   get foo\r\n"),
            Request::Get { keys: vec![Bytes::from_static(b"foo")], with_cas: false }
        );
    }
}
