//! Round-trip property: for every well-formed command, serializing it and
//! parsing the bytes back yields the same command; for every malformed
//! stream containing a newline, the parser advances past that newline.
//! Also covers the segmented-input boundary: a command split mid-key
//! across two buffer segments parses identically to the contiguous form.

use bytes::Bytes;

use mica_buffer::{ChunkPool, SegBuf, CHUNK_CAPACITY};
use mica_proto::{parse, DataRef, Parsed, Request, StoreOp};

/// Render a request back to wire bytes. `data` supplies the payload for
/// storage commands.
fn serialize(request: &Request, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    match request {
        Request::Get { keys, with_cas } => {
            out.extend_from_slice(if *with_cas { b"gets" } else { b"get" });
            for key in keys {
                out.push(b' ');
                out.extend_from_slice(key);
            }
            out.extend_from_slice(b"\r\n");
        }
        Request::Store { op, key, flags, exptime, data: d, cas, noreply } => {
            let name: &[u8] = match op {
                StoreOp::Set => b"set",
                StoreOp::Add => b"add",
                StoreOp::Replace => b"replace",
                StoreOp::Append => b"append",
                StoreOp::Prepend => b"prepend",
                StoreOp::Cas => b"cas",
            };
            out.extend_from_slice(name);
            out.push(b' ');
            out.extend_from_slice(key);
            out.extend_from_slice(format!(" {flags} {exptime} {}", d.len).as_bytes());
            if *op == StoreOp::Cas {
                out.extend_from_slice(format!(" {cas}").as_bytes());
            }
            if *noreply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
            assert_eq!(data.len() as u32, d.len);
            out.extend_from_slice(data);
            out.extend_from_slice(b"\r\n");
        }
        Request::Arith { key, delta, decr, noreply } => {
            out.extend_from_slice(if *decr { b"decr " } else { b"incr " });
            out.extend_from_slice(key);
            out.extend_from_slice(format!(" {delta}").as_bytes());
            if *noreply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
        }
        Request::Delete { key, noreply } => {
            out.extend_from_slice(b"delete ");
            out.extend_from_slice(key);
            if *noreply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
        }
        Request::Touch { key, exptime, noreply } => {
            out.extend_from_slice(b"touch ");
            out.extend_from_slice(key);
            out.extend_from_slice(format!(" {exptime}").as_bytes());
            if *noreply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
        }
        Request::FlushAll { delay, noreply } => {
            out.extend_from_slice(b"flush_all");
            out.extend_from_slice(format!(" {delay}").as_bytes());
            if *noreply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
        }
        Request::Verbosity { level, noreply } => {
            out.extend_from_slice(format!("verbosity {level}").as_bytes());
            if *noreply {
                out.extend_from_slice(b" noreply");
            }
            out.extend_from_slice(b"\r\n");
        }
        Request::Version => out.extend_from_slice(b"version\r\n"),
        Request::Stats => out.extend_from_slice(b"stats\r\n"),
        Request::Slabs => out.extend_from_slice(b"slabs\r\n"),
        Request::Quit => out.extend_from_slice(b"quit\r\n"),
    }
    out
}

fn parse_one(input: &[u8]) -> (Request, SegBuf) {
    let mut buf = SegBuf::new(ChunkPool::handle());
    buf.append(input);
    match parse(&buf, buf.read_pos()) {
        Parsed::Cmd { request, end } => {
            assert_eq!(end - buf.read_pos(), input.len() as u64);
            (request, buf)
        }
        other => panic!("parse failed: {other:?}"),
    }
}

#[test]
fn well_formed_commands_round_trip() {
    let data = b"payload";
    let cases = vec![
        Request::Get { keys: vec![Bytes::from_static(b"one")], with_cas: false },
        Request::Get {
            keys: vec![Bytes::from_static(b"a"), Bytes::from_static(b"b"), Bytes::from_static(b"c")],
            with_cas: true,
        },
        Request::Store {
            op: StoreOp::Set,
            key: Bytes::from_static(b"k1"),
            flags: 42,
            exptime: 1000,
            data: DataRef { off: 0, len: data.len() as u32 },
            cas: 0,
            noreply: false,
        },
        Request::Store {
            op: StoreOp::Cas,
            key: Bytes::from_static(b"k2"),
            flags: 0,
            exptime: 0,
            data: DataRef { off: 0, len: data.len() as u32 },
            cas: 777,
            noreply: true,
        },
        Request::Arith { key: Bytes::from_static(b"n"), delta: 9, decr: false, noreply: false },
        Request::Arith { key: Bytes::from_static(b"n"), delta: 2, decr: true, noreply: true },
        Request::Delete { key: Bytes::from_static(b"gone"), noreply: false },
        Request::Touch { key: Bytes::from_static(b"t"), exptime: 3, noreply: false },
        Request::FlushAll { delay: 0, noreply: false },
        Request::FlushAll { delay: 60, noreply: true },
        Request::Verbosity { level: 1, noreply: false },
        Request::Version,
        Request::Quit,
    ];

    for expect in cases {
        let wire = serialize(&expect, data);
        let (mut got, buf) = parse_one(&wire);

        // Normalize the data offset: the round-trip property is about the
        // bytes, not the buffer position they landed at.
        if let (
            Request::Store { data: got_data, .. },
            Request::Store { data: want_data, .. },
        ) = (&mut got, &expect)
        {
            let stored = buf.copy_range(got_data.off, got_data.len as usize);
            assert_eq!(stored, data, "data block bytes survive");
            got_data.off = want_data.off;
        }
        assert_eq!(got, expect, "round-trip for {:?}", String::from_utf8_lossy(&wire));
    }
}

#[test]
fn malformed_streams_advance_past_the_newline() {
    let cases: &[&[u8]] = &[
        b"nonsense\r\n",
        b"gettish k\r\n",
        b"set onlykey\r\n",
        b"incr k notanumber\r\n",
        b"delete\r\n",
        b"\n",
        b"verbosity\r\n",
    ];
    for input in cases {
        let mut buf = SegBuf::new(ChunkPool::handle());
        buf.append(input);
        buf.append(b"version\r\n");
        let Parsed::Error { end, .. } = parse(&buf, buf.read_pos()) else {
            panic!("expected error for {:?}", String::from_utf8_lossy(input));
        };
        let newline = input.iter().position(|&b| b == b'\n').unwrap() as u64;
        assert_eq!(end, buf.read_pos() + newline + 1, "skips exactly past the newline");
        // The stream recovers on the next command.
        assert!(matches!(
            parse(&buf, end),
            Parsed::Cmd { request: Request::Version, .. }
        ));
    }
}

#[test]
fn command_split_across_segments_parses_like_contiguous_input() {
    // Fill most of the first chunk with a storage command so the next
    // command's key straddles the segment boundary.
    let pad_len = CHUNK_CAPACITY - 40;
    let mut first = format!("set filler 0 0 {pad_len}\r\n").into_bytes();
    first.extend(std::iter::repeat(b'f').take(pad_len));
    first.extend_from_slice(b"\r\n");

    let second = b"get straddling-key-abcdefghijklmnopqrstuvwxyz\r\n";

    let mut buf = SegBuf::new(ChunkPool::handle());
    buf.append(&first);
    buf.append(second);

    // First command parses and is consumed.
    let Parsed::Cmd { request, end } = parse(&buf, buf.read_pos()) else {
        panic!("filler set did not parse");
    };
    assert!(matches!(request, Request::Store { .. }));

    // The second command's bytes cross the chunk boundary.
    let run = buf.run_at(end).expect("second command present");
    assert!(
        (run.len() as u64) < second.len() as u64,
        "test setup must split the key across segments"
    );

    let Parsed::Cmd { request, .. } = parse(&buf, end) else {
        panic!("split command did not parse");
    };
    assert_eq!(
        request,
        Request::Get {
            keys: vec![Bytes::from_static(b"straddling-key-abcdefghijklmnopqrstuvwxyz")],
            with_cas: false
        }
    );
}

#[test]
fn pipelined_commands_parse_back_to_back() {
    let wire = b"set a 0 0 1\r\nx\r\nget a\r\ndelete a noreply\r\nquit\r\n";
    let mut buf = SegBuf::new(ChunkPool::handle());
    buf.append(wire);

    let mut off = buf.read_pos();
    let mut kinds = Vec::new();
    loop {
        match parse(&buf, off) {
            Parsed::Cmd { request, end } => {
                let quit = request == Request::Quit;
                kinds.push(request);
                off = end;
                if quit {
                    break;
                }
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(kinds.len(), 4);
    assert_eq!(off, buf.write_pos());
}
