//! Git protocol v2 request and response chunks, and the request parser.
//!
//! A protocol v2 request body is a sequence of commands. Each command is a
//! `command=<name>` data packet, followed by capability lines, a delimiter,
//! argument lines, and a terminating flush. Only `ls-refs` and `fetch` are
//! accepted by this proxy.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};

use crate::pktline::{Packet, PktError, PktReader};
use crate::status::{Status, StatusResult};

/// Refs advertised by upstream: ref name to hex object id.
pub type RefSnapshot = HashMap<String, String>;

/// Command names understood by the proxy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    LsRefs,
    Fetch,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::LsRefs => "ls-refs",
            CommandKind::Fetch => "fetch",
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "ls-refs" => Some(CommandKind::LsRefs),
            "fetch" => Some(CommandKind::Fetch),
            _ => None,
        }
    }
}

/// One chunk of a parsed request command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestChunk {
    /// The `command=<name>` line.
    Command(String),
    /// A capability line (between the command line and the delimiter).
    Capability(Bytes),
    /// The section delimiter.
    Delim,
    /// An argument line (after the delimiter).
    Argument(Bytes),
}

impl RequestChunk {
    fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            RequestChunk::Command(name) => {
                Packet::Data(Bytes::from(format!("command={name}\n"))).encode_into(buf)
            }
            RequestChunk::Capability(line) | RequestChunk::Argument(line) => {
                Packet::Data(line.clone()).encode_into(buf)
            }
            RequestChunk::Delim => Packet::Delim.encode_into(buf),
        }
    }
}

/// A parsed protocol v2 command: the command name plus its chunks in
/// arrival order. The end-of-request marker is implicit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub chunks: Vec<RequestChunk>,
}

impl Command {
    /// Re-frame this command as a complete pkt-line request, terminated by
    /// a flush packet, suitable for `git upload-pack --stateless-rpc` or a
    /// forwarded upstream request.
    pub fn encode_pktline(&self) -> Bytes {
        let mut buf = BytesMut::new();
        for chunk in &self.chunks {
            chunk.encode_into(&mut buf);
        }
        Packet::Flush.encode_into(&mut buf);
        buf.freeze()
    }
}

/// One chunk of a protocol v2 response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseChunk {
    /// A data line.
    Response(Bytes),
    /// The section delimiter.
    Delim,
    /// The end-of-request flush.
    EndOfRequest,
}

impl ResponseChunk {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            ResponseChunk::Response(line) => Packet::Data(line.clone()).encode_into(buf),
            ResponseChunk::Delim => Packet::Delim.encode_into(buf),
            ResponseChunk::EndOfRequest => Packet::Flush.encode_into(buf),
        }
    }
}

/// Encode a full response chunk sequence to wire form.
pub fn encode_response(chunks: &[ResponseChunk]) -> Bytes {
    let mut buf = BytesMut::new();
    for chunk in chunks {
        chunk.encode_into(&mut buf);
    }
    buf.freeze()
}

/// Parse a protocol v2 response body into chunks.
pub fn parse_response(body: &[u8]) -> Result<Vec<ResponseChunk>, PktError> {
    let mut reader = PktReader::new(body);
    let mut chunks = Vec::new();
    while let Some(pkt) = reader.next_packet()? {
        chunks.push(match pkt {
            Packet::Data(line) => ResponseChunk::Response(line),
            Packet::Delim => ResponseChunk::Delim,
            Packet::Flush => ResponseChunk::EndOfRequest,
        });
    }
    Ok(chunks)
}

/// The capability advertisement served on `/info/refs`.
///
/// `ref-in-want` is deliberately not advertised: a client using it could
/// observe a ref that a concurrent mirror fetch is mid-way through
/// updating and receive an incomplete packfile.
pub fn capability_advertisement() -> Bytes {
    let mut buf = BytesMut::new();
    for line in [
        &b"version 2\n"[..],
        b"ls-refs\n",
        b"fetch=filter shallow\n",
        b"server-option\n",
    ] {
        Packet::Data(Bytes::from_static(line)).encode_into(&mut buf);
    }
    Packet::Flush.encode_into(&mut buf);
    buf.freeze()
}

/// Parse an entire request body into its ordered command sequence.
///
/// An empty body yields zero commands. A truncated command fails with
/// `InvalidArgument`; garbage after the last complete command is
/// tolerated.
pub fn parse_all_commands(body: &[u8]) -> StatusResult<Vec<Command>> {
    let mut reader = PktReader::new(body);
    let mut commands = Vec::new();

    'outer: loop {
        let mut kind: Option<CommandKind> = None;
        let mut chunks: Vec<RequestChunk> = Vec::new();
        let mut past_delim = false;

        loop {
            let pkt = match reader.next_packet() {
                Ok(Some(pkt)) => pkt,
                Ok(None) => {
                    if kind.is_none() {
                        break 'outer;
                    }
                    return Err(Status::invalid_argument(
                        "cannot parse the request: truncated command",
                    ));
                }
                Err(err) => {
                    if kind.is_none() && !commands.is_empty() {
                        // Trailing garbage after the last complete command.
                        break 'outer;
                    }
                    return Err(Status::invalid_argument(format!(
                        "cannot parse the request: {err}"
                    )));
                }
            };

            match pkt {
                Packet::Flush => {
                    if kind.is_none() {
                        // A lone flush ends the request.
                        break 'outer;
                    }
                    break;
                }
                Packet::Delim => {
                    if kind.is_none() {
                        return Err(Status::invalid_argument(
                            "cannot parse the request: delimiter before command",
                        ));
                    }
                    past_delim = true;
                    chunks.push(RequestChunk::Delim);
                }
                Packet::Data(line) => match kind {
                    None => {
                        let text = std::str::from_utf8(&line).map_err(|_| {
                            Status::invalid_argument(
                                "cannot parse the request: command line is not UTF-8",
                            )
                        })?;
                        let name = text
                            .strip_prefix("command=")
                            .map(|n| n.trim_end_matches('\n'))
                            .ok_or_else(|| {
                                Status::invalid_argument(format!(
                                    "cannot parse the request: expected a command line, got {text:?}"
                                ))
                            })?;
                        let parsed = CommandKind::parse(name).ok_or_else(|| {
                            Status::invalid_argument(format!("unrecognized command: {name}"))
                        })?;
                        kind = Some(parsed);
                        chunks.push(RequestChunk::Command(name.to_string()));
                    }
                    Some(_) => {
                        if past_delim {
                            chunks.push(RequestChunk::Argument(line));
                        } else {
                            chunks.push(RequestChunk::Capability(line));
                        }
                    }
                },
            }
        }

        let Some(kind) = kind else { break };
        commands.push(Command { kind, chunks });
    }

    Ok(commands)
}

/// Extract a ref snapshot from an upstream `ls-refs` response.
///
/// Each data line is `<oid> <refname>[ <attributes>...]`; the refname is
/// the trimmed second field.
pub fn parse_ls_refs_response(chunks: &[ResponseChunk]) -> StatusResult<RefSnapshot> {
    let mut snapshot = RefSnapshot::new();
    for chunk in chunks {
        let ResponseChunk::Response(line) = chunk else {
            continue;
        };
        let text = std::str::from_utf8(line).map_err(|_| {
            Status::internal("cannot parse the upstream ls-refs response: not UTF-8")
        })?;
        let mut fields = text.split(' ');
        let oid = fields.next().unwrap_or_default();
        let refname = fields.next().ok_or_else(|| {
            Status::internal(format!(
                "cannot parse the upstream ls-refs response: got 1 field, want at least 2: {text:?}"
            ))
        })?;
        snapshot.insert(refname.trim().to_string(), oid.to_string());
    }
    Ok(snapshot)
}

fn is_hex_oid(s: &str) -> bool {
    (s.len() == 40 || s.len() == 64) && s.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Extract the `want <oid>` object ids and `want-ref <refname>` ref names
/// from a fetch command. Other argument lines pass through uninterpreted.
pub fn parse_fetch_wants(command: &Command) -> StatusResult<(Vec<String>, Vec<String>)> {
    let mut oids = Vec::new();
    let mut refs = Vec::new();
    for chunk in &command.chunks {
        let RequestChunk::Argument(line) = chunk else {
            continue;
        };
        let Ok(text) = std::str::from_utf8(line) else {
            continue;
        };
        if let Some(rest) = text.strip_prefix("want ") {
            let oid = rest.trim();
            if !is_hex_oid(oid) {
                return Err(Status::invalid_argument(format!(
                    "cannot parse the fetch request: invalid want: {oid:?}"
                )));
            }
            oids.push(oid.to_string());
        } else if let Some(rest) = text.strip_prefix("want-ref ") {
            let refname = rest.trim();
            if refname.is_empty() {
                return Err(Status::invalid_argument(
                    "cannot parse the fetch request: empty want-ref",
                ));
            }
            refs.push(refname.to_string());
        }
    }
    Ok((oids, refs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn pkt(line: &str) -> Vec<u8> {
        let mut buf = BytesMut::new();
        Packet::Data(Bytes::copy_from_slice(line.as_bytes())).encode_into(&mut buf);
        buf.to_vec()
    }

    fn build_request(parts: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for part in parts {
            out.put_slice(part);
        }
        out
    }

    const OID: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn parses_single_fetch_command() {
        let body = build_request(&[
            &pkt("command=fetch\n"),
            &pkt("agent=git/2.45.0\n"),
            b"0001",
            &pkt(&format!("want {OID}\n")),
            &pkt("done\n"),
            b"0000",
        ]);
        let commands = parse_all_commands(&body).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind, CommandKind::Fetch);
        assert_eq!(
            commands[0].chunks[0],
            RequestChunk::Command("fetch".to_string())
        );
        assert!(matches!(commands[0].chunks[1], RequestChunk::Capability(_)));
        assert_eq!(commands[0].chunks[2], RequestChunk::Delim);
        assert!(matches!(commands[0].chunks[3], RequestChunk::Argument(_)));
    }

    #[test]
    fn parses_multiple_commands_in_order() {
        let body = build_request(&[
            &pkt("command=ls-refs\n"),
            b"0000",
            &pkt("command=fetch\n"),
            b"0001",
            &pkt(&format!("want {OID}\n")),
            b"0000",
        ]);
        let commands = parse_all_commands(&body).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].kind, CommandKind::LsRefs);
        assert_eq!(commands[1].kind, CommandKind::Fetch);
    }

    #[test]
    fn empty_body_yields_no_commands() {
        assert_eq!(parse_all_commands(b"").unwrap(), Vec::new());
    }

    #[test]
    fn lone_flush_yields_no_commands() {
        assert_eq!(parse_all_commands(b"0000").unwrap(), Vec::new());
    }

    #[test]
    fn rejects_unknown_command() {
        let body = build_request(&[&pkt("command=push\n"), b"0000"]);
        let err = parse_all_commands(&body).unwrap_err();
        assert_eq!(err.code, crate::status::Code::InvalidArgument);
        assert!(err.message.contains("unrecognized command"));
    }

    #[test]
    fn rejects_truncated_command() {
        let body = build_request(&[&pkt("command=fetch\n"), b"0001"]);
        let err = parse_all_commands(&body).unwrap_err();
        assert_eq!(err.code, crate::status::Code::InvalidArgument);
    }

    #[test]
    fn rejects_argument_before_command() {
        let body = build_request(&[&pkt("want-ref refs/heads/main\n"), b"0000"]);
        let err = parse_all_commands(&body).unwrap_err();
        assert_eq!(err.code, crate::status::Code::InvalidArgument);
    }

    #[test]
    fn tolerates_trailing_garbage() {
        let body = build_request(&[&pkt("command=ls-refs\n"), b"0000", b"zzzz not a packet"]);
        let commands = parse_all_commands(&body).unwrap();
        assert_eq!(commands.len(), 1);
    }

    #[test]
    fn rejects_garbage_before_any_command() {
        let err = parse_all_commands(b"zzzz not a packet").unwrap_err();
        assert_eq!(err.code, crate::status::Code::InvalidArgument);
    }

    #[test]
    fn reframes_command_with_terminating_flush() {
        let body = build_request(&[
            &pkt("command=fetch\n"),
            b"0001",
            &pkt(&format!("want {OID}\n")),
            b"0000",
        ]);
        let commands = parse_all_commands(&body).unwrap();
        assert_eq!(&commands[0].encode_pktline()[..], &body[..]);
    }

    #[test]
    fn fetch_wants_extraction() {
        let body = build_request(&[
            &pkt("command=fetch\n"),
            b"0001",
            &pkt(&format!("want {OID}\n")),
            &pkt("want-ref refs/heads/main\n"),
            &pkt("filter blob:none\n"),
            b"0000",
        ]);
        let commands = parse_all_commands(&body).unwrap();
        let (oids, refs) = parse_fetch_wants(&commands[0]).unwrap();
        assert_eq!(oids, vec![OID.to_string()]);
        assert_eq!(refs, vec!["refs/heads/main".to_string()]);
    }

    #[test]
    fn fetch_wants_rejects_bad_oid() {
        let body = build_request(&[
            &pkt("command=fetch\n"),
            b"0001",
            &pkt("want notahash\n"),
            b"0000",
        ]);
        let commands = parse_all_commands(&body).unwrap();
        let err = parse_fetch_wants(&commands[0]).unwrap_err();
        assert_eq!(err.code, crate::status::Code::InvalidArgument);
    }

    #[test]
    fn ls_refs_response_snapshot() {
        let chunks = vec![
            ResponseChunk::Response(Bytes::from_static(
                b"0123456789abcdef0123456789abcdef01234567 HEAD symref-target:refs/heads/main\n",
            )),
            ResponseChunk::Response(Bytes::from_static(
                b"89abcdef0123456789abcdef0123456789abcdef refs/heads/main\n",
            )),
            ResponseChunk::EndOfRequest,
        ];
        let snapshot = parse_ls_refs_response(&chunks).unwrap();
        assert_eq!(
            snapshot.get("HEAD").map(String::as_str),
            Some("0123456789abcdef0123456789abcdef01234567")
        );
        assert_eq!(
            snapshot.get("refs/heads/main").map(String::as_str),
            Some("89abcdef0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn ls_refs_response_rejects_single_field() {
        let chunks = vec![ResponseChunk::Response(Bytes::from_static(b"justonefield\n"))];
        let err = parse_ls_refs_response(&chunks).unwrap_err();
        assert_eq!(err.code, crate::status::Code::Internal);
    }

    #[test]
    fn advertisement_contents() {
        let adv = capability_advertisement();
        let chunks = parse_response(&adv).unwrap();
        let lines: Vec<_> = chunks
            .iter()
            .filter_map(|c| match c {
                ResponseChunk::Response(line) => {
                    Some(String::from_utf8_lossy(line).trim_end().to_string())
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            lines,
            vec!["version 2", "ls-refs", "fetch=filter shallow", "server-option"]
        );
        assert_eq!(chunks.last(), Some(&ResponseChunk::EndOfRequest));
    }

    #[test]
    fn response_roundtrip() {
        let chunks = vec![
            ResponseChunk::Response(Bytes::from_static(b"acknowledgments\n")),
            ResponseChunk::Delim,
            ResponseChunk::Response(Bytes::from_static(b"ready\n")),
            ResponseChunk::EndOfRequest,
        ];
        let encoded = encode_response(&chunks);
        assert_eq!(parse_response(&encoded).unwrap(), chunks);
    }
}
