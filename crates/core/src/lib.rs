//! Core protocol types and shared logic for the Goblet Git proxy.
//!
//! This crate defines what every other crate speaks:
//! - Pkt-line framing and protocol v2 request/response chunks
//! - The request parser (`ls-refs` and `fetch` commands)
//! - Canonical status codes and their HTTP mapping
//! - Upstream URL canonicalization and cache-path derivation
//! - Configuration types

pub mod canonical;
pub mod config;
pub mod pktline;
pub mod protocol;
pub mod status;

pub use canonical::{HostCanonicalizer, UrlCanonicalizer, cache_path, object_prefix};
pub use pktline::{Packet, PktError, PktReader};
pub use protocol::{
    Command, CommandKind, RefSnapshot, RequestChunk, ResponseChunk, capability_advertisement,
    encode_response, parse_all_commands, parse_fetch_wants, parse_ls_refs_response, parse_response,
};
pub use status::{Code, Status, StatusResult};
