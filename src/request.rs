//! C3 — maps `(method, url, content-type)` to a service + advertisement
//! classification, and parses pkt-line request bodies into capabilities and
//! commands.

use std::collections::HashMap;
use std::fmt;

use bytes::{Bytes, BytesMut};

use crate::error::PktLineError;
use crate::headers::Headers;
use crate::pktline::PacketReader;

/// `Service` — the two Git Smart-HTTP services. Absence of a `Service` (an
/// `Option<Service>` of `None`) is a distinct third state ("unclassified"),
/// never a value of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    UploadPack,
    ReceivePack,
}

impl Service {
    pub fn as_str(self) -> &'static str {
        match self {
            Service::UploadPack => "upload-pack",
            Service::ReceivePack => "receive-pack",
        }
    }

    fn from_query_value(value: &str) -> Option<Self> {
        match value {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    fn from_rpc_segment(segment: &str) -> Option<Self> {
        match segment {
            "git-upload-pack" => Some(Service::UploadPack),
            "git-receive-pack" => Some(Service::ReceivePack),
            _ => None,
        }
    }

    pub fn upload_pack_content_type(self) -> &'static str {
        match self {
            Service::UploadPack => "application/x-git-upload-pack-request",
            Service::ReceivePack => "application/x-git-receive-pack-request",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request lifecycle state. Once out of `Pending`, `accept`/`reject` are
/// no-ops on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Pending,
    Accepted,
    Rejected,
    Failure,
}

impl Status {
    pub fn is_pending(self) -> bool {
        matches!(self, Status::Pending)
    }
}

/// One parsed pack command, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `receive-pack` ref update.
    Receive {
        kind: ReceiveKind,
        old_oid: String,
        new_oid: String,
        ref_name: String,
    },
    /// `upload-pack` negotiation line.
    Upload { kind: UploadKind, oid: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Want,
    Have,
}

const ZERO_OID: &str = "0000000000000000000000000000000000000000";

/// Result of classifying a single URL: whether this is an advertisement
/// (`GET .../info/refs`) request, which service it names (if any), and the
/// repository path fragment preceding the matched suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub is_advertisement: bool,
    pub service: Option<Service>,
    pub path: String,
}

/// Classifies `(method, path, query, content_type)` per the URL dispatch
/// table in spec.md §4.3. Returns `None` for the catch-all "any other path"
/// row — the caller must treat that as an unconditional 404 with no path
/// information at all.
pub fn dispatch(method: &str, path: &str, query: &str, content_type: Option<&str>) -> Option<Dispatch> {
    let trimmed = path.trim_start_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();

    if segments.len() >= 2 && segments[segments.len() - 2] == "info" && segments[segments.len() - 1] == "refs" {
        let repo_path = segments[..segments.len() - 2].join("/");
        let service = if method.eq_ignore_ascii_case("GET") {
            query_param(query, "service").and_then(|v| Service::from_query_value(&v))
        } else {
            None
        };
        return Some(Dispatch {
            is_advertisement: true,
            service,
            path: repo_path,
        });
    }

    if let Some(&last) = segments.last() {
        if last.starts_with("git-") {
            let repo_path = segments[..segments.len() - 1].join("/");
            let service = if method.eq_ignore_ascii_case("POST") {
                Service::from_rpc_segment(last).filter(|svc| {
                    content_type == Some(svc.upload_pack_content_type())
                })
            } else {
                None
            };
            return Some(Dispatch {
                is_advertisement: false,
                service,
                path: repo_path,
            });
        }
    }

    None
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next().unwrap_or("");
        (key == name).then(|| value.to_string())
    })
}

/// A repository path is invalid if it contains a `.` or `..` segment
/// between separators.
pub fn is_path_valid(path: &str) -> bool {
    let bytes = path.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'.' {
            let dots = if bytes.get(i + 1) == Some(&b'.') { 2 } else { 1 };
            let before_ok = i == 0 || bytes[i - 1] == b'/' || bytes[i - 1] == b'\\';
            let after = bytes.get(i + dots);
            let after_ok = matches!(after, None | Some(b'/') | Some(b'\\'));
            if before_ok && after_ok {
                return false;
            }
        }
        i += 1;
    }
    true
}

/// Ordered mapping of capability name to optional value, as parsed from a
/// pkt-line's trailing capability tail.
pub type Capabilities = HashMap<String, Option<String>>;

fn is_hex40(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// `true` iff `token` matches a single capability-tail element:
/// `[A-Za-z0-9_\-]+(?:=[\w.\-_/]+)?`.
fn is_valid_capability_token(token: &str) -> bool {
    let (key, value) = match token.split_once('=') {
        Some((k, v)) => (k, Some(v)),
        None => (token, None),
    };
    let key_ok = !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    let value_ok = match value {
        Some(v) => {
            !v.is_empty()
                && v.bytes()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-' | b'/'))
        }
        None => true,
    };
    key_ok && value_ok
}

/// Parses the text following a ref/oid up to (but not including) the
/// trailing `\n`, given that the first byte after the fixed-width field was
/// a space (the capability-tail group's only entry point). Returns `None`
/// if any token fails the capability grammar — matching full-regex
/// backtracking failure, the whole frame is then treated as non-matching.
///
/// An empty `tail` is the zero-repetition case of the group and always
/// matches. Any other empty token — produced by two consecutive spaces, or
/// a leading/trailing space within a non-empty tail — has no path through
/// the anchored regex (each repetition needs a capability char right after
/// its separating space), so it invalidates the whole frame rather than
/// being skipped.
fn parse_capability_tail_strict(tail: &str) -> Option<Capabilities> {
    if tail.is_empty() {
        return Some(Capabilities::new());
    }
    let mut capabilities = Capabilities::new();
    for token in tail.split(' ') {
        if token.is_empty() || !is_valid_capability_token(token) {
            return None;
        }
        match token.split_once('=') {
            Some((key, value)) => {
                capabilities.insert(key.to_string(), Some(value.to_string()));
            }
            None => {
                capabilities.insert(token.to_string(), None);
            }
        }
    }
    Some(capabilities)
}

/// Splits `body` at the first occurrence of a space, NUL, or newline,
/// mirroring the `[^\n\0 ]*?` character class used for `ref` in the
/// receive-pack grammar — that charclass can never consume a delimiter, so
/// lazy matching always stops exactly there.
fn split_at_delimiter(body: &str) -> (&str, Option<u8>, &str) {
    match body.find(['\n', '\0', ' ']) {
        Some(idx) => (&body[..idx], Some(body.as_bytes()[idx]), &body[idx + 1..]),
        None => (body, None, ""),
    }
}

/// Attempts to parse one receive-pack pkt-line frame (the full frame bytes,
/// including the 4-byte length prefix). Returns `None` if it doesn't match
/// the expected shape — such frames are silently ignored by the caller.
///
/// Faithful to the literal regex in spec.md §4.3: because `ref`'s character
/// class excludes NUL, a frame whose ref is followed by the conventional
/// `\0`-separated capability list (as real `git` emits on the first ref
/// line of a push) does not match at all and is dropped, just as a regex
/// engine evaluating that pattern against that byte sequence would.
fn parse_receive_pack_frame(frame: &[u8]) -> Option<(Command, Capabilities)> {
    if frame.len() < 5 || frame[frame.len() - 1] != b'\n' {
        return None;
    }
    let body = std::str::from_utf8(&frame[4..frame.len() - 1]).ok()?;

    let mut parts = body.splitn(3, ' ');
    let old_oid = parts.next()?;
    let new_oid = parts.next()?;
    let rest = parts.next()?;
    if !is_hex40(old_oid) || !is_hex40(new_oid) {
        return None;
    }

    let (ref_name, delimiter, tail) = split_at_delimiter(rest);
    if !ref_name.starts_with("refs/") {
        return None;
    }
    let capabilities = match delimiter {
        None => parse_capability_tail_strict(tail)?,
        Some(b' ') => parse_capability_tail_strict(tail)?,
        _ => return None, // NUL (or a literal newline mid-ref) never matches
    };

    let kind = if old_oid == ZERO_OID {
        ReceiveKind::Create
    } else if new_oid == ZERO_OID {
        ReceiveKind::Delete
    } else {
        ReceiveKind::Update
    };

    Some((
        Command::Receive {
            kind,
            old_oid: old_oid.to_string(),
            new_oid: new_oid.to_string(),
            ref_name: ref_name.to_string(),
        },
        capabilities,
    ))
}

/// Attempts to parse one upload-pack pkt-line frame, same shape as
/// [`parse_receive_pack_frame`] but `oid` is a fixed-width field so there's
/// no ambiguous delimiter scan.
fn parse_upload_pack_frame(frame: &[u8]) -> Option<(Command, Capabilities)> {
    if frame.len() < 5 || frame[frame.len() - 1] != b'\n' {
        return None;
    }
    let body = std::str::from_utf8(&frame[4..frame.len() - 1]).ok()?;

    let mut parts = body.splitn(2, ' ');
    let kind_token = parts.next()?;
    let kind = match kind_token {
        "want" => UploadKind::Want,
        "have" => UploadKind::Have,
        _ => return None,
    };
    let rest = parts.next()?;

    if rest.len() < 40 {
        return None;
    }
    let (oid, tail) = rest.split_at(40);
    if !is_hex40(oid) {
        return None;
    }

    let capabilities = if tail.is_empty() {
        Capabilities::new()
    } else if let Some(tail) = tail.strip_prefix(' ') {
        parse_capability_tail_strict(tail)?
    } else {
        return None;
    };

    Some((
        Command::Upload {
            kind,
            oid: oid.to_string(),
        },
        capabilities,
    ))
}

/// Parses a complete (already buffered) rpc request body into commands and
/// capabilities. Bodies are typically small negotiation payloads followed
/// by a binary pack; frames that don't match either grammar (pack bytes,
/// flush packets, shallow/other side-channel lines) are ignored.
pub fn parse_body(service: Service, body: &[u8]) -> Result<(Vec<Command>, Capabilities), PktLineError> {
    let mut commands = Vec::new();
    let mut capabilities = Capabilities::new();
    let mut reader = PacketReader::new();

    reader.push_chunk(body, |frame| {
        let parsed = match service {
            Service::ReceivePack => parse_receive_pack_frame(frame),
            Service::UploadPack => parse_upload_pack_frame(frame),
        };
        if let Some((command, caps)) = parsed {
            commands.push(command);
            capabilities.extend(caps);
        }
    })?;
    reader.finish()?;

    Ok((commands, capabilities))
}

/// The immutable-after-construction half of a request, plus the two fields
/// the controller may mutate (`status`, `path`).
#[derive(Debug, Clone)]
pub struct RequestData {
    pub body: Bytes,
    pub headers: Headers,
    pub is_advertisement: bool,
    pub service: Option<Service>,
    pub path: String,
    pub capabilities: Capabilities,
    pub commands: Vec<Command>,
    pub status: Status,
}

impl RequestData {
    /// Builds a `RequestData` from already-classified dispatch info and a
    /// fully buffered body. For advertisement requests the body is ignored
    /// (empty commands/capabilities); for rpc requests with a known service
    /// the body is parsed via [`parse_body`].
    pub fn new(dispatch: Dispatch, headers: Headers, body: Bytes) -> Result<Self, PktLineError> {
        let (commands, capabilities) = if !dispatch.is_advertisement {
            if let Some(service) = dispatch.service {
                parse_body(service, &body)?
            } else {
                (Vec::new(), Capabilities::new())
            }
        } else {
            (Vec::new(), Capabilities::new())
        };

        Ok(Self {
            body,
            headers,
            is_advertisement: dispatch.is_advertisement,
            service: dispatch.service,
            path: dispatch.path,
            capabilities,
            commands,
            status: Status::Pending,
        })
    }
}

/// Buffers an async byte stream fully, driving it through a [`PacketReader`]
/// so a caller can both validate framing eagerly and inspect the raw bytes
/// once complete. Used by the host binding when the service/advertisement
/// classification is already known (see `main.rs`).
pub async fn buffer_body<S, E>(mut stream: S) -> Result<Bytes, PktLineError>
where
    S: futures_util::Stream<Item = Result<Bytes, E>> + Unpin,
{
    use futures_util::StreamExt;

    let mut out = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else {
            break;
        };
        out.extend_from_slice(&chunk);
    }
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_table_advertisement_upload_pack() {
        let d = dispatch("GET", "/foo/info/refs", "service=git-upload-pack", None).unwrap();
        assert!(d.is_advertisement);
        assert_eq!(d.service, Some(Service::UploadPack));
        assert_eq!(d.path, "foo");
    }

    #[test]
    fn dispatch_table_advertisement_unknown_service() {
        let d = dispatch("GET", "/foo/info/refs", "", None).unwrap();
        assert!(d.is_advertisement);
        assert_eq!(d.service, None);
    }

    #[test]
    fn dispatch_table_advertisement_non_get() {
        let d = dispatch("POST", "/foo/info/refs", "service=git-upload-pack", None).unwrap();
        assert!(d.is_advertisement);
        assert_eq!(d.service, None);
    }

    #[test]
    fn dispatch_table_rpc_upload_pack() {
        let d = dispatch(
            "POST",
            "/foo/git-upload-pack",
            "",
            Some("application/x-git-upload-pack-request"),
        )
        .unwrap();
        assert!(!d.is_advertisement);
        assert_eq!(d.service, Some(Service::UploadPack));
        assert_eq!(d.path, "foo");
    }

    #[test]
    fn dispatch_table_rpc_wrong_content_type() {
        let d = dispatch("POST", "/foo/git-receive-pack", "", Some("text/plain")).unwrap();
        assert_eq!(d.service, None);
        assert!(!d.is_advertisement);
    }

    #[test]
    fn dispatch_table_rpc_not_post() {
        let d = dispatch("GET", "/foo/git-receive-pack", "", None).unwrap();
        assert_eq!(d.service, None);
    }

    #[test]
    fn dispatch_table_unmatched_path_is_none() {
        assert_eq!(dispatch("GET", "/foo/bar", "", None), None);
    }

    #[test]
    fn path_validation_rejects_dot_segments() {
        assert!(!is_path_valid("../etc/passwd"));
        assert!(!is_path_valid("foo/../bar"));
        assert!(!is_path_valid("./foo"));
        assert!(is_path_valid("foo/bar.git"));
        assert!(is_path_valid("foo..bar"));
    }

    #[test]
    fn parses_receive_pack_update_command() {
        let old = "0".repeat(40);
        let new = "1".repeat(40);
        let line = format!("{old} {new} refs/heads/main\n");
        let frame = format!("{:04x}{line}", line.len() + 4);
        let (commands, _) = parse_body(Service::ReceivePack, frame.as_bytes()).unwrap();
        assert_eq!(commands.len(), 1);
        match &commands[0] {
            Command::Receive {
                kind, old_oid, new_oid, ref_name,
            } => {
                assert_eq!(*kind, ReceiveKind::Update);
                assert_eq!(old_oid, &old);
                assert_eq!(new_oid, &new);
                assert_eq!(ref_name, "refs/heads/main");
            }
            _ => panic!("wrong command variant"),
        }
    }

    #[test]
    fn parses_receive_pack_create_and_delete() {
        let zero = ZERO_OID.to_string();
        let oid = "a".repeat(40);

        let create_line = format!("{zero} {oid} refs/heads/new\n");
        let create_frame = format!("{:04x}{create_line}", create_line.len() + 4);
        let (commands, _) = parse_body(Service::ReceivePack, create_frame.as_bytes()).unwrap();
        assert!(matches!(
            commands[0],
            Command::Receive { kind: ReceiveKind::Create, .. }
        ));

        let delete_line = format!("{oid} {zero} refs/heads/old\n");
        let delete_frame = format!("{:04x}{delete_line}", delete_line.len() + 4);
        let (commands, _) = parse_body(Service::ReceivePack, delete_frame.as_bytes()).unwrap();
        assert!(matches!(
            commands[0],
            Command::Receive { kind: ReceiveKind::Delete, .. }
        ));
    }

    #[test]
    fn parses_capability_tail_with_key_value_and_bare_tokens() {
        let old = "0".repeat(40);
        let new = "1".repeat(40);
        let line = format!("{old} {new} refs/heads/main report-status side-band-64k agent=git/2.40\n");
        let frame = format!("{:04x}{line}", line.len() + 4);
        let (commands, capabilities) = parse_body(Service::ReceivePack, frame.as_bytes()).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(capabilities.get("side-band-64k"), Some(&None));
        assert_eq!(
            capabilities.get("agent"),
            Some(&Some("git/2.40".to_string()))
        );
    }

    #[test]
    fn nul_separated_capability_tail_drops_the_whole_frame() {
        // real `git push` puts a NUL before the capability list on the first
        // ref line; `ref`'s character class excludes NUL, so the regex in
        // spec.md §4.3 never matches this shape and the frame is ignored.
        let old = "0".repeat(40);
        let new = "1".repeat(40);
        let line = format!("{old} {new} refs/heads/main\0report-status\n");
        let frame = format!("{:04x}{line}", line.len() + 4);
        let (commands, capabilities) = parse_body(Service::ReceivePack, frame.as_bytes()).unwrap();
        assert!(commands.is_empty());
        assert!(capabilities.is_empty());
    }

    #[test]
    fn double_space_in_capability_tail_drops_the_whole_frame() {
        // Two consecutive spaces put an empty token between two real ones;
        // the anchored grammar's repetition group requires a capability
        // char immediately after each separating space, so there's no way
        // for a regex engine to match past it and the whole frame fails.
        let old = "0".repeat(40);
        let new = "1".repeat(40);
        let line = format!("{old} {new} refs/heads/main report-status  side-band-64k\n");
        let frame = format!("{:04x}{line}", line.len() + 4);
        let (commands, capabilities) = parse_body(Service::ReceivePack, frame.as_bytes()).unwrap();
        assert!(commands.is_empty());
        assert!(capabilities.is_empty());
    }

    #[test]
    fn parses_upload_pack_want_have() {
        let oid = "f".repeat(40);
        let line = format!("want {oid} side-band-64k\n");
        let frame = format!("{:04x}{line}", line.len() + 4);
        let (commands, capabilities) = parse_body(Service::UploadPack, frame.as_bytes()).unwrap();
        assert!(matches!(
            commands[0],
            Command::Upload { kind: UploadKind::Want, .. }
        ));
        assert!(capabilities.contains_key("side-band-64k"));
    }

    #[test]
    fn ignores_frames_matching_neither_grammar() {
        let (commands, _) = parse_body(Service::UploadPack, b"0000").unwrap();
        assert!(commands.is_empty());
    }
}
