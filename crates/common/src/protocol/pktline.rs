// Git pkt-line framing for the smart-HTTP receive-pack exchange.
//
// A push request body is a list of ref update commands, each in its own
// pkt-line, terminated by a flush packet and followed by the packfile:
//
//   <4 hex len><old> <new> <ref>\0<capabilities>\n
//   <4 hex len><old> <new> <ref>\n
//   0000
//   PACK...
//
// Only the command list is interpreted here; the pack is left to git.

use thiserror::Error;

use crate::types::{BranchName, CommitHash, NameError};

/// Flush packet terminating a pkt-line section.
pub const FLUSH_PKT: &[u8] = b"0000";

/// Largest pkt-line git will produce (length prefix included).
const MAX_PKT_LEN: usize = 65_520;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PktLineError {
    #[error("request ended inside a pkt-line header at offset {0}")]
    TruncatedHeader(usize),

    #[error("invalid pkt-line length {0:?}")]
    InvalidLength(String),

    #[error("pkt-line at offset {offset} declares {declared} bytes but only {available} remain")]
    TruncatedPayload { offset: usize, declared: usize, available: usize },

    #[error("command list is not terminated by a flush packet")]
    MissingFlush,

    #[error("malformed ref update command: {0:?}")]
    MalformedCommand(String),

    #[error("invalid object id in command: {0}")]
    InvalidObjectId(#[from] NameError),

    #[error("signed pushes are not supported")]
    PushCertUnsupported,
}

/// One `<old> <new> <ref>` line. Absent sides are the zero id on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdateCommand {
    pub old: Option<CommitHash>,
    pub new: Option<CommitHash>,
    pub refname: String,
}

impl RefUpdateCommand {
    /// Branch targeted by this command, if it updates `refs/heads/*`.
    pub fn branch(&self) -> Result<BranchName, NameError> {
        BranchName::from_ref(&self.refname)
    }

    pub fn is_create(&self) -> bool {
        self.old.is_none() && self.new.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.new.is_none()
    }
}

/// Parsed command section of a receive-pack request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceiveRequest {
    pub commands: Vec<RefUpdateCommand>,
    pub capabilities: Vec<String>,
    /// Number of `shallow` lines that preceded the commands.
    pub shallow_lines: usize,
    /// Offset of the first byte after the flush packet (start of the pack).
    pub pack_offset: usize,
}

/// Parse the command list of a receive-pack request body.
pub fn parse_receive_request(body: &[u8]) -> Result<ReceiveRequest, PktLineError> {
    let mut request = ReceiveRequest::default();
    let mut offset = 0;

    loop {
        if offset == body.len() {
            return Err(PktLineError::MissingFlush);
        }
        let header = body.get(offset..offset + 4).ok_or(PktLineError::TruncatedHeader(offset))?;
        let header = std::str::from_utf8(header)
            .map_err(|_| PktLineError::InvalidLength(String::from_utf8_lossy(header).into()))?;
        let len = usize::from_str_radix(header, 16)
            .map_err(|_| PktLineError::InvalidLength(header.to_string()))?;

        if len == 0 {
            request.pack_offset = offset + 4;
            return Ok(request);
        }
        if !(5..=MAX_PKT_LEN).contains(&len) {
            return Err(PktLineError::InvalidLength(header.to_string()));
        }

        let available = body.len() - offset;
        if len > available {
            return Err(PktLineError::TruncatedPayload { offset, declared: len, available });
        }

        let payload = &body[offset + 4..offset + len];
        offset += len;
        parse_command_line(payload, &mut request)?;
    }
}

fn parse_command_line(payload: &[u8], request: &mut ReceiveRequest) -> Result<(), PktLineError> {
    let line = String::from_utf8_lossy(payload);
    let line = line.strip_suffix('\n').unwrap_or(&line);

    if line.starts_with("shallow ") {
        request.shallow_lines += 1;
        return Ok(());
    }
    if line.starts_with("push-cert") {
        return Err(PktLineError::PushCertUnsupported);
    }

    let (command, capabilities) = match line.split_once('\0') {
        Some((command, caps)) => (command, Some(caps)),
        None => (line, None),
    };
    if let Some(caps) = capabilities {
        if request.commands.is_empty() {
            request.capabilities = caps.split_whitespace().map(ToOwned::to_owned).collect();
        }
    }

    let mut parts = command.splitn(3, ' ');
    let (Some(old), Some(new), Some(refname)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(PktLineError::MalformedCommand(command.to_string()));
    };
    if refname.is_empty() {
        return Err(PktLineError::MalformedCommand(command.to_string()));
    }

    request.commands.push(RefUpdateCommand {
        old: CommitHash::parse_optional(old)?,
        new: CommitHash::parse_optional(new)?,
        refname: refname.to_string(),
    });
    Ok(())
}

/// Frame `payload` as a single pkt-line.
pub fn encode_pkt_line(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{:04x}", payload.len() + 4).into_bytes();
    out.extend_from_slice(payload);
    out
}

/// First section of a smart-HTTP `info/refs` response for `service`.
pub fn service_announcement(service: &str) -> Vec<u8> {
    let mut out = encode_pkt_line(format!("# service={service}\n").as_bytes());
    out.extend_from_slice(FLUSH_PKT);
    out
}

/// Encode a command list the way a git client sends it (used by tests and
/// by the JSON push endpoint's callers).
pub fn encode_commands(commands: &[RefUpdateCommand], capabilities: &[&str]) -> Vec<u8> {
    let mut out = Vec::new();
    for (index, command) in commands.iter().enumerate() {
        let width = command.old.as_ref().or(command.new.as_ref()).map_or(40, |h| h.as_str().len());
        let zero = "0".repeat(width);
        let old = command.old.as_ref().map_or(zero.as_str(), CommitHash::as_str);
        let new = command.new.as_ref().map_or(zero.as_str(), CommitHash::as_str);
        let mut line = format!("{old} {new} {}", command.refname);
        if index == 0 && !capabilities.is_empty() {
            line.push('\0');
            line.push_str(&capabilities.join(" "));
        }
        line.push('\n');
        out.extend(encode_pkt_line(line.as_bytes()));
    }
    out.extend_from_slice(FLUSH_PKT);
    out
}
