//! Candidate line rewriting
//!
//! Negotiation descriptions are line oriented. A host candidate line has
//! the form
//!
//! ```text
//! a=candidate:<foundation> <component> <transport> <priority> <address> <port> typ host [<ext>...]
//! ```
//!
//! Only host candidates can be redirected, since they are the only ones
//! whose address is dialed directly.

use crate::error::SocksRtcError;
use crate::socks::Endpoint;

/// Prefix of a candidate attribute line in a description
pub const CANDIDATE_LINE_PREFIX: &str = "a=candidate:";

const ADDRESS_FIELD: usize = 4;
const PORT_FIELD: usize = 5;
const TYP_FIELD: usize = 6;
const TYPE_FIELD: usize = 7;

fn invalid(line: &str, reason: &str) -> SocksRtcError {
    SocksRtcError::InvalidCandidate(format!("{}: {:?}", reason, line))
}

/// Whether a description line is a candidate line
pub fn is_candidate_line(line: &str) -> bool {
    line.trim_start().starts_with(CANDIDATE_LINE_PREFIX)
}

/// Split a candidate into space separated fields, checking it is a host
/// candidate with a numeric port
fn host_candidate_fields(line: &str) -> Result<Vec<&str>, SocksRtcError> {
    let body = line.trim_start().trim_end_matches(&['\r', '\n'][..]);
    let body = body.strip_prefix("a=").unwrap_or(body);
    if !body.starts_with("candidate:") {
        return Err(invalid(line, "not a candidate line"));
    }

    let fields: Vec<&str> = body.split(' ').collect();
    if fields.len() <= TYPE_FIELD || fields[TYP_FIELD] != "typ" {
        return Err(invalid(line, "malformed candidate"));
    }
    if fields[TYPE_FIELD] != "host" {
        return Err(invalid(line, "not a host candidate"));
    }
    if fields[ADDRESS_FIELD].is_empty() {
        return Err(invalid(line, "empty address"));
    }
    fields[PORT_FIELD]
        .parse::<u16>()
        .map_err(|_| invalid(line, "bad port"))?;

    Ok(fields)
}

/// Address and port of a host candidate line
pub fn extract_endpoint_from_candidate_line(line: &str) -> Result<Endpoint, SocksRtcError> {
    let fields = host_candidate_fields(line)?;
    let port = fields[PORT_FIELD]
        .parse::<u16>()
        .map_err(|_| invalid(line, "bad port"))?;
    Ok(Endpoint::new(fields[ADDRESS_FIELD], port))
}

/// Replace the address and port of a host candidate line
///
/// Every other token, leading whitespace and the `a=` prefix if present
/// are kept verbatim.
pub fn set_candidate_line_endpoint(line: &str, endpoint: &Endpoint) -> Result<String, SocksRtcError> {
    host_candidate_fields(line)?;

    let body = line.trim_start();
    let indent = &line[..line.len() - body.len()];
    let port = endpoint.port.to_string();
    let mut rebuilt = Vec::new();
    for (index, field) in body.split(' ').enumerate() {
        rebuilt.push(match index {
            ADDRESS_FIELD => endpoint.address.as_str(),
            PORT_FIELD => port.as_str(),
            _ => field,
        });
    }
    Ok(format!("{}{}", indent, rebuilt.join(" ")))
}

/// Drop every candidate line, keeping all other lines and their endings
pub fn filter_candidates_from_sdp(sdp: &str) -> String {
    sdp.split_inclusive('\n')
        .filter(|line| !is_candidate_line(line))
        .collect()
}

/// All candidate lines of a description, without line endings
pub fn candidate_lines(sdp: &str) -> impl Iterator<Item = &str> {
    sdp.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| is_candidate_line(line))
}

/// First candidate line that parses as a host candidate
pub fn first_host_candidate(sdp: &str) -> Option<&str> {
    candidate_lines(sdp).find(|line| host_candidate_fields(line).is_ok())
}

/// Append a line, reusing the description's line ending
pub fn append_line(sdp: &str, line: &str) -> String {
    let eol = if sdp.contains("\r\n") { "\r\n" } else { "\n" };
    let mut out = String::with_capacity(sdp.len() + line.len() + eol.len() * 2);
    out.push_str(sdp);
    if !out.is_empty() && !out.ends_with('\n') {
        out.push_str(eol);
    }
    out.push_str(line);
    out.push_str(eol);
    out
}
