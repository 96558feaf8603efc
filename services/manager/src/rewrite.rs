//! Request rewrites and `/…/print` query translation.
//!
//! Pure functions over word lists; the upstream session applies them before
//! every RPC.  Three rewrites exist because the upstream devices want these
//! requests in a different shape than the clients send them:
//!
//! 1. `/ip/proxy/access` + `=redirect-to=` becomes an explicit
//!    `action=redirect` rule with the URL in `action-data`.
//! 2. `=dst-address=` hostnames in firewall add commands must be resolved to
//!    IPv4 literals before the device sees them.
//! 3. `=local-address=` in PPP profiles is forced to the device's own host
//!    address.

// ---------------------------------------------------------------------------
// Request-specific rewrites
// ---------------------------------------------------------------------------

/// Rewrite `/ip/proxy/access` requests carrying `=redirect-to=<url>` into
/// `/ip/proxy/access/add =action=redirect … =action-data=<url>`.
///
/// Any pre-existing `=action=` word is dropped; all other words keep their
/// relative order.
pub fn rewrite_proxy_access(words: &mut Vec<String>) {
    let applies = words
        .first()
        .is_some_and(|w| w.starts_with("/ip/proxy/access"))
        && words.iter().any(|w| w.starts_with("=redirect-to="));
    if !applies {
        return;
    }

    let old = std::mem::take(words);
    let mut out = Vec::with_capacity(old.len() + 1);
    out.push("/ip/proxy/access/add".to_owned());
    out.push("=action=redirect".to_owned());
    for part in old.into_iter().skip(1) {
        if let Some(url) = part.strip_prefix("=redirect-to=") {
            out.push(format!("=action-data={}", url));
        } else if part.starts_with("=action=") {
            // superseded by the redirect action
        } else {
            out.push(part);
        }
    }
    *words = out;
}

/// Force `=local-address=` in `/ppp/profile/add|set` to the device host.
pub fn rewrite_local_address(words: &mut [String], device_host: &str) {
    let applies = matches!(
        words.first().map(String::as_str),
        Some("/ppp/profile/add") | Some("/ppp/profile/set")
    );
    if !applies {
        return;
    }
    if let Some(word) = words
        .iter_mut()
        .find(|w| w.starts_with("=local-address="))
    {
        *word = format!("=local-address={}", device_host);
    }
}

/// Detect a `=dst-address=` value in a firewall add command that needs DNS
/// resolution.
///
/// Returns the word index and the hostname (trailing `/` trimmed) when the
/// value is not a dotted numeric literal; the caller resolves it and writes
/// the IPv4 literal back into the word.
pub fn dst_address_hostname(words: &[String]) -> Option<(usize, String)> {
    let command = words.first()?;
    if command != "/ip/firewall/filter/add" && command != "/ip/firewall/nat/add" {
        return None;
    }
    for (i, part) in words.iter().enumerate() {
        if let Some(value) = part.strip_prefix("=dst-address=") {
            let hostname = value.trim_end_matches('/');
            if hostname.is_empty() || is_dotted_numeric(hostname) {
                return None;
            }
            return Some((i, hostname.to_owned()));
        }
    }
    None
}

fn is_dotted_numeric(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit()) && s.chars().all(|c| c.is_ascii_digit() || c == '.')
}

// ---------------------------------------------------------------------------
// Request parsing and canonical emission
// ---------------------------------------------------------------------------

/// A client sentence broken into the pieces the wire format distinguishes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedRequest {
    /// The command word exactly as received (e.g. `/ip/address/print`).
    pub command_path: String,
    /// Path segments before the command name.
    pub path: Vec<String>,
    /// Last path segment (`print`, `add`, `set`, …).
    pub command: String,
    /// `=key=value` parameters, order preserved.
    pub params: Vec<(String, String)>,
    /// `?key=value` equality filters, AND-combined, translated natively.
    pub filters: Vec<(String, String)>,
    /// `?key` words with no value: the upstream query language cannot
    /// express them the way we emit filters, so they are applied
    /// client-side over the full result.
    pub presence_filters: Vec<String>,
    /// `=.proplist=` projection fields.
    pub proplist: Vec<String>,
}

/// Parse a client sentence into command path, parameters, filters, and
/// projection.
pub fn parse_request(words: &[String]) -> ParsedRequest {
    let command_path = words.first().cloned().unwrap_or_default();
    let mut segments: Vec<String> = command_path
        .trim_matches('/')
        .split('/')
        .map(str::to_owned)
        .collect();
    let command = segments.pop().unwrap_or_default();

    let mut request = ParsedRequest {
        command_path,
        path: segments,
        command,
        ..ParsedRequest::default()
    };

    for part in words.iter().skip(1) {
        if let Some(fields) = part.strip_prefix("=.proplist=") {
            request.proplist = fields.split(',').map(str::to_owned).collect();
        } else if let Some(query) = part.strip_prefix('?') {
            if query.starts_with('#') {
                // client-sent combinators are regenerated on emission
                continue;
            }
            match query.split_once('=') {
                Some((k, v)) => request.filters.push((k.to_owned(), v.to_owned())),
                None => request.presence_filters.push(query.to_owned()),
            }
        } else if let Some(attr) = part.strip_prefix('=') {
            match attr.split_once('=') {
                Some((k, v)) => request.params.push((k.to_owned(), v.to_owned())),
                None => request.params.push((attr.to_owned(), String::new())),
            }
        }
        // bare words carry no meaning here and are dropped
    }
    request
}

/// Emit the canonical wire words for a parsed request.
///
/// Filters only apply to `print`; n equality filters are AND-combined with
/// n-1 `?#&` operator words.
pub fn wire_words(request: &ParsedRequest) -> Vec<String> {
    let mut out = vec![request.command_path.clone()];
    if !request.proplist.is_empty() {
        out.push(format!("=.proplist={}", request.proplist.join(",")));
    }
    for (k, v) in &request.params {
        out.push(format!("={}={}", k, v));
    }
    if request.command == "print" {
        for (k, v) in &request.filters {
            out.push(format!("?{}={}", k, v));
        }
        for _ in 1..request.filters.len() {
            out.push("?#&".to_owned());
        }
    }
    out
}

/// Client-side fallback for filters the wire emission does not cover: keep
/// rows that carry every listed property.
pub fn apply_presence_filters(
    rows: Vec<ros_proto::Attrs>,
    keys: &[String],
) -> Vec<ros_proto::Attrs> {
    if keys.is_empty() {
        return rows;
    }
    rows.into_iter()
        .filter(|row| keys.iter().all(|k| row.iter().any(|(rk, _)| rk == k)))
        .collect()
}
