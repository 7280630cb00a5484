//! Known-hosts (client TOFU store), authorized-keys (server allowlist), and
//! remote key fetch (spec §6, SPEC_FULL.md §E).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::Engine;
use ed25519_dalek::VerifyingKey;
use tracing::warn;

use crate::error::{AsciiChatError, Result};

/// One parsed known-hosts line: `ip:port key-type base64(key) [comment]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownHostEntry {
    pub host: String,
    pub port: u16,
    pub key_type: String,
    pub key: [u8; 32],
}

fn split_host_port(addr: &str) -> Option<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        // IPv6, bracketed: [::1]:1234
        let (host, rest) = rest.split_once(']')?;
        let port_str = rest.strip_prefix(':')?;
        return Some((host.to_string(), port_str.parse().ok()?));
    }
    let (host, port_str) = addr.rsplit_once(':')?;
    Some((host.to_string(), port_str.parse().ok()?))
}

impl KnownHostEntry {
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let mut parts = line.split_whitespace();
        let addr = parts.next()?;
        let key_type = parts.next()?.to_string();
        let key_b64 = parts.next()?;
        let (host, port) = split_host_port(addr)?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(key_b64).ok()?;
        let key: [u8; 32] = bytes.try_into().ok()?;
        Some(Self { host, port, key_type, key })
    }

    pub fn format_line(&self) -> String {
        let addr = if self.host.contains(':') { format!("[{}]:{}", self.host, self.port) } else { format!("{}:{}", self.host, self.port) };
        format!("{} {} {}", addr, self.key_type, base64::engine::general_purpose::STANDARD.encode(self.key))
    }
}

/// Trust-on-first-use store of server fingerprints keyed by `ip:port`.
pub struct KnownHostsStore {
    path: PathBuf,
    entries: Vec<KnownHostEntry>,
}

impl KnownHostsStore {
    /// Default location: `$HOME/.ascii-chat/known_hosts` (spec §6: "the
    /// home-directory environment variable determines where known-hosts...
    /// live by default").
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().ok_or(AsciiChatError::Allocation("no home directory"))?;
        Ok(home.join(".ascii-chat").join("known_hosts"))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let entries = match fs::read_to_string(path) {
            Ok(contents) => contents.lines().filter_map(KnownHostEntry::parse_line).collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(AsciiChatError::Io(e)),
        };
        Ok(Self { path: path.to_path_buf(), entries })
    }

    pub fn lookup(&self, host: &str, port: u16) -> Option<&KnownHostEntry> {
        self.entries.iter().find(|e| e.host == host && e.port == port)
    }

    /// Record a newly trusted key (first connection to this host:port).
    pub fn append(&mut self, entry: KnownHostEntry) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", entry.format_line())?;
        self.entries.push(entry);
        Ok(())
    }
}

/// Outcome of checking a presented server identity against the known-hosts
/// store or an explicit pin (spec §4.2 step 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinVerdict {
    /// First time seeing this host; the caller should record it (TOFU).
    TrustOnFirstUse,
    /// Matches the pin or the known-hosts record.
    Match,
    /// Mismatch: possible MITM. Carries the two keys so the caller can
    /// print the SSH-style warning (spec §4.2, §7 "Surfaced to user").
    Mismatch,
}

pub fn verify_pin(pinned: Option<[u8; 32]>, known: Option<&KnownHostEntry>, presented: &[u8; 32]) -> PinVerdict {
    if let Some(pin) = pinned {
        return if &pin == presented { PinVerdict::Match } else { PinVerdict::Mismatch };
    }
    match known {
        Some(entry) if &entry.key == presented => PinVerdict::Match,
        Some(_) => PinVerdict::Mismatch,
        None => PinVerdict::TrustOnFirstUse,
    }
}

/// Format the loud multi-line mismatch warning spec §4.2/§7 requires,
/// printing both keys in hex.
pub fn format_mismatch_warning(expected: &[u8; 32], actual: &[u8; 32]) -> String {
    format!(
        "\n\
         *****************************************************\n\
         * WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!   *\n\
         *****************************************************\n\
         It is possible that someone is intercepting this connection\n\
         (a man-in-the-middle attack), or the server's identity key has\n\
         legitimately changed.\n\
         Expected key: {}\n\
         Offered key:  {}\n\
         Refusing to connect.\n",
        hex_encode(expected),
        hex_encode(actual),
    )
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// One `authorized_keys`-style line: server-side allowlist of client
/// identities. Only Ed25519 lines are understood; anything else is
/// ignored with a warning (spec §6).
pub fn parse_authorized_keys(contents: &str) -> Vec<VerifyingKey> {
    let mut keys = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(key_type) = parts.next() else { continue };
        if key_type != "ssh-ed25519" {
            warn!(line = lineno + 1, key_type, "ignoring non-Ed25519 authorized_keys line");
            continue;
        }
        let Some(key_b64) = parts.next() else { continue };
        match decode_ssh_ed25519(key_b64) {
            Some(key) => keys.push(key),
            None => warn!(line = lineno + 1, "malformed ssh-ed25519 authorized_keys line"),
        }
    }
    keys
}

/// Decode the base64 blob of an `ssh-ed25519 AAAA...` line: a length-prefixed
/// key-type string followed by the 32-byte public key, per the SSH wire
/// format used by `authorized_keys`/`.keys` endpoints.
fn decode_ssh_ed25519(b64: &str) -> Option<VerifyingKey> {
    let blob = base64::engine::general_purpose::STANDARD.decode(b64).ok()?;
    if blob.len() < 4 {
        return None;
    }
    let type_len = u32::from_be_bytes(blob[0..4].try_into().ok()?) as usize;
    let after_type = 4 + type_len;
    if blob.len() < after_type + 4 {
        return None;
    }
    if &blob[4..after_type] != b"ssh-ed25519" {
        return None;
    }
    let key_len = u32::from_be_bytes(blob[after_type..after_type + 4].try_into().ok()?) as usize;
    let key_start = after_type + 4;
    if blob.len() < key_start + key_len || key_len != 32 {
        return None;
    }
    let key_bytes: [u8; 32] = blob[key_start..key_start + 32].try_into().ok()?;
    VerifyingKey::from_bytes(&key_bytes).ok()
}

pub fn load_authorized_keys(path: &Path) -> Result<Vec<VerifyingKey>> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_authorized_keys(&contents))
}

/// Parse a `--client-keys` CLI value: either a comma-separated list of
/// base64/ssh-format keys, or a path to an authorized_keys-style file.
pub fn resolve_client_keys(value: &str) -> Result<Vec<VerifyingKey>> {
    let path = Path::new(value);
    if path.is_file() {
        return load_authorized_keys(path);
    }
    Ok(parse_authorized_keys(&value.replace(',', "\n")))
}

/// Fetch `https://{github.com,gitlab.com}/{user}.keys`, filter to the first
/// Ed25519 entry (spec §6). Blocking, via `ureq` (the pack's `velocut`
/// crate already reaches for `ureq` for this shape of one-shot GET).
pub fn fetch_remote_ed25519_key(provider: &str, user: &str) -> Result<VerifyingKey> {
    let host = match provider {
        "github" => "github.com",
        "gitlab" => "gitlab.com",
        _ => return Err(AsciiChatError::Allocation("unknown remote key provider, expected github or gitlab")),
    };
    let url = format!("https://{host}/{user}.keys");
    let body = ureq::get(&url)
        .call()
        .map_err(|_| AsciiChatError::Unreachable)?
        .into_string()
        .map_err(|_| AsciiChatError::Unreachable)?;
    parse_authorized_keys(&body.lines().map(|l| format!("ssh-ed25519 {}", l.trim())).collect::<Vec<_>>().join("\n"))
        .into_iter()
        .next()
        .ok_or(AsciiChatError::HandshakeViolation("no Ed25519 key found for remote user"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_host_line_round_trips() {
        let entry = KnownHostEntry { host: "example.com".into(), port: 27224, key_type: "ed25519".into(), key: [7u8; 32] };
        let line = entry.format_line();
        let parsed = KnownHostEntry::parse_line(&line).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn ipv6_known_host_line_round_trips() {
        let entry = KnownHostEntry { host: "::1".into(), port: 27224, key_type: "ed25519".into(), key: [1u8; 32] };
        let line = entry.format_line();
        assert!(line.starts_with("[::1]:27224"));
        let parsed = KnownHostEntry::parse_line(&line).unwrap();
        assert_eq!(parsed, entry);
    }

    #[test]
    fn comment_lines_are_skipped() {
        assert!(KnownHostEntry::parse_line("# a comment").is_none());
        assert!(KnownHostEntry::parse_line("").is_none());
    }

    #[test]
    fn pin_mismatch_detected() {
        let expected = [1u8; 32];
        let actual = [2u8; 32];
        assert_eq!(verify_pin(Some(expected), None, &actual), PinVerdict::Mismatch);
        assert_eq!(verify_pin(Some(expected), None, &expected), PinVerdict::Match);
    }

    #[test]
    fn unknown_host_is_tofu() {
        assert_eq!(verify_pin(None, None, &[9u8; 32]), PinVerdict::TrustOnFirstUse);
    }

    #[test]
    fn mismatch_warning_contains_both_keys_hex() {
        let warning = format_mismatch_warning(&[0xAB; 32], &[0xCD; 32]);
        assert!(warning.contains(&"ab".repeat(32)));
        assert!(warning.contains(&"cd".repeat(32)));
    }

    #[test]
    fn authorized_keys_ignores_non_ed25519() {
        let contents = "ssh-rsa AAAAB3NzaC1yc2EA\nssh-ed25519 not-valid-base64\n";
        let keys = parse_authorized_keys(contents);
        assert!(keys.is_empty());
    }
}
