//! Channel spec value types and the wire encoding
//!
//! A [`ChannelSpec`] identifies one `(importer, resource URI)` pair. Specs
//! are totally ordered (importer first, then URI) so that sets of them can
//! be diffed deterministically, and they serialize to a store-safe string
//! form `<importer>|<encoded-uri>` — the coordination substrate restricts
//! the character set of node content, so URIs are run through a reversible
//! ASCII-safe escape before embedding.

use crate::error::{MeshError, MeshResult};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::OnceLock;
use url::Url;

/// Grammar for importer designations: dot-separated words of
/// `[A-Za-z0-9_-]`, e.g. `csv`, `billing.invoices`.
fn importer_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| regex::Regex::new(r"^(?:[\w-]+\.)*[\w-]+$").unwrap())
}

/// Escape a URI into the `[A-Za-z0-9_\-.]` alphabet.
///
/// Bytes outside `[A-Za-z0-9_-]` become `.XX` (two uppercase hex digits),
/// including `.` itself, which makes the transform reversible.
pub fn encode_uri(uri: &Url) -> String {
    let raw = uri.as_str();
    let mut out = String::with_capacity(raw.len());
    for b in raw.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => out.push(b as char),
            _ => out.push_str(&format!(".{b:02X}")),
        }
    }
    out
}

/// Reverse [`encode_uri`]
pub fn decode_uri(encoded: &str) -> MeshResult<Url> {
    let mut bytes = Vec::with_capacity(encoded.len());
    let mut iter = encoded.bytes();
    while let Some(b) = iter.next() {
        if b == b'.' {
            let hi = iter.next();
            let lo = iter.next();
            let (Some(hi), Some(lo)) = (hi, lo) else {
                return Err(invalid_spec(encoded, "truncated escape sequence"));
            };
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| invalid_spec(encoded, "bad escape sequence"))?;
            bytes.push(hex);
        } else {
            bytes.push(b);
        }
    }
    let raw = String::from_utf8(bytes).map_err(|_| invalid_spec(encoded, "not valid UTF-8"))?;
    Url::parse(&raw).map_err(|e| invalid_spec(encoded, &e.to_string()))
}

fn invalid_spec(spec: &str, reason: &str) -> MeshError {
    MeshError::InvalidSpec {
        spec: spec.to_string(),
        reason: reason.to_string(),
    }
}

/// One `(importer, resource URI)` pair — the atomic unit of assignment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelSpec {
    importer: String,
    uri: Url,
}

impl ChannelSpec {
    /// Build a spec, validating the importer designation
    pub fn new(importer: impl Into<String>, uri: Url) -> MeshResult<Self> {
        let importer = importer.into();
        if !importer_pattern().is_match(&importer) {
            return Err(MeshError::InvalidArgument(format!(
                "importer designation {importer:?} is empty or malformed"
            )));
        }
        Ok(Self { importer, uri })
    }

    pub fn importer(&self) -> &str {
        &self.importer
    }

    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Store-safe string form: `<importer>|<encoded-uri>`
    pub fn to_wire(&self) -> String {
        format!("{}|{}", self.importer, encode_uri(&self.uri))
    }

    /// Parse the store-safe string form
    pub fn from_wire(wire: &str) -> MeshResult<Self> {
        let (importer, encoded) = wire
            .split_once('|')
            .ok_or_else(|| invalid_spec(wire, "missing '|' separator"))?;
        if !importer_pattern().is_match(importer) {
            return Err(invalid_spec(wire, "malformed importer designation"));
        }
        let uri = decode_uri(encoded)?;
        Ok(Self {
            importer: importer.to_string(),
            uri,
        })
    }
}

impl Ord for ChannelSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.importer
            .cmp(&other.importer)
            .then_with(|| self.uri.cmp(&other.uri))
    }
}

impl PartialOrd for ChannelSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChannelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.importer, self.uri)
    }
}

/// Serialize a spec set into the JSON-array-of-strings node content
pub fn encode_spec_list(specs: &BTreeSet<ChannelSpec>) -> Vec<u8> {
    let wire: Vec<String> = specs.iter().map(ChannelSpec::to_wire).collect();
    serde_json::to_vec(&wire).expect("a vec of strings always serializes")
}

/// Parse node content into a spec set. Empty content reads as the empty set.
pub fn decode_spec_list(path: &str, data: &[u8]) -> MeshResult<BTreeSet<ChannelSpec>> {
    if data.is_empty() {
        return Ok(BTreeSet::new());
    }
    let wire: Vec<String> =
        serde_json::from_slice(data).map_err(|e| MeshError::MalformedDocument {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
    wire.iter().map(|s| ChannelSpec::from_wire(s)).collect()
}

/// Diff between two ordered spec sets, tagged with the store version of the
/// mutation that produced it. Derived, never stored.
#[derive(Debug, Clone)]
pub struct ChannelAssignment {
    added: BTreeSet<ChannelSpec>,
    removed: BTreeSet<ChannelSpec>,
    channels: BTreeSet<ChannelSpec>,
    version: i64,
}

impl ChannelAssignment {
    pub fn new(prev: &BTreeSet<ChannelSpec>, next: &BTreeSet<ChannelSpec>, version: i64) -> Self {
        Self {
            added: next.difference(prev).cloned().collect(),
            removed: prev.difference(next).cloned().collect(),
            channels: next.clone(),
            version,
        }
    }

    pub fn added(&self) -> &BTreeSet<ChannelSpec> {
        &self.added
    }

    pub fn removed(&self) -> &BTreeSet<ChannelSpec> {
        &self.removed
    }

    pub fn channels(&self) -> &BTreeSet<ChannelSpec> {
        &self.channels
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Explode into one per-importer assignment for every importer that
    /// appears in the diff or in the resulting channel set.
    pub fn per_importer(&self) -> Vec<ImporterChannelAssignment> {
        let mut importers: BTreeSet<&str> = BTreeSet::new();
        importers.extend(self.added.iter().map(ChannelSpec::importer));
        importers.extend(self.removed.iter().map(ChannelSpec::importer));
        importers.extend(self.channels.iter().map(ChannelSpec::importer));

        let uris_for = |set: &BTreeSet<ChannelSpec>, importer: &str| -> BTreeSet<Url> {
            set.iter()
                .filter(|s| s.importer() == importer)
                .map(|s| s.uri().clone())
                .collect()
        };

        importers
            .into_iter()
            .map(|importer| ImporterChannelAssignment {
                importer: importer.to_string(),
                added: uris_for(&self.added, importer),
                removed: uris_for(&self.removed, importer),
                assigned: uris_for(&self.channels, importer),
                version: self.version,
            })
            .collect()
    }
}

/// Per-importer projection of a [`ChannelAssignment`], delivered to the
/// importer's registered callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImporterChannelAssignment {
    importer: String,
    added: BTreeSet<Url>,
    removed: BTreeSet<Url>,
    assigned: BTreeSet<Url>,
    version: i64,
}

impl ImporterChannelAssignment {
    pub fn new(
        importer: impl Into<String>,
        added: BTreeSet<Url>,
        removed: BTreeSet<Url>,
        assigned: BTreeSet<Url>,
        version: i64,
    ) -> MeshResult<Self> {
        let importer = importer.into();
        if importer.trim().is_empty() {
            return Err(MeshError::InvalidArgument(
                "importer designation is empty".into(),
            ));
        }
        if version < 0 {
            return Err(MeshError::InvalidArgument(format!(
                "assignment version {version} is negative"
            )));
        }
        Ok(Self {
            importer,
            added,
            removed,
            assigned,
            version,
        })
    }

    pub fn importer(&self) -> &str {
        &self.importer
    }

    pub fn added(&self) -> &BTreeSet<Url> {
        &self.added
    }

    pub fn removed(&self) -> &BTreeSet<Url> {
        &self.removed
    }

    pub fn assigned(&self) -> &BTreeSet<Url> {
        &self.assigned
    }

    pub fn version(&self) -> i64 {
        self.version
    }
}

impl fmt::Display for ImporterChannelAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[importer: {}, version: {}, added: {}, removed: {}, assigned: {}]",
            self.importer,
            self.version,
            self.added.len(),
            self.removed.len(),
            self.assigned.len()
        )
    }
}
