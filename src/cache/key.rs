//! Partition names and canonical request identities.

use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::http::Request;

/// The three partition kinds the engine manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PartitionKind {
  /// Precached application shell plus scripts, styles, fonts
  Static,
  /// API data and navigations
  Dynamic,
  Images,
}

impl PartitionKind {
  pub const ALL: [PartitionKind; 3] = [
    PartitionKind::Static,
    PartitionKind::Dynamic,
    PartitionKind::Images,
  ];

  pub fn prefix(self) -> &'static str {
    match self {
      PartitionKind::Static => "static",
      PartitionKind::Dynamic => "dynamic",
      PartitionKind::Images => "images",
    }
  }

  fn from_prefix(prefix: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|k| k.prefix() == prefix)
  }
}

/// A managed partition name such as `static-v3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionName {
  pub kind: PartitionKind,
  pub generation: u32,
}

impl PartitionName {
  pub fn new(kind: PartitionKind, generation: u32) -> Self {
    Self { kind, generation }
  }

  /// Parse a partition name exactly as `Display` writes it. Returns `None`
  /// for anything else: unmanaged names, and managed-looking names with a
  /// leading zero or a version past `u32::MAX`.
  pub fn parse(name: &str) -> Option<Self> {
    let (kind, version) = split_managed(name)?;
    if version.len() > 1 && version.starts_with('0') {
      return None;
    }
    let generation = version.parse().ok()?;
    Some(Self { kind, generation })
  }

  /// Whether `name` has the managed shape `{static|dynamic|images}-v{digits}`.
  /// Such names belong to the engine even when they do not parse; they are
  /// reclaimed on activation.
  pub fn is_managed(name: &str) -> bool {
    split_managed(name).is_some()
  }
}

fn split_managed(name: &str) -> Option<(PartitionKind, &str)> {
  let (prefix, version) = name.rsplit_once("-v")?;
  let kind = PartitionKind::from_prefix(prefix)?;
  if version.is_empty() || !version.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  Some((kind, version))
}

impl fmt::Display for PartitionName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}-v{}", self.kind.prefix(), self.generation)
  }
}

/// Canonical identity of a read request.
///
/// The method does not participate: only GET responses are ever cached, so
/// two requests for the same resolved URL share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  hash: String,
  url: String,
}

impl RequestKey {
  pub fn for_request(request: &Request, origin: &Url) -> Result<Self, url::ParseError> {
    let mut url = request.resolve(origin)?;
    url.set_fragment(None);
    Ok(Self::from_url(&url))
  }

  pub fn from_url(url: &Url) -> Self {
    let canonical = url.as_str().to_string();

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Self {
      hash,
      url: canonical,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.hash
  }

  /// The canonical URL the key was derived from.
  pub fn url(&self) -> &str {
    &self.url
  }
}
