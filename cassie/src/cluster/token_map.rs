//! Token ownership of the ring, rebuilt after every topology refresh.

use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;

use super::host::Host;

/// Partitioner whose tokens the driver understands.
pub const MURMUR3_PARTITIONER: &str = "org.apache.cassandra.dht.Murmur3Partitioner";

/// Position of a partition on the ring.
///
/// `i64::MIN` is not a valid token; it is normalized to `i64::MAX`.
#[derive(PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Token {
    value: i64,
}

impl Token {
    /// Creates a new token with given value, normalizing the value if necessary
    #[inline]
    pub fn new(value: i64) -> Self {
        Self {
            value: if value == i64::MIN { i64::MAX } else { value },
        }
    }

    #[inline]
    pub fn value(&self) -> i64 {
        self.value
    }
}

impl FromStr for Token {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(Token::new)
    }
}

/// A continuous hash ring, traversable in the order of increasing tokens.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    /// Iterates over all members of the ring starting at the lowest token.
    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Iterates over the ring members starting at the given token, wrapping
    /// around once. Each member is visited exactly once.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        let start = match self.ring.binary_search_by(|e| e.0.cmp(&token)) {
            Ok(exact_match_index) => exact_match_index,
            Err(first_greater_index) => first_greater_index,
        };

        self.ring[start..]
            .iter()
            .chain(self.ring.iter())
            .take(self.ring.len())
            .map(|(_, elem)| elem)
    }

    /// The first member at or after the given token.
    pub fn get_elem_for_token(&self, token: Token) -> Option<&ElemT> {
        self.ring_range(token).next()
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Maps tokens to the hosts owning them.
#[derive(Debug, Clone)]
pub struct TokenMap {
    ring: TokenRing<Arc<Host>>,
}

impl TokenMap {
    /// Builds the map from the tokens each host advertised.
    ///
    /// Returns `None` for partitioners whose tokens are not 64-bit integers.
    pub(crate) fn build(partitioner: Option<&str>, hosts: &[Arc<Host>]) -> Option<TokenMap> {
        if let Some(partitioner) = partitioner {
            if partitioner != MURMUR3_PARTITIONER {
                debug!(
                    "Not building a token map for unsupported partitioner {}",
                    partitioner
                );
                return None;
            }
        }

        let ring = TokenRing::new(hosts.iter().flat_map(|host| {
            let tokens = host.info().tokens.clone();
            tokens.into_iter().map(move |token| (token, host.clone()))
        }));
        Some(TokenMap { ring })
    }

    /// The host owning the given token.
    pub fn owner(&self, token: Token) -> Option<&Arc<Host>> {
        self.ring.get_elem_for_token(token)
    }

    /// Distinct hosts in ring order, starting at the owner of the given token.
    pub fn hosts_from(&self, token: Token) -> Vec<Arc<Host>> {
        let mut hosts: Vec<Arc<Host>> = Vec::new();
        for host in self.ring.ring_range(token) {
            if !hosts.iter().any(|h| Arc::ptr_eq(h, host)) {
                hosts.push(host.clone());
            }
        }
        hosts
    }

    pub fn ring(&self) -> &TokenRing<Arc<Host>> {
        &self.ring
    }
}
