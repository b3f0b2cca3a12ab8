use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr as _;

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::TranslationError;

/// An address advertised by a node, before translation.
///
/// Addresses come from `system.peers`, from `system.local` and from
/// STATUS_CHANGE and TOPOLOGY_CHANGE events. Events carry no host id or datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UntranslatedPeer {
    pub(crate) host_id: Option<Uuid>,
    pub(crate) untranslated_address: SocketAddr,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
}

impl UntranslatedPeer {
    pub fn new(untranslated_address: SocketAddr) -> Self {
        Self {
            host_id: None,
            untranslated_address,
            datacenter: None,
            rack: None,
        }
    }

    #[inline]
    pub fn host_id(&self) -> Option<Uuid> {
        self.host_id
    }

    #[inline]
    pub fn untranslated_address(&self) -> SocketAddr {
        self.untranslated_address
    }

    #[inline]
    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    #[inline]
    pub fn rack(&self) -> Option<&str> {
        self.rack.as_deref()
    }
}

/// Translates IP addresses received from the nodes into locally reachable addresses.
///
/// For each node, the address the driver receives corresponds to the address
/// set as `rpc_address` in the node configuration. Sometimes that address is
/// not reachable by the driver (a private IP behind NAT, for instance); a
/// translator maps it to the address to use instead.
///
/// Contact points are never translated, only addresses learned from the cluster are.
#[async_trait]
pub trait AddressTranslator: Send + Sync {
    async fn translate_address(
        &self,
        untranslated_peer: &UntranslatedPeer,
    ) -> Result<SocketAddr, TranslationError>;
}

/// Returns every address unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranslator;

#[async_trait]
impl AddressTranslator for IdentityTranslator {
    async fn translate_address(
        &self,
        untranslated_peer: &UntranslatedPeer,
    ) -> Result<SocketAddr, TranslationError> {
        Ok(untranslated_peer.untranslated_address())
    }
}

#[async_trait]
impl AddressTranslator for HashMap<SocketAddr, SocketAddr> {
    async fn translate_address(
        &self,
        untranslated_peer: &UntranslatedPeer,
    ) -> Result<SocketAddr, TranslationError> {
        match self.get(&untranslated_peer.untranslated_address()) {
            Some(&translated_addr) => Ok(translated_addr),
            None => Err(TranslationError::NoRuleForAddress(
                untranslated_peer.untranslated_address(),
            )),
        }
    }
}

#[async_trait]
// Linear scan, but clusters are small enough for it not to matter.
impl AddressTranslator for HashMap<&'static str, &'static str> {
    async fn translate_address(
        &self,
        untranslated_peer: &UntranslatedPeer,
    ) -> Result<SocketAddr, TranslationError> {
        for (&rule_addr_str, &translated_addr_str) in self.iter() {
            if let Ok(rule_addr) = SocketAddr::from_str(rule_addr_str) {
                if rule_addr == untranslated_peer.untranslated_address() {
                    return SocketAddr::from_str(translated_addr_str).map_err(|reason| {
                        TranslationError::InvalidAddressInRule {
                            translated_addr_str,
                            reason,
                        }
                    });
                }
            }
        }
        Err(TranslationError::NoRuleForAddress(
            untranslated_peer.untranslated_address(),
        ))
    }
}
