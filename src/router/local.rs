//! Our own router's keys and published record.

use std::net::SocketAddr;

use rand::{RngCore, rngs::OsRng};

use crate::core::{IV_SIZE, SIGNATURE_SIZE};
use crate::crypto::{SigningKeypair, StaticKeypair};

use super::{RouterAddress, RouterHash, RouterIdentity, RouterInfo};

/// Keys and signed record of the local router.
#[derive(Debug)]
pub struct LocalRouter {
    signing: SigningKeypair,
    identity: RouterIdentity,
    static_keys: StaticKeypair,
    iv: [u8; IV_SIZE],
    network_id: u8,
    info: RouterInfo,
}

impl LocalRouter {
    /// Generate fresh keys and publish `addr` (if any) for both handshakes.
    pub fn generate(network_id: u8, addr: Option<SocketAddr>, published: u64) -> Self {
        let signing = SigningKeypair::generate();
        let identity = RouterIdentity::new(&signing);
        let static_keys = StaticKeypair::generate();
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);
        let addresses = addr
            .map(|a| vec![RouterAddress::ntcp2(a, *static_keys.public_key(), iv)])
            .unwrap_or_default();
        let info = RouterInfo::new(identity.clone(), &signing, published, network_id, addresses);
        Self {
            signing,
            identity,
            static_keys,
            iv,
            network_id,
            info,
        }
    }

    /// Re-sign the record with new addresses.
    pub fn republish(&mut self, addresses: Vec<RouterAddress>, published: u64) {
        self.info = RouterInfo::new(
            self.identity.clone(),
            &self.signing,
            published,
            self.network_id,
            addresses,
        );
    }

    /// Our identity.
    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    /// Our identity hash.
    pub fn hash(&self) -> RouterHash {
        self.identity.hash()
    }

    /// Our signed record.
    pub fn router_info(&self) -> &RouterInfo {
        &self.info
    }

    /// NTCP2 static keypair.
    pub fn static_keys(&self) -> &StaticKeypair {
        &self.static_keys
    }

    /// NTCP2 published IV.
    pub fn ntcp2_iv(&self) -> &[u8; IV_SIZE] {
        &self.iv
    }

    /// Our network id.
    pub fn network_id(&self) -> u8 {
        self.network_id
    }

    /// Sign with the identity key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_record_is_consistent() {
        let local = LocalRouter::generate(2, Some("127.0.0.1:9000".parse().unwrap()), 1);
        let ri = local.router_info();
        assert!(ri.verify().is_ok());
        assert_eq!(ri.hash(), local.hash());
        assert_eq!(ri.ntcp2_static_key(), Some(local.static_keys().public_key()));
        assert_eq!(ri.addresses()[0].iv.as_ref(), Some(local.ntcp2_iv()));
        let sig = local.sign(b"x");
        assert!(local.identity().verify(b"x", &sig).is_ok());
    }

    #[test]
    fn test_republish() {
        let mut local = LocalRouter::generate(2, None, 1);
        assert!(local.router_info().addresses().is_empty());
        local.republish(vec![RouterAddress::legacy("127.0.0.1:1".parse().unwrap())], 5);
        assert_eq!(local.router_info().published(), 5);
        assert!(local.router_info().verify().is_ok());
    }
}
