//! Signed router records and their transport addresses.
//!
//! ```text
//! identity (391)
//! published (8, ms)
//! network id (1)
//! address count (1)
//!   cost (1) | ip version (1) | ip (4 or 16) | port (2) | flags (1) | [s (32)] | [iv (16)]
//! signature (64) over everything above
//! ```

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::core::{CryptoError, DecodeError, IV_SIZE, KEY_SIZE};
use crate::crypto::SigningKeypair;

use super::identity::{RouterHash, RouterIdentity};

const FLAG_STATIC_KEY: u8 = 0x01;
const FLAG_IV: u8 = 0x02;

/// One published transport address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterAddress {
    /// Relative cost, lower is preferred.
    pub cost: u8,
    /// Socket address.
    pub addr: SocketAddr,
    /// NTCP2 static key `s`.
    pub static_key: Option<[u8; KEY_SIZE]>,
    /// NTCP2 obfuscation IV `i`.
    pub iv: Option<[u8; IV_SIZE]>,
}

impl RouterAddress {
    /// An address reachable only with the legacy handshake.
    pub fn legacy(addr: SocketAddr) -> Self {
        Self {
            cost: 10,
            addr,
            static_key: None,
            iv: None,
        }
    }

    /// An address that also accepts the Noise handshake.
    pub fn ntcp2(addr: SocketAddr, static_key: [u8; KEY_SIZE], iv: [u8; IV_SIZE]) -> Self {
        Self {
            cost: 3,
            addr,
            static_key: Some(static_key),
            iv: Some(iv),
        }
    }

    /// Both NTCP2 parameters are published.
    pub fn supports_ntcp2(&self) -> bool {
        self.static_key.is_some() && self.iv.is_some()
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.push(self.cost);
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                out.push(4);
                out.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                out.push(6);
                out.extend_from_slice(&ip.octets());
            }
        }
        out.extend_from_slice(&self.addr.port().to_be_bytes());
        let mut flags = 0;
        if self.static_key.is_some() {
            flags |= FLAG_STATIC_KEY;
        }
        if self.iv.is_some() {
            flags |= FLAG_IV;
        }
        out.push(flags);
        if let Some(s) = &self.static_key {
            out.extend_from_slice(s);
        }
        if let Some(iv) = &self.iv {
            out.extend_from_slice(iv);
        }
    }

    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let cost = r.u8()?;
        let ip = match r.u8()? {
            4 => {
                let mut o = [0u8; 4];
                o.copy_from_slice(r.take(4)?);
                IpAddr::V4(Ipv4Addr::from(o))
            }
            6 => {
                let mut o = [0u8; 16];
                o.copy_from_slice(r.take(16)?);
                IpAddr::V6(Ipv6Addr::from(o))
            }
            v => return Err(DecodeError::InvalidEncoding(format!("ip version {v}"))),
        };
        let port = u16::from_be_bytes([r.u8()?, r.u8()?]);
        let flags = r.u8()?;
        let static_key = if flags & FLAG_STATIC_KEY != 0 {
            let mut s = [0u8; KEY_SIZE];
            s.copy_from_slice(r.take(KEY_SIZE)?);
            Some(s)
        } else {
            None
        };
        let iv = if flags & FLAG_IV != 0 {
            let mut iv = [0u8; IV_SIZE];
            iv.copy_from_slice(r.take(IV_SIZE)?);
            Some(iv)
        } else {
            None
        };
        Ok(Self {
            cost,
            addr: SocketAddr::new(ip, port),
            static_key,
            iv,
        })
    }
}

/// A signed router record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterInfo {
    identity: RouterIdentity,
    published: u64,
    network_id: u8,
    addresses: Vec<RouterAddress>,
    signature: Vec<u8>,
}

impl RouterInfo {
    /// Build and sign a record.
    pub fn new(
        identity: RouterIdentity,
        signing: &SigningKeypair,
        published: u64,
        network_id: u8,
        addresses: Vec<RouterAddress>,
    ) -> Self {
        let mut ri = Self {
            identity,
            published,
            network_id,
            addresses,
            signature: Vec::new(),
        };
        ri.signature = signing.sign(&ri.signed_bytes()).to_vec();
        ri
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.identity.size() + 64);
        out.extend_from_slice(self.identity.as_bytes());
        out.extend_from_slice(&self.published.to_be_bytes());
        out.push(self.network_id);
        out.push(self.addresses.len() as u8);
        for addr in &self.addresses {
            addr.write(&mut out);
        }
        out
    }

    /// Serialize including the signature.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse a record. The signature is not checked; see [`RouterInfo::verify`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let (identity, used) = RouterIdentity::from_bytes(data)?;
        let mut r = Reader::new(&data[used..]);
        let mut published = [0u8; 8];
        published.copy_from_slice(r.take(8)?);
        let network_id = r.u8()?;
        let count = r.u8()?;
        let addresses = (0..count)
            .map(|_| RouterAddress::read(&mut r))
            .collect::<Result<Vec<_>, _>>()?;
        let sig_len = identity.signature_len();
        let signature = r.take(sig_len)?.to_vec();
        if !r.is_empty() {
            return Err(DecodeError::InvalidEncoding(format!(
                "{} trailing bytes after router info",
                r.remaining()
            )));
        }
        Ok(Self {
            identity,
            published: u64::from_be_bytes(published),
            network_id,
            addresses,
            signature,
        })
    }

    /// Check the signature against the embedded identity.
    pub fn verify(&self) -> Result<(), CryptoError> {
        self.identity.verify(&self.signed_bytes(), &self.signature)
    }

    /// The router's identity.
    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    /// Identity hash.
    pub fn hash(&self) -> RouterHash {
        self.identity.hash()
    }

    /// Publication time, ms.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Declared network id.
    pub fn network_id(&self) -> u8 {
        self.network_id
    }

    /// Published addresses.
    pub fn addresses(&self) -> &[RouterAddress] {
        &self.addresses
    }

    /// Cheapest address, preferring ones that accept NTCP2 when `ntcp2` is set.
    pub fn best_address(&self, ntcp2: bool) -> Option<&RouterAddress> {
        let pick = |want: bool| {
            self.addresses
                .iter()
                .filter(|a| a.supports_ntcp2() == want)
                .min_by_key(|a| a.cost)
        };
        if ntcp2 {
            pick(true).or_else(|| pick(false))
        } else {
            pick(false)
        }
    }

    /// The NTCP2 static key published in any address.
    pub fn ntcp2_static_key(&self) -> Option<&[u8; KEY_SIZE]> {
        self.addresses.iter().find_map(|a| a.static_key.as_ref())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (RouterInfo, SigningKeypair) {
        let kp = SigningKeypair::generate();
        let ident = RouterIdentity::new(&kp);
        let addrs = vec![
            RouterAddress::legacy("10.0.0.1:1234".parse().unwrap()),
            RouterAddress::ntcp2("[::1]:4321".parse().unwrap(), [7u8; 32], [9u8; 16]),
        ];
        (RouterInfo::new(ident, &kp, 1_700_000_000_000, 2, addrs), kp)
    }

    #[test]
    fn test_router_info_parse_and_verify() {
        let (ri, _) = sample();
        let bytes = ri.to_bytes();
        let parsed = RouterInfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, ri);
        assert!(parsed.verify().is_ok());
        assert_eq!(parsed.ntcp2_static_key(), Some(&[7u8; 32]));
    }

    #[test]
    fn test_router_info_tamper_detected() {
        let (ri, _) = sample();
        let mut bytes = ri.to_bytes();
        // flip the network id
        bytes[391 + 8] ^= 1;
        let parsed = RouterInfo::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.verify(), Err(CryptoError::InvalidSignature));
    }

    #[test]
    fn test_best_address() {
        let (ri, _) = sample();
        assert!(ri.best_address(true).unwrap().supports_ntcp2());
        assert!(!ri.best_address(false).unwrap().supports_ntcp2());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let (ri, _) = sample();
        let mut bytes = ri.to_bytes();
        bytes.push(0);
        assert!(matches!(
            RouterInfo::from_bytes(&bytes),
            Err(DecodeError::InvalidEncoding(_))
        ));
    }
}
