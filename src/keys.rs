// Bitcoin output descriptors library extending bitcoin & miniscript
// functionality by LNP/BP Association (https://lnp-bp.org)
// Written in 2020-2023 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the Apache-2.0 License
// along with this software.
// If not, see <https://opensource.org/licenses/Apache-2.0>.

//! Key expressions: the part of a descriptor naming a concrete key
//! participant. A key expression is either a WIF private key, a hex-encoded
//! public key (compressed, uncompressed or x-only), or a BIP32 extended key
//! with an optional `[fingerprint/path]` origin prefix and an optional
//! derivation suffix which may terminate in a `/*` wildcard.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use bitcoin::secp256k1::{Secp256k1, Signing, Verification};
use bitcoin::util::bip32::{
    self, ChildNumber, DerivationPath, ExtendedPrivKey, ExtendedPubKey, Fingerprint, KeySource,
};
use bitcoin::{Network, PrivateKey, PublicKey, XOnlyPublicKey};

/// Errors parsing or materializing a single key expression
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
#[display(doc_comments)]
pub enum KeyExpressionError {
    /// key expression '{0}' is not recognized
    Unparseable(String),

    /// invalid key origin information in '{0}'
    InvalidOrigin(String),

    /// invalid master key fingerprint '{0}'
    InvalidFingerprint(String),

    /// invalid derivation step '{0}'
    InvalidDerivationStep(String),

    /// wildcard must be the last derivation step in '{0}'
    NonTerminalWildcard(String),

    /// derivation path may follow only an extended key in '{0}'
    SingleKeyWithPath(String),

    /// BIP32-related error
    #[from]
    Bip32(bip32::Error),

    /// uncompressed public key '{0}' may not be used in a SegWit context
    UncompressedInSegwit(String),

    /// x-only public key '{0}' may be used in taproot context only
    XOnlyInNonTaproot(String),

    /// key '{0}' belongs to a different network than {1}
    NetworkMismatch(String, Network),

    /// ranged key expression '{0}' is not materialized with a concrete index
    /// and can't be used in a script
    Unmaterialized(String),
}

impl std::error::Error for KeyExpressionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyExpressionError::Bip32(err) => Some(err),
            _ => None,
        }
    }
}

/// Terminal wildcard of a BIP32 derivation suffix.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum Wildcard {
    /// Fixed path without a wildcard
    #[display("")]
    None,

    /// Path terminating in `/*`
    #[display("/*")]
    Unhardened,

    /// Path terminating in `/*'`
    #[display("/*'")]
    Hardened,
}

/// Extended key of either kind.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Xkey {
    /// Extended public key (`xpub`/`tpub`)
    Public(ExtendedPubKey),
    /// Extended private key (`xprv`/`tprv`)
    Private(ExtendedPrivKey),
}

impl Xkey {
    /// Network the key is serialized for.
    pub fn network(&self) -> Network {
        match self {
            Xkey::Public(xpub) => xpub.network,
            Xkey::Private(xprv) => xprv.network,
        }
    }

    /// Fingerprint of the key itself (not of the master).
    pub fn fingerprint<C: Signing>(&self, secp: &Secp256k1<C>) -> Fingerprint {
        match self {
            Xkey::Public(xpub) => xpub.fingerprint(),
            Xkey::Private(xprv) => xprv.fingerprint(secp),
        }
    }

    fn derive_public<C: Signing + Verification>(
        &self,
        secp: &Secp256k1<C>,
        path: &DerivationPath,
    ) -> Result<PublicKey, bip32::Error> {
        let pubkey = match self {
            Xkey::Public(xpub) => xpub.derive_pub(secp, path)?.public_key,
            Xkey::Private(xprv) => {
                let derived = xprv.derive_priv(secp, path)?;
                ExtendedPubKey::from_priv(secp, &derived).public_key
            }
        };
        Ok(PublicKey::new(pubkey))
    }
}

/// Non-extended key forms.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SingleKey {
    /// Compressed or uncompressed public key
    Full(PublicKey),
    /// X-only public key (32-byte hex)
    XOnly(XOnlyPublicKey),
    /// WIF-encoded private key
    Wif(PrivateKey),
}

/// Key material of a key expression: exactly one of an extended key with a
/// derivation suffix, or a single key.
#[derive(Clone, Eq, PartialEq, Debug)]
pub enum InnerKey {
    /// BIP32 extended key plus derivation suffix
    Xkey {
        /// The extended key itself
        xkey: Xkey,
        /// Derivation suffix without the terminal wildcard
        path: DerivationPath,
        /// Terminal wildcard, if any
        wildcard: Wildcard,
    },
    /// Single key (hex pubkey or WIF)
    Single(SingleKey),
}

/// One key participant of a descriptor, parsed from its key expression.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct KeyInfo {
    /// Source substring of the descriptor
    pub key_expression: String,
    /// Master fingerprint and origin path, when the expression carries a
    /// `[fingerprint/path]` prefix
    pub origin: Option<KeySource>,
    /// The key material
    pub key: InnerKey,
    /// Public key materialized for a concrete index; absent for ranged
    /// expressions prior to index substitution
    pub pubkey: Option<PublicKey>,
}

impl Display for KeyInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_expression)
    }
}

impl KeyInfo {
    /// Whether the derivation suffix still contains a wildcard.
    #[inline]
    pub fn is_ranged(&self) -> bool {
        matches!(self.key, InnerKey::Xkey {
            wildcard: Wildcard::Unhardened | Wildcard::Hardened,
            ..
        })
    }

    /// Key source suitable for PSBT `bip32_derivation` maps: the master
    /// fingerprint plus the full path from the master to the materialized
    /// key. Without origin information the fingerprint of the extended key
    /// itself is used. Single keys carry no derivation information.
    pub fn key_source<C: Signing>(&self, secp: &Secp256k1<C>) -> Option<KeySource> {
        let (xkey, path) = match &self.key {
            InnerKey::Xkey {
                xkey,
                path,
                wildcard: Wildcard::None,
            } => (xkey, path),
            _ => return None,
        };
        match &self.origin {
            Some((fingerprint, origin_path)) => Some((*fingerprint, origin_path.extend(path))),
            None => Some((xkey.fingerprint(secp), path.clone())),
        }
    }
}

fn parse_child_number(step: &str) -> Result<ChildNumber, KeyExpressionError> {
    let (digits, hardened) = match step.strip_suffix('\'').or_else(|| step.strip_suffix('h')) {
        Some(digits) => (digits, true),
        None => (step, false),
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(KeyExpressionError::InvalidDerivationStep(step.to_owned()));
    }
    let index: u32 = digits
        .parse()
        .map_err(|_| KeyExpressionError::InvalidDerivationStep(step.to_owned()))?;
    let child = if hardened {
        ChildNumber::from_hardened_idx(index)
    } else {
        ChildNumber::from_normal_idx(index)
    }?;
    Ok(child)
}

fn parse_origin(origin: &str) -> Result<(Fingerprint, DerivationPath), KeyExpressionError> {
    let (fingerprint, path) = match origin.split_once('/') {
        Some((fingerprint, path)) => (fingerprint, Some(path)),
        None => (origin, None),
    };
    if fingerprint.len() != 8 {
        return Err(KeyExpressionError::InvalidFingerprint(fingerprint.to_owned()));
    }
    let fingerprint = Fingerprint::from_str(fingerprint)
        .map_err(|_| KeyExpressionError::InvalidFingerprint(fingerprint.to_owned()))?;
    let mut steps = vec![];
    if let Some(path) = path {
        for step in path.split('/') {
            steps.push(parse_child_number(step)?);
        }
    }
    Ok((fingerprint, steps.into()))
}

fn parse_derivation_suffix(
    expression: &str,
    suffix: &str,
) -> Result<(DerivationPath, Wildcard), KeyExpressionError> {
    let mut steps = vec![];
    let mut wildcard = Wildcard::None;
    let count = suffix.split('/').count();
    for (no, step) in suffix.split('/').enumerate() {
        let is_wildcard = matches!(step, "*" | "*'" | "*h");
        if is_wildcard && no + 1 != count {
            return Err(KeyExpressionError::NonTerminalWildcard(expression.to_owned()));
        }
        match step {
            "*" => wildcard = Wildcard::Unhardened,
            "*'" | "*h" => wildcard = Wildcard::Hardened,
            _ => steps.push(parse_child_number(step)?),
        }
    }
    Ok((steps.into(), wildcard))
}

fn check_network(
    expression: &str,
    key_network: Network,
    network: Network,
) -> Result<(), KeyExpressionError> {
    // Extended keys and WIF distinguish mainnet from the testnet family
    // only, so any testnet-serialized key is accepted on signet and regtest.
    let key_mainnet = key_network == Network::Bitcoin;
    let mainnet = network == Network::Bitcoin;
    if key_mainnet != mainnet {
        return Err(KeyExpressionError::NetworkMismatch(expression.to_owned(), network));
    }
    Ok(())
}

/// Parses a single key expression into a [`KeyInfo`] record, eagerly
/// materializing the public key whenever the expression is not ranged.
///
/// `is_segwit` communicates the script context of the enclosing descriptor:
/// `Some(true)` for SegWit v0, `Some(false)` for pre-SegWit and `None` when
/// the context is not known. Uncompressed keys are rejected in SegWit
/// context; x-only keys are never materialized outside taproot, which no
/// descriptor shell of this grammar provides.
pub fn parse_key_expression<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    expression: &str,
    network: Network,
    is_segwit: Option<bool>,
) -> Result<KeyInfo, KeyExpressionError> {
    let mut rest = expression;

    let origin = if let Some(stripped) = rest.strip_prefix('[') {
        let (origin, remainder) = stripped
            .split_once(']')
            .ok_or_else(|| KeyExpressionError::InvalidOrigin(expression.to_owned()))?;
        rest = remainder;
        Some(parse_origin(origin)?)
    } else {
        None
    };

    if rest.is_empty() {
        return Err(KeyExpressionError::Unparseable(expression.to_owned()));
    }

    let is_xkey = ["xpub", "tpub", "xprv", "tprv"]
        .iter()
        .any(|prefix| rest.starts_with(prefix));

    if is_xkey {
        let (base, suffix) = match rest.split_once('/') {
            Some((base, suffix)) => (base, Some(suffix)),
            None => (rest, None),
        };
        let xkey = if base.starts_with("xpub") || base.starts_with("tpub") {
            Xkey::Public(ExtendedPubKey::from_str(base)?)
        } else {
            Xkey::Private(ExtendedPrivKey::from_str(base)?)
        };
        check_network(expression, xkey.network(), network)?;
        let (path, wildcard) = match suffix {
            Some(suffix) => parse_derivation_suffix(expression, suffix)?,
            None => (DerivationPath::default(), Wildcard::None),
        };
        let pubkey = match wildcard {
            Wildcard::None => Some(xkey.derive_public(secp, &path)?),
            _ => None,
        };
        return Ok(KeyInfo {
            key_expression: expression.to_owned(),
            origin,
            key: InnerKey::Xkey {
                xkey,
                path,
                wildcard,
            },
            pubkey,
        });
    }

    if rest.contains('/') {
        return Err(KeyExpressionError::SingleKeyWithPath(expression.to_owned()));
    }

    // X-only keys keep their 32-byte form; since no shell of the grammar
    // creates a taproot context they never materialize a pubkey here.
    if rest.len() == 64 && rest.bytes().all(|b| b.is_ascii_hexdigit()) {
        let xonly = XOnlyPublicKey::from_str(rest)
            .map_err(|_| KeyExpressionError::Unparseable(expression.to_owned()))?;
        if is_segwit.is_some() {
            return Err(KeyExpressionError::XOnlyInNonTaproot(expression.to_owned()));
        }
        return Ok(KeyInfo {
            key_expression: expression.to_owned(),
            origin,
            key: InnerKey::Single(SingleKey::XOnly(xonly)),
            pubkey: None,
        });
    }

    if let Ok(pubkey) = PublicKey::from_str(rest) {
        if !pubkey.compressed && is_segwit == Some(true) {
            return Err(KeyExpressionError::UncompressedInSegwit(expression.to_owned()));
        }
        return Ok(KeyInfo {
            key_expression: expression.to_owned(),
            origin,
            key: InnerKey::Single(SingleKey::Full(pubkey)),
            pubkey: Some(pubkey),
        });
    }

    if let Ok(wif) = PrivateKey::from_wif(rest) {
        check_network(expression, wif.network, network)?;
        if !wif.compressed && is_segwit == Some(true) {
            return Err(KeyExpressionError::UncompressedInSegwit(expression.to_owned()));
        }
        return Ok(KeyInfo {
            key_expression: expression.to_owned(),
            origin,
            key: InnerKey::Single(SingleKey::Wif(wif)),
            pubkey: Some(wif.public_key(secp)),
        });
    }

    Err(KeyExpressionError::Unparseable(expression.to_owned()))
}

#[cfg(test)]
mod test {
    use super::*;

    const PK_G: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PK_G_UNCOMPRESSED: &str = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\
         483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";
    const WIF_ONE: &str = "KwDiBf89QgGbjEhKnhXJuH7LrciVrZi3qYjgd9M7rFU73sVHnoWn";
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn secp() -> Secp256k1<bitcoin::secp256k1::All> {
        Secp256k1::new()
    }

    #[test]
    fn single_pubkey() {
        let info = parse_key_expression(&secp(), PK_G, Network::Bitcoin, Some(false)).unwrap();
        assert_eq!(info.pubkey.unwrap().to_string(), PK_G);
        assert_eq!(info.origin, None);
        assert!(!info.is_ranged());
        assert!(matches!(info.key, InnerKey::Single(SingleKey::Full(_))));
    }

    #[test]
    fn wif_materializes_to_generator_point() {
        let info = parse_key_expression(&secp(), WIF_ONE, Network::Bitcoin, Some(true)).unwrap();
        assert_eq!(info.pubkey.unwrap().to_string(), PK_G);
        assert!(matches!(info.key, InnerKey::Single(SingleKey::Wif(_))));
    }

    #[test]
    fn uncompressed_rejected_in_segwit() {
        assert!(matches!(
            parse_key_expression(&secp(), PK_G_UNCOMPRESSED, Network::Bitcoin, Some(true)),
            Err(KeyExpressionError::UncompressedInSegwit(_))
        ));
        let info =
            parse_key_expression(&secp(), PK_G_UNCOMPRESSED, Network::Bitcoin, Some(false))
                .unwrap();
        assert!(!info.pubkey.unwrap().compressed);
    }

    #[test]
    fn xonly_not_materialized() {
        let xonly = &PK_G[2..];
        assert!(matches!(
            parse_key_expression(&secp(), xonly, Network::Bitcoin, Some(true)),
            Err(KeyExpressionError::XOnlyInNonTaproot(_))
        ));
        let info = parse_key_expression(&secp(), xonly, Network::Bitcoin, None).unwrap();
        assert_eq!(info.pubkey, None);
        assert!(matches!(info.key, InnerKey::Single(SingleKey::XOnly(_))));
    }

    #[test]
    fn xpub_with_origin_and_path() {
        let secp = secp();
        let expression = format!("[d34db33f/44'/0'/0']{}/1/2", XPUB);
        let info =
            parse_key_expression(&secp, &expression, Network::Bitcoin, Some(true)).unwrap();
        let (fingerprint, origin_path) = info.origin.clone().unwrap();
        assert_eq!(fingerprint.to_string(), "d34db33f");
        assert_eq!(origin_path.len(), 3);
        assert!(info.pubkey.unwrap().compressed);
        assert!(!info.is_ranged());

        let (fingerprint, full_path) = info.key_source(&secp).unwrap();
        assert_eq!(fingerprint.to_string(), "d34db33f");
        assert_eq!(full_path.len(), 5);
    }

    #[test]
    fn ranged_xpub_defers_materialization() {
        let expression = format!("{}/0/*", XPUB);
        let info =
            parse_key_expression(&secp(), &expression, Network::Bitcoin, Some(true)).unwrap();
        assert_eq!(info.pubkey, None);
        assert!(info.is_ranged());
        assert!(matches!(info.key, InnerKey::Xkey {
            wildcard: Wildcard::Unhardened,
            ..
        }));
    }

    #[test]
    fn wildcard_must_terminate_path() {
        let expression = format!("{}/*/0", XPUB);
        assert!(matches!(
            parse_key_expression(&secp(), &expression, Network::Bitcoin, None),
            Err(KeyExpressionError::NonTerminalWildcard(_))
        ));
    }

    #[test]
    fn hardened_derivation_from_xpub_fails() {
        let expression = format!("{}/0'/1", XPUB);
        assert!(matches!(
            parse_key_expression(&secp(), &expression, Network::Bitcoin, None),
            Err(KeyExpressionError::Bip32(
                bip32::Error::CannotDeriveFromHardenedKey
            ))
        ));
    }

    #[test]
    fn network_mismatch() {
        assert!(matches!(
            parse_key_expression(&secp(), XPUB, Network::Testnet, None),
            Err(KeyExpressionError::NetworkMismatch(_, Network::Testnet))
        ));
    }

    #[test]
    fn malformed_expressions() {
        let secp = secp();
        assert!(matches!(
            parse_key_expression(&secp, "[d34db33fxpub", Network::Bitcoin, None),
            Err(KeyExpressionError::InvalidOrigin(_))
        ));
        assert!(matches!(
            parse_key_expression(&secp, "[d34db3/0']xpub", Network::Bitcoin, None),
            Err(KeyExpressionError::InvalidFingerprint(_))
        ));
        assert!(matches!(
            parse_key_expression(&secp, &format!("{}/4.5", XPUB), Network::Bitcoin, None),
            Err(KeyExpressionError::InvalidDerivationStep(_))
        ));
        assert!(matches!(
            parse_key_expression(&secp, &format!("{}/0", PK_G), Network::Bitcoin, None),
            Err(KeyExpressionError::SingleKeyWithPath(_))
        ));
        assert!(matches!(
            parse_key_expression(&secp, "144", Network::Bitcoin, None),
            Err(KeyExpressionError::Unparseable(_))
        ));
    }
}
