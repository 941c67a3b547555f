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

//! Descriptor expansion: checksum validation, wildcard substitution, shell
//! dispatch and script construction. The output of [`expand`] is an
//! [`Expansion`] separating the descriptor shape (expanded expression with
//! `@i` placeholders) from the concrete key material (the expansion map) and
//! carrying the derived scripts and payment.

use std::fmt::Display;
use std::str::FromStr;

use bitcoin::blockdata::opcodes;
use bitcoin::blockdata::script::Instruction;
use bitcoin::secp256k1::{Secp256k1, Signing, Verification};
use bitcoin::util::address::Payload;
use bitcoin::{Address, Network, PublicKey, Script};
use miniscript::{Legacy, Miniscript, Segwitv0};

use crate::checksum::{verify_checksum, ChecksumError};
use crate::expression::{expand_miniscript, substitute_pubkeys, ExpansionMap};
use crate::keys::{parse_key_expression, KeyExpressionError, KeyInfo};

/// Maximal size of a P2WSH witness script in bytes.
pub const MAX_WITNESS_SCRIPT_SIZE: usize = 3600;

/// Maximal size of a stack element, bounding P2SH redeem scripts.
pub const MAX_REDEEM_SCRIPT_SIZE: usize = 520;

/// Maximal number of non-push opcodes in a script.
pub const MAX_OPS_PER_SCRIPT: usize = 201;

// Miniscript heads admitted inside plain `sh(...)` even when miniscript in
// P2SH is not explicitly allowed.
const P2SH_MINISCRIPT_HEADS: [&str; 8] = [
    "pk(",
    "pkh(",
    "wpkh(",
    "combo(",
    "multi(",
    "sortedmulti(",
    "multi_a(",
    "sortedmulti_a(",
];

/// Descriptor shells recognized by the grammar.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum CompositeType {
    /// `addr(ADDRESS)`
    #[display("addr")]
    Addr,

    /// `pk(KEY)`
    #[display("pk")]
    Pk,

    /// `pkh(KEY)`
    #[display("pkh")]
    Pkh,

    /// `wpkh(KEY)`
    #[display("wpkh")]
    Wpkh,

    /// `sh(wpkh(KEY))`
    #[display("shWpkh")]
    ShWpkh,

    /// `sh(wsh(MINISCRIPT))`
    #[display("shWsh")]
    ShWsh,

    /// `wsh(MINISCRIPT)`
    #[display("wsh")]
    Wsh,

    /// `sh(MINISCRIPT)`
    #[display("sh")]
    Sh,
}

impl CompositeType {
    /// Whether spending happens through the segregated witness. `None` for
    /// `addr(...)`, where the witness structure can't be known.
    #[inline]
    pub fn is_segwit(self) -> Option<bool> {
        match self {
            CompositeType::Addr => None,
            CompositeType::Pk | CompositeType::Pkh | CompositeType::Sh => Some(false),
            CompositeType::Wpkh
            | CompositeType::ShWpkh
            | CompositeType::ShWsh
            | CompositeType::Wsh => Some(true),
        }
    }

    /// Whether spending inputs require a redeem script.
    #[inline]
    pub fn has_redeem_script(self) -> bool {
        matches!(
            self,
            CompositeType::ShWpkh | CompositeType::ShWsh | CompositeType::Sh
        )
    }

    /// Whether spending inputs require a witness script.
    #[inline]
    pub fn has_witness_script(self) -> bool {
        matches!(self, CompositeType::ShWsh | CompositeType::Wsh)
    }

    /// Whether the shell embeds a miniscript.
    #[inline]
    pub fn has_miniscript(self) -> bool {
        matches!(
            self,
            CompositeType::ShWsh | CompositeType::Wsh | CompositeType::Sh
        )
    }
}

/// Standard scriptPubkey forms recognizable under `addr(...)`.
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum SpkClass {
    /// Pay-to-pubkey-hash
    #[display("p2pkh")]
    P2pkh,

    /// Pay-to-script-hash
    #[display("p2sh")]
    P2sh,

    /// Pay-to-witness-pubkey-hash
    #[display("p2wpkh")]
    P2wpkh,

    /// Pay-to-witness-script-hash
    #[display("p2wsh")]
    P2wsh,

    /// Pay-to-taproot
    #[display("p2tr")]
    P2tr,
}

impl SpkClass {
    /// Trial-parses a scriptPubkey as each standard form in the fixed order
    /// p2pkh, p2sh, p2wpkh, p2wsh, p2tr, retaining the last successful
    /// parse. The forms are mutually exclusive, so the order only fixes
    /// diagnostics.
    pub fn classify(script_pubkey: &Script) -> Option<SpkClass> {
        let mut class = None;
        if script_pubkey.is_p2pkh() {
            class = Some(SpkClass::P2pkh);
        }
        if script_pubkey.is_p2sh() {
            class = Some(SpkClass::P2sh);
        }
        if script_pubkey.is_v0_p2wpkh() {
            class = Some(SpkClass::P2wpkh);
        }
        if script_pubkey.is_v0_p2wsh() {
            class = Some(SpkClass::P2wsh);
        }
        if script_pubkey.is_v1_p2tr() {
            class = Some(SpkClass::P2tr);
        }
        class
    }
}

/// ScriptPubkey together with its address form, when one exists (bare
/// `pk(...)` outputs have none).
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Payment {
    /// The locking script
    pub script_pubkey: Script,
    /// Address encoding of the locking script
    pub address: Option<Address>,
}

/// Parsed descriptor: shape, key material and derived scripts.
///
/// `payment`, `redeem_script` and `witness_script` are absent if and only if
/// the canonical expression is still ranged (contains `*`).
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct Expansion {
    /// Bare descriptor body: checksum-stripped and index-substituted
    pub canonical_expression: String,
    /// The recognized outer shell
    pub descr_type: CompositeType,
    /// Whether the original descriptor contained a wildcard
    pub is_ranged: bool,
    /// Descriptor with each key expression replaced by a placeholder;
    /// absent for `addr(...)`
    pub expanded_expression: Option<String>,
    /// The embedded miniscript source, for miniscript shells
    pub miniscript: Option<String>,
    /// The embedded miniscript with placeholders substituted for keys
    pub expanded_miniscript: Option<String>,
    /// Placeholder-to-key mapping; absent for `addr(...)`
    pub expansion_map: Option<ExpansionMap>,
    /// ScriptPubkey class detected under `addr(...)`
    pub spk_class: Option<SpkClass>,
    /// The payment: locking script and address
    pub payment: Option<Payment>,
    /// Redeem script for `sh`-wrapped shells
    pub redeem_script: Option<Script>,
    /// Witness script for `wsh` shells
    pub witness_script: Option<Script>,
}

impl Expansion {
    fn shape(descr_type: CompositeType, canonical_expression: String, is_ranged: bool) -> Expansion {
        Expansion {
            canonical_expression,
            descr_type,
            is_ranged,
            expanded_expression: None,
            miniscript: None,
            expanded_miniscript: None,
            expansion_map: None,
            spk_class: None,
            payment: None,
            redeem_script: None,
            witness_script: None,
        }
    }

    /// Whether spending happens through the segregated witness; unknown for
    /// `addr(...)` descriptors.
    #[inline]
    pub fn is_segwit(&self) -> Option<bool> {
        self.descr_type.is_segwit()
    }
}

/// Request record for [`expand`].
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct ExpandParams {
    /// The descriptor string
    pub descriptor: Option<String>,
    /// Deprecated alias for [`Self::descriptor`]; supplying both is an
    /// error
    pub expression: Option<String>,
    /// Index substituted for the wildcard of a ranged descriptor
    pub index: Option<u32>,
    /// Fail when the descriptor carries no checksum
    pub checksum_required: bool,
    /// Admit arbitrary miniscript inside plain `sh(...)`
    pub allow_miniscript_in_p2sh: bool,
    /// Network for address encoding and key validation
    pub network: Network,
}

impl Default for ExpandParams {
    fn default() -> Self {
        ExpandParams {
            descriptor: None,
            expression: None,
            index: None,
            checksum_required: false,
            allow_miniscript_in_p2sh: false,
            network: Network::Bitcoin,
        }
    }
}

impl ExpandParams {
    /// Request expanding `descriptor` on `network`, other knobs at their
    /// defaults.
    pub fn with(descriptor: impl Display, network: Network) -> ExpandParams {
        ExpandParams {
            descriptor: Some(descriptor.to_string()),
            network,
            ..ExpandParams::default()
        }
    }

    pub(crate) fn descriptor(&self) -> Result<&str, Error> {
        match (&self.descriptor, &self.expression) {
            (Some(_), Some(_)) => Err(Error::DescriptorAndExpression),
            (Some(descriptor), None) => Ok(descriptor),
            (None, Some(expression)) => Ok(expression),
            (None, None) => Err(Error::Empty),
        }
    }
}

/// Errors expanding a descriptor
#[derive(Debug, Display, From)]
#[display(doc_comments)]
pub enum Error {
    /// empty descriptor string
    Empty,

    /// both `descriptor` and its deprecated `expression` alias were provided
    DescriptorAndExpression,

    /// unparseable descriptor '{0}'
    InvalidDescriptor(String),

    /// invalid descriptor checksum: {0}
    #[from]
    Checksum(ChecksumError),

    /// descriptor '{0}' carries no checksum while one is required
    ChecksumRequired(String),

    /// index {0} provided for a non-ranged descriptor
    NonRangedIndex(u32),

    /// address '{0}' can't be decoded for {1}
    InvalidAddress(String, Network),

    /// invalid key expression: {0}
    #[from]
    Key(KeyExpressionError),

    /// miniscript error: {0}
    #[from]
    Miniscript(miniscript::Error),

    /// script of {len} bytes exceeds the {max} byte limit of its container
    ScriptTooLarge {
        /// Compiled script length
        len: usize,
        /// Limit imposed by the descriptor shell
        max: usize,
    },

    /// script contains {0} non-push opcodes, exceeding the limit of 201
    TooManyOps(usize),

    /// can't decompile script: {0}
    #[from]
    Script(bitcoin::blockdata::script::Error),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Checksum(err) => Some(err),
            Error::Key(err) => Some(err),
            Error::Miniscript(err) => Some(err),
            Error::Script(err) => Some(err),
            _ => None,
        }
    }
}

/// Enforces the per-shell script size cap and the 201 non-push opcode
/// consensus limit on a compiled script. Opcodes above `OP_16` count as
/// non-push; a script which fails to decompile is rejected.
fn check_script_limits(script: &Script, max_size: usize) -> Result<(), Error> {
    if script.len() > max_size {
        return Err(Error::ScriptTooLarge {
            len: script.len(),
            max: max_size,
        });
    }
    let mut ops = 0usize;
    for instruction in script.instructions() {
        if let Instruction::Op(op) = instruction? {
            if op.into_u8() > opcodes::all::OP_PUSHNUM_16.into_u8() {
                ops += 1;
            }
        }
    }
    if ops > MAX_OPS_PER_SCRIPT {
        return Err(Error::TooManyOps(ops));
    }
    Ok(())
}

fn parse_shell_key<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    body: &str,
    inner: &str,
    network: Network,
    is_segwit: Option<bool>,
) -> Result<KeyInfo, Error> {
    parse_key_expression(secp, inner, network, is_segwit).map_err(|err| match err {
        // A token which is not even key-shaped means the shell contents are
        // garbage, which is a descriptor-level parse failure.
        KeyExpressionError::Unparseable(_) => Error::InvalidDescriptor(body.to_owned()),
        err => Error::Key(err),
    })
}

fn expand_addr(body: &str, inner: &str, network: Network, is_ranged: bool) -> Result<Expansion, Error> {
    if is_ranged {
        return Err(Error::InvalidDescriptor(body.to_owned()));
    }
    let address =
        Address::from_str(inner).map_err(|_| Error::InvalidAddress(inner.to_owned(), network))?;
    // Address encodings distinguish mainnet from the testnet family; signet
    // and regtest base58 addresses decode as testnet ones.
    let matches_network = address.network == network
        || (address.network == Network::Testnet
            && matches!(network, Network::Signet | Network::Regtest));
    if !matches_network {
        return Err(Error::InvalidAddress(inner.to_owned(), network));
    }
    let script_pubkey = address.script_pubkey();
    let spk_class = SpkClass::classify(&script_pubkey)
        .ok_or_else(|| Error::InvalidAddress(inner.to_owned(), network))?;
    let mut expansion = Expansion::shape(CompositeType::Addr, body.to_owned(), false);
    expansion.spk_class = Some(spk_class);
    expansion.payment = Some(Payment {
        script_pubkey,
        address: Some(address),
    });
    Ok(expansion)
}

struct MiniscriptShell {
    descr_type: CompositeType,
    expanded_expression: String,
    witness_script: Option<Script>,
    redeem_script: Option<Script>,
    payment: Option<Payment>,
}

fn expand_miniscript_shell<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    descr_type: CompositeType,
    body: &str,
    inner: &str,
    params: &ExpandParams,
    materialized: bool,
) -> Result<(MiniscriptShell, String, ExpansionMap), Error> {
    let network = params.network;
    let is_segwit = descr_type
        .is_segwit()
        .expect("miniscript shells have known witness structure");
    if descr_type == CompositeType::Sh
        && !params.allow_miniscript_in_p2sh
        && !P2SH_MINISCRIPT_HEADS
            .iter()
            .any(|head| inner.starts_with(head))
    {
        return Err(Error::InvalidDescriptor(body.to_owned()));
    }

    let (expanded_miniscript, map) = expand_miniscript(secp, inner, network, is_segwit)?;
    let expanded_expression = match descr_type {
        CompositeType::Wsh => format!("wsh({})", expanded_miniscript),
        CompositeType::ShWsh => format!("sh(wsh({}))", expanded_miniscript),
        CompositeType::Sh => format!("sh({})", expanded_miniscript),
        _ => unreachable!("non-miniscript shell"),
    };

    let mut shell = MiniscriptShell {
        descr_type,
        expanded_expression,
        witness_script: None,
        redeem_script: None,
        payment: None,
    };
    if !materialized {
        return Ok((shell, expanded_miniscript, map));
    }

    let script_source = substitute_pubkeys(&expanded_miniscript, &map)?;
    match descr_type {
        CompositeType::Wsh => {
            let ms = Miniscript::<PublicKey, Segwitv0>::from_str(&script_source)?;
            let witness_script = ms.encode();
            check_script_limits(&witness_script, MAX_WITNESS_SCRIPT_SIZE)?;
            let address = Address::p2wsh(&witness_script, network);
            shell.payment = Some(Payment {
                script_pubkey: address.script_pubkey(),
                address: Some(address),
            });
            shell.witness_script = Some(witness_script);
        }
        CompositeType::ShWsh => {
            let ms = Miniscript::<PublicKey, Segwitv0>::from_str(&script_source)?;
            let witness_script = ms.encode();
            check_script_limits(&witness_script, MAX_WITNESS_SCRIPT_SIZE)?;
            let redeem_script = witness_script.to_v0_p2wsh();
            let address = Address::p2shwsh(&witness_script, network);
            shell.payment = Some(Payment {
                script_pubkey: address.script_pubkey(),
                address: Some(address),
            });
            shell.witness_script = Some(witness_script);
            shell.redeem_script = Some(redeem_script);
        }
        CompositeType::Sh => {
            let ms = Miniscript::<PublicKey, Legacy>::from_str(&script_source)?;
            let redeem_script = ms.encode();
            check_script_limits(&redeem_script, MAX_REDEEM_SCRIPT_SIZE)?;
            let address = Address {
                payload: Payload::ScriptHash(redeem_script.script_hash()),
                network,
            };
            shell.payment = Some(Payment {
                script_pubkey: address.script_pubkey(),
                address: Some(address),
            });
            shell.redeem_script = Some(redeem_script);
        }
        _ => unreachable!("non-miniscript shell"),
    }
    Ok((shell, expanded_miniscript, map))
}

/// Expands a descriptor string into an [`Expansion`].
///
/// Verifies the trailing checksum when present (and requires one when
/// `params.checksum_required` is set), substitutes the wildcard when an
/// index is given, dispatches on the outer shell and constructs the payment
/// and auxiliary scripts. For ranged descriptors expanded without an index
/// only the shape is produced: `payment`, `redeem_script` and
/// `witness_script` stay absent.
pub fn expand<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    params: &ExpandParams,
) -> Result<Expansion, Error> {
    let descriptor = params.descriptor()?;
    if descriptor.is_empty() {
        return Err(Error::Empty);
    }
    let network = params.network;

    let body = match descriptor.split_once('#') {
        Some((body, checksum)) => {
            verify_checksum(body, checksum)?;
            body
        }
        None if params.checksum_required => return Err(Error::ChecksumRequired(descriptor.to_owned())),
        None => descriptor,
    };

    let is_ranged = body.contains('*');
    let body = match params.index {
        Some(index) if !is_ranged => return Err(Error::NonRangedIndex(index)),
        Some(index) => body.replace('*', &index.to_string()),
        None => body.to_owned(),
    };
    let materialized = !body.contains('*');

    if let Some(inner) = body.strip_prefix("addr(").and_then(|s| s.strip_suffix(')')) {
        return expand_addr(&body, inner, network, is_ranged);
    }

    // Single-key shells. `pkh(` must be probed before `pk(`.
    let single_key = if let Some(inner) = body.strip_prefix("pkh(").and_then(|s| s.strip_suffix(')')) {
        Some((CompositeType::Pkh, inner))
    } else if let Some(inner) = body.strip_prefix("pk(").and_then(|s| s.strip_suffix(')')) {
        Some((CompositeType::Pk, inner))
    } else if let Some(inner) = body.strip_prefix("wpkh(").and_then(|s| s.strip_suffix(')')) {
        Some((CompositeType::Wpkh, inner))
    } else if let Some(inner) = body
        .strip_prefix("sh(wpkh(")
        .and_then(|s| s.strip_suffix("))"))
    {
        Some((CompositeType::ShWpkh, inner))
    } else {
        None
    };
    if let Some((descr_type, inner)) = single_key {
        let info = parse_shell_key(secp, &body, inner, network, descr_type.is_segwit())?;
        let pubkey = info.pubkey;
        let mut map = ExpansionMap::default();
        map.insert(info);

        let mut expansion = Expansion::shape(descr_type, body.clone(), is_ranged);
        expansion.expanded_expression = Some(match descr_type {
            CompositeType::Pk => s!("pk(@0)"),
            CompositeType::Pkh => s!("pkh(@0)"),
            CompositeType::Wpkh => s!("wpkh(@0)"),
            CompositeType::ShWpkh => s!("sh(wpkh(@0))"),
            _ => unreachable!("single-key shell"),
        });
        expansion.expansion_map = Some(map);
        if materialized {
            let pubkey = pubkey.ok_or_else(|| {
                Error::Key(KeyExpressionError::Unmaterialized(inner.to_owned()))
            })?;
            expansion.payment = Some(match descr_type {
                CompositeType::Pk => Payment {
                    script_pubkey: Script::new_p2pk(&pubkey),
                    address: None,
                },
                CompositeType::Pkh => {
                    let address = Address::p2pkh(&pubkey, network);
                    Payment {
                        script_pubkey: address.script_pubkey(),
                        address: Some(address),
                    }
                }
                CompositeType::Wpkh => {
                    let address = Address::p2wpkh(&pubkey, network)
                        .expect("compressed key enforced by the key parser");
                    Payment {
                        script_pubkey: address.script_pubkey(),
                        address: Some(address),
                    }
                }
                CompositeType::ShWpkh => {
                    let address = Address::p2shwpkh(&pubkey, network)
                        .expect("compressed key enforced by the key parser");
                    Payment {
                        script_pubkey: address.script_pubkey(),
                        address: Some(address),
                    }
                }
                _ => unreachable!("single-key shell"),
            });
            if descr_type == CompositeType::ShWpkh {
                let wpubkey_hash = pubkey
                    .wpubkey_hash()
                    .expect("compressed key enforced by the key parser");
                expansion.redeem_script = Some(Script::new_v0_p2wpkh(&wpubkey_hash));
            }
        }
        return Ok(expansion);
    }

    // Miniscript shells. `sh(wsh(` must be probed before generic `sh(`.
    let ms_shell = if let Some(inner) = body
        .strip_prefix("sh(wsh(")
        .and_then(|s| s.strip_suffix("))"))
    {
        Some((CompositeType::ShWsh, inner))
    } else if let Some(inner) = body.strip_prefix("wsh(").and_then(|s| s.strip_suffix(')')) {
        Some((CompositeType::Wsh, inner))
    } else if let Some(inner) = body.strip_prefix("sh(").and_then(|s| s.strip_suffix(')')) {
        Some((CompositeType::Sh, inner))
    } else {
        None
    };
    if let Some((descr_type, inner)) = ms_shell {
        let (shell, expanded_miniscript, map) =
            expand_miniscript_shell(secp, descr_type, &body, inner, params, materialized)?;
        let mut expansion = Expansion::shape(shell.descr_type, body.clone(), is_ranged);
        expansion.expanded_expression = Some(shell.expanded_expression);
        expansion.miniscript = Some(inner.to_owned());
        expansion.expanded_miniscript = Some(expanded_miniscript);
        expansion.expansion_map = Some(map);
        expansion.payment = shell.payment;
        expansion.witness_script = shell.witness_script;
        expansion.redeem_script = shell.redeem_script;
        return Ok(expansion);
    }

    Err(Error::InvalidDescriptor(body))
}

#[cfg(test)]
mod test {
    use bitcoin::secp256k1::All;

    use super::*;
    use crate::checksum::checksum;

    // Vectors below use the x = 2 curve point, for which the script hashes
    // are well known from the rust-miniscript descriptor test suite.
    const PK_TWO: &str = "020000000000000000000000000000000000000000000000000000000000000002";
    const PK_2G: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";
    const XPUB: &str = "xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8";

    fn secp() -> Secp256k1<All> {
        Secp256k1::new()
    }

    fn expand_str(descriptor: &str) -> Result<Expansion, Error> {
        expand(&secp(), &ExpandParams::with(descriptor, Network::Bitcoin))
    }

    fn script(hex: &str) -> Script {
        Script::from_str(hex).unwrap()
    }

    #[test]
    fn pkh_expansion() {
        let expansion = expand_str(&format!("pkh({})", PK_TWO)).unwrap();
        assert_eq!(expansion.descr_type, CompositeType::Pkh);
        assert_eq!(expansion.is_segwit(), Some(false));
        assert!(!expansion.is_ranged);
        assert_eq!(expansion.expanded_expression.as_deref(), Some("pkh(@0)"));
        let map = expansion.expansion_map.as_ref().unwrap();
        assert_eq!(map.get(0).unwrap().pubkey.unwrap().to_string(), PK_TWO);
        let payment = expansion.payment.unwrap();
        assert_eq!(
            payment.script_pubkey,
            script("76a91484e9ed95a38613f0527ff685a9928abe2d4754d488ac")
        );
        assert_eq!(
            payment.address.unwrap().to_string(),
            "1D7nRvrRgzCg9kYBwhPH3j3Gs6SmsRg3Wq"
        );
    }

    #[test]
    fn pk_has_no_address() {
        let expansion = expand_str(&format!("pk({})", PK_TWO)).unwrap();
        let payment = expansion.payment.unwrap();
        assert_eq!(payment.script_pubkey, script(&format!("21{}ac", PK_TWO)));
        assert_eq!(payment.address, None);
    }

    #[test]
    fn wpkh_expansion() {
        let expansion = expand_str(&format!("wpkh({})", PK_TWO)).unwrap();
        assert_eq!(expansion.is_segwit(), Some(true));
        let payment = expansion.payment.unwrap();
        assert_eq!(
            payment.script_pubkey,
            script("001484e9ed95a38613f0527ff685a9928abe2d4754d4")
        );
        assert_eq!(payment.script_pubkey.len(), 22);
        assert_eq!(
            payment.address.unwrap().to_string(),
            "bc1qsn57m9drscflq5nl76z6ny52hck5w4x5wqd9yt"
        );
    }

    #[test]
    fn sh_wpkh_expansion() {
        let expansion = expand_str(&format!("sh(wpkh({}))", PK_TWO)).unwrap();
        assert_eq!(expansion.descr_type, CompositeType::ShWpkh);
        assert_eq!(expansion.is_segwit(), Some(true));
        assert_eq!(
            expansion.expanded_expression.as_deref(),
            Some("sh(wpkh(@0))")
        );
        assert_eq!(
            expansion.redeem_script.unwrap(),
            script("001484e9ed95a38613f0527ff685a9928abe2d4754d4")
        );
        let payment = expansion.payment.unwrap();
        assert_eq!(
            payment.script_pubkey,
            script("a914f1c3b9a431134cb90a500ec06e0067cfa9b8bba787")
        );
        assert_eq!(
            payment.address.unwrap().to_string(),
            "3PjMEzoveVbvajcnDDuxcJhsuqPHgydQXq"
        );
    }

    #[test]
    fn wsh_miniscript_expansion() {
        let expansion = expand_str(&format!("wsh(pk({}))", PK_TWO)).unwrap();
        assert_eq!(expansion.descr_type, CompositeType::Wsh);
        assert_eq!(expansion.miniscript.as_deref(), Some(&*format!("pk({})", PK_TWO)));
        assert_eq!(expansion.expanded_miniscript.as_deref(), Some("pk(@0)"));
        assert_eq!(expansion.expanded_expression.as_deref(), Some("wsh(pk(@0))"));
        let witness_script = expansion.witness_script.unwrap();
        assert_eq!(witness_script, script(&format!("21{}ac", PK_TWO)));
        assert!(witness_script.len() <= MAX_WITNESS_SCRIPT_SIZE);
        let payment = expansion.payment.unwrap();
        assert_eq!(
            payment.script_pubkey,
            script("0020f9379edc8983152dc781747830075bd53896e4b0ce5bff73777fd77d124ba085")
        );
        assert_eq!(
            payment.address.unwrap().to_string(),
            "bc1qlymeahyfsv2jm3upw3urqp6m65ufde9seedl7umh0lth6yjt5zzsk33tv6"
        );
        assert_eq!(expansion.redeem_script, None);
    }

    #[test]
    fn sh_wsh_miniscript_expansion() {
        let expansion = expand_str(&format!("sh(wsh(pk({})))", PK_TWO)).unwrap();
        assert_eq!(expansion.descr_type, CompositeType::ShWsh);
        assert_eq!(
            expansion.redeem_script.unwrap(),
            script("0020f9379edc8983152dc781747830075bd53896e4b0ce5bff73777fd77d124ba085")
        );
        assert_eq!(
            expansion.witness_script.unwrap(),
            script(&format!("21{}ac", PK_TWO))
        );
        let payment = expansion.payment.unwrap();
        assert_eq!(
            payment.script_pubkey,
            script("a9144bec5d7feeed99e1d0a23fe32a4afe126a7ff07e87")
        );
        assert_eq!(
            payment.address.unwrap().to_string(),
            "38cTksiyPT2b1uGRVbVqHdDhW9vKs84N6Z"
        );
    }

    #[test]
    fn sh_miniscript_expansion() {
        let expansion = expand_str(&format!("sh(pk({}))", PK_TWO)).unwrap();
        assert_eq!(expansion.descr_type, CompositeType::Sh);
        assert_eq!(expansion.is_segwit(), Some(false));
        let redeem_script = expansion.redeem_script.unwrap();
        assert_eq!(redeem_script, script(&format!("21{}ac", PK_TWO)));
        assert!(redeem_script.len() <= MAX_REDEEM_SCRIPT_SIZE);
        let payment = expansion.payment.unwrap();
        assert_eq!(
            payment.script_pubkey,
            script("a914aa5282151694d3f2f32ace7d00ad38f927a33ac887")
        );
        assert_eq!(
            payment.address.unwrap().to_string(),
            "3HDbdvM9CQ6ASnQFUkWw6Z4t3qNwMesJE9"
        );
        assert_eq!(expansion.witness_script, None);
    }

    #[test]
    fn sh_miniscript_requires_whitelisted_head() {
        let descriptor = format!("sh(and_v(v:pk({}),older(1)))", PK_TWO);
        assert!(matches!(
            expand_str(&descriptor),
            Err(Error::InvalidDescriptor(_))
        ));
        let mut params = ExpandParams::with(&descriptor, Network::Bitcoin);
        params.allow_miniscript_in_p2sh = true;
        let expansion = expand(&secp(), &params).unwrap();
        assert!(expansion.redeem_script.is_some());
    }

    #[test]
    fn addr_expansion() {
        let expansion = expand_str("addr(1D7nRvrRgzCg9kYBwhPH3j3Gs6SmsRg3Wq)").unwrap();
        assert_eq!(expansion.descr_type, CompositeType::Addr);
        assert_eq!(expansion.is_segwit(), None);
        assert_eq!(expansion.spk_class, Some(SpkClass::P2pkh));
        assert_eq!(expansion.expansion_map, None);
        assert_eq!(
            expansion.payment.unwrap().script_pubkey,
            script("76a91484e9ed95a38613f0527ff685a9928abe2d4754d488ac")
        );

        let expansion =
            expand_str("addr(bc1qsn57m9drscflq5nl76z6ny52hck5w4x5wqd9yt)").unwrap();
        assert_eq!(expansion.spk_class, Some(SpkClass::P2wpkh));
    }

    #[test]
    fn addr_network_mismatch() {
        let params = ExpandParams::with(
            "addr(1D7nRvrRgzCg9kYBwhPH3j3Gs6SmsRg3Wq)",
            Network::Testnet,
        );
        assert!(matches!(
            expand(&secp(), &params),
            Err(Error::InvalidAddress(_, Network::Testnet))
        ));
    }

    #[test]
    fn checksum_handling() {
        let body = format!("pkh({})", PK_2G);
        let valid = format!("{}#{}", body, checksum(&body).unwrap());
        let expansion = expand_str(&valid).unwrap();
        assert_eq!(expansion.canonical_expression, body);

        assert!(matches!(
            expand_str(&format!("{}#00000000", body)),
            Err(Error::Checksum(ChecksumError::Mismatch { .. }))
        ));

        let mut params = ExpandParams::with(&body, Network::Bitcoin);
        params.checksum_required = true;
        assert!(matches!(
            expand(&secp(), &params),
            Err(Error::ChecksumRequired(_))
        ));
        params.descriptor = Some(valid);
        expand(&secp(), &params).unwrap();
    }

    #[test]
    fn ranged_descriptor() {
        let descriptor = format!("wpkh({}/0/*)", XPUB);

        // Shape-only expansion without an index
        let shape = expand_str(&descriptor).unwrap();
        assert!(shape.is_ranged);
        assert_eq!(shape.payment, None);
        assert_eq!(shape.expanded_expression.as_deref(), Some("wpkh(@0)"));
        assert!(shape.expansion_map.unwrap().get(0).unwrap().is_ranged());

        let mut params = ExpandParams::with(&descriptor, Network::Bitcoin);
        params.index = Some(0);
        let at_zero = expand(&secp(), &params).unwrap();
        assert_eq!(at_zero.canonical_expression, format!("wpkh({}/0/0)", XPUB));
        let spk_zero = at_zero.payment.unwrap().script_pubkey;
        assert!(spk_zero.is_v0_p2wpkh());

        params.index = Some(1);
        let at_one = expand(&secp(), &params).unwrap();
        assert_eq!(at_one.canonical_expression, format!("wpkh({}/0/1)", XPUB));
        assert_ne!(at_one.payment.unwrap().script_pubkey, spk_zero);
    }

    #[test]
    fn substitution_commutes_with_expansion() {
        let ranged = format!("wpkh({}/0/*)", XPUB);
        let mut params = ExpandParams::with(&ranged, Network::Bitcoin);
        params.index = Some(7);
        let via_index = expand(&secp(), &params).unwrap();

        let substituted = ranged.replace('*', "7");
        let direct = expand_str(&substituted).unwrap();
        assert_eq!(
            via_index.payment.unwrap().script_pubkey,
            direct.payment.unwrap().script_pubkey
        );
    }

    #[test]
    fn index_on_non_ranged_fails() {
        let mut params =
            ExpandParams::with(format!("pkh({})", PK_TWO), Network::Bitcoin);
        params.index = Some(3);
        assert!(matches!(
            expand(&secp(), &params),
            Err(Error::NonRangedIndex(3))
        ));
    }

    #[test]
    fn script_limits() {
        // 202 OP_DROP opcodes break the non-push operation limit
        let script = Script::from(vec![0x75u8; 202]);
        assert!(matches!(
            check_script_limits(&script, MAX_REDEEM_SCRIPT_SIZE),
            Err(Error::TooManyOps(202))
        ));

        let script = Script::from(vec![0x00u8; MAX_REDEEM_SCRIPT_SIZE + 1]);
        assert!(matches!(
            check_script_limits(&script, MAX_REDEEM_SCRIPT_SIZE),
            Err(Error::ScriptTooLarge { len: 521, max: 520 })
        ));
        check_script_limits(&script, MAX_WITNESS_SCRIPT_SIZE).unwrap();
    }

    #[test]
    fn unparseable_descriptors() {
        assert!(matches!(expand_str(""), Err(Error::Empty)));
        assert!(matches!(
            expand_str("foo(bar)"),
            Err(Error::InvalidDescriptor(_))
        ));
        assert!(matches!(
            expand_str(&format!("pkh({}))", PK_TWO)),
            Err(Error::InvalidDescriptor(_))
        ));
        let mut params = ExpandParams::default();
        params.expression = Some(s!("pkh(deadbeef)"));
        params.descriptor = Some(s!("pkh(deadbeef)"));
        assert!(matches!(
            expand(&secp(), &params),
            Err(Error::DescriptorAndExpression)
        ));
    }
}
