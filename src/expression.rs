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

//! Miniscript expansion: separating the shape of a miniscript from its
//! concrete key material. Every key expression inside a miniscript is
//! replaced with a `@i` placeholder, producing an *expanded miniscript*
//! reusable across key sets, plus an [`ExpansionMap`] binding placeholders
//! back to parsed [`KeyInfo`] records.

use std::fmt::{self, Display, Formatter};

use bitcoin::secp256k1::{Secp256k1, Signing, Verification};
use bitcoin::{Network, PublicKey};

use crate::keys::{parse_key_expression, KeyExpressionError, KeyInfo};

// Fragments whose arguments are numbers or hash digests and thus must never
// be interpreted as key expressions (a 32-byte digest is indistinguishable
// from an x-only key by shape alone).
const NON_KEY_FRAGMENTS: [&str; 6] = [
    "sha256",
    "hash256",
    "ripemd160",
    "hash160",
    "after",
    "older",
];

/// Ordered mapping from `@i` placeholders to the key participants of a
/// descriptor. Slots are dense, start at 0 and follow the left-to-right
/// order of first appearance; duplicate key expressions share a slot.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct ExpansionMap {
    keys: Vec<KeyInfo>,
}

impl Display for ExpansionMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (no, info) in self.keys.iter().enumerate() {
            if no > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", ExpansionMap::placeholder(no), info)?;
        }
        Ok(())
    }
}

impl ExpansionMap {
    /// Textual placeholder for slot `no`.
    #[inline]
    pub fn placeholder(no: usize) -> String {
        format!("@{}", no)
    }

    /// Number of distinct key expressions.
    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether the map holds no keys.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Key information for slot `no`.
    #[inline]
    pub fn get(&self, no: usize) -> Option<&KeyInfo> {
        self.keys.get(no)
    }

    /// All key records in placeholder order.
    #[inline]
    pub fn keys(&self) -> &[KeyInfo] {
        &self.keys
    }

    /// Materialized public keys of every slot. `None` if any slot is not
    /// materialized (ranged expression without a substituted index).
    pub fn pubkeys(&self) -> Option<Vec<PublicKey>> {
        self.keys.iter().map(|info| info.pubkey).collect()
    }

    fn position(&self, key_expression: &str) -> Option<usize> {
        self.keys
            .iter()
            .position(|info| info.key_expression == key_expression)
    }

    pub(crate) fn insert(&mut self, info: KeyInfo) -> usize {
        match self.position(&info.key_expression) {
            Some(no) => no,
            None => {
                self.keys.push(info);
                self.keys.len() - 1
            }
        }
    }
}

/// Replaces each key expression inside `miniscript` with a placeholder,
/// returning the expanded miniscript and the expansion map.
///
/// The scan is fragment-aware: arguments of hash and timelock fragments are
/// left untouched, everything else which parses as a key expression becomes
/// a placeholder. Tokens which are not key-shaped at all are passed through
/// to the miniscript parser verbatim; malformed key-shaped tokens
/// (uncompressed keys in SegWit context, bad extended keys and so on) are
/// reported as errors.
pub fn expand_miniscript<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    miniscript: &str,
    network: Network,
    is_segwit: bool,
) -> Result<(String, ExpansionMap), KeyExpressionError> {
    let mut expanded = String::with_capacity(miniscript.len());
    let mut map = ExpansionMap::default();
    let mut fragments: Vec<String> = vec![];
    let mut token = String::new();

    for ch in miniscript.chars() {
        match ch {
            '(' => {
                // Token before a parenthesis is a fragment name; wrappers
                // (`v:`, `and_v` arguments etc.) keep only the last segment.
                let name = token.rsplit(':').next().unwrap_or_default().to_owned();
                expanded.push_str(&token);
                expanded.push(ch);
                fragments.push(name);
                token.clear();
            }
            ',' | ')' => {
                if !token.is_empty() {
                    let enclosing = fragments.last().map(String::as_str).unwrap_or_default();
                    if NON_KEY_FRAGMENTS.contains(&enclosing) {
                        expanded.push_str(&token);
                    } else if let Some(no) = map.position(&token) {
                        expanded.push_str(&ExpansionMap::placeholder(no));
                    } else {
                        match parse_key_expression(secp, &token, network, Some(is_segwit)) {
                            Ok(info) => {
                                let no = map.insert(info);
                                expanded.push_str(&ExpansionMap::placeholder(no));
                            }
                            Err(KeyExpressionError::Unparseable(_)) => expanded.push_str(&token),
                            Err(err) => return Err(err),
                        }
                    }
                    token.clear();
                }
                if ch == ')' {
                    fragments.pop();
                }
                expanded.push(ch);
            }
            _ => token.push(ch),
        }
    }
    // Unbalanced leftovers are left for the miniscript parser to reject.
    expanded.push_str(&token);

    Ok((expanded, map))
}

/// Substitutes every `@i` placeholder of an expanded miniscript with the
/// hex-serialized public key materialized in the corresponding map slot.
pub(crate) fn substitute_pubkeys(
    expanded: &str,
    map: &ExpansionMap,
) -> Result<String, KeyExpressionError> {
    let mut script_source = expanded.to_owned();
    // Highest slots first, so that `@1` never clobbers the tail of `@10`.
    for no in (0..map.len()).rev() {
        let info = map.get(no).expect("slot bounded by map length");
        let pubkey = info
            .pubkey
            .ok_or_else(|| KeyExpressionError::Unmaterialized(info.key_expression.clone()))?;
        script_source = script_source.replace(&ExpansionMap::placeholder(no), &pubkey.to_string());
    }
    Ok(script_source)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::secp256k1::All;
    use miniscript::{Miniscript, Segwitv0};

    use super::*;

    const PK_G: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PK_2G: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn secp() -> Secp256k1<All> {
        Secp256k1::new()
    }

    fn expand(ms: &str) -> (String, ExpansionMap) {
        expand_miniscript(&secp(), ms, Network::Bitcoin, true).unwrap()
    }

    #[test]
    fn single_key() {
        let (expanded, map) = expand(&format!("and_v(v:pk({}),older(144))", PK_G));
        assert_eq!(expanded, "and_v(v:pk(@0),older(144))");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(0).unwrap().pubkey.unwrap().to_string(), PK_G);
    }

    #[test]
    fn duplicate_keys_share_placeholder() {
        let (expanded, map) = expand(&format!("or_b(pk({0}),a:pkh({0}))", PK_G));
        assert_eq!(expanded, "or_b(pk(@0),a:pkh(@0))");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn placeholders_follow_first_appearance() {
        let (expanded, map) = expand(&format!("multi(2,{},{})", PK_G, PK_2G));
        assert_eq!(expanded, "multi(2,@0,@1)");
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(0).unwrap().pubkey.unwrap().to_string(), PK_G);
        assert_eq!(map.get(1).unwrap().pubkey.unwrap().to_string(), PK_2G);
    }

    #[test]
    fn hash_digests_are_not_keys() {
        let digest = "6c60f404f8167a38fc70eaf8aa17ac351023bef86bcb9d1086a19afe95bd5333";
        let (expanded, map) = expand(&format!("and_v(v:sha256({}),pk({}))", digest, PK_G));
        assert_eq!(expanded, format!("and_v(v:sha256({}),pk(@0))", digest));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn substitution_compiles() {
        let (expanded, map) = expand(&format!("and_v(v:pk({}),older(144))", PK_G));
        let script_source = substitute_pubkeys(&expanded, &map).unwrap();
        assert_eq!(script_source, format!("and_v(v:pk({}),older(144))", PK_G));
        let ms = Miniscript::<PublicKey, Segwitv0>::from_str(&script_source).unwrap();
        assert!(!ms.encode().is_empty());
    }

    #[test]
    fn bad_key_expression_is_an_error() {
        let uncompressed = "0479be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798\
             483ada7726a3c4655da4fbfc0e1108a8fd17b448a68554199c47d08ffb10d4b8";
        assert!(matches!(
            expand_miniscript(
                &secp(),
                &format!("pk({})", uncompressed),
                Network::Bitcoin,
                true
            ),
            Err(KeyExpressionError::UncompressedInSegwit(_))
        ));
    }
}
