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

//! Miniscript satisfaction machinery: the spending-path analyzer computing
//! the temporal constraints implied by a signer set, and the satisfier
//! assembling witness stacks under those constraints.
//!
//! The analyzer walks the miniscript AST assuming every known signer will
//! provide a signature and every registered preimage is revealable; for each
//! disjunction it picks the cheapest satisfiable branch, preferring branches
//! free of timelocks. The `nSequence`/`nLockTime` pair of the chosen path is
//! a design-level invariant of the output: the satisfier built from real
//! signatures admits exactly those constraints, so satisfaction can never
//! silently shift the transaction timing.

use std::collections::BTreeMap;

use bitcoin::blockdata::script::{self, Builder};
use bitcoin::hashes::{hash160, ripemd160, sha256};
use bitcoin::{EcdsaSig, LockTime, PublicKey, Script, Sequence};
use miniscript::{hash256, Miniscript, Satisfier, ScriptContext, Terminal};

/// Bit of an `nSequence` value switching the relative lock from block-based
/// to time-based interpretation.
pub const SEQ_NO_CSV_TYPE_MASK: u32 = 0x00400000;

/// `nLockTime` values below this threshold are block heights, values above
/// are UNIX timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Temporal constraints of a chosen spending path.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct TimeConstraints {
    /// Required `nSequence` of the spending input, if the path uses a
    /// relative timelock
    pub n_sequence: Option<Sequence>,
    /// Required `nLockTime` of the spending transaction, if the path uses
    /// an absolute timelock
    pub n_lock_time: Option<LockTime>,
}

/// Preimages keyed by the digests under which miniscript fragments commit
/// to them.
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PreimageStore {
    pub(crate) sha256: BTreeMap<sha256::Hash, [u8; 32]>,
    pub(crate) hash256: BTreeMap<hash256::Hash, [u8; 32]>,
    pub(crate) ripemd160: BTreeMap<ripemd160::Hash, [u8; 32]>,
    pub(crate) hash160: BTreeMap<hash160::Hash, [u8; 32]>,
}

impl PreimageStore {
    /// Whether no preimage is registered.
    pub fn is_empty(&self) -> bool {
        self.sha256.is_empty()
            && self.hash256.is_empty()
            && self.ripemd160.is_empty()
            && self.hash160.is_empty()
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
struct Plan {
    sigs: usize,
    hashes: usize,
    sequence: Option<Sequence>,
    lock_time: Option<LockTime>,
}

impl Plan {
    const EMPTY: Plan = Plan {
        sigs: 0,
        hashes: 0,
        sequence: None,
        lock_time: None,
    };

    fn sig() -> Plan {
        Plan { sigs: 1, ..Plan::EMPTY }
    }

    fn hash() -> Plan {
        Plan {
            hashes: 1,
            ..Plan::EMPTY
        }
    }

    fn older(sequence: Sequence) -> Plan {
        Plan {
            sequence: Some(sequence),
            ..Plan::EMPTY
        }
    }

    fn after(lock_time: LockTime) -> Plan {
        Plan {
            lock_time: Some(lock_time),
            ..Plan::EMPTY
        }
    }

    fn timelocked(&self) -> bool {
        self.sequence.is_some() || self.lock_time.is_some()
    }

    fn cost(&self) -> (usize, usize) {
        (self.timelocked() as usize, self.sigs + self.hashes)
    }
}

// Relative locks combine only within the same interpretation (blocks with
// blocks, 512s intervals with intervals); the stricter value wins.
fn merge_sequence(a: Option<Sequence>, b: Option<Sequence>) -> Result<Option<Sequence>, ()> {
    match (a, b) {
        (None, other) | (other, None) => Ok(other),
        (Some(a), Some(b)) => {
            let (av, bv) = (a.to_consensus_u32(), b.to_consensus_u32());
            if av & SEQ_NO_CSV_TYPE_MASK != bv & SEQ_NO_CSV_TYPE_MASK {
                return Err(());
            }
            Ok(Some(if av & 0xFFFF >= bv & 0xFFFF { a } else { b }))
        }
    }
}

fn merge_lock_time(a: Option<LockTime>, b: Option<LockTime>) -> Result<Option<LockTime>, ()> {
    match (a, b) {
        (None, other) | (other, None) => Ok(other),
        (Some(a), Some(b)) => {
            let (av, bv) = (a.to_consensus_u32(), b.to_consensus_u32());
            if (av < LOCKTIME_THRESHOLD) != (bv < LOCKTIME_THRESHOLD) {
                return Err(());
            }
            Ok(Some(if av >= bv { a } else { b }))
        }
    }
}

fn both(a: Option<Plan>, b: Option<Plan>) -> Option<Plan> {
    let (a, b) = (a?, b?);
    Some(Plan {
        sigs: a.sigs + b.sigs,
        hashes: a.hashes + b.hashes,
        sequence: merge_sequence(a.sequence, b.sequence).ok()?,
        lock_time: merge_lock_time(a.lock_time, b.lock_time).ok()?,
    })
}

fn either(a: Option<Plan>, b: Option<Plan>) -> Option<Plan> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if a.cost() <= b.cost() { a } else { b }),
        (plan, None) | (None, plan) => plan,
    }
}

fn node_plan<Ctx: ScriptContext>(
    ms: &Miniscript<PublicKey, Ctx>,
    signers: &[PublicKey],
    preimages: &PreimageStore,
) -> Option<Plan> {
    match &ms.node {
        Terminal::True => Some(Plan::EMPTY),
        Terminal::False => None,
        Terminal::PkK(pk) | Terminal::PkH(pk) => {
            if signers.contains(pk) {
                Some(Plan::sig())
            } else {
                None
            }
        }
        Terminal::RawPkH(_) => None,
        Terminal::After(n) => Some(Plan::after(LockTime::from(*n))),
        Terminal::Older(n) => Some(Plan::older(*n)),
        Terminal::Sha256(digest) => preimages.sha256.contains_key(digest).then(Plan::hash),
        Terminal::Hash256(digest) => preimages.hash256.contains_key(digest).then(Plan::hash),
        Terminal::Ripemd160(digest) => preimages.ripemd160.contains_key(digest).then(Plan::hash),
        Terminal::Hash160(digest) => preimages.hash160.contains_key(digest).then(Plan::hash),
        Terminal::Alt(sub)
        | Terminal::Swap(sub)
        | Terminal::Check(sub)
        | Terminal::DupIf(sub)
        | Terminal::Verify(sub)
        | Terminal::NonZero(sub)
        | Terminal::ZeroNotEqual(sub) => node_plan(sub, signers, preimages),
        Terminal::AndV(a, b) | Terminal::AndB(a, b) => both(
            node_plan(a, signers, preimages),
            node_plan(b, signers, preimages),
        ),
        Terminal::AndOr(a, b, c) => either(
            both(
                node_plan(a, signers, preimages),
                node_plan(b, signers, preimages),
            ),
            node_plan(c, signers, preimages),
        ),
        Terminal::OrB(a, b)
        | Terminal::OrC(a, b)
        | Terminal::OrD(a, b)
        | Terminal::OrI(a, b) => either(
            node_plan(a, signers, preimages),
            node_plan(b, signers, preimages),
        ),
        Terminal::Thresh(k, subs) => {
            let mut plans: Vec<Plan> = subs
                .iter()
                .filter_map(|sub| node_plan(sub, signers, preimages))
                .collect();
            if plans.len() < *k {
                return None;
            }
            plans.sort_by_key(Plan::cost);
            plans
                .into_iter()
                .take(*k)
                .try_fold(Plan::EMPTY, |acc, plan| both(Some(acc), Some(plan)))
        }
        Terminal::Multi(k, pks) | Terminal::MultiA(k, pks) => {
            let available = pks.iter().filter(|pk| signers.contains(pk)).count();
            if available < *k {
                return None;
            }
            Some(Plan {
                sigs: *k,
                ..Plan::EMPTY
            })
        }
    }
}

/// Computes the temporal constraints of the spending path selected by the
/// given signer set and preimages, or `None` when no path is satisfiable.
pub(crate) fn spending_plan<Ctx: ScriptContext>(
    ms: &Miniscript<PublicKey, Ctx>,
    signers: &[PublicKey],
    preimages: &PreimageStore,
) -> Option<TimeConstraints> {
    node_plan(ms, signers, preimages).map(|plan| TimeConstraints {
        n_sequence: plan.sequence,
        n_lock_time: plan.lock_time,
    })
}

fn sequence_implied(required: Sequence, assumed: Sequence) -> bool {
    if !required.is_relative_lock_time() || !assumed.is_relative_lock_time() {
        return false;
    }
    let (req, asm) = (required.to_consensus_u32(), assumed.to_consensus_u32());
    if req & SEQ_NO_CSV_TYPE_MASK != asm & SEQ_NO_CSV_TYPE_MASK {
        return false;
    }
    req & 0xFFFF <= asm & 0xFFFF
}

fn lock_time_implied(required: LockTime, assumed: LockTime) -> bool {
    let (req, asm) = (required.to_consensus_u32(), assumed.to_consensus_u32());
    if (req < LOCKTIME_THRESHOLD) != (asm < LOCKTIME_THRESHOLD) {
        return false;
    }
    req <= asm
}

/// Satisfier over explicit signature and preimage material, gated on the
/// precomputed temporal constraints of the output.
pub(crate) struct OutputSatisfier<'a> {
    pub signatures: &'a BTreeMap<PublicKey, EcdsaSig>,
    pub preimages: &'a PreimageStore,
    pub constraints: TimeConstraints,
}

impl<'a> Satisfier<PublicKey> for OutputSatisfier<'a> {
    fn lookup_ecdsa_sig(&self, pk: &PublicKey) -> Option<EcdsaSig> {
        self.signatures.get(pk).cloned()
    }

    fn lookup_sha256(&self, digest: &sha256::Hash) -> Option<[u8; 32]> {
        self.preimages.sha256.get(digest).copied()
    }

    fn lookup_hash256(&self, digest: &hash256::Hash) -> Option<[u8; 32]> {
        self.preimages.hash256.get(digest).copied()
    }

    fn lookup_ripemd160(&self, digest: &ripemd160::Hash) -> Option<[u8; 32]> {
        self.preimages.ripemd160.get(digest).copied()
    }

    fn lookup_hash160(&self, digest: &hash160::Hash) -> Option<[u8; 32]> {
        self.preimages.hash160.get(digest).copied()
    }

    fn check_older(&self, sequence: Sequence) -> bool {
        match self.constraints.n_sequence {
            Some(assumed) => sequence_implied(sequence, assumed),
            None => false,
        }
    }

    fn check_after(&self, lock_time: LockTime) -> bool {
        match self.constraints.n_lock_time {
            Some(assumed) => lock_time_implied(lock_time, assumed),
            None => false,
        }
    }
}

/// Assembles the satisfaction witness stack for a miniscript under the
/// given constraints. The stack does not include the script itself.
pub(crate) fn satisfaction<Ctx: ScriptContext>(
    ms: &Miniscript<PublicKey, Ctx>,
    signatures: &BTreeMap<PublicKey, EcdsaSig>,
    preimages: &PreimageStore,
    constraints: TimeConstraints,
) -> Result<Vec<Vec<u8>>, miniscript::Error> {
    let satisfier = OutputSatisfier {
        signatures,
        preimages,
        constraints,
    };
    ms.satisfy(&satisfier)
}

/// Encodes a satisfaction stack as a scriptSig, minimally push-encoding
/// each element.
pub(crate) fn witness_to_script_sig(witness: &[Vec<u8>]) -> Script {
    let mut builder = Builder::new();
    for element in witness {
        if let Ok(n) = script::read_scriptint(element) {
            builder = builder.push_int(n);
        } else {
            builder = builder.push_slice(element);
        }
    }
    builder.into_script()
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use bitcoin::secp256k1::{self, Message, Secp256k1, SecretKey};
    use miniscript::Segwitv0;

    use super::*;

    const PK_G: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
    const PK_2G: &str = "02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5";

    fn pk(hex: &str) -> PublicKey {
        PublicKey::from_str(hex).unwrap()
    }

    fn ms(source: &str) -> Miniscript<PublicKey, Segwitv0> {
        Miniscript::from_str(source).unwrap()
    }

    fn plan(source: &str, signers: &[PublicKey]) -> Option<TimeConstraints> {
        spending_plan(&ms(source), signers, &PreimageStore::default())
    }

    #[test]
    fn older_constraint() {
        let source = format!("and_v(v:pk({}),older(144))", PK_G);
        let constraints = plan(&source, &[pk(PK_G)]).unwrap();
        assert_eq!(constraints.n_sequence, Some(Sequence(144)));
        assert_eq!(constraints.n_lock_time, None);

        assert_eq!(plan(&source, &[]), None);
        assert_eq!(plan(&source, &[pk(PK_2G)]), None);
    }

    #[test]
    fn after_constraint() {
        let source = format!("and_v(v:pk({}),after(500000100))", PK_G);
        let constraints = plan(&source, &[pk(PK_G)]).unwrap();
        assert_eq!(constraints.n_sequence, None);
        assert_eq!(
            constraints.n_lock_time,
            Some(LockTime::from_consensus(500000100))
        );
    }

    #[test]
    fn disjunction_prefers_timelock_free_path() {
        let source = format!("or_d(pk({}),and_v(v:pk({}),older(10)))", PK_G, PK_2G);
        let both_signers = [pk(PK_G), pk(PK_2G)];
        let constraints = plan(&source, &both_signers).unwrap();
        assert_eq!(constraints.n_sequence, None);

        let fallback = plan(&source, &[pk(PK_2G)]).unwrap();
        assert_eq!(fallback.n_sequence, Some(Sequence(10)));
    }

    #[test]
    fn multi_requires_threshold() {
        let source = format!("multi(2,{},{})", PK_G, PK_2G);
        assert_eq!(plan(&source, &[pk(PK_G)]), None);
        assert!(plan(&source, &[pk(PK_G), pk(PK_2G)]).is_some());
    }

    #[test]
    fn conflicting_lock_classes_do_not_merge() {
        assert_eq!(
            merge_sequence(Some(Sequence(1)), Some(Sequence(0x0040_0001))),
            Err(())
        );
        assert_eq!(
            merge_sequence(Some(Sequence(16)), Some(Sequence(144))),
            Ok(Some(Sequence(144)))
        );
        assert_eq!(
            merge_lock_time(
                Some(LockTime::from_consensus(100)),
                Some(LockTime::from_consensus(500_000_100))
            ),
            Err(())
        );
    }

    fn signature(secp: &Secp256k1<secp256k1::All>, key: &[u8; 32]) -> (PublicKey, EcdsaSig) {
        let sk = SecretKey::from_slice(key).unwrap();
        let pubkey = PublicKey::new(secp256k1::PublicKey::from_secret_key(secp, &sk));
        let msg = Message::from_slice(&[0xab; 32]).unwrap();
        (pubkey, EcdsaSig::sighash_all(secp.sign_ecdsa(&msg, &sk)))
    }

    #[test]
    fn satisfaction_respects_constraints() {
        let secp = Secp256k1::new();
        let mut key = [0u8; 32];
        key[31] = 1;
        let (pubkey, sig) = signature(&secp, &key);
        assert_eq!(pubkey.to_string(), PK_G);

        let ms = ms(&format!("and_v(v:pk({}),older(144))", PK_G));
        let sig_bytes = sig.to_vec();
        let mut signatures = BTreeMap::new();
        signatures.insert(pubkey, sig);
        let preimages = PreimageStore::default();

        let constraints = TimeConstraints {
            n_sequence: Some(Sequence(144)),
            n_lock_time: None,
        };
        let stack = satisfaction(&ms, &signatures, &preimages, constraints).unwrap();
        assert_eq!(stack.len(), 1);
        assert_eq!(stack[0], sig_bytes);

        // Without the precomputed constraint the timelocked path is
        // inadmissible and satisfaction must fail.
        assert!(satisfaction(
            &ms,
            &signatures,
            &preimages,
            TimeConstraints::default()
        )
        .is_err());
    }

    #[test]
    fn script_sig_encoding() {
        let sig = vec![0x30u8; 71];
        let script_sig = witness_to_script_sig(&[vec![], sig.clone()]);
        let mut expected = Builder::new().push_int(0).push_slice(&sig).into_script();
        assert_eq!(script_sig, expected);
        expected = Builder::new().into_script();
        assert_eq!(witness_to_script_sig(&[]), expected);
    }
}
