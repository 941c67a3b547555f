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

//! The [`Output`] object: a descriptor expansion bound to a concrete
//! instance (network, index, preimages, signer set), exposing script and
//! address derivation, temporal constraints, satisfaction assembly and PSBT
//! input updating & finalization.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::hex::ToHex;
use bitcoin::hashes::{hash160, ripemd160, sha256, sha256d, Hash};
use bitcoin::secp256k1::{Secp256k1, Signing, Verification};
use bitcoin::util::psbt::{Input as PsbtInput, Output as PsbtOutput, PsbtSighashType};
use bitcoin::{
    Address, EcdsaSig, EcdsaSighashType, LockTime, Network, OutPoint, PackedLockTime, PublicKey,
    Script, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use miniscript::{hash256, Legacy, Miniscript, Segwitv0};
use tracing::warn;

use crate::descriptor::{self, expand, CompositeType, ExpandParams, Expansion, Payment, SpkClass};
use crate::expression::substitute_pubkeys;
use crate::psbt::{
    append_input, append_output, install_final_scripts, verify_input_signatures, InputPrevout,
    MatchError, Psbt, SignatureError,
};
use crate::satisfy::{
    satisfaction, spending_plan, witness_to_script_sig, PreimageStore, TimeConstraints,
    LOCKTIME_THRESHOLD,
};

const SEQ_NO_MAX: Sequence = Sequence(0xFFFF_FFFF);
const SEQ_NO_SUBMAX: Sequence = Sequence(0xFFFF_FFFE);

/// A hash preimage revealed during satisfaction of `sha256`, `hash256`,
/// `ripemd160` or `hash160` miniscript fragments. The digest is 20 or 32
/// bytes; the hash function is recognized by hashing the preimage.
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct Preimage {
    /// The digest committed to by the miniscript fragment
    pub digest: Vec<u8>,
    /// The 32-byte preimage hashing to the digest
    pub preimage: Vec<u8>,
}

/// Errors constructing or querying an [`Output`]
#[derive(Debug, Display, From)]
#[display(doc_comments)]
pub enum OutputError {
    /// descriptor expansion error: {0}
    #[from]
    Expand(descriptor::Error),

    /// ranged descriptor can't be bound to an output without an index
    RangedWithoutIndex,

    /// descriptor '{0}' has no address representation
    NoAddress(String),

    /// preimage does not match digest {0} under any known hash function
    InvalidPreimage(String),

    /// signer public keys can't be derived from a non-materialized
    /// expansion
    UnmaterializedSigners,

    /// descriptor does not embed a miniscript
    NoMiniscript,

    /// spending conditions can't be satisfied with the provided signatures,
    /// preimages and time constraints
    SatisfactionUnavailable,
}

impl std::error::Error for OutputError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            OutputError::Expand(err) => Some(err),
            _ => None,
        }
    }
}

/// Errors updating or finalizing PSBT inputs for an [`Output`]
#[derive(Debug, Display, From)]
#[display(doc_comments)]
pub enum FinalizeError {
    /// descriptor is address-only and its witness structure is unknown
    UnknownSegwit,

    /// updating a PSBT input requires either the full previous transaction
    /// or its txid together with the spent value
    InsufficientPrevoutData,

    /// previous transaction {0} has no output {1}
    NoPrevout(Txid, u32),

    /// output {vout} of transaction {txid} does not pay to this descriptor
    PrevoutMismatch {
        /// Previous transaction id
        txid: Txid,
        /// Spent output number
        vout: u32,
    },

    /// provided txid {expected} does not match the previous transaction
    /// {actual}
    TxidParamMismatch {
        /// Txid given in the update parameters
        expected: Txid,
        /// Txid of the provided previous transaction
        actual: Txid,
    },

    /// PSBT `nLockTime` {psbt} is of a different class than the required
    /// {required}
    LockTimeConflict {
        /// Lock time already set on the PSBT
        psbt: u32,
        /// Lock time required by this output
        required: u32,
    },

    /// PSBT structure error: {0}
    #[from]
    Match(MatchError),

    /// signature validation failure: {0}
    #[from]
    Signatures(SignatureError),

    /// input {0} carries no usable partial signatures
    MissingSignatures(usize),

    /// scriptPubkey of input {0} does not match this descriptor
    ScriptPubkeyMismatch(usize),

    /// input {index} sequence {actual:#010x} does not match the expected
    /// {expected:#010x}
    SequenceMismatch {
        /// Input index
        index: usize,
        /// Sequence required by this output
        expected: u32,
        /// Sequence found on the transaction input
        actual: u32,
    },

    /// PSBT `nLockTime` {actual} does not match the expected {expected}
    LockTimeMismatch {
        /// Lock time required by this output
        expected: u32,
        /// Lock time found on the PSBT
        actual: u32,
    },

    /// witness script of input {0} does not match this descriptor
    WitnessScriptMismatch(usize),

    /// redeem script of input {0} does not match this descriptor
    RedeemScriptMismatch(usize),

    /// spending conditions of input {0} can't be satisfied with the
    /// provided signatures
    SatisfactionUnavailable(usize),

    /// input {0} spends an output which can't be finalized without its
    /// spending scripts
    UnsupportedShape(usize),
}

impl std::error::Error for FinalizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FinalizeError::Match(err) => Some(err),
            FinalizeError::Signatures(err) => Some(err),
            _ => None,
        }
    }
}

/// Request record for [`Output`] construction.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct OutputParams {
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
    /// Preimages revealable during satisfaction
    pub preimages: Vec<Preimage>,
    /// Explicit signer set; defaults to every key of the expansion map
    pub signers_pub_keys: Option<Vec<PublicKey>>,
}

impl Default for OutputParams {
    fn default() -> Self {
        OutputParams {
            descriptor: None,
            expression: None,
            index: None,
            checksum_required: false,
            allow_miniscript_in_p2sh: false,
            network: Network::Bitcoin,
            preimages: vec![],
            signers_pub_keys: None,
        }
    }
}

impl OutputParams {
    /// Request binding `descriptor` on `network`, other knobs at their
    /// defaults.
    pub fn with(descriptor: impl Display, network: Network) -> OutputParams {
        OutputParams {
            descriptor: Some(descriptor.to_string()),
            network,
            ..OutputParams::default()
        }
    }
}

/// Parameters locating the UTXO appended as a PSBT input by
/// [`Output::update_psbt_as_input`].
#[derive(Clone, Eq, PartialEq, Debug, Default)]
pub struct PsbtInputParams {
    /// Output number of the spent UTXO within its transaction
    pub vout: u32,
    /// Full previous transaction. Omitting it downgrades the PSBT input to
    /// a witness-UTXO-only record, which some signers reject
    pub tx: Option<Transaction>,
    /// Previous transaction id; required when `tx` is omitted
    pub txid: Option<Txid>,
    /// Value of the spent UTXO in satoshis; required when `tx` is omitted
    pub value: Option<u64>,
}

/// Finalizer bound to the PSBT input index assigned at append time by
/// [`Output::update_psbt_as_input`].
pub struct InputFinalizer<'a> {
    output: &'a Output,
    index: usize,
}

impl InputFinalizer<'_> {
    /// Index of the PSBT input this finalizer is bound to.
    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Finalizes the bound input; see [`Output::finalize_psbt_input`].
    #[inline]
    pub fn finalize<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        psbt: &mut Psbt,
        validate: bool,
    ) -> Result<(), FinalizeError> {
        self.output
            .finalize_psbt_input(secp, psbt, self.index, validate)
    }
}

enum CompiledMiniscript {
    Segwit(Miniscript<PublicKey, Segwitv0>),
    Legacy(Miniscript<PublicKey, Legacy>),
}

/// A descriptor bound to a concrete output instance. Immutable after
/// construction; all derived artifacts are precomputed or pure.
pub struct Output {
    expansion: Expansion,
    network: Network,
    signers: Vec<PublicKey>,
    preimages: PreimageStore,
    ms: Option<CompiledMiniscript>,
    constraints: Option<TimeConstraints>,
}

fn preimage_store(preimages: &[Preimage]) -> Result<PreimageStore, OutputError> {
    let mut store = PreimageStore::default();
    for Preimage { digest, preimage } in preimages {
        let invalid = || OutputError::InvalidPreimage(digest.to_hex());
        let bytes: [u8; 32] = preimage[..].try_into().map_err(|_| invalid())?;
        match digest.len() {
            32 => {
                if sha256::Hash::hash(&bytes)[..] == digest[..] {
                    store.sha256.insert(
                        sha256::Hash::from_slice(digest).expect("digest length checked"),
                        bytes,
                    );
                } else if hash256::Hash::hash(&bytes)[..] == digest[..] {
                    store.hash256.insert(
                        hash256::Hash::from_slice(digest).expect("digest length checked"),
                        bytes,
                    );
                } else {
                    return Err(invalid());
                }
            }
            20 => {
                if ripemd160::Hash::hash(&bytes)[..] == digest[..] {
                    store.ripemd160.insert(
                        ripemd160::Hash::from_slice(digest).expect("digest length checked"),
                        bytes,
                    );
                } else if hash160::Hash::hash(&bytes)[..] == digest[..] {
                    store.hash160.insert(
                        hash160::Hash::from_slice(digest).expect("digest length checked"),
                        bytes,
                    );
                } else {
                    return Err(invalid());
                }
            }
            _ => return Err(invalid()),
        }
    }
    Ok(store)
}

impl Output {
    /// Binds a descriptor to a concrete output instance.
    ///
    /// Fails when the descriptor does not expand, when it is ranged and no
    /// index is provided, or when the signer set or preimages can't be
    /// validated.
    pub fn new<C: Signing + Verification>(
        secp: &Secp256k1<C>,
        params: OutputParams,
    ) -> Result<Output, OutputError> {
        let expand_params = ExpandParams {
            descriptor: params.descriptor,
            expression: params.expression,
            index: params.index,
            checksum_required: params.checksum_required,
            allow_miniscript_in_p2sh: params.allow_miniscript_in_p2sh,
            network: params.network,
        };
        let expansion = expand(secp, &expand_params)?;
        if expansion.payment.is_none() {
            return Err(OutputError::RangedWithoutIndex);
        }

        let signers = match params.signers_pub_keys {
            Some(signers) => signers,
            None => match &expansion.expansion_map {
                Some(map) => map.pubkeys().ok_or(OutputError::UnmaterializedSigners)?,
                // addr(...) descriptors know nothing about their keys
                None => vec![],
            },
        };
        let preimages = preimage_store(&params.preimages)?;

        let ms = match (&expansion.expanded_miniscript, &expansion.expansion_map) {
            (Some(expanded), Some(map)) if expansion.descr_type.has_miniscript() => {
                let source =
                    substitute_pubkeys(expanded, map).map_err(descriptor::Error::from)?;
                Some(match expansion.descr_type.is_segwit() {
                    Some(true) => CompiledMiniscript::Segwit(
                        Miniscript::from_str(&source).map_err(descriptor::Error::from)?,
                    ),
                    _ => CompiledMiniscript::Legacy(
                        Miniscript::from_str(&source).map_err(descriptor::Error::from)?,
                    ),
                })
            }
            _ => None,
        };
        let constraints = ms.as_ref().and_then(|compiled| match compiled {
            CompiledMiniscript::Segwit(ms) => spending_plan(ms, &signers, &preimages),
            CompiledMiniscript::Legacy(ms) => spending_plan(ms, &signers, &preimages),
        });

        Ok(Output {
            expansion,
            network: params.network,
            signers,
            preimages,
            ms,
            constraints,
        })
    }

    /// The payment record: locking script plus address form.
    #[inline]
    pub fn payment(&self) -> &Payment {
        self.expansion
            .payment
            .as_ref()
            .expect("construction requires a materialized payment")
    }

    /// The locking script of the output.
    #[inline]
    pub fn script_pubkey(&self) -> &Script {
        &self.payment().script_pubkey
    }

    /// The address of the output; fails for payments without an address
    /// form (bare `pk(...)`).
    pub fn address(&self) -> Result<&Address, OutputError> {
        self.payment()
            .address
            .as_ref()
            .ok_or_else(|| OutputError::NoAddress(self.expansion.canonical_expression.clone()))
    }

    /// Witness script of `wsh`-based descriptors.
    #[inline]
    pub fn witness_script(&self) -> Option<&Script> {
        self.expansion.witness_script.as_ref()
    }

    /// Redeem script of `sh`-wrapped descriptors.
    #[inline]
    pub fn redeem_script(&self) -> Option<&Script> {
        self.expansion.redeem_script.as_ref()
    }

    /// Network the output belongs to.
    #[inline]
    pub fn network(&self) -> Network {
        self.network
    }

    /// Public keys of the signers expected to sign for this output. Unless
    /// given explicitly at construction, these are all keys of the
    /// expansion map; empty for `addr(...)` descriptors.
    #[inline]
    pub fn signers_pub_keys(&self) -> &[PublicKey] {
        &self.signers
    }

    /// Whether spending happens through the segregated witness; unknown
    /// for `addr(...)` descriptors.
    #[inline]
    pub fn is_segwit(&self) -> Option<bool> {
        self.expansion.is_segwit()
    }

    /// Required `nSequence` of the spending input, implied by the relative
    /// timelock of the spending path selected by the signer set. `None` for
    /// non-miniscript descriptors and timelock-free paths.
    #[inline]
    pub fn sequence(&self) -> Option<Sequence> {
        self.constraints.and_then(|c| c.n_sequence)
    }

    /// Required `nLockTime` of the spending transaction. `None` for
    /// non-miniscript descriptors and paths free of absolute timelocks.
    #[inline]
    pub fn lock_time(&self) -> Option<LockTime> {
        self.constraints.and_then(|c| c.n_lock_time)
    }

    /// The underlying expansion: canonical and expanded expressions,
    /// miniscript and the expansion map.
    #[inline]
    pub fn expansion(&self) -> &Expansion {
        &self.expansion
    }

    /// Assembles the miniscript satisfaction witness stack (without the
    /// trailing script) from the given signatures, the registered preimages
    /// and the precomputed time constraints. The constraints were selected
    /// with the full signer set, so real signatures can never shift
    /// `nLockTime`/`nSequence`.
    pub fn script_satisfaction(
        &self,
        signatures: &BTreeMap<PublicKey, EcdsaSig>,
    ) -> Result<Vec<Vec<u8>>, OutputError> {
        let ms = self.ms.as_ref().ok_or(OutputError::NoMiniscript)?;
        let constraints = self
            .constraints
            .ok_or(OutputError::SatisfactionUnavailable)?;
        let stack = match ms {
            CompiledMiniscript::Segwit(ms) => {
                satisfaction(ms, signatures, &self.preimages, constraints)
            }
            CompiledMiniscript::Legacy(ms) => {
                satisfaction(ms, signatures, &self.preimages, constraints)
            }
        };
        stack.map_err(|_| OutputError::SatisfactionUnavailable)
    }

    fn expected_sequence(&self) -> Sequence {
        match (self.sequence(), self.lock_time()) {
            (Some(sequence), _) => sequence,
            (None, Some(lock_time)) if lock_time.to_consensus_u32() != 0 => SEQ_NO_SUBMAX,
            _ => SEQ_NO_MAX,
        }
    }

    fn expected_lock_time(&self) -> u32 {
        self.lock_time()
            .map(LockTime::to_consensus_u32)
            .unwrap_or_default()
    }

    fn bip32_derivation<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
    ) -> BTreeMap<bitcoin::secp256k1::PublicKey, bitcoin::util::bip32::KeySource> {
        let mut derivation = bmap! {};
        if let Some(map) = &self.expansion.expansion_map {
            for info in map.keys() {
                if let (Some(pubkey), Some(source)) = (info.pubkey, info.key_source(secp)) {
                    derivation.insert(pubkey.inner, source);
                }
            }
        }
        derivation
    }

    /// Appends this UTXO as an input of the PSBT: fills the witness or
    /// non-witness UTXO, spending scripts, BIP32 derivations, preimages and
    /// sighash type, sets the input `nSequence` to the value required by
    /// the temporal constraints and raises the PSBT `nLockTime` when the
    /// spending path demands one.
    ///
    /// Returns a finalizer bound to the assigned input index.
    pub fn update_psbt_as_input<'o, C: Signing>(
        &'o self,
        secp: &Secp256k1<C>,
        psbt: &mut Psbt,
        params: PsbtInputParams,
    ) -> Result<InputFinalizer<'o>, FinalizeError> {
        let is_segwit = self.is_segwit().ok_or(FinalizeError::UnknownSegwit)?;

        let (txid, value) = match &params.tx {
            Some(tx) => {
                let txid = tx.txid();
                let txout = tx
                    .output
                    .get(params.vout as usize)
                    .ok_or(FinalizeError::NoPrevout(txid, params.vout))?;
                if &txout.script_pubkey != self.script_pubkey() {
                    return Err(FinalizeError::PrevoutMismatch {
                        txid,
                        vout: params.vout,
                    });
                }
                if let Some(expected) = params.txid {
                    if expected != txid {
                        return Err(FinalizeError::TxidParamMismatch {
                            expected,
                            actual: txid,
                        });
                    }
                }
                (txid, txout.value)
            }
            None => {
                warn!(
                    "PSBT input updated without the full previous transaction; \
                     some signing devices refuse witness-UTXO-only inputs"
                );
                let txid = params.txid.ok_or(FinalizeError::InsufficientPrevoutData)?;
                let value = params.value.ok_or(FinalizeError::InsufficientPrevoutData)?;
                (txid, value)
            }
        };

        if let Some(lock_time) = self.lock_time() {
            let required = lock_time.to_consensus_u32();
            let current = psbt.unsigned_tx.lock_time.0;
            if current != 0 && (current < LOCKTIME_THRESHOLD) != (required < LOCKTIME_THRESHOLD) {
                return Err(FinalizeError::LockTimeConflict {
                    psbt: current,
                    required,
                });
            }
            if required > current {
                psbt.unsigned_tx.lock_time = PackedLockTime(required);
            }
        }

        let mut input = PsbtInput {
            non_witness_utxo: params.tx,
            redeem_script: self.redeem_script().cloned(),
            witness_script: self.witness_script().cloned(),
            sighash_type: Some(PsbtSighashType::from(EcdsaSighashType::All)),
            bip32_derivation: self.bip32_derivation(secp),
            ..PsbtInput::default()
        };
        if is_segwit {
            input.witness_utxo = Some(TxOut {
                value,
                script_pubkey: self.script_pubkey().clone(),
            });
        }
        for (digest, preimage) in &self.preimages.sha256 {
            input.sha256_preimages.insert(*digest, preimage.to_vec());
        }
        for (digest, preimage) in &self.preimages.hash256 {
            let digest = sha256d::Hash::from_slice(&digest[..]).expect("32-byte digest");
            input.hash256_preimages.insert(digest, preimage.to_vec());
        }
        for (digest, preimage) in &self.preimages.ripemd160 {
            input.ripemd160_preimages.insert(*digest, preimage.to_vec());
        }
        for (digest, preimage) in &self.preimages.hash160 {
            input.hash160_preimages.insert(*digest, preimage.to_vec());
        }

        let txin = TxIn {
            previous_output: OutPoint::new(txid, params.vout),
            script_sig: Script::new(),
            sequence: self.expected_sequence(),
            witness: Witness::default(),
        };
        let index = append_input(psbt, txin, input);
        Ok(InputFinalizer {
            output: self,
            index,
        })
    }

    /// Appends this output to the PSBT with the given value in satoshis,
    /// filling the spending scripts and BIP32 derivations of the PSBT
    /// output record. Returns the assigned output index.
    pub fn update_psbt_as_output<C: Signing>(
        &self,
        secp: &Secp256k1<C>,
        psbt: &mut Psbt,
        value: u64,
    ) -> usize {
        let output = PsbtOutput {
            redeem_script: self.redeem_script().cloned(),
            witness_script: self.witness_script().cloned(),
            bip32_derivation: self.bip32_derivation(secp),
            ..PsbtOutput::default()
        };
        let txout = TxOut {
            value,
            script_pubkey: self.script_pubkey().clone(),
        };
        append_output(psbt, txout, output)
    }

    // Input-shape assertion run before finalization: the PSBT input must
    // spend this very output under its temporal constraints.
    fn assert_psbt_input(&self, psbt: &Psbt, index: usize) -> Result<(), FinalizeError> {
        let prevout = psbt.input_prevout(index)?;
        if prevout.script_pubkey != *self.script_pubkey() {
            return Err(FinalizeError::ScriptPubkeyMismatch(index));
        }
        let txin = psbt
            .unsigned_tx
            .input
            .get(index)
            .ok_or(MatchError::WrongInputNo(index))?;
        let expected = self.expected_sequence();
        if txin.sequence != expected {
            return Err(FinalizeError::SequenceMismatch {
                index,
                expected: expected.to_consensus_u32(),
                actual: txin.sequence.to_consensus_u32(),
            });
        }
        let lock_time = psbt.unsigned_tx.lock_time.0;
        if lock_time != self.expected_lock_time() {
            return Err(FinalizeError::LockTimeMismatch {
                expected: self.expected_lock_time(),
                actual: lock_time,
            });
        }
        let input = psbt
            .inputs
            .get(index)
            .ok_or(MatchError::WrongInputNo(index))?;
        if input.witness_script.as_ref() != self.witness_script() {
            return Err(FinalizeError::WitnessScriptMismatch(index));
        }
        if input.redeem_script.as_ref() != self.redeem_script() {
            return Err(FinalizeError::RedeemScriptMismatch(index));
        }
        Ok(())
    }

    /// Finalizes PSBT input `index`: validates the partial signatures (when
    /// `validate` is set), asserts the input shape against this output,
    /// assembles the final scriptSig/witness and clears the non-final
    /// fields.
    pub fn finalize_psbt_input<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        psbt: &mut Psbt,
        index: usize,
        validate: bool,
    ) -> Result<(), FinalizeError> {
        if validate {
            verify_input_signatures(secp, psbt, index)?;
        }
        let partial_sigs = psbt
            .inputs
            .get(index)
            .ok_or(MatchError::WrongInputNo(index))?
            .partial_sigs
            .clone();
        if partial_sigs.is_empty() {
            return Err(FinalizeError::MissingSignatures(index));
        }
        self.assert_psbt_input(psbt, index)?;

        if self.ms.is_some() {
            let stack = self
                .script_satisfaction(&partial_sigs)
                .map_err(|_| FinalizeError::SatisfactionUnavailable(index))?;
            let (script_sig, witness) = match self.expansion.descr_type {
                CompositeType::Wsh => {
                    let witness_script = self
                        .witness_script()
                        .expect("wsh descriptors carry a witness script")
                        .clone();
                    let mut elements = stack;
                    elements.push(witness_script.into_bytes());
                    (None, Some(Witness::from_vec(elements)))
                }
                CompositeType::ShWsh => {
                    let witness_script = self
                        .witness_script()
                        .expect("sh(wsh) descriptors carry a witness script")
                        .clone();
                    let redeem_script = self
                        .redeem_script()
                        .expect("sh(wsh) descriptors carry a redeem script");
                    let script_sig = Builder::new()
                        .push_slice(redeem_script.as_bytes())
                        .into_script();
                    let mut elements = stack;
                    elements.push(witness_script.into_bytes());
                    (Some(script_sig), Some(Witness::from_vec(elements)))
                }
                CompositeType::Sh => {
                    let redeem_script = self
                        .redeem_script()
                        .expect("sh descriptors carry a redeem script")
                        .clone();
                    let mut elements = stack;
                    elements.push(redeem_script.into_bytes());
                    (Some(witness_to_script_sig(&elements)), None)
                }
                _ => unreachable!("compiled miniscript implies a miniscript shell"),
            };
            install_final_scripts(&mut psbt.inputs[index], script_sig, witness);
            return Ok(());
        }

        self.finalize_single_key(psbt, index, &partial_sigs)
    }

    // Default finalization of single-key shapes, including `addr(...)`
    // instances whose scriptPubkey class admits one.
    fn finalize_single_key(
        &self,
        psbt: &mut Psbt,
        index: usize,
        partial_sigs: &BTreeMap<PublicKey, EcdsaSig>,
    ) -> Result<(), FinalizeError> {
        let descr_type = self.expansion.descr_type;

        let signature_for = |pubkey: &PublicKey| -> Result<Vec<u8>, FinalizeError> {
            partial_sigs
                .get(pubkey)
                .map(|sig| sig.to_vec())
                .ok_or(FinalizeError::MissingSignatures(index))
        };

        let (script_sig, witness) = match descr_type {
            CompositeType::Pk | CompositeType::Pkh | CompositeType::Wpkh | CompositeType::ShWpkh => {
                let pubkey = self
                    .expansion
                    .expansion_map
                    .as_ref()
                    .and_then(|map| map.get(0))
                    .and_then(|info| info.pubkey)
                    .expect("single-key shells have a materialized key");
                let sig = signature_for(&pubkey)?;
                match descr_type {
                    CompositeType::Pk => {
                        (Some(Builder::new().push_slice(&sig).into_script()), None)
                    }
                    CompositeType::Pkh => (
                        Some(
                            Builder::new()
                                .push_slice(&sig)
                                .push_slice(&pubkey.to_bytes())
                                .into_script(),
                        ),
                        None,
                    ),
                    CompositeType::Wpkh => (
                        None,
                        Some(Witness::from_vec(vec![sig, pubkey.to_bytes()])),
                    ),
                    CompositeType::ShWpkh => {
                        let redeem_script = self
                            .redeem_script()
                            .expect("sh(wpkh) descriptors carry a redeem script");
                        (
                            Some(
                                Builder::new()
                                    .push_slice(redeem_script.as_bytes())
                                    .into_script(),
                            ),
                            Some(Witness::from_vec(vec![sig, pubkey.to_bytes()])),
                        )
                    }
                    _ => unreachable!("outer match limits the shell set"),
                }
            }
            CompositeType::Addr => {
                let spk = self.script_pubkey();
                match self.expansion.spk_class {
                    Some(SpkClass::P2pkh) => {
                        let (pubkey, sig) = partial_sigs
                            .iter()
                            .find(|(pk, _)| Script::new_p2pkh(&pk.pubkey_hash()) == *spk)
                            .ok_or(FinalizeError::MissingSignatures(index))?;
                        (
                            Some(
                                Builder::new()
                                    .push_slice(&sig.to_vec())
                                    .push_slice(&pubkey.to_bytes())
                                    .into_script(),
                            ),
                            None,
                        )
                    }
                    Some(SpkClass::P2wpkh) => {
                        let (pubkey, sig) = partial_sigs
                            .iter()
                            .find(|(pk, _)| {
                                pk.wpubkey_hash()
                                    .map(|hash| Script::new_v0_p2wpkh(&hash) == *spk)
                                    .unwrap_or(false)
                            })
                            .ok_or(FinalizeError::MissingSignatures(index))?;
                        (
                            None,
                            Some(Witness::from_vec(vec![sig.to_vec(), pubkey.to_bytes()])),
                        )
                    }
                    _ => return Err(FinalizeError::UnsupportedShape(index)),
                }
            }
            _ => unreachable!("miniscript shells are finalized separately"),
        };

        install_final_scripts(&mut psbt.inputs[index], script_sig, witness);
        Ok(())
    }
}
