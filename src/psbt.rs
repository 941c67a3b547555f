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

//! PSBT plumbing shared by input updating and finalization: previous-output
//! resolution, per-input signature validation and final-script
//! installation.

use bitcoin::secp256k1::{Message, Secp256k1, Verification};
use bitcoin::util::psbt::{Input as PsbtInput, Output as PsbtOutput, PartiallySignedTransaction};
use bitcoin::util::sighash::{self, SighashCache};
use bitcoin::{PublicKey, Script, TxIn, TxOut, Txid, Witness};

/// Extended PSBT type used throughout the crate.
pub type Psbt = PartiallySignedTransaction;

/// Errors matching PSBT input data against the spent transaction outputs
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum MatchError {
    /// neither `witness_utxo` nor `non_witness_utxo` is present for input
    /// {0}
    NoInputUtxo(usize),

    /// `non_witness_utxo` {1} does not match the prevout spent by input {0}
    TxidMismatch(usize, Txid),

    /// `non_witness_utxo` of input {0} has no output at the spent prevout
    PrevoutUnknown(usize),

    /// PSBT has no input {0}
    WrongInputNo(usize),
}

/// Access to the previous output spent by a PSBT input.
pub trait InputPrevout {
    /// Returns the [`TxOut`] spent by input `index`, extracted from the
    /// witness UTXO or, for legacy inputs, from the full previous
    /// transaction.
    fn input_prevout(&self, index: usize) -> Result<&TxOut, MatchError>;
}

impl InputPrevout for Psbt {
    fn input_prevout(&self, index: usize) -> Result<&TxOut, MatchError> {
        let (input, txin) = match (self.inputs.get(index), self.unsigned_tx.input.get(index)) {
            (Some(input), Some(txin)) => (input, txin),
            _ => return Err(MatchError::WrongInputNo(index)),
        };
        if let Some(txout) = &input.witness_utxo {
            return Ok(txout);
        }
        let tx = input
            .non_witness_utxo
            .as_ref()
            .ok_or(MatchError::NoInputUtxo(index))?;
        let txid = txin.previous_output.txid;
        if tx.txid() != txid {
            return Err(MatchError::TxidMismatch(index, txid));
        }
        tx.output
            .get(txin.previous_output.vout as usize)
            .ok_or(MatchError::PrevoutUnknown(index))
    }
}

/// Errors validating partial signatures of a PSBT input
#[derive(Debug, Display, From)]
#[display(doc_comments)]
pub enum SignatureError {
    /// spent output can't be resolved: {0}
    #[from]
    Match(MatchError),

    /// input {0} misses the witness script required for signature
    /// validation
    NoWitnessScript(usize),

    /// sighash computation error: {0}
    #[from]
    Sighash(sighash::Error),

    /// signature by {pk} over input {index} does not verify
    Invalid {
        /// Index of the input carrying the signature
        index: usize,
        /// Public key the signature claims to be made by
        pk: PublicKey,
    },
}

impl std::error::Error for SignatureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SignatureError::Match(err) => Some(err),
            SignatureError::Sighash(err) => Some(err),
            _ => None,
        }
    }
}

/// Validates every partial signature present on PSBT input `index` against
/// the sighash it commits to, using legacy or SegWit v0 sighash rules as
/// dictated by the spent output and input scripts.
pub fn verify_input_signatures<C: Verification>(
    secp: &Secp256k1<C>,
    psbt: &Psbt,
    index: usize,
) -> Result<(), SignatureError> {
    let prevout = psbt.input_prevout(index)?.clone();
    let input = psbt
        .inputs
        .get(index)
        .ok_or(MatchError::WrongInputNo(index))?;
    let spk = &prevout.script_pubkey;
    let redeem_script = input.redeem_script.as_ref();
    let witness_script = input.witness_script.as_ref();

    let nested_wpkh = redeem_script.map(Script::is_v0_p2wpkh).unwrap_or(false);
    let nested_wsh = redeem_script.map(Script::is_v0_p2wsh).unwrap_or(false);
    let segwit_v0 = spk.is_v0_p2wpkh() || spk.is_v0_p2wsh() || nested_wpkh || nested_wsh;

    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    for (pk, sig) in &input.partial_sigs {
        let msg = if segwit_v0 {
            let script_code = if spk.is_v0_p2wpkh() || nested_wpkh {
                Script::new_p2pkh(&pk.pubkey_hash())
            } else {
                witness_script
                    .ok_or(SignatureError::NoWitnessScript(index))?
                    .clone()
            };
            let sighash =
                cache.segwit_signature_hash(index, &script_code, prevout.value, sig.hash_ty)?;
            Message::from_slice(&sighash[..]).expect("sighash is always 32 bytes")
        } else {
            let script_code = redeem_script.unwrap_or(spk);
            let sighash = cache.legacy_signature_hash(index, script_code, sig.hash_ty.to_u32())?;
            Message::from_slice(&sighash[..]).expect("sighash is always 32 bytes")
        };
        secp.verify_ecdsa(&msg, &sig.sig, &pk.inner)
            .map_err(|_| SignatureError::Invalid { index, pk: *pk })?;
    }
    Ok(())
}

/// Installs final scripts on a PSBT input and clears the fields BIP174
/// requires to be removed upon finalization.
pub fn install_final_scripts(
    input: &mut PsbtInput,
    script_sig: Option<Script>,
    witness: Option<Witness>,
) {
    input.final_script_sig = script_sig;
    input.final_script_witness = witness;
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
    input.sha256_preimages.clear();
    input.hash256_preimages.clear();
    input.ripemd160_preimages.clear();
    input.hash160_preimages.clear();
}

pub(crate) fn append_input(psbt: &mut Psbt, txin: TxIn, input: PsbtInput) -> usize {
    psbt.unsigned_tx.input.push(txin);
    psbt.inputs.push(input);
    psbt.inputs.len() - 1
}

pub(crate) fn append_output(psbt: &mut Psbt, txout: TxOut, output: PsbtOutput) -> usize {
    psbt.unsigned_tx.output.push(txout);
    psbt.outputs.push(output);
    psbt.outputs.len() - 1
}
