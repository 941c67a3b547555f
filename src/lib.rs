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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code
)]

//! Library for parsing, validating and operationalizing bitcoin output
//! descriptors, including descriptors whose locking conditions are
//! expressed in miniscript.
//!
//! The workflow mirrors the lifecycle of an output:
//! ```text
//! descriptor string -> Expansion -> Output -> PSBT input -> satisfaction
//! ```
//!
//! [`expand`] validates the checksum, substitutes the wildcard index and
//! splits a descriptor into its shape (expression with `@i` placeholders)
//! and key material (the [`ExpansionMap`]), deriving the locking script and
//! address. [`Output`] binds an expansion to a concrete instance (network,
//! index, preimages and signer set) and drives PSBT input construction and
//! finalization through a miniscript satisfier constrained to the temporal
//! requirements of the selected spending path.
//!
//! The secp256k1 context is injected explicitly into every entry point; the
//! crate keeps no global state.

#[macro_use]
extern crate amplify;
#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_crate as serde;

pub mod checksum;
pub mod descriptor;
pub mod expression;
pub mod keys;
mod output;
pub mod psbt;
pub mod satisfy;

pub use checksum::{checksum, verify_checksum, ChecksumError};
pub use descriptor::{
    expand, CompositeType, Error, ExpandParams, Expansion, Payment, SpkClass, MAX_OPS_PER_SCRIPT,
    MAX_REDEEM_SCRIPT_SIZE, MAX_WITNESS_SCRIPT_SIZE,
};
pub use expression::{expand_miniscript, ExpansionMap};
pub use keys::{
    parse_key_expression, InnerKey, KeyExpressionError, KeyInfo, SingleKey, Wildcard, Xkey,
};
pub use output::{
    FinalizeError, InputFinalizer, Output, OutputError, OutputParams, Preimage, PsbtInputParams,
};
pub use psbt::{InputPrevout, MatchError, Psbt, SignatureError};
pub use satisfy::{PreimageStore, TimeConstraints};

/// Legacy name of [`Output`]. Construction through the deprecated
/// `expression` field of [`OutputParams`] is supported for backwards
/// compatibility; new code should use `descriptor`.
pub type Descriptor = Output;

// Re-exports binding downstream code to the same bitcoin & secp256k1 stack
// this crate is built against.
pub use bitcoin::secp256k1::{self, Secp256k1};
pub use bitcoin::util::bip32::{ExtendedPrivKey, ExtendedPubKey};
pub use bitcoin::{Network, PrivateKey, PublicKey};
