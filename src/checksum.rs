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

//! Descriptor checksum, the 8-character code appended to a descriptor after
//! the `#` separator. The scheme is the one used by bitcoin core
//! `descriptor.cpp` (standardized as part of BIP-380).

/// All characters which may be used within a descriptor body. The character
/// position defines both the 5-bit symbol and the symbol group fed into the
/// checksum polynomial.
pub const INPUT_CHARSET: &str = "0123456789()[],'/*abcdefgh@:$%{}IJKLMNOPQRSTUVWXYZ&+-.;<=>?!^_|~ijklmnopqrstuvwxyzABCDEFGH`#\"\\ ";

/// Alphabet in which the checksum itself is expressed (same as bech32).
pub const CHECKSUM_CHARSET: &str = "qpzry9x8gf2tvdw0s3jn54khce6mua7l";

const GENERATOR: [u64; 5] = [
    0xf5dee51989,
    0xa9fdca3312,
    0x1bab10e32d,
    0x3706b1677a,
    0x644d626ffd,
];

/// Errors computing or verifying descriptor checksums
#[derive(Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ChecksumError {
    /// character '{0}' may not be a part of a descriptor
    InvalidCharacter(char),

    /// descriptor checksum must be 8 characters, while {0} characters were
    /// provided
    InvalidChecksumLength(usize),

    /// character '{0}' may not appear in a descriptor checksum
    InvalidChecksumCharacter(char),

    /// descriptor checksum '{actual}' does not match the expected
    /// '{expected}'
    Mismatch {
        /// Checksum provided with the descriptor
        actual: String,
        /// Checksum matching the descriptor body
        expected: String,
    },
}

fn polymod(symbols: impl IntoIterator<Item = u64>) -> u64 {
    let mut chk = 1u64;
    for value in symbols {
        let top = chk >> 35;
        chk = ((chk & 0x7ffffffff) << 5) ^ value;
        for (bit, coef) in GENERATOR.iter().enumerate() {
            if (top >> bit) & 1 != 0 {
                chk ^= coef;
            }
        }
    }
    chk
}

// Maps the descriptor body onto checksum symbols: one 5-bit symbol per
// character plus one extra symbol per each group of 3 characters encoding
// their charset group numbers.
fn expand(body: &str) -> Result<Vec<u64>, ChecksumError> {
    let mut symbols = Vec::with_capacity(body.len() + body.len() / 3 + 1);
    let mut groups = Vec::with_capacity(3);
    for ch in body.chars() {
        let pos = INPUT_CHARSET
            .find(ch)
            .ok_or(ChecksumError::InvalidCharacter(ch))? as u64;
        symbols.push(pos & 31);
        groups.push(pos >> 5);
        if groups.len() == 3 {
            symbols.push(groups[0] * 9 + groups[1] * 3 + groups[2]);
            groups.clear();
        }
    }
    match groups.len() {
        1 => symbols.push(groups[0]),
        2 => symbols.push(groups[0] * 3 + groups[1]),
        _ => {}
    }
    Ok(symbols)
}

/// Computes the checksum for a descriptor body (the descriptor string
/// without the `#` separator and everything after it).
pub fn checksum(body: &str) -> Result<String, ChecksumError> {
    let mut symbols = expand(body)?;
    symbols.extend([0u64; 8]);
    let chk = polymod(symbols) ^ 1;
    let charset = CHECKSUM_CHARSET.as_bytes();
    let mut checksum = String::with_capacity(8);
    for pos in 0..8 {
        checksum.push(charset[(chk >> (5 * (7 - pos)) & 31) as usize] as char);
    }
    Ok(checksum)
}

/// Verifies that `checksum` matches the descriptor `body`.
///
/// The body must be exactly the part of the descriptor preceding the `#`
/// separator; the checksum must be exactly the 8 characters following it.
pub fn verify_checksum(body: &str, checksum: &str) -> Result<(), ChecksumError> {
    if checksum.chars().count() != 8 {
        return Err(ChecksumError::InvalidChecksumLength(
            checksum.chars().count(),
        ));
    }
    let mut symbols = expand(body)?;
    for ch in checksum.chars() {
        let pos = CHECKSUM_CHARSET
            .find(ch)
            .ok_or(ChecksumError::InvalidChecksumCharacter(ch))?;
        symbols.push(pos as u64);
    }
    if polymod(symbols) != 1 {
        return Err(ChecksumError::Mismatch {
            actual: checksum.to_owned(),
            expected: self::checksum(body)?,
        });
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bip380_vector() {
        assert_eq!(checksum("raw(deadbeef)").unwrap(), "89f8spxm");
        verify_checksum("raw(deadbeef)", "89f8spxm").unwrap();
    }

    #[test]
    fn checksum_is_fixed_point() {
        for body in [
            "pk(0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798)",
            "pkh(02c6047f9441ed7d6d3045406e95c07cd85c778e4b8cef3ca7abac09b95c709ee5)",
            "wsh(and_v(v:pk(@0),older(144)))",
            "sh(wpkh([d34db33f/49'/0'/0']xpub661MyMwAqRbcFtXgS5sYJABqqG9YLmC4Q1Rdap9gSE8NqtwybGhePY2gZ29ESFjqJoCu1Rupje8YtGqsefD265TMg7usUDFdp6W1EGMcet8/0/*))",
        ] {
            let checksum = checksum(body).unwrap();
            assert_eq!(checksum.len(), 8);
            verify_checksum(body, &checksum).unwrap();
        }
    }

    #[test]
    fn mutated_checksum_fails() {
        let body = "raw(deadbeef)";
        let valid = checksum(body).unwrap();
        for pos in 0..8 {
            let mut mutated: Vec<char> = valid.chars().collect();
            mutated[pos] = if mutated[pos] == 'q' { 'p' } else { 'q' };
            let mutated: String = mutated.into_iter().collect();
            if mutated == valid {
                continue;
            }
            assert!(matches!(
                verify_checksum(body, &mutated),
                Err(ChecksumError::Mismatch { .. })
            ));
        }
    }

    #[test]
    fn wrong_checksum_fails() {
        assert!(matches!(
            verify_checksum("raw(deadbeef)", "00000000"),
            Err(ChecksumError::Mismatch { .. })
        ));
    }

    #[test]
    fn invalid_lengths_and_characters() {
        assert_eq!(
            verify_checksum("raw(deadbeef)", "89f8spx"),
            Err(ChecksumError::InvalidChecksumLength(7))
        );
        assert_eq!(
            verify_checksum("raw(deadbeef)", "89f8spxb"),
            Err(ChecksumError::InvalidChecksumCharacter('b'))
        );
        assert_eq!(
            checksum("raw(dead\nbeef)"),
            Err(ChecksumError::InvalidCharacter('\n'))
        );
    }
}
