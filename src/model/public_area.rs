//! TPMT_PUBLIC: parsed public areas and the primary key template

use rsa::{BigUint, RsaPublicKey};

use crate::error::{CryptoError, FormatError, TpmTlsResult};
use crate::logic::marshal::{TpmReader, TpmWriter, Underflow};

pub(crate) const TPM_ALG_RSA: u16 = 0x0001;
pub(crate) const TPM_ALG_AES: u16 = 0x0006;
pub(crate) const TPM_ALG_KEYEDHASH: u16 = 0x0008;
pub(crate) const TPM_ALG_SHA256: u16 = 0x000B;
pub(crate) const TPM_ALG_NULL: u16 = 0x0010;
pub(crate) const TPM_ALG_ECC: u16 = 0x0023;
pub(crate) const TPM_ALG_CFB: u16 = 0x0043;
pub(crate) const TPM_ECC_NIST_P256: u16 = 0x0003;

const DEFAULT_RSA_EXPONENT: u32 = 65537;

/// Object attribute bits (TPMA_OBJECT)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObjectAttributes(u32);

impl ObjectAttributes {
    pub const FIXED_TPM: u32 = 1 << 1;
    pub const FIXED_PARENT: u32 = 1 << 4;
    pub const SENSITIVE_DATA_ORIGIN: u32 = 1 << 5;
    pub const USER_WITH_AUTH: u32 = 1 << 6;
    pub const NO_DA: u32 = 1 << 10;
    pub const RESTRICTED: u32 = 1 << 16;
    pub const DECRYPT: u32 = 1 << 17;
    pub const SIGN_ENCRYPT: u32 = 1 << 18;

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// Public part of a TPM object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicArea {
    Rsa(RsaPublicArea),
    Ecc(EccPublicArea),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RsaPublicArea {
    pub name_alg: u16,
    pub attributes: ObjectAttributes,
    pub key_bits: u16,
    /// Zero means the default exponent 65537
    pub exponent: u32,
    pub modulus: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EccPublicArea {
    pub name_alg: u16,
    pub attributes: ObjectAttributes,
    pub curve: u16,
    pub x: Vec<u8>,
    pub y: Vec<u8>,
}

impl PublicArea {
    /// Parse a TPMT_PUBLIC (without the TPM2B size prefix)
    pub fn parse(data: &[u8]) -> Result<Self, FormatError> {
        let mut reader = TpmReader::new(data);
        let area = Self::read(&mut reader).map_err(|e| FormatError::PublicArea {
            reason: e.to_string(),
        })??;
        if reader.remaining() != 0 {
            return Err(FormatError::PublicArea {
                reason: format!("{} trailing bytes", reader.remaining()),
            });
        }
        Ok(area)
    }

    fn read(reader: &mut TpmReader<'_>) -> Result<Result<Self, FormatError>, Underflow> {
        let key_type = reader.u16()?;
        let name_alg = reader.u16()?;
        let attributes = ObjectAttributes::from_bits(reader.u32()?);
        let _auth_policy = reader.tpm2b()?;

        match key_type {
            TPM_ALG_RSA => {
                skip_sym_def(reader)?;
                skip_scheme(reader)?;
                let key_bits = reader.u16()?;
                let exponent = reader.u32()?;
                let modulus = reader.tpm2b()?.to_vec();
                Ok(Ok(PublicArea::Rsa(RsaPublicArea {
                    name_alg,
                    attributes,
                    key_bits,
                    exponent,
                    modulus,
                })))
            }
            TPM_ALG_ECC => {
                skip_sym_def(reader)?;
                skip_scheme(reader)?;
                let curve = reader.u16()?;
                skip_scheme(reader)?; // kdf
                let x = reader.tpm2b()?.to_vec();
                let y = reader.tpm2b()?.to_vec();
                Ok(Ok(PublicArea::Ecc(EccPublicArea {
                    name_alg,
                    attributes,
                    curve,
                    x,
                    y,
                })))
            }
            other => Ok(Err(FormatError::PublicArea {
                reason: format!("unsupported object type 0x{other:04x}"),
            })),
        }
    }

    pub fn key_type_name(&self) -> &'static str {
        match self {
            PublicArea::Rsa(_) => "rsa",
            PublicArea::Ecc(_) => "ecc",
        }
    }

    /// Convert an RSA public area into an RSA public key
    pub fn to_rsa_public_key(&self) -> TpmTlsResult<RsaPublicKey> {
        let PublicArea::Rsa(rsa) = self else {
            return Err(CryptoError::UnsupportedKeyType {
                key_type: self.key_type_name().to_string(),
            }
            .into());
        };

        let exponent = match rsa.exponent {
            0 => DEFAULT_RSA_EXPONENT,
            e => e,
        };
        let n = BigUint::from_bytes_be(&rsa.modulus);
        Ok(RsaPublicKey::new(n, BigUint::from(exponent))?)
    }
}

/// TPMT_SYM_DEF_OBJECT: algorithm, then key bits and mode unless NULL
fn skip_sym_def(reader: &mut TpmReader<'_>) -> Result<(), Underflow> {
    let alg = reader.u16()?;
    if alg != TPM_ALG_NULL {
        reader.u16()?;
        reader.u16()?;
    }
    Ok(())
}

/// Scheme and KDF selectors: algorithm, then a hash algorithm unless NULL
fn skip_scheme(reader: &mut TpmReader<'_>) -> Result<(), Underflow> {
    let alg = reader.u16()?;
    if alg != TPM_ALG_NULL {
        reader.u16()?;
    }
    Ok(())
}

/// Template for the owner-hierarchy primary that container keys load under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryTemplate {
    pub attributes: ObjectAttributes,
    pub curve: u16,
    pub symmetric_bits: u16,
}

impl PrimaryTemplate {
    /// ECC P-256 storage key with an AES-128-CFB inner wrapper
    pub const fn ecc_p256_storage() -> Self {
        Self {
            attributes: ObjectAttributes::from_bits(
                ObjectAttributes::FIXED_TPM
                    | ObjectAttributes::FIXED_PARENT
                    | ObjectAttributes::SENSITIVE_DATA_ORIGIN
                    | ObjectAttributes::USER_WITH_AUTH
                    | ObjectAttributes::NO_DA
                    | ObjectAttributes::RESTRICTED
                    | ObjectAttributes::DECRYPT,
            ),
            curve: TPM_ECC_NIST_P256,
            symmetric_bits: 128,
        }
    }

    /// Whether `area` is a key created from this template
    pub fn matches(&self, area: &PublicArea) -> bool {
        matches!(
            area,
            PublicArea::Ecc(ecc)
                if ecc.name_alg == TPM_ALG_SHA256
                    && ecc.attributes == self.attributes
                    && ecc.curve == self.curve
        )
    }

    /// Marshal as TPMT_PUBLIC
    pub fn marshal(&self) -> Vec<u8> {
        TpmWriter::new()
            .u16(TPM_ALG_ECC)
            .u16(TPM_ALG_SHA256)
            .u32(self.attributes.bits())
            .tpm2b(&[]) // authPolicy
            .u16(TPM_ALG_AES)
            .u16(self.symmetric_bits)
            .u16(TPM_ALG_CFB)
            .u16(TPM_ALG_NULL) // scheme
            .u16(self.curve)
            .u16(TPM_ALG_NULL) // kdf
            .tpm2b(&[]) // unique.x
            .tpm2b(&[]) // unique.y
            .into_bytes()
    }
}

impl Default for PrimaryTemplate {
    fn default() -> Self {
        Self::ecc_p256_storage()
    }
}
