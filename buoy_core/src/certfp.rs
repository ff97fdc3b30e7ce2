//! Self-signed certificate generation for SASL EXTERNAL (CertFP).

use rsa::pkcs8::EncodePrivateKey;

use crate::{Error, Result};

/// The maximum number of RSA key bits accepted when generating a new
/// private key
pub const MAX_RSA_BITS: u32 = 8192;

/// Generated CertFP material, both parts in DER form
pub struct CertFp {
    /// PKCS#8 private key
    pub priv_key: Vec<u8>,
    /// X.509 certificate
    pub cert: Vec<u8>,
}

/// Generate a private key and matching self-signed certificate.
///
/// `bits` is only meaningful for RSA keys.
pub fn generate(key_type: &str, bits: u32) -> Result<CertFp> {
    let (alg, key_pair) = match key_type {
        "rsa" => {
            let mut rng = rand::thread_rng();
            let key = rsa::RsaPrivateKey::new(&mut rng, bits as usize)
                .map_err(|e| Error::Parse(format!("failed to generate RSA key: {e}")))?;
            let der = key
                .to_pkcs8_der()
                .map_err(|e| Error::Parse(format!("failed to encode RSA key: {e}")))?;
            let key_pair = rcgen::KeyPair::from_der(der.as_bytes())
                .map_err(|e| Error::Parse(format!("failed to load RSA key: {e}")))?;
            (&rcgen::PKCS_RSA_SHA256, key_pair)
        }
        "ecdsa" => {
            let key_pair = rcgen::KeyPair::generate(&rcgen::PKCS_ECDSA_P256_SHA256)
                .map_err(|e| Error::Parse(format!("failed to generate ECDSA key: {e}")))?;
            (&rcgen::PKCS_ECDSA_P256_SHA256, key_pair)
        }
        "ed25519" => {
            let key_pair = rcgen::KeyPair::generate(&rcgen::PKCS_ED25519)
                .map_err(|e| Error::Parse(format!("failed to generate Ed25519 key: {e}")))?;
            (&rcgen::PKCS_ED25519, key_pair)
        }
        _ => {
            return Err(Error::Parse(format!(
                "unknown key type {key_type:?} (supported: rsa, ecdsa, ed25519)"
            )))
        }
    };

    let mut params = rcgen::CertificateParams::default();
    params.alg = alg;
    params.key_pair = Some(key_pair);
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::CommonName, "buoy");
    params.distinguished_name = dn;

    let cert = rcgen::Certificate::from_params(params)
        .map_err(|e| Error::Parse(format!("failed to generate certificate: {e}")))?;

    Ok(CertFp {
        priv_key: cert.serialize_private_key_der(),
        cert: cert
            .serialize_der()
            .map_err(|e| Error::Parse(format!("failed to serialize certificate: {e}")))?,
    })
}

pub fn hex_digest(digest: &[u8]) -> String {
    use std::fmt::Write;

    digest.iter().fold(String::new(), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ed25519() {
        let certfp = generate("ed25519", 0).unwrap();
        assert!(!certfp.priv_key.is_empty());
        assert!(!certfp.cert.is_empty());
    }

    #[test]
    fn ecdsa() {
        let certfp = generate("ecdsa", 0).unwrap();
        assert!(!certfp.cert.is_empty());
    }

    #[test]
    fn unknown_key_type() {
        assert!(generate("dsa", 0).is_err());
    }

    #[test]
    fn hex() {
        assert_eq!(hex_digest(&[0x00, 0xff, 0x0a]), "00ff0a");
    }
}
