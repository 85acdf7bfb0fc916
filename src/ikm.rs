//! Web Push key agreement (RFC 8291 section 3.4).
//!
//! The application server generates an ephemeral P-256 key pair per
//! derivation, agrees on a secret with the browser's `p256dh` key and expands
//! it with HKDF-SHA256, salted with the browser's `auth` secret. The
//! ephemeral public key becomes the RFC 8188 key id.

use async_trait::async_trait;
use hkdf::Hkdf;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use rand::rngs::OsRng;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::model::{KeyMaterial, IKM_LEN};

const WEB_PUSH_INFO: &[u8] = b"WebPush: info\0";

fn expand_ikm(
    ecdh_secret: &[u8],
    auth_secret: &[u8],
    ua_public: &[u8],
    as_public: &[u8],
) -> Result<[u8; IKM_LEN]> {
    let info = [WEB_PUSH_INFO, ua_public, as_public].concat();
    let hk = Hkdf::<Sha256>::new(Some(auth_secret), ecdh_secret);

    let mut ikm = [0u8; IKM_LEN];
    hk.expand(&info, &mut ikm)
        .map_err(|_| Error::KeyDerivation)?;

    Ok(ikm)
}

/// Derives fresh key material for a browser key. The ephemeral private key
/// is dropped before returning.
pub fn derive_ikm(ua_public: &[u8], auth_secret: &[u8]) -> Result<KeyMaterial> {
    let ua_key = PublicKey::from_sec1_bytes(ua_public).map_err(|_| Error::InvalidPublicKey)?;

    let secret = EphemeralSecret::random(&mut OsRng);
    let as_public = secret.public_key().to_encoded_point(false);
    let shared = secret.diffie_hellman(&ua_key);

    let ikm = expand_ikm(
        &shared.raw_secret_bytes()[..],
        auth_secret,
        ua_public,
        as_public.as_bytes(),
    )?;

    Ok(KeyMaterial::new(as_public.as_bytes().to_vec(), ikm))
}

/// The browser's side of [`derive_ikm`]: recomputes the IKM from the
/// subscription's private key and the key id found in a message header.
pub fn receiver_ikm(
    ua_secret: &SecretKey,
    auth_secret: &[u8],
    as_public: &[u8],
) -> Result<[u8; IKM_LEN]> {
    let as_key = PublicKey::from_sec1_bytes(as_public).map_err(|_| Error::InvalidPublicKey)?;
    let ua_public = ua_secret.public_key().to_encoded_point(false);
    let shared = p256::ecdh::diffie_hellman(ua_secret.to_nonzero_scalar(), as_key.as_affine());

    expand_ikm(
        &shared.raw_secret_bytes()[..],
        auth_secret,
        ua_public.as_bytes(),
        as_public,
    )
}

/// Source of key material for the registry.
#[async_trait]
pub trait KeyDeriver: Send + Sync {
    async fn derive(&self, ua_public: &[u8], auth_secret: &[u8]) -> Result<KeyMaterial>;
}

/// Ephemeral ECDH per RFC 8291.
#[derive(Debug, Default, Clone, Copy)]
pub struct EphemeralEcdh;

#[async_trait]
impl KeyDeriver for EphemeralEcdh {
    async fn derive(&self, ua_public: &[u8], auth_secret: &[u8]) -> Result<KeyMaterial> {
        derive_ikm(ua_public, auth_secret)
    }
}

#[cfg(test)]
mod tests {
    use base64::Engine;

    use super::*;
    use crate::ece;
    use crate::model::BASE64_URL;

    // Worked example from RFC 8291 section 5.
    const AS_PUBLIC: &str =
        "BP4z9KsN6nGRTbVYI_c7VJSPQTBtkgcy27mlmlMoZIIgDll6e3vCYLocInmYWAmS6TlzAC8wEqKK6PBru3jl7A8";
    const AS_PRIVATE: &str = "yfWPiYE-n46HLnH0KqZOF1fJJU3MYrct3AELtAQ-oRw";
    const UA_PUBLIC: &str =
        "BCVxsr7N_eNgVRqvHtD0zTZsEc6-VV-JvLexhqUzORcxaOzi6-AYWXvTBHm4bjyPjs7Vd8pZGH6SRpkNtoIAiw4";
    const UA_PRIVATE: &str = "q1dXpw3UpT5VOmu_cf_v6ih07Aems3njxI-JWgLcM94";
    const AUTH_SECRET: &str = "BTBZMqHH6r4Tts7J_aSIgg";
    const SALT: &str = "DGv6ra1nlYgDCS1FRnbzlw";
    const ECDH_SECRET: &str = "kyrL1jIIOHEzg3sM2ZWRHDRB62YACZhhSlknJ672kSs";
    const IKM: &str = "S4lYMb_L0FxCeq0WhDx813KgSYqU26kOyzWUdsXYyrg";
    const PLAINTEXT: &[u8] = b"When I grow up, I want to be a watermelon";
    const MESSAGE: &str = "DGv6ra1nlYgDCS1FRnbzlwAAEABBBP4z9KsN6nGRTbVYI_c7VJSPQTBtkgcy27mlmlMoZIIgDll6e3vCYLocInmYWAmS6TlzAC8wEqKK6PBru3jl7A_yl95bQpu6cVPTpK4Mqgkf1CXztLVBSt2Ks3oZwbuwXPXLWyouBWLVWGNWQexSgSxsj_Qulcy4a-fN";

    fn b64(value: &str) -> Vec<u8> {
        BASE64_URL.decode(value).unwrap()
    }

    fn browser_keys() -> (SecretKey, Vec<u8>, [u8; 16]) {
        let secret = SecretKey::random(&mut OsRng);
        let public = secret.public_key().to_encoded_point(false).as_bytes().to_vec();
        (secret, public, [0x5au8; 16])
    }

    #[test]
    fn both_sides_agree_on_ikm() {
        let (ua_secret, ua_public, auth) = browser_keys();

        let material = derive_ikm(&ua_public, &auth).unwrap();
        let ikm = receiver_ikm(&ua_secret, &auth, material.key_id()).unwrap();

        assert_eq!(&ikm, material.ikm());
    }

    #[test]
    fn key_id_is_uncompressed_ephemeral_point() {
        let (_, ua_public, auth) = browser_keys();
        let material = derive_ikm(&ua_public, &auth).unwrap();

        assert_eq!(material.key_id().len(), 65);
        assert_eq!(material.key_id()[0], 0x04);
        assert!(PublicKey::from_sec1_bytes(material.key_id()).is_ok());
    }

    #[test]
    fn each_call_uses_a_new_ephemeral_key() {
        let (_, ua_public, auth) = browser_keys();
        let first = derive_ikm(&ua_public, &auth).unwrap();
        let second = derive_ikm(&ua_public, &auth).unwrap();

        assert_ne!(first.key_id(), second.key_id());
        assert_ne!(first.ikm(), second.ikm());
    }

    #[test]
    fn wrong_auth_secret_disagrees() {
        let (ua_secret, ua_public, auth) = browser_keys();
        let material = derive_ikm(&ua_public, &auth).unwrap();
        let ikm = receiver_ikm(&ua_secret, &[0u8; 16], material.key_id()).unwrap();

        assert_ne!(&ikm, material.ikm());
    }

    #[test]
    fn rejects_point_off_curve() {
        let mut bogus = vec![0x04];
        bogus.extend_from_slice(&[0x01; 64]);

        assert!(matches!(
            derive_ikm(&bogus, &[0u8; 16]),
            Err(Error::InvalidPublicKey)
        ));
    }

    #[tokio::test]
    async fn deriver_trait_delegates() {
        let (ua_secret, ua_public, auth) = browser_keys();
        let material = EphemeralEcdh.derive(&ua_public, &auth).await.unwrap();

        assert_eq!(
            &receiver_ikm(&ua_secret, &auth, material.key_id()).unwrap(),
            material.ikm()
        );
    }

    #[test]
    fn application_server_secret_matches_rfc_example() {
        let as_secret = SecretKey::from_slice(&b64(AS_PRIVATE)).unwrap();
        let ua_key = PublicKey::from_sec1_bytes(&b64(UA_PUBLIC)).unwrap();

        assert_eq!(
            as_secret.public_key().to_encoded_point(false).as_bytes(),
            &b64(AS_PUBLIC)[..]
        );
        let shared = p256::ecdh::diffie_hellman(as_secret.to_nonzero_scalar(), ua_key.as_affine());
        assert_eq!(&shared.raw_secret_bytes()[..], &b64(ECDH_SECRET)[..]);
    }

    #[test]
    fn ikm_matches_rfc_example() {
        let ikm = expand_ikm(
            &b64(ECDH_SECRET),
            &b64(AUTH_SECRET),
            &b64(UA_PUBLIC),
            &b64(AS_PUBLIC),
        )
        .unwrap();
        assert_eq!(&ikm[..], &b64(IKM)[..]);

        let ua_secret = SecretKey::from_slice(&b64(UA_PRIVATE)).unwrap();
        let received = receiver_ikm(&ua_secret, &b64(AUTH_SECRET), &b64(AS_PUBLIC)).unwrap();
        assert_eq!(received, ikm);
    }

    #[test]
    fn encrypted_message_matches_rfc_example() {
        let salt: [u8; ece::SALT_LEN] = b64(SALT).try_into().unwrap();

        let body = ece::encode(PLAINTEXT, &b64(AS_PUBLIC), &b64(IKM), &salt, 4096).unwrap();
        assert_eq!(BASE64_URL.encode(&body), MESSAGE);

        let ua_secret = SecretKey::from_slice(&b64(UA_PRIVATE)).unwrap();
        let (header, _) = ece::parse_header(&body).unwrap();
        let ikm = receiver_ikm(&ua_secret, &b64(AUTH_SECRET), header.key_id).unwrap();
        assert_eq!(ece::decode(&body, &ikm).unwrap(), PLAINTEXT);
    }
}
