// src/tls/hybrid.rs - X25519 + Kyber768 compound key exchange group
//
// Implements the draft hybrid layout: the client share is the X25519 public
// key followed by the Kyber768 encapsulation key; the server share is the
// X25519 public key followed by the Kyber768 ciphertext; the handshake
// secret fed into the TLS 1.3 key schedule is the X25519 shared secret
// followed by the Kyber768 shared secret. Security holds if either
// component is unbroken.

use kemgate_crypto::kem::{self, KemAlgorithm};
use kemgate_crypto::KemKeyPair;
use rustls::crypto::{ActiveKeyExchange, CompletedKeyExchange, SharedSecret, SupportedKxGroup};
use rustls::ffdhe_groups::FfdheGroup;
use rustls::{Error, NamedGroup, PeerMisbehaved, ProtocolVersion};
use x25519_dalek::{EphemeralSecret, PublicKey};

/// The compound group, usable in a rustls `CryptoProvider`.
pub static X25519_KYBER768: &dyn SupportedKxGroup = &X25519Kyber768;

/// Code point from draft-tls-westerbaan-xyber768d00.
const NAMED_GROUP: NamedGroup = NamedGroup::Unknown(0x6399);

const INVALID_KEY_SHARE: Error = Error::PeerMisbehaved(PeerMisbehaved::InvalidKeyShare);

const X25519_LEN: usize = 32;
const KYBER768_PUBKEY_LEN: usize = 1184;
const KYBER768_CIPHERTEXT_LEN: usize = 1088;
const KYBER768_SECRET_LEN: usize = 32;
const CLIENT_SHARE_LEN: usize = X25519_LEN + KYBER768_PUBKEY_LEN;
const SERVER_SHARE_LEN: usize = X25519_LEN + KYBER768_CIPHERTEXT_LEN;
const COMBINED_SECRET_LEN: usize = X25519_LEN + KYBER768_SECRET_LEN;

#[derive(Debug)]
pub struct X25519Kyber768;

impl SupportedKxGroup for X25519Kyber768 {
    fn name(&self) -> NamedGroup {
        NAMED_GROUP
    }

    fn usable_for_version(&self, version: ProtocolVersion) -> bool {
        version == ProtocolVersion::TLSv1_3
    }

    fn ffdhe_group(&self) -> Option<FfdheGroup<'static>> {
        None
    }

    fn start(&self) -> Result<Box<dyn ActiveKeyExchange>, Error> {
        let x_secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let x_public = PublicKey::from(&x_secret);

        let kyber = kem::generate_keypair(KemAlgorithm::Kyber768)
            .map_err(|e| Error::General(format!("Kyber768 keygen failed: {e}")))?;

        let mut combined_pub_key = Vec::with_capacity(CLIENT_SHARE_LEN);
        combined_pub_key.extend_from_slice(x_public.as_bytes());
        combined_pub_key.extend_from_slice(kyber.public_key_bytes());

        Ok(Box::new(Active {
            x_secret,
            kyber,
            combined_pub_key,
        }))
    }

    fn start_and_complete(&self, client_share: &[u8]) -> Result<CompletedKeyExchange, Error> {
        if client_share.len() != CLIENT_SHARE_LEN {
            return Err(INVALID_KEY_SHARE);
        }
        let (x_peer, kyber_pub) = client_share.split_at(X25519_LEN);

        let x_secret = EphemeralSecret::random_from_rng(rand::thread_rng());
        let x_public = PublicKey::from(&x_secret);
        let x_peer: [u8; X25519_LEN] = x_peer.try_into().expect("length checked above");
        let x_shared = x_secret.diffie_hellman(&PublicKey::from(x_peer));

        let (ciphertext, kyber_shared) = kem::encapsulate(KemAlgorithm::Kyber768, kyber_pub)
            .map_err(|_| INVALID_KEY_SHARE)?;

        let mut pub_key = Vec::with_capacity(SERVER_SHARE_LEN);
        pub_key.extend_from_slice(x_public.as_bytes());
        pub_key.extend_from_slice(&ciphertext);

        let mut secret = [0u8; COMBINED_SECRET_LEN];
        secret[..X25519_LEN].copy_from_slice(x_shared.as_bytes());
        secret[X25519_LEN..].copy_from_slice(&kyber_shared);

        Ok(CompletedKeyExchange {
            group: NAMED_GROUP,
            pub_key,
            secret: SharedSecret::from(&secret[..]),
        })
    }
}

struct Active {
    x_secret: EphemeralSecret,
    kyber: KemKeyPair,
    combined_pub_key: Vec<u8>,
}

impl ActiveKeyExchange for Active {
    fn complete(self: Box<Self>, peer_pub_key: &[u8]) -> Result<SharedSecret, Error> {
        if peer_pub_key.len() != SERVER_SHARE_LEN {
            return Err(INVALID_KEY_SHARE);
        }
        let (x_peer, ciphertext) = peer_pub_key.split_at(X25519_LEN);

        let this = *self;
        let x_peer: [u8; X25519_LEN] = x_peer.try_into().expect("length checked above");
        let x_shared = this.x_secret.diffie_hellman(&PublicKey::from(x_peer));

        let kyber_shared = kem::decapsulate(
            KemAlgorithm::Kyber768,
            ciphertext,
            this.kyber.secret_key_bytes(),
        )
        .map_err(|_| INVALID_KEY_SHARE)?;

        let mut secret = [0u8; COMBINED_SECRET_LEN];
        secret[..X25519_LEN].copy_from_slice(x_shared.as_bytes());
        secret[X25519_LEN..].copy_from_slice(&kyber_shared);

        Ok(SharedSecret::from(&secret[..]))
    }

    fn pub_key(&self) -> &[u8] {
        &self.combined_pub_key
    }

    fn ffdhe_group(&self) -> Option<FfdheGroup<'static>> {
        None
    }

    fn group(&self) -> NamedGroup {
        NAMED_GROUP
    }
}
