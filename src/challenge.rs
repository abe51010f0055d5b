// SPDX-FileCopyrightText: 2022-2026 Noah Fontes
//
// SPDX-License-Identifier: Apache-2.0

use num_bigint::BigUint;
use secrecy::{ExposeSecret, Secret};
use sha2::{Digest, Sha256};

use crate::{
    error::{self, Result},
    model::hash::Hash,
    rng,
};

pub(crate) trait State: private::Sealed {}

pub(crate) struct Init;
impl State for Init {}

pub(crate) struct Challenged {
    server_challenge: String,
    key: Secret<Hash>,
}
impl State for Challenged {}

pub(crate) struct Authenticated {
    server_response: Hash,
}
impl State for Authenticated {}

pub(crate) struct Challenge<S: State> {
    state: S,
}

fn digest(prefix: &str, key: &Hash, server_challenge: &str, client_challenge: &str) -> Hash {
    Sha256::new_with_prefix(prefix)
        .chain_update(String::from(key.clone()))
        .chain_update(server_challenge)
        .chain_update(client_challenge)
        .into()
}

impl Challenge<Init> {
    /// Generates the server-side nonce (32 random bytes, rendered as a
    /// lowercase decimal big integer, not hex) and binds it to the key on
    /// file for the reconnecting client.
    pub(crate) fn new(key: Secret<Hash>) -> Challenge<Challenged> {
        let server_challenge = BigUint::from_bytes_be(&rng::bytes::<32>()).to_str_radix(10);

        Challenge {
            state: Challenged {
                server_challenge,
                key,
            },
        }
    }
}

impl Challenge<Challenged> {
    pub(crate) fn server_challenge(&self) -> &str {
        &self.state.server_challenge
    }

    pub(crate) fn authenticate(
        self,
        client_challenge: &str,
        client_response: &Hash,
    ) -> Result<Challenge<Authenticated>> {
        let expected = digest(
            "1",
            self.state.key.expose_secret(),
            &self.state.server_challenge,
            client_challenge,
        );
        if &expected != client_response {
            return Err(error::ChallengeResponse::ClientResponseMismatch.into());
        }

        let server_response = digest(
            "0",
            self.state.key.expose_secret(),
            &self.state.server_challenge,
            client_challenge,
        );

        Ok(Challenge {
            state: Authenticated { server_response },
        })
    }
}

impl Challenge<Authenticated> {
    pub(crate) const fn server_response(&self) -> &Hash {
        &self.state.server_response
    }
}

mod private {
    pub(crate) trait Sealed {}
    impl Sealed for super::Init {}
    impl Sealed for super::Challenged {}
    impl Sealed for super::Authenticated {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> Secret<Hash> {
        Secret::new(Sha256::new_with_prefix(b"longtermkey").into())
    }

    #[test]
    fn accepts_matching_response_and_produces_server_proof() {
        let challenge = Challenge::<Init>::new(key());
        let sc = challenge.server_challenge().to_owned();
        let cc = "client-nonce";

        let expected_cr = digest("1", key().expose_secret(), &sc, cc);
        let authenticated = challenge.authenticate(cc, &expected_cr).unwrap();

        let expected_sr = digest("0", key().expose_secret(), &sc, cc);
        assert_eq!(authenticated.server_response(), &expected_sr);
    }

    #[test]
    fn rejects_mismatched_response() {
        let challenge = Challenge::<Init>::new(key());
        let cc = "client-nonce";
        let wrong = Hash::default();
        assert!(challenge.authenticate(cc, &wrong).is_err());
    }
}
