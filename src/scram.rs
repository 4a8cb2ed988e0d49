//! Server-side SASL: SCRAM-SHA-1 / SCRAM-SHA-256 (RFC 5802) and PLAIN.
//! The conversation is pure; credential lookup happens between the two
//! SCRAM legs and is the caller's business.

use crate::error::{Error, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

const SERVER_NONCE_LEN: usize = 24;
pub const DEFAULT_ITERATIONS: u32 = 15000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mechanism {
    ScramSha1,
    ScramSha256,
    Plain,
}

impl Mechanism {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SCRAM-SHA-1" => Some(Mechanism::ScramSha1),
            "SCRAM-SHA-256" => Some(Mechanism::ScramSha256),
            "PLAIN" => Some(Mechanism::Plain),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Mechanism::ScramSha1 => "SCRAM-SHA-1",
            Mechanism::ScramSha256 => "SCRAM-SHA-256",
            Mechanism::Plain => "PLAIN",
        }
    }

    fn key_len(self) -> usize {
        match self {
            Mechanism::ScramSha1 => 20,
            _ => 32,
        }
    }
}

pub const SUPPORTED_MECHANISMS: [&str; 3] = ["SCRAM-SHA-256", "SCRAM-SHA-1", "PLAIN"];

/// Stored verifier for one (user, mechanism) pair, as served by the backend
/// user catalog.
#[derive(Debug, Clone)]
pub struct ScramCredential {
    pub iterations: u32,
    pub salt: Vec<u8>,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramCredential {
    /// Derive a verifier from a plaintext password. SCRAM-SHA-1 hashes the
    /// password MongoDB-style (md5 of "user:mongo:password") first;
    /// SCRAM-SHA-256 runs SASLprep instead.
    pub fn derive(
        mechanism: Mechanism,
        username: &str,
        password: &str,
        salt: &[u8],
        iterations: u32,
    ) -> Result<Self> {
        let prepared = prepare_password(mechanism, username, password)?;
        let salted = hi(mechanism, prepared.as_bytes(), salt, iterations);
        let client_key = hmac(mechanism, &salted, b"Client Key");
        let stored_key = h(mechanism, &client_key);
        let server_key = hmac(mechanism, &salted, b"Server Key");
        Ok(Self {
            iterations,
            salt: salt.to_vec(),
            stored_key,
            server_key,
        })
    }

    /// Parse the credential subdocument stored in the user catalog:
    /// `{iterationCount, salt, storedKey, serverKey}` with base64 strings.
    pub fn from_document(doc: &bson::Document) -> Result<Self> {
        let iterations = doc
            .get_i32("iterationCount")
            .map_err(|_| Error::Msg("credential missing iterationCount".into()))?;
        let decode = |field: &str| -> Result<Vec<u8>> {
            let s = doc
                .get_str(field)
                .map_err(|_| Error::Msg(format!("credential missing {field}")))?;
            BASE64
                .decode(s)
                .map_err(|e| Error::Msg(format!("credential {field} not base64: {e}")))
        };
        Ok(Self {
            iterations: iterations as u32,
            salt: decode("salt")?,
            stored_key: decode("storedKey")?,
            server_key: decode("serverKey")?,
        })
    }
}

/// Parsed client-first-message.
#[derive(Debug, Clone)]
pub struct ClientFirst {
    pub username: String,
    pub nonce: String,
    gs2_header: String,
    bare: String,
}

/// Parse `n,,n=user,r=nonce` (channel binding rejected).
pub fn parse_client_first(payload: &[u8]) -> Result<ClientFirst> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::Msg("client-first not UTF-8".into()))?;

    let (gs2_header, bare) = if let Some(rest) = text.strip_prefix("n,,") {
        ("n,,", rest)
    } else if let Some(rest) = text.strip_prefix("y,,") {
        ("y,,", rest)
    } else if text.starts_with("p=") {
        return Err(Error::Msg("channel binding not supported".into()));
    } else {
        return Err(Error::Msg("malformed gs2 header".into()));
    };

    let mut username = None;
    let mut nonce = None;
    for part in bare.split(',') {
        if let Some(u) = part.strip_prefix("n=") {
            username = Some(u.replace("=2C", ",").replace("=3D", "="));
        } else if let Some(r) = part.strip_prefix("r=") {
            nonce = Some(r.to_string());
        }
    }
    let username = username.ok_or_else(|| Error::Msg("client-first missing n=".into()))?;
    let nonce = nonce.ok_or_else(|| Error::Msg("client-first missing r=".into()))?;
    if username.is_empty() || nonce.is_empty() {
        return Err(Error::Msg("empty username or nonce".into()));
    }
    Ok(ClientFirst {
        username,
        nonce,
        gs2_header: gs2_header.to_string(),
        bare: bare.to_string(),
    })
}

/// An in-flight SCRAM exchange, created once the caller has looked up the
/// user's credential.
#[derive(Debug)]
pub struct ScramConversation {
    mechanism: Mechanism,
    credential: ScramCredential,
    gs2_header: String,
    server_nonce: String,
    client_first_bare: String,
    server_first: String,
}

impl ScramConversation {
    /// Build the server-first-message.
    pub fn start(
        mechanism: Mechanism,
        client_first: &ClientFirst,
        credential: ScramCredential,
    ) -> (Self, String) {
        let server_nonce = format!("{}{}", client_first.nonce, generate_nonce());
        let server_first = format!(
            "r={},s={},i={}",
            server_nonce,
            BASE64.encode(&credential.salt),
            credential.iterations
        );
        (
            Self {
                mechanism,
                credential,
                gs2_header: client_first.gs2_header.clone(),
                server_nonce,
                client_first_bare: client_first.bare.clone(),
                server_first: server_first.clone(),
            },
            server_first,
        )
    }

    /// The verifier's stored key; keys the identity pool after a successful
    /// exchange without retaining anything password-derived beyond it.
    pub fn stored_key(&self) -> &[u8] {
        &self.credential.stored_key
    }

    /// Verify the client-final-message; on success returns the
    /// server-final-message (`v=...`).
    pub fn finish(&self, client_final: &[u8]) -> Result<String> {
        let text = std::str::from_utf8(client_final)
            .map_err(|_| Error::Msg("client-final not UTF-8".into()))?;

        let mut channel = None;
        let mut nonce = None;
        let mut proof = None;
        let mut without_proof_len = text.len();
        for part in text.split(',') {
            if let Some(c) = part.strip_prefix("c=") {
                channel = Some(c);
            } else if let Some(r) = part.strip_prefix("r=") {
                nonce = Some(r);
            } else if let Some(p) = part.strip_prefix("p=") {
                proof = Some(p);
                // everything before ",p=" is the signed portion
                without_proof_len = text.len() - part.len() - 1;
            }
        }
        let channel = channel.ok_or_else(|| Error::Msg("client-final missing c=".into()))?;
        let nonce = nonce.ok_or_else(|| Error::Msg("client-final missing r=".into()))?;
        let proof = proof.ok_or_else(|| Error::Msg("client-final missing p=".into()))?;

        if BASE64
            .decode(channel)
            .map_err(|e| Error::Msg(format!("channel binding not base64: {e}")))?
            != self.gs2_header.as_bytes()
        {
            return Err(Error::Msg("channel binding mismatch".into()));
        }
        if nonce != self.server_nonce {
            return Err(Error::Msg("nonce mismatch".into()));
        }

        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare,
            self.server_first,
            &text[..without_proof_len]
        );

        let client_signature = hmac(
            self.mechanism,
            &self.credential.stored_key,
            auth_message.as_bytes(),
        );
        let proof_bytes = BASE64
            .decode(proof)
            .map_err(|e| Error::Msg(format!("proof not base64: {e}")))?;
        if proof_bytes.len() != self.mechanism.key_len() {
            return Err(Error::Msg("proof length mismatch".into()));
        }
        let client_key: Vec<u8> = proof_bytes
            .iter()
            .zip(client_signature.iter())
            .map(|(a, b)| a ^ b)
            .collect();

        if h(self.mechanism, &client_key) != self.credential.stored_key {
            return Err(Error::Msg("authentication failed".into()));
        }

        let server_signature = hmac(
            self.mechanism,
            &self.credential.server_key,
            auth_message.as_bytes(),
        );
        Ok(format!("v={}", BASE64.encode(&server_signature)))
    }
}

/// Parse a PLAIN payload: `authzid NUL authcid NUL password`.
pub fn parse_plain(payload: &[u8]) -> Result<(String, String)> {
    let mut parts = payload.split(|b| *b == 0);
    let _authzid = parts.next().unwrap_or_default();
    let authcid = parts
        .next()
        .ok_or_else(|| Error::Msg("PLAIN payload missing username".into()))?;
    let password = parts
        .next()
        .ok_or_else(|| Error::Msg("PLAIN payload missing password".into()))?;
    if parts.next().is_some() {
        return Err(Error::Msg("PLAIN payload has trailing fields".into()));
    }
    let username = std::str::from_utf8(authcid)
        .map_err(|_| Error::Msg("PLAIN username not UTF-8".into()))?;
    let password = std::str::from_utf8(password)
        .map_err(|_| Error::Msg("PLAIN password not UTF-8".into()))?;
    if username.is_empty() || password.is_empty() {
        return Err(Error::Msg("PLAIN username and password required".into()));
    }
    Ok((username.to_string(), password.to_string()))
}

fn prepare_password(mechanism: Mechanism, username: &str, password: &str) -> Result<String> {
    match mechanism {
        Mechanism::ScramSha1 => {
            let digest = md5::compute(format!("{username}:mongo:{password}"));
            Ok(format!("{digest:x}"))
        }
        Mechanism::ScramSha256 => stringprep::saslprep(password)
            .map(|p| p.into_owned())
            .map_err(|e| Error::Msg(format!("saslprep: {e}"))),
        Mechanism::Plain => Ok(password.to_string()),
    }
}

fn generate_nonce() -> String {
    let mut bytes = vec![0u8; SERVER_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    // base64 may contain ','; strip to keep the attribute grammar intact
    BASE64.encode(&bytes).replace(['=', ','], "x")
}

fn hmac(mechanism: Mechanism, key: &[u8], data: &[u8]) -> Vec<u8> {
    match mechanism {
        Mechanism::ScramSha1 => {
            let mut mac =
                Hmac::<Sha1>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        _ => {
            let mut mac =
                Hmac::<Sha256>::new_from_slice(key).expect("HMAC accepts any key length");
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
    }
}

fn h(mechanism: Mechanism, data: &[u8]) -> Vec<u8> {
    match mechanism {
        Mechanism::ScramSha1 => {
            let mut hasher = Sha1::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
        _ => {
            let mut hasher = Sha256::new();
            hasher.update(data);
            hasher.finalize().to_vec()
        }
    }
}

fn hi(mechanism: Mechanism, password: &[u8], salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut out = vec![0u8; mechanism.key_len()];
    match mechanism {
        Mechanism::ScramSha1 => pbkdf2_hmac::<Sha1>(password, salt, iterations, &mut out),
        _ => pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    // Client half of the exchange, for exercising the server side.
    struct TestClient {
        mechanism: Mechanism,
        username: String,
        password: String,
        nonce: String,
        auth_message: Option<String>,
        salted: Option<Vec<u8>>,
    }

    impl TestClient {
        fn new(mechanism: Mechanism, username: &str, password: &str) -> Self {
            Self {
                mechanism,
                username: username.into(),
                password: password.into(),
                nonce: "clientnoncefortest".into(),
                auth_message: None,
                salted: None,
            }
        }

        fn first(&self) -> String {
            format!("n,,n={},r={}", self.username, self.nonce)
        }

        fn final_message(&mut self, server_first: &str) -> String {
            let mut server_nonce = None;
            let mut salt = None;
            let mut iterations = None;
            for part in server_first.split(',') {
                if let Some(r) = part.strip_prefix("r=") {
                    server_nonce = Some(r.to_string());
                } else if let Some(s) = part.strip_prefix("s=") {
                    salt = Some(BASE64.decode(s).unwrap());
                } else if let Some(i) = part.strip_prefix("i=") {
                    iterations = Some(i.parse::<u32>().unwrap());
                }
            }
            let server_nonce = server_nonce.unwrap();
            assert!(server_nonce.starts_with(&self.nonce));

            let prepared =
                prepare_password(self.mechanism, &self.username, &self.password).unwrap();
            let salted = hi(
                self.mechanism,
                prepared.as_bytes(),
                &salt.unwrap(),
                iterations.unwrap(),
            );
            let client_key = hmac(self.mechanism, &salted, b"Client Key");
            let stored_key = h(self.mechanism, &client_key);

            let without_proof = format!("c=biws,r={server_nonce}");
            let auth_message = format!(
                "n={},r={},{},{}",
                self.username, self.nonce, server_first, without_proof
            );
            let signature = hmac(self.mechanism, &stored_key, auth_message.as_bytes());
            let proof: Vec<u8> = client_key
                .iter()
                .zip(signature.iter())
                .map(|(a, b)| a ^ b)
                .collect();
            self.auth_message = Some(auth_message);
            self.salted = Some(salted);
            format!("{without_proof},p={}", BASE64.encode(&proof))
        }

        fn verify_server_final(&self, server_final: &str) {
            let salted = self.salted.as_ref().unwrap();
            let server_key = hmac(self.mechanism, salted, b"Server Key");
            let expected = hmac(
                self.mechanism,
                &server_key,
                self.auth_message.as_ref().unwrap().as_bytes(),
            );
            assert_eq!(server_final, format!("v={}", BASE64.encode(&expected)));
        }
    }

    fn run_exchange(mechanism: Mechanism) {
        let salt = b"0123456789abcdef";
        let credential =
            ScramCredential::derive(mechanism, "alice", "s3cret", salt, 4096).unwrap();

        let mut client = TestClient::new(mechanism, "alice", "s3cret");
        let first = parse_client_first(client.first().as_bytes()).unwrap();
        assert_eq!(first.username, "alice");

        let (conv, server_first) = ScramConversation::start(mechanism, &first, credential);
        let client_final = client.final_message(&server_first);
        let server_final = conv.finish(client_final.as_bytes()).unwrap();
        client.verify_server_final(&server_final);
    }

    #[test]
    fn full_exchange_sha256() {
        run_exchange(Mechanism::ScramSha256);
    }

    #[test]
    fn full_exchange_sha1() {
        run_exchange(Mechanism::ScramSha1);
    }

    #[test]
    fn wrong_password_rejected() {
        let salt = b"0123456789abcdef";
        let credential =
            ScramCredential::derive(Mechanism::ScramSha256, "alice", "s3cret", salt, 4096)
                .unwrap();
        let mut client = TestClient::new(Mechanism::ScramSha256, "alice", "wrong");
        let first = parse_client_first(client.first().as_bytes()).unwrap();
        let (conv, server_first) =
            ScramConversation::start(Mechanism::ScramSha256, &first, credential);
        let client_final = client.final_message(&server_first);
        assert!(conv.finish(client_final.as_bytes()).is_err());
    }

    #[test]
    fn tampered_nonce_rejected() {
        let salt = b"0123456789abcdef";
        let credential =
            ScramCredential::derive(Mechanism::ScramSha256, "alice", "s3cret", salt, 4096)
                .unwrap();
        let client = TestClient::new(Mechanism::ScramSha256, "alice", "s3cret");
        let first = parse_client_first(client.first().as_bytes()).unwrap();
        let (conv, _) = ScramConversation::start(Mechanism::ScramSha256, &first, credential);
        let forged = "c=biws,r=somebodyelsesnonce,p=AAAA";
        assert!(conv.finish(forged.as_bytes()).is_err());
    }

    #[test]
    fn channel_binding_attempt_rejected() {
        assert!(parse_client_first(b"p=tls-unique,,n=alice,r=abc").is_err());
    }

    #[test]
    fn username_escapes_decoded() {
        let first = parse_client_first(b"n,,n=a=2Cb=3Dc,r=abc").unwrap();
        assert_eq!(first.username, "a,b=c");
    }

    #[test]
    fn plain_payload_parsed() {
        let (user, pass) = parse_plain(b"\0alice\0s3cret").unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "s3cret");
        assert!(parse_plain(b"no-separators").is_err());
        assert!(parse_plain(b"\0alice\0").is_err());
    }

    #[test]
    fn credential_document_round_trip() {
        let salt = b"fedcba9876543210";
        let derived =
            ScramCredential::derive(Mechanism::ScramSha256, "bob", "pw", salt, 10000).unwrap();
        let doc = bson::doc! {
            "iterationCount": 10000i32,
            "salt": BASE64.encode(salt),
            "storedKey": BASE64.encode(&derived.stored_key),
            "serverKey": BASE64.encode(&derived.server_key),
        };
        let parsed = ScramCredential::from_document(&doc).unwrap();
        assert_eq!(parsed.iterations, 10000);
        assert_eq!(parsed.stored_key, derived.stored_key);
        assert_eq!(parsed.server_key, derived.server_key);
    }

    #[test]
    fn nonce_has_no_separators() {
        for _ in 0..16 {
            let n = generate_nonce();
            assert!(!n.contains(','));
            assert!(!n.is_empty());
        }
    }
}
