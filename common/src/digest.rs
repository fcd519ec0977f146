//! Credential digests for the two device handshakes.
//!
//! The RPC login uses a vendor hash chain (`user:random:HA1`, upper-case
//! hex).  The file download uses standard HTTP Digest with `qop=auth`
//! (lower-case hex).  The two are not interchangeable.

use std::sync::LazyLock;

use rand::Rng;
use regex::Regex;

use crate::error::DownloadError;

/// Alphabet and length of the client nonce sent with download requests.
const CNONCE_ALPHABET: &[u8] = b"abcdef0123456789";
pub const CNONCE_LEN: usize = 16;

/// Nonce count; every download performs a fresh challenge, so it is
/// always the first use of the server nonce.
pub const NONCE_COUNT: &str = "00000001";

static CHALLENGE_PARAM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z]+)\s*=\s*(?:"([^"]*)"|([^,\s]+))"#).expect("static regex")
});

/// Challenge parameters from the first `global.login` step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginChallenge {
    pub realm: String,
    pub random: String,
}

/// Parsed `WWW-Authenticate: Digest ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub qop: Option<String>,
}

/// Client nonce and response hash for one download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDigest {
    pub cnonce: String,
    pub response: String,
}

/// Login digest: `MD5(user:random:HEX(MD5(user:realm:password)))`,
/// upper-case hex throughout.
pub fn login_digest(username: &str, password: &str, random: &str, realm: &str) -> String {
    let ha1 = format!("{:X}", md5::compute(format!("{username}:{realm}:{password}")));
    format!("{:X}", md5::compute(format!("{username}:{random}:{ha1}")))
}

/// HTTP Digest response for `method uri` with a freshly generated cnonce.
pub fn download_digest(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    realm: &str,
    nonce: &str,
) -> DownloadDigest {
    let cnonce = client_nonce();
    let response = digest_response(username, password, method, uri, realm, nonce, &cnonce);
    DownloadDigest { cnonce, response }
}

/// Deterministic half of [`download_digest`].
pub fn digest_response(
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    realm: &str,
    nonce: &str,
    cnonce: &str,
) -> String {
    let ha1 = format!("{:x}", md5::compute(format!("{username}:{realm}:{password}")));
    let ha2 = format!("{:x}", md5::compute(format!("{method}:{uri}")));
    format!(
        "{:x}",
        md5::compute(format!("{ha1}:{nonce}:{NONCE_COUNT}:{cnonce}:auth:{ha2}"))
    )
}

/// Random 16-character nonce drawn from `[a-f0-9]`.
pub fn client_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..CNONCE_LEN)
        .map(|_| CNONCE_ALPHABET[rng.gen_range(0..CNONCE_ALPHABET.len())] as char)
        .collect()
}

impl DigestChallenge {
    /// Parse a `Digest realm="...", qop="auth", nonce="...", opaque="..."`
    /// header.  Parameter order is not significant.
    pub fn parse(header: &str) -> Result<Self, DownloadError> {
        let malformed = || DownloadError::MalformedChallenge(header.to_string());

        let (scheme, rest) = header.trim().split_once(' ').ok_or_else(malformed)?;
        if !scheme.eq_ignore_ascii_case("digest") {
            return Err(malformed());
        }

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = None;
        for caps in CHALLENGE_PARAM.captures_iter(rest) {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_string());
            match caps[1].to_ascii_lowercase().as_str() {
                "realm" => realm = value,
                "nonce" => nonce = value,
                "opaque" => opaque = value,
                "qop" => qop = value,
                _ => {}
            }
        }

        Ok(Self {
            realm: realm.ok_or_else(malformed)?,
            nonce: nonce.filter(|n| !n.is_empty()).ok_or_else(malformed)?,
            opaque,
            qop,
        })
    }

    /// Build the `Authorization` header value answering this challenge.
    pub fn authorization(&self, username: &str, uri: &str, digest: &DownloadDigest) -> String {
        let mut header = format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", response=\"{}\"",
            self.realm, self.nonce, digest.response
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{opaque}\""));
        }
        header.push_str(&format!(
            ", qop=auth, nc={NONCE_COUNT}, cnonce=\"{}\"",
            digest.cnonce
        ));
        header
    }
}
