//! RTSP authentication: Basic and Digest (MD5), both sides.
//!
//! The [`Sender`] turns a 401 challenge into an `Authorization` header;
//! the [`Validator`] issues challenges and checks presented credentials.
//!
//! Stored credentials may be pre-hashed as `sha256:<base64>`; hashed
//! credentials can only be validated against Basic authorization, since
//! Digest needs the cleartext password on both ends.

use base64::prelude::{BASE64_STANDARD, Engine as _};
use rand::RngExt;
use sha2::{Digest as _, Sha256};

use crate::error::{Result, RtspError};
use crate::protocol::message::{Method, Request};
use crate::url::RtspUrl;

/// Default Digest realm, overridable via server configuration.
pub const DEFAULT_REALM: &str = "IPCAM";

/// Authentication scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Digest,
}

/// User credentials, as configured or as extracted from URL userinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub pass: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, pass: impl Into<String>) -> Self {
        Credentials {
            user: user.into(),
            pass: pass.into(),
        }
    }
}

/// One `WWW-Authenticate` challenge.
#[derive(Debug, Clone)]
pub struct Challenge {
    pub method: AuthMethod,
    pub realm: String,
    pub nonce: Option<String>,
    pub stale: bool,
}

impl Challenge {
    /// Parse a single `WWW-Authenticate` value.
    pub fn parse(value: &str) -> Result<Challenge> {
        let value = value.trim();
        let (method, params) = if let Some(rest) = value.strip_prefix("Digest") {
            (AuthMethod::Digest, rest)
        } else if let Some(rest) = value.strip_prefix("Basic") {
            (AuthMethod::Basic, rest)
        } else {
            return Err(RtspError::Auth(format!("unknown auth scheme: {value}")));
        };

        let params = parse_params(params);
        let realm = param(&params, "realm").unwrap_or_default().to_string();
        let nonce = param(&params, "nonce").map(str::to_string);
        let stale = param(&params, "stale")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Challenge {
            method,
            realm,
            nonce,
            stale,
        })
    }

    /// Parse every challenge among a set of header values.
    pub fn parse_all<'a>(values: impl IntoIterator<Item = &'a str>) -> Vec<Challenge> {
        values
            .into_iter()
            .filter_map(|v| Challenge::parse(v).ok())
            .collect()
    }

    pub fn serialize(&self) -> String {
        match self.method {
            AuthMethod::Basic => format!("Basic realm=\"{}\"", self.realm),
            AuthMethod::Digest => format!(
                "Digest realm=\"{}\", nonce=\"{}\"",
                self.realm,
                self.nonce.as_deref().unwrap_or("")
            ),
        }
    }
}

/// Generates `Authorization` values for requests, from a received
/// challenge and the user's credentials. Digest is preferred when offered.
#[derive(Debug, Clone)]
pub struct Sender {
    method: AuthMethod,
    realm: String,
    nonce: String,
    credentials: Credentials,
}

impl Sender {
    pub fn new(challenges: &[Challenge], credentials: Credentials) -> Result<Sender> {
        let digest = challenges
            .iter()
            .find(|c| c.method == AuthMethod::Digest && c.nonce.is_some());
        if let Some(challenge) = digest {
            return Ok(Sender {
                method: AuthMethod::Digest,
                realm: challenge.realm.clone(),
                nonce: challenge.nonce.clone().unwrap_or_default(),
                credentials,
            });
        }
        let basic = challenges
            .iter()
            .find(|c| c.method == AuthMethod::Basic)
            .ok_or_else(|| RtspError::Auth("no usable challenge offered".to_string()))?;
        Ok(Sender {
            method: AuthMethod::Basic,
            realm: basic.realm.clone(),
            nonce: String::new(),
            credentials,
        })
    }

    /// `Authorization` header value for the given request method and URI.
    pub fn authorization(&self, method: Method, uri: &str) -> String {
        match self.method {
            AuthMethod::Basic => {
                let joined = format!("{}:{}", self.credentials.user, self.credentials.pass);
                format!("Basic {}", BASE64_STANDARD.encode(joined))
            }
            AuthMethod::Digest => {
                let response = digest_response(
                    &self.credentials.user,
                    &self.credentials.pass,
                    &self.realm,
                    &self.nonce,
                    method.as_str(),
                    uri,
                );
                format!(
                    "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
                    self.credentials.user, self.realm, self.nonce, uri, response
                )
            }
        }
    }
}

/// `response = md5(md5(user:realm:pass):nonce:md5(method:uri))`,
/// algorithm MD5 only (RFC 2069 semantics, as RTSP servers implement it).
pub fn digest_response(
    user: &str,
    pass: &str,
    realm: &str,
    nonce: &str,
    method: &str,
    uri: &str,
) -> String {
    let ha1 = md5_hex(&format!("{user}:{realm}:{pass}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

fn sha256_base64(input: &str) -> String {
    BASE64_STANDARD.encode(Sha256::digest(input.as_bytes()))
}

/// Hash a credential for storage: `sha256:<base64>`. Validators holding
/// hashed credentials only accept Basic authorization.
pub fn hash_credential(value: &str) -> String {
    format!("sha256:{}", sha256_base64(value))
}

/// Validates credentials presented by a peer.
///
/// A fresh 128-bit nonce is issued per validator instance (one per
/// connection), so replayed Digest responses from other connections are
/// rejected.
pub struct Validator {
    user: String,
    user_hashed: bool,
    pass: String,
    pass_hashed: bool,
    methods: Vec<AuthMethod>,
    realm: String,
    nonce: String,
}

impl Validator {
    /// `methods = None` means both Basic and Digest. `sha256:` prefixed
    /// credentials force Basic-only.
    pub fn new(credentials: &Credentials, methods: Option<Vec<AuthMethod>>, realm: &str) -> Self {
        let mut methods = methods.unwrap_or_else(|| vec![AuthMethod::Basic, AuthMethod::Digest]);

        let (user, user_hashed) = match credentials.user.strip_prefix("sha256:") {
            Some(hashed) => (hashed.to_string(), true),
            None => (credentials.user.clone(), false),
        };
        let (pass, pass_hashed) = match credentials.pass.strip_prefix("sha256:") {
            Some(hashed) => (hashed.to_string(), true),
            None => (credentials.pass.clone(), false),
        };

        if user_hashed || pass_hashed {
            methods = vec![AuthMethod::Basic];
        }

        let nonce = format!("{:032x}", rand::rng().random::<u128>());

        Validator {
            user,
            user_hashed,
            pass,
            pass_hashed,
            methods,
            realm: realm.to_string(),
            nonce,
        }
    }

    /// `WWW-Authenticate` values to attach to a 401 response.
    pub fn header(&self) -> Vec<String> {
        self.methods
            .iter()
            .map(|method| {
                Challenge {
                    method: *method,
                    realm: self.realm.clone(),
                    nonce: (*method == AuthMethod::Digest).then(|| self.nonce.clone()),
                    stale: false,
                }
                .serialize()
            })
            .collect()
    }

    /// Validate the `Authorization` header of a request.
    ///
    /// `base_url` covers clients that strip the control attribute on
    /// SETUP: the Digest URI check accepts either the request URI or the
    /// session's base URL.
    pub fn validate(&self, request: &Request, base_url: Option<&RtspUrl>) -> Result<()> {
        let value = request
            .headers
            .get("Authorization")
            .ok_or_else(|| RtspError::Auth("missing authorization".to_string()))?;

        if let Some(basic) = value.trim().strip_prefix("Basic ") {
            return self.validate_basic(basic);
        }
        if let Some(digest) = value.trim().strip_prefix("Digest") {
            return self.validate_digest(digest, request, base_url);
        }
        Err(RtspError::Auth(format!("unknown auth scheme: {value}")))
    }

    fn validate_basic(&self, encoded: &str) -> Result<()> {
        if !self.methods.contains(&AuthMethod::Basic) {
            return Err(RtspError::Auth("basic auth not offered".to_string()));
        }
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|_| RtspError::Auth("invalid base64 credentials".to_string()))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| RtspError::Auth("invalid credentials encoding".to_string()))?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or_else(|| RtspError::Auth("malformed credentials".to_string()))?;

        let user_ok = if self.user_hashed {
            sha256_base64(user) == self.user
        } else {
            user == self.user
        };
        let pass_ok = if self.pass_hashed {
            sha256_base64(pass) == self.pass
        } else {
            pass == self.pass
        };
        if !user_ok || !pass_ok {
            return Err(RtspError::Auth("wrong response".to_string()));
        }
        Ok(())
    }

    fn validate_digest(
        &self,
        params: &str,
        request: &Request,
        base_url: Option<&RtspUrl>,
    ) -> Result<()> {
        if !self.methods.contains(&AuthMethod::Digest) {
            return Err(RtspError::Auth("digest auth not offered".to_string()));
        }
        let params = parse_params(params);
        let realm =
            param(&params, "realm").ok_or_else(|| RtspError::Auth("missing realm".to_string()))?;
        let nonce =
            param(&params, "nonce").ok_or_else(|| RtspError::Auth("missing nonce".to_string()))?;
        let username = param(&params, "username")
            .ok_or_else(|| RtspError::Auth("missing username".to_string()))?;
        let uri = param(&params, "uri").ok_or_else(|| RtspError::Auth("missing uri".to_string()))?;
        let response = param(&params, "response")
            .ok_or_else(|| RtspError::Auth("missing response".to_string()))?;

        if nonce != self.nonce {
            return Err(RtspError::Auth("wrong nonce".to_string()));
        }
        if realm != self.realm {
            return Err(RtspError::Auth("wrong realm".to_string()));
        }
        if username != self.user {
            return Err(RtspError::Auth("wrong username".to_string()));
        }

        // Some clients strip the control attribute on SETUP; accept the
        // session base URL as the digest URI in that case.
        let mut effective_uri = request.uri.as_str();
        let base;
        if uri != request.uri {
            match base_url {
                Some(url) => {
                    base = url.to_string();
                    if uri != base {
                        return Err(RtspError::Auth("wrong uri".to_string()));
                    }
                    effective_uri = &base;
                }
                None => return Err(RtspError::Auth("wrong uri".to_string())),
            }
        }

        let expected = digest_response(
            &self.user,
            &self.pass,
            &self.realm,
            &self.nonce,
            request.method.as_str(),
            effective_uri,
        );
        if response != expected {
            return Err(RtspError::Auth("wrong response".to_string()));
        }
        Ok(())
    }
}

/// Parse `key="value", key=value` parameter lists; quoted values may
/// contain commas.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().trim_start_matches(',').trim().to_string();
        rest = rest[eq + 1..].trim_start();

        let value;
        if let Some(quoted) = rest.strip_prefix('"') {
            let Some(end) = quoted.find('"') else { break };
            value = quoted[..end].to_string();
            rest = quoted[end + 1..].trim_start().trim_start_matches(',');
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',');
        }
        params.push((key, value));
        rest = rest.trim_start();
    }
    params
}

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Request;

    fn request_with_auth(method: Method, uri: &str, authorization: &str) -> Request {
        let mut req = Request::new(method, uri);
        req.headers.add("Authorization", authorization);
        req
    }

    #[test]
    fn digest_sender_matches_validator() {
        let creds = Credentials::new("admin", "secret");
        let validator = Validator::new(&creds, None, DEFAULT_REALM);

        let challenges = Challenge::parse_all(validator.header().iter().map(String::as_str));
        let sender = Sender::new(&challenges, creds).unwrap();

        let uri = "rtsp://host:8554/stream";
        let authorization = sender.authorization(Method::Describe, uri);
        assert!(authorization.starts_with("Digest "));

        let req = request_with_auth(Method::Describe, uri, &authorization);
        validator.validate(&req, None).unwrap();
    }

    #[test]
    fn digest_wrong_password_rejected() {
        let validator = Validator::new(&Credentials::new("admin", "secret"), None, DEFAULT_REALM);
        let challenges = Challenge::parse_all(validator.header().iter().map(String::as_str));
        let sender = Sender::new(&challenges, Credentials::new("admin", "wrong")).unwrap();

        let uri = "rtsp://host/stream";
        let req = request_with_auth(Method::Play, uri, &sender.authorization(Method::Play, uri));
        let err = validator.validate(&req, None).unwrap_err();
        assert!(err.to_string().contains("wrong response"));
    }

    #[test]
    fn digest_accepts_base_url_fallback() {
        let creds = Credentials::new("admin", "secret");
        let validator = Validator::new(&creds, None, DEFAULT_REALM);
        let challenges = Challenge::parse_all(validator.header().iter().map(String::as_str));
        let sender = Sender::new(&challenges, creds).unwrap();

        // The client computed the digest over the base URL but sent the
        // SETUP to the track URL.
        let base = RtspUrl::parse("rtsp://host:8554/stream").unwrap();
        let authorization = sender.authorization(Method::Setup, "rtsp://host:8554/stream");
        let req = request_with_auth(
            Method::Setup,
            "rtsp://host:8554/stream/trackID=0",
            &authorization,
        );

        assert!(validator.validate(&req, None).is_err());
        validator.validate(&req, Some(&base)).unwrap();
    }

    #[test]
    fn digest_missing_fields_named() {
        let validator = Validator::new(&Credentials::new("admin", "secret"), None, DEFAULT_REALM);
        let req = request_with_auth(
            Method::Describe,
            "rtsp://host/stream",
            "Digest username=\"admin\", realm=\"IPCAM\"",
        );
        let err = validator.validate(&req, None).unwrap_err();
        assert!(err.to_string().contains("missing nonce"));
    }

    #[test]
    fn basic_round_trip() {
        let creds = Credentials::new("user", "pw");
        let validator = Validator::new(&creds, Some(vec![AuthMethod::Basic]), DEFAULT_REALM);
        let challenges = Challenge::parse_all(validator.header().iter().map(String::as_str));
        assert_eq!(challenges.len(), 1);
        let sender = Sender::new(&challenges, creds).unwrap();

        let authorization = sender.authorization(Method::Describe, "rtsp://host/s");
        assert_eq!(authorization, "Basic dXNlcjpwdw==");

        let req = request_with_auth(Method::Describe, "rtsp://host/s", &authorization);
        validator.validate(&req, None).unwrap();
    }

    #[test]
    fn hashed_credentials_force_basic() {
        // sha256-base64 of "secret"
        let hashed = format!("sha256:{}", sha256_base64("secret"));
        let stored = Credentials::new("admin", hashed);
        let validator = Validator::new(&stored, None, DEFAULT_REALM);

        let header = validator.header();
        assert_eq!(header.len(), 1);
        assert!(header[0].starts_with("Basic"));

        let ok = Sender::new(
            &Challenge::parse_all(header.iter().map(String::as_str)),
            Credentials::new("admin", "secret"),
        )
        .unwrap();
        let req = request_with_auth(
            Method::Describe,
            "rtsp://host/s",
            &ok.authorization(Method::Describe, "rtsp://host/s"),
        );
        validator.validate(&req, None).unwrap();

        let bad = Sender::new(
            &Challenge::parse_all(header.iter().map(String::as_str)),
            Credentials::new("admin", "nope"),
        )
        .unwrap();
        let req = request_with_auth(
            Method::Describe,
            "rtsp://host/s",
            &bad.authorization(Method::Describe, "rtsp://host/s"),
        );
        assert!(validator.validate(&req, None).is_err());
    }

    #[test]
    fn missing_authorization() {
        let validator = Validator::new(&Credentials::new("u", "p"), None, DEFAULT_REALM);
        let req = Request::new(Method::Describe, "rtsp://host/s");
        let err = validator.validate(&req, None).unwrap_err();
        assert!(err.to_string().contains("missing authorization"));
    }

    #[test]
    fn challenge_parse_with_stale() {
        let c = Challenge::parse("Digest realm=\"cam\", nonce=\"abc\", stale=\"true\"").unwrap();
        assert_eq!(c.method, AuthMethod::Digest);
        assert_eq!(c.realm, "cam");
        assert_eq!(c.nonce.as_deref(), Some("abc"));
        assert!(c.stale);
    }

    #[test]
    fn sender_prefers_digest() {
        let challenges = Challenge::parse_all([
            "Basic realm=\"cam\"",
            "Digest realm=\"cam\", nonce=\"n1\"",
        ]);
        let sender = Sender::new(&challenges, Credentials::new("u", "p")).unwrap();
        assert!(
            sender
                .authorization(Method::Options, "rtsp://h/s")
                .starts_with("Digest")
        );
    }
}
