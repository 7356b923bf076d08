use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use url::Url;

/// User name and password for a host or proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }

    /// Empty credentials mean the caller declined to authenticate.
    pub fn is_empty(&self) -> bool {
        self.user.is_empty() && self.password.is_empty()
    }

    /// Value for an `Authorization` or `Proxy-Authorization` header.
    pub fn basic_header(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.user, self.password));
        format!("Basic {token}")
    }
}

/// An authentication request raised by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    /// The target URL, or the proxy URL for proxy challenges.
    pub url: Url,
    pub realm: String,
    pub proxy: bool,
}

/// Identity of a protection space in the credential cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CredentialKey {
    pub proxy: bool,
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    pub realm: String,
}

impl CredentialKey {
    pub fn for_challenge(challenge: &AuthChallenge) -> Self {
        let url = &challenge.url;
        Self {
            proxy: challenge.proxy,
            scheme: url.scheme().to_owned(),
            host: url.host_str().unwrap_or_default().to_ascii_lowercase(),
            port: url.port_or_known_default(),
            realm: challenge.realm.clone(),
        }
    }
}

/// Extract the `realm` parameter from a `WWW-Authenticate` style header.
pub fn realm_from_challenge(header: &str) -> String {
    let lower = header.to_ascii_lowercase();
    let Some(start) = lower.find("realm=") else {
        return String::new();
    };
    let rest = &header[start + "realm=".len()..];
    match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or_default().to_owned(),
        None => rest
            .split(|c: char| c == ',' || c.is_whitespace())
            .next()
            .unwrap_or_default()
            .to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header() {
        let creds = Credentials::new("Aladdin", "open sesame");
        assert_eq!(creds.basic_header(), "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
        assert!(!creds.is_empty());
        assert!(Credentials::default().is_empty());
    }

    #[test]
    fn test_realm_parsing() {
        assert_eq!(realm_from_challenge(r#"Basic realm="Secret Area""#), "Secret Area");
        assert_eq!(realm_from_challenge("Basic Realm=files, charset=UTF-8"), "files");
        assert_eq!(realm_from_challenge("Bearer"), "");
    }

    #[test]
    fn test_key_normalizes_host_and_port() {
        let challenge = AuthChallenge {
            url: Url::parse("https://Example.COM/private").unwrap(),
            realm: "r".into(),
            proxy: false,
        };
        let key = CredentialKey::for_challenge(&challenge);
        assert_eq!(key.host, "example.com");
        assert_eq!(key.port, Some(443));
    }
}
