use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use subtle::ConstantTimeEq;

/// Basic-auth gate for the signaling socket and HTTP surface.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

/// Outcome of checking an `Authorization` header against the configured
/// credentials.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    /// No (or non-Basic) header: challenge the client.
    Challenge,
    /// Credentials present but wrong.
    Denied,
    /// Authenticated; carries the presented username.
    Granted(String),
}

impl BasicAuth {
    pub fn check(&self, authorization: Option<&str>) -> AuthOutcome {
        let Some(header) = authorization else {
            return AuthOutcome::Challenge;
        };
        let Some(encoded) = header
            .strip_prefix("Basic ")
            .or_else(|| header.strip_prefix("basic "))
        else {
            return AuthOutcome::Challenge;
        };
        let Ok(decoded) = BASE64.decode(encoded.trim()) else {
            return AuthOutcome::Denied;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return AuthOutcome::Denied;
        };
        let Some((user, password)) = decoded.split_once(':') else {
            return AuthOutcome::Denied;
        };

        let user_ok: bool = user.as_bytes().ct_eq(self.user.as_bytes()).into();
        let pass_ok: bool = password.as_bytes().ct_eq(self.password.as_bytes()).into();
        if user_ok & pass_ok {
            AuthOutcome::Granted(user.to_string())
        } else {
            AuthOutcome::Denied
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> BasicAuth {
        BasicAuth {
            user: "viewer".into(),
            password: "hunter2".into(),
        }
    }

    fn header(user: &str, password: &str) -> String {
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"))
        )
    }

    #[test]
    fn missing_header_challenges() {
        assert_eq!(auth().check(None), AuthOutcome::Challenge);
        assert_eq!(auth().check(Some("Bearer abc")), AuthOutcome::Challenge);
    }

    #[test]
    fn correct_credentials_granted() {
        let h = header("viewer", "hunter2");
        assert_eq!(
            auth().check(Some(&h)),
            AuthOutcome::Granted("viewer".into())
        );
    }

    #[test]
    fn wrong_password_denied() {
        let h = header("viewer", "wrong");
        assert_eq!(auth().check(Some(&h)), AuthOutcome::Denied);
    }

    #[test]
    fn wrong_user_denied() {
        let h = header("other", "hunter2");
        assert_eq!(auth().check(Some(&h)), AuthOutcome::Denied);
    }

    #[test]
    fn malformed_base64_denied() {
        assert_eq!(auth().check(Some("Basic !!!!")), AuthOutcome::Denied);
    }

    #[test]
    fn missing_colon_denied() {
        let encoded = base64::engine::general_purpose::STANDARD.encode("no-colon-here");
        assert_eq!(
            auth().check(Some(&format!("Basic {encoded}"))),
            AuthOutcome::Denied
        );
    }

    #[test]
    fn password_containing_colon_accepted() {
        let a = BasicAuth {
            user: "u".into(),
            password: "p:w:d".into(),
        };
        let h = header("u", "p:w:d");
        assert_eq!(a.check(Some(&h)), AuthOutcome::Granted("u".into()));
    }
}
