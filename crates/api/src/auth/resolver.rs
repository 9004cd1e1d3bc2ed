//! Caller identity resolution

use std::sync::Arc;

use axum::http::{
    header::{AUTHORIZATION, COOKIE},
    HeaderMap,
};
use chatgate_shared::Principal;

use super::identity::IdentityProvider;

/// Turns request credentials into a [`Principal`]
///
/// A bearer token in the `Authorization` header takes precedence over the
/// session cookie. Only the first credential found is validated, and every
/// failure resolves to `None`.
#[derive(Clone)]
pub struct IdentityResolver {
    provider: Arc<dyn IdentityProvider>,
    cookie_name: String,
}

impl IdentityResolver {
    pub fn new(provider: Arc<dyn IdentityProvider>, cookie_name: impl Into<String>) -> Self {
        Self {
            provider,
            cookie_name: cookie_name.into(),
        }
    }

    pub async fn resolve(&self, headers: &HeaderMap) -> Option<Principal> {
        let token = self.extract_credential(headers)?;

        match self.provider.verify_token(&token).await {
            Ok(principal) => Some(principal),
            Err(e) => {
                tracing::debug!(error = %e, "Credential rejected");
                None
            }
        }
    }

    /// Bearer header first, then the session cookie
    pub fn extract_credential(&self, headers: &HeaderMap) -> Option<String> {
        extract_bearer_token(headers).or_else(|| extract_cookie(headers, &self.cookie_name))
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
        })
        .filter(|token| !token.is_empty())
        .map(String::from)
}

fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|cookie| cookie.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_bearer_token_extraction() {
        assert_eq!(
            extract_bearer_token(&headers(&[("authorization", "Bearer abc")])),
            Some("abc".to_string())
        );
        assert_eq!(
            extract_bearer_token(&headers(&[("authorization", "bearer abc")])),
            Some("abc".to_string())
        );
        assert_eq!(
            extract_bearer_token(&headers(&[("authorization", "Basic abc")])),
            None
        );
        assert_eq!(
            extract_bearer_token(&headers(&[("authorization", "Bearer ")])),
            None
        );
    }

    #[test]
    fn test_cookie_extraction_matches_exact_name() {
        let h = headers(&[("cookie", "other=1; chatgate_session_old=2; chatgate_session=tok")]);
        assert_eq!(extract_cookie(&h, "chatgate_session"), Some("tok".to_string()));
        assert_eq!(extract_cookie(&h, "missing"), None);

        let h = headers(&[("cookie", "a=1"), ("cookie", "chatgate_session=second")]);
        assert_eq!(extract_cookie(&h, "chatgate_session"), Some("second".to_string()));

        let h = headers(&[("cookie", "chatgate_session=")]);
        assert_eq!(extract_cookie(&h, "chatgate_session"), None);
    }
}
