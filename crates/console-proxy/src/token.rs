use std::fmt;

use http::header::COOKIE;
use http::HeaderMap;

const TOKEN_PARAM: &str = "token";

/// Opaque single-use console credential.
///
/// `Debug` is redacted so a token can sit in structs that get logged.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionToken(String);

impl ConnectionToken {
    /// Returns `None` for an empty value; an empty token is never handed to
    /// the authority.
    pub fn new(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        if value.is_empty() {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionToken(<redacted>)")
    }
}

/// Pull the console token out of an upgrade request.
///
/// The `token` query parameter wins. Without one, the `token` cookie set by a
/// previously loaded console page is used. Empty values count as absent.
pub fn extract_token(query: Option<&str>, headers: &HeaderMap) -> Option<ConnectionToken> {
    query
        .and_then(token_from_query)
        .or_else(|| token_from_cookies(headers))
}

fn token_from_query(query: &str) -> Option<ConnectionToken> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == TOKEN_PARAM)
        .and_then(|(_, value)| ConnectionToken::new(value.into_owned()))
}

fn token_from_cookies(headers: &HeaderMap) -> Option<ConnectionToken> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .find_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            if name.trim() != TOKEN_PARAM {
                return None;
            }
            ConnectionToken::new(unquote(value.trim()))
        })
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn cookie_headers(values: &[&str]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for value in values {
            headers.append(COOKIE, HeaderValue::from_str(value).unwrap());
        }
        headers
    }

    fn extracted(query: Option<&str>, headers: &HeaderMap) -> Option<String> {
        extract_token(query, headers).map(|t| t.as_str().to_string())
    }

    #[test]
    fn query_parameter() {
        let headers = HeaderMap::new();
        assert_eq!(
            extracted(Some("token=123-456-789"), &headers).as_deref(),
            Some("123-456-789")
        );
    }

    #[test]
    fn query_parameter_among_others_is_percent_decoded() {
        let headers = HeaderMap::new();
        assert_eq!(
            extracted(Some("path=%2Fwebsockify&token=a%2Bb%3D"), &headers).as_deref(),
            Some("a+b=")
        );
    }

    #[test]
    fn query_wins_over_cookie() {
        let headers = cookie_headers(&["token=\"from-cookie\""]);
        assert_eq!(
            extracted(Some("token=from-query"), &headers).as_deref(),
            Some("from-query")
        );
    }

    #[test]
    fn quoted_cookie() {
        let headers = cookie_headers(&["token=\"123-456-789\""]);
        assert_eq!(extracted(None, &headers).as_deref(), Some("123-456-789"));
    }

    #[test]
    fn cookie_among_others_and_across_headers() {
        let headers = cookie_headers(&["lang=en; theme=dark", "session=abc; token=XXX"]);
        assert_eq!(extracted(Some("other=1"), &headers).as_deref(), Some("XXX"));
    }

    #[test]
    fn cookie_name_must_match_exactly() {
        let headers = cookie_headers(&["csrftoken=nope; tokens=nope"]);
        assert_eq!(extracted(None, &headers), None);
    }

    #[test]
    fn empty_query_token_falls_back_to_cookie() {
        let headers = cookie_headers(&["token=abc"]);
        assert_eq!(extracted(Some("token="), &headers).as_deref(), Some("abc"));
    }

    #[test]
    fn nothing_to_extract() {
        assert_eq!(extracted(None, &HeaderMap::new()), None);
        assert_eq!(extracted(Some(""), &HeaderMap::new()), None);
        assert_eq!(extracted(Some("token="), &HeaderMap::new()), None);
        assert_eq!(extracted(None, &cookie_headers(&["token=\"\""])), None);
    }

    #[test]
    fn debug_output_is_redacted() {
        let token = ConnectionToken::new("secret-value").unwrap();
        assert!(!format!("{token:?}").contains("secret-value"));
    }
}
