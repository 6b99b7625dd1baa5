//! Sticky allocators: extract, or mint, a session token from a request

use std::fmt;
use std::sync::LazyLock;

use actix_web::cookie::Cookie;
use log::debug;
use regex::Regex;

use super::token::StickyToken;
use crate::config::{ConfigError, ConfigResult};

/// Default cookie carrying minted tokens
pub const DEFAULT_COOKIE_NAME: &str = "_sticky";

/// socket.io long-polling transports, session id in the path
pub const SOCKET_IO_PATTERN: &str =
    r"^/socket\.io/[^/]*/(?:xhr-polling|htmlfile|jsonp-polling)/([^?]+).*";

/// SockJS transports, server id segment in the path
pub const SOCKJS_PATTERN: &str =
    r"^(?:/[^/]+)*/(\d+)/[a-z0-9_]+/(?:websocket|x[hd]r_\w+|iframe_\w+|jsonp_\w+).*";

static SOCKET_IO_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SOCKET_IO_PATTERN).expect("Valid regex pattern"));

static SOCKJS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(SOCKJS_PATTERN).expect("Valid regex pattern"));

/// Read-only view of an inbound request
pub trait RequestView {
    /// Path and query string, as sent by the client
    fn url(&self) -> &str;

    /// First value of a header, if present and valid UTF-8
    fn header(&self, name: &str) -> Option<&str>;
}

impl<B> RequestView for http::Request<B> {
    fn url(&self) -> &str {
        self.uri()
            .path_and_query()
            .map_or_else(|| self.uri().path(), |pq| pq.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }
}

impl RequestView for actix_web::HttpRequest {
    fn url(&self) -> &str {
        self.uri()
            .path_and_query()
            .map_or_else(|| self.uri().path(), |pq| pq.as_str())
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }
}

/// Outcome of running an allocator on a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    /// Token to route by; `None` falls back to round robin
    pub token: Option<StickyToken>,
    /// `Set-Cookie` value the response must carry
    pub set_cookie: Option<String>,
}

impl Allocation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn token(token: impl Into<StickyToken>) -> Self {
        Self {
            token: Some(token.into()),
            set_cookie: None,
        }
    }
}

/// Strategy mapping a request to a session token
pub trait Allocator: Send + Sync {
    fn allocate(&self, request: &dyn RequestView) -> Allocation;

    fn name(&self) -> &'static str;
}

/// Keeps the token in a cookie, minting one on first contact
#[derive(Debug, Clone)]
pub struct CookieAllocator {
    name: String,
}

impl CookieAllocator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn cookie_name(&self) -> &str {
        &self.name
    }

    fn read(&self, request: &dyn RequestView) -> Option<String> {
        let header = request.header("cookie")?;
        header
            .split(';')
            .filter_map(|part| Cookie::parse(part.trim()).ok())
            .find(|cookie| cookie.name() == self.name)
            .map(|cookie| cookie.value().to_string())
            .filter(|value| !value.is_empty())
    }
}

impl Default for CookieAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_COOKIE_NAME)
    }
}

impl Allocator for CookieAllocator {
    fn allocate(&self, request: &dyn RequestView) -> Allocation {
        if let Some(token) = self.read(request) {
            return Allocation::token(token);
        }

        let token = format!("{:04x}", rand::random::<u16>());
        debug!("Minted sticky token {} for {}", token, request.url());
        Allocation {
            set_cookie: Some(format!("{}={}; Path=/; HttpOnly", self.name, token)),
            token: Some(StickyToken::Text(token)),
        }
    }

    fn name(&self) -> &'static str {
        "cookie"
    }
}

/// Takes the token from the first capture group of a URL pattern
#[derive(Debug, Clone)]
pub struct PathAllocator {
    pattern: Regex,
    name: &'static str,
}

impl PathAllocator {
    /// Compile a custom pattern; it must have at least one capture group
    pub fn new(pattern: &str) -> ConfigResult<Self> {
        Self::with_name(pattern, "pattern")
    }

    pub fn socket_io() -> Self {
        Self {
            pattern: SOCKET_IO_REGEX.clone(),
            name: "socket.io",
        }
    }

    pub fn sockjs() -> Self {
        Self {
            pattern: SOCKJS_REGEX.clone(),
            name: "sockjs",
        }
    }

    fn with_name(pattern: &str, name: &'static str) -> ConfigResult<Self> {
        let regex = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        if regex.captures_len() < 2 {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: "pattern must contain a capture group".to_string(),
            });
        }
        Ok(Self {
            pattern: regex,
            name,
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }
}

impl Allocator for PathAllocator {
    fn allocate(&self, request: &dyn RequestView) -> Allocation {
        self.pattern
            .captures(request.url())
            .and_then(|captures| captures.get(1))
            .map_or_else(Allocation::none, |m| Allocation::token(m.as_str()))
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Caller-supplied allocation logic
pub struct FnAllocator<F> {
    f: F,
}

impl<F> FnAllocator<F>
where
    F: Fn(&dyn RequestView) -> Allocation + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnAllocator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAllocator").finish_non_exhaustive()
    }
}

impl<F> Allocator for FnAllocator<F>
where
    F: Fn(&dyn RequestView) -> Allocation + Send + Sync,
{
    fn allocate(&self, request: &dyn RequestView) -> Allocation {
        (self.f)(request)
    }

    fn name(&self) -> &'static str {
        "custom"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> http::Request<()> {
        http::Request::builder().uri(url).body(()).unwrap()
    }

    fn get_with_cookie(url: &str, cookie: &str) -> http::Request<()> {
        http::Request::builder()
            .uri(url)
            .header("cookie", cookie)
            .body(())
            .unwrap()
    }

    #[test]
    fn test_cookie_mints_token_and_sets_cookie() {
        let allocator = CookieAllocator::default();
        let allocation = allocator.allocate(&get("/"));

        let Some(StickyToken::Text(token)) = allocation.token else {
            panic!("expected a minted text token");
        };
        assert_eq!(token.len(), 4);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(
            allocation.set_cookie,
            Some(format!("_sticky={}; Path=/; HttpOnly", token))
        );
    }

    #[test]
    fn test_cookie_reads_existing_token() {
        let allocator = CookieAllocator::default();
        let allocation = allocator.allocate(&get_with_cookie("/", "theme=dark; _sticky=beef"));
        assert_eq!(allocation.token, Some(StickyToken::Text("beef".to_string())));
        assert_eq!(allocation.set_cookie, None);
    }

    #[test]
    fn test_cookie_list_with_irregular_spacing() {
        let allocator = CookieAllocator::default();
        let allocation =
            allocator.allocate(&get_with_cookie("/", "  theme=dark ;_sticky=cafe ;   lang=en"));
        assert_eq!(allocation.token, Some(StickyToken::Text("cafe".to_string())));
        assert_eq!(allocation.set_cookie, None);

        let allocation = allocator.allocate(&get_with_cookie("/", "no_equals; _sticky=0a1b"));
        assert_eq!(allocation.token, Some(StickyToken::Text("0a1b".to_string())));
    }

    #[test]
    fn test_presets_carry_their_patterns() {
        assert_eq!(PathAllocator::socket_io().pattern(), SOCKET_IO_PATTERN);
        assert_eq!(PathAllocator::sockjs().pattern(), SOCKJS_PATTERN);
        assert_eq!(PathAllocator::sockjs().name(), "sockjs");
    }

    #[test]
    fn test_cookie_empty_value_is_reminted() {
        let allocator = CookieAllocator::new("sid");
        let allocation = allocator.allocate(&get_with_cookie("/", "sid="));
        assert!(allocation.set_cookie.is_some());
        assert!(allocation.token.is_some());
    }

    #[test]
    fn test_socket_io_preset() {
        let allocator = PathAllocator::socket_io();
        for transport in ["xhr-polling", "htmlfile", "jsonp-polling"] {
            let url = format!("/socket.io/1/{}/123?t=123", transport);
            assert_eq!(
                allocator.allocate(&get(&url)).token,
                Some(StickyToken::Text("123".to_string()))
            );
        }
        assert_eq!(allocator.allocate(&get("/socket.io/1/websocket/123")).token, None);
    }

    #[test]
    fn test_sockjs_preset() {
        let allocator = PathAllocator::sockjs();
        assert_eq!(
            allocator.allocate(&get("/io/1/123/xhr_polling?t=123")).token,
            Some(StickyToken::Text("1".to_string()))
        );
        assert_eq!(
            allocator.allocate(&get("/echo/42/abc_def/websocket")).token,
            Some(StickyToken::Text("42".to_string()))
        );
        assert_eq!(allocator.allocate(&get("/echo/info")).token, None);
    }

    #[test]
    fn test_custom_pattern() {
        let allocator = PathAllocator::new(r"^/server(\d+)/.*").unwrap();
        assert_eq!(
            allocator.allocate(&get("/server1/test")).token,
            Some(StickyToken::Text("1".to_string()))
        );
        assert_eq!(allocator.allocate(&get("/other/test")).token, None);
    }

    #[test]
    fn test_malformed_pattern_is_rejected() {
        let result = PathAllocator::new(r"^/server(\d+/.*");
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_pattern_without_group_is_rejected() {
        let result = PathAllocator::new(r"^/server\d+/.*");
        assert!(matches!(result, Err(ConfigError::InvalidPattern { .. })));
    }

    #[test]
    fn test_fn_allocator() {
        let allocator = FnAllocator::new(|request: &dyn RequestView| {
            request
                .header("x-tenant")
                .and_then(|v| v.parse::<u64>().ok())
                .map_or_else(Allocation::none, Allocation::token)
        });
        let request = http::Request::builder()
            .uri("/")
            .header("x-tenant", "9")
            .body(())
            .unwrap();
        assert_eq!(allocator.allocate(&request).token, Some(StickyToken::Index(9)));
        assert_eq!(allocator.allocate(&get("/")).token, None);
    }
}
