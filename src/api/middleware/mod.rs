pub mod gateway;

use http::header::{AUTHORIZATION, CONTENT_TYPE};
use http::request::Parts as ReqParts;
use http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::constants::{PRINCIPAL_ID_HEADER, PRINCIPAL_ROLE_HEADER};
use crate::util::env::Config;

/// `CORS_ALLOW_ORIGINS` is either `*` or a comma-separated list of origin suffixes
pub fn cors(config: &Config) -> CorsLayer {
    let allowed = if config.cors_allow_origins.trim() == "*" {
        AllowOrigin::any()
    } else {
        let suffixes: Vec<String> = config
            .cors_allow_origins
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        AllowOrigin::predicate(move |org: &HeaderValue, _: &ReqParts| {
            suffixes
                .iter()
                .any(|suffix| org.as_bytes().ends_with(suffix.as_bytes()))
        })
    };

    CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers([
            AUTHORIZATION,
            CONTENT_TYPE,
            HeaderName::from_static(PRINCIPAL_ID_HEADER),
            HeaderName::from_static(PRINCIPAL_ROLE_HEADER),
        ])
        .allow_origin(allowed)
}
