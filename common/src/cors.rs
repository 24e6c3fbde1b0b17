use http::{
    HeaderValue, Method,
    header::{AUTHORIZATION, CONTENT_TYPE},
};
use std::time::Duration;
use tower_http::cors::{AllowMethods, AllowOrigin, CorsLayer};

const MAX_AGE: Duration = Duration::from_secs(60 * 60);

fn base(methods: &[Method]) -> CorsLayer {
    CorsLayer::new()
        .allow_credentials(true)
        .allow_methods(AllowMethods::list(methods.iter().cloned()))
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]) // list explicitly
        .max_age(MAX_AGE)
}

/// Reflect any origin; development only. `methods` must be exactly the
/// verbs the service's router registers, passed in at the router site
/// so the CORS policy cannot drift from the actual route surface.
pub fn dev(methods: &[Method]) -> CorsLayer {
    base(methods).allow_origin(AllowOrigin::mirror_request())
}

/// Explicit origin allowlist for production; same method contract as
/// [`dev`].
pub fn prod(origins: &[&str], methods: &[Method]) -> CorsLayer {
    base(methods).allow_origin(AllowOrigin::list(origins.iter().map(|o| {
        HeaderValue::from_str(o)
            .unwrap_or_else(|_| panic!("Invalid header value for CORS origin: {}", o))
    })))
}
