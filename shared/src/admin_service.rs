use crate::http::make_boxed_error_response;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

/// Liveness and readiness endpoints served on the admin listener.
///
/// `/health` always answers ok while the process is up. `/ready` asks the
/// `is_ready` probe, which the binary wires to "initial reconciliation pass done".
pub struct AdminService<F> {
    is_ready: F,
}

impl<F> AdminService<F>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self { is_ready }
    }
}

impl<F> Service<Request<Incoming>> for AdminService<F>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    type Response = Response<BoxBody<Bytes, Infallible>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let res = route(req.method(), req.uri().path(), || (self.is_ready)());
        Box::pin(async move { Ok(res) })
    }
}

fn route(
    method: &Method,
    path: &str,
    is_ready: impl FnOnce() -> bool,
) -> Response<BoxBody<Bytes, Infallible>> {
    let ok_body = || Full::new(Bytes::from("ok\n")).boxed();

    if method != Method::GET && method != Method::HEAD {
        return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    match path {
        "/health" => Response::new(ok_body()),
        "/ready" => match is_ready() {
            true => Response::new(ok_body()),
            false => make_boxed_error_response(StatusCode::SERVICE_UNAVAILABLE),
        },
        _ => make_boxed_error_response(StatusCode::NOT_FOUND),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(route(&Method::GET, "/health", || false).status(), StatusCode::OK);
        assert_eq!(route(&Method::GET, "/ready", || true).status(), StatusCode::OK);
        assert_eq!(
            route(&Method::GET, "/ready", || false).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            route(&Method::GET, "/metrics", || true).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            route(&Method::POST, "/health", || true).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
