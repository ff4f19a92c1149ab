use bytes::Bytes;
use http::{Request, Response};

/// Decides whether a buffered request should be held for the operator.
pub trait RequestFilter: Send + Sync {
    fn matches_request(&self, req: &Request<Bytes>) -> bool;
}

/// Decides whether a buffered response should be held for the operator.
pub trait ResponseFilter: Send + Sync {
    fn matches_response(&self, res: &Response<Bytes>) -> bool;
}

impl<F> RequestFilter for F
where
    F: Fn(&Request<Bytes>) -> bool + Send + Sync,
{
    fn matches_request(&self, req: &Request<Bytes>) -> bool {
        self(req)
    }
}

impl<F> ResponseFilter for F
where
    F: Fn(&Response<Bytes>) -> bool + Send + Sync,
{
    fn matches_response(&self, res: &Response<Bytes>) -> bool {
        self(res)
    }
}
