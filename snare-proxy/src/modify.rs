use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderValue, Method, Request, Response, Uri};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};

use crate::error::ModifyError;
use crate::exchange::ExchangeContext;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type ProxyBody = BoxBody<Bytes, BoxError>;
pub type ProxyRequest = Request<ProxyBody>;
pub type ProxyResponse = Response<ProxyBody>;

pub type RequestModifyFn = Arc<
    dyn Fn(ExchangeContext, ProxyRequest) -> BoxFuture<'static, Result<ProxyRequest, ModifyError>>
        + Send
        + Sync,
>;
pub type ResponseModifyFn = Arc<
    dyn Fn(ExchangeContext, ProxyResponse) -> BoxFuture<'static, Result<ProxyResponse, ModifyError>>
        + Send
        + Sync,
>;

/// A request stage: takes the next continuation and returns a wrapped one.
pub type RequestModifyMiddleware = Arc<dyn Fn(RequestModifyFn) -> RequestModifyFn + Send + Sync>;
pub type ResponseModifyMiddleware = Arc<dyn Fn(ResponseModifyFn) -> ResponseModifyFn + Send + Sync>;

/// Method and target of the request a response answers. Attached to every
/// upstream response before the response stages run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRequest {
    pub method: Method,
    pub uri: Uri,
}

/// Per-exchange override for response interception, set when an operator
/// forwards the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterceptResponse(pub bool);

pub fn nop_request_modifier() -> RequestModifyFn {
    Arc::new(|_: ExchangeContext, req: ProxyRequest| {
        futures::future::ready(Ok::<_, ModifyError>(req)).boxed()
    })
}

pub fn nop_response_modifier() -> ResponseModifyFn {
    Arc::new(|_: ExchangeContext, res: ProxyResponse| {
        futures::future::ready(Ok::<_, ModifyError>(res)).boxed()
    })
}

/// Folds the stages around `terminal`. The first stage in the slice ends up
/// outermost and runs first.
pub fn compose_request_modifiers(
    middleware: &[RequestModifyMiddleware],
    terminal: RequestModifyFn,
) -> RequestModifyFn {
    middleware
        .iter()
        .rev()
        .fold(terminal, |next, stage| stage(next))
}

pub fn compose_response_modifiers(
    middleware: &[ResponseModifyMiddleware],
    terminal: ResponseModifyFn,
) -> ResponseModifyFn {
    middleware
        .iter()
        .rev()
        .fold(terminal, |next, stage| stage(next))
}

/// Builds a request stage from an async closure receiving the next continuation.
pub fn request_middleware<F, Fut>(f: F) -> RequestModifyMiddleware
where
    F: Fn(ExchangeContext, ProxyRequest, RequestModifyFn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProxyRequest, ModifyError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: RequestModifyFn| {
        let f = f.clone();
        let wrapped: RequestModifyFn = Arc::new(move |ctx: ExchangeContext, req: ProxyRequest| {
            f(ctx, req, next.clone()).boxed()
        });
        wrapped
    })
}

pub fn response_middleware<F, Fut>(f: F) -> ResponseModifyMiddleware
where
    F: Fn(ExchangeContext, ProxyResponse, ResponseModifyFn) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ProxyResponse, ModifyError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |next: ResponseModifyFn| {
        let f = f.clone();
        let wrapped: ResponseModifyFn =
            Arc::new(move |ctx: ExchangeContext, res: ProxyResponse| {
                f(ctx, res, next.clone()).boxed()
            });
        wrapped
    })
}

/// The composed request and response chains. Built once, shared by every
/// connection.
#[derive(Clone)]
pub struct ModifierPipeline {
    request: RequestModifyFn,
    response: ResponseModifyFn,
}

impl ModifierPipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub async fn modify_request(
        &self,
        ctx: ExchangeContext,
        req: ProxyRequest,
    ) -> Result<ProxyRequest, ModifyError> {
        (self.request)(ctx, req).await
    }

    pub async fn modify_response(
        &self,
        ctx: ExchangeContext,
        res: ProxyResponse,
    ) -> Result<ProxyResponse, ModifyError> {
        (self.response)(ctx, res).await
    }
}

impl Default for ModifierPipeline {
    fn default() -> Self {
        PipelineBuilder::default().build()
    }
}

#[derive(Clone, Default)]
pub struct PipelineBuilder {
    request: Vec<RequestModifyMiddleware>,
    response: Vec<ResponseModifyMiddleware>,
}

impl PipelineBuilder {
    pub fn request_modifier(mut self, stage: RequestModifyMiddleware) -> Self {
        self.request.push(stage);
        self
    }

    pub fn response_modifier(mut self, stage: ResponseModifyMiddleware) -> Self {
        self.response.push(stage);
        self
    }

    pub fn build(&self) -> ModifierPipeline {
        ModifierPipeline {
            request: compose_request_modifiers(&self.request, nop_request_modifier()),
            response: compose_response_modifiers(&self.response, nop_response_modifier()),
        }
    }
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Reads the whole request body into memory.
pub async fn buffer_request(req: ProxyRequest) -> Result<Request<Bytes>, ModifyError> {
    let (parts, body) = req.into_parts();
    let bytes = body.collect().await.map_err(ModifyError::Body)?.to_bytes();
    Ok(Request::from_parts(parts, bytes))
}

pub async fn buffer_response(res: ProxyResponse) -> Result<Response<Bytes>, ModifyError> {
    let (parts, body) = res.into_parts();
    let bytes = body.collect().await.map_err(ModifyError::Body)?.to_bytes();
    Ok(Response::from_parts(parts, bytes))
}

/// Re-wraps a buffered request so later stages can read it again.
pub fn stream_request(req: Request<Bytes>) -> ProxyRequest {
    let (mut parts, body) = req.into_parts();
    sync_content_length(&mut parts.headers, body.len());
    Request::from_parts(parts, full_body(body))
}

pub fn stream_response(res: Response<Bytes>) -> ProxyResponse {
    let (mut parts, body) = res.into_parts();
    sync_content_length(&mut parts.headers, body.len());
    Response::from_parts(parts, full_body(body))
}

/// Makes the length headers agree with a buffered body of `len` bytes. An
/// empty body leaves `Content-Length` alone so HEAD responses keep theirs.
pub fn sync_content_length(headers: &mut HeaderMap, len: usize) {
    let chunked = headers.remove(TRANSFER_ENCODING).is_some();
    if len > 0 || chunked {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
}
