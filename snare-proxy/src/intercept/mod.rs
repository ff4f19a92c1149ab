mod filter;
mod registry;

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::error::ModifyError;
use crate::exchange::{ExchangeContext, ExchangeId};
use crate::modify::{
    InterceptResponse, ProxyRequest, ProxyResponse, RequestModifyMiddleware,
    ResponseModifyMiddleware, buffer_request, buffer_response, request_middleware,
    response_middleware, stream_request, stream_response,
};

pub use filter::{RequestFilter, ResponseFilter};
use registry::{Decision, PendingRegistry};

pub type InterceptedRequest = Request<Bytes>;
pub type InterceptedResponse = Response<Bytes>;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InterceptError {
    #[error("intercept: exchange not found")]
    NotFound,
    #[error("intercept: exchange is done")]
    Done,
    #[error("intercept: exchange was aborted")]
    Aborted,
    #[error("intercept: exchange was cancelled")]
    Cancelled,
    #[error("intercept: exchange is already pending")]
    AlreadyPending,
}

#[derive(Clone, Default)]
pub struct InterceptSettings {
    pub requests_enabled: bool,
    pub responses_enabled: bool,
    pub request_filter: Option<Arc<dyn RequestFilter>>,
    pub response_filter: Option<Arc<dyn ResponseFilter>>,
}

impl fmt::Debug for InterceptSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptSettings")
            .field("requests_enabled", &self.requests_enabled)
            .field("responses_enabled", &self.responses_enabled)
            .field("request_filter", &self.request_filter.is_some())
            .field("response_filter", &self.response_filter.is_some())
            .finish()
    }
}

/// A pending exchange as seen by the operator. At most one side is set.
#[derive(Debug, Clone)]
pub struct PendingItem {
    pub id: ExchangeId,
    pub request: Option<Arc<InterceptedRequest>>,
    pub response: Option<Arc<InterceptedResponse>>,
}

/// Holds requests and responses until an operator forwards, edits or drops
/// them.
#[derive(Default)]
pub struct InterceptService {
    settings: RwLock<InterceptSettings>,
    requests: PendingRegistry<InterceptedRequest>,
    responses: PendingRegistry<InterceptedResponse>,
}

impl InterceptService {
    pub fn new(settings: InterceptSettings) -> Self {
        Self {
            settings: RwLock::new(settings),
            ..Default::default()
        }
    }

    pub fn settings(&self) -> InterceptSettings {
        self.settings.read().clone()
    }

    /// Swaps the settings. A side that goes from enabled to disabled has its
    /// pending entries discarded.
    pub fn update_settings(&self, settings: InterceptSettings) {
        let previous = std::mem::replace(&mut *self.settings.write(), settings.clone());
        if previous.requests_enabled && !settings.requests_enabled {
            self.clear_requests();
        }
        if previous.responses_enabled && !settings.responses_enabled {
            self.clear_responses();
        }
        info!(
            requests = settings.requests_enabled,
            responses = settings.responses_enabled,
            "intercept settings updated"
        );
    }

    pub fn set_requests_enabled(&self, enabled: bool) {
        let mut settings = self.settings();
        settings.requests_enabled = enabled;
        self.update_settings(settings);
    }

    pub fn set_responses_enabled(&self, enabled: bool) {
        let mut settings = self.settings();
        settings.responses_enabled = enabled;
        self.update_settings(settings);
    }

    pub fn request_modifier(self: &Arc<Self>) -> RequestModifyMiddleware {
        let service = self.clone();
        request_middleware(move |ctx, req, next| {
            let service = service.clone();
            async move {
                let req = service.request_stage(&ctx, req).await?;
                next(ctx, req).await
            }
        })
    }

    pub fn response_modifier(self: &Arc<Self>) -> ResponseModifyMiddleware {
        let service = self.clone();
        response_middleware(move |ctx, res, next| {
            let service = service.clone();
            async move {
                let res = service.response_stage(&ctx, res).await?;
                next(ctx, res).await
            }
        })
    }

    async fn request_stage(
        &self,
        ctx: &ExchangeContext,
        req: ProxyRequest,
    ) -> Result<ProxyRequest, ModifyError> {
        let settings = self.settings();
        if !settings.requests_enabled {
            debug!(exchange = %ctx.id(), "request interception disabled");
            return Ok(req);
        }

        let buffered = buffer_request(req).await?;
        if let Some(filter) = &settings.request_filter {
            if !filter.matches_request(&buffered) {
                debug!(exchange = %ctx.id(), "request does not match filter");
                return Ok(stream_request(buffered));
            }
        }

        let mut extensions = buffered.extensions().clone();
        match self.intercept_request(ctx, buffered).await {
            Ok(mut modified) => {
                extensions.extend(std::mem::take(modified.extensions_mut()));
                *modified.extensions_mut() = extensions;
                Ok(stream_request(modified))
            }
            Err(err) => Err(stage_error(ctx, err)),
        }
    }

    async fn response_stage(
        &self,
        ctx: &ExchangeContext,
        res: ProxyResponse,
    ) -> Result<ProxyResponse, ModifyError> {
        let forced = res
            .extensions()
            .get::<InterceptResponse>()
            .map(|flag| flag.0);
        let enabled = match forced {
            Some(forced) => forced,
            None => self.settings.read().responses_enabled,
        };
        if !enabled {
            debug!(exchange = %ctx.id(), "response interception bypassed");
            return Ok(res);
        }

        let buffered = buffer_response(res).await?;
        let filter = self.settings.read().response_filter.clone();
        if let Some(filter) = filter {
            if !filter.matches_response(&buffered) {
                debug!(exchange = %ctx.id(), "response does not match filter");
                return Ok(stream_response(buffered));
            }
        }

        let mut extensions = buffered.extensions().clone();
        match self.intercept_response(ctx, buffered).await {
            Ok(mut modified) => {
                extensions.extend(std::mem::take(modified.extensions_mut()));
                *modified.extensions_mut() = extensions;
                Ok(stream_response(modified))
            }
            Err(err) => Err(stage_error(ctx, err)),
        }
    }

    /// Blocks until the operator decides on the request, or the exchange is
    /// cancelled.
    pub async fn intercept_request(
        &self,
        ctx: &ExchangeContext,
        req: InterceptedRequest,
    ) -> Result<InterceptedRequest, InterceptError> {
        debug!(exchange = %ctx.id(), method = %req.method(), uri = %req.uri(), "request intercepted");
        self.requests.intercept(ctx, req).await
    }

    pub async fn intercept_response(
        &self,
        ctx: &ExchangeContext,
        res: InterceptedResponse,
    ) -> Result<InterceptedResponse, InterceptError> {
        debug!(exchange = %ctx.id(), status = %res.status(), "response intercepted");
        self.responses.intercept(ctx, res).await
    }

    /// Forwards a pending request, optionally forcing response interception
    /// on or off for the same exchange.
    pub fn modify_request(
        &self,
        id: ExchangeId,
        mut req: InterceptedRequest,
        intercept_response: Option<bool>,
    ) -> Result<(), InterceptError> {
        if let Some(flag) = intercept_response {
            req.extensions_mut().insert(InterceptResponse(flag));
        }
        self.requests.submit(id, Decision::Modified(req))
    }

    pub fn cancel_request(&self, id: ExchangeId) -> Result<(), InterceptError> {
        self.requests.submit(id, Decision::Discard)
    }

    pub fn modify_response(
        &self,
        id: ExchangeId,
        res: InterceptedResponse,
    ) -> Result<(), InterceptError> {
        self.responses.submit(id, Decision::Modified(res))
    }

    pub fn cancel_response(&self, id: ExchangeId) -> Result<(), InterceptError> {
        self.responses.submit(id, Decision::Discard)
    }

    pub fn clear_requests(&self) {
        let discarded = self.requests.discard_all();
        debug!(discarded, "cleared pending requests");
    }

    pub fn clear_responses(&self) {
        let discarded = self.responses.discard_all();
        debug!(discarded, "cleared pending responses");
    }

    pub fn discard_all(&self) {
        self.clear_requests();
        self.clear_responses();
    }

    /// Snapshot of every pending request and response, ordered by exchange id.
    pub fn items(&self) -> Vec<PendingItem> {
        let mut items: Vec<PendingItem> = self
            .requests
            .list()
            .into_iter()
            .map(|(id, req)| PendingItem {
                id,
                request: Some(req),
                response: None,
            })
            .chain(
                self.responses
                    .list()
                    .into_iter()
                    .map(|(id, res)| PendingItem {
                        id,
                        request: None,
                        response: Some(res),
                    }),
            )
            .collect();
        items.sort_by_key(|item| item.id);
        items
    }

    pub fn item(&self, id: ExchangeId) -> Result<PendingItem, InterceptError> {
        if let Some(req) = self.requests.get(id) {
            return Ok(PendingItem {
                id,
                request: Some(req),
                response: None,
            });
        }
        if let Some(res) = self.responses.get(id) {
            return Ok(PendingItem {
                id,
                request: None,
                response: Some(res),
            });
        }
        Err(InterceptError::NotFound)
    }
}

fn stage_error(ctx: &ExchangeContext, err: InterceptError) -> ModifyError {
    match err {
        InterceptError::Aborted => debug!(exchange = %ctx.id(), "exchange aborted by operator"),
        InterceptError::Cancelled => debug!(exchange = %ctx.id(), "exchange cancelled while intercepted"),
        other => error!(exchange = %ctx.id(), error = %other, "failed to intercept exchange"),
    }
    ModifyError::from(err)
}

/// Copies a pending request without its extensions, for forwarding it as-is
/// or as a base for edits.
pub fn duplicate_request(req: &InterceptedRequest) -> InterceptedRequest {
    let mut copy = Request::new(req.body().clone());
    *copy.method_mut() = req.method().clone();
    *copy.uri_mut() = req.uri().clone();
    *copy.version_mut() = req.version();
    *copy.headers_mut() = req.headers().clone();
    copy
}

pub fn duplicate_response(res: &InterceptedResponse) -> InterceptedResponse {
    let mut copy = Response::new(res.body().clone());
    *copy.status_mut() = res.status();
    *copy.version_mut() = res.version();
    *copy.headers_mut() = res.headers().clone();
    copy
}
