mod config;
mod encoding;
mod error;
mod events;
mod exchange;
mod intercept;
mod modify;
mod proxy;
mod scope;
mod upstream;

pub use config::{
    InterceptConfig, ListenConfig, ProxyConfig, ScopeConfig, ScopePatternType, ScopeRule,
    ScopeRuleType, ScopeTarget, TlsMitmConfig, UpstreamConfig,
};
pub use encoding::{gunzip_response, is_gzip, restrict_accept_encoding, strip_hop_by_hop};
pub use error::{ModifyError, ProxyError};
pub use events::{
    ExchangeEvent, ExchangeEventKind, ExchangeEvents, event_channel, event_request_modifier,
    event_response_modifier,
};
pub use exchange::{ExchangeContext, ExchangeId};
pub use intercept::{
    InterceptError, InterceptService, InterceptSettings, InterceptedRequest, InterceptedResponse,
    PendingItem, RequestFilter, ResponseFilter, duplicate_request, duplicate_response,
};
pub use modify::{
    BoxError, ForwardedRequest, InterceptResponse, ModifierPipeline, PipelineBuilder, ProxyBody,
    ProxyRequest, ProxyResponse, RequestModifyFn, RequestModifyMiddleware, ResponseModifyFn,
    ResponseModifyMiddleware, buffer_request, buffer_response, compose_request_modifiers,
    compose_response_modifiers, empty_body, full_body, nop_request_modifier,
    nop_response_modifier, request_middleware, response_middleware, stream_request,
    stream_response, sync_content_length,
};
pub use proxy::{Proxy, ProxyBuilder};
pub use scope::ScopeFilter;
pub use upstream::{HttpUpstream, Upstream, UpstreamError};
