use http::{Method, StatusCode, Uri};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::exchange::ExchangeId;
use crate::modify::{
    ForwardedRequest, RequestModifyMiddleware, ResponseModifyMiddleware, request_middleware,
    response_middleware,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeEventKind {
    RequestForwarded,
    ResponseReceived,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeEvent {
    pub id: ExchangeId,
    pub kind: ExchangeEventKind,
    pub method: Option<Method>,
    pub uri: Option<Uri>,
    pub status: Option<StatusCode>,
}

pub type ExchangeEvents = ReceiverStream<ExchangeEvent>;

pub fn event_channel() -> (mpsc::Sender<ExchangeEvent>, ExchangeEvents) {
    let (sender, receiver) = mpsc::channel(50_000);
    (sender, ReceiverStream::new(receiver))
}

fn emit(sender: &mpsc::Sender<ExchangeEvent>, event: ExchangeEvent) {
    if let Err(err) = sender.try_send(event) {
        debug!(error = %err, "dropped exchange event");
    }
}

/// Request stage reporting each request as it leaves the pipeline.
pub fn event_request_modifier(sender: mpsc::Sender<ExchangeEvent>) -> RequestModifyMiddleware {
    request_middleware(move |ctx, req, next| {
        let sender = sender.clone();
        async move {
            let req = next(ctx.clone(), req).await?;
            emit(
                &sender,
                ExchangeEvent {
                    id: ctx.id(),
                    kind: ExchangeEventKind::RequestForwarded,
                    method: Some(req.method().clone()),
                    uri: Some(req.uri().clone()),
                    status: None,
                },
            );
            Ok(req)
        }
    })
}

pub fn event_response_modifier(sender: mpsc::Sender<ExchangeEvent>) -> ResponseModifyMiddleware {
    response_middleware(move |ctx, res, next| {
        let sender = sender.clone();
        async move {
            let res = next(ctx.clone(), res).await?;
            let forwarded = res.extensions().get::<ForwardedRequest>();
            emit(
                &sender,
                ExchangeEvent {
                    id: ctx.id(),
                    kind: ExchangeEventKind::ResponseReceived,
                    method: forwarded.map(|req| req.method.clone()),
                    uri: forwarded.map(|req| req.uri.clone()),
                    status: Some(res.status()),
                },
            );
            Ok(res)
        }
    })
}
