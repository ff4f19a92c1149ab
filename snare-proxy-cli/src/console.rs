use std::fmt::Write as _;

use snare_proxy::{
    ExchangeId, InterceptError, InterceptService, PendingItem, duplicate_request,
    duplicate_response,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const HELP: &str = "commands: list | show <id> | forward <id> [+response|-response] | \
                    drop <id> | drop-all | requests on|off | responses on|off | help";

/// Reads operator commands line by line until `input` ends.
pub async fn run<R, W>(service: &InterceptService, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = execute(service, line);
        output.write_all(reply.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}

pub fn execute(service: &InterceptService, line: &str) -> String {
    let mut words = line.split_whitespace();
    let command = words.next().unwrap_or_default();
    let args: Vec<&str> = words.collect();

    match (command, args.as_slice()) {
        ("list", []) => list(service),
        ("show", [id]) => with_id(id, |id| show(service, id)),
        ("forward", [id]) => with_id(id, |id| forward(service, id, None)),
        ("forward", [id, "+response"]) => with_id(id, |id| forward(service, id, Some(true))),
        ("forward", [id, "-response"]) => with_id(id, |id| forward(service, id, Some(false))),
        ("drop", [id]) => with_id(id, |id| drop_item(service, id)),
        ("drop-all", []) => {
            service.discard_all();
            "dropped all pending exchanges".to_string()
        }
        ("requests", [state]) => toggle(state, "request", |on| service.set_requests_enabled(on)),
        ("responses", [state]) => {
            toggle(state, "response", |on| service.set_responses_enabled(on))
        }
        ("help", _) => HELP.to_string(),
        _ => format!("unknown command: {line}\n{HELP}"),
    }
}

fn with_id<F>(raw: &str, action: F) -> String
where
    F: FnOnce(ExchangeId) -> Result<String, InterceptError>,
{
    match raw.parse::<ExchangeId>() {
        Ok(id) => action(id).unwrap_or_else(|err| err.to_string()),
        Err(err) => format!("invalid id {raw:?}: {err}"),
    }
}

fn toggle(state: &str, side: &str, apply: impl FnOnce(bool)) -> String {
    let enabled = match state {
        "on" => true,
        "off" => false,
        other => return format!("expected on|off, got {other:?}"),
    };
    apply(enabled);
    format!("{side} interception {state}")
}

fn list(service: &InterceptService) -> String {
    let items = service.items();
    if items.is_empty() {
        return "no pending exchanges".to_string();
    }
    items.iter().map(summary).collect::<Vec<_>>().join("\n")
}

fn summary(item: &PendingItem) -> String {
    match (&item.request, &item.response) {
        (Some(req), _) => format!("{} request  {} {}", item.id, req.method(), req.uri()),
        (_, Some(res)) => format!("{} response {}", item.id, res.status()),
        _ => format!("{} empty", item.id),
    }
}

fn show(service: &InterceptService, id: ExchangeId) -> Result<String, InterceptError> {
    let item = service.item(id)?;
    let mut out = String::new();
    let (headers, body) = match (&item.request, &item.response) {
        (Some(req), _) => {
            let _ = writeln!(out, "{} {} {:?}", req.method(), req.uri(), req.version());
            (req.headers(), req.body())
        }
        (_, Some(res)) => {
            let _ = writeln!(out, "{:?} {}", res.version(), res.status());
            (res.headers(), res.body())
        }
        _ => return Err(InterceptError::NotFound),
    };
    for (name, value) in headers {
        let _ = writeln!(out, "{name}: {}", String::from_utf8_lossy(value.as_bytes()));
    }
    let _ = write!(out, "\n{}", String::from_utf8_lossy(body));
    Ok(out)
}

fn forward(
    service: &InterceptService,
    id: ExchangeId,
    intercept_response: Option<bool>,
) -> Result<String, InterceptError> {
    let item = service.item(id)?;
    if let Some(req) = &item.request {
        service.modify_request(id, duplicate_request(req), intercept_response)?;
    } else if let Some(res) = &item.response {
        service.modify_response(id, duplicate_response(res))?;
    }
    Ok(format!("forwarded {id}"))
}

fn drop_item(service: &InterceptService, id: ExchangeId) -> Result<String, InterceptError> {
    let item = service.item(id)?;
    if item.request.is_some() {
        service.cancel_request(id)?;
    } else {
        service.cancel_response(id)?;
    }
    Ok(format!("dropped {id}"))
}
