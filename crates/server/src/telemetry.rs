//! Log output and per-request spans.
//!
//! Every event emitted while an `http.request` span is current is prefixed
//! with `[request_id=...]`, in both the compact and the JSON format.

use std::time::Duration;

use axum::{body::HttpBody, extract::MatchedPath, http};
use tower_http::{
    request_id::RequestId,
    trace::{DefaultOnRequest, HttpMakeClassifier, MakeSpan, OnResponse, TraceLayer},
};
use tracing::{
    field::{Field, Visit},
    span, Event, Span, Subscriber,
};
use tracing_subscriber::{
    fmt::{self, format::Writer, writer::MakeWriter, FmtContext, FormatEvent, FormatFields},
    layer::{Context, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::config::LogFormat;

const REQUEST_SPAN: &str = "http.request";
const DEFAULT_FILTER: &str = "info,quillhub_server=info,quillhub=info";

/// Installs the global subscriber. `RUST_LOG` wins over the built-in filter.
/// A second call leaves the first subscriber in place.
pub fn init(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    if let Err(err) = tracing::subscriber::set_global_default(subscriber(format, filter)) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

pub fn subscriber(format: LogFormat, filter: EnvFilter) -> Box<dyn Subscriber + Send + Sync> {
    compose(format, filter, std::io::stderr)
}

#[cfg(test)]
pub fn subscriber_to<W>(
    format: LogFormat,
    filter: EnvFilter,
    writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    compose(format, filter, writer)
}

fn compose<W>(format: LogFormat, filter: EnvFilter, writer: W) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + 'static,
{
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(RequestIdTagger);

    match format {
        LogFormat::Json => Box::new(
            registry.with(
                fmt::layer()
                    .json()
                    .event_format(Tagged(fmt::format().json()))
                    .with_writer(writer),
            ),
        ),
        LogFormat::Compact => Box::new(
            registry.with(
                fmt::layer()
                    .event_format(Tagged(fmt::format()))
                    .with_writer(writer),
            ),
        ),
    }
}

/// Trace layer for the public router. Expects `SetRequestIdLayer` to sit
/// outside it so the span always carries the effective request id.
pub fn http_layer() -> TraceLayer<HttpMakeClassifier, RequestSpan, DefaultOnRequest, RequestDone>
{
    TraceLayer::new_for_http()
        .make_span_with(RequestSpan)
        .on_response(RequestDone)
}

#[derive(Clone, Copy, Default)]
pub struct RequestSpan;

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &http::Request<B>) -> Span {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map_or_else(|| request.uri().path(), MatchedPath::as_str);
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .unwrap_or("unknown");

        tracing::info_span!(
            REQUEST_SPAN,
            method = %request.method(),
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    }
}

#[derive(Clone, Copy, Default)]
pub struct RequestDone;

impl<B> OnResponse<B> for RequestDone
where
    B: HttpBody,
{
    fn on_response(self, response: &http::Response<B>, latency: Duration, span: &Span) {
        let status = response.status().as_u16();
        let latency_ms = latency.as_secs_f64() * 1000.0;
        span.record("status_code", status);
        span.record("latency_ms", latency_ms);
        tracing::debug!(parent: span, status, latency_ms, "request completed");
    }
}

/// Copies the `request_id` field of a request span into its extensions so
/// the formatter can find it for nested events.
struct RequestIdTagger;

struct SpanRequestId(String);

#[derive(Default)]
struct RequestIdField(Option<String>);

impl Visit for RequestIdField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.0 = Some(value.to_owned());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.0.is_none() {
            self.0 = Some(format!("{value:?}").trim_matches('"').to_owned());
        }
    }
}

impl<S> Layer<S> for RequestIdTagger
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut field = RequestIdField::default();
        attrs.record(&mut field);
        let (Some(request_id), Some(span)) = (field.0, ctx.span(id)) else {
            return;
        };
        span.extensions_mut().insert(SpanRequestId(request_id));
    }
}

/// Prefixes events with the request id of the closest tagged ancestor span.
struct Tagged<E>(E);

impl<S, N, E> FormatEvent<S, N> for Tagged<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(scope) = ctx.event_scope() {
            for span in scope {
                if let Some(SpanRequestId(request_id)) = span.extensions().get::<SpanRequestId>() {
                    write!(writer, "[request_id={request_id}] ")?;
                    break;
                }
            }
        }
        self.0.format_event(ctx, writer, event)
    }
}
