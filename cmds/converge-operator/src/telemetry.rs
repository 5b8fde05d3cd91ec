//! Logging and trace export for the operator process.

use std::io::IsTerminal;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::{trace::SdkTracerProvider, Resource};
use tracing::Level;
use tracing_subscriber::{
	layer::SubscriberExt, registry::LookupSpan, util::SubscriberInitExt, EnvFilter, Layer,
};

const SERVICE_NAME: &str = "converge-operator";

/// Flushes pending spans when dropped. Keep it alive for the whole process.
pub struct TelemetryGuard {
	tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
	fn drop(&mut self) {
		let Some(provider) = self.tracer_provider.take() else {
			return;
		};
		if let Err(e) = provider.shutdown() {
			eprintln!("failed to flush traces: {e}");
		}
	}
}

fn otlp_configured() -> bool {
	[
		opentelemetry_otlp::OTEL_EXPORTER_OTLP_ENDPOINT,
		opentelemetry_otlp::OTEL_EXPORTER_OTLP_TRACES_ENDPOINT,
	]
	.iter()
	.any(|var| std::env::var_os(var).is_some())
}

/// Install the global subscriber.
///
/// `--log-level` wins over `RUST_LOG`, which wins over `info`. Output is pretty on a
/// terminal and JSON lines otherwise. Spans are exported over OTLP when an OTLP endpoint
/// is set in the environment.
pub fn init(log_level: Option<Level>) -> Result<TelemetryGuard> {
	let filter = match log_level {
		Some(level) => EnvFilter::new(level.as_str()),
		None => EnvFilter::builder()
			.with_default_directive(Level::INFO.into())
			.from_env_lossy(),
	};

	let output = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
	let output = if std::io::stderr().is_terminal() {
		output.pretty().boxed()
	} else {
		output.json().boxed()
	};

	let registry = tracing_subscriber::registry().with(filter).with(output);
	if !otlp_configured() {
		registry.init();
		return Ok(TelemetryGuard {
			tracer_provider: None,
		});
	}

	let (layer, provider) = otlp_layer()?;
	registry.with(layer).init();
	Ok(TelemetryGuard {
		tracer_provider: Some(provider),
	})
}

fn otlp_layer<S>() -> Result<(impl Layer<S>, SdkTracerProvider)>
where
	S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
	// OTEL_SERVICE_NAME and OTEL_RESOURCE_ATTRIBUTES are read by the builder itself
	let mut resource = Resource::builder();
	if std::env::var_os("OTEL_SERVICE_NAME").is_none() {
		resource = resource.with_service_name(SERVICE_NAME);
	}

	let protocol = std::env::var(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL);
	let exporter = match protocol
		.as_deref()
		.unwrap_or(opentelemetry_otlp::OTEL_EXPORTER_OTLP_PROTOCOL_DEFAULT)
	{
		"grpc" => opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.build(),
		_ => opentelemetry_otlp::SpanExporter::builder()
			.with_http()
			.build(),
	}
	.context("building OTLP span exporter")?;

	let provider = SdkTracerProvider::builder()
		.with_resource(resource.build())
		.with_batch_exporter(exporter)
		.build();
	opentelemetry::global::set_tracer_provider(provider.clone());

	let layer = tracing_opentelemetry::layer()
		.with_error_records_to_exceptions(true)
		.with_tracer(provider.tracer(SERVICE_NAME));
	Ok((layer, provider))
}
