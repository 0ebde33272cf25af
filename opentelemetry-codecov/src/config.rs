use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use opentelemetry::otel_warn;
use opentelemetry::trace::SpanKind;

use crate::error::Error;

/// Default Codecov API base.
const DEFAULT_ENDPOINT: &str = "https://api.codecov.io";

/// Default probability that an eligible span becomes the capture owner.
const DEFAULT_SAMPLE_RATE: f64 = 0.1;

/// Default upload timeout.
const DEFAULT_EXPORT_TIMEOUT: Duration = Duration::from_millis(10_000);

const ENV_REPOSITORY_TOKEN: &str = "CODECOV_REPOSITORY_TOKEN";
const ENV_SAMPLE_RATE: &str = "CODECOV_SAMPLE_RATE";
const ENV_UNTRACKED_EXPORT_RATE: &str = "CODECOV_UNTRACKED_EXPORT_RATE";
const ENV_ENDPOINT: &str = "CODECOV_ENDPOINT";
const ENV_CODE: &str = "CODECOV_CODE";
const ENV_ENVIRONMENT: &str = "CODECOV_ENVIRONMENT";
const ENV_VERSION_IDENTIFIER: &str = "CODECOV_VERSION_IDENTIFIER";
const ENV_ALLOWED_SPAN_KINDS: &str = "CODECOV_ALLOWED_SPAN_KINDS";
/// Upload timeout in milliseconds.
const ENV_EXPORT_TIMEOUT: &str = "CODECOV_EXPORT_TIMEOUT";
/// Capture timeout in milliseconds; unset disables the watchdog.
const ENV_CAPTURE_TIMEOUT: &str = "CODECOV_CAPTURE_TIMEOUT";
const ENV_COVERAGE_DIR: &str = "CODECOV_COVERAGE_DIR";
/// Where node writes coverage when started with it set.
const ENV_NODE_V8_COVERAGE: &str = "NODE_V8_COVERAGE";

/// Settings shared by the coverage processor and the exporter.
#[derive(Clone, Debug)]
pub struct CodecovConfig {
    pub(crate) repository_token: Option<String>,
    pub(crate) sample_rate: f64,
    pub(crate) untracked_export_rate: f64,
    pub(crate) endpoint: String,
    pub(crate) code: String,
    pub(crate) environment: Option<String>,
    pub(crate) version_identifier: Option<String>,
    pub(crate) allowed_span_kinds: Vec<SpanKind>,
    pub(crate) export_timeout: Duration,
    pub(crate) capture_timeout: Option<Duration>,
    pub(crate) coverage_dir: Option<PathBuf>,
    pub(crate) register_version: bool,
}

impl Default for CodecovConfig {
    fn default() -> Self {
        CodecovConfig {
            repository_token: None,
            sample_rate: DEFAULT_SAMPLE_RATE,
            untracked_export_rate: 0.0,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            code: String::new(),
            environment: None,
            version_identifier: None,
            allowed_span_kinds: Vec::new(),
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            capture_timeout: None,
            coverage_dir: None,
            register_version: true,
        }
    }
}

impl CodecovConfig {
    /// Defaults overridden by any `CODECOV_*` variables that are set.
    ///
    /// Malformed values are reported and ignored.
    pub fn from_env() -> Self {
        let defaults = CodecovConfig::default();
        CodecovConfig {
            repository_token: var(ENV_REPOSITORY_TOKEN),
            sample_rate: rate_var(ENV_SAMPLE_RATE, defaults.sample_rate),
            untracked_export_rate: rate_var(
                ENV_UNTRACKED_EXPORT_RATE,
                defaults.untracked_export_rate,
            ),
            endpoint: var(ENV_ENDPOINT)
                .map(|endpoint| normalize_endpoint(&endpoint))
                .unwrap_or(defaults.endpoint),
            code: var(ENV_CODE).unwrap_or(defaults.code),
            environment: var(ENV_ENVIRONMENT),
            version_identifier: var(ENV_VERSION_IDENTIFIER),
            allowed_span_kinds: var(ENV_ALLOWED_SPAN_KINDS)
                .map(|kinds| parse_span_kinds(&kinds))
                .unwrap_or_default(),
            export_timeout: millis_var(ENV_EXPORT_TIMEOUT).unwrap_or(defaults.export_timeout),
            capture_timeout: millis_var(ENV_CAPTURE_TIMEOUT),
            coverage_dir: var(ENV_COVERAGE_DIR)
                .or_else(|| var(ENV_NODE_V8_COVERAGE))
                .map(PathBuf::from),
            register_version: defaults.register_version,
        }
    }

    /// Token sent as `Authorization: Repotoken <token>`.
    pub fn with_repository_token<T: Into<String>>(mut self, token: T) -> Self {
        self.repository_token = Some(token.into());
        self
    }

    /// Probability that a span finding no capture in progress starts one.
    /// Clamped to `[0, 1]`.
    pub fn with_sample_rate(mut self, rate: f64) -> Result<Self, Error> {
        self.sample_rate = checked_rate("sample_rate", rate)?;
        Ok(self)
    }

    /// Probability that a span without coverage is still uploaded.
    /// Clamped to `[0, 1]`.
    pub fn with_untracked_export_rate(mut self, rate: f64) -> Result<Self, Error> {
        self.untracked_export_rate = checked_rate("untracked_export_rate", rate)?;
        Ok(self)
    }

    /// API base, either a URL or a bare hostname.
    pub fn with_endpoint<T: AsRef<str>>(mut self, endpoint: T) -> Self {
        self.endpoint = normalize_endpoint(endpoint.as_ref());
        self
    }

    /// Identifier of this build or run.
    pub fn with_code<T: Into<String>>(mut self, code: T) -> Self {
        self.code = code.into();
        self
    }

    /// Deployment environment, e.g. `production`.
    pub fn with_environment<T: Into<String>>(mut self, environment: T) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Version reported by the startup registration.
    pub fn with_version_identifier<T: Into<String>>(mut self, version: T) -> Self {
        self.version_identifier = Some(version.into());
        self
    }

    /// Only spans of these kinds may capture coverage. Empty allows all.
    pub fn with_allowed_span_kinds<I: IntoIterator<Item = SpanKind>>(mut self, kinds: I) -> Self {
        self.allowed_span_kinds = kinds.into_iter().collect();
        self
    }

    /// Timeout of each upload request.
    pub fn with_export_timeout(mut self, timeout: Duration) -> Self {
        self.export_timeout = timeout;
        self
    }

    /// Release a capture whose span has not ended after `timeout`.
    pub fn with_capture_timeout(mut self, timeout: Duration) -> Self {
        self.capture_timeout = Some(timeout);
        self
    }

    /// Directory the coverage runtime writes its artifacts to.
    pub fn with_coverage_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.coverage_dir = Some(dir.into());
        self
    }

    /// Whether to announce the version to the API when the pipeline is built.
    pub fn with_version_registration(mut self, enabled: bool) -> Self {
        self.register_version = enabled;
        self
    }

    /// Effective capture sample rate.
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Effective untracked export rate.
    pub fn untracked_export_rate(&self) -> f64 {
        self.untracked_export_rate
    }

    /// Normalized API base.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

fn checked_rate(name: &'static str, value: f64) -> Result<f64, Error> {
    if value.is_nan() {
        return Err(Error::InvalidRate { name, value });
    }
    Ok(value.clamp(0.0, 1.0))
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    }
}

fn parse_span_kinds(list: &str) -> Vec<SpanKind> {
    list.split(',')
        .map(str::trim)
        .filter(|kind| !kind.is_empty())
        .filter_map(|kind| match kind.to_ascii_lowercase().as_str() {
            "internal" => Some(SpanKind::Internal),
            "server" => Some(SpanKind::Server),
            "client" => Some(SpanKind::Client),
            "producer" => Some(SpanKind::Producer),
            "consumer" => Some(SpanKind::Consumer),
            _ => {
                otel_warn!(
                    name: "CodecovConfig.UnknownSpanKind",
                    variable = ENV_ALLOWED_SPAN_KINDS,
                    kind = kind.to_string()
                );
                None
            }
        })
        .collect()
}

fn var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parsed_var<T: FromStr>(name: &'static str) -> Option<T> {
    let value = var(name)?;
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            otel_warn!(
                name: "CodecovConfig.MalformedVariable",
                variable = name,
                value = value.as_str()
            );
            None
        }
    }
}

fn rate_var(name: &'static str, default: f64) -> f64 {
    parsed_var(name)
        .and_then(|rate| checked_rate(name, rate).ok())
        .unwrap_or(default)
}

fn millis_var(name: &'static str) -> Option<Duration> {
    parsed_var(name).map(Duration::from_millis)
}
