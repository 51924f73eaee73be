use crate::query::index::parse_tag;
use dicom::core::Tag;
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: ServerConfig,
	pub qido: QidoConfig,
	pub backend: BackendConfig,
}

impl AppConfig {
	/// Loads the configuration.
	///
	/// Sources in order of precedence:
	/// 1. Environment variables prefixed with `DICOM_QIDO`, e.g. `DICOM_QIDO__SERVER__HTTP__PORT`
	/// 2. `config.toml` in the working directory
	/// 3. The embedded defaults
	///
	/// # Errors
	/// Fails if a source cannot be read or the merged configuration is invalid.
	pub fn new() -> Result<Self, config::ConfigError> {
		config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(
				config::Environment::with_prefix("DICOM_QIDO")
					.prefix_separator("__")
					.separator("__")
					.list_separator(",")
					.with_list_parse_key("qido.numeric_tags")
					.try_parsing(true),
			)
			.build()?
			.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	/// Default log level. Can be overridden with `RUST_LOG`.
	#[serde(deserialize_with = "deserialize_level")]
	pub level: tracing::Level,
	/// Sentry DSN. Sentry is disabled if absent.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
	pub http: HttpServerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpServerConfig {
	pub interface: IpAddr,
	pub port: u16,
	pub base_path: String,
	/// Request timeout in seconds.
	pub request_timeout: u64,
	pub graceful_shutdown: bool,
	/// The externally visible URL of the server, if it runs behind a reverse proxy.
	/// Retrieve URLs are derived from it instead of the `Host` header.
	pub public_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QidoConfig {
	/// Upper bound for the number of matches in one response. `0` disables the bound.
	pub max_results: usize,
	/// Attributes whose values are written as JSON numbers.
	#[serde(deserialize_with = "deserialize_tags")]
	pub numeric_tags: Vec<Tag>,
	/// The path segment that ends the service root of retrieve URLs.
	pub api_root_marker: String,
}

impl Default for QidoConfig {
	fn default() -> Self {
		Self {
			max_results: 100,
			numeric_tags: Vec::new(),
			api_root_marker: String::from("rs"),
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackendConfig {
	/// Serves DICOM JSON documents from a directory (or a single file).
	Memory { path: Option<PathBuf> },
}

fn deserialize_level<'de, D>(deserializer: D) -> Result<tracing::Level, D::Error>
where
	D: Deserializer<'de>,
{
	let level = String::deserialize(deserializer)?;
	level.parse().map_err(serde::de::Error::custom)
}

fn deserialize_tags<'de, D>(deserializer: D) -> Result<Vec<Tag>, D::Error>
where
	D: Deserializer<'de>,
{
	Vec::<String>::deserialize(deserializer)?
		.into_iter()
		.map(|value| {
			parse_tag(&value)
				.ok_or_else(|| serde::de::Error::custom(format!("unknown attribute {value}")))
		})
		.collect()
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use dicom::dictionary_std::tags;

	pub fn from_toml(toml: &str) -> Result<AppConfig, config::ConfigError> {
		config::Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::from_str(toml, config::FileFormat::Toml))
			.build()?
			.try_deserialize()
	}

	#[test]
	fn defaults_are_valid() {
		let config = from_toml("").unwrap();
		assert_eq!(config.qido.max_results, 100);
		assert_eq!(config.qido.api_root_marker, "rs");
		assert!(config.qido.numeric_tags.is_empty());
		assert_eq!(config.telemetry.level, tracing::Level::INFO);
		assert!(matches!(config.backend, BackendConfig::Memory { .. }));
	}

	#[test]
	fn numeric_tags_accept_keywords_and_hex() {
		let config = from_toml(
			r#"
			[qido]
			numeric_tags = ["StudyID", "00200011"]
			"#,
		)
		.unwrap();
		assert_eq!(
			config.qido.numeric_tags,
			vec![tags::STUDY_ID, tags::SERIES_NUMBER]
		);
	}

	#[test]
	fn unknown_numeric_tag_is_rejected() {
		assert!(from_toml("[qido]\nnumeric_tags = [\"NotAnAttribute\"]").is_err());
	}
}
