//! Header codec: bit-exact translation between multiplex-frame
//! pseudo-headers and standard HTTP request/response headers, with the
//! user-header serialization format shared by both directions.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;

const REQUEST_HEADERS_HEADER: &str = "cf-cloudflared-request-headers";
const RESPONSE_HEADERS_HEADER: &str = "cf-cloudflared-response-headers";
const RESPONSE_META_HEADER: &str = "cf-cloudflared-response-meta";

const WEBSOCKET_PRESERVED: &[&str] = &["sec-websocket-accept", "connection", "upgrade"];
const STREAMING_CONTENT_TYPES: &[&str] = &["text/event-stream", "application/grpc", "application/x-ndjson"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HeaderCodecError {
	#[error("unparseable content length")]
	UnparseableContentLength,
	#[error("invalid path {0:?}")]
	InvalidPath(String),
	#[error("Unable to deserialize headers")]
	Deserialize,
}

/// One pseudo/control/user header as seen on the multiplex frame.
pub type MuxHeader = (String, String);

/// Result of decoding a request's multiplex headers into application
/// terms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedRequest {
	pub method: Option<String>,
	pub host: Option<String>,
	/// Origin base URL with the `:path` value appended (or the literal
	/// `*`).
	pub url: String,
	pub content_length: Option<i64>,
	/// cf- passthrough headers plus the decoded user headers, in
	/// encounter order. `cf-cloudflared-request-headers` itself is never
	/// forwarded.
	pub headers: Vec<(String, String)>,
}

/// Source tag for the response-meta header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
	Origin,
	Cloudflared,
	FlowRateLimited,
}

impl ResponseSource {
	fn src_value(&self) -> &'static str {
		match self {
			ResponseSource::Origin => "origin",
			ResponseSource::Cloudflared => "cloudflared",
			ResponseSource::FlowRateLimited => "flow-rate-limited",
		}
	}

	pub fn meta_header_value(&self) -> String {
		format!(r#"{{"src":"{}"}}"#, self.src_value())
	}
}

/// `b64(name) ':' b64(value)` pairs joined by `;`, raw-standard base-64
/// without padding. `serialize({}) == ""`.
pub fn serialize_user_headers(headers: &[(String, String)]) -> String {
	headers
		.iter()
		.map(|(name, value)| format!("{}:{}", STANDARD_NO_PAD.encode(name), STANDARD_NO_PAD.encode(value)))
		.collect::<Vec<_>>()
		.join(";")
}

/// Inverse of [`serialize_user_headers`]. Malformed input — any segment
/// that does not split into exactly two `:`-delimited base64 parts, or
/// either part failing to decode — fails with
/// [`HeaderCodecError::Deserialize`].
pub fn deserialize_user_headers(serialized: &str) -> Result<Vec<(String, String)>, HeaderCodecError> {
	if serialized.is_empty() {
		return Ok(Vec::new());
	}
	serialized
		.split(';')
		.map(|pair| {
			let parts: Vec<&str> = pair.split(':').collect();
			if parts.len() != 2 {
				return Err(HeaderCodecError::Deserialize);
			}
			let name = STANDARD_NO_PAD
				.decode(parts[0])
				.map_err(|_| HeaderCodecError::Deserialize)?;
			let value = STANDARD_NO_PAD
				.decode(parts[1])
				.map_err(|_| HeaderCodecError::Deserialize)?;
			let name = String::from_utf8(name).map_err(|_| HeaderCodecError::Deserialize)?;
			let value = String::from_utf8(value).map_err(|_| HeaderCodecError::Deserialize)?;
			Ok((name, value))
		})
		.collect()
}

fn is_control_request_header(lower_name: &str) -> bool {
	lower_name.starts_with(':') || lower_name == "content-length" || lower_name == "connection" || lower_name == "upgrade"
}

/// Edge -> origin.
pub fn decode_request(headers: &[MuxHeader], origin_base_url: &str) -> Result<DecodedRequest, HeaderCodecError> {
	let mut out = DecodedRequest {
		url: origin_base_url.to_string(),
		..Default::default()
	};
	let mut serialized_user_headers: Option<&str> = None;

	for (name, value) in headers {
		let lower = name.to_ascii_lowercase();
		match lower.as_str() {
			":method" => out.method = Some(value.clone()),
			":authority" => out.host = Some(value.clone()),
			":scheme" => {
				// Intentionally ignored; the origin rule's scheme always wins
				//.
			},
			":path" => {
				if value == "*" {
					out.url = value.clone();
				} else {
					if !value.starts_with('/') {
						return Err(HeaderCodecError::InvalidPath(value.clone()));
					}
					out.url = format!("{}{}", origin_base_url.trim_end_matches('/'), value);
				}
			},
			"content-length" => {
				out.content_length = Some(value.parse::<i64>().map_err(|_| HeaderCodecError::UnparseableContentLength)?);
			},
			REQUEST_HEADERS_HEADER => {
				serialized_user_headers = Some(value.as_str());
			},
			_ if is_control_request_header(&lower) => {
				// connection/upgrade/other pseudo-headers drive request shape
				// elsewhere (kind dispatch); never forwarded as user headers.
			},
			_ if lower.starts_with("cf-") => out.headers.push((lower, value.clone())),
			_ => {},
		}
	}

	if let Some(serialized) = serialized_user_headers {
		out.headers.extend(deserialize_user_headers(serialized)?);
	}

	Ok(out)
}

/// Origin -> edge. Returns the ordered
/// multiplex headers to send, including `:status`, `content-length` when
/// present, preserved websocket headers, the grouped serialized user
/// headers, and the response-meta header.
pub fn encode_response(status: u16, headers: &[(String, String)], source: ResponseSource) -> Vec<MuxHeader> {
	let mut out = Vec::with_capacity(headers.len() + 3);
	out.push((":status".to_string(), status.to_string()));

	let mut user_headers = Vec::new();
	for (name, value) in headers {
		let lower = name.to_ascii_lowercase();
		if lower == "content-length" {
			out.push(("content-length".to_string(), value.clone()));
		} else if WEBSOCKET_PRESERVED.contains(&lower.as_str()) {
			out.push((lower, value.clone()));
		} else {
			user_headers.push((lower, value.clone()));
		}
	}

	if !user_headers.is_empty() {
		out.push((RESPONSE_HEADERS_HEADER.to_string(), serialize_user_headers(&user_headers)));
	}
	out.push((RESPONSE_META_HEADER.to_string(), source.meta_header_value()));
	out
}

/// Whether a plain-HTTP response should flush after every write.
pub fn should_flush_http(content_type: Option<&str>, content_length: Option<i64>, transfer_encoding: Option<&str>) -> bool {
	let streaming = content_type
		.map(|ct| {
			let ct = ct.trim().to_ascii_lowercase();
			STREAMING_CONTENT_TYPES.iter().any(|known| ct.starts_with(known))
		})
		.unwrap_or(false);
	let missing_or_negative_length = !matches!(content_length, Some(n) if n >= 0);
	let chunked = transfer_encoding.map(|te| te.eq_ignore_ascii_case("chunked")).unwrap_or(false);
	streaming || missing_or_negative_length || chunked
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashSet;

	fn as_multiset(headers: &[(String, String)]) -> HashSet<(String, String)> {
		headers.iter().cloned().collect()
	}

	#[test]
	fn round_trips_as_a_multiset() {
		let headers = vec![
			("X-Foo".to_string(), "bar".to_string()),
			("X-Repeat".to_string(), "1".to_string()),
			("X-Repeat".to_string(), "2".to_string()),
		];
		let serialized = serialize_user_headers(&headers);
		let round_tripped = deserialize_user_headers(&serialized).unwrap();
		assert_eq!(as_multiset(&headers), as_multiset(&round_tripped));
	}

	#[test]
	fn empty_map_serializes_to_empty_string() {
		assert_eq!(serialize_user_headers(&[]), "");
		assert_eq!(deserialize_user_headers("").unwrap(), Vec::<(String, String)>::new());
	}

	#[test]
	fn malformed_serialized_headers_fail_to_deserialize() {
		assert_eq!(deserialize_user_headers("::"), Err(HeaderCodecError::Deserialize));
		assert_eq!(deserialize_user_headers("abc"), Err(HeaderCodecError::Deserialize));
		assert_eq!(deserialize_user_headers("a:b:c"), Err(HeaderCodecError::Deserialize));
	}

	#[test]
	fn decodes_method_authority_and_path() {
		let headers = vec![
			(":method".to_string(), "GET".to_string()),
			(":authority".to_string(), "example.com".to_string()),
			(":scheme".to_string(), "https".to_string()),
			(":path".to_string(), "/foo/bar".to_string()),
		];
		let decoded = decode_request(&headers, "http://localhost:8080/").unwrap();
		assert_eq!(decoded.method.as_deref(), Some("GET"));
		assert_eq!(decoded.host.as_deref(), Some("example.com"));
		assert_eq!(decoded.url, "http://localhost:8080/foo/bar");
	}

	#[test]
	fn path_star_is_copied_verbatim() {
		let headers = vec![(":path".to_string(), "*".to_string())];
		let decoded = decode_request(&headers, "http://localhost:8080").unwrap();
		assert_eq!(decoded.url, "*");
	}

	#[test]
	fn malformed_path_is_rejected() {
		let headers = vec![(":path".to_string(), "no-leading-slash".to_string())];
		assert_eq!(
			decode_request(&headers, "http://localhost:8080"),
			Err(HeaderCodecError::InvalidPath("no-leading-slash".to_string()))
		);
	}

	#[test]
	fn unparseable_content_length_is_rejected() {
		let headers = vec![("content-length".to_string(), "not-a-number".to_string())];
		assert_eq!(
			decode_request(&headers, "http://localhost:8080"),
			Err(HeaderCodecError::UnparseableContentLength)
		);
	}

	#[test]
	fn request_headers_header_decodes_and_is_not_forwarded() {
		let serialized = serialize_user_headers(&[("X-User".to_string(), "hi".to_string())]);
		let headers = vec![(REQUEST_HEADERS_HEADER.to_string(), serialized)];
		let decoded = decode_request(&headers, "http://localhost:8080").unwrap();
		assert_eq!(decoded.headers, vec![("x-user".to_string(), "hi".to_string())]);
	}

	#[test]
	fn cf_headers_pass_through_verbatim() {
		let headers = vec![("CF-Ray".to_string(), "abc123".to_string())];
		let decoded = decode_request(&headers, "http://localhost:8080").unwrap();
		assert_eq!(decoded.headers, vec![("cf-ray".to_string(), "abc123".to_string())]);
	}

	#[test]
	fn response_emits_status_and_content_length() {
		let headers = vec![("Content-Length".to_string(), "5".to_string())];
		let out = encode_response(200, &headers, ResponseSource::Origin);
		assert!(out.contains(&(":status".to_string(), "200".to_string())));
		assert!(out.contains(&("content-length".to_string(), "5".to_string())));
	}

	#[test]
	fn response_preserves_websocket_headers_and_groups_the_rest() {
		let headers = vec![
			("Sec-WebSocket-Accept".to_string(), "abc".to_string()),
			("X-Extra".to_string(), "1".to_string()),
		];
		let out = encode_response(101, &headers, ResponseSource::Origin);
		assert!(out.contains(&("sec-websocket-accept".to_string(), "abc".to_string())));
		assert!(out.iter().any(|(k, _)| k == RESPONSE_HEADERS_HEADER));
	}

	#[test]
	fn response_meta_distinguishes_source() {
		assert_eq!(ResponseSource::Origin.meta_header_value(), r#"{"src":"origin"}"#);
		assert_eq!(ResponseSource::Cloudflared.meta_header_value(), r#"{"src":"cloudflared"}"#);
		assert_eq!(
			ResponseSource::FlowRateLimited.meta_header_value(),
			r#"{"src":"flow-rate-limited"}"#
		);
	}

	#[test]
	fn flush_policy_combines_content_type_length_and_encoding() {
		assert!(should_flush_http(Some("text/event-stream"), Some(5), None));
		assert!(should_flush_http(Some("text/plain"), None, None));
		assert!(should_flush_http(Some("text/plain"), Some(-1), None));
		assert!(should_flush_http(Some("text/plain"), Some(5), Some("chunked")));
		assert!(!should_flush_http(Some("text/plain"), Some(5), None));
	}
}
