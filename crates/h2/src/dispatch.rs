//! Per-stream request classification: reads the two control
//! headers that tell the connection what kind of stream this is, since the
//! h2 crate only gives us method/uri/headers, not an explicit stream-kind
//! field.

use tunnel_transport::RequestKind;

pub(crate) const PROXY_CONNECTION_UPGRADE: &str = "cf-cloudflared-proxy-connection-upgrade";
const PROXY_SRC: &str = "cf-cloudflared-proxy-src";

pub fn classify_request(headers: &http::HeaderMap) -> RequestKind {
	let upgrade = headers
		.get(PROXY_CONNECTION_UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase());

	match upgrade.as_deref() {
		Some("websocket") => RequestKind::WebSocket,
		Some("control-stream") => RequestKind::ControlStream,
		Some("update-configuration") => RequestKind::ConfigurationUpdate,
		_ => {
			if headers.contains_key(PROXY_SRC) {
				RequestKind::Tcp
			} else {
				RequestKind::Http
			}
		},
	}
}

/// Reconstructs the pseudo/regular header tuples `tunnel_wire::header_codec`
/// expects from an already-parsed `http::Request`. h2 strips `:method`,
/// `:authority`, `:path`, `:scheme` out into typed fields, so they're put
/// back as the literal pseudo-header names the codec matches on.
pub fn to_mux_headers(method: &http::Method, uri: &http::Uri, headers: &http::HeaderMap) -> Vec<(String, String)> {
	let mut out = Vec::with_capacity(headers.len() + 3);
	out.push((":method".to_string(), method.as_str().to_string()));
	if let Some(authority) = uri.authority() {
		out.push((":authority".to_string(), authority.as_str().to_string()));
	}
	out.push((":path".to_string(), uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| "/".to_string())));

	for (name, value) in headers {
		if let Ok(value) = value.to_str() {
			out.push((name.as_str().to_string(), value.to_string()));
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	fn headers_with(pairs: &[(&str, &str)]) -> http::HeaderMap {
		let mut map = http::HeaderMap::new();
		for (k, v) in pairs {
			map.insert(http::HeaderName::from_bytes(k.as_bytes()).unwrap(), http::HeaderValue::from_str(v).unwrap());
		}
		map
	}

	#[test]
	fn websocket_upgrade_is_classified_as_websocket() {
		let headers = headers_with(&[(PROXY_CONNECTION_UPGRADE, "websocket")]);
		assert_eq!(classify_request(&headers), RequestKind::WebSocket);
	}

	#[test]
	fn control_stream_upgrade_is_classified() {
		let headers = headers_with(&[(PROXY_CONNECTION_UPGRADE, "control-stream")]);
		assert_eq!(classify_request(&headers), RequestKind::ControlStream);
	}

	#[test]
	fn configuration_update_upgrade_is_classified() {
		let headers = headers_with(&[(PROXY_CONNECTION_UPGRADE, "update-configuration")]);
		assert_eq!(classify_request(&headers), RequestKind::ConfigurationUpdate);
	}

	#[test]
	fn proxy_src_without_upgrade_is_tcp() {
		let headers = headers_with(&[(PROXY_SRC, "10.0.0.1:9000")]);
		assert_eq!(classify_request(&headers), RequestKind::Tcp);
	}

	#[test]
	fn plain_request_is_http() {
		let headers = headers_with(&[("content-type", "text/plain")]);
		assert_eq!(classify_request(&headers), RequestKind::Http);
	}
}
