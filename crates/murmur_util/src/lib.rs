#![forbid(unsafe_code)]

pub mod endpoint {
	use std::fmt;
	use std::net::{IpAddr, SocketAddr};

	/// Listen endpoint given as `http://host:port` or bare `host:port`.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct BindEndpoint {
		/// Host as written; IPv6 literals keep their brackets.
		pub host: String,
		pub port: u16,
	}

	impl fmt::Display for BindEndpoint {
		fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
			write!(f, "{}:{}", self.host, self.port)
		}
	}

	impl BindEndpoint {
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint is empty (expected http://host:port)".to_string());
			}

			let rest = match s.split_once("://") {
				None => s,
				Some((scheme, rest)) if scheme.eq_ignore_ascii_case("http") => rest,
				Some((scheme, _)) => return Err(format!("{s:?}: scheme {scheme:?} is not supported, use http")),
			};

			if let Some(c) = rest.chars().find(|c| matches!(c, '/' | '?' | '#')) {
				return Err(format!("{s:?}: unexpected {c:?}, an endpoint has no path, query or fragment"));
			}

			let (host, port) = split_host_port(rest).ok_or_else(|| format!("{s:?}: expected host:port"))?;
			let port = match port.parse::<u16>() {
				Ok(p) if p != 0 => p,
				_ => return Err(format!("{s:?}: port must be in 1..=65535")),
			};

			Ok(Self {
				host: host.to_string(),
				port,
			})
		}

		/// Socket address for an IP-literal host. Names are not resolved.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			let bare = self.host.trim_start_matches('[').trim_end_matches(']');
			bare.parse::<IpAddr>()
				.map(|ip| SocketAddr::new(ip, self.port))
				.map_err(|_| format!("{:?} is not an IP literal; bind needs an address, not a name", self.host))
		}
	}

	/// Split at the port colon. Unbracketed hosts may not contain `:`.
	fn split_host_port(s: &str) -> Option<(&str, &str)> {
		let (host, port) = if let Some(after) = s.strip_prefix('[') {
			let close = after.find(']')?;
			let port = after[close + 1..].strip_prefix(':')?;
			(&s[..close + 2], port)
		} else {
			let (host, port) = s.rsplit_once(':')?;
			if host.contains(':') {
				return None;
			}
			(host, port)
		};

		let host = host.trim();
		if host.is_empty() || host == "[]" {
			return None;
		}
		Some((host, port.trim()))
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn accepts_scheme_or_bare_form() {
			let a = BindEndpoint::parse("http://127.0.0.1:18480").unwrap();
			let b = BindEndpoint::parse(" 127.0.0.1:18480 ").unwrap();
			assert_eq!(a, b);
			assert_eq!(a.to_string(), "127.0.0.1:18480");
		}

		#[test]
		fn ipv6_must_be_bracketed() {
			let e = BindEndpoint::parse("http://[::1]:8080").unwrap();
			assert_eq!(e.host, "[::1]");
			assert_eq!(e.to_socket_addr_if_ip_literal().unwrap().to_string(), "[::1]:8080");

			assert!(BindEndpoint::parse("http://::1:8080").is_err());
			assert!(BindEndpoint::parse("http://[]:8080").is_err());
		}

		#[test]
		fn rejects_malformed_endpoints() {
			for bad in [
				"",
				"ws://127.0.0.1:1",
				"http://127.0.0.1:8080/",
				"http://127.0.0.1:8080?x=y",
				"http://127.0.0.1",
				"http://127.0.0.1:0",
				"http://127.0.0.1:99999",
				"http://:8080",
			] {
				assert!(BindEndpoint::parse(bad).is_err(), "{bad:?} should not parse");
			}
		}

		#[test]
		fn names_parse_but_do_not_bind() {
			let e = BindEndpoint::parse("http://murmur.example.com:443").unwrap();
			assert_eq!(e.host, "murmur.example.com");
			assert!(e.to_socket_addr_if_ip_literal().is_err());
		}
	}
}
