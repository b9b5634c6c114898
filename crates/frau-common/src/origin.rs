//! ---
//! frau_section: "01-core-functionality"
//! frau_subsection: "module"
//! frau_type: "source"
//! frau_scope: "code"
//! frau_description: "Shared primitives and utilities for frau ports."
//! frau_version: "v0.0.0-prealpha"
//! frau_owner: "tbd"
//! ---
use url::Url;

/// Target origin accepting messages from, and posting to, any origin.
pub const WILDCARD_ORIGIN: &str = "*";

/// Extract the `scheme://host[:port]` origin from an embeddable source URL.
///
/// Only `http` and `https` sources have an origin usable as a post target.
/// Protocol-relative sources (`//child.example/app`) borrow `default_scheme`.
/// Default ports are omitted from the result, matching how inbound message
/// origins are reported.
pub fn extract_origin(src: &str, default_scheme: &str) -> Option<String> {
    let src = src.trim();
    let absolute = if src.starts_with("//") {
        format!("{}:{}", default_scheme.trim_end_matches(':'), src)
    } else {
        src.to_owned()
    };

    let url = Url::parse(&absolute).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    Some(url.origin().ascii_serialization())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_origin_from_absolute_urls() {
        assert_eq!(
            extract_origin("https://child.example.com/app/index.html?x=1", "https").as_deref(),
            Some("https://child.example.com")
        );
        assert_eq!(
            extract_origin("http://localhost:8080/frame", "https").as_deref(),
            Some("http://localhost:8080")
        );
    }

    #[test]
    fn protocol_relative_sources_use_default_scheme() {
        assert_eq!(
            extract_origin("//cdn.example.com/frame", "http:").as_deref(),
            Some("http://cdn.example.com")
        );
    }

    #[test]
    fn rejects_sources_without_http_origin() {
        assert!(extract_origin("/relative/path", "https").is_none());
        assert!(extract_origin("file:///tmp/frame.html", "https").is_none());
        assert!(extract_origin("", "https").is_none());
    }

    #[test]
    fn default_port_is_dropped() {
        assert_eq!(
            extract_origin("HTTPS://Child.Example.com:443/x", "https").as_deref(),
            Some("https://child.example.com")
        );
    }
}
