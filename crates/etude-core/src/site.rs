//! Virtual-host and MIME lookup used by the static-file responder.

use crate::config::HostConfig;
use std::collections::HashMap;
use std::path::Path;

/// Host name used when the request names an unknown host.
pub const DEFAULT_HOST: &str = "default";

/// Maps a host name (port already stripped) to its document root.
pub trait HostResolver {
    fn resolve(&self, host: &str) -> Option<&HostConfig>;
}

pub trait MimeResolver {
    fn mime_type(&self, path: &Path) -> String;
}

/// Host table from configuration.
#[derive(Debug, Clone, Default)]
pub struct VirtualHosts {
    hosts: HashMap<String, HostConfig>,
}

impl VirtualHosts {
    pub fn new(hosts: HashMap<String, HostConfig>) -> Self {
        let hosts = hosts
            .into_iter()
            .map(|(name, config)| (name.to_ascii_lowercase(), config))
            .collect();
        Self { hosts }
    }

    pub fn with_host(mut self, name: &str, config: HostConfig) -> Self {
        self.hosts.insert(name.to_ascii_lowercase(), config);
        self
    }
}

impl HostResolver for VirtualHosts {
    fn resolve(&self, host: &str) -> Option<&HostConfig> {
        self.hosts.get(&host.to_ascii_lowercase())
    }
}

/// Extension-based lookup through `mime_guess`.
#[derive(Debug, Clone, Copy, Default)]
pub struct GuessMime;

impl MimeResolver for GuessMime {
    fn mime_type(&self, path: &Path) -> String {
        mime_guess::from_path(path)
            .first_or_octet_stream()
            .to_string()
    }
}

/// Everything the responder needs to serve files.
pub struct StaticSite {
    hosts: Box<dyn HostResolver>,
    mime: Box<dyn MimeResolver>,
}

impl StaticSite {
    pub fn new(hosts: impl HostResolver + 'static) -> Self {
        Self {
            hosts: Box::new(hosts),
            mime: Box::new(GuessMime),
        }
    }

    pub fn with_mime(mut self, mime: impl MimeResolver + 'static) -> Self {
        self.mime = Box::new(mime);
        self
    }

    /// Serve everything from one directory.
    pub fn single_root(root: impl Into<std::path::PathBuf>) -> Self {
        Self::new(VirtualHosts::default().with_host(DEFAULT_HOST, HostConfig::new(root)))
    }

    /// Resolve the `Host` header value, falling back to [`DEFAULT_HOST`].
    pub fn host(&self, host_header: Option<&str>) -> Option<&HostConfig> {
        let name = host_header.map(strip_port).unwrap_or(DEFAULT_HOST);
        self.hosts
            .resolve(name)
            .or_else(|| self.hosts.resolve(DEFAULT_HOST))
    }

    pub fn mime_type(&self, path: &Path) -> String {
        self.mime.mime_type(path)
    }
}

fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split_once(']').map_or(host, |(ip, _)| ip);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_lookup_strips_port_and_falls_back() {
        let site = StaticSite::new(
            VirtualHosts::default()
                .with_host("example.com", HostConfig::new("/srv/example"))
                .with_host(DEFAULT_HOST, HostConfig::new("/srv/default")),
        );
        assert_eq!(
            site.host(Some("Example.com:8080")).unwrap().root,
            Path::new("/srv/example")
        );
        assert_eq!(
            site.host(Some("other.org")).unwrap().root,
            Path::new("/srv/default")
        );
        assert_eq!(site.host(None).unwrap().root, Path::new("/srv/default"));
    }

    #[test]
    fn test_unknown_host_without_default() {
        let site = StaticSite::new(
            VirtualHosts::default().with_host("example.com", HostConfig::new("/srv")),
        );
        assert!(site.host(Some("other.org")).is_none());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("a.b:80"), "a.b");
        assert_eq!(strip_port("[::1]:80"), "::1");
        assert_eq!(strip_port("a.b"), "a.b");
    }

    #[test]
    fn test_guess_mime() {
        assert_eq!(GuessMime.mime_type(Path::new("a/index.html")), "text/html");
        assert_eq!(GuessMime.mime_type(Path::new("x.png")), "image/png");
        assert_eq!(
            GuessMime.mime_type(Path::new("blob")),
            "application/octet-stream"
        );
    }
}
