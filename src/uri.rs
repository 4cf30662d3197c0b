use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use url::Url;

static SERVICE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/([A-Z]+)(/.*)?$").expect("valid service path pattern"));

/// Whether `name` can be registered as a service
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_uppercase())
}

/// A URI under the gateway scheme split into its routing parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUri {
    pub service: String,
    /// Everything after the service segment, starting with `/` or empty
    pub path: String,
    pub query: Option<String>,
    /// Caller context echoed into derived URIs, never part of a cache key
    pub fragment: Option<String>,
}

impl ServiceUri {
    /// Split `scheme:/SERVICE/rest?query#fragment`
    ///
    /// The rest of the path is percent-decoded; `None` if that is not UTF-8.
    pub fn parse(url: &Url) -> Option<Self> {
        let captures = SERVICE_PATH.captures(url.path())?;
        let path = match captures.get(2) {
            Some(rest) => percent_decode_str(rest.as_str()).decode_utf8().ok()?.into_owned(),
            None => String::new(),
        };
        Some(Self {
            service: captures[1].to_string(),
            path,
            query: url.query().map(str::to_string),
            fragment: url.fragment().map(str::to_string),
        })
    }

    /// URI of a listed member, stamped with this URI's fragment
    ///
    /// Members starting with `/` are absolute within the service; anything
    /// else is appended to this URI's path. Every segment is percent-encoded.
    pub fn member_url(&self, scheme: &str, member: &str) -> Option<String> {
        let mut url = Url::parse(&service_root(scheme, &self.service, None)).ok()?;
        {
            let mut segments = url.path_segments_mut().ok()?;
            if let Some(absolute) = member.strip_prefix('/') {
                segments.extend(absolute.split('/'));
            } else {
                let base = self.path.trim_matches('/');
                if !base.is_empty() {
                    segments.extend(base.split('/'));
                }
                segments.extend(member.split('/'));
            }
        }
        url.set_fragment(self.fragment.as_deref());
        Some(url.to_string())
    }
}

/// Root URI of a service, optionally for one workspace
pub fn service_root(scheme: &str, service: &str, fragment: Option<&str>) -> String {
    match fragment {
        Some(fragment) => format!("{}:/{}#{}", scheme, service, fragment),
        None => format!("{}:/{}", scheme, service),
    }
}
