//! Rewrites absolute upstream links so browsers keep talking to the gateway

use regex::{Captures, Regex};
use url::Url;

/// Attributes whose values are URLs
const URL_ATTRIBUTES: &str = "href|src|action|data-src|data-href";

#[derive(Debug, Clone)]
pub struct LinkRewriter {
    /// Upstream prefix without scheme, e.g. `app.example.com/base`
    upstream_authority: String,
    public_base: String,
    attribute_pattern: Regex,
}

impl LinkRewriter {
    /// Build a rewriter mapping `upstream` onto `public_base`
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream has no host or the pattern cannot be compiled
    pub fn new(upstream: &Url, public_base: &str) -> anyhow::Result<Self> {
        let host = upstream
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("upstream URL {upstream} has no host"))?;
        let mut authority = match upstream.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        authority.push_str(upstream.path().trim_end_matches('/'));

        // attr= and optional quote, optional scheme, //authority, then a delimiter
        let pattern = format!(
            r#"(?i)(\b(?:{URL_ATTRIBUTES})\s*=\s*["']?)(?:https?:)?//{}(?P<rest>[/?#"'\s>]|$)"#,
            regex::escape(&authority)
        );

        Ok(Self {
            upstream_authority: authority,
            public_base: public_base.trim_end_matches('/').to_string(),
            attribute_pattern: Regex::new(&pattern)?,
        })
    }

    /// Rewrite URL attributes in an HTML document
    #[must_use]
    pub fn rewrite_html(&self, html: &str) -> String {
        self.attribute_pattern
            .replace_all(html, |caps: &Captures<'_>| {
                let rest = caps.name("rest").map_or("", |m| m.as_str());
                let slash = if rest.starts_with('/') { "" } else { "/" };
                format!("{}{}{slash}{rest}", &caps[1], self.public_base)
            })
            .into_owned()
    }

    /// Rewrite a `Location` header pointing at the upstream
    #[must_use]
    pub fn rewrite_location(&self, location: &str) -> Option<String> {
        let without_scheme = location
            .strip_prefix("https:")
            .or_else(|| location.strip_prefix("http:"))
            .unwrap_or(location);
        let after = without_scheme
            .strip_prefix("//")?
            .strip_prefix(self.upstream_authority.as_str())?;
        if !(after.is_empty() || after.starts_with(['/', '?', '#'])) {
            return None;
        }
        let after = if after.is_empty() { "/" } else { after };
        Some(format!("{}{after}", self.public_base))
    }
}
