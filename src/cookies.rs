/* Refract Proxy (AGPL-3.0)

Set-Cookie parsing and serialization for the header translator:
- Parses one Set-Cookie value into name, value, and a typed attribute set
  (RFC 6265 section 5.2 splitting rules).
- Known attributes are typed (Expires as an absolute instant, Max-Age as
  signed seconds, SameSite as an enum); unknown attributes survive verbatim
  so re-emitted cookies lose nothing.
- Serialization round-trips through this parser.
*/

use chrono::{DateTime, Utc};

use crate::utils::{ProxyError, ProxyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSite {
    Strict,
    Lax,
    None,
}

impl SameSite {
    pub fn as_str(self) -> &'static str {
        match self {
            SameSite::Strict => "Strict",
            SameSite::Lax => "Lax",
            SameSite::None => "None",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("strict") {
            Some(SameSite::Strict)
        } else if value.eq_ignore_ascii_case("lax") {
            Some(SameSite::Lax)
        } else if value.eq_ignore_ascii_case("none") {
            Some(SameSite::None)
        } else {
            Option::None
        }
    }
}

/// Typed attribute set of one Set-Cookie header. Unknown attribute names are
/// kept in `extensions` (lower-cased, `None` value for bare flags).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CookieOptions {
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<DateTime<Utc>>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
    pub extensions: Vec<(String, Option<String>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub options: CookieOptions,
}

impl SetCookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            options: CookieOptions::default(),
        }
    }

    /// Parses a single Set-Cookie header value. The first `name=value` pair
    /// is the cookie itself; subsequent `;`-separated tokens are attributes.
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        let mut segments = raw.split(';');

        let pair = segments
            .next()
            .ok_or_else(|| ProxyError::CookieParse("empty header".into()))?;
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| ProxyError::CookieParse(format!("missing '=' in {pair:?}")))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ProxyError::CookieParse("empty cookie name".into()));
        }

        let mut cookie = SetCookie::new(name, value.trim());

        for segment in segments {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            let (attr, attr_value) = match segment.split_once('=') {
                Some((a, v)) => (a.trim(), Some(v.trim())),
                None => (segment, None),
            };
            cookie.apply_attribute(attr, attr_value)?;
        }

        Ok(cookie)
    }

    fn apply_attribute(&mut self, attr: &str, value: Option<&str>) -> ProxyResult<()> {
        let lowered = attr.to_ascii_lowercase();
        let opts = &mut self.options;
        match lowered.as_str() {
            "domain" => {
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    opts.domain = Some(v.to_string());
                }
            }
            "path" => {
                if let Some(v) = value.filter(|v| !v.is_empty()) {
                    opts.path = Some(v.to_string());
                }
            }
            "expires" => {
                let v = value
                    .ok_or_else(|| ProxyError::CookieParse("Expires without a value".into()))?;
                let parsed = DateTime::parse_from_rfc2822(v)
                    .map_err(|e| ProxyError::CookieParse(format!("bad Expires {v:?}: {e}")))?;
                opts.expires = Some(parsed.with_timezone(&Utc));
            }
            "max-age" => {
                let v = value
                    .ok_or_else(|| ProxyError::CookieParse("Max-Age without a value".into()))?;
                let seconds: i64 = v
                    .parse()
                    .map_err(|_| ProxyError::CookieParse(format!("bad Max-Age {v:?}")))?;
                opts.max_age = Some(seconds);
            }
            "secure" => opts.secure = true,
            "httponly" => opts.http_only = true,
            "samesite" => {
                let v = value
                    .ok_or_else(|| ProxyError::CookieParse("SameSite without a value".into()))?;
                opts.same_site = Some(
                    SameSite::parse(v)
                        .ok_or_else(|| ProxyError::CookieParse(format!("bad SameSite {v:?}")))?,
                );
            }
            _ => opts
                .extensions
                .push((lowered, value.map(|v| v.to_string()))),
        }
        Ok(())
    }

    /// Serializes back to a Set-Cookie header value. Guaranteed to re-parse
    /// into an equal cookie under [`SetCookie::parse`].
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        let opts = &self.options;

        if let Some(domain) = &opts.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &opts.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if let Some(expires) = &opts.expires {
            out.push_str("; Expires=");
            out.push_str(&expires.format("%a, %d %b %Y %H:%M:%S GMT").to_string());
        }
        if let Some(max_age) = opts.max_age {
            out.push_str("; Max-Age=");
            out.push_str(&max_age.to_string());
        }
        if opts.secure {
            out.push_str("; Secure");
        }
        if opts.http_only {
            out.push_str("; HttpOnly");
        }
        if let Some(same_site) = opts.same_site {
            out.push_str("; SameSite=");
            out.push_str(same_site.as_str());
        }
        for (name, value) in &opts.extensions {
            out.push_str("; ");
            out.push_str(name);
            if let Some(value) = value {
                out.push('=');
                out.push_str(value);
            }
        }

        out
    }
}
