use std::collections::BTreeMap;
use std::fmt;

use url::Url;

use crate::error::TemplateError;

/// Placeholder names understood by the resource clients.
pub mod params {
    pub const NAME: &str = "Name";
    pub const NAMESPACE: &str = "Namespace";
    pub const LABEL_SELECTOR: &str = "LabelSelector";
    pub const FIELD_SELECTOR: &str = "FieldSelector";
    pub const RESOURCE_VERSION: &str = "ResourceVersion";
    pub const WATCH: &str = "Watch";
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Placeholder {
    name: String,
    optional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct QueryParam {
    key: String,
    value: Part,
}

/// Parsed URL template such as
/// `api/v1/namespaces/{Namespace}/pods/{Name}?labelSelector={LabelSelector?}`.
///
/// A placeholder fills a whole path segment or a whole query value. A
/// trailing `?` makes it optional: when no value is supplied the segment or
/// query parameter is left out entirely. An empty string is a value and is
/// rendered as such.
///
/// Templates are immutable and cheap to share between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestTemplate {
    source: String,
    path: Vec<Part>,
    query: Vec<QueryParam>,
}

/// Values for a template expansion. A name that was never set is absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateParams {
    values: BTreeMap<String, String>,
}

impl TemplateParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name` to `value`. An empty `value` is still present.
    #[must_use]
    pub fn set(mut self, name: &str, value: impl Into<String>) -> Self {
        self.values.insert(name.to_owned(), value.into());
        self
    }

    /// Set `name` when `value` is `Some`, leave it absent otherwise.
    #[must_use]
    pub fn set_opt<V: Into<String>>(self, name: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.set(name, value),
            None => self,
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

impl RequestTemplate {
    /// Parse a template.
    ///
    /// # Errors
    /// Returns `TemplateError::Malformed` for empty path segments, unbalanced
    /// braces, placeholders sharing a segment with literal text, or query
    /// items without a key.
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        let malformed = |reason: &str| TemplateError::Malformed {
            template: template.to_owned(),
            reason: reason.to_owned(),
        };

        let (path, query) = match query_start(template) {
            Some(at) => (&template[..at], Some(&template[at + 1..])),
            None => (template, None),
        };

        let path = path.trim_start_matches('/');
        let mut parts = Vec::new();
        if !path.is_empty() {
            for segment in path.split('/') {
                if segment.is_empty() {
                    return Err(malformed("empty path segment"));
                }
                parts.push(parse_part(segment).map_err(|r| malformed(&r))?);
            }
        }

        let mut params = Vec::new();
        if let Some(query) = query {
            for item in query.split('&') {
                let Some((key, value)) = item.split_once('=') else {
                    return Err(malformed("query item without '='"));
                };
                if key.is_empty() || key.contains(['{', '}']) {
                    return Err(malformed("query key must be a non-empty literal"));
                }
                params.push(QueryParam {
                    key: key.to_owned(),
                    value: parse_part(value).map_err(|r| malformed(&r))?,
                });
            }
        }

        Ok(Self {
            source: template.to_owned(),
            path: parts,
            query: params,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Names of every placeholder, in template order.
    pub fn placeholders(&self) -> impl Iterator<Item = (&str, bool)> {
        self.path
            .iter()
            .chain(self.query.iter().map(|q| &q.value))
            .filter_map(|part| match part {
                Part::Placeholder(p) => Some((p.name.as_str(), p.optional)),
                Part::Literal(_) => None,
            })
    }

    /// Render the template against `base`.
    ///
    /// Path segments are appended to the base path and percent-encoded;
    /// query values are form-encoded. The base URL's own query and fragment
    /// are dropped.
    ///
    /// # Errors
    /// Returns `TemplateError::MissingParameter` when a mandatory placeholder
    /// has no value, or `TemplateError::InvalidBase` when `base` cannot
    /// carry a path.
    pub fn expand(&self, base: &Url, params: &TemplateParams) -> Result<Url, TemplateError> {
        let mut url = base.clone();
        url.set_query(None);
        url.set_fragment(None);

        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| TemplateError::InvalidBase(base.to_string()))?;
            segments.pop_if_empty();
            for part in &self.path {
                if let Some(value) = self.resolve(part, params)? {
                    segments.push(value);
                }
            }
        }

        let mut pairs = Vec::with_capacity(self.query.len());
        for param in &self.query {
            if let Some(value) = self.resolve(&param.value, params)? {
                pairs.push((param.key.as_str(), value));
            }
        }
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        Ok(url)
    }

    fn resolve<'a>(
        &'a self,
        part: &'a Part,
        params: &'a TemplateParams,
    ) -> Result<Option<&'a str>, TemplateError> {
        match part {
            Part::Literal(text) => Ok(Some(text.as_str())),
            Part::Placeholder(p) => match params.get(&p.name) {
                Some(value) => Ok(Some(value)),
                None if p.optional => Ok(None),
                None => Err(TemplateError::MissingParameter {
                    template: self.source.clone(),
                    name: p.name.clone(),
                }),
            },
        }
    }
}

impl fmt::Display for RequestTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Position of the `?` that starts the query, skipping `?` inside braces.
fn query_start(template: &str) -> Option<usize> {
    let mut in_placeholder = false;
    for (i, c) in template.char_indices() {
        match c {
            '{' => in_placeholder = true,
            '}' => in_placeholder = false,
            '?' if !in_placeholder => return Some(i),
            _ => {}
        }
    }
    None
}

fn parse_part(raw: &str) -> Result<Part, String> {
    let Some(inner) = raw.strip_prefix('{') else {
        if raw.contains(['{', '}']) {
            return Err(format!("placeholder must fill the whole item: '{raw}'"));
        }
        return Ok(Part::Literal(raw.to_owned()));
    };
    let Some(inner) = inner.strip_suffix('}') else {
        return Err(format!("unterminated placeholder '{raw}'"));
    };
    let (name, optional) = match inner.strip_suffix('?') {
        Some(name) => (name, true),
        None => (inner, false),
    };
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid placeholder name '{raw}'"));
    }
    Ok(Part::Placeholder(Placeholder {
        name: name.to_owned(),
        optional,
    }))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    const PODS: &str = "api/v1/namespaces/{Namespace}/pods?labelSelector={LabelSelector?}&watch={Watch?}";

    fn base() -> Url {
        Url::parse("https://kube.example.com:6443/").unwrap()
    }

    #[test]
    fn optional_placeholders_are_omitted_when_absent() {
        let template = RequestTemplate::parse(PODS).unwrap();
        let url = template
            .expand(&base(), &TemplateParams::new().set(params::NAMESPACE, "default"))
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://kube.example.com:6443/api/v1/namespaces/default/pods"
        );
        assert_eq!(url.query(), None);
    }

    #[test]
    fn empty_value_differs_from_absent() {
        let template = RequestTemplate::parse(PODS).unwrap();
        let url = template
            .expand(
                &base(),
                &TemplateParams::new()
                    .set(params::NAMESPACE, "default")
                    .set(params::LABEL_SELECTOR, ""),
            )
            .unwrap();
        assert_eq!(url.query(), Some("labelSelector="));
    }

    #[test]
    fn query_values_are_encoded() {
        let template = RequestTemplate::parse(PODS).unwrap();
        let url = template
            .expand(
                &base(),
                &TemplateParams::new()
                    .set(params::NAMESPACE, "kube-system")
                    .set_opt(params::LABEL_SELECTOR, Some("app=foo,tier in (web)"))
                    .set(params::WATCH, "true"),
            )
            .unwrap();
        assert_eq!(
            url.query(),
            Some("labelSelector=app%3Dfoo%2Ctier+in+%28web%29&watch=true")
        );
    }

    #[test]
    fn path_values_cannot_escape_their_segment() {
        let template = RequestTemplate::parse("api/v1/namespaces/{Namespace}/pods/{Name}").unwrap();
        let url = template
            .expand(
                &base(),
                &TemplateParams::new()
                    .set(params::NAMESPACE, "default")
                    .set(params::NAME, "../secrets/x"),
            )
            .unwrap();
        assert_eq!(url.path(), "/api/v1/namespaces/default/pods/..%2Fsecrets%2Fx");
    }

    #[test]
    fn missing_mandatory_parameter_fails() {
        let template = RequestTemplate::parse(PODS).unwrap();
        let err = template.expand(&base(), &TemplateParams::new()).unwrap_err();
        assert_eq!(
            err,
            TemplateError::MissingParameter {
                template: PODS.to_owned(),
                name: "Namespace".to_owned(),
            }
        );
    }

    #[test]
    fn base_path_prefix_and_query_are_handled() {
        let template = RequestTemplate::parse("/api/v1/namespaces").unwrap();
        let base = Url::parse("https://proxy.example.com/k8s/?token=x#frag").unwrap();
        let url = template.expand(&base, &TemplateParams::new()).unwrap();
        assert_eq!(url.as_str(), "https://proxy.example.com/k8s/api/v1/namespaces");
    }

    #[test]
    fn optional_path_segment_is_dropped() {
        let template =
            RequestTemplate::parse("api/v1/namespaces/{Namespace}/pods/{Name?}?watch={Watch?}")
                .unwrap();
        let values = TemplateParams::new().set(params::NAMESPACE, "default");
        let url = template.expand(&base(), &values).unwrap();
        assert_eq!(url.path(), "/api/v1/namespaces/default/pods");

        let url = template
            .expand(&base(), &values.set(params::NAME, "web-0"))
            .unwrap();
        assert_eq!(url.path(), "/api/v1/namespaces/default/pods/web-0");
    }

    #[test]
    fn literal_query_values_are_kept() {
        let template = RequestTemplate::parse("api/v1/pods?watch=true").unwrap();
        let url = template.expand(&base(), &TemplateParams::new()).unwrap();
        assert_eq!(url.query(), Some("watch=true"));
    }

    #[test]
    fn malformed_templates_are_rejected() {
        for bad in [
            "api//v1",
            "api/v1/{Name",
            "api/v1/pod-{Name}",
            "api/v1/{}",
            "api/v1/{Na me}",
            "api/v1?watch",
            "api/v1?={Watch?}",
        ] {
            let err = RequestTemplate::parse(bad).unwrap_err();
            assert!(
                matches!(err, TemplateError::Malformed { .. }),
                "{bad} should be malformed, got {err:?}"
            );
        }
    }

    #[test]
    fn placeholders_are_listed_in_order() {
        let template = RequestTemplate::parse(PODS).unwrap();
        let names: Vec<_> = template.placeholders().collect();
        assert_eq!(
            names,
            vec![("Namespace", false), ("LabelSelector", true), ("Watch", true)]
        );
        assert_eq!(template.to_string(), PODS);
    }
}
