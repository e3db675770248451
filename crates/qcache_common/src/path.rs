//! Path template interpolation: `/a/[id]/b/[...rest]`.

use std::collections::BTreeMap;

/// A single path parameter value: either one segment or a consumed list of
/// segments (`[...rest]`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathParam {
    Segment(String),
    Rest(Vec<String>),
}

/// Error returned when a template references a parameter that was not
/// supplied, or a `[...rest]` marker is used with a non-list value.
#[derive(Debug, thiserror::Error)]
pub enum PathInterpolationError {
    #[error("path template references undeclared parameter `{0}`")]
    MissingParam(String),
    #[error("path segment `[...{0}]` requires a list of segments, got a single value")]
    ExpectedRest(String),
}

/// Substitutes bracketed names in `template` from `params`.
///
/// `[name]` consumes a single segment; `[...name]` consumes a
/// `PathParam::Rest` and splices its segments in place, joined by `/`.
/// Returns the interpolated path plus the set of parameter names that were
/// *not* consumed (these become search params, in the order `params` was
/// declared by the caller).
pub fn interpolate_path(
    template: &str,
    params: &BTreeMap<String, PathParam>,
) -> Result<(String, Vec<String>), PathInterpolationError> {
    let mut consumed = Vec::new();
    let mut out_segments = Vec::new();

    for raw_segment in template.split('/') {
        if raw_segment.is_empty() {
            out_segments.push(String::new());
            continue;
        }
        if let Some(inner) = raw_segment
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
        {
            if let Some(rest_name) = inner.strip_prefix("...") {
                match params.get(rest_name) {
                    Some(PathParam::Rest(segments)) => {
                        consumed.push(rest_name.to_string());
                        out_segments.push(segments.join("/"));
                    }
                    Some(PathParam::Segment(_)) => {
                        return Err(PathInterpolationError::ExpectedRest(rest_name.to_string()));
                    }
                    None => {
                        return Err(PathInterpolationError::MissingParam(rest_name.to_string()));
                    }
                }
            } else {
                match params.get(inner) {
                    Some(PathParam::Segment(value)) => {
                        consumed.push(inner.to_string());
                        out_segments.push(value.clone());
                    }
                    Some(PathParam::Rest(segments)) => {
                        consumed.push(inner.to_string());
                        out_segments.push(segments.join("/"));
                    }
                    None => {
                        return Err(PathInterpolationError::MissingParam(inner.to_string()));
                    }
                }
            }
        } else {
            out_segments.push(raw_segment.to_string());
        }
    }

    let unused = params
        .keys()
        .filter(|k| !consumed.contains(k))
        .cloned()
        .collect();

    Ok((out_segments.join("/"), unused))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(s: &str) -> PathParam {
        PathParam::Segment(s.to_string())
    }

    #[test]
    fn substitutes_single_segment() {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), seg("42"));
        let (path, unused) = interpolate_path("/a/[id]/b", &params).unwrap();
        assert_eq!(path, "/a/42/b");
        assert!(unused.is_empty());
    }

    #[test]
    fn consumes_rest_param() {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), seg("42"));
        params.insert(
            "rest".to_string(),
            PathParam::Rest(vec!["x".into(), "y".into()]),
        );
        let (path, unused) = interpolate_path("/a/[id]/b/[...rest]", &params).unwrap();
        assert_eq!(path, "/a/42/b/x/y");
        assert!(unused.is_empty());
    }

    #[test]
    fn unused_params_become_search_params() {
        let mut params = BTreeMap::new();
        params.insert("id".to_string(), seg("42"));
        params.insert("filter".to_string(), seg("active"));
        let (path, unused) = interpolate_path("/a/[id]", &params).unwrap();
        assert_eq!(path, "/a/42");
        assert_eq!(unused, vec!["filter".to_string()]);
    }

    #[test]
    fn missing_param_errors() {
        let params = BTreeMap::new();
        let err = interpolate_path("/a/[id]", &params).unwrap_err();
        assert!(matches!(err, PathInterpolationError::MissingParam(_)));
    }
}
