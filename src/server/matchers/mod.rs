pub mod body;

use crate::common::data::{HttpRequest, KeyValueTemplate, NottableString, RequestTemplate};

/// Decides whether a request satisfies a request template. All present fields must
/// match (absent fields are wildcards); the whole result is inverted when the
/// template itself is negated.
pub fn request_matches(template: &RequestTemplate, req: &HttpRequest) -> bool {
    positive_match(template, req) != template.not
}

fn positive_match(template: &RequestTemplate, req: &HttpRequest) -> bool {
    if let Some(method) = &template.method {
        if !method.matches(req.method_str()) {
            tracing::trace!(method = req.method_str(), "method mismatch");
            return false;
        }
    }

    if let Some(path) = &template.path {
        if !path.matches(&req.path()) {
            tracing::trace!(path = %req.path(), "path mismatch");
            return false;
        }
    }

    if !entries_match(&template.headers, req.headers_vec(), true) {
        tracing::trace!("header mismatch");
        return false;
    }

    if !entries_match(&template.cookies, &request_cookies(req), false) {
        tracing::trace!("cookie mismatch");
        return false;
    }

    if !entries_match(&template.query_params, &req.query_params_vec(), false) {
        tracing::trace!("query parameter mismatch");
        return false;
    }

    if let Some(matcher) = &template.body {
        if !body::body_matches(matcher, req) {
            tracing::trace!("body mismatch");
            return false;
        }
    }

    true
}

#[cfg(feature = "cookies")]
fn request_cookies(req: &HttpRequest) -> Vec<(String, String)> {
    req.cookies()
}

#[cfg(not(feature = "cookies"))]
fn request_cookies(_req: &HttpRequest) -> Vec<(String, String)> {
    Vec::new()
}

fn entries_match(
    entries: &Option<Vec<KeyValueTemplate>>,
    actuals: &[(String, String)],
    ignore_name_case: bool,
) -> bool {
    let entries = match entries {
        None => return true,
        Some(entries) => entries,
    };

    entries
        .iter()
        .all(|entry| entry_matches(entry, actuals, ignore_name_case))
}

/// Matches one named entry against the request's actual entries. A negated name
/// asserts absence of any entry with that name. An empty value list asserts
/// presence of the name only.
fn entry_matches(
    entry: &KeyValueTemplate,
    actuals: &[(String, String)],
    ignore_name_case: bool,
) -> bool {
    let present: Vec<&str> = actuals
        .iter()
        .filter(|(name, _)| name_matches(&entry.name, name, ignore_name_case))
        .map(|(_, value)| value.as_str())
        .collect();

    if entry.name.not {
        return present.is_empty();
    }

    if present.is_empty() {
        return false;
    }

    entry.values.iter().all(|matcher| {
        let satisfied = present.iter().any(|actual| matcher.matches_value(actual));
        satisfied != matcher.not
    })
}

fn name_matches(name: &NottableString, actual: &str, ignore_case: bool) -> bool {
    if ignore_case && name.value.eq_ignore_ascii_case(actual) {
        return true;
    }

    name.matches_value(actual)
        || (ignore_case && name.matches_value(&actual.to_ascii_lowercase()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::util::BodyBytes;

    fn request(method: &str, uri: &str, headers: Vec<(&str, &str)>, body: &str) -> HttpRequest {
        HttpRequest::new(
            "http".to_string(),
            uri.to_string(),
            method.to_string(),
            headers
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            BodyBytes::from(body),
        )
    }

    #[test]
    fn empty_template_matches_everything_test() {
        let template = RequestTemplate::default();
        let req = request("POST", "/anything?x=1", vec![("a", "b")], "body");

        assert_eq!(request_matches(&template, &req), true);
    }

    #[test]
    fn method_and_path_test() {
        let template = RequestTemplate {
            method: Some("GET".into()),
            path: Some("/users/[0-9]+".into()),
            ..Default::default()
        };

        assert_eq!(
            request_matches(&template, &request("GET", "/users/15", vec![], "")),
            true
        );
        assert_eq!(
            request_matches(&template, &request("POST", "/users/15", vec![], "")),
            false
        );
        assert_eq!(
            request_matches(&template, &request("GET", "/users/abc", vec![], "")),
            false
        );
    }

    #[test]
    fn path_ignores_query_string_test() {
        let template = RequestTemplate {
            path: Some("/search".into()),
            ..Default::default()
        };

        let req = request("GET", "/search?q=rust", vec![], "");
        assert_eq!(request_matches(&template, &req), true);
    }

    #[test]
    fn header_names_are_case_insensitive_test() {
        let template = RequestTemplate {
            headers: Some(vec![KeyValueTemplate::new(
                "content-type",
                vec!["application/json".into()],
            )]),
            ..Default::default()
        };

        let req = request("POST", "/", vec![("Content-Type", "application/json")], "");
        assert_eq!(request_matches(&template, &req), true);
    }

    #[test]
    fn negated_header_name_requires_absence_test() {
        let template = RequestTemplate {
            headers: Some(vec![KeyValueTemplate::new(
                NottableString::not("authorization"),
                vec![],
            )]),
            ..Default::default()
        };

        assert_eq!(
            request_matches(&template, &request("GET", "/", vec![], "")),
            true
        );
        assert_eq!(
            request_matches(
                &template,
                &request("GET", "/", vec![("Authorization", "Bearer x")], "")
            ),
            false
        );
    }

    #[test]
    fn presence_only_entry_test() {
        let template = RequestTemplate {
            query_params: Some(vec![KeyValueTemplate::new("token", vec![])]),
            ..Default::default()
        };

        assert_eq!(
            request_matches(&template, &request("GET", "/?token=abc", vec![], "")),
            true
        );
        assert_eq!(
            request_matches(&template, &request("GET", "/?other=abc", vec![], "")),
            false
        );
    }

    #[test]
    fn negated_value_matcher_test() {
        let template = RequestTemplate {
            query_params: Some(vec![KeyValueTemplate::new(
                "mode",
                vec![NottableString::not("debug")],
            )]),
            ..Default::default()
        };

        assert_eq!(
            request_matches(&template, &request("GET", "/?mode=release", vec![], "")),
            true
        );
        assert_eq!(
            request_matches(&template, &request("GET", "/?mode=debug", vec![], "")),
            false
        );
    }

    #[test]
    fn whole_template_negation_test() {
        let template = RequestTemplate {
            path: Some("/admin".into()),
            not: true,
            ..Default::default()
        };

        assert_eq!(
            request_matches(&template, &request("GET", "/admin", vec![], "")),
            false
        );
        assert_eq!(
            request_matches(&template, &request("GET", "/public", vec![], "")),
            true
        );
    }
}
